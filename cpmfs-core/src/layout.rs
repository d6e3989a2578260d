//! On-disk layout constants of the CP/M directory.

use crate::format::FsFlags;

/// Size of a directory entry in bytes.
pub const ENTRY_SIZE: usize = 32;

/// Record size in CP/M (always 128 bytes).
pub const RECORD_SIZE: usize = 128;

/// Bytes covered by one logical extent.
pub const EXTENT_SIZE: usize = 16384;

/// Status byte of an unused directory entry.
pub const FREE_MARKER: u8 = 0xE5;

/// Status byte of the CP/M 3 disc label.
pub const LABEL_STATUS: u8 = 0x20;

/// Status byte of a CP/M 3 / P2DOS timestamp entry.
pub const STAMP_STATUS: u8 = 0x21;

/// Number of block pointer bytes in an entry.
pub const POINTER_BYTES: usize = 16;

/// Highest extent number representable in the low/high extent bytes.
pub const MAX_EXTENT: u16 = 0x7FF;

/// Combine the low and high extent bytes into a logical extent number.
pub fn extent_number(low: u8, high: u8) -> u16 {
    (low as u16 & 0x1F) | ((high as u16 & 0x3F) << 5)
}

/// Split a logical extent number into its (low, high) bytes.
pub fn extent_bytes(extent: u16) -> (u8, u8) {
    ((extent & 0x1F) as u8, ((extent >> 5) & 0x3F) as u8)
}

/// Classification of a directory entry's status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// 0xE5: unused slot
    Free,
    /// Regular file entry for a user number
    File(u8),
    /// Extended FCB (password / MP/M timestamps) for a user number
    Xfcb(u8),
    /// 0x20: disc label
    Label,
    /// 0x21: timestamp entry
    Stamps,
    /// Anything else
    Reserved(u8),
}

impl EntryStatus {
    /// Decode a status byte according to the format's feature flags.
    pub fn classify(status: u8, flags: FsFlags) -> Self {
        let max_user = max_user(flags);
        match status {
            FREE_MARKER => Self::Free,
            LABEL_STATUS => Self::Label,
            STAMP_STATUS => Self::Stamps,
            u if u <= max_user => Self::File(u),
            u @ 16..=31 if flags.contains(FsFlags::HAS_XFCBS) => Self::Xfcb(u - 16),
            other => Self::Reserved(other),
        }
    }

    /// Whether the slot holds (part of) a regular file.
    pub fn is_file(self) -> bool {
        matches!(self, Self::File(_))
    }
}

/// Highest user number a regular file can carry under these flags.
///
/// Formats with XFCBs use status bytes 16-31 for them, so files stop at 15.
pub fn max_user(flags: FsFlags) -> u8 {
    if flags.contains(FsFlags::HAS_XFCBS) {
        15
    } else if flags.contains(FsFlags::HI_USER) {
        31
    } else {
        15
    }
}
