//! Raw 32-byte directory entry.
//!
//! Layout:
//! - Byte 0: Status (user number, 0xE5 = free, 0x20 label, 0x21 stamps)
//! - Bytes 1-8: Filename (space-padded, high bits F1-F8)
//! - Bytes 9-11: Extension (space-padded, high bits RO, SYS, ARCV)
//! - Byte 12: Extent number, low 5 bits (XL)
//! - Byte 13: Last record byte count (BC)
//! - Byte 14: Extent number, high 6 bits (XH)
//! - Byte 15: Record count of the last extent (RC)
//! - Bytes 16-31: Block pointers, 16 x 8-bit or 8 x 16-bit little-endian

use bitflags::bitflags;

use crate::layout::{extent_bytes, extent_number, ENTRY_SIZE, FREE_MARKER};
use crate::name::CpmName;

bitflags! {
    /// File attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Attributes: u32 {
        const F1 = 0o1;
        const F2 = 0o2;
        const F3 = 0o4;
        const F4 = 0o10;
        const READ_ONLY = 0o400;
        const SYSTEM = 0o1000;
        const ARCHIVE = 0o2000;
        const PW_DELETE = 0o4000;
        const PW_WRITE = 0o10000;
        const PW_READ = 0o20000;

        /// Bits stored in the name and extension high bits
        const STORED = Self::F1.bits() | Self::F2.bits() | Self::F3.bits() | Self::F4.bits()
            | Self::READ_ONLY.bits() | Self::SYSTEM.bits() | Self::ARCHIVE.bits();
        /// Bits derived from the password protection mode
        const PASSWORD = Self::PW_DELETE.bits() | Self::PW_WRITE.bits() | Self::PW_READ.bits();
    }
}

impl Attributes {
    /// Decode a password protection mode byte.
    pub fn from_protect_mode(mode: u8) -> Self {
        let mut attr = Self::empty();
        if mode & 0x80 != 0 {
            attr |= Self::PW_READ;
        }
        if mode & 0x40 != 0 {
            attr |= Self::PW_WRITE;
        }
        if mode & 0x20 != 0 {
            attr |= Self::PW_DELETE;
        }
        attr
    }
}

/// One directory slot.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RawEntry {
    bytes: [u8; ENTRY_SIZE],
}

impl std::fmt::Debug for RawEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawEntry")
            .field("status", &self.status())
            .field("name", &String::from_utf8_lossy(&self.name()))
            .field("ext", &String::from_utf8_lossy(&self.ext()))
            .field("extent", &self.extent())
            .field("rc", &self.rc())
            .finish()
    }
}

impl Default for RawEntry {
    fn default() -> Self {
        Self::free()
    }
}

impl RawEntry {
    /// An unused slot: status 0xE5, the rest filled with 0xE5.
    pub fn free() -> Self {
        Self {
            bytes: [FREE_MARKER; ENTRY_SIZE],
        }
    }

    /// A fresh file entry with no blocks.
    pub fn for_file(name: &CpmName) -> Self {
        let mut bytes = [0u8; ENTRY_SIZE];
        bytes[0] = name.user;
        bytes[1..9].copy_from_slice(&name.name);
        bytes[9..12].copy_from_slice(&name.ext);
        Self { bytes }
    }

    /// Wrap raw bytes (must be at least 32 bytes).
    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut bytes = [0u8; ENTRY_SIZE];
        bytes.copy_from_slice(&raw[..ENTRY_SIZE]);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; ENTRY_SIZE] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; ENTRY_SIZE] {
        &mut self.bytes
    }

    pub fn status(&self) -> u8 {
        self.bytes[0]
    }

    pub fn set_status(&mut self, status: u8) {
        self.bytes[0] = status;
    }

    pub fn is_free(&self) -> bool {
        self.bytes[0] == FREE_MARKER
    }

    /// Mark the slot unused. Only the status byte changes.
    pub fn release(&mut self) {
        self.bytes[0] = FREE_MARKER;
    }

    /// Filename without attribute bits.
    pub fn name(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        for (dst, src) in out.iter_mut().zip(&self.bytes[1..9]) {
            *dst = src & 0x7F;
        }
        out
    }

    /// Extension without attribute bits.
    pub fn ext(&self) -> [u8; 3] {
        let mut out = [0u8; 3];
        for (dst, src) in out.iter_mut().zip(&self.bytes[9..12]) {
            *dst = src & 0x7F;
        }
        out
    }

    /// Raw name and extension bytes, attribute bits included.
    pub fn raw_name(&self) -> &[u8] {
        &self.bytes[1..12]
    }

    /// Replace name and extension, keeping the attribute high bits.
    pub fn set_name(&mut self, name: &[u8; 8], ext: &[u8; 3]) {
        for (dst, src) in self.bytes[1..9].iter_mut().zip(name) {
            *dst = (*dst & 0x80) | (src & 0x7F);
        }
        for (dst, src) in self.bytes[9..12].iter_mut().zip(ext) {
            *dst = (*dst & 0x80) | (src & 0x7F);
        }
    }

    /// Whether this entry belongs to `name` (user, name and extension).
    pub fn belongs_to(&self, name: &CpmName) -> bool {
        name.matches(self.status(), &self.bytes[1..9], &self.bytes[9..12])
    }

    /// Identity of the file this entry belongs to.
    pub fn cpm_name(&self) -> CpmName {
        CpmName::from_raw(self.status(), &self.bytes[1..9], &self.bytes[9..12])
    }

    /// Attribute bits kept in the name and extension high bits.
    pub fn attributes(&self) -> Attributes {
        let mut attr = Attributes::empty();
        let bit = |i: usize| self.bytes[i] & 0x80 != 0;
        let flags = [
            (1, Attributes::F1),
            (2, Attributes::F2),
            (3, Attributes::F3),
            (4, Attributes::F4),
            (9, Attributes::READ_ONLY),
            (10, Attributes::SYSTEM),
            (11, Attributes::ARCHIVE),
        ];
        for (index, flag) in flags {
            if bit(index) {
                attr |= flag;
            }
        }
        attr
    }

    /// Store attribute bits in the name and extension high bits.
    pub fn set_attributes(&mut self, attr: Attributes) {
        let flags = [
            (1, Attributes::F1),
            (2, Attributes::F2),
            (3, Attributes::F3),
            (4, Attributes::F4),
            (9, Attributes::READ_ONLY),
            (10, Attributes::SYSTEM),
            (11, Attributes::ARCHIVE),
        ];
        for (index, flag) in flags {
            if attr.contains(flag) {
                self.bytes[index] |= 0x80;
            } else {
                self.bytes[index] &= 0x7F;
            }
        }
    }

    /// Logical extent number.
    pub fn extent(&self) -> u16 {
        extent_number(self.bytes[12], self.bytes[14])
    }

    pub fn set_extent(&mut self, extent: u16) {
        let (low, high) = extent_bytes(extent);
        self.bytes[12] = low;
        self.bytes[14] = high;
    }

    /// Last record byte count (BC).
    pub fn lrc(&self) -> u8 {
        self.bytes[13]
    }

    pub fn set_lrc(&mut self, value: u8) {
        self.bytes[13] = value;
    }

    /// Record count (RC).
    pub fn rc(&self) -> u8 {
        self.bytes[15]
    }

    pub fn set_rc(&mut self, value: u8) {
        self.bytes[15] = value;
    }

    /// Block pointer `index`; 16-bit pointers when `wide`.
    pub fn pointer(&self, index: usize, wide: bool) -> u16 {
        if wide {
            let at = 16 + index * 2;
            u16::from_le_bytes([self.bytes[at], self.bytes[at + 1]])
        } else {
            self.bytes[16 + index] as u16
        }
    }

    pub fn set_pointer(&mut self, index: usize, wide: bool, block: u16) {
        if wide {
            let at = 16 + index * 2;
            self.bytes[at..at + 2].copy_from_slice(&block.to_le_bytes());
        } else {
            self.bytes[16 + index] = block as u8;
        }
    }

    /// All block pointers in entry order, zeroes included.
    pub fn pointers(&self, wide: bool) -> impl Iterator<Item = u16> + '_ {
        let count = if wide { 8 } else { 16 };
        (0..count).map(move |i| self.pointer(i, wide))
    }

    /// Clear every block pointer.
    pub fn clear_pointers(&mut self) {
        self.bytes[16..32].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> RawEntry {
        RawEntry::for_file(&CpmName::parse("1:hello.txt", 0, 15).unwrap())
    }

    #[test]
    fn test_layout() {
        let e = entry();
        let b = e.as_bytes();
        assert_eq!(b[0], 1);
        assert_eq!(&b[1..9], b"HELLO   ");
        assert_eq!(&b[9..12], b"TXT");
        assert!(b[12..].iter().all(|&x| x == 0));
    }

    #[test]
    fn test_attributes_round_trip() {
        let mut e = entry();
        let attr = Attributes::F1 | Attributes::F4 | Attributes::READ_ONLY | Attributes::ARCHIVE;
        e.set_attributes(attr);
        assert_eq!(e.attributes(), attr);
        assert_eq!(&e.name(), b"HELLO   ");
        assert_eq!(&e.ext(), b"TXT");
        assert_eq!(e.as_bytes()[9], b'T' | 0x80);

        e.set_attributes(Attributes::SYSTEM);
        assert_eq!(e.attributes(), Attributes::SYSTEM);
    }

    #[test]
    fn test_set_name_keeps_high_bits() {
        let mut e = entry();
        e.set_attributes(Attributes::READ_ONLY | Attributes::F2);
        e.set_name(b"WORLD   ", b"COM");
        assert_eq!(&e.name(), b"WORLD   ");
        assert_eq!(&e.ext(), b"COM");
        assert_eq!(e.attributes(), Attributes::READ_ONLY | Attributes::F2);
    }

    #[test]
    fn test_extent_fields() {
        let mut e = entry();
        e.set_extent(70);
        assert_eq!(e.as_bytes()[12], 70 & 0x1F);
        assert_eq!(e.as_bytes()[14], 2);
        assert_eq!(e.extent(), 70);
    }

    #[test]
    fn test_pointers() {
        let mut e = entry();
        e.set_pointer(0, false, 5);
        e.set_pointer(15, false, 200);
        assert_eq!(e.pointer(15, false), 200);
        assert_eq!(e.pointers(false).filter(|&p| p != 0).count(), 2);

        e.clear_pointers();
        e.set_pointer(7, true, 0x1234);
        assert_eq!(&e.as_bytes()[30..32], &[0x34, 0x12]);
        assert_eq!(e.pointer(7, true), 0x1234);
        assert_eq!(e.pointers(true).count(), 8);
    }

    #[test]
    fn test_protect_mode() {
        assert_eq!(Attributes::from_protect_mode(0x80), Attributes::PW_READ);
        assert_eq!(
            Attributes::from_protect_mode(0x60),
            Attributes::PW_WRITE | Attributes::PW_DELETE
        );
        assert_eq!(Attributes::from_protect_mode(0x01), Attributes::empty());
    }

    #[test]
    fn test_belongs_to() {
        let mut e = entry();
        e.set_attributes(Attributes::READ_ONLY);
        assert!(e.belongs_to(&CpmName::parse("1:HELLO.TXT", 0, 15).unwrap()));
        assert!(!e.belongs_to(&CpmName::parse("0:HELLO.TXT", 0, 15).unwrap()));
        e.release();
        assert!(e.is_free());
    }
}
