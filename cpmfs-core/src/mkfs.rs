//! Creating an empty filesystem.

use chrono::Utc;

use crate::device::Device;
use crate::dirent::RawEntry;
use crate::error::{CpmError, CpmResult};
use crate::format::{FormatConfig, FsFlags};
use crate::layout::{ENTRY_SIZE, FREE_MARKER, LABEL_STATUS, STAMP_STATUS};
use crate::name::is_file_char;
use crate::skew::SectorMap;
use crate::stamp;
use crate::superblock::LabelFlags;

#[derive(Debug, Clone, Default)]
pub struct MkfsOptions {
    /// Disc label (CP/M 3 formats only).
    pub label: Option<String>,
    /// Reserve timestamp entries (formats with directory stamps only).
    pub timestamps: bool,
    /// Boot track contents, padded with 0xE5.
    pub boot: Vec<u8>,
}

/// Write boot tracks and an empty directory to `device`.
///
/// The data area is left untouched.
pub fn make_filesystem<D: Device + ?Sized>(
    device: &mut D,
    format: &FormatConfig,
    options: &MkfsOptions,
) -> CpmResult<()> {
    format.validate()?;
    device.set_geometry(format.geometry())?;
    let flags = format.flags;

    let seclen = format.sector_length;
    let boot_bytes = format.boot_tracks as usize * format.sectors_per_track as usize * seclen;
    if options.boot.len() > boot_bytes {
        return Err(CpmError::BadGeometry(format!(
            "boot image of {} bytes exceeds {} bytes of boot tracks",
            options.boot.len(),
            boot_bytes
        )));
    }
    let mut sector = vec![0u8; seclen];
    for track in 0..format.boot_tracks {
        for s in 0..format.sectors_per_track {
            let at = (track * format.sectors_per_track + s) as usize * seclen;
            sector.fill(FREE_MARKER);
            if at < options.boot.len() {
                let end = (at + seclen).min(options.boot.len());
                sector[..end - at].copy_from_slice(&options.boot[at..end]);
            }
            device.write_sector(track, s, &sector)?;
        }
    }

    let dir_blocks = format.directory_blocks();
    let slots = dir_blocks * format.block_size / ENTRY_SIZE;
    let mut entries = vec![RawEntry::free(); slots];

    let stamps = options.timestamps && flags.contains(FsFlags::CPM3_DATES);
    if options.timestamps && !stamps {
        log::warn!("{}: format has no directory timestamps", format.name);
    }
    if stamps {
        for slot in (3..format.max_dir).step_by(4) {
            let mut entry = RawEntry::from_bytes(&[0u8; ENTRY_SIZE]);
            entry.set_status(STAMP_STATUS);
            entries[slot] = entry;
        }
    }

    if flags.contains(FsFlags::CPM3_OTHER) && (options.label.is_some() || stamps) {
        entries[0] = label_entry(options.label.as_deref().unwrap_or(""), stamps)?;
    } else if options.label.is_some() {
        log::warn!("{}: format has no disc label", format.name);
    }

    let map = SectorMap::new(format);
    let per_block = format.block_size / ENTRY_SIZE;
    for (index, chunk) in entries.chunks(per_block).enumerate() {
        let buf: Vec<u8> = chunk.iter().flat_map(|e| *e.as_bytes()).collect();
        map.write_block(device, index as u16, &buf)?;
    }
    device.flush()?;

    log::info!(
        "created {} filesystem: {} blocks, {} directory entries",
        format.name,
        format.total_blocks(),
        format.max_dir
    );
    Ok(())
}

fn label_entry(label: &str, stamps: bool) -> CpmResult<RawEntry> {
    if label.len() > 11 || !label.bytes().all(|c| is_file_char(c, false)) {
        return Err(CpmError::InvalidName(label.to_string()));
    }
    let mut entry = RawEntry::from_bytes(&[0u8; ENTRY_SIZE]);
    let b = entry.as_bytes_mut();
    b[0] = LABEL_STATUS;
    b[1..12].fill(b' ');
    for (dst, src) in b[1..12].iter_mut().zip(label.bytes()) {
        *dst = src.to_ascii_uppercase();
    }
    let mut flags = LabelFlags::PRESENT;
    if stamps {
        flags |= LabelFlags::CREATE | LabelFlags::UPDATE;
    }
    b[12] = flags.bits();
    let now = Some(Utc::now());
    stamp::encode_stamp(now, &mut b[24..28]);
    stamp::encode_stamp(now, &mut b[28..32]);
    Ok(entry)
}
