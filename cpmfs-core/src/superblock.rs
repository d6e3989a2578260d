//! Mounted volume state.
//!
//! A [`Superblock`] owns the device, the in-memory directory table and the
//! allocation vector. Directory changes only touch memory and mark the
//! affected directory blocks dirty; [`Superblock::sync`] writes them back.

use std::collections::BTreeSet;

use bitflags::bitflags;
use chrono::{DateTime, Utc};

use crate::allocation::AllocationVector;
use crate::device::Device;
use crate::dirent::RawEntry;
use crate::error::{CpmError, CpmResult};
use crate::format::{FormatConfig, FsFlags};
use crate::layout::{max_user, EntryStatus, ENTRY_SIZE, EXTENT_SIZE, FREE_MARKER, RECORD_SIZE};
use crate::name::CpmName;
use crate::skew::SectorMap;
use crate::stamp::{self, DsStore, StampScheme, DS_FILE_NAME};

bitflags! {
    /// Flag byte of the disc label.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LabelFlags: u8 {
        const PRESENT = 0x01;
        const CREATE = 0x10;
        const UPDATE = 0x20;
        const ACCESS = 0x40;
        const PASSWORD = 0x80;
    }
}

/// CP/M 3 disc label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: [u8; 11],
    pub flags: LabelFlags,
    pub ctime: Option<DateTime<Utc>>,
    pub mtime: Option<DateTime<Utc>>,
}

impl Label {
    fn from_entry(entry: &RawEntry) -> Self {
        let b = entry.as_bytes();
        let mut name = [b' '; 11];
        for (dst, src) in name.iter_mut().zip(&b[1..12]) {
            *dst = src & 0x7F;
        }
        Self {
            name,
            flags: LabelFlags::from_bits_truncate(b[12]),
            ctime: stamp::decode_stamp(&b[24..28]),
            mtime: stamp::decode_stamp(&b[28..32]),
        }
    }

    /// Contents of the `[label]` pseudo file.
    pub fn text(&self) -> String {
        let mut text: String = self.name.iter().map(|&c| c as char).collect();
        text.push('\n');
        text
    }
}

/// Filesystem statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub block_size: usize,
    pub total_blocks: usize,
    pub free_blocks: usize,
    /// Includes the directory area.
    pub used_blocks: usize,
    pub directory_blocks: usize,
    pub max_dir: usize,
    pub free_entries: usize,
    pub name_len: usize,
}

/// A mounted CP/M volume.
pub struct Superblock<D: Device> {
    pub(crate) device: D,
    pub(crate) format: FormatConfig,
    pub(crate) map: SectorMap,
    pub(crate) size: usize,
    pub(crate) wide: bool,
    pub(crate) extents: usize,
    pub(crate) entries: Vec<RawEntry>,
    pub(crate) alloc: AllocationVector,
    pub(crate) label: Option<Label>,
    pub(crate) passwd: String,
    pub(crate) stamps: StampScheme,
    pub(crate) uppercase: bool,
    pub(crate) current_user: u8,
    dirty_blocks: BTreeSet<usize>,
}

impl<D: Device> std::fmt::Debug for Superblock<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Superblock")
            .field("format", &self.format.name)
            .field("size", &self.size)
            .field("dirty_blocks", &self.dirty_blocks)
            .finish()
    }
}

impl<D: Device> Superblock<D> {
    /// Mount the volume on `device`.
    ///
    /// Reads the whole directory, rebuilds the allocation vector and loads
    /// the label, passwords and timestamp store the format asks for.
    pub fn mount(mut device: D, format: FormatConfig, uppercase: bool) -> CpmResult<Self> {
        format.validate()?;
        device.set_geometry(format.geometry())?;

        let map = SectorMap::new(&format);
        let size = format.total_blocks();
        let wide = format.wide_pointers();
        let dir_blocks = format.directory_blocks();

        let mut raw = vec![0u8; dir_blocks * format.block_size];
        for (index, chunk) in raw.chunks_mut(format.block_size).enumerate() {
            map.read_block(&mut device, index as u16, chunk)?;
        }
        let entries: Vec<RawEntry> = raw
            .chunks(ENTRY_SIZE)
            .take(format.max_dir)
            .map(RawEntry::from_bytes)
            .collect();

        let flags = format.flags;
        let alloc = AllocationVector::rebuild(
            size,
            dir_blocks,
            wide,
            entries
                .iter()
                .filter(|e| EntryStatus::classify(e.status(), flags).is_file()),
        );

        log::debug!(
            "mount {}: {} blocks of {} bytes, {} directory entries, {}-bit pointers",
            format.name,
            size,
            format.block_size,
            format.max_dir,
            if wide { 16 } else { 8 }
        );

        let mut sb = Self {
            extents: format.extents_per_entry(),
            device,
            format,
            map,
            size,
            wide,
            entries,
            alloc,
            label: None,
            passwd: String::new(),
            stamps: StampScheme::None,
            uppercase,
            current_user: 0,
            dirty_blocks: BTreeSet::new(),
        };

        if flags.contains(FsFlags::CPM3_OTHER) {
            sb.load_label();
            sb.load_passwords();
        }
        sb.load_stamps()?;
        Ok(sb)
    }

    fn load_label(&mut self) {
        self.label = self
            .entries
            .iter()
            .find(|e| e.status() == crate::layout::LABEL_STATUS)
            .map(Label::from_entry);
        if let Some(label) = &self.label {
            log::debug!("label {:?} flags {:?}", String::from_utf8_lossy(&label.name), label.flags);
        }
    }

    fn load_passwords(&mut self) {
        let flags = self.format.flags;
        let mut text = String::new();
        for entry in &self.entries {
            if let EntryStatus::Xfcb(user) = EntryStatus::classify(entry.status(), flags) {
                let b = entry.as_bytes();
                let name = CpmName::from_raw(user, &b[1..9], &b[9..12]);
                text.push_str(&format!("{:02}{} ", user, name.render(self.uppercase)));
                text.push_str(&stamp::unseal_password(&b[16..24], b[13]));
                text.push('\n');
            }
        }
        self.passwd = text;
    }

    fn load_stamps(&mut self) -> CpmResult<()> {
        let flags = self.format.flags;
        let create_not_access = if flags.contains(FsFlags::CPM3_OTHER) {
            self.label
                .as_ref()
                .map(|l| l.flags.contains(LabelFlags::CREATE))
                .unwrap_or(false)
        } else {
            true
        };
        self.stamps = if flags.contains(FsFlags::CPM3_DATES) {
            StampScheme::Cpm3 { create_not_access }
        } else if flags.contains(FsFlags::MPM_DATES) {
            StampScheme::Mpm { create_not_access }
        } else {
            self.load_datestamper()?
        };
        Ok(())
    }

    /// Blocks of the DataStamper side file, if slot 0 under user 0 holds it.
    fn datestamper_file(&self) -> Option<(Vec<u16>, usize)> {
        let first = self.entries.first()?;
        let mut stored = [0u8; 11];
        stored[..8].copy_from_slice(&first.name());
        stored[8..].copy_from_slice(&first.ext());
        if first.status() != 0 || &stored != DS_FILE_NAME {
            return None;
        }
        let slots = self.extent_slots(&first.cpm_name());
        let size = self.file_size(&slots) as usize;
        let mut blocks = Vec::new();
        for &slot in &slots {
            blocks.extend(self.entries[slot].pointers(self.wide).filter(|&b| b != 0));
        }
        Some((blocks, size))
    }

    fn read_blocks(&mut self, blocks: &[u16]) -> CpmResult<Vec<u8>> {
        let block_size = self.format.block_size;
        let mut image = vec![0u8; blocks.len() * block_size];
        for (block, chunk) in blocks.iter().zip(image.chunks_mut(block_size)) {
            self.read_data_block(*block, chunk)?;
        }
        Ok(image)
    }

    /// Formats without directory stamps pick up a DataStamper side file
    /// when one occupies slot 0 under user 0.
    fn load_datestamper(&mut self) -> CpmResult<StampScheme> {
        let Some((blocks, file_size)) = self.datestamper_file() else {
            log::debug!("no DataStamper file in slot 0");
            return Ok(StampScheme::None);
        };
        let image = self.read_blocks(&blocks)?;
        let data = &image[..file_size.min(image.len())];
        match DsStore::load(data, self.format.max_dir) {
            Ok(store) => {
                log::debug!("DataStamper file with {} blocks", blocks.len());
                Ok(StampScheme::DataStamper(store))
            }
            Err(e) => {
                log::warn!("{}; ignoring timestamps", e);
                Ok(StampScheme::None)
            }
        }
    }

    /// Stop keeping DataStamper stamps once its side file is gone or renamed.
    pub(crate) fn drop_datestamper(&mut self) {
        if matches!(self.stamps, StampScheme::DataStamper(_)) {
            log::warn!("DataStamper file removed; timestamps disabled");
            self.stamps = StampScheme::None;
        }
    }

    /// Write the DataStamper records into the side file's current blocks.
    ///
    /// The block list is taken from the directory at this point, so a file
    /// that was rewritten or truncated since mount is followed.
    fn sync_datestamper(&mut self) -> CpmResult<()> {
        let StampScheme::DataStamper(store) = &self.stamps else {
            return Ok(());
        };
        if !store.is_dirty() {
            return Ok(());
        }
        let bytes = store.to_bytes();
        let Some((blocks, _)) = self.datestamper_file() else {
            self.drop_datestamper();
            return Ok(());
        };
        let mut image = self.read_blocks(&blocks)?;
        let n = bytes.len().min(image.len());
        image[..n].copy_from_slice(&bytes[..n]);
        let block_size = self.format.block_size;
        for (block, chunk) in blocks.iter().zip(image.chunks(block_size)) {
            self.map.write_block(&mut self.device, *block, chunk)?;
        }
        if let StampScheme::DataStamper(store) = &mut self.stamps {
            store.mark_clean();
        }
        Ok(())
    }

    /// Write back dirty directory blocks and the DataStamper file.
    ///
    /// Blocks that could not be written stay dirty; the first error is
    /// returned after every block has been attempted.
    pub fn sync(&mut self) -> CpmResult<()> {
        let mut first_error: Option<CpmError> = None;

        if let Err(e) = self.sync_datestamper() {
            log::warn!("sync: DataStamper file: {}", e);
            first_error = Some(e);
        }

        let pending: Vec<usize> = self.dirty_blocks.iter().copied().collect();
        for index in pending {
            let buf = self.directory_block(index);
            match self.map.write_block(&mut self.device, index as u16, &buf) {
                Ok(()) => {
                    log::trace!("sync: directory block {}", index);
                    self.dirty_blocks.remove(&index);
                }
                Err(e) => {
                    log::warn!("sync: directory block {}: {}", index, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => self.device.flush(),
        }
    }

    /// Sync and hand the device back.
    ///
    /// The superblock is consumed even when the final sync fails, so the
    /// pending changes are lost. Call [`Superblock::sync`] first when a
    /// failed write should be retried.
    pub fn unmount(mut self) -> CpmResult<D> {
        self.sync()?;
        log::debug!("unmount {}", self.format.name);
        Ok(self.device)
    }

    /// Whether there are unwritten directory or timestamp changes.
    pub fn is_dirty(&self) -> bool {
        !self.dirty_blocks.is_empty()
            || matches!(&self.stamps, StampScheme::DataStamper(s) if s.is_dirty())
    }

    /// Filesystem statistics.
    pub fn statfs(&self) -> StatFs {
        let used = self.alloc.count_used();
        StatFs {
            block_size: self.format.block_size,
            total_blocks: self.size,
            free_blocks: self.size - used,
            used_blocks: used,
            directory_blocks: self.format.directory_blocks(),
            max_dir: self.format.max_dir,
            free_entries: self.entries.iter().filter(|e| e.is_free()).count(),
            name_len: 11,
        }
    }

    pub fn format(&self) -> &FormatConfig {
        &self.format
    }

    pub fn sector_map(&self) -> &SectorMap {
        &self.map
    }

    pub fn label(&self) -> Option<&Label> {
        self.label.as_ref()
    }

    pub fn stamp_scheme(&self) -> &StampScheme {
        &self.stamps
    }

    /// The in-memory directory table.
    pub fn directory(&self) -> &[RawEntry] {
        &self.entries
    }

    pub fn allocation(&self) -> &AllocationVector {
        &self.alloc
    }

    /// Raw access to the underlying device.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn current_user(&self) -> u8 {
        self.current_user
    }

    /// User number applied to names without a `user:` prefix.
    pub fn set_current_user(&mut self, user: u8) -> CpmResult<()> {
        if user > max_user(self.format.flags) {
            return Err(CpmError::InvalidName(format!("user {}", user)));
        }
        self.current_user = user;
        Ok(())
    }

    /// Parse a `user:name.ext` path with this volume's defaults.
    pub fn parse_name(&self, path: &str) -> CpmResult<CpmName> {
        CpmName::parse(path, self.current_user, max_user(self.format.flags))
    }

    pub(crate) fn mark_slot_dirty(&mut self, slot: usize) {
        self.dirty_blocks.insert(slot * ENTRY_SIZE / self.format.block_size);
    }

    fn directory_block(&self, index: usize) -> Vec<u8> {
        let per_block = self.format.block_size / ENTRY_SIZE;
        let mut buf = vec![FREE_MARKER; self.format.block_size];
        let start = index * per_block;
        for (i, entry) in self.entries.iter().skip(start).take(per_block).enumerate() {
            buf[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE].copy_from_slice(entry.as_bytes());
        }
        buf
    }

    /// Slots of every directory entry of `name`, ordered by extent.
    pub(crate) fn extent_slots(&self, name: &CpmName) -> Vec<usize> {
        let flags = self.format.flags;
        let mut slots: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| EntryStatus::classify(e.status(), flags).is_file() && e.belongs_to(name))
            .map(|(slot, _)| slot)
            .collect();
        slots.sort_by_key(|&slot| (self.entries[slot].extent(), slot));
        slots
    }

    /// Slot holding the physical extent `pext` of a file.
    pub(crate) fn slot_for_extent(&self, slots: &[usize], pext: usize) -> Option<usize> {
        slots
            .iter()
            .copied()
            .find(|&slot| self.entries[slot].extent() as usize / self.extents == pext)
    }

    /// Slot of the file's XFCB, if any.
    pub(crate) fn xfcb_slot(&self, name: &CpmName) -> Option<usize> {
        if !self.format.flags.contains(FsFlags::HAS_XFCBS) {
            return None;
        }
        self.entries.iter().position(|e| {
            e.status() == name.user + 16 && name.matches(name.user, &e.name(), &e.ext())
        })
    }

    /// File size reconstructed from the entry with the highest extent.
    pub(crate) fn file_size(&self, slots: &[usize]) -> u64 {
        let Some(last) = slots
            .iter()
            .map(|&s| &self.entries[s])
            .max_by_key(|e| e.extent())
        else {
            return 0;
        };
        let mut size = last.extent() as u64 * EXTENT_SIZE as u64;
        let rc = last.rc() as u64;
        if rc > 0 {
            size += (rc - 1) * RECORD_SIZE as u64;
            let lrc = last.lrc() as u64;
            size += if self.format.flags.contains(FsFlags::EXACT_SIZE) {
                RECORD_SIZE as u64 - lrc
            } else if lrc == 0 {
                RECORD_SIZE as u64
            } else {
                lrc
            };
        }
        size
    }

    /// Read a data block, refusing numbers outside the volume.
    pub(crate) fn read_data_block(&mut self, block: u16, buf: &mut [u8]) -> CpmResult<()> {
        self.check_block(block)?;
        self.map.read_block(&mut self.device, block, buf)
    }

    pub(crate) fn check_block(&self, block: u16) -> CpmResult<()> {
        if block as usize >= self.size || (block as usize) < self.alloc.first_data_block() {
            return Err(CpmError::Corrupt(format!(
                "block {} outside data area of {} blocks",
                block, self.size
            )));
        }
        Ok(())
    }
}
