//! Byte-level file I/O through the extent chain.
//!
//! A byte offset maps to a physical extent (directory entry), a block
//! pointer inside that entry and an offset inside the block. Writes grow
//! the file block by block and entry by entry; a failure part way leaves
//! whatever was already written in place.

use std::io;

use crate::device::Device;
use crate::dirent::{Attributes, RawEntry};
use crate::error::{CpmError, CpmResult};
use crate::format::FsFlags;
use crate::inode::{Inode, InodeKind};
use crate::layout::{EXTENT_SIZE, RECORD_SIZE};
use crate::superblock::Superblock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// An open file. Holds no borrow of the volume.
#[derive(Debug, Clone)]
pub struct FileHandle {
    inode: Inode,
    mode: OpenMode,
    pos: u64,
}

impl FileHandle {
    /// Bytes transferred so far.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }
}

impl<D: Device> Superblock<D> {
    /// Open a file for reading or writing. The cursor starts at 0.
    pub fn open(&self, inode: &Inode, mode: OpenMode) -> CpmResult<FileHandle> {
        match (inode.kind, mode) {
            (InodeKind::Directory, _) => {
                return Err(CpmError::Unsupported("open of a directory".to_string()))
            }
            (InodeKind::Passwd | InodeKind::Label, OpenMode::Write) => {
                return Err(CpmError::ReadOnly(format!("pseudo file {}", inode.ino)))
            }
            (InodeKind::File, OpenMode::Write) => {
                let stat = self.stat(inode)?;
                if stat.attr.contains(Attributes::READ_ONLY) {
                    return Err(CpmError::ReadOnly(inode.file_name()?.to_string()));
                }
            }
            _ => {}
        }
        Ok(FileHandle {
            inode: inode.clone(),
            mode,
            pos: 0,
        })
    }

    /// Read from the cursor into `buf`. Returns 0 at end of file.
    ///
    /// A missing extent or a zero block pointer ends the read early without
    /// an error. A device failure is returned; bytes read before it stay in
    /// `buf` and the cursor counts them.
    pub fn read(&mut self, handle: &mut FileHandle, buf: &mut [u8]) -> CpmResult<usize> {
        if handle.mode != OpenMode::Read {
            return Err(CpmError::InvalidHandle);
        }
        if handle.inode.kind != InodeKind::File {
            let data = self.pseudo_contents(handle.inode.kind);
            let start = (handle.pos as usize).min(data.len());
            let n = buf.len().min(data.len() - start);
            buf[..n].copy_from_slice(&data[start..start + n]);
            handle.pos += n as u64;
            return Ok(n);
        }

        let name = handle.inode.file_name()?;
        let slots = self.extent_slots(&name);
        let size = self.file_size(&slots);
        let block_size = self.format.block_size;
        let capacity = self.format.entry_capacity() as u64;
        let mut block_buf = vec![0u8; block_size];
        let mut done = 0;

        while done < buf.len() && handle.pos < size {
            let pext = (handle.pos / capacity) as usize;
            let Some(slot) = self.slot_for_extent(&slots, pext) else {
                log::debug!("{}: no extent {}, short read", name, pext);
                break;
            };
            let within = handle.pos % capacity;
            let index = (within / block_size as u64) as usize;
            let block = self.entries[slot].pointer(index, self.wide);
            if block == 0 {
                log::debug!("{}: hole at offset {}", name, handle.pos);
                break;
            }
            self.read_data_block(block, &mut block_buf)?;

            let offset = (within % block_size as u64) as usize;
            let n = (block_size - offset)
                .min(buf.len() - done)
                .min((size - handle.pos) as usize);
            buf[done..done + n].copy_from_slice(&block_buf[offset..offset + n]);
            done += n;
            handle.pos += n as u64;
        }
        Ok(done)
    }

    /// Write `data` at the cursor, growing the file as needed.
    ///
    /// Runs out of blocks or directory slots with `NoSpace` or
    /// `NoDirectorySpace`; blocks written before that stay in the file.
    pub fn write(&mut self, handle: &mut FileHandle, data: &[u8]) -> CpmResult<usize> {
        if handle.mode != OpenMode::Write || handle.inode.kind != InodeKind::File {
            return Err(CpmError::InvalidHandle);
        }
        let name = handle.inode.file_name()?;
        let mut slots = self.extent_slots(&name);
        let Some(&base) = slots.first() else {
            return Err(CpmError::NotFound(name.to_string()));
        };
        let template = self.entries[base];
        let size = self.file_size(&slots);

        let block_size = self.format.block_size;
        let capacity = self.format.entry_capacity() as u64;
        let seclen = self.format.sector_length;
        let mut block_buf = vec![0u8; block_size];
        let mut done = 0;

        while done < data.len() {
            let pext = (handle.pos / capacity) as usize;
            let slot = match self.slot_for_extent(&slots, pext) {
                Some(slot) => slot,
                None => {
                    let slot = self.new_extent(&template, pext)?;
                    slots.push(slot);
                    slot
                }
            };

            let within = handle.pos % capacity;
            let index = (within / block_size as u64) as usize;
            let offset = (within % block_size as u64) as usize;
            let n = (block_size - offset).min(data.len() - done);

            let mut block = self.entries[slot].pointer(index, self.wide);
            if block == 0 {
                block = self.alloc.allocate_one()?;
                self.entries[slot].set_pointer(index, self.wide, block);
                self.mark_slot_dirty(slot);
                block_buf.fill(0);
            } else if offset != 0 || n != block_size {
                self.read_data_block(block, &mut block_buf)?;
            }
            block_buf[offset..offset + n].copy_from_slice(&data[done..done + n]);

            let first = offset / seclen;
            let last = (offset + n).div_ceil(seclen);
            self.check_block(block)?;
            self.map
                .write_sectors(&mut self.device, block, &block_buf, first, last)?;

            done += n;
            handle.pos += n as u64;
            if handle.pos > size {
                self.set_tail(slot, handle.pos);
            }
        }

        if done > 0 {
            self.touch(&slots, &name);
        }
        Ok(done)
    }

    /// Release a handle. Metadata reaches the disk on the next sync.
    pub fn close(&mut self, handle: FileHandle) -> CpmResult<()> {
        log::trace!("close inode {} at {}", handle.inode.ino, handle.pos);
        Ok(())
    }

    /// Add a directory entry for physical extent `pext`.
    fn new_extent(&mut self, template: &RawEntry, pext: usize) -> CpmResult<usize> {
        let slot = self.free_slot()?;
        let mut entry = *template;
        entry.clear_pointers();
        entry.set_rc(0);
        entry.set_lrc(0);
        entry.set_extent((pext * self.extents) as u16);
        self.entries[slot] = entry;
        self.mark_slot_dirty(slot);
        log::trace!("extent {} of {} in slot {}", pext, template.cpm_name(), slot);
        Ok(slot)
    }

    /// Record `end` as the file length in the entry holding the last byte.
    fn set_tail(&mut self, slot: usize, end: u64) {
        let last = end - 1;
        let extent = (last / EXTENT_SIZE as u64) as u16;
        let rc = ((last % EXTENT_SIZE as u64) / RECORD_SIZE as u64 + 1) as u8;
        let tail = (end % RECORD_SIZE as u64) as u8;
        let lrc = if self.format.flags.contains(FsFlags::EXACT_SIZE) {
            (RECORD_SIZE as u8).wrapping_sub(tail) & 0x7F
        } else {
            tail
        };
        let entry = &mut self.entries[slot];
        entry.set_extent(extent);
        entry.set_rc(rc);
        entry.set_lrc(lrc);
        self.mark_slot_dirty(slot);
    }
}

/// `std::io` view of an open file.
pub struct CpmFile<'a, D: Device> {
    sb: &'a mut Superblock<D>,
    handle: FileHandle,
}

impl<'a, D: Device> CpmFile<'a, D> {
    pub fn open(sb: &'a mut Superblock<D>, inode: &Inode, mode: OpenMode) -> CpmResult<Self> {
        let handle = sb.open(inode, mode)?;
        Ok(Self { sb, handle })
    }

    pub fn position(&self) -> u64 {
        self.handle.position()
    }

    pub fn close(self) -> CpmResult<()> {
        self.sb.close(self.handle)
    }
}

fn io_error(e: CpmError) -> io::Error {
    match e {
        CpmError::Io(e) => e,
        other => io::Error::other(other),
    }
}

impl<D: Device> io::Read for CpmFile<'_, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.sb.read(&mut self.handle, buf).map_err(io_error)
    }
}

impl<D: Device> io::Write for CpmFile<'_, D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sb.write(&mut self.handle, buf).map_err(io_error)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::format::{FormatCatalog, FormatConfig};
    use std::io::{Read, Write};

    fn mounted(fmt: FormatConfig) -> Superblock<MemoryDevice> {
        let dev = MemoryDevice::for_format(&fmt);
        Superblock::mount(dev, fmt, false).unwrap()
    }

    fn builtin(name: &str) -> Superblock<MemoryDevice> {
        mounted(FormatCatalog::builtin().resolve(name).unwrap())
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    fn write_file(sb: &mut Superblock<MemoryDevice>, path: &str, data: &[u8]) -> Inode {
        let root = sb.root();
        let ino = sb.create(&root, path, 0o666).unwrap();
        let mut h = sb.open(&ino, OpenMode::Write).unwrap();
        assert_eq!(sb.write(&mut h, data).unwrap(), data.len());
        sb.close(h).unwrap();
        sb.lookup(&root, path).unwrap()
    }

    fn read_all(sb: &mut Superblock<MemoryDevice>, ino: &Inode) -> Vec<u8> {
        let mut h = sb.open(ino, OpenMode::Read).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 700];
        loop {
            let n = sb.read(&mut h, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_small_round_trip() {
        let mut sb = builtin("ibm-3740");
        let ino = write_file(&mut sb, "small.txt", b"hello, cp/m world");
        assert_eq!(ino.size(), 17);
        let e = sb.directory()[ino.ino];
        assert_eq!(e.rc(), 1);
        assert_eq!(e.lrc(), 17);
        assert_eq!(read_all(&mut sb, &ino), b"hello, cp/m world");
    }

    #[test]
    fn test_multi_extent_round_trip() {
        let mut sb = builtin("ibm-3740");
        let data = pattern(40_000);
        let ino = write_file(&mut sb, "big.dat", &data);
        assert_eq!(ino.size(), 40_000);
        let name = ino.name.unwrap();
        let slots = sb.extent_slots(&name);
        assert_eq!(slots.len(), 3);
        let first = sb.directory()[slots[0]];
        assert_eq!(first.rc(), 0x80);
        assert_eq!(first.lrc(), 0);
        assert_eq!(read_all(&mut sb, &ino), data);
    }

    #[test]
    fn test_wide_pointers_round_trip() {
        let mut sb = builtin("p112");
        let data = pattern(70_000);
        let ino = write_file(&mut sb, "0:wide.bin", &data);
        assert_eq!(ino.size(), 70_000);
        assert_eq!(read_all(&mut sb, &ino), data);
        // 35 blocks of 2K, extent entries of 16K
        assert_eq!(sb.statfs().used_blocks, 4 + 35);
    }

    #[test]
    fn test_multiple_logical_extents_per_entry() {
        // 16 pointers of 2K: 32K per entry
        let fmt = FormatConfig::new("big", 512, 18, 10, 1, 64, 2048, FsFlags::DR22);
        assert_eq!(fmt.extents_per_entry(), 2);
        let mut sb = mounted(fmt);
        let data = pattern(50_000);
        let ino = write_file(&mut sb, "x", &data);
        let slots = sb.extent_slots(&ino.name.unwrap());
        assert_eq!(slots.len(), 2);
        assert_eq!(sb.directory()[slots[0]].extent(), 1);
        assert_eq!(sb.directory()[slots[1]].extent(), 3);
        assert_eq!(read_all(&mut sb, &ino), data);
    }

    #[test]
    fn test_exact_size() {
        let mut fmt = FormatCatalog::builtin().resolve("ibm-3740").unwrap();
        fmt.flags = FsFlags::ISX;
        let mut sb = mounted(fmt);
        let ino = write_file(&mut sb, "isx", &pattern(300));
        assert_eq!(ino.size(), 300);
        let e = sb.directory()[ino.ino];
        assert_eq!(e.rc(), 3);
        assert_eq!(e.lrc(), 128 - 44);
        let ino = write_file(&mut sb, "isx2", &pattern(256));
        assert_eq!(sb.directory()[ino.ino].lrc(), 0);
        assert_eq!(ino.size(), 256);
    }

    #[test]
    fn test_hole_ends_read() {
        let mut sb = builtin("ibm-3740");
        let ino = write_file(&mut sb, "holey", &pattern(3000));
        sb.entries[ino.ino].set_pointer(1, false, 0);
        let mut h = sb.open(&ino, OpenMode::Read).unwrap();
        let mut buf = vec![0u8; 3000];
        assert_eq!(sb.read(&mut h, &mut buf).unwrap(), 1024);
        assert_eq!(sb.read(&mut h, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_corrupt_pointer() {
        let mut sb = builtin("ibm-3740");
        let ino = write_file(&mut sb, "bad", &pattern(10));
        sb.entries[ino.ino].set_pointer(0, false, 250);
        let mut h = sb.open(&ino, OpenMode::Read).unwrap();
        let mut buf = [0u8; 10];
        assert!(matches!(sb.read(&mut h, &mut buf), Err(CpmError::Corrupt(_))));
    }

    #[test]
    fn test_device_error_keeps_progress() {
        let mut sb = builtin("ibm-3740");
        let data = pattern(2048);
        let ino = write_file(&mut sb, "two", &data);
        let second = sb.directory()[ino.ino].pointer(1, false);
        let (track, sector) = sb.sector_map().locate(second, 0);
        sb.device_mut().inject_read_error(track, sector);

        let mut h = sb.open(&ino, OpenMode::Read).unwrap();
        let mut buf = vec![0u8; 2048];
        let err = sb.read(&mut h, &mut buf).unwrap_err();
        assert!(matches!(err, CpmError::Device(_)));
        assert_eq!(h.position(), 1024);
        assert_eq!(&buf[..1024], &data[..1024]);
    }

    #[test]
    fn test_modes() {
        let mut sb = builtin("ibm-3740");
        let ino = write_file(&mut sb, "m", b"abc");
        let mut r = sb.open(&ino, OpenMode::Read).unwrap();
        assert!(matches!(sb.write(&mut r, b"x"), Err(CpmError::InvalidHandle)));
        let mut w = sb.open(&ino, OpenMode::Write).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(sb.read(&mut w, &mut buf), Err(CpmError::InvalidHandle)));

        sb.chmod(&ino, 0o444).unwrap();
        assert!(matches!(sb.open(&ino, OpenMode::Write), Err(CpmError::ReadOnly(_))));
        assert!(sb.open(&sb.root(), OpenMode::Read).is_err());
    }

    #[test]
    fn test_overwrite_keeps_length() {
        let mut sb = builtin("ibm-3740");
        let ino = write_file(&mut sb, "ow", b"0123456789");
        let mut h = sb.open(&ino, OpenMode::Write).unwrap();
        sb.write(&mut h, b"ab").unwrap();
        assert_eq!(read_all(&mut sb, &ino), b"ab23456789");
    }

    #[test]
    fn test_no_space_is_fail_forward() {
        let mut sb = builtin("ibm-3740");
        let free = sb.statfs().free_blocks;
        let root = sb.root();
        let ino = sb.create(&root, "fill", 0o666).unwrap();
        let mut h = sb.open(&ino, OpenMode::Write).unwrap();
        let data = pattern((free + 1) * 1024);
        assert!(matches!(sb.write(&mut h, &data), Err(CpmError::NoSpace)));
        assert_eq!(h.position(), (free * 1024) as u64);
        assert_eq!(sb.statfs().free_blocks, 0);
        assert_eq!(sb.stat(&ino).unwrap().size, (free * 1024) as u64);
    }

    #[test]
    fn test_truncate_releases_blocks() {
        let mut sb = builtin("ibm-3740");
        let before = sb.statfs().free_blocks;
        let ino = write_file(&mut sb, "t", &pattern(20_000));
        sb.truncate(&ino).unwrap();
        assert_eq!(sb.statfs().free_blocks, before);
        assert_eq!(sb.stat(&ino).unwrap().size, 0);
        assert_eq!(sb.extent_slots(&ino.name.unwrap()).len(), 1);
    }

    #[test]
    fn test_io_adapter() {
        let mut sb = builtin("ibm-3740");
        let root = sb.root();
        let ino = sb.create(&root, "io.txt", 0o666).unwrap();
        {
            let mut f = CpmFile::open(&mut sb, &ino, OpenMode::Write).unwrap();
            f.write_all(&pattern(5000)).unwrap();
            assert_eq!(f.position(), 5000);
            f.close().unwrap();
        }
        let mut f = CpmFile::open(&mut sb, &ino, OpenMode::Read).unwrap();
        let mut back = Vec::new();
        f.read_to_end(&mut back).unwrap();
        assert_eq!(back, pattern(5000));
    }
}
