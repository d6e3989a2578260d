//! Directory entries to files.
//!
//! A file is every directory entry sharing one user number, name and
//! extension. Its inode number is the slot of the entry with the lowest
//! extent. The root directory and the `[passwd]` / `[label]` pseudo files
//! take the numbers just past the last slot.

use chrono::{DateTime, Utc};

use crate::device::Device;
use crate::dirent::{Attributes, RawEntry};
use crate::error::{CpmError, CpmResult};
use crate::format::FsFlags;
use crate::layout::{EntryStatus, ENTRY_SIZE, STAMP_STATUS};
use crate::name::CpmName;
use crate::stamp::{self, FileTimes, StampScheme};
use crate::superblock::Superblock;

pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

/// Name of the password pseudo file.
pub const PASSWD_NAME: &str = "[passwd]";

/// Name of the label pseudo file.
pub const LABEL_NAME: &str = "[label]";

/// Number of pseudo positions at the start of a directory listing.
const RESERVED_ENTRIES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    Directory,
    File,
    Passwd,
    Label,
}

/// Metadata of a file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub ino: usize,
    pub mode: u32,
    pub size: u64,
    pub attr: Attributes,
    pub atime: Option<DateTime<Utc>>,
    pub mtime: Option<DateTime<Utc>>,
    pub ctime: Option<DateTime<Utc>>,
}

/// A file identity plus the metadata seen when it was looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub ino: usize,
    pub kind: InodeKind,
    /// Set for regular files only.
    pub name: Option<CpmName>,
    pub stat: Stat,
}

impl Inode {
    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    pub fn size(&self) -> u64 {
        self.stat.size
    }

    pub(crate) fn file_name(&self) -> CpmResult<CpmName> {
        self.name
            .ok_or_else(|| CpmError::Unsupported(format!("operation on inode {}", self.ino)))
    }
}

/// One item of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: usize,
    pub kind: InodeKind,
    /// User number of a regular file.
    pub user: Option<u8>,
    /// `name.ext`, or the pseudo name.
    pub name: String,
}

impl DirEntry {
    /// `user:name.ext` for files, the bare name otherwise.
    pub fn path(&self) -> String {
        match self.user {
            Some(user) => format!("{}:{}", user, self.name),
            None => self.name.clone(),
        }
    }
}

/// Lazy walk over the directory table. Finite and restartable.
pub struct ReadDir<'a, D: Device> {
    sb: &'a Superblock<D>,
    pos: usize,
    pseudo: bool,
}

impl<'a, D: Device> ReadDir<'a, D> {
    /// Also yield `.`, `..` and the pseudo files.
    pub fn include_pseudo(mut self) -> Self {
        self.pseudo = true;
        self
    }

    /// Start over from the first slot.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }
}

impl<'a, D: Device> Iterator for ReadDir<'a, D> {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        let sb = self.sb;
        let max_dir = sb.format.max_dir;
        let other = sb.format.flags.contains(FsFlags::CPM3_OTHER);

        while self.pos < RESERVED_ENTRIES {
            let pos = self.pos;
            self.pos += 1;
            if !self.pseudo {
                continue;
            }
            let (ino, kind, name) = match pos {
                0 => (max_dir, InodeKind::Directory, "."),
                1 => (max_dir, InodeKind::Directory, ".."),
                2 if other => (max_dir + 1, InodeKind::Passwd, PASSWD_NAME),
                3 if other => (max_dir + 2, InodeKind::Label, LABEL_NAME),
                _ => continue,
            };
            return Some(DirEntry {
                ino,
                kind,
                user: None,
                name: name.to_string(),
            });
        }

        while self.pos - RESERVED_ENTRIES < sb.entries.len() {
            let slot = self.pos - RESERVED_ENTRIES;
            self.pos += 1;
            let entry = &sb.entries[slot];
            if !EntryStatus::classify(entry.status(), sb.format.flags).is_file() {
                continue;
            }
            let name = entry.cpm_name();
            if sb.extent_slots(&name).first() != Some(&slot) {
                continue;
            }
            return Some(DirEntry {
                ino: slot,
                kind: InodeKind::File,
                user: Some(name.user),
                name: name.render(sb.uppercase),
            });
        }
        None
    }
}

impl<D: Device> Superblock<D> {
    /// The root directory.
    pub fn root(&self) -> Inode {
        let ino = self.format.max_dir;
        let (ctime, mtime) = match &self.label {
            Some(label) => (label.ctime, label.mtime),
            None => (None, None),
        };
        Inode {
            ino,
            kind: InodeKind::Directory,
            name: None,
            stat: Stat {
                ino,
                mode: S_IFDIR | 0o777,
                size: (self.format.max_dir * ENTRY_SIZE) as u64,
                attr: Attributes::empty(),
                atime: None,
                mtime,
                ctime,
            },
        }
    }

    /// Iterate the files of the directory.
    pub fn read_dir(&self) -> ReadDir<'_, D> {
        ReadDir {
            sb: self,
            pos: 0,
            pseudo: false,
        }
    }

    /// Find `user:name.ext`, `name.ext` or a pseudo file in `dir`.
    pub fn lookup(&self, dir: &Inode, path: &str) -> CpmResult<Inode> {
        check_dir(dir)?;
        let other = self.format.flags.contains(FsFlags::CPM3_OTHER);
        match path {
            "." | ".." => return Ok(self.root()),
            PASSWD_NAME if other => return Ok(self.pseudo_inode(InodeKind::Passwd)),
            LABEL_NAME if other => return Ok(self.pseudo_inode(InodeKind::Label)),
            _ => {}
        }
        let name = self.parse_name(path)?;
        self.inode_for(&name)
    }

    /// Fresh metadata for an inode.
    pub fn stat(&self, inode: &Inode) -> CpmResult<Stat> {
        match inode.kind {
            InodeKind::Directory => Ok(self.root().stat),
            InodeKind::Passwd | InodeKind::Label => Ok(self.pseudo_inode(inode.kind).stat),
            InodeKind::File => Ok(self.inode_for(&inode.file_name()?)?.stat),
        }
    }

    /// Create an empty file. A `mode` without write bits makes it read-only.
    pub fn create(&mut self, dir: &Inode, path: &str, mode: u32) -> CpmResult<Inode> {
        check_dir(dir)?;
        let name = self.parse_name(path)?;
        if !self.extent_slots(&name).is_empty() {
            return Err(CpmError::AlreadyExists(name.to_string()));
        }
        let slot = self.free_slot()?;
        let mut entry = RawEntry::for_file(&name);
        if mode & 0o222 == 0 {
            entry.set_attributes(Attributes::READ_ONLY);
        }
        self.entries[slot] = entry;
        self.mark_slot_dirty(slot);

        let now = Some(Utc::now());
        let times = FileTimes {
            atime: now,
            mtime: now,
            ctime: now,
        };
        self.store_times(&[slot], &name, &times);
        log::debug!("create {} in slot {}", name, slot);
        self.inode_for(&name)
    }

    /// Remove a file, releasing its entries, XFCB and blocks.
    pub fn unlink(&mut self, dir: &Inode, path: &str) -> CpmResult<()> {
        check_dir(dir)?;
        let name = self.parse_name(path)?;
        let slots = self.extent_slots(&name);
        if slots.is_empty() {
            return Err(CpmError::NotFound(name.to_string()));
        }

        if slots.contains(&0) {
            self.drop_datestamper();
        }
        let blocks = self.file_blocks(&slots);
        self.clear_times(&slots);
        for &slot in &slots {
            self.entries[slot].release();
            self.mark_slot_dirty(slot);
        }
        if let Some(xfcb) = self.xfcb_slot(&name) {
            self.entries[xfcb].release();
            self.mark_slot_dirty(xfcb);
        }
        self.alloc.free(&blocks);
        log::debug!("unlink {}: {} entries, {} blocks", name, slots.len(), blocks.len());
        Ok(())
    }

    /// Rename a file; the user number may change too.
    pub fn rename(&mut self, dir: &Inode, old: &str, new: &str) -> CpmResult<()> {
        check_dir(dir)?;
        let from = self.parse_name(old)?;
        let to = self.parse_name(new)?;
        let slots = self.extent_slots(&from);
        if slots.is_empty() {
            return Err(CpmError::NotFound(from.to_string()));
        }
        if !self.extent_slots(&to).is_empty() {
            return Err(CpmError::AlreadyExists(to.to_string()));
        }

        if slots.contains(&0) {
            self.drop_datestamper();
        }
        let xfcb = self.xfcb_slot(&from);
        for &slot in &slots {
            let entry = &mut self.entries[slot];
            entry.set_status(to.user);
            entry.set_name(&to.name, &to.ext);
            self.mark_slot_dirty(slot);
        }
        if let Some(xfcb) = xfcb {
            let entry = &mut self.entries[xfcb];
            entry.set_status(to.user + 16);
            entry.set_name(&to.name, &to.ext);
            self.mark_slot_dirty(xfcb);
        }
        log::debug!("rename {} -> {}", from, to);
        Ok(())
    }

    /// Current attributes of a file.
    pub fn attr_get(&self, inode: &Inode) -> CpmResult<Attributes> {
        Ok(self.stat(inode)?.attr)
    }

    /// Store attributes in every entry of the file. Password protection
    /// bits are derived data and ignored here.
    pub fn attr_set(&mut self, inode: &Inode, attr: Attributes) -> CpmResult<()> {
        let name = inode.file_name()?;
        let slots = self.extent_slots(&name);
        if slots.is_empty() {
            return Err(CpmError::NotFound(name.to_string()));
        }
        for &slot in &slots {
            self.entries[slot].set_attributes(attr & Attributes::STORED);
            self.mark_slot_dirty(slot);
        }
        Ok(())
    }

    /// Map POSIX permission bits onto the read-only and system attributes.
    pub fn chmod(&mut self, inode: &Inode, mode: u32) -> CpmResult<()> {
        let mut attr = self.attr_get(inode)?;
        attr.set(Attributes::READ_ONLY, mode & 0o222 == 0);
        attr.set(Attributes::SYSTEM, mode & 0o1000 != 0);
        self.attr_set(inode, attr)
    }

    /// Set access and modification time; the change time becomes now.
    pub fn utime(
        &mut self,
        inode: &Inode,
        atime: Option<DateTime<Utc>>,
        mtime: Option<DateTime<Utc>>,
    ) -> CpmResult<()> {
        let name = inode.file_name()?;
        let slots = self.extent_slots(&name);
        if slots.is_empty() {
            return Err(CpmError::NotFound(name.to_string()));
        }
        let times = FileTimes {
            atime,
            mtime,
            ctime: Some(Utc::now()),
        };
        self.store_times(&slots, &name, &times);
        Ok(())
    }

    /// Cut a file to zero length, keeping its first entry.
    pub fn truncate(&mut self, inode: &Inode) -> CpmResult<()> {
        let name = inode.file_name()?;
        let slots = self.extent_slots(&name);
        let Some((&base, rest)) = slots.split_first() else {
            return Err(CpmError::NotFound(name.to_string()));
        };
        let blocks = self.file_blocks(&slots);
        self.clear_times(rest);
        for &slot in rest {
            self.entries[slot].release();
            self.mark_slot_dirty(slot);
        }
        let entry = &mut self.entries[base];
        entry.clear_pointers();
        entry.set_extent(0);
        entry.set_rc(0);
        entry.set_lrc(0);
        self.mark_slot_dirty(base);
        self.alloc.free(&blocks);
        self.touch(&slots[..1], &name);
        Ok(())
    }

    pub(crate) fn inode_for(&self, name: &CpmName) -> CpmResult<Inode> {
        let slots = self.extent_slots(name);
        let Some(&base) = slots.first() else {
            return Err(CpmError::NotFound(name.to_string()));
        };
        let mut attr = self.entries[base].attributes();
        let (times, protect) = self.load_times(base, name);
        attr |= protect;

        let mut mode = S_IFREG | 0o444;
        if !attr.contains(Attributes::READ_ONLY) {
            mode |= 0o222;
        }
        if attr.contains(Attributes::SYSTEM) {
            mode |= 0o1000;
        }
        Ok(Inode {
            ino: base,
            kind: InodeKind::File,
            name: Some(*name),
            stat: Stat {
                ino: base,
                mode,
                size: self.file_size(&slots),
                attr,
                atime: times.atime,
                mtime: times.mtime,
                ctime: times.ctime,
            },
        })
    }

    fn pseudo_inode(&self, kind: InodeKind) -> Inode {
        let (ino, size) = match kind {
            InodeKind::Passwd => (self.format.max_dir + 1, self.passwd.len()),
            _ => (
                self.format.max_dir + 2,
                self.label.as_ref().map(|l| l.text().len()).unwrap_or(0),
            ),
        };
        Inode {
            ino,
            kind,
            name: None,
            stat: Stat {
                ino,
                mode: S_IFREG | 0o444,
                size: size as u64,
                attr: Attributes::READ_ONLY,
                atime: None,
                mtime: None,
                ctime: None,
            },
        }
    }

    /// Contents of a pseudo file.
    pub(crate) fn pseudo_contents(&self, kind: InodeKind) -> Vec<u8> {
        match kind {
            InodeKind::Passwd => self.passwd.as_bytes().to_vec(),
            InodeKind::Label => self
                .label
                .as_ref()
                .map(|l| l.text().into_bytes())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn free_slot(&self) -> CpmResult<usize> {
        self.entries
            .iter()
            .position(|e| e.is_free())
            .ok_or(CpmError::NoDirectorySpace)
    }

    /// Non-zero in-range block pointers of the given entries.
    pub(crate) fn file_blocks(&self, slots: &[usize]) -> Vec<u16> {
        let mut blocks = Vec::new();
        for &slot in slots {
            for block in self.entries[slot].pointers(self.wide) {
                if block != 0 && (block as usize) < self.size {
                    blocks.push(block);
                }
            }
        }
        blocks
    }

    /// Stamps and password protection bits of a file.
    fn load_times(&self, base: usize, name: &CpmName) -> (FileTimes, Attributes) {
        let mut times = FileTimes::default();
        let mut protect = Attributes::empty();
        let split = |first, update, create_not_access: bool| {
            if create_not_access {
                FileTimes {
                    ctime: first,
                    mtime: update,
                    atime: None,
                }
            } else {
                FileTimes {
                    atime: first,
                    mtime: update,
                    ctime: None,
                }
            }
        };
        match &self.stamps {
            StampScheme::Cpm3 { create_not_access } => {
                if let Some(b) = self.stamp_group(base) {
                    times = split(
                        stamp::decode_stamp(&b[0..4]),
                        stamp::decode_stamp(&b[4..8]),
                        *create_not_access,
                    );
                    if self.format.flags.contains(FsFlags::CPM3_OTHER) {
                        protect = Attributes::from_protect_mode(b[8]);
                    }
                }
            }
            StampScheme::Mpm { create_not_access } => {
                if let Some(xfcb) = self.xfcb_slot(name) {
                    let b = self.entries[xfcb].as_bytes();
                    times = split(
                        stamp::decode_stamp(&b[24..28]),
                        stamp::decode_stamp(&b[28..32]),
                        *create_not_access,
                    );
                    protect = Attributes::from_protect_mode(b[12]);
                }
            }
            StampScheme::DataStamper(store) => times = store.times(base),
            StampScheme::None => {}
        }
        (times, protect)
    }

    /// The 10 stamp bytes belonging to `slot`, if its stamp entry exists.
    fn stamp_group(&self, slot: usize) -> Option<&[u8]> {
        let (stamp_slot, offset) = stamp::cpm3_group(slot)?;
        let entry = self.entries.get(stamp_slot)?;
        if entry.status() != STAMP_STATUS {
            return None;
        }
        Some(&entry.as_bytes()[offset..offset + 10])
    }

    /// Write stamps for every given slot in the active scheme.
    pub(crate) fn store_times(&mut self, slots: &[usize], name: &CpmName, times: &FileTimes) {
        if let StampScheme::DataStamper(store) = &mut self.stamps {
            for &slot in slots {
                store.set_times(slot, times);
            }
            return;
        }
        let (create_not_access, in_xfcb) = match &self.stamps {
            StampScheme::Cpm3 { create_not_access } => (*create_not_access, false),
            StampScheme::Mpm { create_not_access } => (*create_not_access, true),
            _ => return,
        };
        let first = if create_not_access {
            times.ctime
        } else {
            times.atime
        };

        if in_xfcb {
            if let Some(xfcb) = self.xfcb_slot(name) {
                let b = self.entries[xfcb].as_bytes_mut();
                stamp::encode_stamp(first, &mut b[24..28]);
                stamp::encode_stamp(times.mtime, &mut b[28..32]);
                self.mark_slot_dirty(xfcb);
            }
            return;
        }
        for &slot in slots {
            let Some((stamp_slot, offset)) = stamp::cpm3_group(slot) else {
                continue;
            };
            match self.entries.get_mut(stamp_slot) {
                Some(entry) if entry.status() == STAMP_STATUS => {
                    let b = entry.as_bytes_mut();
                    stamp::encode_stamp(first, &mut b[offset..offset + 4]);
                    stamp::encode_stamp(times.mtime, &mut b[offset + 4..offset + 8]);
                    self.mark_slot_dirty(stamp_slot);
                }
                _ => {}
            }
        }
    }

    /// Update the modification time of a file that has just been written.
    pub(crate) fn touch(&mut self, slots: &[usize], name: &CpmName) {
        if matches!(self.stamps, StampScheme::None) {
            return;
        }
        let Some(&base) = slots.first() else {
            return;
        };
        let (mut times, _) = self.load_times(base, name);
        times.mtime = Some(Utc::now());
        self.store_times(slots, name, &times);
    }

    fn clear_times(&mut self, slots: &[usize]) {
        if let StampScheme::DataStamper(store) = &mut self.stamps {
            for &slot in slots {
                store.clear(slot);
            }
            return;
        }
        if !matches!(self.stamps, StampScheme::Cpm3 { .. }) {
            return;
        }
        for &slot in slots {
            let Some((stamp_slot, offset)) = stamp::cpm3_group(slot) else {
                continue;
            };
            match self.entries.get_mut(stamp_slot) {
                Some(entry) if entry.status() == STAMP_STATUS => {
                    entry.as_bytes_mut()[offset..offset + 10].fill(0);
                    self.mark_slot_dirty(stamp_slot);
                }
                _ => {}
            }
        }
    }
}

fn check_dir(dir: &Inode) -> CpmResult<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(CpmError::NotFound(format!("inode {} is not a directory", dir.ino)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::format::FormatCatalog;
    use crate::format::FormatConfig;
    use crate::mkfs::{make_filesystem, MkfsOptions};
    use chrono::TimeZone;

    fn mounted(name: &str) -> Superblock<MemoryDevice> {
        let fmt = FormatCatalog::builtin().resolve(name).unwrap();
        let dev = MemoryDevice::for_format(&fmt);
        Superblock::mount(dev, fmt, false).unwrap()
    }

    #[test]
    fn test_create_lookup_unlink() {
        let mut sb = mounted("ibm-3740");
        let root = sb.root();
        let ino = sb.create(&root, "0:hello.txt", 0o666).unwrap();
        assert_eq!(ino.ino, 0);
        assert_eq!(ino.size(), 0);
        assert_eq!(ino.stat.mode, S_IFREG | 0o666);

        let found = sb.lookup(&root, "HELLO.TXT").unwrap();
        assert_eq!(found.ino, 0);
        assert!(matches!(
            sb.create(&root, "hello.txt", 0o666),
            Err(CpmError::AlreadyExists(_))
        ));

        sb.unlink(&root, "hello.txt").unwrap();
        assert!(matches!(sb.lookup(&root, "hello.txt"), Err(CpmError::NotFound(_))));
        assert!(matches!(sb.unlink(&root, "hello.txt"), Err(CpmError::NotFound(_))));
    }

    #[test]
    fn test_lookup_requires_directory() {
        let mut sb = mounted("ibm-3740");
        let root = sb.root();
        let file = sb.create(&root, "a", 0o666).unwrap();
        assert!(sb.lookup(&file, "a").is_err());
        assert!(matches!(sb.lookup(&root, "a*"), Err(CpmError::InvalidName(_))));
    }

    #[test]
    fn test_read_only_mode() {
        let mut sb = mounted("ibm-3740");
        let root = sb.root();
        let ino = sb.create(&root, "ro.com", 0o444).unwrap();
        assert!(ino.stat.attr.contains(Attributes::READ_ONLY));
        assert_eq!(ino.stat.mode & 0o222, 0);

        sb.chmod(&ino, 0o1666).unwrap();
        let attr = sb.attr_get(&ino).unwrap();
        assert!(!attr.contains(Attributes::READ_ONLY));
        assert!(attr.contains(Attributes::SYSTEM));
        assert_eq!(sb.stat(&ino).unwrap().mode, S_IFREG | 0o1666);
    }

    #[test]
    fn test_read_dir_lists_each_file_once() {
        let mut sb = mounted("ibm-3740");
        let root = sb.root();
        sb.create(&root, "b.txt", 0o666).unwrap();
        sb.create(&root, "3:a.com", 0o666).unwrap();
        // a second extent of b.txt
        let mut second = sb.entries[0];
        second.set_extent(1);
        sb.entries[5] = second;

        let names: Vec<String> = sb.read_dir().map(|e| e.path()).collect();
        assert_eq!(names, vec!["0:b.txt", "3:a.com"]);

        let mut iter = sb.read_dir().include_pseudo();
        let all: Vec<String> = iter.by_ref().map(|e| e.name).collect();
        assert_eq!(all, vec![".", "..", "b.txt", "a.com"]);
        iter.rewind();
        assert_eq!(iter.count(), 4);
    }

    #[test]
    fn test_rename() {
        let mut sb = mounted("ibm-3740");
        let root = sb.root();
        let a = sb.create(&root, "a.txt", 0o666).unwrap();
        sb.attr_set(&a, Attributes::ARCHIVE | Attributes::F1).unwrap();
        sb.create(&root, "b.txt", 0o666).unwrap();

        assert!(matches!(
            sb.rename(&root, "a.txt", "b.txt"),
            Err(CpmError::AlreadyExists(_))
        ));
        assert!(matches!(
            sb.rename(&root, "zz.txt", "c.txt"),
            Err(CpmError::NotFound(_))
        ));
        assert!(matches!(
            sb.rename(&root, "a.txt", "c?.txt"),
            Err(CpmError::InvalidName(_))
        ));

        sb.rename(&root, "a.txt", "2:c.txt").unwrap();
        let c = sb.lookup(&root, "2:c.txt").unwrap();
        assert_eq!(c.ino, a.ino);
        assert_eq!(c.stat.attr, Attributes::ARCHIVE | Attributes::F1);
        assert!(sb.lookup(&root, "a.txt").is_err());
    }

    #[test]
    fn test_directory_full() {
        let mut sb = mounted("ibm-3740");
        let root = sb.root();
        for i in 0..64 {
            sb.create(&root, &format!("f{}", i), 0o666).unwrap();
        }
        assert!(matches!(
            sb.create(&root, "one.mor", 0o666),
            Err(CpmError::NoDirectorySpace)
        ));
        assert_eq!(sb.statfs().free_entries, 0);
    }

    #[test]
    fn test_cpm3_stamps() {
        let fmt = FormatCatalog::builtin().resolve("pcw").unwrap();
        let mut dev = MemoryDevice::for_format(&fmt);
        let options = MkfsOptions {
            label: Some("WORK".to_string()),
            timestamps: true,
            boot: Vec::new(),
        };
        make_filesystem(&mut dev, &fmt, &options).unwrap();
        let mut sb = Superblock::mount(dev, fmt, false).unwrap();
        assert_eq!(sb.stamp_scheme(), &StampScheme::Cpm3 { create_not_access: true });

        let root = sb.root();
        assert!(root.stat.ctime.is_some());
        let ino = sb.create(&root, "dated.txt", 0o666).unwrap();
        // slot 0 holds the label, slot 3 the stamps
        assert_eq!(ino.ino, 1);
        assert!(ino.stat.ctime.is_some());
        assert!(ino.stat.mtime.is_some());
        assert!(ino.stat.atime.is_none());

        let when = Utc::now() - chrono::Duration::days(400);
        sb.utime(&ino, None, Some(when)).unwrap();
        let st = sb.stat(&ino).unwrap();
        assert_eq!(st.mtime.map(|t| t.timestamp() / 60), Some(when.timestamp() / 60));
    }

    #[test]
    fn test_pseudo_files() {
        let fmt = FormatCatalog::builtin().resolve("pcw").unwrap();
        let mut dev = MemoryDevice::for_format(&fmt);
        let options = MkfsOptions {
            label: Some("disc1".to_string()),
            timestamps: false,
            boot: Vec::new(),
        };
        make_filesystem(&mut dev, &fmt, &options).unwrap();
        let sb = Superblock::mount(dev, fmt, true).unwrap();
        let root = sb.root();
        let label = sb.lookup(&root, LABEL_NAME).unwrap();
        assert_eq!(label.ino, 66);
        assert_eq!(sb.pseudo_contents(InodeKind::Label), b"DISC1      \n");
        assert_eq!(sb.lookup(&root, PASSWD_NAME).unwrap().size(), 0);

        let names: Vec<String> = sb.read_dir().include_pseudo().map(|e| e.name).collect();
        assert_eq!(names, vec![".", "..", PASSWD_NAME, LABEL_NAME]);
    }

    #[test]
    fn test_pseudo_names_need_cpm3() {
        let sb = mounted("ibm-3740");
        let root = sb.root();
        assert!(matches!(
            sb.lookup(&root, PASSWD_NAME),
            Err(CpmError::InvalidName(_))
        ));
    }

    fn mpm_volume() -> Superblock<MemoryDevice> {
        let fmt = FormatConfig::new("mpm-8in", 128, 26, 77, 2, 64, 1024, FsFlags::MPM);
        let dev = MemoryDevice::for_format(&fmt);
        Superblock::mount(dev, fmt, false).unwrap()
    }

    /// Extended FCB for user 0 `name` (8+3 padded) with a sealed password.
    fn xfcb(name: &[u8; 11], mode: u8, password: &str, key: u8) -> RawEntry {
        let mut entry = RawEntry::from_bytes(&[0u8; ENTRY_SIZE]);
        let b = entry.as_bytes_mut();
        b[0] = 16;
        b[1..12].copy_from_slice(name);
        b[12] = mode;
        b[13] = key;
        b[16..24].copy_from_slice(&stamp::seal_password(password, key));
        entry
    }

    #[test]
    fn test_mpm_xfcb_stamps_and_passwords() {
        let mut sb = mpm_volume();
        assert_eq!(sb.stamp_scheme(), &StampScheme::Mpm { create_not_access: false });
        let root = sb.root();
        let ino = sb.create(&root, "secret.txt", 0o666).unwrap();
        assert_eq!(ino.ino, 0);
        sb.entries[1] = xfcb(b"SECRET  TXT", 0x80 | 0x20, "key", 0x2A);
        sb.mark_slot_dirty(1);

        let accessed = Utc.with_ymd_and_hms(1988, 3, 14, 9, 30, 0).unwrap();
        let modified = Utc.with_ymd_and_hms(1989, 11, 2, 17, 5, 0).unwrap();
        sb.utime(&ino, Some(accessed), Some(modified)).unwrap();
        let b = sb.directory()[1].as_bytes();
        assert_eq!(stamp::decode_stamp(&b[24..28]), Some(accessed));
        assert_eq!(stamp::decode_stamp(&b[28..32]), Some(modified));

        let st = sb.stat(&ino).unwrap();
        assert_eq!(st.atime, Some(accessed));
        assert_eq!(st.mtime, Some(modified));
        assert_eq!(st.attr & Attributes::PASSWORD, Attributes::PW_READ | Attributes::PW_DELETE);

        let fmt = sb.format().clone();
        let dev = sb.unmount().unwrap();
        let mut sb = Superblock::mount(dev, fmt, false).unwrap();
        assert_eq!(sb.pseudo_contents(InodeKind::Passwd), b"00secret.txt KEY\n");

        let root = sb.root();
        sb.rename(&root, "secret.txt", "3:hidden.txt").unwrap();
        assert_eq!(sb.directory()[1].status(), 19);
        assert_eq!(&sb.directory()[1].as_bytes()[1..12], b"HIDDEN  TXT");
        let moved = sb.lookup(&root, "3:hidden.txt").unwrap();
        assert_eq!(moved.stat.mtime, Some(modified));
        assert!(moved.stat.attr.contains(Attributes::PW_READ));

        sb.unlink(&root, "3:hidden.txt").unwrap();
        assert!(sb.directory()[0].is_free());
        assert!(sb.directory()[1].is_free());
    }

    #[test]
    fn test_cpm3_protection_mode() {
        let fmt = FormatCatalog::builtin().resolve("pcw").unwrap();
        let mut dev = MemoryDevice::for_format(&fmt);
        let options = MkfsOptions {
            label: None,
            timestamps: true,
            boot: Vec::new(),
        };
        make_filesystem(&mut dev, &fmt, &options).unwrap();
        let mut sb = Superblock::mount(dev, fmt, false).unwrap();
        let root = sb.root();
        let ino = sb.create(&root, "locked.dat", 0o666).unwrap();
        assert_eq!(ino.ino, 1);
        // Slot 1's group starts at byte 11 of the stamp entry in slot 3
        sb.entries[3].as_bytes_mut()[11 + 8] = 0x40;

        let st = sb.stat(&ino).unwrap();
        assert_eq!(st.attr & Attributes::PASSWORD, Attributes::PW_WRITE);

        sb.attr_set(&ino, Attributes::ARCHIVE | Attributes::PW_READ).unwrap();
        let st = sb.stat(&ino).unwrap();
        assert!(st.attr.contains(Attributes::ARCHIVE));
        assert_eq!(st.attr & Attributes::PASSWORD, Attributes::PW_WRITE);
    }
}
