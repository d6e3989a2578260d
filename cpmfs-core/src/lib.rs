//! CP/M filesystem driver.
//!
//! This crate reads and writes CP/M 2.2, CP/M 3, MP/M and related disk
//! filesystems stored in sector images:
//! - Format catalog with built-in and JSON-defined geometries
//! - Skewed sector addressing and the block allocation vector
//! - Directory entries grouped into files, with attributes and timestamps
//! - Byte-level read/write through the extent chain
//!
//! # Architecture
//!
//! - `Device` trait: physical sector access (memory, image file)
//! - `FormatCatalog`: resolves a format name to a `FormatConfig`
//! - `Superblock`: a mounted volume; owns the directory table and
//!   allocation vector, and carries the inode and file operations
//! - `SharedVolume`: a superblock behind a mutex for multi-threaded use
//!
//! Changes stay in memory until `Superblock::sync` (or `unmount`).

pub mod allocation;
pub mod device;
pub mod dirent;
pub mod error;
pub mod file;
pub mod format;
pub mod glob;
pub mod inode;
pub mod layout;
pub mod mkfs;
pub mod name;
pub mod shared;
pub mod skew;
pub mod stamp;
pub mod superblock;

pub use device::{Device, ImageFile, MemoryDevice};
pub use dirent::{Attributes, RawEntry};
pub use error::{CpmError, CpmResult};
pub use file::{CpmFile, FileHandle, OpenMode};
pub use format::{FormatCatalog, FormatConfig, FormatDef, FsFlags, Geometry};
pub use inode::{DirEntry, Inode, InodeKind, ReadDir, Stat, LABEL_NAME, PASSWD_NAME};
pub use mkfs::{make_filesystem, MkfsOptions};
pub use name::{to_8_3, CpmName};
pub use shared::SharedVolume;
pub use stamp::{FileTimes, StampScheme};
pub use superblock::{Label, LabelFlags, StatFs, Superblock};
