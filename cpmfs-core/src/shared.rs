//! Thread-safe wrapper around a mounted volume.
//!
//! The superblock itself performs no locking. `SharedVolume` puts it behind
//! a mutex so several threads can take turns on one mount. Clone is cheap
//! (just clones the Arc).

use std::sync::{Arc, Mutex};

use crate::device::Device;
use crate::error::{CpmError, CpmResult};
use crate::inode::DirEntry;
use crate::superblock::{StatFs, Superblock};

pub struct SharedVolume<D: Device> {
    inner: Arc<Mutex<Superblock<D>>>,
}

impl<D: Device> Clone for SharedVolume<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Device> SharedVolume<D> {
    pub fn new(sb: Superblock<D>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sb)),
        }
    }

    /// Run `f` with exclusive access to the volume.
    pub fn with<T>(&self, f: impl FnOnce(&mut Superblock<D>) -> CpmResult<T>) -> CpmResult<T> {
        let mut sb = self.inner.lock().map_err(|_| CpmError::LockPoisoned)?;
        f(&mut sb)
    }

    /// Read a whole file.
    pub fn read_file(&self, path: &str) -> CpmResult<Vec<u8>> {
        self.with(|sb| {
            let root = sb.root();
            let inode = sb.lookup(&root, path)?;
            let mut handle = sb.open(&inode, crate::file::OpenMode::Read)?;
            let mut data = vec![0u8; inode.size() as usize];
            let n = sb.read(&mut handle, &mut data)?;
            data.truncate(n);
            sb.close(handle)?;
            Ok(data)
        })
    }

    /// Create (or replace) a file with `data`.
    pub fn write_file(&self, path: &str, data: &[u8]) -> CpmResult<()> {
        self.with(|sb| {
            let root = sb.root();
            match sb.unlink(&root, path) {
                Ok(()) | Err(CpmError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            let inode = sb.create(&root, path, 0o666)?;
            let mut handle = sb.open(&inode, crate::file::OpenMode::Write)?;
            sb.write(&mut handle, data)?;
            sb.close(handle)
        })
    }

    pub fn list_files(&self) -> CpmResult<Vec<DirEntry>> {
        self.with(|sb| Ok(sb.read_dir().collect()))
    }

    pub fn statfs(&self) -> CpmResult<StatFs> {
        self.with(|sb| Ok(sb.statfs()))
    }

    pub fn sync(&self) -> CpmResult<()> {
        self.with(|sb| sb.sync())
    }

    /// Take the volume back if this is the last handle.
    pub fn into_inner(self) -> CpmResult<Superblock<D>> {
        Arc::try_unwrap(self.inner)
            .map_err(|_| CpmError::Unsupported("volume still shared".to_string()))?
            .into_inner()
            .map_err(|_| CpmError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::format::FormatCatalog;
    use std::thread;

    fn volume() -> SharedVolume<MemoryDevice> {
        let fmt = FormatCatalog::builtin().resolve("ibm-3740").unwrap();
        let dev = MemoryDevice::for_format(&fmt);
        SharedVolume::new(Superblock::mount(dev, fmt, false).unwrap())
    }

    #[test]
    fn test_threads_share_a_mount() {
        let vol = volume();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let vol = vol.clone();
                thread::spawn(move || {
                    vol.write_file(&format!("t{}.dat", i), &vec![i as u8; 3000])
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(vol.list_files().unwrap().len(), 4);
        assert_eq!(vol.read_file("t2.dat").unwrap(), vec![2u8; 3000]);
        assert_eq!(vol.statfs().unwrap().used_blocks, 2 + 4 * 3);
    }

    #[test]
    fn test_write_file_replaces() {
        let vol = volume();
        vol.write_file("a.txt", b"first version").unwrap();
        vol.write_file("a.txt", b"second").unwrap();
        assert_eq!(vol.read_file("a.txt").unwrap(), b"second");
        vol.sync().unwrap();
        let sb = vol.into_inner().unwrap();
        assert!(!sb.is_dirty());
    }

    #[test]
    fn test_into_inner_while_shared() {
        let vol = volume();
        let other = vol.clone();
        assert!(matches!(vol.into_inner(), Err(CpmError::Unsupported(_))));
        drop(other);
    }
}
