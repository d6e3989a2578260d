//! Raw image file on the host filesystem.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::{sector_offset, Device};
use crate::error::{CpmError, CpmResult};
use crate::format::Geometry;

/// A flat sector dump, tracks in order, sectors in physical order.
#[derive(Debug)]
pub struct ImageFile {
    file: File,
    geometry: Option<Geometry>,
    writable: bool,
}

impl ImageFile {
    /// Open an existing image.
    pub fn open(path: &Path, writable: bool) -> CpmResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| CpmError::Device(format!("{}: {}", path.display(), e)))?;
        log::debug!("image: opened {} ({})", path.display(), if writable { "rw" } else { "ro" });
        Ok(Self {
            file,
            geometry: None,
            writable,
        })
    }

    /// Create (or truncate) an image file for writing.
    pub fn create(path: &Path) -> CpmResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| CpmError::Device(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            file,
            geometry: None,
            writable: true,
        })
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn seek(&mut self, track: u32, sector: u32) -> CpmResult<usize> {
        let geometry = self
            .geometry
            .ok_or_else(|| CpmError::Device("geometry not set".to_string()))?;
        if sector >= geometry.sectors_per_track || track >= geometry.tracks {
            return Err(CpmError::Device(format!(
                "track {} sector {} out of range",
                track, sector
            )));
        }
        let pos = sector_offset(&geometry, track, sector);
        self.file.seek(SeekFrom::Start(pos)).map_err(device_error)?;
        Ok(geometry.sector_length)
    }
}

fn device_error(e: std::io::Error) -> CpmError {
    CpmError::Device(e.to_string())
}

impl Device for ImageFile {
    fn set_geometry(&mut self, geometry: Geometry) -> CpmResult<()> {
        self.geometry = Some(geometry);
        Ok(())
    }

    fn read_sector(&mut self, track: u32, sector: u32, buf: &mut [u8]) -> CpmResult<()> {
        let len = self.seek(track, sector)?;
        let mut filled = 0;
        // A short image reads as unused space.
        while filled < len {
            let n = self.file.read(&mut buf[filled..len]).map_err(device_error)?;
            if n == 0 {
                buf[filled..len].fill(crate::layout::FREE_MARKER);
                break;
            }
            filled += n;
        }
        Ok(())
    }

    fn write_sector(&mut self, track: u32, sector: u32, data: &[u8]) -> CpmResult<()> {
        if !self.writable {
            return Err(CpmError::ReadOnly("image opened read-only".to_string()));
        }
        let len = self.seek(track, sector)?;
        self.file.write_all(&data[..len]).map_err(device_error)
    }

    fn flush(&mut self) -> CpmResult<()> {
        if self.writable {
            self.file.flush().map_err(device_error)?;
            self.file.sync_data().map_err(device_error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            sector_length: 128,
            sectors_per_track: 2,
            tracks: 2,
            offset: 0,
        }
    }

    #[test]
    fn test_image_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        {
            let mut img = ImageFile::create(&path).unwrap();
            img.set_geometry(geometry()).unwrap();
            img.write_sector(1, 1, &[0x42; 128]).unwrap();
            img.flush().unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 512);

        let mut img = ImageFile::open(&path, false).unwrap();
        img.set_geometry(geometry()).unwrap();
        let mut buf = [0u8; 128];
        img.read_sector(1, 1, &mut buf).unwrap();
        assert_eq!(buf, [0x42; 128]);
    }

    #[test]
    fn test_short_image_reads_free_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.img");
        std::fs::write(&path, [0u8; 64]).unwrap();
        let mut img = ImageFile::open(&path, false).unwrap();
        img.set_geometry(geometry()).unwrap();
        let mut buf = [1u8; 128];
        img.read_sector(0, 0, &mut buf).unwrap();
        assert!(buf[..64].iter().all(|&b| b == 0));
        assert!(buf[64..].iter().all(|&b| b == 0xE5));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.img");
        std::fs::write(&path, [0u8; 512]).unwrap();
        let mut img = ImageFile::open(&path, false).unwrap();
        img.set_geometry(geometry()).unwrap();
        assert!(matches!(img.write_sector(0, 0, &[0; 128]), Err(CpmError::ReadOnly(_))));
    }

    #[test]
    fn test_missing_file_is_device_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ImageFile::open(&dir.path().join("nope.img"), false).unwrap_err();
        assert!(matches!(err, CpmError::Device(msg) if msg.contains("nope.img")));
    }
}
