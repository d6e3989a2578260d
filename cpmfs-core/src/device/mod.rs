//! Device trait - physical sector access for a mounted volume.
//!
//! The filesystem never interprets the container; it only asks for
//! (track, physical sector) reads and writes after skew translation.

mod image;
mod memory;

pub use image::ImageFile;
pub use memory::MemoryDevice;

use crate::error::CpmResult;
use crate::format::Geometry;

/// Sector-addressed storage holding one CP/M volume.
/// Tracks and sectors are 0-based.
pub trait Device: Send {
    /// Tell the device how sectors are laid out.
    fn set_geometry(&mut self, geometry: Geometry) -> CpmResult<()>;

    /// Read one sector into `buf` (exactly one sector long).
    fn read_sector(&mut self, track: u32, sector: u32, buf: &mut [u8]) -> CpmResult<()>;

    /// Write one sector from `data` (exactly one sector long).
    fn write_sector(&mut self, track: u32, sector: u32, data: &[u8]) -> CpmResult<()>;

    /// Push buffered writes to the backing store.
    fn flush(&mut self) -> CpmResult<()> {
        Ok(())
    }
}

impl<D: Device + ?Sized> Device for Box<D> {
    fn set_geometry(&mut self, geometry: Geometry) -> CpmResult<()> {
        (**self).set_geometry(geometry)
    }

    fn read_sector(&mut self, track: u32, sector: u32, buf: &mut [u8]) -> CpmResult<()> {
        (**self).read_sector(track, sector, buf)
    }

    fn write_sector(&mut self, track: u32, sector: u32, data: &[u8]) -> CpmResult<()> {
        (**self).write_sector(track, sector, data)
    }

    fn flush(&mut self) -> CpmResult<()> {
        (**self).flush()
    }
}

/// Byte offset of a sector within a flat image.
pub(crate) fn sector_offset(geometry: &Geometry, track: u32, sector: u32) -> u64 {
    let index = track as u64 * geometry.sectors_per_track as u64 + sector as u64;
    geometry.offset + index * geometry.sector_length as u64
}
