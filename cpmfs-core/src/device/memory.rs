//! In-memory device.

use std::collections::HashSet;

use super::{sector_offset, Device};
use crate::error::{CpmError, CpmResult};
use crate::format::{FormatConfig, Geometry};
use crate::layout::FREE_MARKER;

/// A volume held in a byte vector. Fresh media read as 0xE5.
#[derive(Debug, Clone)]
pub struct MemoryDevice {
    data: Vec<u8>,
    geometry: Option<Geometry>,
    failing: HashSet<(u32, u32)>,
}

impl MemoryDevice {
    /// Blank medium of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![FREE_MARKER; len],
            geometry: None,
            failing: HashSet::new(),
        }
    }

    /// Blank medium large enough for `format`.
    pub fn for_format(format: &FormatConfig) -> Self {
        let len = format.offset as usize
            + format.sector_length * format.sectors_per_track as usize * format.tracks as usize;
        Self::new(len)
    }

    /// Wrap an existing image.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            geometry: None,
            failing: HashSet::new(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Make reads of one sector fail until cleared.
    pub fn inject_read_error(&mut self, track: u32, sector: u32) {
        self.failing.insert((track, sector));
    }

    pub fn clear_read_errors(&mut self) {
        self.failing.clear();
    }

    fn range(&self, track: u32, sector: u32) -> CpmResult<std::ops::Range<usize>> {
        let geometry = self
            .geometry
            .as_ref()
            .ok_or_else(|| CpmError::Device("geometry not set".to_string()))?;
        if sector >= geometry.sectors_per_track || track >= geometry.tracks {
            return Err(CpmError::Device(format!(
                "track {} sector {} out of range",
                track, sector
            )));
        }
        let start = sector_offset(geometry, track, sector) as usize;
        let end = start + geometry.sector_length;
        if end > self.data.len() {
            return Err(CpmError::Device(format!(
                "track {} sector {} beyond end of image",
                track, sector
            )));
        }
        Ok(start..end)
    }
}

impl Device for MemoryDevice {
    fn set_geometry(&mut self, geometry: Geometry) -> CpmResult<()> {
        self.geometry = Some(geometry);
        Ok(())
    }

    fn read_sector(&mut self, track: u32, sector: u32, buf: &mut [u8]) -> CpmResult<()> {
        if self.failing.contains(&(track, sector)) {
            return Err(CpmError::Device(format!(
                "read error at track {} sector {}",
                track, sector
            )));
        }
        let range = self.range(track, sector)?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_sector(&mut self, track: u32, sector: u32, data: &[u8]) -> CpmResult<()> {
        let range = self.range(track, sector)?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }
}
