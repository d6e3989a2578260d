//! Sector skew and block addressing.

use crate::device::Device;
use crate::error::{CpmError, CpmResult};
use crate::format::FormatConfig;

/// Build the interleave permutation for `sectors` sectors per track.
///
/// Logical sector `i+1` lands `skew` physical sectors after logical sector
/// `i`; a collision with an already placed sector moves on to the next
/// free physical slot. Skew 0 and 1 both yield the identity.
pub fn build_skew_table(sectors: u32, skew: u32) -> Vec<u32> {
    let n = sectors as usize;
    let mut table = Vec::with_capacity(n);
    let mut used = vec![false; n];
    let mut j = 0u32;
    for _ in 0..n {
        while used[j as usize] {
            j = (j + 1) % sectors;
        }
        table.push(j);
        used[j as usize] = true;
        j = (j + skew) % sectors;
    }
    table
}

/// Maps allocation blocks to (track, physical sector) pairs.
#[derive(Debug, Clone)]
pub struct SectorMap {
    table: Vec<u32>,
    sectors_per_track: u32,
    boot_tracks: u32,
    sector_length: usize,
    block_size: usize,
}

impl SectorMap {
    pub fn new(format: &FormatConfig) -> Self {
        let table = match &format.skew_table {
            Some(explicit) => explicit.clone(),
            None => build_skew_table(format.sectors_per_track, format.skew),
        };
        Self {
            table,
            sectors_per_track: format.sectors_per_track,
            boot_tracks: format.boot_tracks,
            sector_length: format.sector_length,
            block_size: format.block_size,
        }
    }

    /// Physical sector holding logical sector `logical` of a data track.
    pub fn physical_sector(&self, logical: u32) -> u32 {
        self.table[(logical % self.sectors_per_track) as usize]
    }

    pub fn table(&self) -> &[u32] {
        &self.table
    }

    pub fn sectors_per_block(&self) -> usize {
        self.block_size / self.sector_length
    }

    /// Location of sector `index` of `block`.
    pub fn locate(&self, block: u16, index: usize) -> (u32, u32) {
        let logical = block as u64 * self.sectors_per_block() as u64
            + index as u64
            + self.boot_tracks as u64 * self.sectors_per_track as u64;
        let track = (logical / self.sectors_per_track as u64) as u32;
        let sector = self.physical_sector((logical % self.sectors_per_track as u64) as u32);
        (track, sector)
    }

    /// Read sectors `from..to` of `block` into `buf` (block-sized).
    pub fn read_sectors<D: Device + ?Sized>(
        &self,
        device: &mut D,
        block: u16,
        buf: &mut [u8],
        from: usize,
        to: usize,
    ) -> CpmResult<()> {
        self.check(buf.len(), from, to)?;
        for index in from..to {
            let (track, sector) = self.locate(block, index);
            log::trace!("read block {} -> track {} sector {}", block, track, sector);
            let at = index * self.sector_length;
            device.read_sector(track, sector, &mut buf[at..at + self.sector_length])?;
        }
        Ok(())
    }

    /// Write sectors `from..to` of `block` from `data` (block-sized).
    pub fn write_sectors<D: Device + ?Sized>(
        &self,
        device: &mut D,
        block: u16,
        data: &[u8],
        from: usize,
        to: usize,
    ) -> CpmResult<()> {
        self.check(data.len(), from, to)?;
        for index in from..to {
            let (track, sector) = self.locate(block, index);
            log::trace!("write block {} -> track {} sector {}", block, track, sector);
            let at = index * self.sector_length;
            device.write_sector(track, sector, &data[at..at + self.sector_length])?;
        }
        Ok(())
    }

    pub fn read_block<D: Device + ?Sized>(
        &self,
        device: &mut D,
        block: u16,
        buf: &mut [u8],
    ) -> CpmResult<()> {
        self.read_sectors(device, block, buf, 0, self.sectors_per_block())
    }

    pub fn write_block<D: Device + ?Sized>(
        &self,
        device: &mut D,
        block: u16,
        data: &[u8],
    ) -> CpmResult<()> {
        self.write_sectors(device, block, data, 0, self.sectors_per_block())
    }

    fn check(&self, len: usize, from: usize, to: usize) -> CpmResult<()> {
        if len < self.block_size || from > to || to > self.sectors_per_block() {
            return Err(CpmError::Corrupt(format!(
                "bad block transfer: {} bytes, sectors {}..{}",
                len, from, to
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::format::{FormatCatalog, FsFlags};

    fn is_permutation(table: &[u32]) -> bool {
        let mut seen = vec![false; table.len()];
        table.iter().all(|&s| {
            let fresh = !seen[s as usize];
            seen[s as usize] = true;
            fresh
        })
    }

    #[test]
    fn test_skew_is_bijection() {
        for sectors in 1..=40 {
            for skew in 0..=sectors + 2 {
                let table = build_skew_table(sectors, skew);
                assert_eq!(table.len(), sectors as usize);
                assert!(is_permutation(&table), "sectors {} skew {}", sectors, skew);
            }
        }
    }

    #[test]
    fn test_ibm_3740_skew() {
        let table = build_skew_table(26, 6);
        assert_eq!(
            &table[..13],
            &[0, 6, 12, 18, 24, 4, 10, 16, 22, 2, 8, 14, 20]
        );
        assert_eq!(table[13], 1);
    }

    #[test]
    fn test_identity() {
        assert_eq!(build_skew_table(9, 1), (0..9).collect::<Vec<_>>());
        assert_eq!(build_skew_table(9, 0), (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn test_collision_scan() {
        // stride 2 over 4 sectors returns to 0 after two steps
        assert_eq!(build_skew_table(4, 2), vec![0, 2, 1, 3]);
    }

    #[test]
    fn test_locate_skips_boot_tracks() {
        let fmt = FormatCatalog::builtin().resolve("ibm-3740").unwrap();
        let map = SectorMap::new(&fmt);
        assert_eq!(map.sectors_per_block(), 8);
        assert_eq!(map.locate(0, 0), (2, 0));
        assert_eq!(map.locate(0, 1), (2, 6));
        // block 3 sector 2 is logical sector 26 of data area -> track 3
        assert_eq!(map.locate(3, 2), (3, 0));
    }

    #[test]
    fn test_explicit_table() {
        let mut fmt = FormatConfig::new("t", 512, 4, 10, 0, 16, 1024, FsFlags::DR22);
        fmt.skew_table = Some(vec![3, 2, 1, 0]);
        let map = SectorMap::new(&fmt);
        assert_eq!(map.locate(0, 0), (0, 3));
        assert_eq!(map.locate(0, 1), (0, 2));
        assert_eq!(map.locate(1, 0), (0, 1));
    }

    #[test]
    fn test_block_round_trip() {
        let fmt = FormatCatalog::builtin().resolve("ibm-3740").unwrap();
        let map = SectorMap::new(&fmt);
        let mut dev = MemoryDevice::for_format(&fmt);
        dev.set_geometry(fmt.geometry()).unwrap();

        let data: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        map.write_block(&mut dev, 5, &data).unwrap();
        let mut back = vec![0u8; 1024];
        map.read_block(&mut dev, 5, &mut back).unwrap();
        assert_eq!(back, data);

        let mut short = vec![0u8; 100];
        assert!(map.read_block(&mut dev, 5, &mut short).is_err());
    }
}
