//! Disk format definitions and the format catalog.
//!
//! A format describes the geometry of the medium (sector length, sectors per
//! track, tracks, reserved boot tracks), the filesystem parameters (block
//! size, directory entries, skew) and the dialect of the directory, encoded as
//! [`FsFlags`]. Formats are resolved by name from a [`FormatCatalog`], which
//! holds a built-in table and may be extended with JSON definitions.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::{CpmError, CpmResult};
use crate::layout::{ENTRY_SIZE, EXTENT_SIZE, RECORD_SIZE};

bitflags! {
    /// Directory dialect features.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FsFlags: u32 {
        /// User numbers up to 31
        const HI_USER = 1 << 0;
        /// CP/M 3 style timestamps in every fourth directory entry
        const CPM3_DATES = 1 << 1;
        /// Passwords and disc label
        const CPM3_OTHER = 1 << 2;
        /// DataStamper timestamps in a side file
        const DS_DATES = 1 << 3;
        /// Reverse exact file size in the last record byte count
        const EXACT_SIZE = 1 << 4;
        /// MP/M style timestamps held in XFCBs
        const MPM_DATES = 1 << 5;
        /// Status bytes 16-31 are XFCBs, not user numbers
        const HAS_XFCBS = 1 << 6;

        const DR22 = Self::HI_USER.bits();
        const P2DOS = Self::CPM3_DATES.bits() | Self::HI_USER.bits();
        const DR3 = Self::CPM3_DATES.bits()
            | Self::CPM3_OTHER.bits()
            | Self::HI_USER.bits()
            | Self::HAS_XFCBS.bits();
        const MPM = Self::MPM_DATES.bits()
            | Self::CPM3_OTHER.bits()
            | Self::HI_USER.bits()
            | Self::HAS_XFCBS.bits();
        const ISX = Self::EXACT_SIZE.bits();
        const ZSYS = Self::HI_USER.bits();
    }
}

impl FsFlags {
    /// Map an `os` keyword of a format definition to its flag set.
    pub fn from_os(os: &str) -> CpmResult<Self> {
        match os.to_ascii_lowercase().as_str() {
            "2.2" => Ok(Self::DR22),
            "3" => Ok(Self::DR3),
            "p2dos" => Ok(Self::P2DOS),
            "mpm" => Ok(Self::MPM),
            "isx" => Ok(Self::ISX),
            "zsys" => Ok(Self::ZSYS),
            other => Err(CpmError::BadGeometry(format!("unknown os type `{}`", other))),
        }
    }

    /// Human readable name of the dialect.
    pub fn dialect(self) -> &'static str {
        if self == Self::DR3 {
            "CP/M Plus"
        } else if self == Self::P2DOS {
            "P2DOS 2.3"
        } else if self == Self::MPM {
            "MP/M II"
        } else if self == Self::ISX {
            "ISX"
        } else if self == Self::DR22 {
            "CP/M 2.2"
        } else {
            "custom"
        }
    }
}

/// Physical geometry handed to a [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sector_length: usize,
    pub sectors_per_track: u32,
    pub tracks: u32,
    /// Byte offset of the first track inside the container.
    pub offset: u64,
}

/// A resolved, immutable disk format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatConfig {
    pub name: String,
    pub sector_length: usize,
    pub sectors_per_track: u32,
    pub tracks: u32,
    pub boot_tracks: u32,
    pub max_dir: usize,
    pub block_size: usize,
    pub skew: u32,
    /// Explicit logical-to-physical sector table; overrides `skew`.
    pub skew_table: Option<Vec<u32>>,
    pub flags: FsFlags,
    pub offset: u64,
    /// Container geometry name for geometry-described images.
    pub libdsk_format: Option<String>,
}

impl FormatConfig {
    /// Create a format with no skew, no offset and the given dialect.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        sector_length: usize,
        sectors_per_track: u32,
        tracks: u32,
        boot_tracks: u32,
        max_dir: usize,
        block_size: usize,
        flags: FsFlags,
    ) -> Self {
        Self {
            name: name.to_string(),
            sector_length,
            sectors_per_track,
            tracks,
            boot_tracks,
            max_dir,
            block_size,
            skew: 1,
            skew_table: None,
            flags,
            offset: 0,
            libdsk_format: None,
        }
    }

    /// Set the skew factor (builder style).
    pub fn with_skew(mut self, skew: u32) -> Self {
        self.skew = skew;
        self
    }

    /// Geometry for the device layer.
    pub fn geometry(&self) -> Geometry {
        Geometry {
            sector_length: self.sector_length,
            sectors_per_track: self.sectors_per_track,
            tracks: self.tracks,
            offset: self.offset,
        }
    }

    /// Bytes in the data area (everything after the boot tracks).
    pub fn data_bytes(&self) -> u64 {
        let data_tracks = self.tracks.saturating_sub(self.boot_tracks) as u64;
        self.sector_length as u64 * self.sectors_per_track as u64 * data_tracks
    }

    /// Number of allocation blocks on the volume.
    pub fn total_blocks(&self) -> usize {
        if self.block_size == 0 {
            return 0;
        }
        (self.data_bytes() / self.block_size as u64) as usize
    }

    /// Blocks reserved for the directory.
    pub fn directory_blocks(&self) -> usize {
        if self.block_size == 0 {
            return 0;
        }
        (self.max_dir * ENTRY_SIZE).div_ceil(self.block_size)
    }

    /// Whether block pointers are stored as 16-bit values.
    pub fn wide_pointers(&self) -> bool {
        self.total_blocks() > 256
    }

    /// Block pointers held by one directory entry.
    pub fn pointers_per_entry(&self) -> usize {
        if self.wide_pointers() {
            8
        } else {
            16
        }
    }

    /// Bytes of file data addressed by one directory entry.
    pub fn entry_capacity(&self) -> usize {
        self.pointers_per_entry() * self.block_size
    }

    /// Logical (16 KiB) extents per physical directory entry.
    pub fn extents_per_entry(&self) -> usize {
        (self.entry_capacity() / EXTENT_SIZE).max(1)
    }

    /// Check the format's invariants.
    pub fn validate(&self) -> CpmResult<()> {
        let bad = |reason: String| Err(CpmError::BadGeometry(reason));

        if self.sector_length == 0 || self.sector_length % RECORD_SIZE != 0 {
            return bad(format!("sector length {} is not a multiple of 128", self.sector_length));
        }
        if self.sectors_per_track == 0 || self.tracks == 0 {
            return bad("no sectors on the medium".to_string());
        }
        if self.boot_tracks >= self.tracks {
            return bad(format!(
                "{} boot tracks leave no data area on {} tracks",
                self.boot_tracks, self.tracks
            ));
        }
        if !self.block_size.is_power_of_two() || !(1024..=16384).contains(&self.block_size) {
            return bad(format!("block size {} is not 1K-16K", self.block_size));
        }
        if self.block_size % self.sector_length != 0 {
            return bad(format!(
                "block size {} is not a multiple of sector length {}",
                self.block_size, self.sector_length
            ));
        }
        if self.max_dir == 0 {
            return bad("no directory entries".to_string());
        }
        let size = self.total_blocks();
        if size == 0 {
            return bad("volume holds no blocks".to_string());
        }
        if size > 0xFFFF {
            return bad(format!("{} blocks exceed 16-bit block pointers", size));
        }
        if self.directory_blocks() >= size {
            return bad(format!(
                "directory of {} entries does not fit a volume of {} blocks",
                self.max_dir, size
            ));
        }
        if self.entry_capacity() < EXTENT_SIZE {
            return bad(format!(
                "{} byte blocks cannot address {} blocks with 16-bit pointers",
                self.block_size, size
            ));
        }
        if let Some(table) = &self.skew_table {
            let n = self.sectors_per_track as usize;
            let mut seen = vec![false; n];
            if table.len() != n {
                return bad(format!("skew table has {} entries, expected {}", table.len(), n));
            }
            for &s in table {
                match seen.get_mut(s as usize) {
                    Some(slot) if !*slot => *slot = true,
                    _ => return bad(format!("skew table is not a permutation (sector {})", s)),
                }
            }
        }
        Ok(())
    }
}

/// A format definition as written in a JSON catalog file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatDef {
    pub name: String,
    pub seclen: usize,
    pub tracks: u32,
    pub sectrk: u32,
    pub blocksize: usize,
    pub maxdir: usize,
    #[serde(default)]
    pub skew: Option<u32>,
    #[serde(default)]
    pub skewtab: Option<Vec<u32>>,
    #[serde(default)]
    pub boottrk: u32,
    #[serde(default = "default_os")]
    pub os: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub libdsk_format: Option<String>,
}

fn default_os() -> String {
    "2.2".to_string()
}

impl TryFrom<FormatDef> for FormatConfig {
    type Error = CpmError;

    fn try_from(def: FormatDef) -> CpmResult<Self> {
        let flags = FsFlags::from_os(&def.os)?;
        let config = FormatConfig {
            name: def.name,
            sector_length: def.seclen,
            sectors_per_track: def.sectrk,
            tracks: def.tracks,
            boot_tracks: def.boottrk,
            max_dir: def.maxdir,
            block_size: def.blocksize,
            skew: def.skew.unwrap_or(1),
            skew_table: def.skewtab,
            flags,
            offset: def.offset,
            libdsk_format: def.libdsk_format,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Named format definitions.
#[derive(Debug, Clone, Default)]
pub struct FormatCatalog {
    formats: BTreeMap<String, FormatConfig>,
}

impl FormatCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding the built-in definitions.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        let defs = [
            FormatConfig::new("ibm-3740", 128, 26, 77, 2, 64, 1024, FsFlags::DR22).with_skew(6),
            FormatConfig::new("4mb-hd", 128, 32, 1024, 0, 256, 2048, FsFlags::P2DOS),
            FormatConfig::new("pcw", 512, 9, 40, 1, 64, 1024, FsFlags::DR3),
            FormatConfig::new("cpcsys", 512, 9, 40, 2, 64, 1024, FsFlags::DR3),
            FormatConfig::new("cpcdata", 512, 9, 40, 0, 64, 1024, FsFlags::DR3),
            FormatConfig::new("kpii", 512, 10, 40, 1, 64, 1024, FsFlags::DR22).with_skew(0),
            FormatConfig::new("p112", 512, 18, 160, 2, 256, 2048, FsFlags::DR3),
        ];
        for def in defs {
            catalog.insert(def);
        }
        catalog
    }

    /// Add or replace a definition.
    pub fn insert(&mut self, config: FormatConfig) {
        self.formats.insert(config.name.clone(), config);
    }

    /// Load JSON definitions (a single object or an array of objects).
    pub fn load_json<R: Read>(&mut self, reader: R) -> CpmResult<usize> {
        let value: serde_json::Value = serde_json::from_reader(reader)?;
        let defs = normalize_definitions(value)?;
        let count = defs.len();
        for def in defs {
            let config = FormatConfig::try_from(def)?;
            log::debug!("catalog: loaded format {}", config.name);
            self.insert(config);
        }
        Ok(count)
    }

    /// Load JSON definitions from a file.
    pub fn load_path(&mut self, path: &Path) -> CpmResult<usize> {
        let file = std::fs::File::open(path)?;
        self.load_json(std::io::BufReader::new(file))
    }

    /// Look up a format by name.
    pub fn resolve(&self, name: &str) -> CpmResult<FormatConfig> {
        self.formats
            .get(name)
            .cloned()
            .ok_or_else(|| CpmError::UnknownFormat(name.to_string()))
    }

    /// Infer the format of a device.
    ///
    /// Auto-detection is not implemented; callers must name the format.
    pub fn probe(&self, _device: &mut dyn Device) -> CpmResult<FormatConfig> {
        Err(CpmError::Unsupported("format auto-detection".to_string()))
    }

    /// All known format names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.formats.keys().map(|s| s.as_str())
    }
}

/// Accept one definition or an array of definitions.
fn normalize_definitions(data: serde_json::Value) -> CpmResult<Vec<FormatDef>> {
    if data.is_array() {
        Ok(serde_json::from_value::<Vec<FormatDef>>(data)?)
    } else {
        Ok(vec![serde_json::from_value::<FormatDef>(data)?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    #[test]
    fn test_builtin_formats_are_valid() {
        let catalog = FormatCatalog::builtin();
        for name in catalog.names() {
            let fmt = catalog.resolve(name).unwrap();
            fmt.validate().unwrap_or_else(|e| panic!("{}: {}", name, e));
        }
    }

    #[test]
    fn test_ibm_3740_derived_values() {
        let fmt = FormatCatalog::builtin().resolve("ibm-3740").unwrap();
        assert_eq!(fmt.total_blocks(), 243);
        assert_eq!(fmt.directory_blocks(), 2);
        assert!(!fmt.wide_pointers());
        assert_eq!(fmt.extents_per_entry(), 1);
    }

    #[test]
    fn test_p112_uses_wide_pointers() {
        let fmt = FormatCatalog::builtin().resolve("p112").unwrap();
        assert_eq!(fmt.total_blocks(), 711);
        assert!(fmt.wide_pointers());
        assert_eq!(fmt.entry_capacity(), 16384);
        assert_eq!(fmt.extents_per_entry(), 1);
    }

    #[test]
    fn test_unknown_format() {
        let err = FormatCatalog::builtin().resolve("nope").unwrap_err();
        assert!(matches!(err, CpmError::UnknownFormat(name) if name == "nope"));
    }

    #[test]
    fn test_probe_is_unsupported() {
        let catalog = FormatCatalog::builtin();
        let fmt = catalog.resolve("ibm-3740").unwrap();
        let mut dev = MemoryDevice::for_format(&fmt);
        assert!(matches!(catalog.probe(&mut dev), Err(CpmError::Unsupported(_))));
    }

    #[test]
    fn test_load_json_single_and_array() {
        let mut catalog = FormatCatalog::new();
        let single = r#"{ "name": "tiny", "seclen": 128, "tracks": 40, "sectrk": 16,
                          "blocksize": 1024, "maxdir": 32, "boottrk": 1 }"#;
        assert_eq!(catalog.load_json(single.as_bytes()).unwrap(), 1);
        let tiny = catalog.resolve("tiny").unwrap();
        assert_eq!(tiny.flags, FsFlags::DR22);
        assert_eq!(tiny.skew, 1);

        let array = r#"[
            { "name": "a", "seclen": 512, "tracks": 80, "sectrk": 9, "blocksize": 2048,
              "maxdir": 128, "os": "3", "skewtab": [0,2,4,6,8,1,3,5,7] },
            { "name": "b", "seclen": 256, "tracks": 77, "sectrk": 26, "blocksize": 2048,
              "maxdir": 128, "os": "mpm", "offset": 4096, "libdskFormat": "ibm8" }
        ]"#;
        assert_eq!(catalog.load_json(array.as_bytes()).unwrap(), 2);
        let b = catalog.resolve("b").unwrap();
        assert_eq!(b.flags, FsFlags::MPM);
        assert_eq!(b.offset, 4096);
        assert_eq!(b.libdsk_format.as_deref(), Some("ibm8"));
        assert_eq!(catalog.resolve("a").unwrap().skew_table.unwrap().len(), 9);
    }

    #[test]
    fn test_load_json_rejects_bad_definitions() {
        let mut catalog = FormatCatalog::new();
        let bad_os = r#"{ "name": "x", "seclen": 128, "tracks": 77, "sectrk": 26,
                          "blocksize": 1024, "maxdir": 64, "os": "dos" }"#;
        assert!(matches!(catalog.load_json(bad_os.as_bytes()), Err(CpmError::BadGeometry(_))));

        let bad_skew = r#"{ "name": "x", "seclen": 128, "tracks": 77, "sectrk": 4,
                            "blocksize": 1024, "maxdir": 64, "skewtab": [0,1,1,2] }"#;
        assert!(matches!(catalog.load_json(bad_skew.as_bytes()), Err(CpmError::BadGeometry(_))));

        assert!(matches!(catalog.load_json("not json".as_bytes()), Err(CpmError::Json(_))));
    }

    #[test]
    fn test_validate_geometry() {
        let ok = FormatConfig::new("t", 128, 26, 77, 2, 64, 1024, FsFlags::DR22);
        assert!(ok.validate().is_ok());

        let mut no_data = ok.clone();
        no_data.boot_tracks = 77;
        assert!(matches!(no_data.validate(), Err(CpmError::BadGeometry(_))));

        let mut odd_block = ok.clone();
        odd_block.block_size = 1536;
        assert!(matches!(odd_block.validate(), Err(CpmError::BadGeometry(_))));

        let mut huge_dir = ok.clone();
        huge_dir.max_dir = 243 * 32;
        assert!(matches!(huge_dir.validate(), Err(CpmError::BadGeometry(_))));

        // 1K blocks on a volume that needs 16-bit pointers
        let big = FormatConfig::new("t", 512, 18, 80, 0, 64, 1024, FsFlags::DR22);
        assert!(matches!(big.validate(), Err(CpmError::BadGeometry(_))));
    }

    #[test]
    fn test_os_flags() {
        assert_eq!(FsFlags::from_os("3").unwrap(), FsFlags::DR3);
        assert_eq!(FsFlags::from_os("P2DOS").unwrap(), FsFlags::P2DOS);
        assert!(FsFlags::DR3.contains(FsFlags::HAS_XFCBS));
        assert_eq!(FsFlags::DR3.dialect(), "CP/M Plus");
    }
}
