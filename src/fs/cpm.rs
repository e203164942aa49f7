//! CP/M 2.2 filesystem (Amstrad CPC/PCW, Spectrum +3, Kaypro, Osborne, QX-10, 8" SSSD)

use crate::disk::{Disk, SideMode};
use crate::error::{FloppyError, Result};
use crate::fs::{flat_only, split_parent, Blocks, DirEntry, FileAttributes, FilesystemDriver, FsInfo, SectorMap, Volume};
use std::collections::BTreeMap;

/// CP/M disk parameter block, plus the physical details CP/M keeps in its BIOS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskParameterBlock {
    /// Preset name
    pub name: &'static str,
    /// Physical sectors per logical track
    pub sectors_per_track: u16,
    /// Block shift (3=1024, 4=2048, 5=4096)
    pub block_shift: u8,
    /// Extent mask
    pub extent_mask: u8,
    /// Highest allocation block number (DSM)
    pub max_blocks: u16,
    /// Highest directory entry number (DRM)
    pub max_dir_entries: u16,
    /// Reserved logical tracks before the directory (OFF)
    pub reserved_tracks: u8,
    /// Software sector skew (1 = none)
    pub skew: u8,
}

impl DiskParameterBlock {
    /// Get the block size in bytes
    pub fn block_size(&self) -> usize {
        128 << self.block_shift
    }

    /// Amstrad CPC data format
    pub fn amstrad_data() -> Self {
        Self {
            name: "cpc-data",
            sectors_per_track: 9,
            block_shift: 3,
            extent_mask: 0,
            max_blocks: 179,
            max_dir_entries: 63,
            reserved_tracks: 0,
            skew: 1,
        }
    }

    /// Amstrad CPC system format
    pub fn amstrad_system() -> Self {
        Self {
            name: "cpc-system",
            max_blocks: 170,
            reserved_tracks: 2,
            ..Self::amstrad_data()
        }
    }

    /// Spectrum +3 / PCW single sided
    pub fn spectrum_plus3() -> Self {
        Self {
            name: "plus3",
            max_blocks: 174,
            reserved_tracks: 1,
            ..Self::amstrad_data()
        }
    }

    /// Kaypro II
    pub fn kaypro() -> Self {
        Self {
            name: "kaypro",
            sectors_per_track: 10,
            block_shift: 3,
            extent_mask: 0,
            max_blocks: 194,
            max_dir_entries: 63,
            reserved_tracks: 1,
            skew: 1,
        }
    }

    /// Osborne 1 single density
    pub fn osborne() -> Self {
        Self {
            name: "osborne",
            sectors_per_track: 10,
            block_shift: 3,
            extent_mask: 0,
            max_blocks: 91,
            max_dir_entries: 63,
            reserved_tracks: 3,
            skew: 1,
        }
    }

    /// Epson QX-10
    pub fn qx10() -> Self {
        Self {
            name: "qx10",
            sectors_per_track: 16,
            block_shift: 4,
            extent_mask: 0,
            max_blocks: 155,
            max_dir_entries: 127,
            reserved_tracks: 2,
            skew: 1,
        }
    }

    /// IBM 3740 8" single sided single density
    pub fn ibm_3740() -> Self {
        Self {
            name: "ibm-3740",
            sectors_per_track: 26,
            block_shift: 3,
            extent_mask: 0,
            max_blocks: 242,
            max_dir_entries: 63,
            reserved_tracks: 2,
            skew: 6,
        }
    }

    /// Parameters from an Amstrad PCW/+3 disk specification block (track 0 sector 0)
    pub fn from_spec_block(block: &[u8]) -> Option<Self> {
        if block.len() < 10 || !matches!(block[0], 0 | 3) || block[..10].iter().all(|&b| b == block[0]) {
            return None;
        }
        let sides = if block[1] & 0x03 == 0 { 1 } else { 2 };
        let tracks = block[2] as usize;
        let spt = block[3] as usize;
        let sector_size = 128usize.checked_shl(block[4] as u32)?;
        let reserved = block[5];
        let bsh = block[6];
        let dir_blocks = block[7] as usize;
        if !(1..=86).contains(&tracks) || !(1..=26).contains(&spt) || !(3..=6).contains(&bsh) || sector_size > 8192 {
            return None;
        }
        let block_size = 128usize << bsh;
        let usable = (tracks * sides).checked_sub(reserved as usize)? * spt * sector_size;
        let blocks = usable / block_size;
        Some(Self {
            name: "spec-block",
            sectors_per_track: spt as u16,
            block_shift: bsh,
            extent_mask: if blocks > 256 { (block_size / 2048).saturating_sub(1) as u8 } else { (block_size / 1024).saturating_sub(1) as u8 },
            max_blocks: blocks.checked_sub(1)? as u16,
            max_dir_entries: (dir_blocks * block_size / 32).checked_sub(1)? as u16,
            reserved_tracks: reserved,
            skew: 1,
        })
    }

    /// Every built-in preset
    pub fn presets() -> Vec<Self> {
        vec![
            Self::amstrad_data(),
            Self::amstrad_system(),
            Self::spectrum_plus3(),
            Self::kaypro(),
            Self::osborne(),
            Self::qx10(),
            Self::ibm_3740(),
        ]
    }

    /// Pick parameters for a disk from its layout
    pub fn for_disk(disk: &Disk) -> Option<Self> {
        let track = disk.track(0, 0)?;
        let first = track.sectors_by_id().first().map(|s| (s.id.sector, s.data().len()))?;
        let spt = track.sector_count();
        let heads = disk.head_count();
        match (first.0, first.1, spt, heads) {
            (0xC1, 512, 9, _) => Some(Self::amstrad_data()),
            (0x41, 512, 9, _) => Some(Self::amstrad_system()),
            (0x01, 512, 9, _) => Some(
                disk.read_sector(0, 0, 1)
                    .ok()
                    .and_then(Self::from_spec_block)
                    .unwrap_or_else(Self::spectrum_plus3),
            ),
            (0x00, 512, 10, 1) => Some(Self::kaypro()),
            (_, 256, 10, 1) => Some(Self::osborne()),
            (_, 256, 16, 2) => Some(Self::qx10()),
            (0x01, 128, 26, 1) => Some(Self::ibm_3740()),
            _ => None,
        }
    }

    /// Physical sector index for a logical sector within a track
    fn translate(&self, logical: usize) -> usize {
        let spt = self.sectors_per_track as usize;
        if self.skew <= 1 || spt == 0 {
            return logical;
        }
        let mut used = vec![false; spt];
        let mut pos = 0;
        let mut physical = 0;
        for i in 0..=logical.min(spt - 1) {
            while used[pos] {
                pos = (pos + 1) % spt;
            }
            used[pos] = true;
            physical = pos;
            if i < logical {
                pos = (pos + self.skew as usize) % spt;
            }
        }
        physical
    }
}

/// CP/M directory entry (32 bytes)
#[derive(Debug, Clone)]
struct CpmDirEntry {
    user: u8,
    filename: [u8; 8],
    extension: [u8; 3],
    extent_low: u8,
    extent_high: u8,
    record_count: u8,
    allocation: [u8; 16],
}

impl CpmDirEntry {
    /// Parse a directory entry from 32 bytes; None for free or non-file slots
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 32 || data[0] > 15 {
            return None;
        }
        let mut filename = [0u8; 8];
        let mut extension = [0u8; 3];
        let mut allocation = [0u8; 16];
        filename.copy_from_slice(&data[1..9]);
        extension.copy_from_slice(&data[9..12]);
        allocation.copy_from_slice(&data[16..32]);
        Some(Self {
            user: data[0],
            filename,
            extension,
            extent_low: data[12],
            extent_high: data[14],
            record_count: data[15],
            allocation,
        })
    }

    fn is_plausible(&self, dpb: &DiskParameterBlock) -> bool {
        let printable = |b: &u8| (0x20..0x7F).contains(&(b & 0x7F));
        self.filename.iter().all(printable)
            && self.extension.iter().all(printable)
            && self.filename[0] & 0x7F != b' '
            && self.extent_low < 32
            && self.record_count <= 0x80
            && self.blocks(dpb).iter().all(|&b| b <= dpb.max_blocks)
    }

    /// Get the full filename as a string
    fn filename_str(&self) -> String {
        let name = crate::fs::padded_str(&self.filename);
        let ext = crate::fs::padded_str(&self.extension);
        let base = if ext.is_empty() { name } else { format!("{}.{}", name, ext) };
        if self.user == 0 {
            base
        } else {
            format!("{}:{}", self.user, base)
        }
    }

    fn attributes(&self) -> FileAttributes {
        FileAttributes {
            read_only: self.extension[0] & 0x80 != 0,
            system: self.extension[1] & 0x80 != 0,
            archive: self.extension[2] & 0x80 != 0,
            hidden: false,
        }
    }

    /// Get the extent number
    fn extent_number(&self) -> u16 {
        ((self.extent_high as u16) << 5) | (self.extent_low as u16 & 0x1F)
    }

    /// Records covered by this entry
    fn records(&self, dpb: &DiskParameterBlock) -> usize {
        (self.extent_low & dpb.extent_mask) as usize * 128 + self.record_count as usize
    }

    /// Extract allocation blocks from the entry
    fn blocks(&self, dpb: &DiskParameterBlock) -> Vec<u16> {
        if dpb.max_blocks < 256 {
            self.allocation.iter().filter(|&&b| b != 0).map(|&b| b as u16).collect()
        } else {
            self.allocation
                .chunks_exact(2)
                .map(|p| u16::from_le_bytes([p[0], p[1]]))
                .filter(|&b| b != 0)
                .collect()
        }
    }
}

/// Mounted CP/M volume
pub struct CpmVolume<'a> {
    blocks: Blocks<'a>,
    dpb: DiskParameterBlock,
    sector_size: usize,
    directory: Vec<CpmDirEntry>,
}

impl<'a> CpmVolume<'a> {
    /// Mount with explicit parameters
    pub fn new(disk: &'a Disk, dpb: DiskParameterBlock) -> Result<Self> {
        let blocks = Blocks::new(disk, SectorMap::linear(disk, SideMode::Alternate));
        let sector_size = blocks.sector(0)?.len();
        if dpb.block_size() % sector_size != 0 {
            return Err(FloppyError::invalid_arg(format!(
                "block size {} is not a multiple of the {} byte sector",
                dpb.block_size(),
                sector_size
            )));
        }
        let mut volume = Self {
            blocks,
            dpb,
            sector_size,
            directory: Vec::new(),
        };
        volume.directory = volume.read_directory()?;
        Ok(volume)
    }

    /// Mount, choosing parameters from the disk layout
    pub fn open(disk: &'a Disk) -> Result<Self> {
        let dpb = DiskParameterBlock::for_disk(disk)
            .ok_or_else(|| FloppyError::invalid_format("no CP/M parameters match this layout"))?;
        Self::new(disk, dpb)
    }

    /// Disk parameters in use
    pub fn dpb(&self) -> &DiskParameterBlock {
        &self.dpb
    }

    fn lba(&self, record_sector: usize) -> usize {
        let spt = self.dpb.sectors_per_track as usize;
        let track = record_sector / spt + self.dpb.reserved_tracks as usize;
        track * spt + self.dpb.translate(record_sector % spt)
    }

    fn read_block(&self, block: u16) -> Result<Vec<u8>> {
        let per_block = self.dpb.block_size() / self.sector_size;
        let mut out = Vec::with_capacity(self.dpb.block_size());
        for i in 0..per_block {
            out.extend_from_slice(self.blocks.sector(self.lba(block as usize * per_block + i))?);
        }
        Ok(out)
    }

    fn read_directory(&self) -> Result<Vec<CpmDirEntry>> {
        let bytes = (self.dpb.max_dir_entries as usize + 1) * 32;
        let mut raw = Vec::with_capacity(bytes);
        let mut block = 0u16;
        while raw.len() < bytes {
            raw.extend(self.read_block(block)?);
            block += 1;
        }
        Ok(raw[..bytes].chunks_exact(32).filter_map(CpmDirEntry::parse).collect())
    }

    /// Directory blocks reserved at the start of the data area
    fn directory_blocks(&self) -> usize {
        ((self.dpb.max_dir_entries as usize + 1) * 32).div_ceil(self.dpb.block_size())
    }

    /// Merge extents for files that span multiple directory entries
    fn merge_extents(&self) -> BTreeMap<String, Vec<&CpmDirEntry>> {
        let mut files: BTreeMap<String, Vec<&CpmDirEntry>> = BTreeMap::new();
        for entry in &self.directory {
            files.entry(entry.filename_str()).or_default().push(entry);
        }
        for extents in files.values_mut() {
            extents.sort_by_key(|e| e.extent_number());
        }
        files
    }

    fn valid_entries(&self) -> (usize, usize) {
        let valid = self.directory.iter().filter(|e| e.is_plausible(&self.dpb)).count();
        (valid, self.directory.len() - valid)
    }
}

impl Volume for CpmVolume<'_> {
    fn stat_fs(&self) -> FsInfo {
        let used: usize = self.directory.iter().map(|e| e.blocks(&self.dpb).len()).sum();
        let total = self.dpb.max_blocks as usize + 1;
        FsInfo {
            fs_type: "CP/M".to_string(),
            volume_name: String::new(),
            block_size: self.dpb.block_size(),
            total_blocks: total,
            free_blocks: total.saturating_sub(used + self.directory_blocks()),
        }
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        flat_only(path)?;
        Ok(self
            .merge_extents()
            .into_iter()
            .map(|(name, extents)| {
                let records: usize = extents.iter().map(|e| e.records(&self.dpb)).sum();
                let mut entry = DirEntry::file(name, records as u64 * 128);
                if let Some(first) = extents.first() {
                    entry.attributes = first.attributes();
                }
                entry
            })
            .collect())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let (parent, name) = split_parent(path)?;
        flat_only(parent)?;
        let files = self.merge_extents();
        let extents = files
            .iter()
            .find(|(n, _)| crate::fs::names_match(n, name))
            .map(|(_, e)| e)
            .ok_or_else(|| FloppyError::NotFound(path.to_string()))?;

        let mut data = Vec::new();
        let mut size = 0;
        for extent in extents {
            for block in extent.blocks(&self.dpb) {
                if block > self.dpb.max_blocks {
                    return Err(FloppyError::corrupt(format!("{}: block {} beyond DSM", path, block)));
                }
                data.extend(self.read_block(block)?);
            }
            size += extent.records(&self.dpb) * 128;
        }
        data.truncate(size);
        Ok(data)
    }
}

/// CP/M driver
#[derive(Debug, Clone, Copy, Default)]
pub struct CpmDriver;

impl FilesystemDriver for CpmDriver {
    fn name(&self) -> &'static str {
        "cpm"
    }

    fn probe(&self, disk: &Disk) -> u8 {
        let Ok(volume) = CpmVolume::open(disk) else {
            return 0;
        };
        match volume.valid_entries() {
            (0, _) => 0,
            (_, bad) if bad > 0 => 10,
            _ if volume.dpb.name.starts_with("cpc") => 75,
            _ => 60,
        }
    }

    fn mount<'a>(&self, disk: &'a Disk) -> Result<Box<dyn Volume + 'a>> {
        Ok(Box::new(CpmVolume::open(disk)?))
    }
}
