//! FAT12/FAT16 (PC, Atari ST, MSX, PC-98, X68000, FM Towns)
//!
//! Supports subdirectories, VFAT long file names on read, and writing
//! files with 8.3 names into an existing directory.

use crate::disk::{Disk, Geometry};
use crate::error::{FloppyError, Result};
use crate::fs::{
    components, names_match, split_parent, Blocks, DirEntry, EntryKind, FileAttributes,
    FilesystemDriver, FsInfo, Volume, WritePlan,
};
use crate::io::{le16, le32};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

const ATTR_READ_ONLY: u8 = 0x01;
const ATTR_HIDDEN: u8 = 0x02;
const ATTR_SYSTEM: u8 = 0x04;
const ATTR_VOLUME: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_ARCHIVE: u8 = 0x20;
const ATTR_LFN: u8 = 0x0F;

/// Cluster count at which a volume becomes FAT16
const FAT16_MIN_CLUSTERS: usize = 4085;

/// BIOS parameter block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bpb {
    /// Bytes per logical sector
    pub bytes_per_sector: u16,
    /// Sectors per cluster
    pub sectors_per_cluster: u8,
    /// Reserved sectors before the first FAT
    pub reserved_sectors: u16,
    /// Number of FAT copies
    pub fat_count: u8,
    /// Root directory entries
    pub root_entries: u16,
    /// Total logical sectors
    pub total_sectors: u32,
    /// Media descriptor
    pub media: u8,
    /// Sectors per FAT
    pub sectors_per_fat: u16,
    /// Sectors per track
    pub sectors_per_track: u16,
    /// Heads
    pub heads: u16,
}

impl Bpb {
    /// Parse the BPB from a boot sector
    pub fn parse(boot: &[u8]) -> Option<Self> {
        if boot.len() < 32 {
            return None;
        }
        let small_total = le16(boot, 0x13) as u32;
        let bpb = Self {
            bytes_per_sector: le16(boot, 0x0B),
            sectors_per_cluster: boot[0x0D],
            reserved_sectors: le16(boot, 0x0E),
            fat_count: boot[0x10],
            root_entries: le16(boot, 0x11),
            total_sectors: if small_total == 0 { le32(boot, 0x20) } else { small_total },
            media: boot[0x15],
            sectors_per_fat: le16(boot, 0x16),
            sectors_per_track: le16(boot, 0x18),
            heads: le16(boot, 0x1A),
        };
        bpb.is_valid().then_some(bpb)
    }

    /// Standard BPB for a geometry
    pub fn for_geometry(geometry: &Geometry) -> Self {
        let total = geometry.cylinders as u32 * geometry.heads as u32 * geometry.sectors_per_track as u32;
        let (spc, root, media, spf) = match (geometry.cylinders, geometry.heads, geometry.sectors_per_track) {
            (40, 2, 9) => (2, 112, 0xFD, 2),
            (80, 2, 9) => (2, 112, 0xF9, 3),
            (80, 2, 15) => (1, 224, 0xF9, 7),
            (80, 2, 18) => (1, 224, 0xF0, 9),
            _ => {
                let clusters = total / 2;
                let spf = (clusters * 3 / 2).div_ceil(geometry.sector_size as u32) + 1;
                (2, 112, 0xF8, spf as u16)
            }
        };
        Self {
            bytes_per_sector: geometry.sector_size,
            sectors_per_cluster: spc,
            reserved_sectors: 1,
            fat_count: 2,
            root_entries: root,
            total_sectors: total,
            media,
            sectors_per_fat: spf,
            sectors_per_track: geometry.sectors_per_track as u16,
            heads: geometry.heads as u16,
        }
    }

    fn is_valid(&self) -> bool {
        self.bytes_per_sector.is_power_of_two()
            && (128..=4096).contains(&self.bytes_per_sector)
            && self.sectors_per_cluster.is_power_of_two()
            && self.reserved_sectors >= 1
            && (1..=2).contains(&self.fat_count)
            && self.root_entries > 0
            && self.sectors_per_fat > 0
            && self.total_sectors > self.data_start() as u32
    }

    /// Write the BPB fields into a boot sector
    pub fn write(&self, boot: &mut [u8]) {
        boot[0x0B..0x0D].copy_from_slice(&self.bytes_per_sector.to_le_bytes());
        boot[0x0D] = self.sectors_per_cluster;
        boot[0x0E..0x10].copy_from_slice(&self.reserved_sectors.to_le_bytes());
        boot[0x10] = self.fat_count;
        boot[0x11..0x13].copy_from_slice(&self.root_entries.to_le_bytes());
        let small = u16::try_from(self.total_sectors).unwrap_or(0);
        boot[0x13..0x15].copy_from_slice(&small.to_le_bytes());
        boot[0x15] = self.media;
        boot[0x16..0x18].copy_from_slice(&self.sectors_per_fat.to_le_bytes());
        boot[0x18..0x1A].copy_from_slice(&self.sectors_per_track.to_le_bytes());
        boot[0x1A..0x1C].copy_from_slice(&self.heads.to_le_bytes());
        if small == 0 {
            boot[0x20..0x24].copy_from_slice(&self.total_sectors.to_le_bytes());
        }
    }

    /// First sector of the root directory
    pub fn root_start(&self) -> usize {
        self.reserved_sectors as usize + self.fat_count as usize * self.sectors_per_fat as usize
    }

    /// Sectors occupied by the root directory
    pub fn root_sectors(&self) -> usize {
        (self.root_entries as usize * 32).div_ceil(self.bytes_per_sector as usize)
    }

    /// First data sector (cluster 2)
    pub fn data_start(&self) -> usize {
        self.root_start() + self.root_sectors()
    }

    /// Data clusters on the volume
    pub fn cluster_count(&self) -> usize {
        (self.total_sectors as usize).saturating_sub(self.data_start()) / self.sectors_per_cluster.max(1) as usize
    }

    /// Check if the FAT uses 16-bit entries
    pub fn is_fat16(&self) -> bool {
        self.cluster_count() >= FAT16_MIN_CLUSTERS
    }

    /// Bytes per cluster
    pub fn cluster_bytes(&self) -> usize {
        self.bytes_per_sector as usize * self.sectors_per_cluster as usize
    }

    fn end_of_chain(&self) -> u32 {
        if self.is_fat16() {
            0xFFF8
        } else {
            0xFF8
        }
    }
}

/// Short name checksum stored in every long-name slot
pub fn lfn_checksum(short: &[u8]) -> u8 {
    short[..11]
        .iter()
        .fold(0u8, |sum, &c| (if sum & 1 != 0 { 0x80u8 } else { 0 }).wrapping_add(sum >> 1).wrapping_add(c))
}

/// Pack a file name into an 8.3 directory name
pub fn short_name(name: &str) -> Result<[u8; 11]> {
    let (base, ext) = match name.rsplit_once('.') {
        Some((b, e)) => (b, e),
        None => (name, ""),
    };
    let valid = |s: &str| {
        s.bytes()
            .all(|c| c.is_ascii_alphanumeric() || b"!#$%&'()-@^_`{}~".contains(&c))
    };
    if base.is_empty() || base.len() > 8 || ext.len() > 3 || !valid(base) || !valid(ext) {
        return Err(FloppyError::invalid_arg(format!("'{}' is not a valid 8.3 name", name)));
    }
    let mut out = [b' '; 11];
    for (i, c) in base.bytes().enumerate() {
        out[i] = c.to_ascii_uppercase();
    }
    for (i, c) in ext.bytes().enumerate() {
        out[8 + i] = c.to_ascii_uppercase();
    }
    Ok(out)
}

fn display_short(raw: &[u8]) -> String {
    let base = String::from_utf8_lossy(&raw[..8]).trim_end().to_string();
    let ext = String::from_utf8_lossy(&raw[8..11]).trim_end().to_string();
    if ext.is_empty() {
        base
    } else {
        format!("{}.{}", base, ext)
    }
}

/// Decode a DOS date/time pair
pub fn dos_datetime(date: u16, time: u16) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(1980 + (date >> 9) as i32, ((date >> 5) & 0x0F) as u32, (date & 0x1F) as u32)?
        .and_hms_opt((time >> 11) as u32, ((time >> 5) & 0x3F) as u32, ((time & 0x1F) * 2) as u32)
}

/// Encode a DOS date/time pair
pub fn to_dos_datetime(when: &NaiveDateTime) -> (u16, u16) {
    let year = (when.year() - 1980).clamp(0, 127) as u16;
    let date = (year << 9) | ((when.month() as u16) << 5) | when.day() as u16;
    let time = ((when.hour() as u16) << 11) | ((when.minute() as u16) << 5) | (when.second() as u16 / 2);
    (date, time)
}

/// Directory entry with its on-disk location
#[derive(Debug, Clone)]
struct Slot {
    entry: DirEntry,
    short: [u8; 11],
    first_cluster: u32,
    offset: usize,
}

/// Where a directory's entries live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    Root,
    Cluster(u32),
}

/// Mounted FAT volume
pub struct FatVolume<'a> {
    blocks: Blocks<'a>,
    bpb: Bpb,
    fat: Vec<u8>,
    label: String,
}

impl<'a> FatVolume<'a> {
    /// Mount a disk
    pub fn open(disk: &'a Disk) -> Result<Self> {
        let blocks = Blocks::linear(disk);
        let boot = blocks.sector(0)?;
        let bpb = Bpb::parse(boot).ok_or_else(|| FloppyError::invalid_format("no FAT BIOS parameter block"))?;
        if bpb.bytes_per_sector as usize != boot.len() {
            return Err(FloppyError::corrupt(format!(
                "BPB sector size {} but disk sectors hold {} bytes",
                bpb.bytes_per_sector,
                boot.len()
            )));
        }
        let fat = blocks.run(bpb.reserved_sectors as usize, bpb.sectors_per_fat as usize)?;
        let mut label = if boot.get(0x26) == Some(&0x29) {
            crate::fs::padded_str(&boot[0x2B..0x36])
        } else {
            String::new()
        };
        let mut volume = Self {
            blocks,
            bpb,
            fat,
            label: String::new(),
        };
        let root = volume.dir_bytes(Dir::Root)?;
        for raw in root.chunks_exact(32) {
            if raw[0] == 0 {
                break;
            }
            if raw[0] != 0xE5 && raw[11] & ATTR_VOLUME != 0 && raw[11] != ATTR_LFN {
                label = display_short(raw).replace('.', "");
                break;
            }
        }
        volume.label = label;
        Ok(volume)
    }

    /// BIOS parameter block
    pub fn bpb(&self) -> &Bpb {
        &self.bpb
    }

    fn fat_entry(&self, cluster: u32) -> u32 {
        entry_in(&self.fat, &self.bpb, cluster)
    }

    fn cluster_lba(&self, cluster: u32) -> usize {
        self.bpb.data_start() + (cluster as usize - 2) * self.bpb.sectors_per_cluster as usize
    }

    fn chain(&self, start: u32) -> Result<Vec<u32>> {
        let mut chain = Vec::new();
        let mut cluster = start;
        let limit = self.bpb.cluster_count() + 2;
        while cluster >= 2 && cluster < self.bpb.end_of_chain() {
            if cluster as usize >= limit || chain.len() > limit {
                return Err(FloppyError::corrupt(format!("FAT chain from cluster {} is broken", start)));
            }
            chain.push(cluster);
            cluster = self.fat_entry(cluster);
        }
        Ok(chain)
    }

    fn read_chain(&self, start: u32) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for c in self.chain(start)? {
            out.extend(self.blocks.run(self.cluster_lba(c), self.bpb.sectors_per_cluster as usize)?);
        }
        Ok(out)
    }

    fn dir_bytes(&self, dir: Dir) -> Result<Vec<u8>> {
        match dir {
            Dir::Root => self.blocks.run(self.bpb.root_start(), self.bpb.root_sectors()),
            Dir::Cluster(c) => self.read_chain(c),
        }
    }

    fn slots(&self, dir: Dir) -> Result<Vec<Slot>> {
        let raw = self.dir_bytes(dir)?;
        let mut slots = Vec::new();
        let mut long: Vec<(u8, Vec<u16>)> = Vec::new();
        for (i, e) in raw.chunks_exact(32).enumerate() {
            match e[0] {
                0x00 => break,
                0xE5 => {
                    long.clear();
                    continue;
                }
                _ => {}
            }
            let attr = e[11];
            if attr == ATTR_LFN {
                let mut units = Vec::with_capacity(13);
                for range in [1..11, 14..26, 28..32] {
                    units.extend(e[range].chunks_exact(2).map(|p| u16::from_le_bytes([p[0], p[1]])));
                }
                long.push((e[0x0D], units));
                continue;
            }
            if attr & ATTR_VOLUME != 0 || e[0] == b'.' {
                long.clear();
                continue;
            }
            let mut short = [0u8; 11];
            short.copy_from_slice(&e[..11]);
            if short[0] == 0x05 {
                short[0] = 0xE5;
            }
            let check = lfn_checksum(&e[..11]);
            let name = if !long.is_empty() && long.iter().all(|(c, _)| *c == check) {
                let units: Vec<u16> = long
                    .iter()
                    .rev()
                    .flat_map(|(_, u)| u.iter().copied())
                    .take_while(|&u| u != 0 && u != 0xFFFF)
                    .collect();
                String::from_utf16_lossy(&units)
            } else {
                display_short(&short)
            };
            long.clear();

            let mut entry = if attr & ATTR_DIRECTORY != 0 {
                DirEntry::directory(name)
            } else {
                DirEntry::file(name, le32(e, 28) as u64)
            };
            entry.attributes = FileAttributes {
                read_only: attr & ATTR_READ_ONLY != 0,
                system: attr & ATTR_SYSTEM != 0,
                archive: attr & ATTR_ARCHIVE != 0,
                hidden: attr & ATTR_HIDDEN != 0,
            };
            entry.modified = dos_datetime(le16(e, 24), le16(e, 22));
            let mut first_cluster = le16(e, 26) as u32;
            if self.bpb.is_fat16() {
                first_cluster |= (le16(e, 20) as u32) << 16;
            }
            slots.push(Slot {
                entry,
                short,
                first_cluster,
                offset: i * 32,
            });
        }
        Ok(slots)
    }

    fn find(&self, dir: Dir, name: &str) -> Result<Option<Slot>> {
        Ok(self
            .slots(dir)?
            .into_iter()
            .find(|s| names_match(&s.entry.name, name) || names_match(&display_short(&s.short), name)))
    }

    fn resolve_dir(&self, path: &str) -> Result<Dir> {
        let mut dir = Dir::Root;
        for part in components(path) {
            let slot = self
                .find(dir, part)?
                .ok_or_else(|| FloppyError::NotFound(path.to_string()))?;
            if !slot.entry.is_dir() {
                return Err(FloppyError::invalid_arg(format!("{} is not a directory", path)));
            }
            dir = if slot.first_cluster == 0 {
                Dir::Root
            } else {
                Dir::Cluster(slot.first_cluster)
            };
        }
        Ok(dir)
    }

    fn free_clusters(&self) -> usize {
        (2..self.bpb.cluster_count() as u32 + 2)
            .filter(|&c| self.fat_entry(c) == 0)
            .count()
    }

    /// Sector writes that store `data` as `path`
    fn plan_write(&self, path: &str, data: &[u8]) -> Result<WritePlan> {
        let (parent, name) = split_parent(path)?;
        let short = short_name(name)?;
        let dir = self.resolve_dir(parent)?;
        let existing = self.find(dir, name)?;
        if existing.as_ref().is_some_and(|s| s.entry.is_dir()) {
            return Err(FloppyError::invalid_arg(format!("{} is a directory", path)));
        }

        let mut fat = self.fat.clone();
        if let Some(old) = &existing {
            for c in self.chain(old.first_cluster)? {
                set_entry(&mut fat, &self.bpb, c, 0);
            }
        }
        let needed = data.len().div_ceil(self.bpb.cluster_bytes());
        let free: Vec<u32> = (2..self.bpb.cluster_count() as u32 + 2)
            .filter(|&c| entry_in(&fat, &self.bpb, c) == 0)
            .take(needed)
            .collect();
        if free.len() < needed {
            return Err(FloppyError::DiskFull);
        }
        let eoc = if self.bpb.is_fat16() { 0xFFFF } else { 0xFFF };
        for (i, &c) in free.iter().enumerate() {
            set_entry(&mut fat, &self.bpb, c, free.get(i + 1).copied().unwrap_or(eoc));
        }

        let mut plan = WritePlan::new();
        let map = self.blocks.map();
        let bps = self.bpb.bytes_per_sector as usize;
        let mut chunks = data.chunks(bps);
        for &c in &free {
            for k in 0..self.bpb.sectors_per_cluster as usize {
                let mut sector = chunks.next().map(|s| s.to_vec()).unwrap_or_default();
                sector.resize(bps, 0);
                plan.put(map.address(self.cluster_lba(c) + k)?, sector);
            }
        }

        let offset = match &existing {
            Some(s) => s.offset,
            None => self.free_slot(dir)?,
        };
        let (lba, within) = self.dir_position(dir, offset)?;
        let address = map.address(lba)?;
        let mut sector = match plan.get(address) {
            Some(s) => s.to_vec(),
            None => self.blocks.sector(lba)?.to_vec(),
        };
        let now = chrono::Local::now().naive_local();
        let (date, time) = to_dos_datetime(&now);
        let first = free.first().copied().unwrap_or(0);
        let e = &mut sector[within..within + 32];
        e.fill(0);
        e[..11].copy_from_slice(&short);
        e[11] = ATTR_ARCHIVE;
        e[20..22].copy_from_slice(&((first >> 16) as u16).to_le_bytes());
        e[22..24].copy_from_slice(&time.to_le_bytes());
        e[24..26].copy_from_slice(&date.to_le_bytes());
        e[26..28].copy_from_slice(&(first as u16).to_le_bytes());
        e[28..32].copy_from_slice(&(data.len() as u32).to_le_bytes());
        plan.put(address, sector);

        for copy in 0..self.bpb.fat_count as usize {
            let base = self.bpb.reserved_sectors as usize + copy * self.bpb.sectors_per_fat as usize;
            for (k, (new, old)) in fat.chunks(bps).zip(self.fat.chunks(bps)).enumerate() {
                if new != old {
                    plan.put(map.address(base + k)?, new.to_vec());
                }
            }
        }
        Ok(plan)
    }

    fn free_slot(&self, dir: Dir) -> Result<usize> {
        let raw = self.dir_bytes(dir)?;
        raw.chunks_exact(32)
            .position(|e| e[0] == 0 || e[0] == 0xE5)
            .map(|i| i * 32)
            .ok_or(FloppyError::DiskFull)
    }

    fn dir_position(&self, dir: Dir, offset: usize) -> Result<(usize, usize)> {
        let bps = self.bpb.bytes_per_sector as usize;
        match dir {
            Dir::Root => Ok((self.bpb.root_start() + offset / bps, offset % bps)),
            Dir::Cluster(start) => {
                let chain = self.chain(start)?;
                let cluster = chain
                    .get(offset / self.bpb.cluster_bytes())
                    .copied()
                    .ok_or_else(|| FloppyError::corrupt("directory slot beyond its chain"))?;
                let within = offset % self.bpb.cluster_bytes();
                Ok((self.cluster_lba(cluster) + within / bps, within % bps))
            }
        }
    }
}

fn entry_in(fat: &[u8], bpb: &Bpb, cluster: u32) -> u32 {
    let n = cluster as usize;
    if bpb.is_fat16() {
        le16(fat, n * 2) as u32
    } else {
        let v = le16(fat, n * 3 / 2);
        (if n & 1 == 1 { v >> 4 } else { v & 0x0FFF }) as u32
    }
}

fn set_entry(fat: &mut [u8], bpb: &Bpb, cluster: u32, value: u32) {
    let n = cluster as usize;
    if bpb.is_fat16() {
        if let Some(slot) = fat.get_mut(n * 2..n * 2 + 2) {
            slot.copy_from_slice(&(value as u16).to_le_bytes());
        }
        return;
    }
    let at = n * 3 / 2;
    if at + 1 >= fat.len() {
        return;
    }
    let v = (value & 0x0FFF) as u16;
    let old = u16::from_le_bytes([fat[at], fat[at + 1]]);
    let new = if n & 1 == 1 { (old & 0x000F) | (v << 4) } else { (old & 0xF000) | v };
    fat[at..at + 2].copy_from_slice(&new.to_le_bytes());
}

impl Volume for FatVolume<'_> {
    fn stat_fs(&self) -> FsInfo {
        FsInfo {
            fs_type: if self.bpb.is_fat16() { "FAT16" } else { "FAT12" }.to_string(),
            volume_name: self.label.clone(),
            block_size: self.bpb.cluster_bytes(),
            total_blocks: self.bpb.cluster_count(),
            free_blocks: self.free_clusters(),
        }
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = self.resolve_dir(path)?;
        Ok(self.slots(dir)?.into_iter().map(|s| s.entry).collect())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let (parent, name) = split_parent(path)?;
        let slot = self
            .find(self.resolve_dir(parent)?, name)?
            .ok_or_else(|| FloppyError::NotFound(path.to_string()))?;
        if slot.entry.kind == EntryKind::Directory {
            return Err(FloppyError::invalid_arg(format!("{} is a directory", path)));
        }
        let mut data = self.read_chain(slot.first_cluster)?;
        if (data.len() as u64) < slot.entry.size {
            return Err(FloppyError::corrupt(format!(
                "{}: chain holds {} bytes, directory says {}",
                path,
                data.len(),
                slot.entry.size
            )));
        }
        data.truncate(slot.entry.size as usize);
        Ok(data)
    }
}

/// Format a disk with an empty FAT12 volume
pub fn format(disk: &mut Disk, label: &str) -> Result<()> {
    let bpb = Bpb::for_geometry(&disk.geometry);
    let bps = bpb.bytes_per_sector as usize;
    let map = crate::fs::SectorMap::linear(disk, crate::disk::SideMode::Alternate);
    if map.len() < bpb.total_sectors as usize {
        return Err(FloppyError::invalid_arg("disk has fewer sectors than its geometry"));
    }
    let mut plan = WritePlan::new();
    let mut boot = vec![0u8; bps];
    boot[..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
    boot[3..11].copy_from_slice(b"UFLOPPY ");
    bpb.write(&mut boot);
    boot[0x26] = 0x29;
    let mut name = [b' '; 11];
    for (i, c) in label.bytes().take(11).enumerate() {
        name[i] = c.to_ascii_uppercase();
    }
    boot[0x2B..0x36].copy_from_slice(&name);
    boot[0x36..0x3E].copy_from_slice(b"FAT12   ");
    if bps >= 512 {
        boot[510] = 0x55;
        boot[511] = 0xAA;
    }
    plan.put(map.address(0)?, boot);
    for lba in 1..bpb.data_start() {
        plan.put(map.address(lba)?, vec![0; bps]);
    }
    for copy in 0..bpb.fat_count as usize {
        let mut first = vec![0u8; bps];
        first[..3].copy_from_slice(&[bpb.media, 0xFF, 0xFF]);
        let lba = bpb.reserved_sectors as usize + copy * bpb.sectors_per_fat as usize;
        plan.put(map.address(lba)?, first);
    }
    plan.apply(disk)
}

/// FAT driver
#[derive(Debug, Clone, Copy, Default)]
pub struct FatDriver;

impl FilesystemDriver for FatDriver {
    fn name(&self) -> &'static str {
        "fat"
    }

    fn probe(&self, disk: &Disk) -> u8 {
        let blocks = Blocks::linear(disk);
        let Ok(boot) = blocks.sector(0) else {
            return 0;
        };
        let Some(bpb) = Bpb::parse(boot) else {
            return 0;
        };
        if bpb.bytes_per_sector as usize != boot.len() {
            return 10;
        }
        let mut score = 50;
        if matches!(boot[0], 0xEB | 0xE9 | 0x60) {
            score += 15;
        }
        if boot.len() >= 512 && boot[510] == 0x55 && boot[511] == 0xAA {
            score += 15;
        }
        if bpb.media >= 0xF0 {
            score += 10;
        }
        if bpb.total_sectors as usize <= blocks.len() {
            score += 10;
        }
        score
    }

    fn mount<'a>(&self, disk: &'a Disk) -> Result<Box<dyn Volume + 'a>> {
        Ok(Box::new(FatVolume::open(disk)?))
    }

    fn can_write(&self) -> bool {
        true
    }

    fn write(&self, disk: &mut Disk, path: &str, data: &[u8]) -> Result<()> {
        let plan = FatVolume::open(disk)?.plan_write(path, data)?;
        plan.apply(disk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::Geometry;

    fn blank_720k() -> Disk {
        let mut disk = Disk::builder().geometry(Geometry::new(80, 2, 9, 512)).build().unwrap();
        format(&mut disk, "TESTDISK").unwrap();
        disk
    }

    #[test]
    fn test_format_and_probe() {
        let disk = blank_720k();
        assert!(FatDriver.probe(&disk) >= 90);
        let volume = FatDriver.mount(&disk).unwrap();
        let info = volume.stat_fs();
        assert_eq!(info.fs_type, "FAT12");
        assert_eq!(info.volume_name, "TESTDISK");
        assert_eq!(info.block_size, 1024);
        assert_eq!(info.total_blocks, 713);
        assert_eq!(info.free_blocks, 713);
        assert!(volume.readdir("/").unwrap().is_empty());
    }

    #[test]
    fn test_write_then_read() {
        let mut disk = blank_720k();
        let data: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
        FatDriver.write(&mut disk, "/readme.txt", &data).unwrap();
        FatDriver.write(&mut disk, "/EMPTY", &[]).unwrap();

        let volume = FatDriver.mount(&disk).unwrap();
        let entries = volume.readdir("/").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "README.TXT");
        assert_eq!(entries[0].size, 3000);
        assert_eq!(volume.read("/README.TXT").unwrap(), data);
        assert_eq!(volume.read("readme.txt").unwrap(), data);
        assert!(volume.read("/EMPTY").unwrap().is_empty());
        assert_eq!(volume.stat_fs().free_blocks, 713 - 3);
        assert_eq!(volume.stat("/README.TXT").unwrap().size, 3000);
    }

    #[test]
    fn test_replace_frees_old_chain() {
        let mut disk = blank_720k();
        FatDriver.write(&mut disk, "A.BIN", &vec![1; 5000]).unwrap();
        FatDriver.write(&mut disk, "A.BIN", &vec![2; 100]).unwrap();
        let volume = FatDriver.mount(&disk).unwrap();
        assert_eq!(volume.readdir("/").unwrap().len(), 1);
        assert_eq!(volume.read("A.BIN").unwrap(), vec![2; 100]);
        assert_eq!(volume.stat_fs().free_blocks, 712);
    }

    #[test]
    fn test_long_file_name() {
        let mut disk = blank_720k();
        FatDriver.write(&mut disk, "LONGFI~1.TXT", b"hello").unwrap();
        let bpb = FatVolume::open(&disk).unwrap().bpb().clone();
        let root_lba = bpb.root_start();
        let (c, h, s) = crate::fs::SectorMap::linear(&disk, crate::disk::SideMode::Alternate)
            .address(root_lba)
            .unwrap();
        let mut root = disk.read_sector(c, h, s).unwrap().to_vec();
        let short = root[..32].to_vec();
        let check = lfn_checksum(&short[..11]);
        let name: Vec<u16> = "Long File Name.txt".encode_utf16().collect();
        let mut slot = [0u8; 32];
        slot[0] = 0x42;
        slot[11] = ATTR_LFN;
        slot[13] = check;
        let mut slot1 = slot;
        slot1[0] = 0x01;
        let mut units: Vec<u16> = name.clone();
        units.push(0);
        units.resize(26, 0xFFFF);
        let fill = |dst: &mut [u8; 32], part: &[u16]| {
            let mut k = 0;
            for range in [1..11usize, 14..26, 28..32] {
                for p in range.step_by(2) {
                    dst[p..p + 2].copy_from_slice(&part[k].to_le_bytes());
                    k += 1;
                }
            }
        };
        fill(&mut slot1, &units[..13]);
        fill(&mut slot, &units[13..26]);
        root[..32].copy_from_slice(&slot);
        root[32..64].copy_from_slice(&slot1);
        root[64..96].copy_from_slice(&short);
        disk.write_sector(c, h, s, &root).unwrap();

        let volume = FatDriver.mount(&disk).unwrap();
        let entries = volume.readdir("/").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "Long File Name.txt");
        assert_eq!(volume.read("/Long File Name.txt").unwrap(), b"hello");
        assert_eq!(volume.read("/LONGFI~1.TXT").unwrap(), b"hello");
    }

    #[test]
    fn test_short_name_rules() {
        assert_eq!(&short_name("a.b").unwrap(), b"A       B  ");
        assert!(short_name("toolongname.txt").is_err());
        assert!(short_name("bad name").is_err());
        assert!(short_name(".hidden").is_err());
    }

    #[test]
    fn test_dos_datetime_round_trip() {
        let when = NaiveDate::from_ymd_opt(1991, 8, 25).unwrap().and_hms_opt(20, 57, 8).unwrap();
        let (d, t) = to_dos_datetime(&when);
        assert_eq!(dos_datetime(d, t), Some(when));
    }

    #[test]
    fn test_fat12_entries_pack() {
        let bpb = Bpb::for_geometry(&Geometry::new(80, 2, 9, 512));
        let mut fat = vec![0u8; 1536];
        set_entry(&mut fat, &bpb, 2, 0x123);
        set_entry(&mut fat, &bpb, 3, 0xABC);
        assert_eq!(entry_in(&fat, &bpb, 2), 0x123);
        assert_eq!(entry_in(&fat, &bpb, 3), 0xABC);
        assert_eq!(&fat[3..6], &[0x23, 0xC1, 0xAB]);
    }
}
