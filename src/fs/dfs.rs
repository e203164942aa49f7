//! Acorn DFS
//!
//! Catalogue in sectors 0 and 1 of side 0, at most 31 files, each stored
//! in one contiguous run of 256-byte sectors. Names are `D.NAME` where
//! `D` is the single-character directory; `$` files may be named bare.

use crate::disk::Disk;
use crate::error::{FloppyError, Result};
use crate::fs::{flat_only, split_parent, Blocks, DirEntry, FileAttributes, FilesystemDriver, FsInfo, SectorMap, Volume, WritePlan};

/// Sector size
pub const SECTOR_SIZE: usize = 256;
/// Catalogue capacity
pub const MAX_FILES: usize = 31;

#[derive(Debug, Clone, PartialEq, Eq)]
struct DfsFile {
    directory: char,
    name: String,
    locked: bool,
    load: u32,
    exec: u32,
    length: usize,
    start: usize,
}

impl DfsFile {
    fn full_name(&self) -> String {
        format!("{}.{}", self.directory, self.name)
    }

    fn matches(&self, wanted: &str) -> bool {
        let (dir, name) = match wanted.split_once('.') {
            Some((d, n)) if d.chars().count() == 1 => (d.chars().next().unwrap_or('$'), n),
            _ => ('$', wanted),
        };
        dir.eq_ignore_ascii_case(&self.directory) && name.eq_ignore_ascii_case(&self.name)
    }

    fn sectors(&self) -> usize {
        self.length.div_ceil(SECTOR_SIZE)
    }
}

fn parse_catalogue(s0: &[u8], s1: &[u8]) -> Result<(String, usize, u8, Vec<DfsFile>)> {
    if s0.len() < SECTOR_SIZE || s1.len() < SECTOR_SIZE {
        return Err(FloppyError::invalid_format("catalogue sectors are short"));
    }
    let count = s1[5] as usize;
    if count % 8 != 0 || count / 8 > MAX_FILES {
        return Err(FloppyError::invalid_format(format!("catalogue length byte {:02X}", s1[5])));
    }
    let total = ((s1[6] as usize & 0x03) << 8) | s1[7] as usize;
    if total < 2 {
        return Err(FloppyError::invalid_format("catalogue sector count below 2"));
    }
    let mut title: Vec<u8> = s0[..8].to_vec();
    title.extend_from_slice(&s1[..4]);
    let title = crate::fs::padded_str(&title);

    let mut files = Vec::with_capacity(count / 8);
    for i in 1..=count / 8 {
        let n = &s0[i * 8..i * 8 + 8];
        let m = &s1[i * 8..i * 8 + 8];
        if !n[..7].iter().chain(&n[7..]).all(|&b| (0x20..0x7F).contains(&(b & 0x7F))) {
            return Err(FloppyError::invalid_format(format!("catalogue entry {} has a bad name", i)));
        }
        let mixed = m[6] as u32;
        let file = DfsFile {
            directory: (n[7] & 0x7F) as char,
            name: crate::fs::padded_str(&n[..7]),
            locked: n[7] & 0x80 != 0,
            load: u16::from_le_bytes([m[0], m[1]]) as u32 | ((mixed >> 2) & 3) << 16,
            exec: u16::from_le_bytes([m[2], m[3]]) as u32 | ((mixed >> 6) & 3) << 16,
            length: (u16::from_le_bytes([m[4], m[5]]) as u32 | ((mixed >> 4) & 3) << 16) as usize,
            start: (((mixed & 3) << 8) | m[7] as u32) as usize,
        };
        if file.start < 2 || file.start + file.sectors() > total {
            return Err(FloppyError::corrupt(format!("{} lies outside the disk", file.full_name())));
        }
        files.push(file);
    }
    Ok((title, total, (s1[6] >> 4) & 3, files))
}

/// Mounted DFS side
pub struct DfsVolume<'a> {
    blocks: Blocks<'a>,
    title: String,
    total: usize,
    boot: u8,
    cycle: u8,
    files: Vec<DfsFile>,
}

impl<'a> DfsVolume<'a> {
    /// Mount side 0 of a disk
    pub fn open(disk: &'a Disk) -> Result<Self> {
        let blocks = Blocks::new(disk, SectorMap::side(disk, 0));
        let (s0, s1) = (blocks.sector(0)?, blocks.sector(1)?);
        let (title, total, boot, files) = parse_catalogue(s0, s1)?;
        Ok(Self {
            title,
            total,
            boot,
            cycle: s1[4],
            files,
            blocks,
        })
    }

    /// `*OPT 4` boot option
    pub fn boot_option(&self) -> u8 {
        self.boot
    }

    fn find(&self, path: &str) -> Result<&DfsFile> {
        let (parent, name) = split_parent(path)?;
        flat_only(parent)?;
        self.files
            .iter()
            .find(|f| f.matches(name))
            .ok_or_else(|| FloppyError::NotFound(path.to_string()))
    }

    fn plan_write(&self, path: &str, data: &[u8]) -> Result<WritePlan> {
        let (parent, wanted) = split_parent(path)?;
        flat_only(parent)?;
        let (dir, name) = match wanted.split_once('.') {
            Some((d, n)) if d.len() == 1 => (d.as_bytes()[0], n),
            _ => (b'$', wanted),
        };
        if name.is_empty() || name.len() > 7 || !name.bytes().all(|b| b.is_ascii_graphic() && b != b'.') {
            return Err(FloppyError::invalid_arg(format!("'{}' is not a valid DFS name", wanted)));
        }
        let mut files: Vec<DfsFile> = self.files.iter().filter(|f| !f.matches(wanted)).cloned().collect();
        if let Some(old) = self.files.iter().find(|f| f.matches(wanted)) {
            if old.locked {
                return Err(FloppyError::Permission(format!("{} is locked", old.full_name())));
            }
        }
        if files.len() >= MAX_FILES {
            return Err(FloppyError::DiskFull);
        }
        let start = files.iter().map(|f| f.start + f.sectors()).max().unwrap_or(2);
        let needed = data.len().div_ceil(SECTOR_SIZE);
        if start + needed > self.total || data.len() >= 1 << 18 {
            return Err(FloppyError::DiskFull);
        }
        files.insert(
            0,
            DfsFile {
                directory: dir as char,
                name: name.to_string(),
                locked: false,
                load: 0,
                exec: 0,
                length: data.len(),
                start,
            },
        );

        let mut plan = WritePlan::new();
        for (i, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
            let mut sector = chunk.to_vec();
            sector.resize(SECTOR_SIZE, 0);
            plan.put(self.blocks.map().address(start + i)?, sector);
        }
        let (s0, s1) = self.catalogue(&files);
        plan.put(self.blocks.map().address(0)?, s0);
        plan.put(self.blocks.map().address(1)?, s1);
        Ok(plan)
    }

    fn catalogue(&self, files: &[DfsFile]) -> (Vec<u8>, Vec<u8>) {
        let mut s0 = vec![0u8; SECTOR_SIZE];
        let mut s1 = vec![0u8; SECTOR_SIZE];
        let mut title = [b' '; 12];
        for (o, b) in title.iter_mut().zip(self.title.bytes()) {
            *o = b;
        }
        s0[..8].copy_from_slice(&title[..8]);
        s1[..4].copy_from_slice(&title[8..]);
        s1[4] = bcd_increment(self.cycle);
        s1[5] = (files.len() * 8) as u8;
        s1[6] = (self.boot << 4) | ((self.total >> 8) & 3) as u8;
        s1[7] = self.total as u8;
        for (i, f) in files.iter().enumerate() {
            let at = (i + 1) * 8;
            let mut name = [b' '; 7];
            for (o, b) in name.iter_mut().zip(f.name.bytes()) {
                *o = b;
            }
            s0[at..at + 7].copy_from_slice(&name);
            s0[at + 7] = f.directory as u8 | if f.locked { 0x80 } else { 0 };
            s1[at..at + 2].copy_from_slice(&(f.load as u16).to_le_bytes());
            s1[at + 2..at + 4].copy_from_slice(&(f.exec as u16).to_le_bytes());
            s1[at + 4..at + 6].copy_from_slice(&(f.length as u16).to_le_bytes());
            s1[at + 6] = (((f.exec >> 16) & 3) << 6 | ((f.length as u32 >> 16) & 3) << 4 | ((f.load >> 16) & 3) << 2) as u8
                | ((f.start >> 8) & 3) as u8;
            s1[at + 7] = f.start as u8;
        }
        (s0, s1)
    }
}

fn bcd_increment(value: u8) -> u8 {
    let n = (value >> 4) * 10 + (value & 0x0F);
    let n = (n + 1) % 100;
    ((n / 10) << 4) | (n % 10)
}

impl Volume for DfsVolume<'_> {
    fn stat_fs(&self) -> FsInfo {
        let used: usize = self.files.iter().map(|f| f.sectors()).sum();
        FsInfo {
            fs_type: "DFS".to_string(),
            volume_name: self.title.clone(),
            block_size: SECTOR_SIZE,
            total_blocks: self.total,
            free_blocks: self.total.saturating_sub(used + 2),
        }
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        flat_only(path)?;
        Ok(self
            .files
            .iter()
            .map(|f| {
                let mut entry = DirEntry::file(f.full_name(), f.length as u64);
                entry.attributes = FileAttributes {
                    read_only: f.locked,
                    ..FileAttributes::default()
                };
                entry
            })
            .collect())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let file = self.find(path)?;
        let mut data = self.blocks.run(file.start, file.sectors())?;
        data.truncate(file.length);
        Ok(data)
    }

    fn stat(&self, path: &str) -> Result<DirEntry> {
        let file = self.find(path)?;
        Ok(DirEntry::file(file.full_name(), file.length as u64))
    }
}

/// Write an empty catalogue covering side 0
pub fn format(disk: &mut Disk, title: &str) -> Result<()> {
    let map = SectorMap::side(disk, 0);
    let total = map.len().min(0x3FF);
    let mut s0 = vec![0u8; SECTOR_SIZE];
    let mut s1 = vec![0u8; SECTOR_SIZE];
    for (i, b) in title.bytes().take(12).enumerate() {
        if i < 8 {
            s0[i] = b;
        } else {
            s1[i - 8] = b;
        }
    }
    s1[6] = ((total >> 8) & 3) as u8;
    s1[7] = total as u8;
    let mut plan = WritePlan::new();
    plan.put(map.address(0)?, s0);
    plan.put(map.address(1)?, s1);
    plan.apply(disk)
}

/// Acorn DFS driver
#[derive(Debug, Clone, Copy, Default)]
pub struct DfsDriver;

impl FilesystemDriver for DfsDriver {
    fn name(&self) -> &'static str {
        "dfs"
    }

    fn probe(&self, disk: &Disk) -> u8 {
        let Ok(volume) = DfsVolume::open(disk) else {
            return 0;
        };
        let side = volume.blocks.len();
        let mut score = 35;
        if volume.total == side || volume.total * 2 == side || volume.total == 400 || volume.total == 800 {
            score += 25;
        }
        if volume.blocks.sector(0).map(|s| s.len() == SECTOR_SIZE).unwrap_or(false) {
            score += 10;
        }
        if !volume.files.is_empty() {
            score += 10;
        }
        score
    }

    fn mount<'a>(&self, disk: &'a Disk) -> Result<Box<dyn Volume + 'a>> {
        Ok(Box::new(DfsVolume::open(disk)?))
    }

    fn can_write(&self) -> bool {
        true
    }

    fn write(&self, disk: &mut Disk, path: &str, data: &[u8]) -> Result<()> {
        let plan = DfsVolume::open(disk)?.plan_write(path, data)?;
        plan.apply(disk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::profile;

    fn blank() -> Disk {
        let mut disk = Disk::builder().profile(profile("bbc-ss").unwrap()).build().unwrap();
        format(&mut disk, "GAMES DISK").unwrap();
        disk
    }

    #[test]
    fn test_format() {
        let disk = blank();
        assert!(DfsDriver.probe(&disk) >= 60);
        let volume = DfsDriver.mount(&disk).unwrap();
        let info = volume.stat_fs();
        assert_eq!(info.volume_name, "GAMES DISK");
        assert_eq!(info.total_blocks, 800);
        assert_eq!(info.free_blocks, 798);
        assert!(volume.readdir("/").unwrap().is_empty());
    }

    #[test]
    fn test_write_read_and_names() {
        let mut disk = blank();
        let data: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        DfsDriver.write(&mut disk, "ELITE", &data).unwrap();
        DfsDriver.write(&mut disk, "B.LOADER", b"CHAIN").unwrap();
        let volume = DfsDriver.mount(&disk).unwrap();
        let names: Vec<String> = volume.readdir("/").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["B.LOADER", "$.ELITE"]);
        assert_eq!(volume.read("ELITE").unwrap(), data);
        assert_eq!(volume.read("$.elite").unwrap(), data);
        assert_eq!(volume.read("B.LOADER").unwrap(), b"CHAIN");
        assert!(volume.read("LOADER").is_err());
        assert_eq!(volume.stat_fs().free_blocks, 798 - 3 - 1);
    }

    #[test]
    fn test_replace_moves_file_to_end() {
        let mut disk = blank();
        DfsDriver.write(&mut disk, "A", &[1u8; 300]).unwrap();
        DfsDriver.write(&mut disk, "A", &[2u8; 10]).unwrap();
        let volume = DfsVolume::open(&disk).unwrap();
        assert_eq!(volume.files.len(), 1);
        assert_eq!(volume.files[0].start, 2);
        assert_eq!(volume.read("A").unwrap(), vec![2u8; 10]);
        assert_eq!(volume.cycle, 2);
    }

    #[test]
    fn test_bad_names_rejected() {
        let mut disk = blank();
        assert!(DfsDriver.write(&mut disk, "TOOLONGNAME", b"x").is_err());
        assert!(DfsDriver.write(&mut disk, "A.B.C", b"x").is_err());
    }

    #[test]
    fn test_bcd_cycle() {
        assert_eq!(bcd_increment(0x09), 0x10);
        assert_eq!(bcd_increment(0x99), 0x00);
    }

    #[test]
    fn test_blank_disk_not_dfs() {
        let disk = Disk::builder().profile(profile("bbc-ss").unwrap()).build().unwrap();
        assert_eq!(DfsDriver.probe(&disk), 0);
    }
}
