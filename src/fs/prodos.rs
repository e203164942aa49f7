//! Apple ProDOS
//!
//! 512-byte blocks, each made of two 256-byte sectors chosen through
//! [`PRODOS_ORDER`]. Disks with 512-byte sectors (3.5" and hard disk
//! images) are addressed block for sector.

use crate::disk::Disk;
use crate::error::{FloppyError, Result};
use crate::fs::{components, names_match, Blocks, DirEntry, FileAttributes, FilesystemDriver, FsInfo, Volume};
use crate::io::le16;
use crate::track::apple::PRODOS_ORDER;
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::HashSet;

/// Bytes per block
pub const BLOCK_SIZE: usize = 512;
const KEY_BLOCK: usize = 2;

const SEEDLING: u8 = 0x1;
const SAPLING: u8 = 0x2;
const TREE: u8 = 0x3;
const SUBDIRECTORY: u8 = 0xD;
const SUBDIR_HEADER: u8 = 0xE;
const VOLUME_HEADER: u8 = 0xF;

/// Decode a ProDOS date/time pair
pub fn prodos_datetime(date: u16, time: u16) -> Option<NaiveDateTime> {
    if date == 0 {
        return None;
    }
    let year = (date >> 9) as i32;
    let year = if year < 40 { 2000 + year } else { 1900 + year };
    NaiveDate::from_ymd_opt(year, ((date >> 5) & 0x0F) as u32, (date & 0x1F) as u32)?
        .and_hms_opt(((time >> 8) & 0x1F) as u32, (time & 0x3F) as u32, 0)
}

/// Block access over 256- or 512-byte sectors
struct BlockDevice<'a> {
    disk: &'a Disk,
    linear: Blocks<'a>,
    halves: bool,
}

impl<'a> BlockDevice<'a> {
    fn new(disk: &'a Disk) -> Self {
        let halves = disk.track(0, 0).and_then(|t| t.uniform_sector_size()) == Some(256);
        Self {
            disk,
            linear: Blocks::linear(disk),
            halves,
        }
    }

    fn count(&self) -> usize {
        if self.halves {
            self.disk.cylinder_count() as usize * 8
        } else {
            self.linear.len()
        }
    }

    fn block(&self, block: usize) -> Result<Vec<u8>> {
        if !self.halves {
            return Ok(self.linear.sector(block)?.to_vec());
        }
        let track = u8::try_from(block / 8).map_err(|_| FloppyError::corrupt(format!("block {} beyond disk", block)))?;
        let first = (block % 8) * 2;
        let mut out = Vec::with_capacity(BLOCK_SIZE);
        for half in [first, first + 1] {
            out.extend_from_slice(self.disk.read_sector(track, 0, PRODOS_ORDER[half])?);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
struct ProDosEntry {
    storage: u8,
    name: String,
    file_type: u8,
    key: usize,
    eof: usize,
    access: u8,
    modified: Option<NaiveDateTime>,
}

impl ProDosEntry {
    fn parse(e: &[u8]) -> Option<Self> {
        let storage = e[0] >> 4;
        let len = (e[0] & 0x0F) as usize;
        if storage == 0 || len == 0 {
            return None;
        }
        Some(Self {
            storage,
            name: String::from_utf8_lossy(&e[1..1 + len]).into_owned(),
            file_type: e[0x10],
            key: le16(e, 0x11) as usize,
            eof: e[0x15] as usize | (e[0x16] as usize) << 8 | (e[0x17] as usize) << 16,
            access: e[0x1E],
            modified: prodos_datetime(le16(e, 0x21), le16(e, 0x23)),
        })
    }

    fn is_dir(&self) -> bool {
        self.storage == SUBDIRECTORY
    }

    fn to_dir_entry(&self) -> DirEntry {
        let mut entry = if self.is_dir() {
            DirEntry::directory(self.name.clone())
        } else {
            DirEntry::file(self.name.clone(), self.eof as u64).with_type(type_name(self.file_type))
        };
        entry.attributes = FileAttributes {
            read_only: self.access & 0x02 == 0,
            archive: self.access & 0x20 != 0,
            hidden: self.access & 0x04 != 0,
            ..FileAttributes::default()
        };
        entry.modified = self.modified;
        entry
    }
}

fn type_name(file_type: u8) -> String {
    match file_type {
        0x04 => "TXT".into(),
        0x06 => "BIN".into(),
        0x0F => "DIR".into(),
        0xFC => "BAS".into(),
        0xFF => "SYS".into(),
        other => format!("${:02X}", other),
    }
}

/// Mounted ProDOS volume
pub struct ProDosVolume<'a> {
    device: BlockDevice<'a>,
    name: String,
    total_blocks: usize,
    bitmap_block: usize,
}

impl<'a> ProDosVolume<'a> {
    /// Mount a disk
    pub fn open(disk: &'a Disk) -> Result<Self> {
        let device = BlockDevice::new(disk);
        let key = device.block(KEY_BLOCK)?;
        let header = &key[4..4 + 0x27];
        if header[0] >> 4 != VOLUME_HEADER || header[0] & 0x0F == 0 || key[0] != 0 || key[1] != 0 {
            return Err(FloppyError::invalid_format("no ProDOS volume header in block 2"));
        }
        if header[0x1F] != 0x27 || header[0x20] != 0x0D {
            return Err(FloppyError::corrupt("unexpected directory entry geometry"));
        }
        let len = (header[0] & 0x0F) as usize;
        Ok(Self {
            name: String::from_utf8_lossy(&header[1..1 + len]).into_owned(),
            total_blocks: le16(header, 0x25) as usize,
            bitmap_block: le16(header, 0x23) as usize,
            device,
        })
    }

    /// Entries of the directory whose key block is given
    fn list(&self, key: usize) -> Result<Vec<ProDosEntry>> {
        let mut entries = Vec::new();
        let mut block = key;
        let mut seen = HashSet::new();
        while block != 0 {
            if !seen.insert(block) {
                return Err(FloppyError::corrupt("directory chain loops"));
            }
            let data = self.device.block(block)?;
            for slot in 0..13 {
                let at = 4 + slot * 0x27;
                let e = &data[at..at + 0x27];
                if matches!(e[0] >> 4, VOLUME_HEADER | SUBDIR_HEADER) {
                    continue;
                }
                entries.extend(ProDosEntry::parse(e));
            }
            block = le16(&data, 2) as usize;
        }
        Ok(entries)
    }

    fn resolve(&self, path: &str) -> Result<Option<ProDosEntry>> {
        let mut dir = KEY_BLOCK;
        let mut found = None;
        for part in components(path) {
            if found.as_ref().is_some_and(|e: &ProDosEntry| !e.is_dir()) {
                return Err(FloppyError::NotFound(path.to_string()));
            }
            let entry = self
                .list(dir)?
                .into_iter()
                .find(|e| names_match(&e.name, part))
                .ok_or_else(|| FloppyError::NotFound(path.to_string()))?;
            dir = entry.key;
            found = Some(entry);
        }
        Ok(found)
    }

    fn index(&self, block: usize) -> Result<Vec<usize>> {
        let data = self.device.block(block)?;
        Ok((0..256).map(|i| data[i] as usize | (data[256 + i] as usize) << 8).collect())
    }

    fn data_blocks(&self, entry: &ProDosEntry) -> Result<Vec<usize>> {
        let wanted = entry.eof.div_ceil(BLOCK_SIZE);
        let blocks = match entry.storage {
            SEEDLING => vec![entry.key],
            SAPLING => self.index(entry.key)?,
            TREE => {
                let mut all = Vec::new();
                for index in self.index(entry.key)?.into_iter().take(wanted.div_ceil(256)) {
                    if index == 0 {
                        all.extend(std::iter::repeat_n(0, 256));
                    } else {
                        all.extend(self.index(index)?);
                    }
                }
                all
            }
            other => return Err(FloppyError::unsupported(format!("storage type {:X}", other))),
        };
        Ok(blocks.into_iter().take(wanted).collect())
    }

    fn free_blocks(&self) -> usize {
        let mut free = 0;
        for page in 0..self.total_blocks.div_ceil(4096) {
            let Ok(bitmap) = self.device.block(self.bitmap_block + page) else {
                break;
            };
            let bits = (self.total_blocks - page * 4096).min(4096);
            free += (0..bits).filter(|&b| bitmap[b / 8] & (0x80 >> (b % 8)) != 0).count();
        }
        free
    }
}

impl Volume for ProDosVolume<'_> {
    fn stat_fs(&self) -> FsInfo {
        FsInfo {
            fs_type: "ProDOS".to_string(),
            volume_name: self.name.clone(),
            block_size: BLOCK_SIZE,
            total_blocks: self.total_blocks,
            free_blocks: self.free_blocks(),
        }
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let key = match self.resolve(path)? {
            None => KEY_BLOCK,
            Some(e) if e.is_dir() => e.key,
            Some(_) => return Err(FloppyError::invalid_arg(format!("{} is not a directory", path))),
        };
        Ok(self.list(key)?.iter().map(ProDosEntry::to_dir_entry).collect())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let entry = self
            .resolve(path)?
            .filter(|e| !e.is_dir())
            .ok_or_else(|| FloppyError::NotFound(path.to_string()))?;
        let mut data = Vec::with_capacity(entry.eof);
        for block in self.data_blocks(&entry)? {
            if block == 0 {
                data.extend_from_slice(&[0u8; BLOCK_SIZE]);
            } else {
                data.extend(self.device.block(block)?);
            }
        }
        data.truncate(entry.eof);
        Ok(data)
    }

    fn stat(&self, path: &str) -> Result<DirEntry> {
        match self.resolve(path)? {
            Some(e) => Ok(e.to_dir_entry()),
            None => Ok(DirEntry::directory("/")),
        }
    }
}

/// ProDOS driver
#[derive(Debug, Clone, Copy, Default)]
pub struct ProDosDriver;

impl FilesystemDriver for ProDosDriver {
    fn name(&self) -> &'static str {
        "prodos"
    }

    fn probe(&self, disk: &Disk) -> u8 {
        match ProDosVolume::open(disk) {
            Ok(volume) if volume.list(KEY_BLOCK).is_ok() => {
                if volume.total_blocks <= volume.device.count() {
                    90
                } else {
                    60
                }
            }
            Ok(_) => 40,
            Err(_) => 0,
        }
    }

    fn mount<'a>(&self, disk: &'a Disk) -> Result<Box<dyn Volume + 'a>> {
        Ok(Box::new(ProDosVolume::open(disk)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::profile;

    fn put_block(disk: &mut Disk, block: usize, data: &[u8]) {
        let track = (block / 8) as u8;
        let first = (block % 8) * 2;
        disk.write_sector(track, 0, PRODOS_ORDER[first], &data[..256]).unwrap();
        disk.write_sector(track, 0, PRODOS_ORDER[first + 1], &data[256..]).unwrap();
    }

    fn entry(storage: u8, name: &str, file_type: u8, key: u16, eof: u32) -> Vec<u8> {
        let mut e = vec![0u8; 0x27];
        e[0] = storage << 4 | name.len() as u8;
        e[1..1 + name.len()].copy_from_slice(name.as_bytes());
        e[0x10] = file_type;
        e[0x11..0x13].copy_from_slice(&key.to_le_bytes());
        e[0x15..0x18].copy_from_slice(&eof.to_le_bytes()[..3]);
        e[0x1E] = 0xE3;
        e[0x21..0x23].copy_from_slice(&((24u16 << 9) | (3 << 5) | 15).to_le_bytes());
        e[0x23..0x25].copy_from_slice(&((10u16 << 8) | 30).to_le_bytes());
        e
    }

    fn sample() -> Disk {
        let mut disk = Disk::builder().profile(profile("apple2-prodos").unwrap()).build().unwrap();
        let mut key = vec![0u8; 512];
        let header = &mut key[4..4 + 0x27];
        header[0] = VOLUME_HEADER << 4 | 4;
        header[1..5].copy_from_slice(b"DEMO");
        header[0x1F] = 0x27;
        header[0x20] = 0x0D;
        header[0x23..0x25].copy_from_slice(&6u16.to_le_bytes());
        header[0x25..0x27].copy_from_slice(&280u16.to_le_bytes());
        key[4 + 0x27..4 + 0x4E].copy_from_slice(&entry(SEEDLING, "README", 0x04, 7, 5));
        key[4 + 0x4E..4 + 0x75].copy_from_slice(&entry(SAPLING, "BIG", 0x06, 8, 1100));
        key[4 + 0x75..4 + 0x9C].copy_from_slice(&entry(SUBDIRECTORY, "SUB", 0x0F, 12, 512));
        put_block(&mut disk, 2, &key);

        let mut bitmap = vec![0u8; 512];
        for b in 13..280 {
            bitmap[b / 8] |= 0x80 >> (b % 8);
        }
        put_block(&mut disk, 6, &bitmap);

        let mut readme = vec![0u8; 512];
        readme[..5].copy_from_slice(b"HELLO");
        put_block(&mut disk, 7, &readme);

        let mut index = vec![0u8; 512];
        index[0] = 9;
        index[1] = 10;
        index[2] = 11;
        put_block(&mut disk, 8, &index);
        put_block(&mut disk, 9, &[1u8; 512]);
        put_block(&mut disk, 10, &[2u8; 512]);
        put_block(&mut disk, 11, &[3u8; 512]);

        let mut sub = vec![0u8; 512];
        sub[4] = SUBDIR_HEADER << 4 | 3;
        sub[5..8].copy_from_slice(b"SUB");
        sub[4 + 0x27..4 + 0x4E].copy_from_slice(&entry(SEEDLING, "INNER", 0x04, 7, 3));
        put_block(&mut disk, 12, &sub);
        disk
    }

    #[test]
    fn test_probe_and_info() {
        let disk = sample();
        assert_eq!(ProDosDriver.probe(&disk), 90);
        let volume = ProDosDriver.mount(&disk).unwrap();
        let info = volume.stat_fs();
        assert_eq!(info.volume_name, "DEMO");
        assert_eq!(info.total_blocks, 280);
        assert_eq!(info.free_blocks, 267);
    }

    #[test]
    fn test_readdir_and_read() {
        let disk = sample();
        let volume = ProDosDriver.mount(&disk).unwrap();
        let entries = volume.readdir("/").unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].file_type.as_deref(), Some("TXT"));
        assert_eq!(entries[0].modified.unwrap().to_string(), "2024-03-15 10:30:00");
        assert!(entries[2].is_dir());
        assert_eq!(volume.read("/README").unwrap(), b"HELLO");
        let big = volume.read("BIG").unwrap();
        assert_eq!(big.len(), 1100);
        assert_eq!(big[511], 1);
        assert_eq!(big[512], 2);
        assert_eq!(big[1099], 3);
        assert_eq!(volume.read("/SUB/INNER").unwrap(), b"HEL");
        assert_eq!(volume.readdir("/sub").unwrap()[0].name, "INNER");
        assert!(volume.read("/SUB").is_err());
    }

    #[test]
    fn test_blank_disk_rejected() {
        let disk = Disk::builder().profile(profile("apple2-prodos").unwrap()).build().unwrap();
        assert_eq!(ProDosDriver.probe(&disk), 0);
    }
}
