//! Apple DOS 3.3
//!
//! DOS addresses sectors logically; the disk stores them under their
//! physical numbers, so every access goes through [`DOS33_ORDER`].

use crate::disk::Disk;
use crate::error::{FloppyError, Result};
use crate::fs::{flat_only, names_match, split_parent, DirEntry, FileAttributes, FilesystemDriver, FsInfo, Volume, WritePlan};
use crate::track::apple::{DEFAULT_VOLUME, DOS33_ORDER};
use std::collections::HashSet;

const VTOC_TRACK: u8 = 17;
const SECTORS: u8 = 16;
const ENTRIES_PER_CATALOG: usize = 7;
const ENTRY_AT: usize = 0x0B;
const ENTRY_LEN: usize = 35;
const TS_PAIRS: usize = 122;
const DELETED: u8 = 0xFF;

const TYPE_BINARY: u8 = 0x04;
const TYPE_SPECIAL: u8 = 0x08;

/// Logical sector address on the disk model
fn address(track: u8, sector: u8) -> Result<(u8, u8, u8)> {
    let physical = DOS33_ORDER
        .get(sector as usize)
        .ok_or_else(|| FloppyError::corrupt(format!("sector {} out of range", sector)))?;
    Ok((track, 0, *physical))
}

/// Read a DOS logical sector
pub fn read_sector(disk: &Disk, track: u8, sector: u8) -> Result<&[u8]> {
    let (c, h, s) = address(track, sector)?;
    disk.read_sector(c, h, s)
}

fn type_letter(file_type: u8) -> &'static str {
    match file_type & 0x7F {
        0x00 => "T",
        0x01 => "I",
        0x02 => "A",
        0x04 => "B",
        0x08 => "S",
        0x10 => "R",
        0x20 => "a",
        0x40 => "b",
        _ => "?",
    }
}

fn apple_text(bytes: &[u8]) -> String {
    let text: String = bytes.iter().map(|&b| (b & 0x7F) as char).collect();
    text.trim_end().to_string()
}

#[derive(Debug, Clone)]
struct CatalogEntry {
    catalog: (u8, u8),
    slot: usize,
    ts_list: (u8, u8),
    file_type: u8,
    name: String,
}

/// Mounted DOS 3.3 disk
pub struct Dos33Volume<'a> {
    disk: &'a Disk,
    vtoc: Vec<u8>,
    entries: Vec<CatalogEntry>,
}

impl<'a> Dos33Volume<'a> {
    /// Mount a disk
    pub fn open(disk: &'a Disk) -> Result<Self> {
        let vtoc = read_sector(disk, VTOC_TRACK, 0)?.to_vec();
        if vtoc.len() < 256 || vtoc[0x35] != SECTORS || vtoc[1] == 0 || vtoc[1] >= vtoc[0x34] {
            return Err(FloppyError::invalid_format("no DOS 3.3 VTOC at track 17 sector 0"));
        }
        let mut volume = Self {
            disk,
            vtoc,
            entries: Vec::new(),
        };
        volume.entries = volume.read_catalog()?;
        Ok(volume)
    }

    fn tracks(&self) -> u8 {
        self.vtoc[0x34]
    }

    fn catalog_chain(&self) -> Result<Vec<(u8, u8)>> {
        let (mut t, mut s) = (self.vtoc[1], self.vtoc[2]);
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        while t != 0 {
            if !seen.insert((t, s)) {
                return Err(FloppyError::corrupt("catalog chain loops"));
            }
            chain.push((t, s));
            let sector = read_sector(self.disk, t, s)?;
            (t, s) = (sector[1], sector[2]);
        }
        Ok(chain)
    }

    fn read_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let mut entries = Vec::new();
        for (t, s) in self.catalog_chain()? {
            let sector = read_sector(self.disk, t, s)?;
            for slot in 0..ENTRIES_PER_CATALOG {
                let e = &sector[ENTRY_AT + slot * ENTRY_LEN..ENTRY_AT + (slot + 1) * ENTRY_LEN];
                if e[0] == 0 || e[0] == DELETED {
                    continue;
                }
                entries.push(CatalogEntry {
                    catalog: (t, s),
                    slot,
                    ts_list: (e[0], e[1]),
                    file_type: e[2],
                    name: apple_text(&e[3..33]),
                });
            }
        }
        Ok(entries)
    }

    /// Data sectors and T/S list sectors of a file
    fn file_sectors(&self, ts_list: (u8, u8)) -> Result<(Vec<(u8, u8)>, Vec<(u8, u8)>)> {
        let mut data = Vec::new();
        let mut lists = Vec::new();
        let (mut t, mut s) = ts_list;
        let mut seen = HashSet::new();
        while t != 0 {
            if !seen.insert((t, s)) {
                return Err(FloppyError::corrupt("track/sector list loops"));
            }
            lists.push((t, s));
            let list = read_sector(self.disk, t, s)?;
            for pair in list[0x0C..0x0C + TS_PAIRS * 2].chunks_exact(2) {
                data.push((pair[0], pair[1]));
            }
            (t, s) = (list[1], list[2]);
        }
        while data.last().is_some_and(|&(t, _)| t == 0) {
            data.pop();
        }
        Ok((data, lists))
    }

    fn read_entry(&self, entry: &CatalogEntry) -> Result<Vec<u8>> {
        let (sectors, _) = self.file_sectors(entry.ts_list)?;
        let mut raw = Vec::with_capacity(sectors.len() * 256);
        for (t, s) in sectors {
            if t == 0 {
                raw.extend_from_slice(&[0u8; 256]);
            } else {
                raw.extend_from_slice(read_sector(self.disk, t, s)?);
            }
        }
        let len = match entry.file_type & 0x7F {
            0x00 => raw.iter().position(|&b| b == 0).unwrap_or(raw.len()),
            0x01 | 0x02 => 2 + u16::from_le_bytes([raw.first().copied().unwrap_or(0), raw.get(1).copied().unwrap_or(0)]) as usize,
            0x04 => 4 + u16::from_le_bytes([raw.get(2).copied().unwrap_or(0), raw.get(3).copied().unwrap_or(0)]) as usize,
            _ => raw.len(),
        };
        raw.truncate(len);
        Ok(raw)
    }

    fn plan_write(&self, path: &str, data: &[u8]) -> Result<WritePlan> {
        let (parent, name) = split_parent(path)?;
        flat_only(parent)?;
        if name.is_empty() || name.len() > 30 || !name.is_ascii() {
            return Err(FloppyError::invalid_arg(format!("'{}' is not a valid DOS 3.3 file name", name)));
        }
        let mut vtoc = self.vtoc.clone();
        let existing = self.entries.iter().find(|e| names_match(&e.name, name)).cloned();
        if let Some(old) = &existing {
            let (sectors, lists) = self.file_sectors(old.ts_list)?;
            for (t, s) in sectors.into_iter().chain(lists).filter(|&(t, _)| t != 0) {
                set_free(&mut vtoc, t, s, true);
            }
        }

        let data_count = data.len().div_ceil(256);
        let list_count = data_count.div_ceil(TS_PAIRS).max(1);
        let mut order: Vec<u8> = (VTOC_TRACK + 1..self.tracks()).collect();
        order.extend((1..VTOC_TRACK).rev());
        let mut free = Vec::with_capacity(data_count + list_count);
        'tracks: for t in order {
            for s in (0..SECTORS).rev() {
                if free.len() == data_count + list_count {
                    break 'tracks;
                }
                if is_free(&vtoc, t, s) {
                    set_free(&mut vtoc, t, s, false);
                    free.push((t, s));
                }
            }
        }
        if free.len() < data_count + list_count {
            return Err(FloppyError::DiskFull);
        }
        let (lists, sectors) = free.split_at(list_count);

        let mut plan = WritePlan::new();
        for (chunk, &(t, s)) in data.chunks(256).zip(sectors) {
            let mut sector = chunk.to_vec();
            sector.resize(256, 0);
            plan.put(address(t, s)?, sector);
        }
        for (i, &(t, s)) in lists.iter().enumerate() {
            let mut list = vec![0u8; 256];
            if let Some(&(nt, ns)) = lists.get(i + 1) {
                list[1] = nt;
                list[2] = ns;
            }
            list[5..7].copy_from_slice(&((i * TS_PAIRS) as u16).to_le_bytes());
            for (j, &(dt, ds)) in sectors.iter().skip(i * TS_PAIRS).take(TS_PAIRS).enumerate() {
                list[0x0C + j * 2] = dt;
                list[0x0D + j * 2] = ds;
            }
            plan.put(address(t, s)?, list);
        }

        let (catalog, slot) = match &existing {
            Some(e) => (e.catalog, e.slot),
            None => self.free_slot()?,
        };
        let mut sector = read_sector(self.disk, catalog.0, catalog.1)?.to_vec();
        let at = ENTRY_AT + slot * ENTRY_LEN;
        let e = &mut sector[at..at + ENTRY_LEN];
        let header_len = data.get(2..4).map(|b| u16::from_le_bytes([b[0], b[1]]) as usize + 4);
        e[0] = lists[0].0;
        e[1] = lists[0].1;
        e[2] = if header_len == Some(data.len()) { TYPE_BINARY } else { TYPE_SPECIAL };
        e[3..33].fill(0xA0);
        for (o, b) in e[3..33].iter_mut().zip(name.bytes()) {
            *o = b.to_ascii_uppercase() | 0x80;
        }
        e[33..35].copy_from_slice(&((data_count + list_count) as u16).to_le_bytes());
        plan.put(address(catalog.0, catalog.1)?, sector);
        plan.put(address(VTOC_TRACK, 0)?, vtoc);
        Ok(plan)
    }

    fn free_slot(&self) -> Result<((u8, u8), usize)> {
        for (t, s) in self.catalog_chain()? {
            let sector = read_sector(self.disk, t, s)?;
            let slot = (0..ENTRIES_PER_CATALOG).find(|&i| matches!(sector[ENTRY_AT + i * ENTRY_LEN], 0 | DELETED));
            if let Some(slot) = slot {
                return Ok(((t, s), slot));
            }
        }
        Err(FloppyError::DiskFull)
    }
}

fn bitmap_at(track: u8) -> usize {
    0x38 + 4 * track as usize
}

fn is_free(vtoc: &[u8], track: u8, sector: u8) -> bool {
    let at = bitmap_at(track);
    let word = u16::from_be_bytes([vtoc[at], vtoc[at + 1]]);
    word & (1 << sector) != 0
}

fn set_free(vtoc: &mut [u8], track: u8, sector: u8, free: bool) {
    let at = bitmap_at(track);
    let mut word = u16::from_be_bytes([vtoc[at], vtoc[at + 1]]);
    if free {
        word |= 1 << sector;
    } else {
        word &= !(1 << sector);
    }
    vtoc[at..at + 2].copy_from_slice(&word.to_be_bytes());
}

impl Volume for Dos33Volume<'_> {
    fn stat_fs(&self) -> FsInfo {
        let tracks = self.tracks();
        let free = (0..tracks)
            .flat_map(|t| (0..SECTORS).map(move |s| (t, s)))
            .filter(|&(t, s)| is_free(&self.vtoc, t, s))
            .count();
        FsInfo {
            fs_type: "DOS 3.3".to_string(),
            volume_name: format!("DISK VOLUME {}", self.vtoc[6]),
            block_size: 256,
            total_blocks: tracks as usize * SECTORS as usize,
            free_blocks: free,
        }
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        flat_only(path)?;
        let mut out = Vec::with_capacity(self.entries.len());
        for e in &self.entries {
            let size = self.read_entry(e).map(|d| d.len() as u64).unwrap_or(0);
            let mut entry = DirEntry::file(e.name.clone(), size).with_type(type_letter(e.file_type));
            entry.attributes = FileAttributes {
                read_only: e.file_type & 0x80 != 0,
                ..FileAttributes::default()
            };
            out.push(entry);
        }
        Ok(out)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let (parent, name) = split_parent(path)?;
        flat_only(parent)?;
        let entry = self
            .entries
            .iter()
            .find(|e| names_match(&e.name, name))
            .ok_or_else(|| FloppyError::NotFound(path.to_string()))?;
        self.read_entry(entry)
    }
}

/// Write an empty VTOC and catalog; tracks 0-2 stay allocated for the DOS image
pub fn format(disk: &mut Disk, volume: u8) -> Result<()> {
    let tracks = disk.cylinder_count().max(35);
    let mut vtoc = vec![0u8; 256];
    vtoc[1] = VTOC_TRACK;
    vtoc[2] = SECTORS - 1;
    vtoc[3] = 3;
    vtoc[6] = if volume == 0 { DEFAULT_VOLUME } else { volume };
    vtoc[0x27] = TS_PAIRS as u8;
    vtoc[0x30] = VTOC_TRACK + 1;
    vtoc[0x31] = 1;
    vtoc[0x34] = tracks;
    vtoc[0x35] = SECTORS;
    vtoc[0x37] = 1;
    for t in 3..tracks {
        if t != VTOC_TRACK {
            for s in 0..SECTORS {
                set_free(&mut vtoc, t, s, true);
            }
        }
    }
    let mut plan = WritePlan::new();
    for s in 1..SECTORS {
        let mut catalog = vec![0u8; 256];
        if s > 1 {
            catalog[1] = VTOC_TRACK;
            catalog[2] = s - 1;
        }
        plan.put(address(VTOC_TRACK, s)?, catalog);
    }
    plan.put(address(VTOC_TRACK, 0)?, vtoc);
    plan.apply(disk)
}

/// DOS 3.3 driver
#[derive(Debug, Clone, Copy, Default)]
pub struct Dos33Driver;

impl FilesystemDriver for Dos33Driver {
    fn name(&self) -> &'static str {
        "dos33"
    }

    fn probe(&self, disk: &Disk) -> u8 {
        let Ok(vtoc) = read_sector(disk, VTOC_TRACK, 0) else {
            return 0;
        };
        if vtoc.len() < 256 || vtoc[0x35] != SECTORS || vtoc[1] != VTOC_TRACK {
            return 0;
        }
        let mut score = 55;
        if vtoc[3] == 3 {
            score += 10;
        }
        if vtoc[0x27] as usize == TS_PAIRS {
            score += 10;
        }
        if Dos33Volume::open(disk).is_ok() {
            score += 20;
        }
        score
    }

    fn mount<'a>(&self, disk: &'a Disk) -> Result<Box<dyn Volume + 'a>> {
        Ok(Box::new(Dos33Volume::open(disk)?))
    }

    fn can_write(&self) -> bool {
        true
    }

    fn write(&self, disk: &mut Disk, path: &str, data: &[u8]) -> Result<()> {
        let plan = Dos33Volume::open(disk)?.plan_write(path, data)?;
        plan.apply(disk)
    }
}
