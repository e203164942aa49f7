//! Commodore DOS (1541, 1571 and 1581)
//!
//! Tracks are numbered from 1 and sectors from 0, as CBM DOS numbers
//! them. A 1581 disk is stored physically as 80×2×10 sectors of 512
//! bytes, each holding two 256-byte DOS blocks.

use crate::disk::Disk;
use crate::error::{FloppyError, Result};
use crate::fs::{flat_only, names_match, split_parent, DirEntry, FileAttributes, FilesystemDriver, FsInfo, Volume, WritePlan};
use crate::profile::c64_zone;
use std::collections::HashSet;

/// Bytes in a DOS block
pub const BLOCK_SIZE: usize = 256;
/// Padding byte in names
const SHIFT_SPACE: u8 = 0xA0;

const FILE_TYPES: [&str; 6] = ["DEL", "SEQ", "PRG", "USR", "REL", "CBM"];

/// Drive family the disk was formatted by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbmLayout {
    /// 1541, 35 or 40 tracks
    D1541 {
        /// Track count
        tracks: u8,
    },
    /// 1571 double sided
    D1571,
    /// 1581 3.5"
    D1581,
}

impl CbmLayout {
    /// Work out the layout from a disk's shape
    pub fn for_disk(disk: &Disk) -> Self {
        let sector_size = disk.track(0, 0).and_then(|t| t.uniform_sector_size()).unwrap_or(BLOCK_SIZE);
        if sector_size == 512 {
            CbmLayout::D1581
        } else if disk.head_count() > 1 {
            CbmLayout::D1571
        } else {
            CbmLayout::D1541 {
                tracks: disk.cylinder_count().max(35),
            }
        }
    }

    /// Track holding the header and directory
    pub fn dir_track(&self) -> u8 {
        match self {
            CbmLayout::D1581 => 40,
            _ => 18,
        }
    }

    /// Highest track number
    pub fn tracks(&self) -> u8 {
        match *self {
            CbmLayout::D1541 { tracks } => tracks,
            CbmLayout::D1571 => 70,
            CbmLayout::D1581 => 80,
        }
    }

    /// Sectors on a track
    pub fn sectors_in(&self, track: u8) -> u8 {
        match self {
            CbmLayout::D1541 { .. } => c64_zone(track - 1),
            CbmLayout::D1571 if track > 35 => c64_zone(track - 36),
            CbmLayout::D1571 => c64_zone(track - 1),
            CbmLayout::D1581 => 40,
        }
    }

    /// Physical sector holding a block, and the block's offset inside it
    pub fn locate(&self, track: u8, sector: u8) -> Result<((u8, u8, u8), usize)> {
        if track == 0 || track > self.tracks() || sector >= self.sectors_in(track) {
            return Err(FloppyError::corrupt(format!("block {}/{} outside the disk", track, sector)));
        }
        Ok(match self {
            CbmLayout::D1541 { .. } => ((track - 1, 0, sector), 0),
            CbmLayout::D1571 if track > 35 => ((track - 36, 1, sector), 0),
            CbmLayout::D1571 => ((track - 1, 0, sector), 0),
            CbmLayout::D1581 => ((track - 1, sector / 20, (sector % 20) / 2 + 1), (sector as usize % 2) * BLOCK_SIZE),
        })
    }

    fn dos_type(&self) -> u8 {
        match self {
            CbmLayout::D1581 => b'D',
            _ => b'A',
        }
    }
}

/// Read one 256-byte DOS block
pub fn read_block(disk: &Disk, layout: CbmLayout, track: u8, sector: u8) -> Result<&[u8]> {
    let ((c, h, s), offset) = layout.locate(track, sector)?;
    let data = disk.read_sector(c, h, s)?;
    data.get(offset..offset + BLOCK_SIZE)
        .ok_or_else(|| FloppyError::corrupt(format!("block {}/{} is short", track, sector)))
}

/// PETSCII name field to text
fn petscii_name(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != SHIFT_SPACE)
        .map(|&b| match b {
            0x20..=0x7E => b as char,
            0xC1..=0xDA => (b - 0x80) as char,
            _ => '?',
        })
        .collect()
}

/// Text to a 16-byte PETSCII name field
pub fn to_petscii(name: &str) -> Result<[u8; 16]> {
    if name.is_empty() || name.len() > 16 || !name.is_ascii() {
        return Err(FloppyError::invalid_arg(format!("'{}' is not a valid CBM file name", name)));
    }
    let mut out = [SHIFT_SPACE; 16];
    for (o, b) in out.iter_mut().zip(name.bytes()) {
        *o = b.to_ascii_uppercase();
    }
    Ok(out)
}

#[derive(Debug, Clone)]
struct CbmEntry {
    dir_block: (u8, u8),
    slot: usize,
    file_type: u8,
    start: (u8, u8),
    name: String,
    blocks: u16,
}

impl CbmEntry {
    fn kind_name(&self) -> &'static str {
        FILE_TYPES.get((self.file_type & 0x07) as usize).copied().unwrap_or("???")
    }
}

/// Mounted CBM DOS disk
pub struct CbmVolume<'a> {
    disk: &'a Disk,
    layout: CbmLayout,
    header: Vec<u8>,
    bam: Vec<Vec<u8>>,
    entries: Vec<CbmEntry>,
}

impl<'a> CbmVolume<'a> {
    /// Mount a disk
    pub fn open(disk: &'a Disk) -> Result<Self> {
        let layout = CbmLayout::for_disk(disk);
        let dir_track = layout.dir_track();
        let header = read_block(disk, layout, dir_track, 0)?.to_vec();
        if header[2] != layout.dos_type() {
            return Err(FloppyError::invalid_format(format!(
                "DOS version byte {:02X} is not CBM DOS",
                header[2]
            )));
        }
        let mut bam = vec![header.clone()];
        match layout {
            CbmLayout::D1571 => bam.push(read_block(disk, layout, 53, 0)?.to_vec()),
            CbmLayout::D1581 => {
                bam = vec![
                    read_block(disk, layout, 40, 1)?.to_vec(),
                    read_block(disk, layout, 40, 2)?.to_vec(),
                ];
            }
            CbmLayout::D1541 { .. } => {}
        }
        let mut volume = Self {
            disk,
            layout,
            header,
            bam,
            entries: Vec::new(),
        };
        volume.entries = volume.read_directory()?;
        Ok(volume)
    }

    /// Drive layout in use
    pub fn layout(&self) -> CbmLayout {
        self.layout
    }

    fn block(&self, track: u8, sector: u8) -> Result<&'a [u8]> {
        read_block(self.disk, self.layout, track, sector)
    }

    fn directory_chain(&self) -> Result<Vec<(u8, u8)>> {
        let (mut t, mut s) = match self.layout {
            CbmLayout::D1581 => (self.header[0], self.header[1]),
            _ => (self.layout.dir_track(), 1),
        };
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        while t != 0 {
            if !seen.insert((t, s)) {
                return Err(FloppyError::corrupt("directory chain loops"));
            }
            chain.push((t, s));
            let block = self.block(t, s)?;
            (t, s) = (block[0], block[1]);
        }
        Ok(chain)
    }

    fn read_directory(&self) -> Result<Vec<CbmEntry>> {
        let mut entries = Vec::new();
        for (t, s) in self.directory_chain()? {
            let block = self.block(t, s)?;
            for slot in 0..8 {
                let e = &block[slot * 32..slot * 32 + 32];
                if e[2] & 0x07 == 0 && e[2] & 0x80 == 0 {
                    continue;
                }
                entries.push(CbmEntry {
                    dir_block: (t, s),
                    slot,
                    file_type: e[2],
                    start: (e[3], e[4]),
                    name: petscii_name(&e[5..21]),
                    blocks: u16::from_le_bytes([e[30], e[31]]),
                });
            }
        }
        Ok(entries)
    }

    /// Blocks of a file, following the track/sector links
    fn chain(&self, start: (u8, u8)) -> Result<Vec<(u8, u8)>> {
        let (mut t, mut s) = start;
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        while t != 0 {
            if !seen.insert((t, s)) {
                return Err(FloppyError::corrupt(format!("file chain loops at {}/{}", t, s)));
            }
            chain.push((t, s));
            let block = self.block(t, s)?;
            (t, s) = (block[0], block[1]);
        }
        Ok(chain)
    }

    fn read_chain(&self, start: (u8, u8)) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        for (t, s) in self.chain(start)? {
            let block = self.block(t, s)?;
            if block[0] == 0 {
                let last = (block[1] as usize).clamp(1, 255);
                data.extend_from_slice(&block[2..=last]);
            } else {
                data.extend_from_slice(&block[2..]);
            }
        }
        Ok(data)
    }

    /// BAM page and offset of a track's free count
    fn bam_entry(&self, track: u8) -> Option<(usize, usize)> {
        match self.layout {
            CbmLayout::D1541 { .. } | CbmLayout::D1571 if track <= 35 => Some((0, 4 + 4 * (track as usize - 1))),
            CbmLayout::D1571 if track <= 70 => Some((0, 0xDD + track as usize - 36)),
            CbmLayout::D1581 if track <= 40 => Some((0, 0x10 + 6 * (track as usize - 1))),
            CbmLayout::D1581 if track <= 80 => Some((1, 0x10 + 6 * (track as usize - 41))),
            _ => None,
        }
    }

    fn free_on(&self, track: u8) -> usize {
        self.bam_entry(track)
            .map(|(page, at)| self.bam[page][at] as usize)
            .unwrap_or(0)
    }

    fn plan_write(&self, path: &str, data: &[u8]) -> Result<WritePlan> {
        if !matches!(self.layout, CbmLayout::D1541 { .. }) {
            return Err(FloppyError::unsupported("writing is only supported on 1541 disks"));
        }
        let (parent, name) = split_parent(path)?;
        flat_only(parent)?;
        let pet = to_petscii(name)?;
        let mut bam = self.header.clone();
        let existing = self.entries.iter().find(|e| names_match(&e.name, name)).cloned();
        if let Some(old) = &existing {
            for (t, s) in self.chain(old.start)? {
                set_free(&mut bam, t, s, true);
            }
        }

        let needed = data.len().div_ceil(254).max(1);
        let mut allocated = Vec::with_capacity(needed);
        let dir_track = self.layout.dir_track();
        let mut order: Vec<u8> = Vec::new();
        for d in 1..35u8 {
            order.extend([dir_track.wrapping_sub(d), dir_track + d].into_iter().filter(|&t| (1..=35).contains(&t)));
        }
        'tracks: for t in order {
            let count = self.layout.sectors_in(t);
            let mut s = 0u8;
            for _ in 0..count {
                if allocated.len() == needed {
                    break 'tracks;
                }
                if is_bam_free(&bam, t, s) {
                    set_free(&mut bam, t, s, false);
                    allocated.push((t, s));
                    s = (s + 10) % count;
                } else {
                    s = (s + 1) % count;
                }
            }
        }
        if allocated.len() < needed {
            return Err(FloppyError::DiskFull);
        }

        let mut plan = WritePlan::new();
        let mut chunks = data.chunks(254);
        for (i, &(t, s)) in allocated.iter().enumerate() {
            let chunk = chunks.next().unwrap_or(&[]);
            let mut block = vec![0u8; BLOCK_SIZE];
            match allocated.get(i + 1) {
                Some(&(nt, ns)) => {
                    block[0] = nt;
                    block[1] = ns;
                }
                None => block[1] = (chunk.len() + 1) as u8,
            }
            block[2..2 + chunk.len()].copy_from_slice(chunk);
            plan.put(self.layout.locate(t, s)?.0, block);
        }

        let (dir_block, slot) = match &existing {
            Some(e) => (e.dir_block, e.slot),
            None => self.free_slot(&mut bam, &mut plan)?,
        };
        let address = self.layout.locate(dir_block.0, dir_block.1)?.0;
        let mut block = match plan.get(address) {
            Some(b) => b.to_vec(),
            None => self.block(dir_block.0, dir_block.1)?.to_vec(),
        };
        let e = &mut block[slot * 32..slot * 32 + 32];
        e[2..].fill(0);
        e[2] = 0x82;
        e[3] = allocated[0].0;
        e[4] = allocated[0].1;
        e[5..21].copy_from_slice(&pet);
        e[30..32].copy_from_slice(&(allocated.len() as u16).to_le_bytes());
        plan.put(address, block);
        plan.put(self.layout.locate(dir_track, 0)?.0, bam);
        Ok(plan)
    }

    fn free_slot(&self, bam: &mut [u8], plan: &mut WritePlan) -> Result<((u8, u8), usize)> {
        let chain = self.directory_chain()?;
        for &(t, s) in &chain {
            let block = self.block(t, s)?;
            if let Some(slot) = (0..8).find(|&i| block[i * 32 + 2] == 0) {
                return Ok(((t, s), slot));
            }
        }
        let dir_track = self.layout.dir_track();
        let last = *chain.last().ok_or_else(|| FloppyError::corrupt("empty directory chain"))?;
        let fresh = (1..self.layout.sectors_in(dir_track))
            .find(|&s| is_bam_free(bam, dir_track, s))
            .ok_or(FloppyError::DiskFull)?;
        set_free(bam, dir_track, fresh, false);
        let mut tail = self.block(last.0, last.1)?.to_vec();
        tail[0] = dir_track;
        tail[1] = fresh;
        plan.put(self.layout.locate(last.0, last.1)?.0, tail);
        let mut block = vec![0u8; BLOCK_SIZE];
        block[1] = 0xFF;
        plan.put(self.layout.locate(dir_track, fresh)?.0, block);
        Ok(((dir_track, fresh), 0))
    }
}

fn is_bam_free(bam: &[u8], track: u8, sector: u8) -> bool {
    let at = 4 + 4 * (track as usize - 1);
    bam[at + 1 + sector as usize / 8] & (1 << (sector % 8)) != 0
}

fn set_free(bam: &mut [u8], track: u8, sector: u8, free: bool) {
    let at = 4 + 4 * (track as usize - 1);
    let bit = 1 << (sector % 8);
    let byte = &mut bam[at + 1 + sector as usize / 8];
    let was = *byte & bit != 0;
    if free && !was {
        *byte |= bit;
        bam[at] = bam[at].saturating_add(1);
    } else if !free && was {
        *byte &= !bit;
        bam[at] = bam[at].saturating_sub(1);
    }
}

impl Volume for CbmVolume<'_> {
    fn stat_fs(&self) -> FsInfo {
        let dir_track = self.layout.dir_track();
        let tracks = match self.layout {
            CbmLayout::D1541 { .. } => 35,
            other => other.tracks(),
        };
        let free = (1..=tracks).filter(|&t| t != dir_track).map(|t| self.free_on(t)).sum();
        let total = (1..=self.layout.tracks())
            .filter(|&t| t != dir_track)
            .map(|t| self.layout.sectors_in(t) as usize)
            .sum();
        let name_at = if self.layout == CbmLayout::D1581 { 0x04 } else { 0x90 };
        FsInfo {
            fs_type: match self.layout {
                CbmLayout::D1541 { .. } => "CBM DOS 2.6",
                CbmLayout::D1571 => "CBM DOS 3.0",
                CbmLayout::D1581 => "CBM DOS 10.0",
            }
            .to_string(),
            volume_name: petscii_name(&self.header[name_at..name_at + 16]),
            block_size: BLOCK_SIZE,
            total_blocks: total,
            free_blocks: free,
        }
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        flat_only(path)?;
        let mut out = Vec::with_capacity(self.entries.len());
        for e in &self.entries {
            let size = if e.file_type & 0x07 == 0 {
                0
            } else {
                self.read_chain(e.start).map(|d| d.len() as u64).unwrap_or(e.blocks as u64 * 254)
            };
            let mut entry = DirEntry::file(e.name.clone(), size).with_type(e.kind_name());
            entry.attributes = FileAttributes {
                read_only: e.file_type & 0x40 != 0,
                hidden: e.file_type & 0x80 == 0,
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
        self.read_chain(entry.start)
    }
}

/// Lay down an empty 1541 BAM and directory
pub fn format(disk: &mut Disk, name: &str, id: &str) -> Result<()> {
    let layout = CbmLayout::for_disk(disk);
    let CbmLayout::D1541 { .. } = layout else {
        return Err(FloppyError::unsupported("only 1541 disks can be formatted"));
    };
    let mut bam = vec![0u8; BLOCK_SIZE];
    bam[0] = 18;
    bam[1] = 1;
    bam[2] = b'A';
    for t in 1..=35u8 {
        for s in 0..layout.sectors_in(t) {
            set_free(&mut bam, t, s, true);
        }
    }
    set_free(&mut bam, 18, 0, false);
    set_free(&mut bam, 18, 1, false);
    bam[0x90..0xAB].fill(SHIFT_SPACE);
    bam[0x90..0xA0].copy_from_slice(&to_petscii(name)?);
    for (o, b) in bam[0xA2..0xA4].iter_mut().zip(id.bytes().chain(std::iter::repeat(b'0'))) {
        *o = b.to_ascii_uppercase();
    }
    bam[0xA5] = b'2';
    bam[0xA6] = b'A';
    let mut dir = vec![0u8; BLOCK_SIZE];
    dir[1] = 0xFF;
    let mut plan = WritePlan::new();
    plan.put(layout.locate(18, 0)?.0, bam);
    plan.put(layout.locate(18, 1)?.0, dir);
    plan.apply(disk)
}

/// Commodore DOS driver
#[derive(Debug, Clone, Copy, Default)]
pub struct CbmDosDriver;

impl FilesystemDriver for CbmDosDriver {
    fn name(&self) -> &'static str {
        "cbm"
    }

    fn probe(&self, disk: &Disk) -> u8 {
        let layout = CbmLayout::for_disk(disk);
        let Ok(header) = read_block(disk, layout, layout.dir_track(), 0) else {
            return 0;
        };
        if header[2] != layout.dos_type() {
            return 0;
        }
        let mut score = 50;
        if header[0] == layout.dir_track() {
            score += 20;
        }
        if CbmVolume::open(disk).is_ok() {
            score += 25;
        }
        score
    }

    fn mount<'a>(&self, disk: &'a Disk) -> Result<Box<dyn Volume + 'a>> {
        Ok(Box::new(CbmVolume::open(disk)?))
    }

    fn can_write(&self) -> bool {
        true
    }

    fn write(&self, disk: &mut Disk, path: &str, data: &[u8]) -> Result<()> {
        let plan = CbmVolume::open(disk)?.plan_write(path, data)?;
        plan.apply(disk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::profile;

    fn blank_d64() -> Disk {
        let mut disk = Disk::builder().profile(profile("c64").unwrap()).build().unwrap();
        format(&mut disk, "TEST DISK", "01").unwrap();
        disk
    }

    #[test]
    fn test_layout_locate() {
        let d71 = CbmLayout::D1571;
        assert_eq!(d71.locate(36, 0).unwrap().0, (0, 1, 0));
        let d81 = CbmLayout::D1581;
        assert_eq!(d81.locate(40, 3).unwrap(), ((39, 0, 2), 256));
        assert_eq!(d81.locate(1, 25).unwrap(), ((0, 1, 3), 256));
        assert!(CbmLayout::D1541 { tracks: 35 }.locate(18, 19).is_err());
    }

    #[test]
    fn test_format_bam() {
        let disk = blank_d64();
        assert_eq!(disk.read_sector(17, 0, 0).unwrap()[2], 0x41);
        assert!(CbmDosDriver.probe(&disk) >= 90);
        let volume = CbmDosDriver.mount(&disk).unwrap();
        let info = volume.stat_fs();
        assert_eq!(info.volume_name, "TEST DISK");
        assert_eq!(info.free_blocks, 664);
        assert!(volume.readdir("/").unwrap().is_empty());
    }

    #[test]
    fn test_write_and_read() {
        let mut disk = blank_d64();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        CbmDosDriver.write(&mut disk, "/hello", &data).unwrap();
        let volume = CbmDosDriver.mount(&disk).unwrap();
        let entries = volume.readdir("/").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "HELLO");
        assert_eq!(entries[0].file_type.as_deref(), Some("PRG"));
        assert_eq!(entries[0].size, 1000);
        assert_eq!(volume.read("HELLO").unwrap(), data);
        assert_eq!(volume.stat_fs().free_blocks, 664 - 4);
    }

    #[test]
    fn test_replace_frees_blocks() {
        let mut disk = blank_d64();
        CbmDosDriver.write(&mut disk, "A", &[1u8; 600]).unwrap();
        CbmDosDriver.write(&mut disk, "A", &[2u8; 10]).unwrap();
        let volume = CbmDosDriver.mount(&disk).unwrap();
        assert_eq!(volume.readdir("/").unwrap().len(), 1);
        assert_eq!(volume.read("A").unwrap(), vec![2u8; 10]);
        assert_eq!(volume.stat_fs().free_blocks, 663);
    }

    #[test]
    fn test_directory_grows() {
        let mut disk = blank_d64();
        for i in 0..10 {
            CbmDosDriver.write(&mut disk, &format!("FILE{}", i), &[i as u8; 20]).unwrap();
        }
        let volume = CbmDosDriver.mount(&disk).unwrap();
        assert_eq!(volume.readdir("/").unwrap().len(), 10);
        assert_eq!(volume.read("FILE9").unwrap(), vec![9u8; 20]);
    }

    #[test]
    fn test_petscii() {
        assert_eq!(petscii_name(&[b'A', 0xC2, SHIFT_SPACE, b'X']), "AB");
        assert!(to_petscii("THIS NAME IS TOO LONG").is_err());
    }
}
