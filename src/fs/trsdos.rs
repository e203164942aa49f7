//! TRS-80 Model I TRSDOS 2.3 (read only)

use crate::disk::{Disk, SideMode};
use crate::error::{FloppyError, Result};
use crate::fs::{flat_only, split_parent, Blocks, DirEntry, FileAttributes, FilesystemDriver, FsInfo, SectorMap, Volume};

const SECTORS_PER_TRACK: usize = 10;
const SECTORS_PER_GRANULE: usize = 5;
const GRANULES_PER_TRACK: usize = 2;
const ENTRY_LEN: usize = 48;
const ENTRIES_PER_SECTOR: usize = 5;
const FIRST_DIR_SECTOR: usize = 2;

const ATTR_ACTIVE: u8 = 0x10;
const ATTR_SYSTEM: u8 = 0x40;
const ATTR_INVISIBLE: u8 = 0x08;
const ATTR_EXTENDED: u8 = 0x80;

#[derive(Debug, Clone)]
struct TrsEntry {
    name: String,
    attributes: u8,
    eof: u8,
    records: usize,
    extents: Vec<(u8, u8)>,
}

impl TrsEntry {
    fn parse(e: &[u8]) -> Option<Self> {
        if e[0] & ATTR_ACTIVE == 0 || e[0] & ATTR_EXTENDED != 0 {
            return None;
        }
        let name = crate::fs::padded_str(&e[5..13]);
        let ext = crate::fs::padded_str(&e[13..16]);
        if name.is_empty() || !e[5..16].iter().all(|&b| b == b' ' || b.is_ascii_alphanumeric()) {
            return None;
        }
        let extents = e[22..32]
            .chunks_exact(2)
            .take_while(|p| p[0] != 0xFF)
            .map(|p| (p[0], p[1]))
            .collect();
        Some(Self {
            name: if ext.is_empty() { name } else { format!("{}.{}", name, ext) },
            attributes: e[0],
            eof: e[3],
            records: u16::from_le_bytes([e[20], e[21]]) as usize,
            extents,
        })
    }

    fn size(&self) -> usize {
        match (self.records, self.eof) {
            (0, _) => 0,
            (n, 0) => n * 256,
            (n, eof) => (n - 1) * 256 + eof as usize,
        }
    }

    /// Logical sector numbers of the file's data
    fn sectors(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for &(track, granules) in &self.extents {
            let start = track as usize * SECTORS_PER_TRACK + (granules >> 5) as usize * SECTORS_PER_GRANULE;
            let count = ((granules & 0x1F) as usize + 1) * SECTORS_PER_GRANULE;
            out.extend(start..start + count);
        }
        out.truncate(self.records);
        out
    }
}

/// Mounted TRSDOS disk
pub struct TrsDosVolume<'a> {
    blocks: Blocks<'a>,
    dir_track: usize,
    gat: Vec<u8>,
    entries: Vec<TrsEntry>,
}

impl<'a> TrsDosVolume<'a> {
    /// Mount a disk
    pub fn open(disk: &'a Disk) -> Result<Self> {
        let blocks = Blocks::new(disk, SectorMap::linear(disk, SideMode::Alternate));
        let boot = blocks.sector(0)?;
        let dir_track = boot.get(2).copied().unwrap_or(0) as usize;
        if !matches!(boot[0], 0x00 | 0xFE) || dir_track == 0 || dir_track >= disk.cylinder_count() as usize {
            return Err(FloppyError::invalid_format("boot sector does not name a directory track"));
        }
        let base = dir_track * SECTORS_PER_TRACK;
        let gat = blocks.sector(base)?.to_vec();
        if gat.len() != 256 || gat[dir_track] == 0 {
            return Err(FloppyError::invalid_format("directory track is not allocated in the GAT"));
        }
        let mut entries = Vec::new();
        for s in FIRST_DIR_SECTOR..SECTORS_PER_TRACK {
            let sector = blocks.sector(base + s)?;
            for slot in 0..ENTRIES_PER_SECTOR {
                entries.extend(TrsEntry::parse(&sector[slot * ENTRY_LEN..(slot + 1) * ENTRY_LEN]));
            }
        }
        Ok(Self {
            blocks,
            dir_track,
            gat,
            entries,
        })
    }

    fn tracks(&self) -> usize {
        self.blocks.len() / SECTORS_PER_TRACK
    }
}

impl Volume for TrsDosVolume<'_> {
    fn stat_fs(&self) -> FsInfo {
        let tracks = self.tracks().min(0x60);
        let total = tracks * GRANULES_PER_TRACK;
        let used: usize = self.gat[..tracks].iter().map(|b| (b & 0x03).count_ones() as usize).sum();
        FsInfo {
            fs_type: "TRSDOS 2.3".to_string(),
            volume_name: crate::fs::padded_str(&self.gat[0xD0..0xD8]),
            block_size: SECTORS_PER_GRANULE * 256,
            total_blocks: total,
            free_blocks: total.saturating_sub(used),
        }
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        flat_only(path)?;
        Ok(self
            .entries
            .iter()
            .map(|e| {
                let mut entry = DirEntry::file(e.name.clone(), e.size() as u64);
                entry.attributes = FileAttributes {
                    system: e.attributes & ATTR_SYSTEM != 0,
                    hidden: e.attributes & ATTR_INVISIBLE != 0,
                    read_only: e.attributes & 0x07 >= 5,
                    ..FileAttributes::default()
                };
                entry
            })
            .collect())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let (parent, name) = split_parent(path)?;
        flat_only(parent)?;
        let entry = self
            .entries
            .iter()
            .find(|e| crate::fs::names_match(&e.name, name))
            .ok_or_else(|| FloppyError::NotFound(path.to_string()))?;
        let sectors = entry.sectors();
        if sectors.len() < entry.records {
            return Err(FloppyError::corrupt(format!("{}: extents cover fewer sectors than recorded", entry.name)));
        }
        let mut data = Vec::with_capacity(sectors.len() * 256);
        for lsn in sectors {
            if lsn / SECTORS_PER_TRACK == self.dir_track {
                return Err(FloppyError::corrupt(format!("{} points into the directory", entry.name)));
            }
            data.extend_from_slice(self.blocks.sector(lsn)?);
        }
        data.truncate(entry.size());
        Ok(data)
    }
}

/// TRSDOS driver
#[derive(Debug, Clone, Copy, Default)]
pub struct TrsDosDriver;

impl FilesystemDriver for TrsDosDriver {
    fn name(&self) -> &'static str {
        "trsdos"
    }

    fn probe(&self, disk: &Disk) -> u8 {
        let Ok(volume) = TrsDosVolume::open(disk) else {
            return 0;
        };
        let mut score = 30;
        if volume.dir_track == 17 {
            score += 15;
        }
        if volume.blocks.sector(0).map(|s| s.len() == 256).unwrap_or(false) {
            score += 10;
        }
        if !volume.entries.is_empty() {
            score += 20;
        }
        score
    }

    fn mount<'a>(&self, disk: &'a Disk) -> Result<Box<dyn Volume + 'a>> {
        Ok(Box::new(TrsDosVolume::open(disk)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::profile;

    fn sample() -> Disk {
        let mut disk = Disk::builder().profile(profile("trs80").unwrap()).build().unwrap();
        let mut boot = vec![0u8; 256];
        boot[0] = 0xFE;
        boot[2] = 17;
        disk.write_sector(0, 0, 0, &boot).unwrap();

        let mut gat = vec![0u8; 256];
        gat[0] = 0x03;
        gat[17] = 0x03;
        gat[20] = 0x02;
        gat[0xD0..0xD8].copy_from_slice(b"TRSDOS  ");
        disk.write_sector(17, 0, 0, &gat).unwrap();

        let mut dir = vec![0u8; 256];
        dir[0] = ATTR_ACTIVE;
        dir[3] = 0x10;
        dir[5..13].copy_from_slice(b"HELLO   ");
        dir[13..16].copy_from_slice(b"BAS");
        dir[20] = 2;
        dir[22] = 20;
        dir[23] = 1 << 5;
        dir[24..32].fill(0xFF);
        dir[48] = ATTR_ACTIVE | ATTR_SYSTEM | ATTR_EXTENDED;
        disk.write_sector(17, 0, 2, &dir).unwrap();

        disk.write_sector(20, 0, 5, &[b'x'; 256]).unwrap();
        disk.write_sector(20, 0, 6, &[b'y'; 256]).unwrap();
        disk
    }

    #[test]
    fn test_probe_and_read() {
        let disk = sample();
        assert_eq!(TrsDosDriver.probe(&disk), 75);
        let volume = TrsDosDriver.mount(&disk).unwrap();
        let entries = volume.readdir("/").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "HELLO.BAS");
        assert_eq!(entries[0].size, 256 + 0x10);
        let data = volume.read("hello.bas").unwrap();
        assert_eq!(data.len(), 272);
        assert_eq!(data[255], b'x');
        assert_eq!(data[256], b'y');
    }

    #[test]
    fn test_stat_fs() {
        let disk = sample();
        let volume = TrsDosDriver.mount(&disk).unwrap();
        let info = volume.stat_fs();
        assert_eq!(info.volume_name, "TRSDOS");
        assert_eq!(info.total_blocks, 80);
        assert_eq!(info.free_blocks, 80 - 5);
    }

    #[test]
    fn test_unformatted_rejected() {
        let disk = Disk::builder().profile(profile("trs80").unwrap()).build().unwrap();
        assert_eq!(TrsDosDriver.probe(&disk), 0);
    }
}
