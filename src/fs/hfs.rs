//! Macintosh HFS (read only)
//!
//! The master directory block sits in 512-byte sector 2. The catalog
//! and extents-overflow files are B-trees stored in allocation blocks;
//! both are loaded whole at mount since floppy catalogs are small.

use crate::disk::Disk;
use crate::error::{FloppyError, Result};
use crate::fs::{components, names_match, Blocks, DirEntry, FilesystemDriver, FsInfo, Volume};
use crate::io::{be16, be32};
use chrono::{Duration, NaiveDate, NaiveDateTime};

/// "BD"
pub const HFS_SIGNATURE: u16 = 0x4244;
const MDB_SECTOR: usize = 2;
const ROOT_PARENT: u32 = 1;
const ROOT_DIR: u32 = 2;

const REC_DIRECTORY: u8 = 1;
const REC_FILE: u8 = 2;
const NODE_LEAF: u8 = 0xFF;
const NODE_HEADER: u8 = 1;

/// Seconds since 1904-01-01 to a timestamp
pub fn mac_datetime(seconds: u32) -> Option<NaiveDateTime> {
    if seconds == 0 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1904, 1, 1)?.and_hms_opt(0, 0, 0)?;
    epoch.checked_add_signed(Duration::seconds(seconds as i64))
}

fn mac_roman(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() && b >= 0x20 { b as char } else { '?' })
        .collect()
}

fn pascal(data: &[u8], at: usize, max: usize) -> String {
    let len = (data.get(at).copied().unwrap_or(0) as usize).min(max);
    data.get(at + 1..at + 1 + len).map(mac_roman).unwrap_or_default()
}

type Extents = Vec<(u32, u32)>;

fn extent_record(data: &[u8], at: usize) -> Extents {
    (0..3)
        .map(|i| (be16(data, at + i * 4) as u32, be16(data, at + i * 4 + 2) as u32))
        .filter(|&(_, count)| count > 0)
        .collect()
}

/// Every leaf record of a B-tree file, as (key, data)
fn leaf_records(tree: &[u8]) -> Result<Vec<(&[u8], &[u8])>> {
    if tree.len() < 512 || tree[8] != NODE_HEADER {
        return Err(FloppyError::corrupt("B-tree has no header node"));
    }
    let node_size = be16(tree, 14 + 18) as usize;
    if !node_size.is_power_of_two() || node_size < 512 {
        return Err(FloppyError::corrupt(format!("B-tree node size {}", node_size)));
    }
    let mut node = be32(tree, 14 + 10) as usize;
    let mut out = Vec::new();
    let mut visited = 0;
    while node != 0 {
        visited += 1;
        let start = node * node_size;
        let data = tree
            .get(start..start + node_size)
            .ok_or_else(|| FloppyError::corrupt(format!("B-tree node {} beyond file", node)))?;
        if data[8] != NODE_LEAF || visited > tree.len() / node_size {
            return Err(FloppyError::corrupt("B-tree leaf chain is broken"));
        }
        for i in 0..be16(data, 10) as usize {
            let offset = be16(data, node_size - 2 * (i + 1)) as usize;
            let next = be16(data, node_size - 2 * (i + 2)) as usize;
            let key_len = data.get(offset).copied().unwrap_or(0) as usize;
            let record_start = (offset + key_len + 2) & !1;
            if offset >= node_size || record_start > next || next > node_size {
                return Err(FloppyError::corrupt(format!("bad record offset in node {}", node)));
            }
            out.push((&data[offset..offset + key_len + 1], &data[record_start..next]));
        }
        node = be32(data, 0) as usize;
    }
    Ok(out)
}

#[derive(Debug, Clone)]
struct CatalogRecord {
    parent: u32,
    name: String,
    id: u32,
    is_dir: bool,
    data_size: u32,
    data_extents: Extents,
    type_code: String,
    modified: Option<NaiveDateTime>,
    locked: bool,
}

impl CatalogRecord {
    fn parse(key: &[u8], data: &[u8]) -> Option<Self> {
        let parent = be32(key, 2);
        let name = pascal(key, 6, 31);
        match data.first().copied()? {
            REC_DIRECTORY if data.len() >= 70 => Some(Self {
                parent,
                name,
                id: be32(data, 6),
                is_dir: true,
                data_size: 0,
                data_extents: Vec::new(),
                type_code: String::new(),
                modified: mac_datetime(be32(data, 14)),
                locked: false,
            }),
            REC_FILE if data.len() >= 102 => Some(Self {
                parent,
                name,
                id: be32(data, 20),
                is_dir: false,
                data_size: be32(data, 26),
                data_extents: extent_record(data, 74),
                type_code: mac_roman(&data[4..8]),
                modified: mac_datetime(be32(data, 48)),
                locked: data[2] & 0x01 != 0,
            }),
            _ => None,
        }
    }

    fn to_dir_entry(&self) -> DirEntry {
        let mut entry = if self.is_dir {
            DirEntry::directory(self.name.clone())
        } else {
            DirEntry::file(self.name.clone(), self.data_size as u64).with_type(self.type_code.clone())
        };
        entry.attributes.read_only = self.locked;
        entry.modified = self.modified;
        entry
    }
}

/// Mounted HFS volume
pub struct HfsVolume<'a> {
    blocks: Blocks<'a>,
    mdb: Vec<u8>,
    catalog: Vec<CatalogRecord>,
    overflow: Vec<(u32, u16, Extents)>,
}

impl<'a> HfsVolume<'a> {
    /// Mount a disk
    pub fn open(disk: &'a Disk) -> Result<Self> {
        let blocks = Blocks::linear(disk);
        let mdb = blocks.sector(MDB_SECTOR)?.to_vec();
        if be16(&mdb, 0) != HFS_SIGNATURE {
            return Err(FloppyError::invalid_format("no HFS master directory block"));
        }
        let mut volume = Self {
            blocks,
            mdb,
            catalog: Vec::new(),
            overflow: Vec::new(),
        };
        let extents_file = volume.read_fork(&extent_record(&volume.mdb, 0x86), be32(&volume.mdb, 0x82) as usize)?;
        if !extents_file.is_empty() {
            volume.overflow = leaf_records(&extents_file)?
                .into_iter()
                .filter(|(key, _)| key.get(1) == Some(&0))
                .map(|(key, data)| (be32(key, 2), be16(key, 6), extent_record(data, 0)))
                .filter(|(_, _, e)| !e.is_empty())
                .collect();
        }
        let catalog_file = volume.read_fork(&extent_record(&volume.mdb, 0x96), be32(&volume.mdb, 0x92) as usize)?;
        volume.catalog = leaf_records(&catalog_file)?
            .into_iter()
            .filter_map(|(key, data)| CatalogRecord::parse(key, data))
            .collect();
        Ok(volume)
    }

    fn block_size(&self) -> usize {
        be32(&self.mdb, 0x14) as usize
    }

    fn read_fork(&self, extents: &[(u32, u32)], size: usize) -> Result<Vec<u8>> {
        let sectors_per_block = self.block_size() / 512;
        if sectors_per_block == 0 {
            return Err(FloppyError::corrupt("allocation block smaller than a sector"));
        }
        let first = be16(&self.mdb, 0x1C) as usize;
        let mut out = Vec::with_capacity(size);
        for &(start, count) in extents {
            if out.len() >= size {
                break;
            }
            let lba = first + start as usize * sectors_per_block;
            out.extend(self.blocks.run(lba, count as usize * sectors_per_block)?);
        }
        if out.len() < size {
            return Err(FloppyError::corrupt(format!("fork of {} bytes has only {} allocated", size, out.len())));
        }
        out.truncate(size);
        Ok(out)
    }

    fn file_extents(&self, record: &CatalogRecord) -> Extents {
        let mut extents = record.data_extents.clone();
        let mut covered: u32 = extents.iter().map(|&(_, c)| c).sum();
        let mut overflow: Vec<_> = self.overflow.iter().filter(|(id, _, _)| *id == record.id).collect();
        overflow.sort_by_key(|(_, start, _)| *start);
        for (_, start, more) in overflow {
            if *start as u32 == covered {
                covered += more.iter().map(|&(_, c)| c).sum::<u32>();
                extents.extend(more.iter().copied());
            }
        }
        extents
    }

    fn resolve(&self, path: &str) -> Result<Option<&CatalogRecord>> {
        let mut dir = ROOT_DIR;
        let mut found = None;
        for part in components(path) {
            if found.is_some_and(|r: &CatalogRecord| !r.is_dir) {
                return Err(FloppyError::NotFound(path.to_string()));
            }
            let record = self
                .catalog
                .iter()
                .find(|r| r.parent == dir && names_match(&r.name, part))
                .ok_or_else(|| FloppyError::NotFound(path.to_string()))?;
            dir = record.id;
            found = Some(record);
        }
        Ok(found)
    }
}

impl Volume for HfsVolume<'_> {
    fn stat_fs(&self) -> FsInfo {
        FsInfo {
            fs_type: "HFS".to_string(),
            volume_name: pascal(&self.mdb, 0x24, 27),
            block_size: self.block_size(),
            total_blocks: be16(&self.mdb, 0x12) as usize,
            free_blocks: be16(&self.mdb, 0x22) as usize,
        }
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = match self.resolve(path)? {
            None => ROOT_DIR,
            Some(r) if r.is_dir => r.id,
            Some(_) => return Err(FloppyError::invalid_arg(format!("{} is not a directory", path))),
        };
        Ok(self
            .catalog
            .iter()
            .filter(|r| r.parent == dir && r.parent != ROOT_PARENT)
            .map(CatalogRecord::to_dir_entry)
            .collect())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let record = self
            .resolve(path)?
            .filter(|r| !r.is_dir)
            .ok_or_else(|| FloppyError::NotFound(path.to_string()))?;
        self.read_fork(&self.file_extents(record), record.data_size as usize)
    }

    fn stat(&self, path: &str) -> Result<DirEntry> {
        match self.resolve(path)? {
            Some(r) => Ok(r.to_dir_entry()),
            None => Ok(DirEntry::directory("/")),
        }
    }
}

/// HFS driver
#[derive(Debug, Clone, Copy, Default)]
pub struct HfsDriver;

impl FilesystemDriver for HfsDriver {
    fn name(&self) -> &'static str {
        "hfs"
    }

    fn probe(&self, disk: &Disk) -> u8 {
        let blocks = Blocks::linear(disk);
        match blocks.sector(MDB_SECTOR) {
            Ok(mdb) if be16(mdb, 0) == HFS_SIGNATURE => {
                if HfsVolume::open(disk).is_ok() {
                    95
                } else {
                    45
                }
            }
            _ => 0,
        }
    }

    fn mount<'a>(&self, disk: &'a Disk) -> Result<Box<dyn Volume + 'a>> {
        Ok(Box::new(HfsVolume::open(disk)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::Geometry;

    fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
        buf[at..at + bytes.len()].copy_from_slice(bytes);
    }

    fn key(parent: u32, name: &str) -> Vec<u8> {
        let mut k = vec![(6 + name.len()) as u8, 0];
        k.extend(parent.to_be_bytes());
        k.push(name.len() as u8);
        k.extend(name.as_bytes());
        if k.len() % 2 == 1 {
            k.push(0);
        }
        k
    }

    fn dir_record(id: u32) -> Vec<u8> {
        let mut r = vec![0u8; 70];
        r[0] = REC_DIRECTORY;
        put(&mut r, 6, &id.to_be_bytes());
        r
    }

    fn file_record(id: u32, size: u32, start: u16, count: u16) -> Vec<u8> {
        let mut r = vec![0u8; 102];
        r[0] = REC_FILE;
        put(&mut r, 4, b"TEXTttxt");
        put(&mut r, 20, &id.to_be_bytes());
        put(&mut r, 26, &size.to_be_bytes());
        put(&mut r, 48, &(3_600u32 * 24 * 366).to_be_bytes());
        put(&mut r, 74, &start.to_be_bytes());
        put(&mut r, 76, &count.to_be_bytes());
        r
    }

    /// 800 sectors of 512, 1K allocation blocks starting at sector 4,
    /// catalog in blocks 0-1 (two 512-byte nodes), files after it
    fn sample() -> Disk {
        let mut disk = Disk::builder().geometry(Geometry::new(80, 1, 11, 512)).build().unwrap();
        let mut mdb = vec![0u8; 512];
        put(&mut mdb, 0, &HFS_SIGNATURE.to_be_bytes());
        put(&mut mdb, 0x12, &398u16.to_be_bytes());
        put(&mut mdb, 0x14, &1024u32.to_be_bytes());
        put(&mut mdb, 0x1C, &4u16.to_be_bytes());
        put(&mut mdb, 0x22, &390u16.to_be_bytes());
        put(&mut mdb, 0x24, b"\x07Sampler");
        put(&mut mdb, 0x92, &1024u32.to_be_bytes());
        put(&mut mdb, 0x96, &0u16.to_be_bytes());
        put(&mut mdb, 0x98, &1u16.to_be_bytes());
        disk.write_sector(0, 0, 3, &mdb).unwrap();

        let mut header = vec![0u8; 512];
        header[8] = NODE_HEADER;
        put(&mut header, 10, &3u16.to_be_bytes());
        put(&mut header, 14 + 10, &1u32.to_be_bytes());
        put(&mut header, 14 + 18, &512u16.to_be_bytes());
        disk.write_sector(0, 0, 5, &header).unwrap();

        let records = [
            (key(ROOT_PARENT, "Sampler"), dir_record(ROOT_DIR)),
            (key(ROOT_DIR, "Folder"), dir_record(16)),
            (key(ROOT_DIR, "Read Me"), file_record(17, 1500, 1, 2)),
            (key(16, "Inner"), file_record(18, 4, 3, 1)),
        ];
        let mut leaf = vec![0u8; 512];
        leaf[8] = NODE_LEAF;
        put(&mut leaf, 10, &(records.len() as u16).to_be_bytes());
        let mut at = 14;
        for (i, (k, r)) in records.iter().enumerate() {
            put(&mut leaf, 512 - 2 * (i + 1), &(at as u16).to_be_bytes());
            put(&mut leaf, at, k);
            put(&mut leaf, at + k.len(), r);
            at += k.len() + r.len();
        }
        put(&mut leaf, 512 - 2 * (records.len() + 1), &(at as u16).to_be_bytes());
        disk.write_sector(0, 0, 6, &leaf).unwrap();

        disk.write_sector(0, 0, 7, &[b'a'; 512]).unwrap();
        disk.write_sector(0, 0, 8, &[b'b'; 512]).unwrap();
        disk.write_sector(0, 0, 9, &[b'c'; 512]).unwrap();
        let mut inner = vec![0u8; 512];
        inner[..4].copy_from_slice(b"deep");
        disk.write_sector(0, 0, 11, &inner).unwrap();
        disk
    }

    #[test]
    fn test_probe_and_stat_fs() {
        let disk = sample();
        assert_eq!(HfsDriver.probe(&disk), 95);
        let volume = HfsDriver.mount(&disk).unwrap();
        let info = volume.stat_fs();
        assert_eq!(info.volume_name, "Sampler");
        assert_eq!(info.block_size, 1024);
        assert_eq!(info.free_blocks, 390);
    }

    #[test]
    fn test_readdir_and_read() {
        let disk = sample();
        let volume = HfsDriver.mount(&disk).unwrap();
        let root = volume.readdir("/").unwrap();
        let names: Vec<&str> = root.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Folder", "Read Me"]);
        assert!(root[0].is_dir());
        assert_eq!(root[1].file_type.as_deref(), Some("TEXT"));
        assert_eq!(root[1].modified.unwrap().to_string(), "1905-01-01 00:00:00");

        let data = volume.read("/read me").unwrap();
        assert_eq!(data.len(), 1500);
        assert_eq!(data[0], b'a');
        assert_eq!(data[1023], b'b');
        assert_eq!(data[1024], b'c');
        assert_eq!(volume.read("/Folder/Inner").unwrap(), b"deep");
        assert!(volume.read("/Folder").is_err());
        assert!(volume.read("/Missing").is_err());
    }

    #[test]
    fn test_mac_epoch() {
        assert_eq!(mac_datetime(0), None);
        assert_eq!(mac_datetime(86_400).unwrap().to_string(), "1904-01-02 00:00:00");
    }
}
