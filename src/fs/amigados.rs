//! AmigaDOS Old and Fast File System
//!
//! The root block sits in the middle of the disk. Directories are 72-slot
//! hash tables whose collisions chain through each header's `hash_chain`
//! field. OFS data blocks carry a 24-byte header; FFS data blocks are raw.

use crate::disk::{Disk, SideMode};
use crate::error::{FloppyError, Result};
use crate::fs::{
    components, names_match, split_parent, Blocks, DirEntry, FileAttributes, FilesystemDriver,
    FsInfo, SectorMap, Volume, WritePlan,
};
use crate::io::be32;
use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};

/// Bytes per block
pub const BLOCK_SIZE: usize = 512;
/// Hash table slots in a directory block
pub const HASH_SIZE: usize = 72;

const T_HEADER: u32 = 2;
const T_DATA: u32 = 8;
const T_LIST: u32 = 16;
const ST_ROOT: u32 = 1;
const ST_USERDIR: u32 = 2;
const ST_FILE: u32 = (-3i32) as u32;

const CHECKSUM_AT: usize = 20;
const TABLE_AT: usize = 24;
const BM_FLAG_AT: usize = BLOCK_SIZE - 200;
const BM_PAGES_AT: usize = BLOCK_SIZE - 196;
const PROTECT_AT: usize = BLOCK_SIZE - 192;
const BYTE_SIZE_AT: usize = BLOCK_SIZE - 188;
const DAYS_AT: usize = BLOCK_SIZE - 92;
const NAME_AT: usize = BLOCK_SIZE - 80;
const HASH_CHAIN_AT: usize = BLOCK_SIZE - 16;
const PARENT_AT: usize = BLOCK_SIZE - 12;
const EXTENSION_AT: usize = BLOCK_SIZE - 8;
const SEC_TYPE_AT: usize = BLOCK_SIZE - 4;

/// OFS data block payload
const OFS_PAYLOAD: usize = BLOCK_SIZE - 24;

/// Value that makes the longword sum of a block zero when stored at `at`
pub fn checksum(block: &[u8], at: usize) -> u32 {
    let sum = block
        .chunks_exact(4)
        .enumerate()
        .filter(|(i, _)| i * 4 != at)
        .fold(0u32, |acc, (_, w)| acc.wrapping_add(u32::from_be_bytes([w[0], w[1], w[2], w[3]])));
    sum.wrapping_neg()
}

/// Hash slot of a file name
pub fn hash_name(name: &str, international: bool) -> usize {
    let mut hash = name.len() as u32;
    for c in name.bytes() {
        let upper = if international && (224..=254).contains(&c) && c != 247 {
            c - 32
        } else {
            c.to_ascii_uppercase()
        };
        hash = (hash.wrapping_mul(13).wrapping_add(upper as u32)) & 0x7FF;
    }
    hash as usize % HASH_SIZE
}

fn epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1978, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Decode an AmigaDOS days/minutes/ticks stamp
///
/// Stamps too far out for the calendar come back as the epoch.
pub fn amiga_datetime(days: u32, minutes: u32, ticks: u32) -> NaiveDateTime {
    Duration::try_days(days as i64)
        .zip(Duration::try_minutes(minutes as i64))
        .and_then(|(d, m)| d.checked_add(&m))
        .and_then(|offset| offset.checked_add(&Duration::milliseconds(ticks as i64 * 20)))
        .and_then(|offset| epoch().checked_add_signed(offset))
        .unwrap_or_else(epoch)
}

fn amiga_stamp(when: &NaiveDateTime) -> [u32; 3] {
    let since = *when - epoch();
    let days = since.num_days().max(0) as u32;
    let minutes = when.hour() * 60 + when.minute();
    [days, minutes, when.second() * 50]
}

fn put32(block: &mut [u8], at: usize, value: u32) {
    block[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

fn seal(block: &mut [u8], at: usize) {
    let sum = checksum(block, at);
    put32(block, at, sum);
}

fn block_name(block: &[u8]) -> String {
    let len = (block[NAME_AT] as usize).min(30);
    block[NAME_AT + 1..NAME_AT + 1 + len].iter().map(|&b| b as char).collect()
}

fn set_name(block: &mut [u8], name: &str) {
    let bytes: Vec<u8> = name.bytes().take(30).collect();
    block[NAME_AT] = bytes.len() as u8;
    block[NAME_AT + 1..NAME_AT + 1 + bytes.len()].copy_from_slice(&bytes);
}

/// Mounted AmigaDOS volume
pub struct AmigaVolume<'a> {
    blocks: Blocks<'a>,
    flags: u8,
    root: u32,
}

impl<'a> AmigaVolume<'a> {
    /// Mount a disk
    pub fn open(disk: &'a Disk) -> Result<Self> {
        let blocks = Blocks::new(disk, SectorMap::linear(disk, SideMode::Alternate));
        let boot = blocks.sector(0)?;
        if boot.len() != BLOCK_SIZE || &boot[..3] != b"DOS" || boot[3] > 7 {
            return Err(FloppyError::invalid_format("no AmigaDOS boot block"));
        }
        let root = (blocks.len() / 2) as u32;
        let volume = Self {
            blocks,
            flags: boot[3],
            root,
        };
        let rb = volume.block(root)?;
        if be32(rb, 0) != T_HEADER || be32(rb, SEC_TYPE_AT) != ST_ROOT {
            return Err(FloppyError::corrupt(format!("block {} is not a root block", root)));
        }
        if checksum(rb, CHECKSUM_AT) != be32(rb, CHECKSUM_AT) {
            return Err(FloppyError::Crc(format!("root block {} checksum", root)));
        }
        Ok(volume)
    }

    /// Check if the volume is FFS
    pub fn is_ffs(&self) -> bool {
        self.flags & 1 != 0
    }

    fn international(&self) -> bool {
        self.flags & 2 != 0
    }

    fn block(&self, n: u32) -> Result<&'a [u8]> {
        if n < 2 || n as usize >= self.blocks.len() {
            return Err(FloppyError::corrupt(format!("block pointer {} out of range", n)));
        }
        self.blocks.sector(n as usize)
    }

    fn header(&self, n: u32) -> Result<&'a [u8]> {
        let b = self.block(n)?;
        if be32(b, 0) != T_HEADER || checksum(b, CHECKSUM_AT) != be32(b, CHECKSUM_AT) {
            return Err(FloppyError::corrupt(format!("block {} is not a valid header", n)));
        }
        Ok(b)
    }

    fn entry(&self, n: u32) -> Result<DirEntry> {
        let b = self.header(n)?;
        let name = block_name(b);
        let mut entry = match be32(b, SEC_TYPE_AT) {
            ST_USERDIR | ST_ROOT => DirEntry::directory(name),
            _ => DirEntry::file(name, be32(b, BYTE_SIZE_AT) as u64),
        };
        let protect = be32(b, PROTECT_AT);
        entry.attributes = FileAttributes {
            read_only: protect & 0x05 == 0x05,
            archive: protect & 0x10 != 0,
            hidden: protect & 0x80 != 0,
            system: false,
        };
        entry.modified = Some(amiga_datetime(be32(b, DAYS_AT), be32(b, DAYS_AT + 4), be32(b, DAYS_AT + 8)));
        Ok(entry)
    }

    fn children(&self, dir: u32) -> Result<Vec<u32>> {
        let d = self.header(dir)?;
        let mut out = Vec::new();
        for slot in 0..HASH_SIZE {
            let mut n = be32(d, TABLE_AT + slot * 4);
            let mut hops = 0;
            while n != 0 {
                hops += 1;
                if hops > self.blocks.len() {
                    return Err(FloppyError::corrupt("hash chain loops"));
                }
                out.push(n);
                n = be32(self.header(n)?, HASH_CHAIN_AT);
            }
        }
        Ok(out)
    }

    fn lookup(&self, dir: u32, name: &str) -> Result<Option<u32>> {
        let d = self.header(dir)?;
        let mut n = be32(d, TABLE_AT + hash_name(name, self.international()) * 4);
        let mut hops = 0;
        while n != 0 && hops <= self.blocks.len() {
            let h = self.header(n)?;
            if names_match(&block_name(h), name) {
                return Ok(Some(n));
            }
            n = be32(h, HASH_CHAIN_AT);
            hops += 1;
        }
        Ok(None)
    }

    fn resolve(&self, path: &str) -> Result<u32> {
        let mut n = self.root;
        for part in components(path) {
            if be32(self.header(n)?, SEC_TYPE_AT) == ST_FILE {
                return Err(FloppyError::NotFound(path.to_string()));
            }
            n = self
                .lookup(n, part)?
                .ok_or_else(|| FloppyError::NotFound(path.to_string()))?;
        }
        Ok(n)
    }

    /// Data block numbers of a file, in order
    fn data_blocks(&self, header: u32) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        let mut table = self.header(header)?;
        let mut hops = 0;
        loop {
            let count = (be32(table, 8) as usize).min(HASH_SIZE);
            for i in 0..count {
                out.push(be32(table, TABLE_AT + (HASH_SIZE - 1 - i) * 4));
            }
            let next = be32(table, EXTENSION_AT);
            if next == 0 {
                break;
            }
            hops += 1;
            table = self.block(next)?;
            if be32(table, 0) != T_LIST || hops > self.blocks.len() {
                return Err(FloppyError::corrupt(format!("bad extension block {}", next)));
            }
        }
        Ok(out)
    }

    fn bitmap_block(&self) -> Result<u32> {
        let root = self.header(self.root)?;
        match be32(root, BM_PAGES_AT) {
            0 => Err(FloppyError::corrupt("root block has no bitmap")),
            n => Ok(n),
        }
    }

    /// Offset of the bitmap word and the bit for a block; the first two
    /// blocks have no bit
    fn bitmap_bit(block: u32, total: usize) -> Result<(usize, u32)> {
        let idx = (block as usize).wrapping_sub(2);
        let at = 4 + (idx / 32) * 4;
        if block < 2 || block as usize >= total || at + 4 > BLOCK_SIZE {
            return Err(FloppyError::corrupt(format!("block pointer {} out of range", block)));
        }
        Ok((at, 1 << (idx % 32)))
    }

    fn is_free(bitmap: &[u8], block: u32, total: usize) -> Result<bool> {
        let (at, bit) = Self::bitmap_bit(block, total)?;
        Ok(be32(bitmap, at) & bit != 0)
    }

    fn set_free(bitmap: &mut [u8], block: u32, free: bool, total: usize) -> Result<()> {
        let (at, bit) = Self::bitmap_bit(block, total)?;
        let word = be32(bitmap, at);
        put32(bitmap, at, if free { word | bit } else { word & !bit });
        Ok(())
    }

    fn plan_write(&self, path: &str, data: &[u8]) -> Result<WritePlan> {
        let (parent, name) = split_parent(path)?;
        if name.len() > 30 || name.contains(':') {
            return Err(FloppyError::invalid_arg(format!("'{}' is not a valid AmigaDOS name", name)));
        }
        let dir = self.resolve(parent)?;
        if be32(self.header(dir)?, SEC_TYPE_AT) == ST_FILE {
            return Err(FloppyError::invalid_arg(format!("{} is not a directory", parent)));
        }
        let existing = self.lookup(dir, name)?;
        let bm_block = self.bitmap_block()?;
        let mut bitmap = self.block(bm_block)?.to_vec();
        let blocks = self.blocks.len();

        let mut hash_chain = 0;
        if let Some(old) = existing {
            let h = self.header(old)?;
            if be32(h, SEC_TYPE_AT) != ST_FILE {
                return Err(FloppyError::invalid_arg(format!("{} is a directory", path)));
            }
            hash_chain = be32(h, HASH_CHAIN_AT);
            for b in self.data_blocks(old)? {
                Self::set_free(&mut bitmap, b, true, blocks)?;
            }
            let mut ext = be32(h, EXTENSION_AT);
            while ext != 0 {
                Self::set_free(&mut bitmap, ext, true, blocks)?;
                ext = be32(self.block(ext)?, EXTENSION_AT);
            }
        }

        let payload = if self.is_ffs() { BLOCK_SIZE } else { OFS_PAYLOAD };
        let data_count = data.len().div_ceil(payload);
        let ext_count = data_count.saturating_sub(HASH_SIZE).div_ceil(HASH_SIZE);
        let total = self.blocks.len() as u32;
        let search = (self.root + 1..total).chain(2..self.root);
        let mut wanted = data_count + ext_count + usize::from(existing.is_none());
        let mut fresh = Vec::with_capacity(wanted);
        for b in search {
            if wanted == 0 {
                break;
            }
            if Self::is_free(&bitmap, b, blocks)? {
                Self::set_free(&mut bitmap, b, false, blocks)?;
                fresh.push(b);
                wanted -= 1;
            }
        }
        if wanted > 0 {
            return Err(FloppyError::DiskFull);
        }
        let mut fresh = fresh.into_iter();
        let mut take = || fresh.next().ok_or(FloppyError::DiskFull);
        let header = match existing {
            Some(h) => h,
            None => take()?,
        };
        let data_blocks: Vec<u32> = (0..data_count).map(|_| take()).collect::<Result<_>>()?;
        let ext_blocks: Vec<u32> = (0..ext_count).map(|_| take()).collect::<Result<_>>()?;

        let slot = TABLE_AT + hash_name(name, self.international()) * 4;
        if existing.is_none() {
            hash_chain = be32(self.header(dir)?, slot);
        }

        let mut plan = WritePlan::new();
        let map = self.blocks.map();
        let stamp = amiga_stamp(&chrono::Local::now().naive_local());

        for (i, (&b, chunk)) in data_blocks.iter().zip(data.chunks(payload)).enumerate() {
            let mut block = vec![0u8; BLOCK_SIZE];
            if self.is_ffs() {
                block[..chunk.len()].copy_from_slice(chunk);
            } else {
                put32(&mut block, 0, T_DATA);
                put32(&mut block, 4, header);
                put32(&mut block, 8, i as u32 + 1);
                put32(&mut block, 12, chunk.len() as u32);
                put32(&mut block, 16, data_blocks.get(i + 1).copied().unwrap_or(0));
                block[24..24 + chunk.len()].copy_from_slice(chunk);
                seal(&mut block, CHECKSUM_AT);
            }
            plan.put(map.address(b as usize)?, block);
        }

        let tables: Vec<&[u32]> = data_blocks.chunks(HASH_SIZE).collect();
        let mut hb = vec![0u8; BLOCK_SIZE];
        put32(&mut hb, 0, T_HEADER);
        put32(&mut hb, 4, header);
        put32(&mut hb, 8, tables.first().map_or(0, |t| t.len() as u32));
        put32(&mut hb, 16, data_blocks.first().copied().unwrap_or(0));
        for (i, &b) in tables.first().copied().unwrap_or(&[]).iter().enumerate() {
            put32(&mut hb, TABLE_AT + (HASH_SIZE - 1 - i) * 4, b);
        }
        put32(&mut hb, BYTE_SIZE_AT, data.len() as u32);
        for (k, v) in stamp.iter().enumerate() {
            put32(&mut hb, DAYS_AT + k * 4, *v);
        }
        set_name(&mut hb, name);
        put32(&mut hb, HASH_CHAIN_AT, hash_chain);
        put32(&mut hb, PARENT_AT, dir);
        put32(&mut hb, EXTENSION_AT, ext_blocks.first().copied().unwrap_or(0));
        put32(&mut hb, SEC_TYPE_AT, ST_FILE);
        seal(&mut hb, CHECKSUM_AT);
        plan.put(map.address(header as usize)?, hb);

        for (k, &e) in ext_blocks.iter().enumerate() {
            let table = tables.get(k + 1).copied().unwrap_or(&[]);
            let mut eb = vec![0u8; BLOCK_SIZE];
            put32(&mut eb, 0, T_LIST);
            put32(&mut eb, 4, e);
            put32(&mut eb, 8, table.len() as u32);
            for (i, &b) in table.iter().enumerate() {
                put32(&mut eb, TABLE_AT + (HASH_SIZE - 1 - i) * 4, b);
            }
            put32(&mut eb, PARENT_AT, header);
            put32(&mut eb, EXTENSION_AT, ext_blocks.get(k + 1).copied().unwrap_or(0));
            put32(&mut eb, SEC_TYPE_AT, ST_FILE);
            seal(&mut eb, CHECKSUM_AT);
            plan.put(map.address(e as usize)?, eb);
        }

        if existing.is_none() {
            let mut db = self.header(dir)?.to_vec();
            put32(&mut db, slot, header);
            seal(&mut db, CHECKSUM_AT);
            plan.put(map.address(dir as usize)?, db);
        }

        seal(&mut bitmap, 0);
        plan.put(map.address(bm_block as usize)?, bitmap);
        Ok(plan)
    }
}

impl Volume for AmigaVolume<'_> {
    fn stat_fs(&self) -> FsInfo {
        let total = self.blocks.len();
        let free = self
            .bitmap_block()
            .and_then(|b| self.block(b))
            .map(|bm| (2..total as u32).filter(|&b| Self::is_free(bm, b, total).unwrap_or(false)).count())
            .unwrap_or(0);
        FsInfo {
            fs_type: if self.is_ffs() { "FFS" } else { "OFS" }.to_string(),
            volume_name: self.header(self.root).map(block_name).unwrap_or_default(),
            block_size: BLOCK_SIZE,
            total_blocks: total,
            free_blocks: free,
        }
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = self.resolve(path)?;
        if be32(self.header(dir)?, SEC_TYPE_AT) == ST_FILE {
            return Err(FloppyError::invalid_arg(format!("{} is not a directory", path)));
        }
        let mut entries = self
            .children(dir)?
            .into_iter()
            .map(|n| self.entry(n))
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.name.to_ascii_lowercase());
        Ok(entries)
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let n = self.resolve(path)?;
        let h = self.header(n)?;
        if be32(h, SEC_TYPE_AT) != ST_FILE {
            return Err(FloppyError::invalid_arg(format!("{} is a directory", path)));
        }
        let size = be32(h, BYTE_SIZE_AT) as usize;
        let mut out = Vec::with_capacity(size);
        for b in self.data_blocks(n)? {
            let block = self.block(b)?;
            if self.is_ffs() {
                out.extend_from_slice(block);
            } else {
                if be32(block, 0) != T_DATA || be32(block, 4) != n {
                    return Err(FloppyError::corrupt(format!("block {} is not data for header {}", b, n)));
                }
                let len = (be32(block, 12) as usize).min(OFS_PAYLOAD);
                out.extend_from_slice(&block[24..24 + len]);
            }
        }
        if out.len() < size {
            return Err(FloppyError::corrupt(format!("{}: {} of {} bytes present", path, out.len(), size)));
        }
        out.truncate(size);
        Ok(out)
    }

    fn stat(&self, path: &str) -> Result<DirEntry> {
        self.entry(self.resolve(path)?)
    }
}

/// Format a disk with an empty AmigaDOS volume
pub fn format(disk: &mut Disk, name: &str, ffs: bool) -> Result<()> {
    let map = SectorMap::linear(disk, SideMode::Alternate);
    let total = map.len() as u32;
    if total < 8 {
        return Err(FloppyError::invalid_arg("disk too small for AmigaDOS"));
    }
    let root = total / 2;
    let mut plan = WritePlan::new();

    let mut boot = vec![0u8; BLOCK_SIZE];
    boot[..4].copy_from_slice(&[b'D', b'O', b'S', u8::from(ffs)]);
    put32(&mut boot, 8, root);
    plan.put(map.address(0)?, boot);
    plan.put(map.address(1)?, vec![0u8; BLOCK_SIZE]);

    let stamp = amiga_stamp(&chrono::Local::now().naive_local());
    let mut rb = vec![0u8; BLOCK_SIZE];
    put32(&mut rb, 0, T_HEADER);
    put32(&mut rb, 12, HASH_SIZE as u32);
    put32(&mut rb, BM_FLAG_AT, u32::MAX);
    put32(&mut rb, BM_PAGES_AT, root + 1);
    for (k, v) in stamp.iter().enumerate() {
        put32(&mut rb, DAYS_AT + k * 4, *v);
        put32(&mut rb, BLOCK_SIZE - 40 + k * 4, *v);
        put32(&mut rb, BLOCK_SIZE - 28 + k * 4, *v);
    }
    set_name(&mut rb, name);
    put32(&mut rb, SEC_TYPE_AT, ST_ROOT);
    seal(&mut rb, CHECKSUM_AT);
    plan.put(map.address(root as usize)?, rb);

    let mut bitmap = vec![0u8; BLOCK_SIZE];
    for b in 2..total {
        if b != root && b != root + 1 {
            AmigaVolume::set_free(&mut bitmap, b, true, total as usize)?;
        }
    }
    seal(&mut bitmap, 0);
    plan.put(map.address(root as usize + 1)?, bitmap);
    plan.apply(disk)
}

/// AmigaDOS driver
#[derive(Debug, Clone, Copy, Default)]
pub struct AmigaDosDriver;

impl FilesystemDriver for AmigaDosDriver {
    fn name(&self) -> &'static str {
        "amigados"
    }

    fn probe(&self, disk: &Disk) -> u8 {
        let blocks = Blocks::linear(disk);
        let Ok(boot) = blocks.sector(0) else {
            return 0;
        };
        if boot.len() != BLOCK_SIZE || &boot[..3] != b"DOS" || boot[3] > 7 {
            return 0;
        }
        match AmigaVolume::open(disk) {
            Ok(_) => 100,
            Err(_) => 45,
        }
    }

    fn mount<'a>(&self, disk: &'a Disk) -> Result<Box<dyn Volume + 'a>> {
        Ok(Box::new(AmigaVolume::open(disk)?))
    }

    fn can_write(&self) -> bool {
        true
    }

    fn write(&self, disk: &mut Disk, path: &str, data: &[u8]) -> Result<()> {
        let plan = AmigaVolume::open(disk)?.plan_write(path, data)?;
        plan.apply(disk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::profile;

    fn blank(ffs: bool) -> Disk {
        let mut disk = Disk::builder().profile(profile("amiga-dd").unwrap()).build().unwrap();
        format(&mut disk, "Empty", ffs).unwrap();
        disk
    }

    #[test]
    fn test_hash_name() {
        assert_eq!(hash_name("Disk.info", false), hash_name("DISK.INFO", false));
        assert!(hash_name("s", false) < HASH_SIZE);
    }

    #[test]
    fn test_format_mounts_as_ofs() {
        let disk = blank(false);
        assert_eq!(AmigaDosDriver.probe(&disk), 100);
        let volume = AmigaDosDriver.mount(&disk).unwrap();
        let info = volume.stat_fs();
        assert_eq!(info.fs_type, "OFS");
        assert_eq!(info.volume_name, "Empty");
        assert_eq!(info.total_blocks, 1760);
        assert_eq!(info.free_blocks, 1756);
        assert!(volume.readdir("/").unwrap().is_empty());
    }

    #[test]
    fn test_ofs_write_and_read() {
        let mut disk = blank(false);
        let big: Vec<u8> = (0..40_000u32).map(|i| (i * 7 % 256) as u8).collect();
        AmigaDosDriver.write(&mut disk, "/Disk.info", &[0xE3, 0x10, 0, 1]).unwrap();
        AmigaDosDriver.write(&mut disk, "/Big", &big).unwrap();
        let volume = AmigaDosDriver.mount(&disk).unwrap();
        let names: Vec<String> = volume.readdir("/").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["Big", "Disk.info"]);
        assert_eq!(volume.read("/disk.info").unwrap(), vec![0xE3, 0x10, 0, 1]);
        assert_eq!(volume.read("/Big").unwrap(), big);
        assert_eq!(volume.stat("/Big").unwrap().size, 40_000);
    }

    #[test]
    fn test_ffs_replace_frees_blocks() {
        let mut disk = blank(true);
        AmigaDosDriver.write(&mut disk, "f", &vec![1; 5000]).unwrap();
        let used = 1756 - AmigaDosDriver.mount(&disk).unwrap().stat_fs().free_blocks;
        assert_eq!(used, 1 + 10);
        AmigaDosDriver.write(&mut disk, "F", &vec![2; 10]).unwrap();
        let volume = AmigaDosDriver.mount(&disk).unwrap();
        assert_eq!(volume.stat_fs().fs_type, "FFS");
        assert_eq!(volume.stat_fs().free_blocks, 1756 - 2);
        assert_eq!(volume.read("f").unwrap(), vec![2; 10]);
        assert_eq!(volume.readdir("/").unwrap().len(), 1);
    }

    #[test]
    fn test_checksum_zeroes_sum() {
        let mut block = vec![0u8; BLOCK_SIZE];
        put32(&mut block, 0, 0x1234_5678);
        put32(&mut block, 100, 0xFFFF_0000);
        seal(&mut block, CHECKSUM_AT);
        let sum = block
            .chunks_exact(4)
            .fold(0u32, |a, w| a.wrapping_add(u32::from_be_bytes([w[0], w[1], w[2], w[3]])));
        assert_eq!(sum, 0);
    }

    fn file_header(disk: &Disk, name: &str) -> u32 {
        let volume = AmigaVolume::open(disk).unwrap();
        volume.lookup(volume.root, name).unwrap().unwrap()
    }

    fn patch_block(disk: &mut Disk, block: u32, edit: impl FnOnce(&mut Vec<u8>)) {
        let (c, h, s) = SectorMap::linear(disk, SideMode::Alternate).address(block as usize).unwrap();
        let mut data = disk.read_sector(c, h, s).unwrap().to_vec();
        edit(&mut data);
        seal(&mut data, CHECKSUM_AT);
        disk.write_sector(c, h, s, &data).unwrap();
    }

    #[test]
    fn test_out_of_range_days() {
        let mut disk = blank(false);
        AmigaDosDriver.write(&mut disk, "File", b"hello").unwrap();
        let header = file_header(&disk, "File");
        patch_block(&mut disk, header, |b| put32(b, DAYS_AT, u32::MAX));
        let volume = AmigaDosDriver.mount(&disk).unwrap();
        let entries = volume.readdir("/").unwrap();
        assert_eq!(entries[0].modified, Some(epoch()));
        assert_eq!(volume.read("File").unwrap(), b"hello");
    }

    #[test]
    fn test_rewrite_over_bad_block_table() {
        for pointer in [9000u32, 1, 0xFFFF_FFFF] {
            let mut disk = blank(false);
            AmigaDosDriver.write(&mut disk, "File", &[7; 1000]).unwrap();
            let header = file_header(&disk, "File");
            patch_block(&mut disk, header, |b| put32(b, TABLE_AT + (HASH_SIZE - 1) * 4, pointer));
            let err = AmigaDosDriver.write(&mut disk, "File", &[8; 10]).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::Corrupt, "pointer {}", pointer);
        }
    }

    #[test]
    fn test_hd_format_points_at_root() {
        let mut disk = Disk::builder().profile(profile("amiga-hd").unwrap()).build().unwrap();
        format(&mut disk, "Big", true).unwrap();
        let boot = disk.read_sector(0, 0, 0).unwrap();
        assert_eq!(be32(boot, 8), 1760);
        let volume = AmigaDosDriver.mount(&disk).unwrap();
        assert_eq!(volume.stat_fs().total_blocks, 3520);
        assert_eq!(volume.stat_fs().free_blocks, 3516);
        assert_eq!(be32(blank(false).read_sector(0, 0, 0).unwrap(), 8), 880);
    }

    #[test]
    fn test_datetime_epoch() {
        let when = amiga_datetime(0, 61, 100);
        assert_eq!(when, epoch() + Duration::minutes(61) + Duration::seconds(2));
    }
}
