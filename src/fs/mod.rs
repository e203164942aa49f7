//! Filesystem drivers
//!
//! A driver probes a [`Disk`] and mounts it as a [`Volume`]. Volumes see
//! the disk only as an array of sectors; they never touch flux or
//! bitstreams. A volume borrows the disk, so it must be dropped (or
//! [`Volume::unmount`]ed) before the disk can be modified. Drivers that
//! support writing do so through [`FilesystemDriver::write`], which takes
//! the disk mutably and mounts it internally.

/// Amiga OFS/FFS
pub mod amigados;
/// Commodore 1541/1571/1581 DOS
pub mod cbm;
/// CP/M 2.2 and its platform variants
pub mod cpm;
/// Acorn DFS
pub mod dfs;
/// Apple DOS 3.3
pub mod dos33;
/// FAT12/16 with long file names
pub mod fat;
/// Macintosh HFS
pub mod hfs;
/// Apple ProDOS
pub mod prodos;
/// TRS-80 TRSDOS 2.3
pub mod trsdos;

use crate::disk::{Disk, SideMode};
use crate::error::{FloppyError, Result};
use chrono::NaiveDateTime;
use log::debug;
use serde::Serialize;
use std::sync::OnceLock;

/// Lowest probe score that counts as a match
pub const MIN_CONFIDENCE: u8 = 40;

/// Kind of directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
}

/// File attributes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileAttributes {
    /// Read-only (locked) flag
    pub read_only: bool,
    /// System file flag
    pub system: bool,
    /// Archive flag
    pub archive: bool,
    /// Hidden flag
    pub hidden: bool,
}

/// Directory entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    /// File name as shown by the host system
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// File or directory
    pub kind: EntryKind,
    /// Attribute flags
    pub attributes: FileAttributes,
    /// Modification time, where the filesystem records one
    pub modified: Option<NaiveDateTime>,
    /// Platform file type (e.g. "PRG", "BAS", "TEXT")
    pub file_type: Option<String>,
}

impl DirEntry {
    /// Entry for a regular file
    pub fn file<S: Into<String>>(name: S, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            kind: EntryKind::File,
            attributes: FileAttributes::default(),
            modified: None,
            file_type: None,
        }
    }

    /// Entry for a directory
    pub fn directory<S: Into<String>>(name: S) -> Self {
        Self {
            kind: EntryKind::Directory,
            ..Self::file(name, 0)
        }
    }

    /// Set the platform file type
    pub fn with_type<S: Into<String>>(mut self, file_type: S) -> Self {
        self.file_type = Some(file_type.into());
        self
    }

    /// Check if this entry is a directory
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Volume-wide information
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsInfo {
    /// Filesystem type name (e.g. "FAT12", "OFS")
    pub fs_type: String,
    /// Volume label
    pub volume_name: String,
    /// Allocation unit in bytes
    pub block_size: usize,
    /// Allocation units on the volume
    pub total_blocks: usize,
    /// Unused allocation units
    pub free_blocks: usize,
}

/// A mounted filesystem view over a disk
pub trait Volume {
    /// Volume-wide information
    fn stat_fs(&self) -> FsInfo;

    /// List a directory; `/` is the root
    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>>;

    /// Read a whole file
    fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Look up one entry
    fn stat(&self, path: &str) -> Result<DirEntry> {
        let (parent, name) = split_parent(path)?;
        self.readdir(parent)?
            .into_iter()
            .find(|e| names_match(&e.name, name))
            .ok_or_else(|| FloppyError::NotFound(path.to_string()))
    }

    /// Release the view
    fn unmount(self: Box<Self>) {}
}

/// Detects and mounts one filesystem type
pub trait FilesystemDriver: Send + Sync {
    /// Registry name
    fn name(&self) -> &'static str;

    /// Confidence 0-100 that the disk holds this filesystem
    fn probe(&self, disk: &Disk) -> u8;

    /// Mount the disk read-only
    fn mount<'a>(&self, disk: &'a Disk) -> Result<Box<dyn Volume + 'a>>;

    /// Whether [`FilesystemDriver::write`] is implemented
    fn can_write(&self) -> bool {
        false
    }

    /// Create or replace a file
    fn write(&self, _disk: &mut Disk, path: &str, _data: &[u8]) -> Result<()> {
        Err(FloppyError::unsupported(format!(
            "{} cannot write '{}'",
            self.name(),
            path
        )))
    }
}

/// Linear block addressing over a disk's sectors
#[derive(Debug, Clone)]
pub struct SectorMap {
    order: Vec<(u8, u8, u8)>,
}

impl SectorMap {
    /// Sectors in id order, tracks ordered per `side_mode`
    pub fn linear(disk: &Disk, side_mode: SideMode) -> Self {
        Self {
            order: disk.logical_order(side_mode),
        }
    }

    /// Sectors of one side only
    pub fn side(disk: &Disk, head: u8) -> Self {
        let order = disk
            .logical_order(SideMode::Alternate)
            .into_iter()
            .filter(|&(_, h, _)| h == head)
            .collect();
        Self { order }
    }

    /// Number of addressable sectors
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Physical address of a logical sector
    pub fn address(&self, lba: usize) -> Result<(u8, u8, u8)> {
        self.order
            .get(lba)
            .copied()
            .ok_or_else(|| FloppyError::corrupt(format!("logical sector {} beyond end of disk", lba)))
    }
}

/// Read access to a disk through a [`SectorMap`]
#[derive(Debug, Clone)]
pub struct Blocks<'a> {
    disk: &'a Disk,
    map: SectorMap,
}

impl<'a> Blocks<'a> {
    /// Wrap a disk with an address map
    pub fn new(disk: &'a Disk, map: SectorMap) -> Self {
        Self { disk, map }
    }

    /// Linear view, both sides alternating
    pub fn linear(disk: &'a Disk) -> Self {
        Self::new(disk, SectorMap::linear(disk, SideMode::Alternate))
    }

    /// Underlying disk
    pub fn disk(&self) -> &'a Disk {
        self.disk
    }

    /// Address map
    pub fn map(&self) -> &SectorMap {
        &self.map
    }

    /// Number of logical sectors
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if the view is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Read one logical sector
    pub fn sector(&self, lba: usize) -> Result<&'a [u8]> {
        let (c, h, s) = self.map.address(lba)?;
        self.disk.read_sector(c, h, s)
    }

    /// Read `count` consecutive logical sectors
    pub fn run(&self, lba: usize, count: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for n in lba..lba + count {
            out.extend_from_slice(self.sector(n)?);
        }
        Ok(out)
    }
}

/// Sector writes produced by a filesystem update
#[derive(Debug, Clone, Default)]
pub struct WritePlan {
    writes: Vec<((u8, u8, u8), Vec<u8>)>,
}

impl WritePlan {
    /// Create an empty plan
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a sector write; later writes to the same sector win
    pub fn put(&mut self, address: (u8, u8, u8), data: Vec<u8>) {
        match self.writes.iter_mut().find(|(a, _)| *a == address) {
            Some(slot) => slot.1 = data,
            None => self.writes.push((address, data)),
        }
    }

    /// Queued data for a sector
    pub fn get(&self, address: (u8, u8, u8)) -> Option<&[u8]> {
        self.writes
            .iter()
            .find(|(a, _)| *a == address)
            .map(|(_, d)| d.as_slice())
    }

    /// Number of sectors queued
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Write every queued sector to the disk
    pub fn apply(self, disk: &mut Disk) -> Result<()> {
        if disk.read_only {
            return Err(FloppyError::Permission("disk is read-only".into()));
        }
        for ((c, h, s), data) in self.writes {
            disk.write_sector(c, h, s, &data)?;
        }
        Ok(())
    }
}

/// Path components, ignoring empty segments
pub fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|p| !p.is_empty()).collect()
}

/// Split a path into parent directory and final name
pub fn split_parent(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(i) if !trimmed[i + 1..].is_empty() => Ok((if i == 0 { "/" } else { &trimmed[..i] }, &trimmed[i + 1..])),
        None if !trimmed.is_empty() => Ok(("/", trimmed)),
        _ => Err(FloppyError::invalid_arg(format!("'{}' does not name a file", path))),
    }
}

/// Case-insensitive file name comparison
pub fn names_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Error for a path into a flat filesystem
pub fn flat_only(path: &str) -> Result<()> {
    if components(path).is_empty() {
        Ok(())
    } else {
        Err(FloppyError::NotFound(format!("{}: filesystem has no subdirectories", path)))
    }
}

/// Text from a fixed-width, space- or NUL-padded field
pub fn padded_str(bytes: &[u8]) -> String {
    let text: String = bytes.iter().map(|&b| (b & 0x7F) as char).collect();
    text.trim_end_matches([' ', '\0']).to_string()
}

fn build_registry() -> Vec<Box<dyn FilesystemDriver>> {
    vec![
        Box::new(fat::FatDriver),
        Box::new(amigados::AmigaDosDriver),
        Box::new(cbm::CbmDosDriver),
        Box::new(dos33::Dos33Driver),
        Box::new(prodos::ProDosDriver),
        Box::new(hfs::HfsDriver),
        Box::new(dfs::DfsDriver),
        Box::new(trsdos::TrsDosDriver),
        Box::new(cpm::CpmDriver),
    ]
}

/// Every registered filesystem driver
pub fn registry() -> &'static [Box<dyn FilesystemDriver>] {
    static REGISTRY: OnceLock<Vec<Box<dyn FilesystemDriver>>> = OnceLock::new();
    REGISTRY.get_or_init(build_registry)
}

/// Look a driver up by name
pub fn driver(name: &str) -> Result<&'static dyn FilesystemDriver> {
    registry()
        .iter()
        .find(|d| d.name() == name)
        .map(|d| d.as_ref())
        .ok_or_else(|| FloppyError::NotFound(format!("filesystem '{}'", name)))
}

/// Best-scoring driver at or above [`MIN_CONFIDENCE`]
pub fn detect(disk: &Disk) -> Option<(&'static dyn FilesystemDriver, u8)> {
    let mut best: Option<(&'static dyn FilesystemDriver, u8)> = None;
    for d in registry() {
        let score = d.probe(disk);
        debug!("filesystem probe {}: {}", d.name(), score);
        if score >= MIN_CONFIDENCE && score > best.map(|(_, s)| s).unwrap_or(0) {
            best = Some((d.as_ref(), score));
        }
    }
    best
}

/// Mount with the best-scoring driver
pub fn mount(disk: &Disk) -> Result<Box<dyn Volume + '_>> {
    let (d, _) = detect(disk).ok_or_else(|| FloppyError::unsupported("no filesystem recognised"))?;
    d.mount(disk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::Geometry;

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("/A.TXT").unwrap(), ("/", "A.TXT"));
        assert_eq!(split_parent("dir/sub/B").unwrap(), ("dir/sub", "B"));
        assert_eq!(split_parent("C").unwrap(), ("/", "C"));
        assert!(split_parent("/").is_err());
    }

    #[test]
    fn test_components() {
        assert_eq!(components("//s//Disk.info"), vec!["s", "Disk.info"]);
        assert!(components("/").is_empty());
    }

    #[test]
    fn test_padded_str() {
        assert_eq!(padded_str(b"HELLO   "), "HELLO");
        assert_eq!(padded_str(&[0xC8, 0xC9, 0xA0, 0xA0]), "HI");
    }

    #[test]
    fn test_blank_disk_has_no_filesystem() {
        let disk = Disk::builder().geometry(Geometry::new(40, 1, 9, 512)).build().unwrap();
        assert!(detect(&disk).is_none());
        assert!(mount(&disk).is_err());
    }

    #[test]
    fn test_write_plan_last_write_wins() {
        let mut plan = WritePlan::new();
        plan.put((0, 0, 1), vec![1]);
        plan.put((0, 0, 1), vec![2]);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.get((0, 0, 1)), Some(&[2u8][..]));
    }

    #[test]
    fn test_registry_names_unique() {
        let mut names: Vec<_> = registry().iter().map(|d| d.name()).collect();
        let n = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), n);
        assert!(driver("fat").is_ok());
    }
}
