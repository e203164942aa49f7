//! Platform profiles: geometry, encoding and timing for each supported machine

use crate::disk::Geometry;
use crate::encoding::Encoding;
use crate::error::{FloppyError, Result};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Machine family a disk was written by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    /// Not known
    Unknown,
    /// IBM PC and compatibles
    Pc,
    /// Commodore Amiga
    Amiga,
    /// Atari ST
    AtariSt,
    /// Atari 8-bit (400/800/XL/XE)
    Atari8,
    /// Commodore 64 / 1541 family
    C64,
    /// Apple II
    AppleII,
    /// Apple Macintosh
    Mac,
    /// Acorn BBC Micro
    Bbc,
    /// Tandy TRS-80
    Trs80,
    /// DEC PDP-11 / RX02
    Dec,
    /// Victor 9000 / Sirius 1
    Victor,
    /// North Star Horizon
    Northstar,
    /// Amstrad CPC
    AmstradCpc,
    /// MSX
    Msx,
    /// ZX Spectrum +3
    Spectrum,
    /// SAM Coupé
    SamCoupe,
    /// NEC PC-98
    Pc98,
    /// Sharp X68000
    X68000,
    /// Fujitsu FM Towns
    FmTowns,
    /// Thomson MO/TO
    Thomson,
    /// Tangerine Oric
    Oric,
    /// Kaypro
    Kaypro,
    /// Osborne 1
    Osborne,
    /// Epson QX-10
    Qx10,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Platform::Unknown => "Unknown",
            Platform::Pc => "IBM PC",
            Platform::Amiga => "Amiga",
            Platform::AtariSt => "Atari ST",
            Platform::Atari8 => "Atari 8-bit",
            Platform::C64 => "Commodore 64",
            Platform::AppleII => "Apple II",
            Platform::Mac => "Macintosh",
            Platform::Bbc => "BBC Micro",
            Platform::Trs80 => "TRS-80",
            Platform::Dec => "DEC RX02",
            Platform::Victor => "Victor 9000",
            Platform::Northstar => "North Star",
            Platform::AmstradCpc => "Amstrad CPC",
            Platform::Msx => "MSX",
            Platform::Spectrum => "Spectrum +3",
            Platform::SamCoupe => "SAM Coupé",
            Platform::Pc98 => "PC-98",
            Platform::X68000 => "X68000",
            Platform::FmTowns => "FM Towns",
            Platform::Thomson => "Thomson",
            Platform::Oric => "Oric",
            Platform::Kaypro => "Kaypro",
            Platform::Osborne => "Osborne",
            Platform::Qx10 => "Epson QX-10",
        };
        write!(f, "{}", s)
    }
}

/// Everything needed to read, decode and format one kind of disk
#[derive(Debug, Clone)]
pub struct PlatformProfile {
    /// Short name used by the `format` parameter
    pub name: &'static str,
    /// Human readable description
    pub description: &'static str,
    /// Machine family
    pub platform: Platform,
    /// Line encoding
    pub encoding: Encoding,
    /// Nominal geometry
    pub geometry: Geometry,
    /// Sectors per cylinder for zoned formats
    pub zones: Option<fn(u8) -> u8>,
    /// Cell time per cylinder for formats with a zoned bit rate
    pub cell_zones: Option<fn(u8) -> f64>,
    /// Nominal cell time in nanoseconds
    pub cell_ns: f64,
    /// GAP#3 length used when formatting
    pub gap3: u8,
    /// Filler byte for freshly formatted sectors
    pub filler_byte: u8,
    /// Physical interleave when formatting
    pub interleave: u8,
    /// Revolutions captured per read
    pub revolutions: u8,
    /// PLL preset name
    pub pll_preset: &'static str,
    /// Track driver name
    pub track_driver: &'static str,
    /// Filesystem driver usually found on this kind of disk
    pub filesystem: Option<&'static str>,
    /// Drive steps twice per cylinder (40-track media in an 80-track drive)
    pub double_step: bool,
}

impl PlatformProfile {
    #[allow(clippy::too_many_arguments)]
    fn new(
        name: &'static str,
        description: &'static str,
        platform: Platform,
        encoding: Encoding,
        geometry: Geometry,
        cell_ns: f64,
        track_driver: &'static str,
        filesystem: Option<&'static str>,
    ) -> Self {
        Self {
            name,
            description,
            platform,
            encoding,
            geometry,
            zones: None,
            cell_zones: None,
            cell_ns,
            gap3: 0x4E,
            filler_byte: 0xE5,
            interleave: 1,
            revolutions: 3,
            pll_preset: "default",
            track_driver,
            filesystem,
            double_step: false,
        }
    }

    fn zoned(mut self, zones: fn(u8) -> u8) -> Self {
        self.zones = Some(zones);
        self
    }

    fn cell_zoned(mut self, cells: fn(u8) -> f64) -> Self {
        self.cell_zones = Some(cells);
        self
    }

    fn gap3(mut self, gap3: u8) -> Self {
        self.gap3 = gap3;
        self
    }

    fn filler(mut self, filler: u8) -> Self {
        self.filler_byte = filler;
        self
    }

    fn pll(mut self, preset: &'static str) -> Self {
        self.pll_preset = preset;
        self
    }

    fn revolutions(mut self, revolutions: u8) -> Self {
        self.revolutions = revolutions;
        self
    }

    fn interleave(mut self, interleave: u8) -> Self {
        self.interleave = interleave;
        self
    }

    /// Expected sectors on a cylinder
    pub fn sectors_on(&self, cylinder: u8) -> u8 {
        match self.zones {
            Some(zones) => zones(cylinder),
            None => self.geometry.sectors_per_track,
        }
    }

    /// Cell time on a cylinder
    pub fn cell_ns_on(&self, cylinder: u8) -> f64 {
        match self.cell_zones {
            Some(cells) => cells(cylinder),
            None => self.cell_ns,
        }
    }

    /// Formatted capacity in bytes
    pub fn capacity(&self) -> usize {
        (0..self.geometry.cylinders)
            .map(|c| self.sectors_on(c) as usize * self.geometry.sector_size as usize)
            .sum::<usize>()
            * self.geometry.heads as usize
    }

    /// Nominal time for one revolution in nanoseconds
    pub fn rotation_ns(&self) -> u64 {
        60_000_000_000 / self.geometry.rpm.max(1) as u64
    }
}

/// Cell time for a cylinder, from the profile when there is one
pub fn cell_ns_for(encoding: Encoding, cylinder: u8, profile: Option<&PlatformProfile>) -> f64 {
    match profile {
        Some(p) if p.encoding == encoding => p.cell_ns_on(cylinder),
        _ if encoding == Encoding::GcrCbm => c64_cell(cylinder),
        _ => encoding.nominal_cell_ns(),
    }
}

/// 1541 speed zones
pub fn c64_zone(cylinder: u8) -> u8 {
    match cylinder.saturating_add(1) {
        1..=17 => 21,
        18..=24 => 19,
        25..=30 => 18,
        _ => 17,
    }
}

fn c64_cell(cylinder: u8) -> f64 {
    match c64_zone(cylinder) {
        21 => 3250.0,
        19 => 3500.0,
        18 => 3750.0,
        _ => 4000.0,
    }
}

/// Macintosh GCR zones: 12 sectors on the outer 16 tracks down to 8
pub fn mac_zone(cylinder: u8) -> u8 {
    12 - (cylinder / 16).min(4)
}

/// Victor 9000 zones
pub fn victor_zone(cylinder: u8) -> u8 {
    match cylinder {
        0..=3 => 19,
        4..=15 => 18,
        16..=26 => 17,
        27..=37 => 16,
        38..=47 => 15,
        48..=59 => 14,
        60..=70 => 13,
        _ => 12,
    }
}

fn build_profiles() -> Vec<PlatformProfile> {
    use Encoding::*;
    use Platform::*;
    let g = Geometry::new;
    vec![
        PlatformProfile::new("pc-360k", "PC 5.25\" DD 360K", Pc, Mfm, g(40, 2, 9, 512), 2000.0, "ibm-mfm", Some("fat")).gap3(0x2A).filler(0xF6),
        PlatformProfile::new("pc-720k", "PC 3.5\" DD 720K", Pc, Mfm, g(80, 2, 9, 512), 2000.0, "ibm-mfm", Some("fat")).gap3(0x2A).filler(0xF6),
        PlatformProfile::new("pc-1200k", "PC 5.25\" HD 1.2M", Pc, Mfm, g(80, 2, 15, 512).with_rpm(360), 1000.0, "ibm-mfm", Some("fat")).gap3(0x1B).filler(0xF6),
        PlatformProfile::new("pc-1440k", "PC 3.5\" HD 1.44M", Pc, Mfm, g(80, 2, 18, 512), 1000.0, "ibm-mfm", Some("fat")).gap3(0x1B).filler(0xF6),
        PlatformProfile::new("amiga-dd", "Amiga DD 880K", Amiga, AmigaMfm, g(80, 2, 11, 512).with_first_sector(0), 2000.0, "amiga", Some("amigados")).pll("amiga").filler(0),
        PlatformProfile::new("amiga-hd", "Amiga HD 1.76M", Amiga, AmigaMfm, g(80, 2, 22, 512).with_first_sector(0).with_rpm(150), 2000.0, "amiga", Some("amigados")).pll("amiga").filler(0),
        PlatformProfile::new("atari-st-ss", "Atari ST single sided 360K", AtariSt, Mfm, g(80, 1, 9, 512), 2000.0, "atari-st", Some("fat")).gap3(0x28).filler(0),
        PlatformProfile::new("atari-st-ds", "Atari ST double sided 720K", AtariSt, Mfm, g(80, 2, 9, 512), 2000.0, "atari-st", Some("fat")).gap3(0x28).filler(0),
        PlatformProfile::new("atari-8bit", "Atari 8-bit single density", Atari8, Fm, g(40, 1, 18, 128).with_rpm(288), 4000.0, "atari8", None).gap3(0x11).filler(0).interleave(9),
        PlatformProfile::new("c64", "Commodore 1541 35 track", C64, GcrCbm, g(35, 1, 21, 256).with_first_sector(0), 3250.0, "cbm", Some("cbm")).zoned(c64_zone).cell_zoned(c64_cell).pll("c64").filler(0).revolutions(2),
        PlatformProfile::new("c64-40", "Commodore 1541 40 track", C64, GcrCbm, g(40, 1, 21, 256).with_first_sector(0), 3250.0, "cbm", Some("cbm")).zoned(c64_zone).cell_zoned(c64_cell).pll("c64").filler(0).revolutions(2),
        PlatformProfile::new("apple2-dos33", "Apple II DOS 3.3", AppleII, GcrApple, g(35, 1, 16, 256).with_first_sector(0), 4000.0, "apple2", Some("dos33")).pll("apple").filler(0),
        PlatformProfile::new("apple2-prodos", "Apple II ProDOS", AppleII, GcrApple, g(35, 1, 16, 256).with_first_sector(0), 4000.0, "apple2", Some("prodos")).pll("apple").filler(0),
        PlatformProfile::new("mac-400k", "Macintosh 400K", Mac, GcrMac, g(80, 1, 12, 512).with_first_sector(0).with_rpm(394), 2000.0, "mac", Some("hfs")).zoned(mac_zone).pll("apple").filler(0),
        PlatformProfile::new("mac-800k", "Macintosh 800K", Mac, GcrMac, g(80, 2, 12, 512).with_first_sector(0).with_rpm(394), 2000.0, "mac", Some("hfs")).zoned(mac_zone).pll("apple").filler(0),
        PlatformProfile::new("bbc-ss", "BBC Micro DFS single sided", Bbc, Fm, g(80, 1, 10, 256).with_first_sector(0), 4000.0, "bbc", Some("dfs")).gap3(0x15),
        PlatformProfile::new("bbc-ds", "BBC Micro DFS double sided", Bbc, Fm, g(80, 2, 10, 256).with_first_sector(0), 4000.0, "bbc", Some("dfs")).gap3(0x15),
        PlatformProfile::new("trs80", "TRS-80 Model I single density", Trs80, Fm, g(40, 1, 10, 256).with_first_sector(0), 4000.0, "trs80", Some("trsdos")).gap3(0x0B),
        PlatformProfile::new("rx02", "DEC RX02 8\" double density", Dec, M2fm, g(77, 1, 26, 256).with_rpm(360), 1000.0, "rx02", None).gap3(0x1B),
        PlatformProfile::new("victor", "Victor 9000 single sided", Victor, GcrVictor, g(80, 1, 19, 512).with_first_sector(0), 2000.0, "victor", None).zoned(victor_zone).filler(0),
        PlatformProfile::new("northstar", "North Star double density", Northstar, Mfm, g(35, 2, 10, 512).with_first_sector(0), 2000.0, "northstar", None).filler(0),
        PlatformProfile::new("cpc-data", "Amstrad CPC data format", AmstradCpc, Mfm, g(40, 1, 9, 512).with_first_sector(0xC1), 2000.0, "cpc", Some("cpm")).gap3(0x52),
        PlatformProfile::new("cpc-system", "Amstrad CPC system format", AmstradCpc, Mfm, g(40, 1, 9, 512).with_first_sector(0x41), 2000.0, "cpc", Some("cpm")).gap3(0x52),
        PlatformProfile::new("msx", "MSX-DOS 720K", Msx, Mfm, g(80, 2, 9, 512), 2000.0, "msx", Some("fat")).filler(0),
        PlatformProfile::new("spectrum-plus3", "Spectrum +3 180K", Spectrum, Mfm, g(40, 1, 9, 512), 2000.0, "spectrum", Some("cpm")).gap3(0x52),
        PlatformProfile::new("sam", "SAM Coupé 800K", SamCoupe, Mfm, g(80, 2, 10, 512), 2000.0, "sam", None).gap3(0x18).filler(0),
        PlatformProfile::new("pc98", "PC-98 2HD 1.25M", Pc98, Mfm, g(77, 2, 8, 1024).with_rpm(360), 1000.0, "pc98", Some("fat")).gap3(0x74),
        PlatformProfile::new("x68000", "X68000 2HD 1.25M", X68000, Mfm, g(77, 2, 8, 1024).with_rpm(360), 1000.0, "x68000", Some("fat")).gap3(0x74),
        PlatformProfile::new("fm-towns", "FM Towns 2HD 1.25M", FmTowns, Mfm, g(77, 2, 8, 1024).with_rpm(360), 1000.0, "fm-towns", Some("fat")).gap3(0x74),
        PlatformProfile::new("thomson", "Thomson 3.5\" 320K", Thomson, Mfm, g(80, 1, 16, 256), 2000.0, "thomson", None).filler(0xE5),
        PlatformProfile::new("oric", "Oric Sedoric", Oric, Mfm, g(80, 2, 17, 256), 2000.0, "oric", None),
        PlatformProfile::new("kaypro", "Kaypro II", Kaypro, Mfm, g(40, 1, 10, 512).with_first_sector(0), 2000.0, "kaypro", Some("cpm")),
        PlatformProfile::new("osborne", "Osborne 1 single density", Osborne, Fm, g(40, 1, 10, 256), 4000.0, "osborne", Some("cpm")),
        PlatformProfile::new("qx10", "Epson QX-10", Qx10, Mfm, g(40, 2, 16, 256), 2000.0, "qx10", Some("cpm")),
        PlatformProfile::new("preservation", "Flux only, no decoding", Platform::Unknown, Encoding::Unknown, g(84, 2, 0, 512), 2000.0, "raw", None).revolutions(5),
    ]
}

/// Every profile, built once
pub fn profiles() -> &'static [PlatformProfile] {
    static PROFILES: OnceLock<Vec<PlatformProfile>> = OnceLock::new();
    PROFILES.get_or_init(build_profiles)
}

/// Look a profile up by name
pub fn profile(name: &str) -> Result<&'static PlatformProfile> {
    let lower = name.to_ascii_lowercase();
    profiles()
        .iter()
        .find(|p| p.name == lower)
        .ok_or_else(|| FloppyError::NotFound(format!("platform profile '{}'", name)))
}

/// First profile for a platform
pub fn for_platform(platform: Platform) -> Option<&'static PlatformProfile> {
    profiles().iter().find(|p| p.platform == platform)
}

/// Profiles whose formatted capacity equals a raw image size
pub fn by_capacity(size: usize) -> Vec<&'static PlatformProfile> {
    profiles()
        .iter()
        .filter(|p| p.geometry.sectors_per_track > 0 && p.capacity() == size)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pll::PllConfig;

    #[test]
    fn test_names_unique_and_resolvable() {
        let mut names: Vec<_> = profiles().iter().map(|p| p.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), profiles().len());
        for p in profiles() {
            assert!(PllConfig::preset(p.pll_preset).is_ok(), "{}", p.name);
            assert_eq!(profile(p.name).map(|q| q.name).ok(), Some(p.name));
        }
        assert!(profile("nope").is_err());
    }

    #[test]
    fn test_capacities() {
        assert_eq!(profile("pc-720k").unwrap().capacity(), 737_280);
        assert_eq!(profile("pc-1440k").unwrap().capacity(), 1_474_560);
        assert_eq!(profile("amiga-dd").unwrap().capacity(), 901_120);
        assert_eq!(profile("c64").unwrap().capacity(), 174_848);
        assert_eq!(profile("apple2-dos33").unwrap().capacity(), 143_360);
        assert_eq!(profile("mac-400k").unwrap().capacity(), 409_600);
        assert_eq!(profile("mac-800k").unwrap().capacity(), 819_200);
    }

    #[test]
    fn test_zones() {
        assert_eq!(c64_zone(0), 21);
        assert_eq!(c64_zone(17), 19);
        assert_eq!(c64_zone(34), 17);
        assert_eq!(mac_zone(0), 12);
        assert_eq!(mac_zone(79), 8);
        assert_eq!(victor_zone(79), 12);
        let c64 = profile("c64").unwrap();
        assert!(c64.cell_ns_on(34) > c64.cell_ns_on(0));
    }

    #[test]
    fn test_by_capacity() {
        let hits: Vec<_> = by_capacity(737_280).into_iter().map(|p| p.name).collect();
        assert!(hits.contains(&"pc-720k"));
        assert!(by_capacity(12345).is_empty());
    }

    #[test]
    fn test_cell_ns_for() {
        let hd = profile("pc-1440k").unwrap();
        assert_eq!(cell_ns_for(Encoding::Mfm, 0, Some(hd)), 1000.0);
        assert_eq!(cell_ns_for(Encoding::Fm, 0, Some(hd)), 4000.0);
        assert_eq!(cell_ns_for(Encoding::GcrCbm, 34, None), 4000.0);
    }

    #[test]
    fn test_rotation() {
        assert_eq!(profile("pc-720k").unwrap().rotation_ns(), 200_000_000);
    }
}
