/// Boot detection for disks
///
/// Examines the first track of a disk to determine what system it boots
/// on and gives the reason for the verdict.

use crate::disk::{Disk, Sector};
use crate::encoding::Encoding;
use crate::profile::Platform;
use serde::Serialize;

/// Where Z80 boot code of a detected system starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootCode {
    /// Load address of the first byte of `bytes`
    pub origin: u16,
    /// Code bytes
    pub bytes: Vec<u8>,
}

/// Result of boot detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootDetection {
    /// System name the disk is bootable on, or empty string if not bootable
    pub system: String,
    /// Reason for the detection
    pub reason: String,
    /// Boot code for Z80 systems, for disassembly
    #[serde(skip)]
    pub code: Option<BootCode>,
}

impl BootDetection {
    fn none<S: Into<String>>(reason: S) -> Self {
        Self {
            system: String::new(),
            reason: reason.into(),
            code: None,
        }
    }

    fn found<S: Into<String>, R: Into<String>>(system: S, reason: R) -> Self {
        Self {
            system: system.into(),
            reason: reason.into(),
            code: None,
        }
    }

    /// True when a system was recognised
    pub fn is_bootable(&self) -> bool {
        !self.system.is_empty()
    }

    /// Detect what system a disk is bootable on
    ///
    /// If the disk is not bootable, `system` will be an empty string.
    pub fn detect(disk: &Disk) -> Self {
        let track = match disk.track(0, 0) {
            Some(t) if t.sector_count() > 0 => t,
            _ => return Self::none("No sector on track 0"),
        };
        let Some(first) = track.sectors().iter().min_by_key(|s| s.id.sector) else {
            return Self::none("No sector on track 0");
        };
        let corrupt = first.has_error();
        let mut detection = if disk.encoding == Encoding::AmigaMfm || disk.platform == Platform::Amiga {
            amiga(disk)
        } else if disk.platform == Platform::AppleII {
            apple(first)
        } else {
            generic(disk, first)
        };
        if corrupt && detection.is_bootable() {
            detection.reason.push_str(" (Corrupt?)");
        }
        detection
    }
}

/// Sum of big-endian longwords with the carry folded back in
fn amiga_checksum(block: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for word in block.chunks_exact(4) {
        let v = u32::from_be_bytes([word[0], word[1], word[2], word[3]]);
        let (next, carry) = sum.overflowing_add(v);
        sum = next + carry as u32;
    }
    sum
}

fn amiga(disk: &Disk) -> BootDetection {
    let mut block = Vec::with_capacity(1024);
    for id in 0..2 {
        match disk.read_sector(0, 0, id) {
            Ok(data) => block.extend_from_slice(data),
            Err(_) => return BootDetection::none("Bootblock incomplete"),
        }
    }
    if !block.starts_with(b"DOS") {
        return BootDetection::none("No DOS bootblock");
    }
    let fs = if block[3] & 1 == 1 { "FFS" } else { "OFS" };
    if amiga_checksum(&block) == 0xFFFF_FFFF {
        BootDetection::found("Amiga", format!("{} bootblock checksum valid", fs))
    } else {
        BootDetection::none(format!("{} bootblock, checksum invalid", fs))
    }
}

fn apple(first: &Sector) -> BootDetection {
    // boot0 starts with the count of sectors the PROM loads
    match first.data().first() {
        Some(&n) if (1..=15).contains(&n) => {
            BootDetection::found("Apple II", format!("Boot sector loads {} sector(s)", n))
        }
        _ => BootDetection::none("No boot0 sector"),
    }
}

fn generic(disk: &Disk, first: &Sector) -> BootDetection {
    let data = first.data();

    if first.id.sector == 0x41 {
        return BootDetection::found(
            "Amstrad CPC 664/6128",
            format!("Amstrad CPC system disk - first sector is {}", first.id.sector),
        );
    }

    if data.len() >= 512 {
        if atari_st_checksum(&data[..512]) == ATARI_ST_BOOT_SUM {
            return BootDetection::found("Atari ST", "Boot sector checksum 0x1234");
        }
        if pc_signature(data) {
            let oem: String = data[3..11]
                .iter()
                .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                .collect();
            return BootDetection::found("PC", format!("Boot signature 55AA, OEM '{}'", oem.trim_end()));
        }
    }

    let mod256 = calculate_mod_checksum(data, 256);
    let system = match mod256 {
        1 => "Amstrad PCW 9512",
        3 => "Spectrum +3",
        255 => "Amstrad PCW 8256",
        _ => {
            let reason = if disk.platform == Platform::Pc && data.len() >= 512 {
                "No boot signature".to_string()
            } else {
                format!("No valid checksum ({})", mod256)
            };
            return BootDetection::none(reason);
        }
    };
    let mut detection = BootDetection::found(system, format!("Sector {} checksum {}", first.id.sector, mod256));
    // loaded at 0xFE00, execution starts after the 16-byte disk spec
    if data.len() > 16 {
        detection.code = Some(BootCode {
            origin: 0xFE10,
            bytes: data[16..].to_vec(),
        });
    }
    detection
}

/// Word sum an Atari ST boot sector must reach to be executable
pub const ATARI_ST_BOOT_SUM: u16 = 0x1234;

/// Sum of the big-endian words of a boot sector
pub fn atari_st_checksum(sector: &[u8]) -> u16 {
    sector
        .chunks_exact(2)
        .fold(0u16, |acc, w| acc.wrapping_add(u16::from_be_bytes([w[0], w[1]])))
}

/// PC boot sector: a jump first and 55AA at the end
pub fn pc_signature(sector: &[u8]) -> bool {
    sector.len() >= 512 && sector[510] == 0x55 && sector[511] == 0xAA && matches!(sector[0], 0xEB | 0xE9)
}

/// Calculate a modulo checksum of data
fn calculate_mod_checksum(data: &[u8], mod_value: usize) -> u8 {
    let sum: usize = data.iter().map(|&b| b as usize).sum();
    (sum % mod_value) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::Geometry;
    use crate::profile::profile;

    fn plus3_like() -> Disk {
        Disk::builder().profile(profile("spectrum-plus3").unwrap()).build().unwrap()
    }

    #[test]
    fn test_mod_checksum() {
        let data = vec![1, 2, 3, 4, 5];
        let checksum = calculate_mod_checksum(&data, 256);
        assert_eq!(checksum, ((1u16 + 2 + 3 + 4 + 5) % 256) as u8);
    }

    #[test]
    fn test_boot_detection_no_disk() {
        let disk = Disk::new(Geometry::new(40, 1, 9, 512));
        let detection = BootDetection::detect(&disk);
        assert_eq!(detection.system, "");
        assert!(!detection.is_bootable());
    }

    #[test]
    fn test_boot_detection_spectrum_plus3() {
        let mut disk = plus3_like();
        let mut boot: Vec<u8> = (0..512).map(|i| (i % 256) as u8).collect();
        let sum: usize = boot.iter().map(|&b| b as usize).sum();
        let adjustment = (256 + 3 - sum % 256) % 256;
        boot[0] = boot[0].wrapping_add(adjustment as u8);
        disk.write_sector(0, 0, 1, &boot).unwrap();

        let detection = BootDetection::detect(&disk);
        assert_eq!(detection.system, "Spectrum +3");
        assert!(detection.reason.contains("checksum 3"));
        let code = detection.code.unwrap();
        assert_eq!(code.origin, 0xFE10);
        assert_eq!(code.bytes.len(), 496);
    }

    #[test]
    fn test_pc_boot_sector() {
        let mut disk = Disk::builder().profile(profile("pc-1440k").unwrap()).build().unwrap();
        let mut boot = vec![0u8; 512];
        boot[0] = 0xEB;
        boot[3..11].copy_from_slice(b"MSDOS5.0");
        boot[510] = 0x55;
        boot[511] = 0xAA;
        disk.write_sector(0, 0, 1, &boot).unwrap();
        let detection = BootDetection::detect(&disk);
        assert_eq!(detection.system, "PC");
        assert!(detection.reason.contains("MSDOS5.0"));
    }

    #[test]
    fn test_atari_st_checksum() {
        let mut disk = Disk::builder().profile(profile("atari-st-ds").unwrap()).build().unwrap();
        let mut boot = vec![0u8; 512];
        boot[0] = 0x60;
        let sum = atari_st_checksum(&boot);
        boot[510..512].copy_from_slice(&ATARI_ST_BOOT_SUM.wrapping_sub(sum).to_be_bytes());
        assert_eq!(atari_st_checksum(&boot), ATARI_ST_BOOT_SUM);
        disk.write_sector(0, 0, 1, &boot).unwrap();
        assert_eq!(BootDetection::detect(&disk).system, "Atari ST");
    }

    #[test]
    fn test_amiga_bootblock() {
        let mut disk = Disk::builder().profile(profile("amiga-dd").unwrap()).build().unwrap();
        let mut block = vec![0u8; 1024];
        block[..4].copy_from_slice(b"DOS\0");
        block[8..12].copy_from_slice(&880u32.to_be_bytes());
        let sum = amiga_checksum(&block);
        block[4..8].copy_from_slice(&(!sum).to_be_bytes());
        disk.write_sector(0, 0, 0, &block[..512]).unwrap();
        disk.write_sector(0, 0, 1, &block[512..]).unwrap();
        let detection = BootDetection::detect(&disk);
        assert_eq!(detection.system, "Amiga");
        assert!(detection.reason.starts_with("OFS"));

        disk.write_sector(0, 0, 1, &[1u8; 512]).unwrap();
        assert!(!BootDetection::detect(&disk).is_bootable());
    }

    #[test]
    fn test_cpc_system_disk() {
        let disk = Disk::builder().profile(profile("cpc-system").unwrap()).build().unwrap();
        let detection = BootDetection::detect(&disk);
        assert_eq!(detection.system, "Amstrad CPC 664/6128");
    }
}
