//! Flat sector dumps: every sector's payload in a fixed order, no header.
//!
//! The file size selects the geometry. Apple II dumps come in two
//! orders: `.do` files hold DOS 3.3 logical sectors and `.po` files hold
//! ProDOS blocks; both are mapped onto the physical sector numbers the
//! disk model stores.

use crate::boot;
use crate::disk::{Disk, SideMode};
use crate::error::{FloppyError, Result, Warning};
use crate::image::{note, Image, ImageCodec, ImageKind, ParseOptions};
use crate::profile::{profile, PlatformProfile};
use crate::track::apple::{DOS33_ORDER, PRODOS_ORDER};
use log::debug;

/// How file order maps to sectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorOrder {
    /// Sectors of a track in id order
    ById,
    /// Apple DOS 3.3 logical order
    Dos33,
    /// Apple ProDOS block order
    ProDos,
}

/// One flat dump flavour
#[derive(Debug, Clone, Copy)]
pub struct RawCodec {
    name: &'static str,
    description: &'static str,
    extensions: &'static [&'static str],
    candidates: &'static [&'static str],
    side_mode: SideMode,
    order: SectorOrder,
    /// Short files are normal (trailing unused tracks omitted)
    truncated: bool,
    /// Extra confidence from the content
    signature: fn(&[u8]) -> u8,
}

fn no_signature(_: &[u8]) -> u8 {
    0
}

fn pc_signature(data: &[u8]) -> u8 {
    if data.len() >= 512 && boot::pc_signature(&data[..512]) {
        25
    } else {
        0
    }
}

fn adf_signature(data: &[u8]) -> u8 {
    if data.len() >= 4 && &data[..3] == b"DOS" && data[3] <= 7 {
        40
    } else {
        0
    }
}

fn st_signature(data: &[u8]) -> u8 {
    match data.get(..512) {
        Some(sector) if boot::atari_st_checksum(sector) == boot::ATARI_ST_BOOT_SUM => 30,
        Some(sector) if sector[0] == 0x60 => 5,
        _ => 0,
    }
}

fn dos33_signature(data: &[u8]) -> u8 {
    // VTOC at track 17 logical sector 0
    match data.get(17 * 4096..17 * 4096 + 4) {
        Some(v) if v[1] == 17 && v[3] == 3 => 25,
        _ => 0,
    }
}

fn prodos_signature(data: &[u8]) -> u8 {
    // volume directory key block
    match data.get(1024..1024 + 5) {
        Some(b) if b[0] == 0 && b[1] == 0 && b[4] >> 4 == 0xF => 30,
        _ => 0,
    }
}

fn dfs_signature(data: &[u8]) -> u8 {
    let Some(cat) = data.get(256..512) else {
        return 0;
    };
    let sectors = ((cat[6] as usize & 0x03) << 8) | cat[7] as usize;
    if cat[5] % 8 == 0 && (cat[5] as usize / 8) <= 31 && (400..=800).contains(&sectors) {
        30
    } else {
        0
    }
}

/// Every flat dump codec, in registry order
pub fn variants() -> Vec<RawCodec> {
    vec![
        RawCodec {
            name: "img",
            description: "Raw PC sector image",
            extensions: &["img", "ima", "vfd", "flp", "xdf"],
            candidates: &["pc-360k", "pc-720k", "pc-1200k", "pc-1440k", "pc98"],
            side_mode: SideMode::Alternate,
            order: SectorOrder::ById,
            truncated: false,
            signature: pc_signature,
        },
        RawCodec {
            name: "adf",
            description: "Amiga disk file",
            extensions: &["adf"],
            candidates: &["amiga-dd", "amiga-hd"],
            side_mode: SideMode::Alternate,
            order: SectorOrder::ById,
            truncated: false,
            signature: adf_signature,
        },
        RawCodec {
            name: "st",
            description: "Atari ST sector image",
            extensions: &["st"],
            candidates: &["atari-st-ss", "atari-st-ds"],
            side_mode: SideMode::Alternate,
            order: SectorOrder::ById,
            truncated: false,
            signature: st_signature,
        },
        RawCodec {
            name: "apple-do",
            description: "Apple II DOS-order sector image",
            extensions: &["do", "dsk"],
            candidates: &["apple2-dos33"],
            side_mode: SideMode::SingleSide,
            order: SectorOrder::Dos33,
            truncated: false,
            signature: dos33_signature,
        },
        RawCodec {
            name: "apple-po",
            description: "Apple II ProDOS-order sector image",
            extensions: &["po"],
            candidates: &["apple2-prodos"],
            side_mode: SideMode::SingleSide,
            order: SectorOrder::ProDos,
            truncated: false,
            signature: prodos_signature,
        },
        RawCodec {
            name: "ssd",
            description: "BBC Micro single sided DFS image",
            extensions: &["ssd"],
            candidates: &["bbc-ss"],
            side_mode: SideMode::SingleSide,
            order: SectorOrder::ById,
            truncated: true,
            signature: dfs_signature,
        },
        RawCodec {
            name: "dsd",
            description: "BBC Micro double sided DFS image",
            extensions: &["dsd"],
            candidates: &["bbc-ds"],
            side_mode: SideMode::Alternate,
            order: SectorOrder::ById,
            truncated: true,
            signature: dfs_signature,
        },
        RawCodec {
            name: "mgt",
            description: "SAM Coupé / +D MGT image",
            extensions: &["mgt"],
            candidates: &["sam"],
            side_mode: SideMode::Alternate,
            order: SectorOrder::ById,
            truncated: false,
            signature: no_signature,
        },
    ]
}

/// Physical sector holding file sector `index` of a track
fn physical_sector(order: SectorOrder, ids: &[u8], index: usize) -> Option<u8> {
    match order {
        SectorOrder::ById => ids.get(index).copied(),
        SectorOrder::Dos33 => DOS33_ORDER.get(index).copied(),
        SectorOrder::ProDos => PRODOS_ORDER.get(index).copied(),
    }
}

/// Tracks in file order
fn track_order(disk: &Disk, side_mode: SideMode) -> Vec<(u8, u8)> {
    let cylinders = disk.geometry.cylinders;
    let heads = match side_mode {
        SideMode::SingleSide => 1,
        _ => disk.geometry.heads,
    };
    let mut out = Vec::new();
    match side_mode {
        SideMode::Successive => {
            for h in 0..heads {
                out.extend((0..cylinders).map(|c| (c, h)));
            }
        }
        _ => {
            for c in 0..cylinders {
                out.extend((0..heads).map(|h| (c, h)));
            }
        }
    }
    out
}

/// Sorted sector ids of a track
fn sorted_ids(disk: &Disk, cylinder: u8, head: u8) -> Vec<u8> {
    disk.track(cylinder, head)
        .map(|t| t.sectors_by_id().iter().map(|s| s.id.sector).collect())
        .unwrap_or_default()
}

impl RawCodec {
    fn candidate_profiles(&self) -> Vec<&'static PlatformProfile> {
        self.candidates.iter().filter_map(|n| profile(n).ok()).collect()
    }

    fn match_size(&self, size: usize) -> Option<&'static PlatformProfile> {
        self.candidate_profiles().into_iter().find(|p| p.capacity() == size)
    }

    /// Smallest candidate that holds the data, else the largest
    fn nearest(&self, size: usize) -> Option<&'static PlatformProfile> {
        let mut all = self.candidate_profiles();
        all.sort_by_key(|p| p.capacity());
        all.iter()
            .find(|p| p.capacity() >= size)
            .or_else(|| all.last())
            .copied()
    }

    fn choose_profile(
        &self,
        size: usize,
        options: &ParseOptions,
        warnings: &mut Vec<Warning>,
    ) -> Result<&'static PlatformProfile> {
        if let Some(p) = options.profile {
            if p.capacity() != size {
                note(
                    warnings,
                    options.strict,
                    Warning::new(size, format!("{} bytes does not match {} ({} bytes)", size, p.name, p.capacity())),
                )?;
            }
            return Ok(p);
        }
        if let Some(p) = self.match_size(size) {
            return Ok(p);
        }
        let nearest = self
            .nearest(size)
            .ok_or_else(|| FloppyError::Internal(format!("{} has no candidate profiles", self.name)))?;
        if self.truncated && size <= nearest.capacity() && size % 256 == 0 && size > 0 {
            return Ok(nearest);
        }
        if options.strict {
            return Err(FloppyError::invalid_arg(format!(
                "{} bytes is not a valid {} image size",
                size, self.name
            )));
        }
        note(
            warnings,
            false,
            Warning::new(size, format!("size {} does not match any {} geometry; using {}", size, self.name, nearest.name)),
        )?;
        Ok(nearest)
    }
}

impl ImageCodec for RawCodec {
    fn name(&self) -> &'static str {
        self.name
    }

    fn description(&self) -> &'static str {
        self.description
    }

    fn extensions(&self) -> &'static [&'static str] {
        self.extensions
    }

    fn kind(&self) -> ImageKind {
        ImageKind::Sector
    }

    fn probe(&self, data: &[u8]) -> u8 {
        let signature = (self.signature)(data);
        let size = if self.match_size(data.len()).is_some() {
            50
        } else if self.truncated && signature > 0 && data.len() % 256 == 0 {
            20
        } else {
            0
        };
        if size == 0 && signature >= 40 {
            // a magic match stands on its own
            return 90 + signature / 8;
        }
        if size == 0 {
            return 0;
        }
        (size + signature).min(99)
    }

    fn parse(&self, data: &[u8], options: &ParseOptions) -> Result<Image> {
        let mut warnings = Vec::new();
        let p = self.choose_profile(data.len(), options, &mut warnings)?;
        let mut disk = Disk::builder().profile(p).filler_byte(0).build()?;
        let sector_size = p.geometry.sector_size as usize;

        let mut offset = 0usize;
        for (c, h) in track_order(&disk, self.side_mode) {
            let ids = sorted_ids(&disk, c, h);
            let track = disk
                .track_mut(c, h)
                .ok_or_else(|| FloppyError::Internal(format!("track {}.{} missing after build", c, h)))?;
            for index in 0..ids.len() {
                let Some(id) = physical_sector(self.order, &ids, index) else {
                    continue;
                };
                let Some(sector) = track.get_sector_mut(id) else {
                    continue;
                };
                let end = (offset + sector_size).min(data.len());
                let mut payload = data.get(offset..end).unwrap_or(&[]).to_vec();
                payload.resize(sector_size, 0);
                sector.set_data(payload);
                offset += sector_size;
            }
        }
        if offset < data.len() {
            note(
                &mut warnings,
                options.strict,
                Warning::new(offset, format!("{} trailing bytes ignored", data.len() - offset)),
            )?;
        }
        disk.mark_unchanged();
        debug!("{}: {} bytes as {}", self.name, data.len(), p.name);

        let mut image = Image::new(disk, self.name).with_profile(Some(p));
        image.warnings = warnings;
        if self.truncated && data.len() < p.capacity() {
            image.blobs.insert("length".into(), (data.len() as u64).to_le_bytes().to_vec());
        }
        Ok(image)
    }

    fn serialize(&self, image: &Image) -> Result<Vec<u8>> {
        let disk = &image.disk;
        let sector_size = image
            .profile
            .map(|p| p.geometry.sector_size as usize)
            .unwrap_or(disk.geometry.sector_size as usize);
        let per_track = |c: u8| match image.profile {
            Some(p) => p.sectors_on(c) as usize,
            None => disk.geometry.sectors_per_track as usize,
        };
        let mut out = Vec::with_capacity(disk.total_size());
        for (c, h) in track_order(disk, self.side_mode) {
            let ids = sorted_ids(disk, c, h);
            for index in 0..per_track(c) {
                let payload = physical_sector(self.order, &ids, index)
                    .and_then(|id| disk.track(c, h).and_then(|t| t.get_sector(id)))
                    .map(|s| s.data())
                    .unwrap_or(&[]);
                let start = out.len();
                out.extend_from_slice(&payload[..payload.len().min(sector_size)]);
                out.resize(start + sector_size, 0);
            }
        }
        if let Some(length) = image.blob("length") {
            let mut bytes = [0u8; 8];
            bytes[..length.len().min(8)].copy_from_slice(&length[..length.len().min(8)]);
            out.truncate(u64::from_le_bytes(bytes) as usize);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(name: &str) -> RawCodec {
        variants().into_iter().find(|c| c.name == name).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i / 256 + i) as u8).collect()
    }

    #[test]
    fn test_img_round_trip() {
        let data = pattern(737_280);
        let image = codec("img").parse(&data, &ParseOptions::default()).unwrap();
        assert_eq!(image.profile.unwrap().name, "pc-720k");
        assert_eq!(image.disk.read_sector(0, 1, 1).unwrap(), &data[9 * 512..10 * 512]);
        assert_eq!(codec("img").serialize(&image).unwrap(), data);
    }

    #[test]
    fn test_boot_sector_signatures() {
        let mut sector = vec![0u8; 512];
        assert_eq!(pc_signature(&sector), 0);
        sector[0] = 0xEB;
        sector[510] = 0x55;
        sector[511] = 0xAA;
        assert_eq!(pc_signature(&sector), 25);

        let mut st = vec![0u8; 512];
        st[0] = 0x60;
        assert_eq!(st_signature(&st), 5);
        let sum = boot::atari_st_checksum(&st);
        st[510..].copy_from_slice(&boot::ATARI_ST_BOOT_SUM.wrapping_sub(sum).to_be_bytes());
        assert_eq!(st_signature(&st), 30);
    }

    #[test]
    fn test_adf_layout() {
        let mut data = pattern(901_120);
        data[..4].copy_from_slice(b"DOS\0");
        let adf = codec("adf");
        assert!(adf.probe(&data) >= 90);
        let image = adf.parse(&data, &ParseOptions::default()).unwrap();
        // sector ids start at 0; track 0 head 1 follows track 0 head 0
        assert_eq!(image.disk.read_sector(0, 1, 0).unwrap(), &data[11 * 512..12 * 512]);
        assert_eq!(adf.serialize(&image).unwrap(), data);
    }

    #[test]
    fn test_size_mismatch_strict_and_lenient() {
        let data = vec![0u8; 737_000];
        let strict = ParseOptions {
            strict: true,
            ..ParseOptions::default()
        };
        let err = codec("img").parse(&data, &strict).unwrap_err();
        assert_eq!(err.kind().code(), "E_INVALID_ARG");
        let image = codec("img").parse(&data, &ParseOptions::default()).unwrap();
        assert_eq!(image.warnings.len(), 1);
        assert_eq!(image.profile.unwrap().name, "pc-720k");
    }

    #[test]
    fn test_dos_order_maps_to_physical() {
        let data = pattern(143_360);
        let image = codec("apple-do").parse(&data, &ParseOptions::default()).unwrap();
        // logical sector 1 of track 0 is physical 13
        assert_eq!(image.disk.read_sector(0, 0, 13).unwrap(), &data[256..512]);
        assert_eq!(codec("apple-do").serialize(&image).unwrap(), data);
    }

    #[test]
    fn test_prodos_order_maps_to_physical() {
        let data = pattern(143_360);
        let image = codec("apple-po").parse(&data, &ParseOptions::default()).unwrap();
        assert_eq!(image.disk.read_sector(0, 0, 2).unwrap(), &data[256..512]);
        assert_eq!(image.disk.read_sector(0, 0, 1).unwrap(), &data[8 * 256..9 * 256]);
        assert_eq!(codec("apple-po").serialize(&image).unwrap(), data);
    }

    #[test]
    fn test_short_ssd_keeps_length() {
        let data = pattern(40 * 2560);
        let image = codec("ssd").parse(&data, &ParseOptions::default()).unwrap();
        assert!(image.warnings.is_empty());
        assert_eq!(image.disk.geometry.cylinders, 80);
        assert_eq!(codec("ssd").serialize(&image).unwrap(), data);
    }

    #[test]
    fn test_probe_by_size() {
        assert_eq!(codec("img").probe(&[0u8; 1000]), 0);
        assert!(codec("img").probe(&vec![0u8; 1_474_560]) >= 50);
        assert!(codec("mgt").probe(&vec![0u8; 819_200]) >= 50);
    }
}
