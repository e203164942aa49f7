//! Flux archive containers: SuperCard Pro, Applesauce A2R and KryoFlux
//! stream sets
//!
//! Parsing keeps the captures on the image and decodes them through the
//! recovery engine. Writing reuses the captured flux of every untouched
//! track and synthesises flux for the rest from their sectors.

use crate::disk::{Disk, TrackStatus};
use crate::error::{FloppyError, Result, Warning};
use crate::flux::{a2r, kryoflux, scp, FluxArchive, FluxStream};
use crate::image::{note, track_bits, Image, ImageCodec, ImageKind, ParseOptions};
use crate::profile::{cell_ns_for, profiles, Platform, PlatformProfile};
use crate::recovery::{decode_archive, RecoveryConfig};
use crate::track::driver_for_track;
use log::debug;
use std::path::Path;

/// Profile whose layout matches what was decoded
fn match_profile(disk: &Disk) -> Option<&'static PlatformProfile> {
    if disk.platform == Platform::Unknown {
        return None;
    }
    profiles().iter().find(|p| {
        p.platform == disk.platform
            && p.sectors_on(0) == disk.geometry.sectors_per_track
            && p.geometry.heads >= disk.head_count()
    })
}

/// Decode an archive into an image
fn image_from_archive(
    archive: FluxArchive,
    mut warnings: Vec<Warning>,
    format: &'static str,
    options: &ParseOptions,
) -> Result<Image> {
    if archive.tracks.is_empty() {
        note(&mut warnings, options.strict, Warning::new(0, "archive holds no tracks"))?;
    }
    let config = options.profile.map(RecoveryConfig::for_profile).unwrap_or_default();
    let disk = decode_archive(&archive, options.profile, &config);
    let profile = options.profile.or_else(|| match_profile(&disk));
    debug!(
        "{}: {} tracks, {} encoding, profile {}",
        format,
        archive.tracks.len(),
        disk.encoding.name(),
        profile.map(|p| p.name).unwrap_or("none")
    );
    let mut image = Image::new(disk, format).with_profile(profile);
    image.warnings = warnings;
    image.flux = Some(archive);
    Ok(image)
}

/// Flux for one track laid out from its sectors, as a single revolution
fn synthesize(disk: &Disk, cylinder: u8, head: u8, profile: Option<&PlatformProfile>) -> Result<Option<FluxStream>> {
    let Some(track) = disk.track(cylinder, head) else {
        return Ok(None);
    };
    if track.is_empty() && track.bitstream.is_none() {
        return Ok(None);
    }
    let driver = driver_for_track(track, disk.encoding, profile)?;
    let cell = cell_ns_for(driver.encoding(), cylinder, profile);
    let flux = track_bits(track, driver, cell)?.to_flux();
    if flux.revolution_count() > 0 {
        return Ok(Some(flux));
    }
    let len = flux.len();
    Ok(Some(FluxStream::from_intervals(flux.intervals().to_vec(), &[0, len])))
}

/// Flux for every track of an image
pub fn archive_for(image: &Image) -> Result<FluxArchive> {
    let disk = &image.disk;
    if let Some(archive) = image.flux.as_ref().filter(|_| !disk.is_changed()) {
        return Ok(archive.clone());
    }
    let mut archive = FluxArchive::new();
    archive.rpm = disk.geometry.rpm;
    if let Some(stored) = &image.flux {
        archive.metadata = stored.metadata.clone();
    }
    for track in disk.tracks() {
        let key = (track.cylinder, track.head);
        let captured = track
            .flux
            .filter(|_| track.status != TrackStatus::Modified)
            .and_then(|h| disk.flux(h));
        let stream = match captured {
            Some(flux) => Some(flux.clone()),
            None => synthesize(disk, key.0, key.1, image.profile)?,
        };
        if let Some(stream) = stream {
            archive.tracks.insert(key, stream);
        }
    }
    Ok(archive)
}

/// SuperCard Pro `.scp`
#[derive(Debug, Clone, Copy, Default)]
pub struct ScpCodec;

impl ImageCodec for ScpCodec {
    fn name(&self) -> &'static str {
        "scp"
    }

    fn description(&self) -> &'static str {
        "SuperCard Pro flux image"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["scp"]
    }

    fn kind(&self) -> ImageKind {
        ImageKind::Flux
    }

    fn probe(&self, data: &[u8]) -> u8 {
        if scp::is_scp(data) {
            95
        } else {
            0
        }
    }

    fn parse(&self, data: &[u8], options: &ParseOptions) -> Result<Image> {
        let (archive, warnings) = scp::parse(data, options.strict)?;
        image_from_archive(archive, warnings, self.name(), options)
    }

    fn serialize(&self, image: &Image) -> Result<Vec<u8>> {
        Ok(scp::serialize(&archive_for(image)?))
    }
}

/// Applesauce `.a2r`
#[derive(Debug, Clone, Copy, Default)]
pub struct A2rCodec;

impl ImageCodec for A2rCodec {
    fn name(&self) -> &'static str {
        "a2r"
    }

    fn description(&self) -> &'static str {
        "Applesauce A2R flux image"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["a2r"]
    }

    fn kind(&self) -> ImageKind {
        ImageKind::Flux
    }

    fn probe(&self, data: &[u8]) -> u8 {
        if a2r::is_a2r(data) {
            95
        } else {
            0
        }
    }

    fn parse(&self, data: &[u8], options: &ParseOptions) -> Result<Image> {
        let (archive, warnings) = a2r::parse(data, options.strict)?;
        image_from_archive(archive, warnings, self.name(), options)
    }

    fn serialize(&self, image: &Image) -> Result<Vec<u8>> {
        Ok(a2r::serialize(&archive_for(image)?))
    }
}

/// KryoFlux stream sets: a directory of `trackNN.S.raw` files.
///
/// A single stream file parses as one track; loading a path opens the
/// whole directory it belongs to.
#[derive(Debug, Clone, Copy, Default)]
pub struct KryofluxCodec;

impl KryofluxCodec {
    fn single(data: &[u8], cylinder: u8, head: u8, options: &ParseOptions) -> Result<Image> {
        let (stream, warnings) = kryoflux::parse(data, options.strict)?;
        let mut archive = FluxArchive::new();
        archive.tracks.insert((cylinder, head), stream);
        image_from_archive(archive, warnings, "kryoflux", options)
    }
}

impl ImageCodec for KryofluxCodec {
    fn name(&self) -> &'static str {
        "kryoflux"
    }

    fn description(&self) -> &'static str {
        "KryoFlux stream files"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["raw"]
    }

    fn kind(&self) -> ImageKind {
        ImageKind::Flux
    }

    fn probe(&self, data: &[u8]) -> u8 {
        // streams open with an out-of-band stream-info block
        match data {
            [0x0D, 0x01..=0x04, ..] => 60,
            _ => 0,
        }
    }

    fn parse(&self, data: &[u8], options: &ParseOptions) -> Result<Image> {
        Self::single(data, 0, 0, options)
    }

    /// First track's stream; [`ImageCodec::store`] writes them all
    fn serialize(&self, image: &Image) -> Result<Vec<u8>> {
        let archive = archive_for(image)?;
        let (_, stream) = archive
            .tracks
            .iter()
            .next()
            .ok_or_else(|| FloppyError::invalid_arg("image has no tracks to write"))?;
        Ok(kryoflux::serialize(stream))
    }

    fn load(&self, path: &Path, options: &ParseOptions) -> Result<Image> {
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let dir = if path.is_dir() {
            Some(path)
        } else if kryoflux::parse_file_name(&name).is_some() {
            path.parent().filter(|p| !p.as_os_str().is_empty())
        } else {
            None
        };
        let mut image = match dir {
            Some(dir) => {
                let (archive, warnings) = kryoflux::load_dir(dir, options.strict)?;
                image_from_archive(archive, warnings, self.name(), options)?
            }
            None => {
                let (c, h) = kryoflux::parse_file_name(&name).unwrap_or((0, 0));
                Self::single(&std::fs::read(path)?, c, h, options)?
            }
        };
        image.path = Some(path.to_path_buf());
        Ok(image)
    }

    fn store(&self, image: &Image, path: &Path) -> Result<()> {
        kryoflux::save_dir(&archive_for(image)?, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::Geometry;
    use crate::encoding::Encoding;
    use crate::image::{codec, detect};
    use crate::profile::profile;

    fn pc_image(cylinders: u8) -> Image {
        let p = profile("pc-720k").unwrap();
        let mut disk = Disk::builder()
            .profile(p)
            .geometry(Geometry::new(cylinders, 2, 9, 512))
            .build()
            .unwrap();
        disk.write_sector(cylinders - 1, 0, 3, &[0xA5; 512]).unwrap();
        Image::new(disk, "img").with_profile(Some(p))
    }

    #[test]
    fn test_scp_from_sectors_and_back() {
        let image = pc_image(2);
        let bytes = ScpCodec.serialize(&image).unwrap();
        assert_eq!(detect(None, &bytes).unwrap().codec.name(), "scp");
        let back = ScpCodec.parse(&bytes, &ParseOptions::default()).unwrap();
        assert_eq!(back.disk.encoding, Encoding::Mfm);
        assert_eq!(back.disk.geometry.sectors_per_track, 9);
        assert_eq!(back.disk.read_sector(1, 0, 3).unwrap(), &[0xA5; 512][..]);
        assert!(back.flux.is_some());
        assert_eq!(back.profile.map(|p| p.platform), Some(Platform::Pc));
    }

    #[test]
    fn test_unchanged_image_keeps_capture() {
        let image = pc_image(1);
        let bytes = ScpCodec.serialize(&image).unwrap();
        let parsed = ScpCodec.parse(&bytes, &ParseOptions::default()).unwrap();
        let again = archive_for(&parsed).unwrap();
        assert!(again.approx_eq(parsed.flux.as_ref().unwrap(), 0));
    }

    #[test]
    fn test_a2r_round_trip() {
        let image = pc_image(1);
        let bytes = A2rCodec.serialize(&image).unwrap();
        let back = A2rCodec.parse(&bytes, &ParseOptions::default()).unwrap();
        assert_eq!(back.disk.track(0, 1).unwrap().good_sectors(), 9);
    }

    #[test]
    fn test_kryoflux_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("capture");
        codec("kryoflux").unwrap().store(&pc_image(1), &out).unwrap();
        assert!(out.join("track00.1.raw").exists());
        let back = KryofluxCodec.load(&out.join("track00.0.raw"), &ParseOptions::default()).unwrap();
        assert_eq!(back.disk.track_count(), 2);
        assert_eq!(back.disk.track(0, 0).unwrap().good_sectors(), 9);
    }

    #[test]
    fn test_empty_archive_strict() {
        let bytes = scp::serialize(&FluxArchive::new());
        let strict = ParseOptions {
            strict: true,
            ..ParseOptions::default()
        };
        assert!(ScpCodec.parse(&bytes, &strict).is_err());
        let lenient = ScpCodec.parse(&bytes, &ParseOptions::default()).unwrap();
        assert_eq!(lenient.warnings.len(), 1);
    }
}
