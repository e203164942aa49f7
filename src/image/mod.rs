//! Disk image containers: detection, parsing and serialisation
//!
//! Every container is an [`ImageCodec`] in a registry built once. Sector
//! containers map straight onto the [`Disk`] model, bitstream containers
//! are decoded through the track drivers, and flux containers go through
//! the recovery engine.

/// Commodore D64/D71/D81
pub mod d64;
/// DiskMasher detection
pub mod dms;
/// Amstrad CPCEMU DSK and extended DSK
pub mod dsk;
/// SCP, A2R and KryoFlux flux archives
pub mod flux;
/// Commodore G64 GCR bitstreams
pub mod g64;
/// HxC HFE bitstreams
pub mod hfe;
/// ImageDisk
pub mod imd;
/// SPS/CAPS IPF
pub mod ipf;
mod lzhuf;
/// Flat sector dumps (IMG, ADF, ST, DO/PO, SSD/DSD, MGT)
pub mod raw;
/// Teledisk
pub mod td0;
/// Applesauce WOZ bitstreams
pub mod woz;

use crate::disk::{Disk, Track};
use crate::encoding;
use crate::error::{FloppyError, Result, Warning};
use crate::flux::FluxArchive;
use crate::pll::Bitstream;
use crate::profile::PlatformProfile;
use crate::track::TrackDriver;
use log::{debug, info};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// What a container stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    /// Decoded sector payloads
    Sector,
    /// Bit cells as read by a drive
    Bitstream,
    /// Flux transition timings
    Flux,
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ImageKind::Sector => "sector",
            ImageKind::Bitstream => "bitstream",
            ImageKind::Flux => "flux",
        };
        write!(f, "{}", s)
    }
}

/// Options passed to a codec's parser
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Fail on any deviation instead of warning
    pub strict: bool,
    /// Platform to assume where the container does not say
    pub profile: Option<&'static PlatformProfile>,
}

/// A loaded image: the disk plus what the container said about it
#[derive(Debug, Clone)]
pub struct Image {
    /// Decoded disk
    pub disk: Disk,
    /// Codec name the image was parsed with
    pub format: &'static str,
    /// Where it was loaded from
    pub path: Option<PathBuf>,
    /// Lenient-mode anomalies
    pub warnings: Vec<Warning>,
    /// Flux captures, for flux containers
    pub flux: Option<FluxArchive>,
    /// Platform profile the layout was matched to
    pub profile: Option<&'static PlatformProfile>,
    /// Container fields kept for faithful re-serialisation
    pub blobs: BTreeMap<String, Vec<u8>>,
}

impl Image {
    /// Wrap a disk
    pub fn new(disk: Disk, format: &'static str) -> Self {
        Self {
            disk,
            format,
            path: None,
            warnings: Vec::new(),
            flux: None,
            profile: None,
            blobs: BTreeMap::new(),
        }
    }

    /// Attach the matched platform profile
    pub fn with_profile(mut self, profile: Option<&'static PlatformProfile>) -> Self {
        self.profile = profile;
        self
    }

    /// Stored container field
    pub fn blob(&self, key: &str) -> Option<&[u8]> {
        self.blobs.get(key).map(|v| v.as_slice())
    }

    /// Record a warning, or fail when strict
    pub fn warn(&mut self, strict: bool, warning: Warning) -> Result<()> {
        note(&mut self.warnings, strict, warning)
    }
}

/// Push a warning in lenient mode; turn it into a parse error in strict mode
pub fn note(warnings: &mut Vec<Warning>, strict: bool, warning: Warning) -> Result<()> {
    if strict {
        return Err(FloppyError::parse(warning.offset, warning.message));
    }
    log::warn!("{}", warning);
    warnings.push(warning);
    Ok(())
}

/// Bit cells for a track: the captured bitstream when there is one,
/// otherwise the track re-encoded through its driver
pub(crate) fn track_bits(track: &Track, driver: &dyn TrackDriver, cell_ns: f64) -> Result<Bitstream> {
    if let Some(bits) = track.bitstream.as_ref().filter(|b| !b.is_empty()) {
        return Ok(bits.clone());
    }
    let raw = driver.encode(track)?;
    encoding::encode(&raw, cell_ns).ok_or_else(|| {
        FloppyError::unsupported(format!("no bit encoder for {}", driver.encoding().name()))
    })
}

/// Parses and writes one container format
pub trait ImageCodec: Send + Sync {
    /// Registry name, also accepted as a `format` parameter
    fn name(&self) -> &'static str;

    /// Human readable description
    fn description(&self) -> &'static str;

    /// File extensions, lower case without the dot
    fn extensions(&self) -> &'static [&'static str];

    /// What the container stores
    fn kind(&self) -> ImageKind;

    /// Confidence 0-100 that the data is this container.
    /// Magic matches score 90 and above; size matches stay below.
    fn probe(&self, data: &[u8]) -> u8;

    /// Parse a container
    fn parse(&self, data: &[u8], options: &ParseOptions) -> Result<Image>;

    /// Serialise a disk into this container
    fn serialize(&self, image: &Image) -> Result<Vec<u8>> {
        Err(FloppyError::unsupported(format!(
            "{} images cannot be written (source is {})",
            self.name(),
            image.format
        )))
    }

    /// Whether [`ImageCodec::serialize`] is implemented
    fn can_write(&self) -> bool {
        true
    }

    /// Load from a path
    fn load(&self, path: &Path, options: &ParseOptions) -> Result<Image> {
        let data = std::fs::read(path)?;
        let mut image = self.parse(&data, options)?;
        image.path = Some(path.to_path_buf());
        Ok(image)
    }

    /// Write to a path
    fn store(&self, image: &Image, path: &Path) -> Result<()> {
        let data = self.serialize(image)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

fn build_registry() -> Vec<Box<dyn ImageCodec>> {
    let mut codecs: Vec<Box<dyn ImageCodec>> = vec![
        Box::new(flux::ScpCodec),
        Box::new(flux::A2rCodec),
        Box::new(flux::KryofluxCodec),
        Box::new(woz::WozCodec),
        Box::new(hfe::HfeCodec),
        Box::new(ipf::IpfCodec),
        Box::new(dms::DmsCodec),
        Box::new(g64::G64Codec),
        Box::new(dsk::DskCodec),
        Box::new(imd::ImdCodec),
        Box::new(td0::Td0Codec),
        Box::new(d64::D64Codec),
        Box::new(d64::D71Codec),
        Box::new(d64::D81Codec),
    ];
    for codec in raw::variants() {
        codecs.push(Box::new(codec));
    }
    codecs
}

/// Every registered codec
pub fn registry() -> &'static [Box<dyn ImageCodec>] {
    static REGISTRY: OnceLock<Vec<Box<dyn ImageCodec>>> = OnceLock::new();
    REGISTRY.get_or_init(build_registry)
}

/// Look a codec up by name or extension
pub fn codec(name: &str) -> Result<&'static dyn ImageCodec> {
    let lower = name.trim_start_matches('.').to_ascii_lowercase();
    registry()
        .iter()
        .find(|c| c.name() == lower)
        .or_else(|| registry().iter().find(|c| c.extensions().contains(&lower.as_str())))
        .map(|c| c.as_ref())
        .ok_or_else(|| FloppyError::NotFound(format!("image format '{}'", name)))
}

/// Result of format detection
#[derive(Clone, Copy)]
pub struct Detection {
    /// Winning codec
    pub codec: &'static dyn ImageCodec,
    /// Confidence 0-100
    pub confidence: u8,
}

impl std::fmt::Debug for Detection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detection")
            .field("codec", &self.codec.name())
            .field("confidence", &self.confidence)
            .finish()
    }
}

/// Probe score that counts as a magic-byte match
const MAGIC_SCORE: u8 = 90;

fn best<I>(codecs: I, data: &[u8]) -> Option<(&'static dyn ImageCodec, u8)>
where
    I: Iterator<Item = &'static Box<dyn ImageCodec>>,
{
    let mut best: Option<(&'static dyn ImageCodec, u8)> = None;
    for c in codecs {
        let score = c.probe(data);
        if score > best.map(|(_, s)| s).unwrap_or(0) {
            best = Some((c.as_ref(), score));
        }
    }
    best
}

/// Identify a container: extension table first, then magic bytes, then
/// size-to-geometry matching. Deterministic for the same inputs.
pub fn detect(path: Option<&Path>, data: &[u8]) -> Option<Detection> {
    let ext = path
        .and_then(|p| p.extension())
        .map(|e| e.to_string_lossy().to_ascii_lowercase());
    if let Some(ext) = ext.as_deref() {
        let by_ext = registry().iter().filter(|c| c.extensions().contains(&ext));
        if let Some((codec, score)) = best(by_ext, data) {
            debug!("{}: matched by extension .{} ({})", codec.name(), ext, score);
            return Some(Detection {
                codec,
                confidence: score.max(80),
            });
        }
    }
    let magic = registry().iter().filter(|c| c.probe(data) >= MAGIC_SCORE);
    if let Some((codec, confidence)) = best(magic, data) {
        return Some(Detection { codec, confidence });
    }
    best(registry().iter(), data).map(|(codec, confidence)| Detection { codec, confidence })
}

/// Detect a file or capture directory on disk
pub fn detect_path(path: &Path) -> Result<Detection> {
    if path.is_dir() {
        let c = codec("kryoflux")?;
        return Ok(Detection {
            codec: c,
            confidence: 90,
        });
    }
    let data = std::fs::read(path)?;
    detect(Some(path), &data)
        .ok_or_else(|| FloppyError::invalid_format(format!("{}: unrecognised image format", path.display())))
}

/// Open an image, optionally naming the format (`auto` probes)
pub fn open(path: &Path, hint: Option<&str>, options: &ParseOptions) -> Result<Image> {
    let codec = match hint.filter(|h| !h.eq_ignore_ascii_case("auto")) {
        Some(name) => codec(name)?,
        None => detect_path(path)?.codec,
    };
    info!("opening {} as {}", path.display(), codec.name());
    codec.load(path, options)
}

/// Save an image in a named format
pub fn save(image: &Image, path: &Path, format: &str) -> Result<()> {
    let codec = codec(format)?;
    if !codec.can_write() {
        return Err(FloppyError::unsupported(format!("{} images are read-only", codec.name())));
    }
    info!("saving {} as {}", path.display(), codec.name());
    codec.store(image, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_names_unique() {
        let mut names: Vec<_> = registry().iter().map(|c| c.name()).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn test_lookup_by_extension() {
        assert_eq!(codec("adf").unwrap().name(), "adf");
        assert_eq!(codec(".D64").unwrap().name(), "d64");
        assert_eq!(codec("scp").unwrap().kind(), ImageKind::Flux);
        assert!(codec("nope").is_err());
    }

    #[test]
    fn test_magic_beats_size() {
        let mut data = vec![0u8; 737_280];
        data[..8].copy_from_slice(b"HXCPICFE");
        let d = detect(None, &data).unwrap();
        assert_eq!(d.codec.name(), "hfe");

        let data = vec![0u8; 737_280];
        let d = detect(None, &data).unwrap();
        assert_eq!(d.codec.name(), "img");
    }

    #[test]
    fn test_extension_first() {
        let data = vec![0u8; 819_200];
        let d = detect(Some(Path::new("x.d81")), &data).unwrap();
        assert_eq!(d.codec.name(), "d81");
        assert!(d.confidence >= 80);
    }

    #[test]
    fn test_detection_is_deterministic() {
        let mut data = vec![0u8; 901_120];
        data[..4].copy_from_slice(b"DOS\0");
        let a = detect(Some(Path::new("game.adf")), &data).unwrap();
        let b = detect(Some(Path::new("game.adf")), &data).unwrap();
        assert_eq!(a.codec.name(), b.codec.name());
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(detect(None, &data).unwrap().codec.name(), "adf");
    }

    #[test]
    fn test_strict_note_fails() {
        let mut w = Vec::new();
        assert!(note(&mut w, true, Warning::new(4, "bad")).is_err());
        note(&mut w, false, Warning::new(4, "bad")).unwrap();
        assert_eq!(w.len(), 1);
    }
}
