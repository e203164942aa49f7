//! Line encodings: bitstream to byte stream and back
//!
//! Each encoding finds its own synchronisation marks in a [`Bitstream`]
//! and produces a [`RawTrack`]: decoded bytes with the positions of the
//! marks it found. Track drivers interpret the bytes; encodings only
//! know about bits.

/// Amiga odd/even MFM
pub mod amiga;
/// CRC-16/CCITT and friends
pub mod crc;
/// FM (single density)
pub mod fm;
/// Apple 6-and-2 / 4-and-4 nibble GCR, also used by the Macintosh
pub mod gcr_apple;
/// Commodore 4-to-5 GCR
pub mod gcr_cbm;
/// DEC RX02 modified MFM
pub mod m2fm;
/// MFM (double and high density)
pub mod mfm;
/// Victor 9000 GCR
pub mod victor;

use crate::pll::Bitstream;
use serde::{Deserialize, Serialize};

/// Line encoding of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    /// Not known or not decodable
    Unknown,
    /// Frequency modulation
    Fm,
    /// Modified frequency modulation (IBM style)
    Mfm,
    /// Amiga sector layout over MFM
    AmigaMfm,
    /// Commodore 1541-family GCR
    GcrCbm,
    /// Apple II 6-and-2 GCR
    GcrApple,
    /// Macintosh 6-and-2 GCR with tags
    GcrMac,
    /// Victor 9000 GCR
    GcrVictor,
    /// DEC RX02 modified MFM
    M2fm,
}

impl Encoding {
    /// Every decodable encoding, in probing order
    pub const ALL: [Encoding; 8] = [
        Encoding::Mfm,
        Encoding::AmigaMfm,
        Encoding::Fm,
        Encoding::GcrCbm,
        Encoding::GcrApple,
        Encoding::GcrMac,
        Encoding::GcrVictor,
        Encoding::M2fm,
    ];

    /// Generic track driver for this encoding
    pub fn default_driver(&self) -> Option<&'static str> {
        match self {
            Encoding::Unknown => None,
            Encoding::Fm => Some("ibm-fm"),
            Encoding::Mfm => Some("ibm-mfm"),
            Encoding::AmigaMfm => Some("amiga"),
            Encoding::GcrCbm => Some("cbm"),
            Encoding::GcrApple => Some("apple2"),
            Encoding::GcrMac => Some("mac"),
            Encoding::GcrVictor => Some("victor"),
            Encoding::M2fm => Some("rx02"),
        }
    }

    /// Usual cell time for double-density media with this encoding
    pub fn nominal_cell_ns(&self) -> f64 {
        match self {
            Encoding::Fm | Encoding::GcrApple => 4000.0,
            Encoding::GcrCbm => 3250.0,
            Encoding::M2fm => 1000.0,
            _ => 2000.0,
        }
    }

    /// Longest legal run between transitions, in cells
    pub fn max_run_cells(&self) -> u32 {
        match self {
            Encoding::Fm => 2,
            Encoding::Mfm | Encoding::AmigaMfm => 4,
            Encoding::M2fm => 5,
            Encoding::GcrCbm | Encoding::GcrApple | Encoding::GcrMac | Encoding::GcrVictor => 3,
            Encoding::Unknown => 4,
        }
    }

    /// Shortest legal run between transitions, in cells
    pub fn min_run_cells(&self) -> u32 {
        match self {
            Encoding::Mfm | Encoding::AmigaMfm | Encoding::M2fm => 2,
            _ => 1,
        }
    }

    /// Cell patterns (value, width) that indicate the PLL is synchronised
    pub fn sync_patterns(&self) -> Vec<(u64, u32)> {
        match self {
            Encoding::Mfm | Encoding::AmigaMfm => vec![(mfm::SYNC_A1 as u64, 16)],
            Encoding::Fm => fm::MARK_PATTERNS.iter().map(|&(p, _)| (p as u64, 16)).collect(),
            Encoding::M2fm => vec![(m2fm::doubled(fm::ID_MARK_PATTERN) as u64, 32)],
            Encoding::GcrCbm | Encoding::GcrVictor => vec![(0x3FF, 10)],
            Encoding::GcrApple | Encoding::GcrMac => vec![(0xD5AA, 16)],
            Encoding::Unknown => Vec::new(),
        }
    }

    /// Short lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Unknown => "unknown",
            Encoding::Fm => "fm",
            Encoding::Mfm => "mfm",
            Encoding::AmigaMfm => "amiga-mfm",
            Encoding::GcrCbm => "gcr-cbm",
            Encoding::GcrApple => "gcr-apple",
            Encoding::GcrMac => "gcr-mac",
            Encoding::GcrVictor => "gcr-victor",
            Encoding::M2fm => "m2fm",
        }
    }

    /// Parse a name as accepted by the `encoding` parameter
    pub fn from_name(name: &str) -> Option<Encoding> {
        let lower = name.to_ascii_lowercase();
        Encoding::ALL
            .iter()
            .copied()
            .chain(std::iter::once(Encoding::Unknown))
            .find(|e| e.name() == lower)
    }
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Encoding::Unknown => "Unknown",
            Encoding::Fm => "FM",
            Encoding::Mfm => "MFM",
            Encoding::AmigaMfm => "Amiga-MFM",
            Encoding::GcrCbm => "GCR (Commodore)",
            Encoding::GcrApple => "GCR (Apple II)",
            Encoding::GcrMac => "GCR (Macintosh)",
            Encoding::GcrVictor => "GCR (Victor)",
            Encoding::M2fm => "M2FM",
        };
        write!(f, "{}", s)
    }
}

/// Kind of synchronisation mark found in a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkKind {
    /// Bare synchronisation pattern (missing-clock byte, GCR sync run)
    Sync,
    /// Index address mark
    IndexAddress,
    /// Sector header mark
    IdAddress,
    /// Data mark
    DataAddress,
    /// Deleted data mark
    DeletedData,
}

/// Position of a mark in a [`RawTrack`]'s byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    /// Byte offset of the mark
    pub offset: usize,
    /// Mark type
    pub kind: MarkKind,
}

/// Bytes decoded from one track plus where the marks were.
///
/// The same shape is used in the write direction: track drivers build a
/// `RawTrack` and the encoding turns it into cells, using the markers to
/// place synchronisation patterns.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTrack {
    /// Encoding the bytes came from
    pub encoding: Encoding,
    /// Decoded bytes
    pub bytes: Vec<u8>,
    /// Marks found, in byte order
    pub markers: Vec<Marker>,
    /// Bit offset of each byte in the source bitstream
    pub bit_offsets: Vec<usize>,
    /// Weak-bit evidence per byte
    pub weak: Vec<bool>,
}

impl RawTrack {
    /// Create an empty raw track
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            bytes: Vec::new(),
            markers: Vec::new(),
            bit_offsets: Vec::new(),
            weak: Vec::new(),
        }
    }

    /// Append a decoded byte
    pub fn push(&mut self, byte: u8, bit_offset: usize, weak: bool) {
        self.bytes.push(byte);
        self.bit_offsets.push(bit_offset);
        self.weak.push(weak);
    }

    /// Append bytes for encoding (no source position)
    pub fn extend(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push(b, 0, false);
        }
    }

    /// Append a byte repeated `count` times
    pub fn fill(&mut self, byte: u8, count: usize) {
        for _ in 0..count {
            self.push(byte, 0, false);
        }
    }

    /// Record a mark at the next byte position
    pub fn mark(&mut self, kind: MarkKind) {
        self.markers.push(Marker {
            offset: self.bytes.len(),
            kind,
        });
    }

    /// Record a mark at an explicit offset
    pub fn mark_at(&mut self, offset: usize, kind: MarkKind) {
        self.markers.push(Marker { offset, kind });
    }

    /// Number of bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when nothing was decoded
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Markers of a given kind
    pub fn markers_of(&self, kind: MarkKind) -> impl Iterator<Item = &Marker> {
        self.markers.iter().filter(move |m| m.kind == kind)
    }

    /// Whether a marker of `kind` sits at `offset`
    pub fn has_marker(&self, offset: usize, kind: MarkKind) -> bool {
        self.markers
            .iter()
            .any(|m| m.offset == offset && m.kind == kind)
    }

    /// Slice of decoded bytes if fully present
    pub fn slice(&self, start: usize, len: usize) -> Option<&[u8]> {
        self.bytes.get(start..start.checked_add(len)?)
    }

    /// Whether any byte in a range carries weak evidence
    pub fn any_weak(&self, start: usize, len: usize) -> bool {
        let end = (start + len).min(self.weak.len());
        start < end && self.weak[start..end].iter().any(|&w| w)
    }

    /// Bit offset of a byte in the source bitstream
    pub fn bit_offset(&self, index: usize) -> Option<usize> {
        self.bit_offsets.get(index).copied()
    }
}

/// Converts between bit cells and bytes for one encoding
pub trait EncodingCodec: Send + Sync {
    /// Which encoding this is
    fn encoding(&self) -> Encoding;

    /// Find marks and decode bytes
    fn decode(&self, bits: &Bitstream) -> RawTrack;

    /// Produce cells for a raw track, at the given cell duration
    fn encode(&self, raw: &RawTrack, cell_ns: f64) -> Bitstream;
}

/// Codec for an encoding
pub fn codec(encoding: Encoding) -> Option<&'static dyn EncodingCodec> {
    match encoding {
        Encoding::Fm => Some(&fm::FmCodec),
        Encoding::Mfm => Some(&mfm::MfmCodec),
        Encoding::AmigaMfm => Some(&amiga::AmigaCodec),
        Encoding::GcrCbm => Some(&gcr_cbm::CbmGcrCodec),
        Encoding::GcrApple => Some(&gcr_apple::AppleGcrCodec),
        Encoding::GcrMac => Some(&gcr_apple::MacGcrCodec),
        Encoding::GcrVictor => Some(&victor::VictorGcrCodec),
        Encoding::M2fm => Some(&m2fm::M2fmCodec),
        Encoding::Unknown => None,
    }
}

/// Decode a bitstream with a given encoding
pub fn decode(encoding: Encoding, bits: &Bitstream) -> RawTrack {
    match codec(encoding) {
        Some(c) => c.decode(bits),
        None => RawTrack::new(Encoding::Unknown),
    }
}

/// Encode a raw track
pub fn encode(raw: &RawTrack, cell_ns: f64) -> Option<Bitstream> {
    codec(raw.encoding).map(|c| c.encode(raw, cell_ns))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_names_round_trip() {
        for e in Encoding::ALL {
            assert_eq!(Encoding::from_name(e.name()), Some(e));
        }
        assert_eq!(Encoding::from_name("MFM"), Some(Encoding::Mfm));
        assert_eq!(Encoding::from_name("nonsense"), None);
    }

    #[test]
    fn test_every_encoding_has_a_codec() {
        for e in Encoding::ALL {
            assert_eq!(codec(e).map(|c| c.encoding()), Some(e));
        }
        assert!(codec(Encoding::Unknown).is_none());
    }

    #[test]
    fn test_raw_track_markers() {
        let mut raw = RawTrack::new(Encoding::Mfm);
        raw.fill(0x4E, 4);
        raw.mark(MarkKind::IdAddress);
        raw.extend(&[0xFE, 0, 0, 1, 2]);
        assert!(raw.has_marker(4, MarkKind::IdAddress));
        assert_eq!(raw.markers_of(MarkKind::IdAddress).count(), 1);
        assert_eq!(raw.slice(4, 5), Some(&[0xFE, 0, 0, 1, 2][..]));
        assert!(raw.slice(6, 10).is_none());
    }
}
