//! Bit cells recovered from flux, each tagged with how sure the PLL was

use crate::flux::FluxStream;

/// Reliability of a single recovered bit cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitTag {
    /// Transition landed inside the tolerance window
    Confident,
    /// Transition landed at the edge of the window, or the capture flagged it
    Weak,
    /// Cell synthesised for a gap longer than any legal run
    NoFlux,
}

/// A sequence of bit cells with per-cell tags.
///
/// Bits are stored one per byte (0 or 1) so that slicing and pattern
/// searches stay simple; tracks are at most a few hundred thousand cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitstream {
    bits: Vec<u8>,
    tags: Vec<BitTag>,
    /// Cell duration the bits were recovered or will be written at
    pub cell_ns: f64,
    /// Fraction (0-1) of intervals decoded while locked and inside the window
    pub lock_quality: f32,
    /// Bit positions where each revolution starts
    pub revolution_starts: Vec<usize>,
}

impl Bitstream {
    /// Create an empty bitstream
    pub fn new(cell_ns: f64) -> Self {
        Self {
            bits: Vec::new(),
            tags: Vec::new(),
            cell_ns,
            lock_quality: 1.0,
            revolution_starts: Vec::new(),
        }
    }

    /// Build from plain bits, all confident
    pub fn from_bits(bits: Vec<u8>, cell_ns: f64) -> Self {
        let tags = vec![BitTag::Confident; bits.len()];
        Self {
            bits: bits.into_iter().map(|b| b & 1).collect(),
            tags,
            cell_ns,
            lock_quality: 1.0,
            revolution_starts: vec![0],
        }
    }

    /// Unpack MSB-first bytes
    pub fn from_bytes_msb(bytes: &[u8], bit_count: usize, cell_ns: f64) -> Self {
        let bits = (0..bit_count.min(bytes.len() * 8))
            .map(|i| (bytes[i / 8] >> (7 - (i % 8))) & 1)
            .collect();
        Self::from_bits(bits, cell_ns)
    }

    /// Unpack LSB-first bytes
    pub fn from_bytes_lsb(bytes: &[u8], bit_count: usize, cell_ns: f64) -> Self {
        let bits = (0..bit_count.min(bytes.len() * 8))
            .map(|i| (bytes[i / 8] >> (i % 8)) & 1)
            .collect();
        Self::from_bits(bits, cell_ns)
    }

    /// Pack MSB-first; the final byte is zero padded
    pub fn to_bytes_msb(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.bits.len().div_ceil(8)];
        for (i, &b) in self.bits.iter().enumerate() {
            out[i / 8] |= b << (7 - (i % 8));
        }
        out
    }

    /// Pack LSB-first; the final byte is zero padded
    pub fn to_bytes_lsb(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.bits.len().div_ceil(8)];
        for (i, &b) in self.bits.iter().enumerate() {
            out[i / 8] |= b << (i % 8);
        }
        out
    }

    /// Append one cell
    pub fn push(&mut self, bit: u8, tag: BitTag) {
        self.bits.push(bit & 1);
        self.tags.push(tag);
    }

    /// Append confident cells
    pub fn extend_bits(&mut self, bits: &[u8]) {
        for &b in bits {
            self.push(b, BitTag::Confident);
        }
    }

    /// Mark the current position as the start of a revolution
    pub fn mark_revolution(&mut self) {
        self.revolution_starts.push(self.bits.len());
    }

    /// Number of cells
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// True when no cells are present
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Cell values
    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    /// Cell tags
    pub fn tags(&self) -> &[BitTag] {
        &self.tags
    }

    /// Single cell value (0 past the end)
    pub fn bit(&self, index: usize) -> u8 {
        self.bits.get(index).copied().unwrap_or(0)
    }

    /// Whether a cell is anything but confident
    pub fn is_weak(&self, index: usize) -> bool {
        !matches!(self.tags.get(index), Some(BitTag::Confident) | None)
    }

    /// Whether any cell in a range is not confident
    pub fn any_weak(&self, start: usize, len: usize) -> bool {
        let end = (start + len).min(self.tags.len());
        start < end && self.tags[start..end].iter().any(|t| *t != BitTag::Confident)
    }

    /// Read up to 64 cells as an MSB-first integer
    pub fn pattern_at(&self, pos: usize, nbits: usize) -> u64 {
        (0..nbits.min(64)).fold(0u64, |acc, i| (acc << 1) | self.bit(pos + i) as u64)
    }

    /// Count of confident cells
    pub fn confident_count(&self) -> usize {
        self.tags.iter().filter(|t| **t == BitTag::Confident).count()
    }

    /// Bits of one revolution
    pub fn revolution(&self, k: usize) -> Option<&[u8]> {
        let start = *self.revolution_starts.get(k)?;
        let end = self
            .revolution_starts
            .get(k + 1)
            .copied()
            .unwrap_or(self.bits.len());
        self.bits.get(start..end)
    }

    /// Convert cells back to flux: one interval per distance between ones.
    ///
    /// A one at cell `i` is a transition at the start of that cell. The
    /// interval between two transitions is their cell distance times the
    /// cell duration.
    pub fn to_flux(&self) -> FluxStream {
        let mut intervals = Vec::new();
        let mut last: Option<usize> = None;
        let mut marks = Vec::new();
        let mut rev_iter = self.revolution_starts.iter().peekable();
        for (i, &b) in self.bits.iter().enumerate() {
            while rev_iter.peek().is_some_and(|&&p| p <= i) {
                marks.push(intervals.len());
                rev_iter.next();
            }
            if b == 1 {
                if let Some(prev) = last {
                    let ns = ((i - prev) as f64 * self.cell_ns).round() as u32;
                    intervals.push(ns.max(1));
                }
                last = Some(i);
            }
        }
        if !self.bits.is_empty() {
            marks.push(intervals.len());
        }
        FluxStream::from_intervals(intervals, &marks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_msb() {
        let bytes = [0x44, 0x89];
        let bits = Bitstream::from_bytes_msb(&bytes, 16, 2000.0);
        assert_eq!(bits.pattern_at(0, 16), 0x4489);
        assert_eq!(bits.to_bytes_msb(), bytes.to_vec());
    }

    #[test]
    fn test_pack_unpack_lsb() {
        let bits = Bitstream::from_bytes_lsb(&[0x01, 0x80], 16, 2000.0);
        assert_eq!(bits.bit(0), 1);
        assert_eq!(bits.bit(15), 1);
        assert_eq!(bits.to_bytes_lsb(), vec![0x01, 0x80]);
    }

    #[test]
    fn test_to_flux() {
        let bits = Bitstream::from_bits(vec![1, 0, 1, 0, 0, 1, 0, 0, 0, 1], 2000.0);
        let flux = bits.to_flux();
        assert_eq!(flux.intervals(), &[4000, 6000, 8000]);
        assert_eq!(flux.revolution_count(), 1);
    }

    #[test]
    fn test_weak_ranges() {
        let mut bits = Bitstream::new(2000.0);
        bits.extend_bits(&[1, 0, 1]);
        bits.push(0, BitTag::Weak);
        assert!(!bits.any_weak(0, 3));
        assert!(bits.any_weak(2, 2));
        assert!(bits.is_weak(3));
        assert_eq!(bits.confident_count(), 3);
    }
}
