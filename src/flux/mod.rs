//! Flux streams: magnetic transition intervals plus index marks
//!
//! A [`FluxStream`] is the lowest common denominator every capture device
//! and flux container reduces to. Intervals are kept in nanoseconds so
//! streams from controllers with different sample clocks compare
//! directly; the originating clock is remembered so a stream can be
//! quantised back without drift.

/// A2R (Applesauce) capture container
pub mod a2r;
/// Interval histogram and encoding guess
pub mod histogram;
/// KryoFlux stream files
pub mod kryoflux;
/// SuperCard Pro flux container
pub mod scp;

pub use histogram::{EncodingGuess, FluxHistogram};

use std::collections::BTreeMap;

/// Why part of a capture cannot be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxValidity {
    /// Sample counter overflowed while waiting for a transition
    Overflow,
    /// Long stretch without any transition
    NoFlux,
}

/// A run of intervals flagged as untrustworthy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRegion {
    /// First interval in the run
    pub start: usize,
    /// Number of intervals
    pub len: usize,
    /// Cause
    pub reason: FluxValidity,
}

/// Sequence of transition-to-transition intervals with index marks.
///
/// Invariants: every interval is non-zero and index marks are
/// monotonically non-decreasing positions in `0..=len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FluxStream {
    /// Sample clock of the capturing device in Hz
    pub sample_rate: u32,
    intervals: Vec<u32>,
    index_marks: Vec<usize>,
    invalid: Vec<InvalidRegion>,
}

/// Nanoseconds in a second
pub const NS_PER_SEC: u64 = 1_000_000_000;

impl FluxStream {
    /// Create an empty stream for a device clock
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            intervals: Vec::new(),
            index_marks: Vec::new(),
            invalid: Vec::new(),
        }
    }

    /// Build from nanosecond intervals at 1 ns resolution
    pub fn from_intervals(intervals: Vec<u32>, index_marks: &[usize]) -> Self {
        let mut stream = Self::new(NS_PER_SEC as u32);
        for d in intervals {
            stream.push_interval(d);
        }
        for &m in index_marks {
            stream.push_index_at(m);
        }
        stream
    }

    /// Build from device ticks at a given sample rate
    pub fn from_ticks(ticks: &[u32], sample_rate: u32, index_marks: &[usize]) -> Self {
        let mut stream = Self::new(sample_rate);
        for &t in ticks {
            stream.push_ticks(t as u64);
        }
        for &m in index_marks {
            stream.push_index_at(m);
        }
        stream
    }

    /// Convert ticks at this stream's rate to nanoseconds
    pub fn ticks_to_ns(&self, ticks: u64) -> u64 {
        (ticks * NS_PER_SEC + self.sample_rate as u64 / 2) / self.sample_rate as u64
    }

    /// Convert nanoseconds to ticks at this stream's rate
    pub fn ns_to_ticks(&self, ns: u64) -> u64 {
        (ns * self.sample_rate as u64 + NS_PER_SEC / 2) / NS_PER_SEC
    }

    /// Duration of one device tick in nanoseconds
    pub fn resolution_ns(&self) -> f64 {
        NS_PER_SEC as f64 / self.sample_rate as f64
    }

    /// Append an interval in device ticks
    pub fn push_ticks(&mut self, ticks: u64) {
        let ns = self.ticks_to_ns(ticks).min(u32::MAX as u64) as u32;
        self.push_interval(ns);
    }

    /// Append an interval in nanoseconds; zero-length intervals are dropped
    pub fn push_interval(&mut self, ns: u32) {
        if ns > 0 {
            self.intervals.push(ns);
        }
    }

    /// Record an index pulse before the next interval
    pub fn push_index(&mut self) {
        let pos = self.intervals.len();
        self.push_index_at(pos);
    }

    fn push_index_at(&mut self, pos: usize) {
        let pos = pos.min(self.intervals.len());
        match self.index_marks.last() {
            Some(&last) if last > pos => {}
            _ => self.index_marks.push(pos),
        }
    }

    /// Flag a run of intervals as untrustworthy
    pub fn mark_invalid(&mut self, start: usize, len: usize, reason: FluxValidity) {
        if len > 0 {
            self.invalid.push(InvalidRegion { start, len, reason });
        }
    }

    /// Whether an interval lies inside a flagged region
    pub fn is_invalid(&self, index: usize) -> bool {
        self.invalid
            .iter()
            .any(|r| index >= r.start && index < r.start + r.len)
    }

    /// Flagged regions
    pub fn invalid_regions(&self) -> &[InvalidRegion] {
        &self.invalid
    }

    /// All intervals in nanoseconds
    pub fn intervals(&self) -> &[u32] {
        &self.intervals
    }

    /// Index mark positions
    pub fn index_marks(&self) -> &[usize] {
        &self.index_marks
    }

    /// Number of intervals
    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// True when the stream holds no intervals
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Number of complete revolutions (intervals between consecutive marks)
    pub fn revolution_count(&self) -> usize {
        self.index_marks.len().saturating_sub(1)
    }

    /// Interval range of revolution `k`
    pub fn revolution_range(&self, k: usize) -> Option<std::ops::Range<usize>> {
        let start = *self.index_marks.get(k)?;
        let end = *self.index_marks.get(k + 1)?;
        Some(start.min(self.len())..end.min(self.len()))
    }

    /// Intervals of revolution `k`
    pub fn revolution(&self, k: usize) -> Option<&[u32]> {
        self.revolution_range(k).map(|r| &self.intervals[r])
    }

    /// Copy of revolution `k` as its own stream with marks at both ends
    pub fn revolution_stream(&self, k: usize) -> Option<FluxStream> {
        let range = self.revolution_range(k)?;
        let mut stream = FluxStream::new(self.sample_rate);
        stream.intervals = self.intervals[range.clone()].to_vec();
        stream.index_marks = vec![0, stream.intervals.len()];
        for region in &self.invalid {
            let start = region.start.max(range.start);
            let end = (region.start + region.len).min(range.end);
            if start < end {
                stream.mark_invalid(start - range.start, end - start, region.reason);
            }
        }
        Some(stream)
    }

    /// Duration of revolution `k` in nanoseconds
    pub fn revolution_duration(&self, k: usize) -> Option<u64> {
        self.revolution(k)
            .map(|r| r.iter().map(|&d| d as u64).sum())
    }

    /// Total duration in nanoseconds
    pub fn total_ns(&self) -> u64 {
        self.intervals.iter().map(|&d| d as u64).sum()
    }

    /// Rotation speed estimated from the first revolution
    pub fn estimated_rpm(&self) -> Option<f64> {
        let ns = self.revolution_duration(0)?;
        (ns > 0).then(|| 60.0e9 / ns as f64)
    }

    /// Quantise every interval to device ticks at a given rate
    pub fn to_ticks(&self, sample_rate: u32) -> Vec<u32> {
        let rate = sample_rate.max(1) as u64;
        self.intervals
            .iter()
            .map(|&ns| ((ns as u64 * rate + NS_PER_SEC / 2) / NS_PER_SEC).max(1) as u32)
            .collect()
    }

    /// Compare two streams allowing `tolerance_ns` per interval
    pub fn approx_eq(&self, other: &FluxStream, tolerance_ns: u32) -> bool {
        self.index_marks == other.index_marks
            && self.intervals.len() == other.intervals.len()
            && self
                .intervals
                .iter()
                .zip(&other.intervals)
                .all(|(&a, &b)| a.abs_diff(b) <= tolerance_ns)
    }
}

/// Flux captures for a whole disk, keyed by (cylinder, head)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FluxArchive {
    /// Captured tracks
    pub tracks: BTreeMap<(u8, u8), FluxStream>,
    /// Nominal rotation speed of the capture drive
    pub rpm: u16,
    /// Free-form metadata carried by the container
    pub metadata: BTreeMap<String, String>,
}

impl FluxArchive {
    /// Create an empty archive
    pub fn new() -> Self {
        Self {
            tracks: BTreeMap::new(),
            rpm: 300,
            metadata: BTreeMap::new(),
        }
    }

    /// Highest cylinder captured plus one
    pub fn cylinders(&self) -> u8 {
        self.tracks
            .keys()
            .map(|&(c, _)| c.saturating_add(1))
            .max()
            .unwrap_or(0)
    }

    /// Highest head captured plus one
    pub fn heads(&self) -> u8 {
        self.tracks.keys().map(|&(_, h)| h + 1).max().unwrap_or(0)
    }

    /// Compare two archives within a per-interval tolerance
    pub fn approx_eq(&self, other: &FluxArchive, tolerance_ns: u32) -> bool {
        self.tracks.len() == other.tracks.len()
            && self.tracks.iter().all(|(key, stream)| {
                other
                    .tracks
                    .get(key)
                    .is_some_and(|o| stream.approx_eq(o, tolerance_ns))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_intervals_dropped() {
        let stream = FluxStream::from_intervals(vec![4000, 0, 6000], &[0, 2]);
        assert_eq!(stream.intervals(), &[4000, 6000]);
        assert_eq!(stream.revolution_count(), 1);
    }

    #[test]
    fn test_tick_round_trip_within_one_tick() {
        let rate = 40_000_000;
        let ticks = [160u32, 240, 320, 161, 1];
        let stream = FluxStream::from_ticks(&ticks, rate, &[0, 5]);
        assert_eq!(stream.intervals()[0], 4000);
        assert_eq!(stream.to_ticks(rate), ticks.to_vec());
    }

    #[test]
    fn test_revolutions() {
        let stream = FluxStream::from_intervals(vec![1000; 30], &[0, 10, 20, 30]);
        assert_eq!(stream.revolution_count(), 3);
        assert_eq!(stream.revolution(1).map(|r| r.len()), Some(10));
        assert_eq!(stream.revolution_duration(2), Some(10_000));
        assert!(stream.revolution(3).is_none());
    }

    #[test]
    fn test_marks_monotonic() {
        let mut stream = FluxStream::new(NS_PER_SEC as u32);
        stream.push_interval(100);
        stream.push_index();
        stream.push_index_at(0);
        assert_eq!(stream.index_marks(), &[1]);
    }

    #[test]
    fn test_invalid_regions_follow_revolution_split() {
        let mut stream = FluxStream::from_intervals(vec![2000; 20], &[0, 10, 20]);
        stream.mark_invalid(8, 4, FluxValidity::Overflow);
        let rev1 = stream.revolution_stream(1).unwrap();
        assert!(rev1.is_invalid(0));
        assert!(rev1.is_invalid(1));
        assert!(!rev1.is_invalid(2));
    }

    #[test]
    fn test_estimated_rpm() {
        let stream = FluxStream::from_intervals(vec![4000; 50_000], &[0, 50_000]);
        let rpm = stream.estimated_rpm().unwrap();
        assert!((rpm - 300.0).abs() < 0.01);
    }
}
