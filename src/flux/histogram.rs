//! Interval histogram, peak detection and encoding guess

use crate::encoding::Encoding;
use crate::flux::FluxStream;

/// Histogram bucket width in nanoseconds
pub const BUCKET_NS: u32 = 50;

/// Longest interval considered, in nanoseconds
pub const MAX_NS: u32 = 20_000;

/// Interval distribution of a flux stream
#[derive(Debug, Clone, PartialEq)]
pub struct FluxHistogram {
    buckets: Vec<u32>,
    total: u64,
}

/// A local maximum of the histogram
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// Weighted centre of the peak in nanoseconds
    pub center_ns: f64,
    /// Intervals counted in the peak
    pub count: u64,
}

/// Result of looking at a histogram
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingGuess {
    /// Most likely encoding family
    pub encoding: Encoding,
    /// Estimated cell time in nanoseconds
    pub cell_ns: f64,
    /// Confidence 0-100
    pub confidence: u8,
    /// Peaks the guess was based on
    pub peaks: Vec<Peak>,
}

impl FluxHistogram {
    /// Build from every interval of a stream
    pub fn from_stream(stream: &FluxStream) -> Self {
        Self::from_intervals(stream.intervals())
    }

    /// Build from raw intervals
    pub fn from_intervals(intervals: &[u32]) -> Self {
        let mut buckets = vec![0u32; (MAX_NS / BUCKET_NS) as usize + 1];
        let mut total = 0;
        for &ns in intervals {
            if ns < MAX_NS {
                buckets[(ns / BUCKET_NS) as usize] += 1;
                total += 1;
            }
        }
        Self { buckets, total }
    }

    /// Counts per bucket
    pub fn buckets(&self) -> &[u32] {
        &self.buckets
    }

    /// Intervals counted
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Peaks holding at least 2% of all intervals, in ascending order
    pub fn peaks(&self) -> Vec<Peak> {
        let threshold = (self.total / 50).max(1) as u32;
        let mut peaks = Vec::new();
        let mut i = 0;
        while i < self.buckets.len() {
            if self.buckets[i] < threshold {
                i += 1;
                continue;
            }
            // a cluster: run of buckets above a tenth of the threshold
            let floor = (threshold / 10).max(1);
            let start = i;
            while i < self.buckets.len() && self.buckets[i] >= floor {
                i += 1;
            }
            let mut count = 0u64;
            let mut weighted = 0f64;
            for (b, &n) in self.buckets[start..i].iter().enumerate() {
                let centre = ((start + b) as f64 + 0.5) * BUCKET_NS as f64;
                count += n as u64;
                weighted += centre * n as f64;
            }
            if count > 0 {
                peaks.push(Peak {
                    center_ns: weighted / count as f64,
                    count,
                });
            }
        }
        peaks
    }

    /// Guess the encoding family from the spacing of the peaks.
    ///
    /// MFM shows three peaks at 2:3:4 cells, FM two at 1:2 and GCR three
    /// at 1:2:3. A lone peak at 2 or 4 µs is taken as MFM whose data is
    /// mostly zero bits, where the 3 and 4 cell runs come only from the
    /// headers and sit below the peak threshold.
    pub fn guess(&self) -> EncodingGuess {
        let peaks = self.peaks();
        let unknown = EncodingGuess {
            encoding: Encoding::Unknown,
            cell_ns: 0.0,
            confidence: 0,
            peaks: peaks.clone(),
        };
        let Some(first) = peaks.first() else {
            return unknown;
        };
        let base = first.center_ns;
        let ratios: Vec<f64> = peaks.iter().map(|p| p.center_ns / base).collect();
        let near = |r: f64, want: f64| (r - want).abs() < 0.12;

        let (encoding, cell_ns, confidence) = if ratios.len() >= 3 && near(ratios[1], 1.5) && near(ratios[2], 2.0) {
            (Encoding::Mfm, base / 2.0, 90)
        } else if ratios.len() >= 3 && near(ratios[1], 2.0) && near(ratios[2], 3.0) {
            (Encoding::GcrCbm, base, 75)
        } else if ratios.len() == 2 && near(ratios[1], 2.0) {
            (Encoding::Fm, base, 80)
        } else if ratios.len() == 2 && near(ratios[1], 1.5) {
            (Encoding::Mfm, base / 2.0, 60)
        } else if ratios.len() == 1 && lone_mfm_peak(base) {
            (Encoding::Mfm, base / 2.0, 50)
        } else {
            return unknown;
        };
        EncodingGuess {
            encoding,
            cell_ns,
            confidence,
            peaks,
        }
    }
}

/// Two-cell MFM interval at double or high density
fn lone_mfm_peak(center_ns: f64) -> bool {
    (3600.0..=4400.0).contains(&center_ns) || (1800.0..=2200.0).contains(&center_ns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spread(centres: &[u32], each: usize) -> Vec<u32> {
        let mut out = Vec::new();
        for &c in centres {
            for k in 0..each {
                out.push(c - 60 + (k as u32 % 5) * 30);
            }
        }
        out
    }

    #[test]
    fn test_mfm_dd() {
        let h = FluxHistogram::from_intervals(&spread(&[4000, 6000, 8000], 200));
        let g = h.guess();
        assert_eq!(g.encoding, Encoding::Mfm);
        assert!((g.cell_ns - 2000.0).abs() < 60.0);
        assert!(g.confidence >= 90);
    }

    #[test]
    fn test_fm() {
        let g = FluxHistogram::from_intervals(&spread(&[4000, 8000], 300)).guess();
        assert_eq!(g.encoding, Encoding::Fm);
        assert!((g.cell_ns - 4000.0).abs() < 100.0);
    }

    #[test]
    fn test_gcr() {
        let g = FluxHistogram::from_intervals(&spread(&[3200, 6400, 9600], 200)).guess();
        assert_eq!(g.encoding, Encoding::GcrCbm);
    }

    #[test]
    fn test_zero_filled_mfm() {
        // 2-cell runs everywhere, the odd header run far below 2%
        let mut intervals = spread(&[4000], 5000);
        intervals.extend(spread(&[6000, 8000], 20));
        let g = FluxHistogram::from_intervals(&intervals).guess();
        assert_eq!(g.encoding, Encoding::Mfm);
        assert!((g.cell_ns - 2000.0).abs() < 60.0);
    }

    #[test]
    fn test_lone_odd_peak_is_unknown() {
        let g = FluxHistogram::from_intervals(&spread(&[7000], 500)).guess();
        assert_eq!(g.encoding, Encoding::Unknown);
    }

    #[test]
    fn test_empty_is_unknown() {
        let g = FluxHistogram::from_intervals(&[]).guess();
        assert_eq!(g.encoding, Encoding::Unknown);
        assert_eq!(g.confidence, 0);
    }
}
