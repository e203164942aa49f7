//! Fallback for tracks no driver recognises
//!
//! The bytes are kept as the track's residual so nothing read from the
//! medium is lost, and the confidence is always zero.

use crate::disk::Track;
use crate::encoding::{Encoding, RawTrack};
use crate::profile::Platform;
use crate::track::{finish, Evidence, TrackDriver};

/// Keeps undecoded bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDriver;

impl TrackDriver for RawDriver {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn platform(&self) -> Platform {
        Platform::Unknown
    }

    fn encoding(&self) -> Encoding {
        Encoding::Unknown
    }

    fn probe(&self, _raw: &RawTrack) -> u8 {
        0
    }

    fn decode(&self, raw: &RawTrack, cylinder: u8, head: u8) -> Track {
        let mut track = Track::new(cylinder, head);
        finish(&mut track, self, raw, Evidence::default());
        track.confidence = 0;
        track
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::TrackStatus;

    #[test]
    fn test_keeps_residual() {
        let mut raw = RawTrack::new(Encoding::Unknown);
        raw.extend(&[1, 2, 3]);
        let track = RawDriver.decode(&raw, 5, 1);
        assert_eq!(track.residual, vec![1, 2, 3]);
        assert_eq!(track.confidence, 0);
        assert_eq!(track.driver, Some("raw"));
        assert!(RawDriver.encode(&track).is_err());
    }

    #[test]
    fn test_empty_raw_is_empty_track() {
        let track = RawDriver.decode(&RawTrack::new(Encoding::Unknown), 0, 0);
        assert_eq!(track.status, TrackStatus::Empty);
    }
}
