//! Victor 9000 sector layout
//!
//! Header record: `07 track sector checksum` where the checksum is
//! `track + sector`. Data record: `08 <512 bytes> sum-lo sum-hi`, the
//! 16-bit sum of the data bytes. Bit 7 of the track byte selects side 1.

use crate::disk::{Sector, SectorId, Track};
use crate::encoding::victor::{DATA_ID, HEADER_ID};
use crate::encoding::{Encoding, MarkKind, RawTrack};
use crate::error::{FloppyError, Result};
use crate::profile::{victor_zone, Platform};
use crate::track::{finish, Evidence, TrackDriver};

/// Victor 9000 driver
#[derive(Debug, Clone, Copy, Default)]
pub struct VictorDriver;

fn data_sum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

impl TrackDriver for VictorDriver {
    fn name(&self) -> &'static str {
        "victor"
    }

    fn platform(&self) -> Platform {
        Platform::Victor
    }

    fn encoding(&self) -> Encoding {
        Encoding::GcrVictor
    }

    fn decode(&self, raw: &RawTrack, cylinder: u8, head: u8) -> Track {
        let mut track = Track::new(cylinder, head);
        track.filler_byte = 0;
        let mut evidence = Evidence {
            plausible: true,
            ..Evidence::default()
        };
        if raw.encoding != Encoding::GcrVictor {
            finish(&mut track, self, raw, Evidence::default());
            return track;
        }
        let headers: Vec<usize> = raw.markers_of(MarkKind::IdAddress).map(|m| m.offset).collect();
        let mut header_track: Option<u8> = None;
        for (n, &at) in headers.iter().enumerate() {
            evidence.marks += 1;
            let Some(h) = raw.slice(at, 4) else {
                continue;
            };
            let (number, sector_id) = (h[1], h[2]);
            let header_ok = h[3] == number.wrapping_add(sector_id) && !raw.any_weak(at, 4);
            let (cyl, side) = (number & 0x7F, number >> 7);
            if header_ok {
                if sector_id >= victor_zone(cyl) || header_track.is_some_and(|t| t != number) {
                    evidence.plausible = false;
                }
                header_track.get_or_insert(number);
            }

            let next = headers.get(n + 1).copied().unwrap_or(usize::MAX);
            let data_at = raw
                .markers_of(MarkKind::DataAddress)
                .map(|m| m.offset)
                .find(|&o| o > at && o < next);
            let id = SectorId::new(cyl, side, sector_id, 2);
            let mut sector = match data_at.and_then(|o| raw.slice(o + 1, 514).map(|b| (o, b))) {
                Some((o, block)) => {
                    evidence.marks += 1;
                    let ok = data_sum(&block[..512]) == u16::from_le_bytes([block[512], block[513]]);
                    let mut s = Sector::with_data(id, block[..512].to_vec());
                    s.data_crc_ok = ok;
                    s.weak = !ok && raw.any_weak(o, 515);
                    s
                }
                None => {
                    let mut s = Sector::with_data(id, vec![0; 512]);
                    s.data_crc_ok = false;
                    s
                }
            };
            sector.header_crc_ok = header_ok;
            sector.bit_offset = raw.bit_offset(at);
            if header_ok && sector.data_crc_ok {
                evidence.good += 1;
            }
            evidence.sectors += 1;
            track.insert_sector(sector);
        }
        evidence.expected = victor_zone(header_track.map(|t| t & 0x7F).unwrap_or(cylinder)) as usize;
        if evidence.sectors == 0 {
            evidence.plausible = false;
        }
        finish(&mut track, self, raw, evidence);
        track
    }

    fn encode(&self, track: &Track) -> Result<RawTrack> {
        let number = (track.cylinder & 0x7F) | (track.head << 7);
        let mut raw = RawTrack::new(Encoding::GcrVictor);
        for sector in track.sectors_by_id() {
            if sector.data().len() != 512 {
                return Err(FloppyError::invalid_arg(format!(
                    "Victor sector {} holds {} bytes",
                    sector.id.sector,
                    sector.data().len()
                )));
            }
            let mut check = number.wrapping_add(sector.id.sector);
            if !sector.header_crc_ok {
                check ^= 0xFF;
            }
            raw.mark(MarkKind::IdAddress);
            raw.extend(&[HEADER_ID, number, sector.id.sector, check]);

            let mut sum = data_sum(sector.data());
            if !sector.data_crc_ok {
                sum ^= 0xFFFF;
            }
            raw.mark(MarkKind::DataAddress);
            raw.push(DATA_ID, 0, false);
            raw.extend(sector.data());
            raw.extend(&sum.to_le_bytes());
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::victor::VictorGcrCodec;
    use crate::encoding::EncodingCodec;

    #[test]
    fn test_zoned_round_trip() {
        for cylinder in [0u8, 40, 79] {
            let mut original = Track::new(cylinder, 0);
            for s in 0..victor_zone(cylinder) {
                original.add_sector(Sector::with_data(SectorId::new(cylinder, 0, s, 2), vec![s ^ cylinder; 512]));
            }
            let raw = VictorDriver.encode(&original).unwrap();
            let bits = VictorGcrCodec.encode(&raw, 2000.0);
            let track = VictorDriver.decode(&VictorGcrCodec.decode(&bits), cylinder, 0);
            assert_eq!(track.sector_count(), victor_zone(cylinder) as usize);
            assert_eq!(track.confidence, 100, "cylinder {}", cylinder);
        }
    }

    #[test]
    fn test_sum_is_sixteen_bit() {
        assert_eq!(data_sum(&[0xFF; 512]), (0xFFu32 * 512) as u16);
    }
}
