//! Amiga trackdisk layout: 11 (DD) or 22 (HD) 540-byte records per track
//!
//! Record: info `FF track sector sectors-to-gap`, 16 label bytes, header
//! checksum, data checksum, 512 data bytes. The track number is
//! `cylinder * 2 + head`.

use crate::disk::{Sector, SectorId, Track};
use crate::encoding::amiga::{checksum, DATA_CHECKSUM_OFFSET, DATA_OFFSET, HEADER_CHECKSUM_OFFSET, RECORD_LEN};
use crate::encoding::{Encoding, MarkKind, RawTrack};
use crate::error::{FloppyError, Result};
use crate::profile::Platform;
use crate::track::{finish, Evidence, TrackDriver};

/// Amiga trackdisk driver
#[derive(Debug, Clone, Copy, Default)]
pub struct AmigaDriver;

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

impl TrackDriver for AmigaDriver {
    fn name(&self) -> &'static str {
        "amiga"
    }

    fn platform(&self) -> Platform {
        Platform::Amiga
    }

    fn encoding(&self) -> Encoding {
        Encoding::AmigaMfm
    }

    fn decode(&self, raw: &RawTrack, cylinder: u8, head: u8) -> Track {
        let mut track = Track::new(cylinder, head);
        track.filler_byte = 0;
        let mut evidence = Evidence {
            expected: 11,
            plausible: true,
            ..Evidence::default()
        };
        if raw.encoding != Encoding::AmigaMfm {
            finish(&mut track, self, raw, Evidence::default());
            return track;
        }
        let mut track_number: Option<u8> = None;
        let mut highest = 0u8;
        for marker in raw.markers_of(MarkKind::IdAddress) {
            evidence.marks += 1;
            let Some(record) = raw.slice(marker.offset, RECORD_LEN) else {
                continue;
            };
            let header_ok = checksum(&record[..HEADER_CHECKSUM_OFFSET])
                == be32(&record[HEADER_CHECKSUM_OFFSET..]);
            let data_ok = checksum(&record[DATA_OFFSET..]) == be32(&record[DATA_CHECKSUM_OFFSET..]);
            let (format, number, sector_id) = (record[0], record[1], record[2]);
            if header_ok {
                if format != 0xFF || sector_id >= 22 || track_number.is_some_and(|t| t != number) {
                    evidence.plausible = false;
                }
                track_number.get_or_insert(number);
                highest = highest.max(sector_id);
            }

            let id = SectorId::new(number / 2, number % 2, sector_id, 2);
            let mut sector = Sector::with_data(id, record[DATA_OFFSET..].to_vec());
            sector.header_crc_ok = header_ok;
            sector.data_crc_ok = data_ok;
            sector.weak = !data_ok && raw.any_weak(marker.offset + DATA_OFFSET, 512);
            sector.tags = record[4..HEADER_CHECKSUM_OFFSET].to_vec();
            sector.bit_offset = raw.bit_offset(marker.offset);
            if header_ok && data_ok {
                evidence.good += 1;
            }
            evidence.sectors += 1;
            track.insert_sector(sector);
        }
        if highest >= 11 {
            evidence.expected = 22;
        }
        if evidence.sectors == 0 {
            evidence.plausible = false;
        }
        finish(&mut track, self, raw, evidence);
        track
    }

    fn encode(&self, track: &Track) -> Result<RawTrack> {
        let sectors = track.sectors_by_id();
        let count = sectors.len();
        let mut raw = RawTrack::new(Encoding::AmigaMfm);
        raw.fill(0x00, 8);
        for (i, sector) in sectors.into_iter().enumerate() {
            if sector.data().len() != 512 {
                return Err(FloppyError::invalid_arg(format!(
                    "Amiga sector {} holds {} bytes",
                    sector.id.sector,
                    sector.data().len()
                )));
            }
            let mut record = vec![0u8; RECORD_LEN];
            record[..4].copy_from_slice(&[
                0xFF,
                track.cylinder * 2 + track.head,
                sector.id.sector,
                (count - i) as u8,
            ]);
            let label_len = sector.tags.len().min(16);
            record[4..4 + label_len].copy_from_slice(&sector.tags[..label_len]);
            record[DATA_OFFSET..].copy_from_slice(sector.data());
            let mut header = checksum(&record[..HEADER_CHECKSUM_OFFSET]);
            if !sector.header_crc_ok {
                header ^= 0x5555_5555;
            }
            let mut data = checksum(&record[DATA_OFFSET..]);
            if !sector.data_crc_ok {
                data ^= 0x5555_5555;
            }
            record[HEADER_CHECKSUM_OFFSET..DATA_CHECKSUM_OFFSET].copy_from_slice(&header.to_be_bytes());
            record[DATA_CHECKSUM_OFFSET..DATA_OFFSET].copy_from_slice(&data.to_be_bytes());
            raw.mark(MarkKind::IdAddress);
            raw.extend(&record);
        }
        raw.fill(0x00, 320);
        Ok(raw)
    }
}
