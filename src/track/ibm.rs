//! IBM System/34 (MFM) and System/3740 (FM) sector layout
//!
//! Every sector is an ID field `FE C H R N crc` followed by a data field
//! `FB|F8 <128 << N bytes> crc`. MFM fields are preceded by three A1 sync
//! bytes which are included in the CRC. Most 8-bit and 16-bit machines
//! use this layout and differ only in geometry and sector numbering.

use crate::disk::{Sector, SectorId, Track};
use crate::encoding::crc::{crc16, crc16_update};
use crate::encoding::{Encoding, MarkKind, RawTrack};
use crate::error::{FloppyError, Result};
use crate::fdc::{FdcStatus1, FdcStatus2};
use crate::profile::Platform;
use crate::track::{finish, Evidence, TrackDriver};

/// Farthest a data mark may follow its ID field, in bytes
const DATA_MARK_WINDOW: usize = 64;

/// Profile-driven IBM-style driver
#[derive(Debug, Clone, Copy)]
pub struct IbmDriver {
    name: &'static str,
    platform: Platform,
    encoding: Encoding,
    sectors: u8,
    size_code: Option<u8>,
    first_id: u8,
    gap3: u8,
}

impl IbmDriver {
    /// Create a driver for a platform's layout
    pub const fn new(
        name: &'static str,
        platform: Platform,
        encoding: Encoding,
        sectors: u8,
        size_code: Option<u8>,
        first_id: u8,
        gap3: u8,
    ) -> Self {
        Self {
            name,
            platform,
            encoding,
            sectors,
            size_code,
            first_id,
            gap3,
        }
    }

    fn sync_prefix(&self) -> u16 {
        match self.encoding {
            Encoding::Mfm => crc16(&[0xA1, 0xA1, 0xA1]),
            _ => crc16(&[]),
        }
    }

    fn id_plausible(&self, id: &SectorId) -> bool {
        let size_ok = self.size_code.map(|n| n == id.size_code).unwrap_or(id.size_code <= 6);
        let range_ok = self.sectors == 0
            || (id.sector >= self.first_id && id.sector < self.first_id.saturating_add(self.sectors));
        size_ok && range_ok
    }

    fn data_mark_after(raw: &RawTrack, from: usize, limit: usize) -> Option<(usize, bool)> {
        raw.markers
            .iter()
            .filter(|m| m.offset >= from && m.offset < limit)
            .find_map(|m| match m.kind {
                MarkKind::DataAddress => Some((m.offset, false)),
                MarkKind::DeletedData => Some((m.offset, true)),
                _ => None,
            })
    }
}

/// Every IBM-layout variant, generic ones first
pub fn variants() -> Vec<IbmDriver> {
    use Encoding::{Fm, Mfm};
    use Platform::*;
    vec![
        IbmDriver::new("ibm-mfm", Pc, Mfm, 0, None, 1, 0x54),
        IbmDriver::new("ibm-fm", Unknown, Fm, 0, None, 1, 0x1B),
        IbmDriver::new("atari-st", AtariSt, Mfm, 9, Some(2), 1, 0x28),
        IbmDriver::new("atari8", Atari8, Fm, 18, Some(0), 1, 0x11),
        IbmDriver::new("bbc", Bbc, Fm, 10, Some(1), 0, 0x15),
        IbmDriver::new("trs80", Trs80, Fm, 10, Some(1), 0, 0x0B),
        IbmDriver::new("cpc", AmstradCpc, Mfm, 9, Some(2), 0xC1, 0x52),
        IbmDriver::new("msx", Msx, Mfm, 9, Some(2), 1, 0x54),
        IbmDriver::new("spectrum", Spectrum, Mfm, 9, Some(2), 1, 0x52),
        IbmDriver::new("sam", SamCoupe, Mfm, 10, Some(2), 1, 0x18),
        IbmDriver::new("pc98", Pc98, Mfm, 8, Some(3), 1, 0x74),
        IbmDriver::new("x68000", X68000, Mfm, 8, Some(3), 1, 0x74),
        IbmDriver::new("fm-towns", FmTowns, Mfm, 8, Some(3), 1, 0x74),
        IbmDriver::new("thomson", Thomson, Mfm, 16, Some(1), 1, 0x36),
        IbmDriver::new("oric", Oric, Mfm, 17, Some(1), 1, 0x1C),
        IbmDriver::new("kaypro", Kaypro, Mfm, 10, Some(2), 0, 0x1B),
        IbmDriver::new("osborne", Osborne, Fm, 10, Some(1), 1, 0x1B),
        IbmDriver::new("qx10", Qx10, Mfm, 16, Some(1), 1, 0x1B),
    ]
}

impl TrackDriver for IbmDriver {
    fn name(&self) -> &'static str {
        self.name
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    fn encoding(&self) -> Encoding {
        self.encoding
    }

    fn decode(&self, raw: &RawTrack, cylinder: u8, head: u8) -> Track {
        let mut track = Track::new(cylinder, head);
        track.gap3_length = self.gap3;
        let mut evidence = Evidence {
            expected: self.sectors as usize,
            plausible: true,
            ..Evidence::default()
        };
        if raw.encoding != self.encoding {
            finish(&mut track, self, raw, evidence);
            return track;
        }
        let prefix = self.sync_prefix();
        let ids: Vec<usize> = raw.markers_of(MarkKind::IdAddress).map(|m| m.offset).collect();
        let mut header_cylinder: Option<u8> = None;

        for (n, &at) in ids.iter().enumerate() {
            evidence.marks += 1;
            let Some(header) = raw.slice(at, 7) else {
                continue;
            };
            let id = SectorId::new(header[1], header[2], header[3], header[4]);
            let stored = u16::from_be_bytes([header[5], header[6]]);
            let header_ok = crc16_update(prefix, &header[..5]) == stored;
            if header_ok {
                if !self.id_plausible(&id) || header_cylinder.is_some_and(|c| c != id.cylinder) {
                    evidence.plausible = false;
                }
                header_cylinder.get_or_insert(id.cylinder);
            }

            let next_id = ids.get(n + 1).copied().unwrap_or(usize::MAX);
            let limit = (at + 7 + DATA_MARK_WINDOW).min(next_id);
            let mut sector = match Self::data_mark_after(raw, at + 7, limit) {
                Some((data_at, deleted)) => {
                    evidence.marks += 1;
                    let len = 128usize << id.size_code.min(8);
                    let available = raw.len().saturating_sub(data_at + 1);
                    let body = &raw.bytes[data_at + 1..data_at + 1 + len.min(available)];
                    let data_ok = match raw.slice(data_at + 1 + len, 2) {
                        Some(crc) if body.len() == len => {
                            crc16_update(prefix, &raw.bytes[data_at..data_at + 1 + len])
                                == u16::from_be_bytes([crc[0], crc[1]])
                        }
                        _ => false,
                    };
                    let mut data = body.to_vec();
                    data.resize(len, 0);
                    let mut sector = Sector::with_data(id, data);
                    sector.data_crc_ok = data_ok;
                    sector.deleted = deleted;
                    sector.weak = !data_ok && raw.any_weak(data_at, len + 3);
                    let mut st1 = 0;
                    let mut st2 = 0;
                    if !data_ok {
                        st1 |= FdcStatus1::DE;
                        st2 |= FdcStatus2::DD;
                    }
                    if deleted {
                        st2 |= FdcStatus2::CM;
                    }
                    sector.fdc_status1 = FdcStatus1::new(st1);
                    sector.fdc_status2 = FdcStatus2::new(st2);
                    sector
                }
                None => {
                    let mut sector = Sector::with_data(id, Vec::new());
                    sector.data_crc_ok = false;
                    sector.fdc_status1 = FdcStatus1::new(FdcStatus1::ND);
                    sector.fdc_status2 = FdcStatus2::new(FdcStatus2::MD);
                    sector
                }
            };
            sector.header_crc_ok = header_ok;
            if !header_ok {
                sector.fdc_status1 = FdcStatus1::new(sector.fdc_status1.0 | FdcStatus1::DE);
            }
            sector.bit_offset = raw.bit_offset(at);
            if header_ok && sector.data_crc_ok {
                evidence.good += 1;
            }
            evidence.sectors += 1;
            track.insert_sector(sector);
        }
        if evidence.sectors == 0 {
            evidence.plausible = false;
        }
        finish(&mut track, self, raw, evidence);
        track
    }

    fn encode(&self, track: &Track) -> Result<RawTrack> {
        let mfm = match self.encoding {
            Encoding::Mfm => true,
            Encoding::Fm => false,
            other => {
                return Err(FloppyError::unsupported(format!("IBM layout over {}", other)));
            }
        };
        let (gap_byte, sync_len) = if mfm { (0x4E, 12) } else { (0xFF, 6) };
        let prefix = self.sync_prefix();
        let mut raw = RawTrack::new(self.encoding);

        raw.fill(gap_byte, if mfm { 80 } else { 40 });
        raw.fill(0x00, sync_len);
        if mfm {
            for _ in 0..3 {
                raw.mark(MarkKind::Sync);
                raw.push(0xC2, 0, false);
            }
        }
        raw.mark(MarkKind::IndexAddress);
        raw.push(0xFC, 0, false);
        raw.fill(gap_byte, if mfm { 50 } else { 26 });

        let sync = |raw: &mut RawTrack| {
            raw.fill(0x00, sync_len);
            if mfm {
                for _ in 0..3 {
                    raw.mark(MarkKind::Sync);
                    raw.push(0xA1, 0, false);
                }
            }
        };

        for sector in track.sectors() {
            sync(&mut raw);
            raw.mark(MarkKind::IdAddress);
            let header = [0xFE, sector.id.cylinder, sector.id.head, sector.id.sector, sector.id.size_code];
            raw.extend(&header);
            let mut crc = crc16_update(prefix, &header);
            if !sector.header_crc_ok {
                crc ^= 0xFFFF;
            }
            raw.extend(&crc.to_be_bytes());
            raw.fill(gap_byte, if mfm { 22 } else { 11 });
            if sector.data().is_empty() {
                continue;
            }

            sync(&mut raw);
            let (mark, kind) = if sector.is_deleted() {
                (0xF8, MarkKind::DeletedData)
            } else {
                (0xFB, MarkKind::DataAddress)
            };
            raw.mark(kind);
            raw.push(mark, 0, false);
            raw.extend(sector.data());
            let mut crc = crc16_update(crc16_update(prefix, &[mark]), sector.data());
            if !sector.data_crc_ok {
                crc ^= 0xFFFF;
            }
            raw.extend(&crc.to_be_bytes());
            raw.fill(gap_byte, track.gap3_length.max(1) as usize);
        }
        raw.fill(gap_byte, 128);
        Ok(raw)
    }
}
