//! uPD765-style controller status registers and the per-sector status
//! codes other containers store (D64 error bytes, IMD record types).
//!
//! The sector model keeps plain CRC flags; these helpers translate those
//! flags to and from the encodings each container uses on disk.

use crate::disk::Sector;
use std::fmt;

/// FDC Status Register 1 (ST1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FdcStatus1(pub u8);

impl FdcStatus1 {
    /// End of cylinder
    pub const EN: u8 = 0x80;
    /// CRC error in the ID or data field
    pub const DE: u8 = 0x20;
    /// Overrun
    pub const OR: u8 = 0x10;
    /// No data: sector id not found
    pub const ND: u8 = 0x04;
    /// Not writable
    pub const NW: u8 = 0x02;
    /// Missing ID address mark
    pub const MA: u8 = 0x01;

    const NAMES: [(u8, &'static str); 6] = [
        (Self::EN, "EN"),
        (Self::DE, "DE"),
        (Self::OR, "OR"),
        (Self::ND, "ND"),
        (Self::NW, "NW"),
        (Self::MA, "MA"),
    ];

    /// Wrap a raw register value
    #[inline]
    pub fn new(value: u8) -> Self {
        FdcStatus1(value)
    }

    /// End of cylinder bit
    #[inline]
    pub fn end_of_cylinder(&self) -> bool {
        self.0 & Self::EN != 0
    }

    /// CRC error bit
    #[inline]
    pub fn data_error(&self) -> bool {
        self.0 & Self::DE != 0
    }

    /// Sector id not found
    #[inline]
    pub fn no_data(&self) -> bool {
        self.0 & Self::ND != 0
    }

    /// ID address mark missing
    #[inline]
    pub fn missing_address_mark(&self) -> bool {
        self.0 & Self::MA != 0
    }

    /// Any bit set
    #[inline]
    pub fn has_error(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for FdcStatus1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_flags(f, self.0, &Self::NAMES)
    }
}

/// FDC Status Register 2 (ST2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FdcStatus2(pub u8);

impl FdcStatus2 {
    /// Control mark: deleted data address mark seen
    pub const CM: u8 = 0x40;
    /// CRC error in the data field
    pub const DD: u8 = 0x20;
    /// Wrong cylinder in the ID field
    pub const WC: u8 = 0x10;
    /// Bad cylinder (0xFF) in the ID field
    pub const BC: u8 = 0x02;
    /// Missing data address mark
    pub const MD: u8 = 0x01;

    const NAMES: [(u8, &'static str); 5] = [
        (Self::CM, "CM"),
        (Self::DD, "DD"),
        (Self::WC, "WC"),
        (Self::BC, "BC"),
        (Self::MD, "MD"),
    ];

    /// Wrap a raw register value
    #[inline]
    pub fn new(value: u8) -> Self {
        FdcStatus2(value)
    }

    /// Deleted data mark
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.0 & Self::CM != 0
    }

    /// CRC error in the data field
    #[inline]
    pub fn data_field_error(&self) -> bool {
        self.0 & Self::DD != 0
    }

    /// Data address mark missing
    #[inline]
    pub fn missing_data_mark(&self) -> bool {
        self.0 & Self::MD != 0
    }

    /// Any error bit set; CM alone is not an error
    #[inline]
    pub fn has_error(&self) -> bool {
        self.0 & !Self::CM != 0
    }
}

impl fmt::Display for FdcStatus2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_flags(f, self.0, &Self::NAMES)
    }
}

fn write_flags(f: &mut fmt::Formatter<'_>, value: u8, names: &[(u8, &str)]) -> fmt::Result {
    if value == 0 {
        return write!(f, "OK");
    }
    let set: Vec<&str> = names
        .iter()
        .filter(|(bit, _)| value & bit != 0)
        .map(|&(_, name)| name)
        .collect();
    write!(f, "{}", set.join("|"))
}

/// Registers describing a sector's state, as a controller would have
/// reported it. Bits stored with the sector are preserved; the CRC and
/// deleted flags are folded in on top.
pub fn registers_for(sector: &Sector) -> (FdcStatus1, FdcStatus2) {
    let mut st1 = sector.fdc_status1.0;
    let mut st2 = sector.fdc_status2.0;
    if !sector.header_crc_ok || !sector.data_crc_ok {
        st1 |= FdcStatus1::DE;
    } else {
        st1 &= !FdcStatus1::DE;
    }
    if !sector.data_crc_ok {
        st2 |= FdcStatus2::DD;
    } else {
        st2 &= !FdcStatus2::DD;
    }
    if sector.deleted {
        st2 |= FdcStatus2::CM;
    }
    (FdcStatus1(st1), FdcStatus2(st2))
}

/// Header and data CRC flags encoded by a 1541 error table byte
pub fn d64_error_flags(code: u8) -> (bool, bool) {
    match code {
        0 | 1 => (true, true),
        5 => (true, false),
        9 | 0x0B => (false, true),
        2..=4 | 0x0F => (false, false),
        // 6 (no sync), 7, 8 and 0x0A are track or write faults; the payload is still suspect
        _ => (true, false),
    }
}

/// 1541 error table byte for a sector.
///
/// `previous` is the code stored when the image was loaded; it is kept
/// whenever it still agrees with the sector's CRC flags.
pub fn d64_error_code(sector: &Sector, previous: Option<u8>) -> u8 {
    let flags = (sector.header_crc_ok, sector.data_crc_ok);
    if let Some(code) = previous {
        if d64_error_flags(code) == flags {
            return code;
        }
    }
    match flags {
        (true, true) => 1,
        (true, false) => 5,
        (false, true) => 9,
        (false, false) => 2,
    }
}

/// ImageDisk sector record type for a sector. Type 0 (unavailable) is
/// chosen by the caller for sectors with no payload.
pub fn imd_record_type(sector: &Sector, compressed: bool) -> u8 {
    let base = match (sector.deleted, sector.data_crc_ok && sector.header_crc_ok) {
        (false, true) => 1,
        (true, true) => 3,
        (false, false) => 5,
        (true, false) => 7,
    };
    base + compressed as u8
}

/// Deleted and CRC-error flags of an ImageDisk record type
pub fn imd_record_flags(record: u8) -> (bool, bool) {
    let index = record.saturating_sub(1) / 2;
    (index & 1 != 0, index & 2 != 0)
}
