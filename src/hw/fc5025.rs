//! Device Side Data FC5025 5.25" reader
//!
//! The FC5025 decodes sectors in firmware and cannot capture flux or
//! write. Commands travel as 63-byte command wrappers (`CFBC`) and are
//! answered by an optional data phase and a status wrapper (`FCSB`).

use crate::error::{FloppyError, HardwareFault, Result};
use crate::flux::FluxStream;
use crate::hw::transport::{fault, Transport};
use crate::hw::{not_supported, Backend, Capabilities, Density, DeviceInfo, DriveStatus, FluxDevice, COMMAND_TIMEOUT};
use log::{debug, trace};
use std::path::Path;
use std::time::Duration;

/// Backend name
pub const NAME: &str = "fc5025";
/// USB vendor id
pub const VENDOR_ID: u16 = 0x16C0;
/// USB product id
pub const PRODUCT_ID: u16 = 0x06D6;

const CBW_SIGNATURE: &[u8; 4] = b"CFBC";
const CSW_SIGNATURE: &[u8; 4] = b"FCSB";
const CBW_LEN: usize = 63;
const CSW_LEN: usize = 12;

const OP_SEEK: u8 = 0xC0;
const OP_FLAGS: u8 = 0xC2;
const OP_DRIVE_STATUS: u8 = 0xC3;
const OP_READ_FLEXIBLE: u8 = 0xC6;

const SEEK_ABSOLUTE: u8 = 0;
const SEEK_RECALIBRATE: u8 = 3;
const STEP_RATE: u8 = 15;

const FLAG_SIDE: u8 = 0x01;
const FLAG_DENSITY: u8 = 0x04;

const SEEK_WAIT: Duration = Duration::from_millis(600);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Recording formats the firmware decodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Fc5025Format {
    /// Apple II 6-and-2
    AppleGcr = 1,
    /// Commodore 1541
    CommodoreGcr = 2,
    /// Single density
    Fm = 3,
    /// Double density
    Mfm = 4,
}

impl Fc5025Format {
    /// Usual sector size for the format
    pub fn sector_size(self) -> usize {
        match self {
            Fc5025Format::AppleGcr | Fc5025Format::CommodoreGcr | Fc5025Format::Fm => 256,
            Fc5025Format::Mfm => 512,
        }
    }
}

/// Build a command wrapper around a command block
pub fn command_wrapper(tag: u32, xfer_len: u32, cdb: &[u8]) -> Vec<u8> {
    let mut cbw = Vec::with_capacity(CBW_LEN);
    cbw.extend_from_slice(CBW_SIGNATURE);
    cbw.extend_from_slice(&tag.to_le_bytes());
    cbw.extend_from_slice(&xfer_len.to_le_bytes());
    cbw.extend_from_slice(&[0x80, 0, 0]);
    cbw.extend_from_slice(&cdb[..cdb.len().min(48)]);
    cbw.resize(CBW_LEN, 0);
    cbw
}

/// An opened FC5025
pub struct Fc5025Device<T: Transport> {
    transport: T,
    info: DeviceInfo,
    tag: u32,
    cylinder: u8,
    head: u8,
    format: Fc5025Format,
    bitcell_ns: u16,
}

impl<T: Transport> Fc5025Device<T> {
    /// Take over a transport and recalibrate the drive
    pub fn with_transport(transport: T, path: &str) -> Result<Self> {
        let mut dev = Self {
            transport,
            info: DeviceInfo {
                backend: NAME.into(),
                path: path.into(),
                name: "FC5025".into(),
                firmware: None,
                sample_rate: 0,
                capabilities: Capabilities(Capabilities::READ_SECTOR | Capabilities::DENSITY | Capabilities::DOUBLE_SIDED),
            },
            tag: 0,
            cylinder: 0,
            head: 0,
            format: Fc5025Format::Mfm,
            bitcell_ns: 2000,
        };
        dev.bulk(&[OP_SEEK, SEEK_RECALIBRATE, STEP_RATE, 100], 0, SEEK_WAIT)?;
        Ok(dev)
    }

    /// Choose the firmware decoder
    pub fn set_format(&mut self, format: Fc5025Format) {
        self.format = format;
    }

    fn bulk(&mut self, cdb: &[u8], xfer_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.tag = self.tag.wrapping_add(1);
        trace!("fc5025 cdb {:02X?} tag {}", cdb, self.tag);
        self.transport
            .send(&command_wrapper(self.tag, xfer_len as u32, cdb))
            .map_err(|e| fault(NAME, e))?;
        let data = if xfer_len > 0 {
            self.transport.recv(xfer_len, timeout).map_err(|e| fault(NAME, e))?
        } else {
            Vec::new()
        };
        let csw = self.transport.recv(CSW_LEN, COMMAND_TIMEOUT).map_err(|e| fault(NAME, e))?;
        if &csw[0..4] != CSW_SIGNATURE || csw[4..8] != self.tag.to_le_bytes() {
            return Err(FloppyError::hardware(NAME, HardwareFault::Io, 0, "bad status wrapper"));
        }
        if csw[8] != 0 {
            return Err(FloppyError::hardware(
                NAME,
                HardwareFault::Io,
                csw[8] as u32,
                format!("command {:#04x} failed, sense {:#04x}", cdb[0], csw[9]),
            ));
        }
        Ok(data)
    }
}

impl<T: Transport + 'static> FluxDevice for Fc5025Device<T> {
    fn backend(&self) -> &'static str {
        NAME
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn status(&mut self) -> Result<DriveStatus> {
        let status = self.bulk(&[OP_DRIVE_STATUS], 1, COMMAND_TIMEOUT)?;
        Ok(DriveStatus {
            ready: true,
            write_protected: true,
            disk_present: status[0] & 0x01 != 0,
            track0: self.cylinder == 0,
            motor_on: false,
        })
    }

    fn motor(&mut self, _on: bool) -> Result<()> {
        // the firmware spins the drive for each read
        Ok(())
    }

    fn seek(&mut self, cylinder: u8) -> Result<()> {
        self.bulk(&[OP_SEEK, SEEK_ABSOLUTE, STEP_RATE, cylinder], 0, SEEK_WAIT)?;
        self.cylinder = cylinder;
        Ok(())
    }

    fn select_head(&mut self, head: u8) -> Result<()> {
        self.head = head;
        Ok(())
    }

    fn select_density(&mut self, density: Density) -> Result<()> {
        let high = density != Density::Double;
        self.bulk(&[OP_FLAGS, FLAG_DENSITY, if high { FLAG_DENSITY } else { 0 }], 1, COMMAND_TIMEOUT)?;
        self.bitcell_ns = if high { 1000 } else { 2000 };
        Ok(())
    }

    fn read_flux(&mut self, _revolutions: u8) -> Result<FluxStream> {
        Err(not_supported(NAME, "flux capture"))
    }

    fn read_sector(&mut self, cylinder: u8, head: u8, sector: u8) -> Result<Vec<u8>> {
        if cylinder != self.cylinder {
            self.seek(cylinder)?;
        }
        self.head = head;
        let size = self.format.sector_size();
        let size_code = (size / 128).trailing_zeros() as u8;
        let bitcell = self.bitcell_ns.to_be_bytes();
        let cdb = [
            OP_READ_FLEXIBLE,
            if head != 0 { FLAG_SIDE } else { 0 },
            self.format as u8,
            bitcell[0],
            bitcell[1],
            0,
            0,
            0,
            cylinder,
            head,
            sector,
            size_code,
        ];
        let data = self.bulk(&cdb, size, READ_TIMEOUT)?;
        debug!("fc5025: read c{} h{} s{} ({} bytes)", cylinder, head, sector, data.len());
        Ok(data)
    }
}

/// Finds FC5025 units on the USB bus
#[derive(Debug, Clone, Copy, Default)]
pub struct Fc5025Backend;

fn sysfs_hex(dir: &Path, file: &str) -> Option<u16> {
    let text = std::fs::read_to_string(dir.join(file)).ok()?;
    u16::from_str_radix(text.trim(), 16).ok()
}

impl Backend for Fc5025Backend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Device Side Data FC5025 (sector reads only)"
    }

    fn enumerate(&self) -> Vec<DeviceInfo> {
        let Ok(entries) = std::fs::read_dir("/sys/bus/usb/devices") else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|dir| sysfs_hex(dir, "idVendor") == Some(VENDOR_ID) && sysfs_hex(dir, "idProduct") == Some(PRODUCT_ID))
            .map(|dir| DeviceInfo {
                backend: NAME.into(),
                path: dir.display().to_string(),
                name: "FC5025".into(),
                firmware: None,
                sample_rate: 0,
                capabilities: Capabilities(Capabilities::READ_SECTOR),
            })
            .collect()
    }

    fn open(&self, path: &str) -> Result<Box<dyn FluxDevice>> {
        // bulk endpoints need a raw USB transport, which this build lacks
        Err(FloppyError::hardware(
            NAME,
            HardwareFault::NotSupported,
            0,
            format!("{}: no raw USB transport available", path),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::hw::transport::Loopback;

    fn unit() -> Loopback {
        Loopback::new(|cbw| {
            assert_eq!(cbw.len(), CBW_LEN);
            assert_eq!(&cbw[0..4], CBW_SIGNATURE);
            let xfer = u32::from_le_bytes([cbw[8], cbw[9], cbw[10], cbw[11]]) as usize;
            let cdb = &cbw[15..];
            let mut reply = match cdb[0] {
                OP_READ_FLEXIBLE => vec![cdb[10]; xfer],
                _ => vec![1; xfer],
            };
            reply.extend_from_slice(CSW_SIGNATURE);
            reply.extend_from_slice(&cbw[4..8]);
            reply.extend_from_slice(&[0, 0, 0, 0]);
            reply
        })
    }

    #[test]
    fn test_wrapper_layout() {
        let cbw = command_wrapper(7, 512, &[OP_SEEK, 0, 15, 3]);
        assert_eq!(cbw.len(), 63);
        assert_eq!(&cbw[4..8], &[7, 0, 0, 0]);
        assert_eq!(&cbw[8..12], &[0, 2, 0, 0]);
        assert_eq!(cbw[12], 0x80);
        assert_eq!(&cbw[15..19], &[OP_SEEK, 0, 15, 3]);
    }

    #[test]
    fn test_sector_read() {
        let mut dev = Fc5025Device::with_transport(unit(), "loop").unwrap();
        dev.set_format(Fc5025Format::AppleGcr);
        let data = dev.read_sector(17, 0, 5).unwrap();
        assert_eq!(data, vec![5; 256]);
        assert_eq!(dev.cylinder, 17);
        assert!(dev.status().unwrap().disk_present);
    }

    #[test]
    fn test_no_flux_or_writes() {
        let mut dev = Fc5025Device::with_transport(unit(), "loop").unwrap();
        assert_eq!(dev.read_flux(1).unwrap_err().kind(), ErrorKind::Unsupported);
        assert!(dev.write_sector(0, 0, 1, &[0; 256]).is_err());
        assert!(!dev.capabilities().has(Capabilities::READ_FLUX));
    }

    #[test]
    fn test_failed_status() {
        let t = Loopback::new(|cbw| {
            let mut r = CSW_SIGNATURE.to_vec();
            r.extend_from_slice(&cbw[4..8]);
            r.extend_from_slice(&[1, 0x3A, 0, 0]);
            r
        });
        let err = Fc5025Device::with_transport(t, "loop").err().unwrap();
        assert!(matches!(err, FloppyError::Hardware { code: 1, .. }));
    }
}
