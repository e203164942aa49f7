//! A drive that plays back a [`Disk`] as flux
//!
//! Tracks are laid out by their track driver, encoded to bit cells and
//! turned into flux on demand. Writes land in a side table and are played
//! back on later reads, so a write-then-verify cycle round-trips. Faults
//! can be injected per track to exercise retry paths.

use crate::disk::{Disk, Geometry};
use crate::error::{FloppyError, HardwareFault, Result};
use crate::flux::{FluxStream, NS_PER_SEC};
use crate::hw::{
    check_revolutions, Backend, Capabilities, Density, DeviceInfo, DriveStatus, FluxDevice,
};
use crate::image::{self, track_bits, ParseOptions};
use crate::pll::Bitstream;
use crate::profile::{cell_ns_for, PlatformProfile};
use crate::track::driver_for_track;
use log::{debug, trace};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Backend name
pub const NAME: &str = "mock";

/// Highest cylinder the virtual drive can reach
pub const MAX_CYLINDER: u8 = 83;

/// A virtual drive with a disk inserted
#[derive(Debug)]
pub struct MockDevice {
    disk: Disk,
    profile: Option<&'static PlatformProfile>,
    info: DeviceInfo,
    cylinder: u8,
    head: u8,
    density: Density,
    motor_on: bool,
    write_protected: bool,
    speed_trim: i8,
    bits: HashMap<(u8, u8), Bitstream>,
    written: BTreeMap<(u8, u8), FluxStream>,
    faults: HashMap<(u8, u8), u32>,
    reads: u32,
}

impl MockDevice {
    /// Insert a disk
    pub fn new(disk: Disk) -> Self {
        Self {
            disk,
            profile: None,
            info: DeviceInfo {
                backend: NAME.into(),
                path: "mock".into(),
                name: "Virtual drive".into(),
                firmware: Some(env!("CARGO_PKG_VERSION").into()),
                sample_rate: NS_PER_SEC as u32,
                capabilities: Capabilities(
                    Capabilities::READ_FLUX
                        | Capabilities::WRITE_FLUX
                        | Capabilities::DENSITY
                        | Capabilities::SPEED
                        | Capabilities::DOUBLE_SIDED,
                ),
            },
            cylinder: 0,
            head: 0,
            density: Density::Double,
            motor_on: false,
            write_protected: false,
            speed_trim: 0,
            bits: HashMap::new(),
            written: BTreeMap::new(),
            faults: HashMap::new(),
            reads: 0,
        }
    }

    /// Lay tracks out the way a platform would
    pub fn with_profile(mut self, profile: Option<&'static PlatformProfile>) -> Self {
        self.profile = profile;
        self.bits.clear();
        self
    }

    /// Set or clear the write-protect tab
    pub fn set_write_protected(&mut self, on: bool) {
        self.write_protected = on;
    }

    /// Garble the next `reads` captures of one track
    pub fn inject_fault(&mut self, cylinder: u8, head: u8, reads: u32) {
        self.faults.insert((cylinder, head), reads);
    }

    /// Flux written to a track, if any
    pub fn written(&self, cylinder: u8, head: u8) -> Option<&FluxStream> {
        self.written.get(&(cylinder, head))
    }

    /// Captures served so far
    pub fn read_count(&self) -> u32 {
        self.reads
    }

    /// Current density select
    pub fn density(&self) -> Density {
        self.density
    }

    /// Last speed trim requested
    pub fn speed_trim(&self) -> i8 {
        self.speed_trim
    }

    fn track_bits(&mut self) -> Result<Option<&Bitstream>> {
        let key = (self.cylinder, self.head);
        if !self.bits.contains_key(&key) {
            let Some(track) = self.disk.track(key.0, key.1) else {
                return Ok(None);
            };
            if track.is_empty() && track.bitstream.is_none() {
                return Ok(None);
            }
            let driver = driver_for_track(track, self.disk.encoding, self.profile)?;
            let cell = cell_ns_for(driver.encoding(), key.0, self.profile);
            let bits = track_bits(track, driver, cell)?;
            trace!("mock: c{} h{} laid out as {} cells", key.0, key.1, bits.len());
            self.bits.insert(key, bits);
        }
        Ok(self.bits.get(&key))
    }

    fn rotation_ns(&self) -> u64 {
        60 * NS_PER_SEC / self.disk.geometry.rpm.max(1) as u64
    }
}

/// Unformatted media: long gaps with no regular clock
fn noise(rotation_ns: u64, revolutions: u8) -> FluxStream {
    let mut stream = FluxStream::new(NS_PER_SEC as u32);
    let mut seed = 0x2545_F491u32;
    for _ in 0..revolutions {
        stream.push_index();
        let mut t = 0u64;
        while t < rotation_ns {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let d = 9_000 + seed % 40_000;
            stream.push_interval(d);
            t += d as u64;
        }
    }
    stream.push_index();
    stream
}

fn repeat(one: &FluxStream, revolutions: u8) -> FluxStream {
    let mut stream = FluxStream::new(NS_PER_SEC as u32);
    for _ in 0..revolutions {
        stream.push_index();
        for &d in one.intervals() {
            stream.push_interval(d);
        }
    }
    stream.push_index();
    stream
}

/// Knock every cell off its clock so nothing decodes
fn garble(flux: &FluxStream) -> FluxStream {
    let mut stream = FluxStream::new(NS_PER_SEC as u32);
    let mut marks = flux.index_marks().iter().peekable();
    for (i, &d) in flux.intervals().iter().enumerate() {
        while marks.next_if(|&&m| m <= i).is_some() {
            stream.push_index();
        }
        stream.push_interval(d + d / 3 + (i as u32 % 7) * 150);
    }
    for _ in marks {
        stream.push_index();
    }
    stream
}

impl FluxDevice for MockDevice {
    fn backend(&self) -> &'static str {
        NAME
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn status(&mut self) -> Result<DriveStatus> {
        Ok(DriveStatus {
            ready: true,
            write_protected: self.write_protected,
            disk_present: true,
            track0: self.cylinder == 0,
            motor_on: self.motor_on,
        })
    }

    fn motor(&mut self, on: bool) -> Result<()> {
        self.motor_on = on;
        Ok(())
    }

    fn seek(&mut self, cylinder: u8) -> Result<()> {
        if cylinder > MAX_CYLINDER {
            return Err(FloppyError::hardware(
                NAME,
                HardwareFault::SeekError,
                cylinder as u32,
                format!("cylinder {} past the end stop", cylinder),
            ));
        }
        self.cylinder = cylinder;
        Ok(())
    }

    fn select_head(&mut self, head: u8) -> Result<()> {
        if head > 1 {
            return Err(FloppyError::invalid_arg(format!("head {} out of range", head)));
        }
        self.head = head;
        Ok(())
    }

    fn select_density(&mut self, density: Density) -> Result<()> {
        self.density = density;
        Ok(())
    }

    fn read_flux(&mut self, revolutions: u8) -> Result<FluxStream> {
        let revolutions = check_revolutions(NAME, revolutions)?;
        if !self.motor_on {
            return Err(FloppyError::hardware(NAME, HardwareFault::NoIndex, 0, "motor is off"));
        }
        self.reads += 1;
        let key = (self.cylinder, self.head);
        let rotation = self.rotation_ns();
        let flux = if let Some(written) = self.written.get(&key) {
            repeat(written, revolutions)
        } else {
            match self.track_bits()? {
                Some(bits) => repeat(&bits.to_flux(), revolutions),
                None => noise(rotation, revolutions),
            }
        };
        match self.faults.get_mut(&key) {
            Some(left) if *left > 0 => {
                *left -= 1;
                debug!("mock: garbling c{} h{} ({} more)", key.0, key.1, left);
                Ok(garble(&flux))
            }
            _ => Ok(flux),
        }
    }

    fn write_flux(&mut self, flux: &FluxStream) -> Result<()> {
        if self.write_protected {
            return Err(FloppyError::hardware(NAME, HardwareFault::WriteProtected, 0, "disk is write protected"));
        }
        if !self.motor_on {
            return Err(FloppyError::hardware(NAME, HardwareFault::NoIndex, 0, "motor is off"));
        }
        let one = flux.revolution_stream(0).unwrap_or_else(|| flux.clone());
        self.written.insert((self.cylinder, self.head), one);
        Ok(())
    }

    fn set_speed_trim(&mut self, percent: i8) -> Result<()> {
        if !(-10..=10).contains(&percent) {
            return Err(FloppyError::invalid_arg(format!("speed trim {}% out of range", percent)));
        }
        self.speed_trim = percent;
        Ok(())
    }
}

/// Serves an image file, or a blank disk, as a virtual drive
#[derive(Debug, Clone, Copy, Default)]
pub struct MockBackend;

impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Virtual drive backed by an image file"
    }

    fn enumerate(&self) -> Vec<DeviceInfo> {
        vec![MockDevice::new(Disk::new(Geometry::new(80, 2, 9, 512))).info]
    }

    fn open(&self, path: &str) -> Result<Box<dyn FluxDevice>> {
        if path.is_empty() || path == NAME || path == "blank" {
            return Ok(Box::new(MockDevice::new(Disk::builder().build()?)));
        }
        let image = image::open(Path::new(path), None, &ParseOptions::default())?;
        let mut dev = MockDevice::new(image.disk).with_profile(image.profile);
        dev.info.path = path.into();
        Ok(Box::new(dev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::pll::recover;
    use crate::track::decode_bits;

    fn spun(disk: Disk) -> MockDevice {
        let mut dev = MockDevice::new(disk);
        dev.motor(true).unwrap();
        dev
    }

    #[test]
    fn test_flux_decodes_back() {
        let mut disk = Disk::builder().build().unwrap();
        disk.write_sector(2, 1, 4, &[0x5A; 512]).unwrap();
        let mut dev = spun(disk);
        dev.seek(2).unwrap();
        dev.select_head(1).unwrap();
        let flux = dev.read_flux(2).unwrap();
        assert_eq!(flux.revolution_count(), 2);
        let rev = flux.revolution_stream(0).unwrap();
        let bits = recover(&rev, crate::encoding::Encoding::Mfm, 2000.0);
        let track = decode_bits(&bits, 2, 1, None);
        assert_eq!(track.good_sectors(), 9);
        assert_eq!(track.get_sector(4).unwrap().data(), &[0x5A; 512][..]);
    }

    #[test]
    fn test_write_then_read_back() {
        let mut dev = spun(Disk::builder().build().unwrap());
        let flux = FluxStream::from_intervals(vec![4000; 50_000], &[0, 50_000]);
        dev.write_flux(&flux).unwrap();
        let back = dev.read_flux(3).unwrap();
        assert_eq!(back.revolution_count(), 3);
        assert_eq!(back.revolution(2).unwrap().len(), 50_000);
        dev.set_write_protected(true);
        assert_eq!(dev.write_flux(&flux).unwrap_err().kind(), ErrorKind::Permission);
    }

    #[test]
    fn test_faults_and_limits() {
        let mut dev = spun(Disk::builder().build().unwrap());
        dev.inject_fault(0, 0, 1);
        let bad = dev.read_flux(1).unwrap();
        let good = dev.read_flux(1).unwrap();
        assert_ne!(bad.intervals(), good.intervals());
        assert_eq!(dev.read_count(), 2);
        assert!(dev.seek(90).is_err());
        assert!(dev.read_flux(0).is_err());
        assert!(dev.set_speed_trim(3).is_ok());
        dev.motor(false).unwrap();
        assert_eq!(dev.read_flux(1).unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_unformatted_is_noise() {
        let mut dev = spun(Disk::new(Geometry::new(80, 2, 0, 512)));
        let flux = dev.read_flux(1).unwrap();
        assert_eq!(flux.revolution_count(), 1);
        assert!(flux.intervals().iter().all(|&d| d >= 9_000));
    }
}
