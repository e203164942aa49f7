//! KryoFlux board driven through the DTC command-line tool
//!
//! DTC owns the USB protocol; each capture runs it for a single track
//! into a scratch directory and parses the stream file it leaves.

use crate::error::{FloppyError, HardwareFault, Result};
use crate::flux::{kryoflux as stream, FluxStream};
use crate::hw::{
    check_revolutions, find_tool, run_tool, scratch_dir, Backend, Capabilities, Density, DeviceInfo, DriveStatus,
    FluxDevice,
};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Backend name
pub const NAME: &str = "kryoflux";

/// Device tracking only the head position; DTC does the rest
#[derive(Debug)]
pub struct KryofluxDevice {
    tool: PathBuf,
    info: DeviceInfo,
    cylinder: u8,
    head: u8,
    double_step: bool,
    motor_on: bool,
}

impl KryofluxDevice {
    /// Drive a board through `tool`
    pub fn new(tool: PathBuf) -> Self {
        Self {
            info: DeviceInfo {
                backend: NAME.into(),
                path: tool.display().to_string(),
                name: "KryoFlux (DTC)".into(),
                firmware: None,
                sample_rate: stream::SAMPLE_CLOCK as u32,
                capabilities: Capabilities(
                    Capabilities::READ_FLUX | Capabilities::WRITE_FLUX | Capabilities::DOUBLE_SIDED,
                ),
            },
            tool,
            cylinder: 0,
            head: 0,
            double_step: false,
            motor_on: false,
        }
    }

    /// Step twice per cylinder, for 48 tpi media in a 96 tpi drive
    pub fn set_double_step(&mut self, on: bool) {
        self.double_step = on;
    }

    /// DTC arguments addressing the current track under `prefix`
    pub fn track_args(&self, prefix: &Path) -> Vec<String> {
        let mut args = vec![
            format!("-f{}", prefix.display()),
            "-i0".to_string(),
            format!("-s{}", self.cylinder),
            format!("-e{}", self.cylinder),
            format!("-g{}", self.head),
        ];
        if self.double_step {
            args.push("-k2".into());
        }
        args
    }
}

impl FluxDevice for KryofluxDevice {
    fn backend(&self) -> &'static str {
        NAME
    }

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn status(&mut self) -> Result<DriveStatus> {
        Ok(DriveStatus {
            ready: true,
            write_protected: false,
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

    fn select_density(&mut self, _density: Density) -> Result<()> {
        // DTC drives the density line from the stream clock
        Ok(())
    }

    fn read_flux(&mut self, revolutions: u8) -> Result<FluxStream> {
        let revolutions = check_revolutions(NAME, revolutions)?;
        let dir = scratch_dir(NAME)?;
        let mut args = self.track_args(&dir.join("track"));
        args.push(format!("-r{}", revolutions));
        let result = run_tool(NAME, Command::new(&self.tool).args(&args)).and_then(|()| {
            let file = dir.join(stream::track_file_name(self.cylinder, self.head));
            let data = std::fs::read(&file).map_err(|e| {
                FloppyError::hardware(NAME, HardwareFault::Io, 0, format!("{}: {}", file.display(), e))
            })?;
            let (flux, warnings) = stream::parse(&data, false)?;
            for w in warnings {
                warn!("kryoflux c{} h{}: {}", self.cylinder, self.head, w);
            }
            Ok(flux)
        });
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            debug!("kryoflux: leaving {}: {}", dir.display(), e);
        }
        let flux = result?;
        if flux.revolution_count() == 0 {
            return Err(FloppyError::hardware(NAME, HardwareFault::NoIndex, 0, "capture has no index marks"));
        }
        Ok(flux)
    }

    fn write_flux(&mut self, flux: &FluxStream) -> Result<()> {
        let dir = scratch_dir(NAME)?;
        std::fs::write(dir.join(stream::track_file_name(self.cylinder, self.head)), stream::serialize(flux))?;
        let mut args = self.track_args(&dir.join("track"));
        args.push("-w".into());
        let result = run_tool(NAME, Command::new(&self.tool).args(&args));
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            debug!("kryoflux: leaving {}: {}", dir.display(), e);
        }
        result
    }
}

/// Finds DTC on the search path
#[derive(Debug, Clone)]
pub struct KryofluxBackend {
    /// Tool name or path
    pub tool: PathBuf,
}

impl Default for KryofluxBackend {
    fn default() -> Self {
        Self { tool: PathBuf::from("dtc") }
    }
}

impl Backend for KryofluxBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "KryoFlux via the DTC tool"
    }

    fn enumerate(&self) -> Vec<DeviceInfo> {
        find_tool(&self.tool)
            .map(|tool| KryofluxDevice::new(tool).info)
            .into_iter()
            .collect()
    }

    fn open(&self, path: &str) -> Result<Box<dyn FluxDevice>> {
        let tool = find_tool(Path::new(path))
            .or_else(|| find_tool(&self.tool))
            .ok_or_else(|| FloppyError::hardware(NAME, HardwareFault::NoDevice, 0, "dtc not found"))?;
        Ok(Box::new(KryofluxDevice::new(tool)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_track_args() {
        let mut dev = KryofluxDevice::new(PathBuf::from("dtc"));
        dev.seek(39).unwrap();
        dev.select_head(1).unwrap();
        dev.set_double_step(true);
        let args = dev.track_args(Path::new("/tmp/x/track"));
        assert_eq!(args, vec!["-f/tmp/x/track", "-i0", "-s39", "-e39", "-g1", "-k2"]);
        assert!(dev.select_head(2).is_err());
    }

    #[test]
    fn test_missing_tool() {
        let mut dev = KryofluxDevice::new(PathBuf::from("/nonexistent/dtc"));
        assert_eq!(dev.read_flux(2).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(dev.read_flux(9).unwrap_err().kind(), ErrorKind::InvalidArgument);
        let backend = KryofluxBackend {
            tool: PathBuf::from("/nonexistent/dtc"),
        };
        assert!(backend.enumerate().is_empty());
        assert!(backend.open("/nonexistent/dtc").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_capture_through_script() {
        use std::os::unix::fs::PermissionsExt;

        // stand-in tool: copies a prepared stream file to the requested prefix
        let work = tempfile::tempdir().unwrap();
        let flux = FluxStream::from_intervals(vec![4000; 500], &[0, 250, 500]);
        let source = work.path().join("stream.raw");
        std::fs::write(&source, stream::serialize(&flux)).unwrap();
        let script = work.path().join("dtc");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nprefix=${{1#-f}}\ncp {} \"${{prefix}}00.0.raw\"\n",
                source.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut dev = KryofluxDevice::new(script);
        let got = dev.read_flux(2).unwrap();
        assert_eq!(got.revolution_count(), 2);
        assert!(got.approx_eq(&flux, 100));
    }
}
