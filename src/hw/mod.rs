//! Floppy controller backends
//!
//! Each backend enumerates the devices it can see and opens them as a
//! [`FluxDevice`]. Backends never panic; every failure comes back as a
//! [`FloppyError::Hardware`] carrying the backend name and the
//! controller's own status code.

/// Parallel-port IEC drive access
pub mod iec;
/// FC5025 5.25" USB reader
pub mod fc5025;
/// FluxEngine via its command-line client
pub mod fluxengine;
/// Greaseweazle USB flux controller
pub mod greaseweazle;
/// KryoFlux via the DTC command-line tool
pub mod kryoflux;
/// Flux synthesised from a disk, for tests and dry runs
pub mod mock;
/// SuperCard Pro USB flux controller
pub mod supercard;
/// Byte transports shared by the serial-protocol backends
pub mod transport;
/// Backends recognised but not driven by this build
pub mod unavailable;

use crate::error::{FloppyError, HardwareFault, Result};
use crate::flux::FluxStream;
use log::{debug, info};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

/// Time a seek may take including head settle
pub const SEEK_TIMEOUT: Duration = Duration::from_secs(1);
/// Default timeout for controller commands
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(1500);
/// Default timeout for USB bulk transfers
pub const USB_TIMEOUT: Duration = Duration::from_secs(5);
/// Shortest time the motor stays on once started
pub const MIN_MOTOR_ON: Duration = Duration::from_millis(500);

/// Time allowed for one revolution to start: 1.5 nominal rotations
pub fn revolution_timeout(rpm: u16) -> Duration {
    Duration::from_micros(90_000_000 / rpm.max(1) as u64)
}

/// What a device can do, probed at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities(pub u32);

impl Capabilities {
    /// Capture flux
    pub const READ_FLUX: u32 = 0x01;
    /// Write flux
    pub const WRITE_FLUX: u32 = 0x02;
    /// Firmware sector reads
    pub const READ_SECTOR: u32 = 0x04;
    /// Firmware sector writes
    pub const WRITE_SECTOR: u32 = 0x08;
    /// Density select line
    pub const DENSITY: u32 = 0x10;
    /// Motor speed trim
    pub const SPEED: u32 = 0x20;
    /// Drives a second head
    pub const DOUBLE_SIDED: u32 = 0x40;

    const NAMES: [(u32, &'static str); 7] = [
        (Self::READ_FLUX, "read-flux"),
        (Self::WRITE_FLUX, "write-flux"),
        (Self::READ_SECTOR, "read-sector"),
        (Self::WRITE_SECTOR, "write-sector"),
        (Self::DENSITY, "density"),
        (Self::SPEED, "speed"),
        (Self::DOUBLE_SIDED, "double-sided"),
    ];

    /// Whether every bit in `flags` is set
    #[inline]
    pub fn has(&self, flags: u32) -> bool {
        self.0 & flags == flags
    }

    /// Names of the set bits
    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|&(_, name)| name)
            .collect()
    }
}

/// Drive line status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveStatus {
    /// Drive answered and is selected
    pub ready: bool,
    /// Write-protect tab set
    pub write_protected: bool,
    /// Media in the drive
    pub disk_present: bool,
    /// Head at cylinder 0
    pub track0: bool,
    /// Spindle running
    pub motor_on: bool,
}

/// Density select
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Density {
    /// Single or double density (250/300 kbit/s)
    #[default]
    Double,
    /// High density (500 kbit/s)
    High,
    /// Extra density (1 Mbit/s)
    Extended,
}

impl Density {
    /// Density for a nominal cell time
    pub fn for_cell_ns(cell_ns: f64) -> Self {
        if cell_ns <= 600.0 {
            Density::Extended
        } else if cell_ns <= 1200.0 {
            Density::High
        } else {
            Density::Double
        }
    }
}

/// A device found by enumeration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Backend registry name
    pub backend: String,
    /// Device node, directory or tool path
    pub path: String,
    /// Model description
    pub name: String,
    /// Firmware version, if reported
    pub firmware: Option<String>,
    /// Sample clock in Hz
    pub sample_rate: u32,
    /// What the device can do
    pub capabilities: Capabilities,
}

/// One opened controller with a drive attached
pub trait FluxDevice: Send {
    /// Backend registry name
    fn backend(&self) -> &'static str;

    /// Identification
    fn info(&self) -> &DeviceInfo;

    /// What the device can do
    fn capabilities(&self) -> Capabilities {
        self.info().capabilities
    }

    /// Drive line status
    fn status(&mut self) -> Result<DriveStatus>;

    /// Spin the motor up or down
    fn motor(&mut self, on: bool) -> Result<()>;

    /// Move the head; returns once the head has settled
    fn seek(&mut self, cylinder: u8) -> Result<()>;

    /// Select a head
    fn select_head(&mut self, head: u8) -> Result<()>;

    /// Select a density; remembered until changed or closed
    fn select_density(&mut self, density: Density) -> Result<()>;

    /// Capture between one and five whole revolutions
    fn read_flux(&mut self, revolutions: u8) -> Result<FluxStream>;

    /// Write one revolution of flux from the index
    fn write_flux(&mut self, _flux: &FluxStream) -> Result<()> {
        Err(not_supported(self.backend(), "flux writing"))
    }

    /// Firmware sector read
    fn read_sector(&mut self, _cylinder: u8, _head: u8, _sector: u8) -> Result<Vec<u8>> {
        Err(not_supported(self.backend(), "sector reads"))
    }

    /// Firmware sector write
    fn write_sector(&mut self, _cylinder: u8, _head: u8, _sector: u8, _data: &[u8]) -> Result<()> {
        Err(not_supported(self.backend(), "sector writes"))
    }

    /// Nudge the spindle speed by a percentage
    fn set_speed_trim(&mut self, _percent: i8) -> Result<()> {
        Err(not_supported(self.backend(), "speed control"))
    }
}

/// `NotSupported` fault for a backend
pub fn not_supported(backend: &'static str, what: &str) -> FloppyError {
    FloppyError::hardware(backend, HardwareFault::NotSupported, 0, format!("no support for {}", what))
}

/// Reject a revolution count outside 1..=5
pub fn check_revolutions(backend: &'static str, revolutions: u8) -> Result<u8> {
    if (1..=5).contains(&revolutions) {
        Ok(revolutions)
    } else {
        Err(FloppyError::invalid_arg(format!(
            "{}: revolutions must be 1..=5, got {}",
            backend, revolutions
        )))
    }
}

/// Locate an executable, either as given or on `PATH`
pub fn find_tool(tool: &Path) -> Option<PathBuf> {
    if tool.components().count() > 1 {
        return tool.is_file().then(|| tool.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).map(|dir| dir.join(tool)).find(|p| p.is_file())
}

/// Fresh scratch directory for one tool-driven capture
pub(crate) fn scratch_dir(backend: &str) -> Result<PathBuf> {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let dir = std::env::temp_dir().join(format!(
        "unifloppy-{}-{}-{}",
        backend,
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Run an external capture tool to completion
pub(crate) fn run_tool(backend: &'static str, command: &mut Command) -> Result<()> {
    debug!("{}: running {:?}", backend, command);
    let output = command.output().map_err(|e| {
        let fault = if e.kind() == std::io::ErrorKind::NotFound {
            HardwareFault::NoDevice
        } else {
            HardwareFault::Io
        };
        FloppyError::hardware(backend, fault, 0, format!("cannot start tool: {}", e))
    })?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let text = if stderr.trim().is_empty() { stdout } else { stderr };
    let last = text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim().to_string();
    let lower = last.to_ascii_lowercase();
    let fault = if lower.contains("protect") {
        HardwareFault::WriteProtected
    } else if lower.contains("index") {
        HardwareFault::NoIndex
    } else if lower.contains("not found") || lower.contains("no device") {
        HardwareFault::NoDevice
    } else {
        HardwareFault::Io
    };
    Err(FloppyError::hardware(
        backend,
        fault,
        output.status.code().unwrap_or(-1) as u32,
        last,
    ))
}

/// Holds the motor on for at least [`MIN_MOTOR_ON`]
#[derive(Debug, Clone, Default)]
pub struct MotorTimer {
    on_since: Option<Instant>,
}

impl MotorTimer {
    /// Record a motor-on transition
    pub fn started(&mut self) {
        if self.on_since.is_none() {
            self.on_since = Some(Instant::now());
        }
    }

    /// Whether the motor was last commanded on
    pub fn is_on(&self) -> bool {
        self.on_since.is_some()
    }

    /// Time still to wait before the motor may stop
    pub fn remaining(&self) -> Duration {
        self.on_since
            .map(|t| MIN_MOTOR_ON.saturating_sub(t.elapsed()))
            .unwrap_or_default()
    }

    /// Sleep out the minimum on-time, then record the motor as off
    pub fn stopping(&mut self) {
        let wait = self.remaining();
        if !wait.is_zero() {
            debug!("holding motor {} ms before stopping", wait.as_millis());
            std::thread::sleep(wait);
        }
        self.on_since = None;
    }
}

/// Finds and opens one kind of controller
pub trait Backend: Send + Sync {
    /// Registry name, also the `hardware` parameter value
    fn name(&self) -> &'static str;

    /// Human readable description
    fn description(&self) -> &'static str;

    /// Devices currently attached
    fn enumerate(&self) -> Vec<DeviceInfo>;

    /// Open a device found by [`Backend::enumerate`] or named by path
    fn open(&self, path: &str) -> Result<Box<dyn FluxDevice>>;
}

fn build_registry() -> Vec<Box<dyn Backend>> {
    vec![
        Box::new(greaseweazle::GreaseweazleBackend),
        Box::new(supercard::SupercardBackend),
        Box::new(kryoflux::KryofluxBackend::default()),
        Box::new(fluxengine::FluxEngineBackend::default()),
        Box::new(fc5025::Fc5025Backend),
        Box::new(iec::IecBackend),
        Box::new(unavailable::UnavailableBackend::APPLESAUCE),
        Box::new(unavailable::UnavailableBackend::CATWEASEL),
        Box::new(unavailable::UnavailableBackend::PAULINE),
        Box::new(mock::MockBackend),
    ]
}

/// Every registered backend
pub fn registry() -> &'static [Box<dyn Backend>] {
    static REGISTRY: OnceLock<Vec<Box<dyn Backend>>> = OnceLock::new();
    REGISTRY.get_or_init(build_registry)
}

/// Look a backend up by name
pub fn backend(name: &str) -> Result<&'static dyn Backend> {
    let lower = name.to_ascii_lowercase();
    registry()
        .iter()
        .find(|b| b.name() == lower)
        .map(|b| b.as_ref())
        .ok_or_else(|| FloppyError::NotFound(format!("hardware backend '{}'", name)))
}

/// Devices attached to every real backend
pub fn enumerate() -> Vec<DeviceInfo> {
    registry()
        .iter()
        .filter(|b| b.name() != mock::NAME)
        .flat_map(|b| b.enumerate())
        .collect()
}

/// Open a device. `hardware` names a backend or `auto`; `path` picks a
/// device node, defaulting to the first one enumerated.
pub fn open(hardware: &str, path: Option<&str>) -> Result<SharedDevice> {
    let (backend, path) = if hardware.eq_ignore_ascii_case("auto") {
        let found = enumerate()
            .into_iter()
            .find(|d| path.map_or(true, |p| p == d.path))
            .ok_or_else(|| FloppyError::hardware("auto", HardwareFault::NoDevice, 0, "no controller found"))?;
        (backend(&found.backend)?, found.path)
    } else {
        let backend = backend(hardware)?;
        let path = match path {
            Some(p) => p.to_string(),
            None => backend
                .enumerate()
                .into_iter()
                .next()
                .map(|d| d.path)
                .ok_or_else(|| FloppyError::hardware(backend.name(), HardwareFault::NoDevice, 0, "no device attached"))?,
        };
        (backend, path)
    };
    info!("opening {} device {}", backend.name(), path);
    Ok(SharedDevice::new(backend.open(&path)?))
}

/// A device owned by at most one operation at a time
#[derive(Clone)]
pub struct SharedDevice {
    inner: Arc<Mutex<Box<dyn FluxDevice>>>,
    info: DeviceInfo,
}

impl std::fmt::Debug for SharedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDevice").field("info", &self.info).finish()
    }
}

impl SharedDevice {
    /// Wrap an opened device
    pub fn new(device: Box<dyn FluxDevice>) -> Self {
        let info = device.info().clone();
        Self {
            inner: Arc::new(Mutex::new(device)),
            info,
        }
    }

    /// Identification
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Take exclusive use, waiting up to `timeout` for another holder
    pub fn acquire(&self, timeout: Duration) -> Result<DeviceGuard<'_>> {
        self.inner
            .try_lock_for(timeout)
            .map(|guard| DeviceGuard { guard })
            .ok_or_else(|| FloppyError::Timeout(format!("{} is busy", self.info.name)))
    }
}

/// Exclusive access to a device; the motor is stopped when dropped
pub struct DeviceGuard<'a> {
    guard: MutexGuard<'a, Box<dyn FluxDevice>>,
}

impl std::fmt::Debug for DeviceGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceGuard").field("info", self.guard.info()).finish()
    }
}

impl Deref for DeviceGuard<'_> {
    type Target = dyn FluxDevice;

    fn deref(&self) -> &Self::Target {
        self.guard.as_ref()
    }
}

impl DerefMut for DeviceGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_mut()
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.guard.motor(false) {
            debug!("motor off on release failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::Disk;
    use crate::error::ErrorKind;

    #[test]
    fn test_revolution_timeout() {
        assert_eq!(revolution_timeout(300), Duration::from_millis(300));
        assert_eq!(revolution_timeout(360), Duration::from_millis(250));
    }

    #[test]
    fn test_registry_lookup() {
        assert_eq!(backend("Greaseweazle").unwrap().name(), "greaseweazle");
        assert!(backend("nope").is_err());
        let names: Vec<_> = registry().iter().map(|b| b.name()).collect();
        assert!(names.contains(&"kryoflux"));
        assert!(names.contains(&"fc5025"));
    }

    #[test]
    fn test_capabilities() {
        let caps = Capabilities(Capabilities::READ_FLUX | Capabilities::DENSITY);
        assert!(caps.has(Capabilities::READ_FLUX));
        assert!(!caps.has(Capabilities::READ_FLUX | Capabilities::WRITE_FLUX));
        assert_eq!(caps.names(), vec!["read-flux", "density"]);
    }

    #[test]
    fn test_exclusive_acquire() {
        let disk = Disk::builder().build().unwrap();
        let shared = SharedDevice::new(Box::new(mock::MockDevice::new(disk)));
        let guard = shared.acquire(Duration::from_millis(10)).unwrap();
        let err = shared.acquire(Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        drop(guard);
        assert!(shared.acquire(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_tool_failures() {
        let err = run_tool("kryoflux", &mut Command::new("/nonexistent/dtc")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = run_tool("kryoflux", Command::new("sh").args(["-c", "echo 'disk is write protected' >&2; exit 3"]))
            .unwrap_err();
        assert!(matches!(err, FloppyError::Hardware { code: 3, fault: HardwareFault::WriteProtected, .. }));
        assert!(find_tool(Path::new("sh")).is_some());
    }

    #[test]
    fn test_motor_timer() {
        let mut timer = MotorTimer::default();
        assert!(timer.remaining().is_zero());
        timer.started();
        assert!(timer.is_on());
        assert!(timer.remaining() > Duration::from_millis(400));
    }
}
