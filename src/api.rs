//! The operations a host shell calls
//!
//! Image operations run on the caller's thread and return directly.
//! Hardware operations (`start_read`, `start_write`, `start_verify`) run
//! on a worker thread; the returned [`Job`] exposes the progress queue and
//! the cancel token, and [`Job::wait`] hands back the result together with
//! the recorded [`Session`].

use crate::analysis::{self, AnalysisReport};
use crate::disk::{Disk, Geometry};
use crate::error::{FloppyError, Result};
use crate::fs::{self, DirEntry};
use crate::hw::{self, DeviceInfo, SharedDevice};
use crate::image::{self, Image, ParseOptions};
use crate::profile::PlatformProfile;
use crate::recovery::read_disk;
use crate::session::{outcome_of, CancelToken, Operation, Outcome, Params, Progress, ProgressQueue, Session};
use crate::writer::{verify_disk, write_disk, Report};
use log::{info, warn};
use serde::Serialize;
use std::path::Path;
use std::thread::JoinHandle;
use std::time::Duration;

/// How long a job waits for a device another job holds
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Summary returned by [`get_info`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    /// `sector`, `bitstream` or `flux`
    #[serde(rename = "type")]
    pub kind: String,
    pub format_name: String,
    pub platform: String,
    pub cylinders: u8,
    pub heads: u8,
    pub sectors_per_track: u8,
    pub sector_size: u16,
    pub total_size: usize,
}

/// Result of [`detect_format`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatDetection {
    pub format: String,
    pub confidence: u8,
}

/// Open an image, probing the container unless `hint` names one
pub fn open_image<P: AsRef<Path>>(path: P, hint: Option<&str>) -> Result<Image> {
    image::open(path.as_ref(), hint, &ParseOptions::default())
}

/// Open an image with explicit parse options
pub fn open_image_with<P: AsRef<Path>>(path: P, hint: Option<&str>, options: &ParseOptions) -> Result<Image> {
    image::open(path.as_ref(), hint, options)
}

/// Describe an opened image
pub fn get_info(image: &Image) -> ImageInfo {
    let disk = &image.disk;
    let (kind, format_name) = match image::codec(image.format) {
        Ok(c) => (c.kind().to_string(), c.description().to_string()),
        Err(_) => ("sector".to_string(), image.format.to_string()),
    };
    ImageInfo {
        kind,
        format_name,
        platform: image
            .profile
            .map(|p| p.description.to_string())
            .unwrap_or_else(|| disk.platform.to_string()),
        cylinders: disk.cylinder_count(),
        heads: disk.head_count(),
        sectors_per_track: disk.geometry.sectors_per_track,
        sector_size: disk.geometry.sector_size,
        total_size: disk.total_size(),
    }
}

/// Payload of one sector
pub fn read_sector(image: &Image, cylinder: u8, head: u8, sector: u8) -> Result<Vec<u8>> {
    Ok(image.disk.read_sector(cylinder, head, sector)?.to_vec())
}

/// Directory listing through the filesystem detected on the image
pub fn list_dir(image: &Image, path: &str) -> Result<Vec<DirEntry>> {
    fs::mount(&image.disk)?.readdir(path)
}

/// Contents of one file through the detected filesystem
pub fn read_file(image: &Image, path: &str) -> Result<Vec<u8>> {
    fs::mount(&image.disk)?.read(path)
}

/// Container to write `path` as: the named one, or by extension for `auto`
fn target_codec(path: &Path, target_format: &str) -> Result<&'static str> {
    let name = if target_format.is_empty() || target_format.eq_ignore_ascii_case("auto") {
        path.extension()
            .map(|e| e.to_string_lossy().to_string())
            .ok_or_else(|| FloppyError::invalid_arg(format!("{}: no extension to pick a format", path.display())))?
    } else {
        target_format.to_string()
    };
    Ok(image::codec(&name)?.name())
}

/// Write an image in a named container (`auto` picks by extension)
pub fn save_image<P: AsRef<Path>>(image: &Image, path: P, target_format: &str) -> Result<()> {
    let path = path.as_ref();
    image::save(image, path, target_codec(path, target_format)?)
}

/// Open one image and write it in another container
pub fn convert<P: AsRef<Path>, Q: AsRef<Path>>(src: P, dst: Q, target_format: &str) -> Result<()> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    let format = target_codec(dst, target_format)?;
    let image = open_image(src, None)?;
    info!("converting {} ({}) to {} ({})", src.display(), image.format, dst.display(), format);
    image::save(&image, dst, format)
}

/// Identify the container of a file or capture directory
pub fn detect_format<P: AsRef<Path>>(path: P) -> Result<FormatDetection> {
    let d = image::detect_path(path.as_ref())?;
    Ok(FormatDetection {
        format: d.codec.name().to_string(),
        confidence: d.confidence,
    })
}

/// Devices attached to every backend
pub fn enumerate_hardware() -> Vec<DeviceInfo> {
    hw::enumerate()
}

/// Open the device the parameters name
pub fn open_device(params: &Params) -> Result<SharedDevice> {
    hw::open(&params.hardware, params.device_path.as_deref())
}

impl AsRef<Disk> for Disk {
    fn as_ref(&self) -> &Disk {
        self
    }
}

impl AsRef<Disk> for Image {
    fn as_ref(&self) -> &Disk {
        &self.disk
    }
}

/// Analyse an image or a disk
pub fn analyze<T: AsRef<Disk>>(target: &T) -> AnalysisReport {
    analysis::analyze(target.as_ref())
}

/// A hardware operation running on a worker thread
pub struct Job<T> {
    operation: Operation,
    handle: JoinHandle<(Result<T>, Session)>,
    cancel: CancelToken,
    queue: ProgressQueue,
}

impl<T> std::fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("operation", &self.operation)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("pending", &self.queue.len())
            .finish()
    }
}

impl<T: Send + 'static> Job<T> {
    /// Run `work` on a worker thread; it returns its value and how the
    /// operation went, and the session is closed with that outcome
    fn spawn<F>(operation: Operation, cancel: CancelToken, mut session: Session, work: F) -> Result<Self>
    where
        F: FnOnce(&mut Progress, &mut Session) -> Result<(T, Outcome)> + Send + 'static,
    {
        let queue = ProgressQueue::new();
        let mut progress = Progress::with_queue(queue.clone(), cancel.clone());
        let handle = std::thread::Builder::new()
            .name(format!("ufloppy-{}", operation))
            .spawn(move || {
                let (result, outcome) = match work(&mut progress, &mut session) {
                    Ok((value, outcome)) => (Ok(value), outcome),
                    Err(e) => {
                        let result = Err(e);
                        let outcome = outcome_of(&result, Outcome::Success);
                        (result, outcome)
                    }
                };
                progress.complete(outcome);
                if let Err(e) = session.finish(&result, outcome) {
                    warn!("session {} not saved: {}", session.id, e);
                }
                (result, session)
            })?;
        Ok(Self {
            operation,
            handle,
            cancel,
            queue,
        })
    }

    /// Fire the cancel token
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The job's cancel token
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Progress and log events, for polling
    pub fn events(&self) -> &ProgressQueue {
        &self.queue
    }

    /// True once the worker has returned
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the worker and take its result and session
    pub fn wait(self) -> (Result<T>, Session) {
        match self.handle.join() {
            Ok(done) => done,
            Err(_) => (
                Err(FloppyError::Internal("worker thread panicked".into())),
                Session::new(self.operation, Params::default()),
            ),
        }
    }
}

fn new_session(
    operation: Operation,
    device: &SharedDevice,
    profile: Option<&PlatformProfile>,
    params: &Params,
    session_dir: Option<&Path>,
) -> Result<Session> {
    params.validate()?;
    let session = Session::new(operation, params.clone())
        .with_profile(profile)
        .with_hardware(Some(device.info().clone()));
    match session_dir {
        Some(dir) => session.with_dir(dir),
        None => Ok(session),
    }
}

/// Geometry a read covers: the profile's, or the parameters' when there
/// is no profile
fn read_geometry(profile: Option<&PlatformProfile>, params: &Params) -> Geometry {
    match profile {
        Some(p) => p.geometry,
        None => Geometry::new(params.cylinders, params.heads, params.sectors, 512),
    }
}

/// Read a whole disk from a device.
///
/// With a profile the read covers the profile's geometry; without one it
/// covers the `cylinders` and `heads` parameters. The session is saved
/// into `session_dir` as the read progresses.
pub fn start_read(
    device: &SharedDevice,
    profile: Option<&'static PlatformProfile>,
    cancel: CancelToken,
    params: &Params,
    session_dir: Option<&Path>,
) -> Result<Job<Disk>> {
    let session = new_session(Operation::Read, device, profile, params, session_dir)?;
    let config = params.recovery_config(profile)?;
    let geometry = read_geometry(profile, params);
    let device = device.clone();
    Job::spawn(Operation::Read, cancel, session, move |progress, session| {
        let mut guard = device.acquire(ACQUIRE_TIMEOUT)?;
        let mut disk = Disk::new(geometry);
        if let Some(p) = profile {
            disk.encoding = p.encoding;
            disk.platform = p.platform;
        }
        let outcome = read_disk(&mut *guard, &mut disk, profile, &config, progress)?;
        session.record_disk(&disk)?;
        Ok((disk, outcome))
    })
}

/// Write an image to a device
pub fn start_write(
    device: &SharedDevice,
    image: Image,
    cancel: CancelToken,
    params: &Params,
    session_dir: Option<&Path>,
) -> Result<Job<Report>> {
    let session = new_session(Operation::Write, device, image.profile, params, session_dir)?;
    let config = params.write_config(image.profile)?;
    let device = device.clone();
    Job::spawn(Operation::Write, cancel, session, move |progress, session| {
        let mut guard = device.acquire(ACQUIRE_TIMEOUT)?;
        let report = write_disk(&mut *guard, &image.disk, image.profile, &config, progress)?;
        session.record_report(report.clone())?;
        let outcome = report.outcome;
        Ok((report, outcome))
    })
}

/// Compare a device's disk against an image without writing
pub fn start_verify(
    device: &SharedDevice,
    image: Image,
    cancel: CancelToken,
    params: &Params,
    session_dir: Option<&Path>,
) -> Result<Job<Report>> {
    let session = new_session(Operation::Verify, device, image.profile, params, session_dir)?;
    let config = params.write_config(image.profile)?;
    let device = device.clone();
    Job::spawn(Operation::Verify, cancel, session, move |progress, session| {
        let mut guard = device.acquire(ACQUIRE_TIMEOUT)?;
        let report = verify_disk(&mut *guard, &image.disk, image.profile, &config, progress)?;
        session.record_report(report.clone())?;
        let outcome = report.outcome;
        Ok((report, outcome))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::mock::MockDevice;
    use crate::profile::profile;
    use crate::session::ProgressEvent;

    fn plus3() -> (Disk, &'static PlatformProfile) {
        let p = profile("spectrum-plus3").unwrap();
        let mut disk = Disk::builder().profile(p).build().unwrap();
        disk.write_sector(3, 0, 5, &[0x5A; 512]).unwrap();
        (disk, p)
    }

    fn drive(disk: Disk, p: &'static PlatformProfile) -> SharedDevice {
        SharedDevice::new(Box::new(MockDevice::new(disk).with_profile(Some(p))))
    }

    #[test]
    fn test_start_read_records_session() {
        let dir = tempfile::tempdir().unwrap();
        let (disk, p) = plus3();
        let device = drive(disk, p);
        let job = start_read(&device, Some(p), CancelToken::new(), &Params::for_profile(p), Some(dir.path())).unwrap();
        let queue = job.events().clone();
        let (result, session) = job.wait();
        let read = result.unwrap();
        assert_eq!(read.read_sector(3, 0, 5).unwrap(), &[0x5A; 512][..]);
        assert_eq!(session.results.outcome, Some(Outcome::Success));
        assert_eq!(session.results.tracks.len(), 40);
        assert_eq!(session.profile.as_deref(), Some("spectrum-plus3"));

        let events = queue.drain();
        let completes = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Complete { .. }))
            .count();
        assert_eq!(completes, 1);

        let saved = Session::load(session.file_path().unwrap()).unwrap();
        assert_eq!(saved.results.tracks.len(), 40);
        assert_eq!(saved.results.outcome, Some(Outcome::Success));
    }

    #[test]
    fn test_cancelled_read() {
        let (disk, p) = plus3();
        let device = drive(disk, p);
        let cancel = CancelToken::new();
        cancel.cancel();
        let job = start_read(&device, Some(p), cancel, &Params::default(), None).unwrap();
        let (result, session) = job.wait();
        assert!(matches!(result, Err(FloppyError::Cancelled)));
        assert_eq!(session.results.outcome, Some(Outcome::Cancelled));
    }

    #[test]
    fn test_write_protected_job_fails() {
        let (disk, p) = plus3();
        let mut mock = MockDevice::new(Disk::new(p.geometry)).with_profile(Some(p));
        mock.set_write_protected(true);
        let device = SharedDevice::new(Box::new(mock));
        let image = Image::new(disk, "dsk").with_profile(Some(p));
        let job = start_write(&device, image, CancelToken::new(), &Params::default(), None).unwrap();
        let (result, session) = job.wait();
        assert!(matches!(result, Err(FloppyError::Permission(_))));
        assert_eq!(session.results.outcome, Some(Outcome::Failed));
        assert!(session.results.error.unwrap().starts_with("E_PERMISSION"));
    }

    #[test]
    fn test_invalid_params_rejected_before_start() {
        let (disk, p) = plus3();
        let device = drive(disk, p);
        let mut params = Params::default();
        params.revolutions = 0;
        assert!(start_read(&device, Some(p), CancelToken::new(), &params, None).is_err());
    }

    #[test]
    fn test_save_convert_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let p = profile("pc-720k").unwrap();
        let mut disk = Disk::builder().profile(p).build().unwrap();
        disk.write_sector(0, 1, 2, &[0x11; 512]).unwrap();
        let image = Image::new(disk, "img").with_profile(Some(p));

        let img = dir.path().join("disk.img");
        save_image(&image, &img, "auto").unwrap();
        assert_eq!(std::fs::metadata(&img).unwrap().len(), 737_280);
        assert_eq!(detect_format(&img).unwrap().format, "img");

        let imd = dir.path().join("disk.imd");
        convert(&img, &imd, "auto").unwrap();
        let back = open_image(&imd, None).unwrap();
        assert_eq!(back.format, "imd");
        assert_eq!(read_sector(&back, 0, 1, 2).unwrap(), vec![0x11; 512]);

        let info = get_info(&back);
        assert_eq!(info.kind, "sector");
        assert_eq!((info.cylinders, info.heads, info.sectors_per_track), (80, 2, 9));
        assert_eq!(info.sector_size, 512);
    }

    #[test]
    fn test_target_without_extension() {
        let err = target_codec(Path::new("noext"), "auto").unwrap_err();
        assert!(matches!(err, FloppyError::InvalidArgument(_)));
        assert_eq!(target_codec(Path::new("x.bin"), "d64").unwrap(), "d64");
    }
}
