/// Integration tests for unifloppy

use unifloppy::api;
use unifloppy::encoding::crc::{crc16, crc16_update};
use unifloppy::encoding::mfm::{encode_byte, push_pattern, SYNC_A1};
use unifloppy::flux::FluxArchive;
use unifloppy::fs::{amigados, cbm, dos33, FilesystemDriver};
use unifloppy::hw::mock::MockDevice;
use unifloppy::profile::profile;
use unifloppy::recovery::decode_flux;
use unifloppy::*;

fn formatted(name: &str) -> Disk {
    Disk::builder()
        .profile(profile(name).expect("profile"))
        .build()
        .expect("Failed to build disk")
}

/// Capture every track of a disk through the mock drive
fn capture(disk: Disk, p: &'static PlatformProfile, revolutions: u8) -> FluxArchive {
    let (cylinders, heads) = (p.geometry.cylinders, p.geometry.heads);
    let mut drive = MockDevice::new(disk).with_profile(Some(p));
    let mut archive = FluxArchive::new();
    drive.motor(true).unwrap();
    for c in 0..cylinders {
        for h in 0..heads {
            drive.seek(c).unwrap();
            drive.select_head(h).unwrap();
            archive.tracks.insert((c, h), drive.read_flux(revolutions).unwrap());
        }
    }
    archive
}

#[test]
fn test_adf_root_directory() {
    let dir = tempfile::tempdir().unwrap();
    let p = profile("amiga-dd").unwrap();
    let mut disk = formatted("amiga-dd");
    amigados::format(&mut disk, "Game", false).unwrap();
    amigados::AmigaDosDriver.write(&mut disk, "Disk.info", &[0xE3, 0x10, 0, 1]).unwrap();
    let path = dir.path().join("game.adf");
    api::save_image(&Image::new(disk, "adf").with_profile(Some(p)), &path, "auto").unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(bytes.len(), 901_120);
    assert_eq!(&bytes[..4], b"DOS\0");

    let image = api::open_image(&path, None).unwrap();
    assert_eq!(image.format, "adf");
    let entries = api::list_dir(&image, "/").unwrap();
    assert!(entries.iter().any(|e| e.name == "Disk.info"));
    let info = fs::mount(&image.disk).unwrap().stat_fs();
    assert_eq!(info.fs_type, "OFS");
    assert_eq!(api::read_file(&image, "Disk.info").unwrap(), vec![0xE3, 0x10, 0, 1]);
}

#[test]
fn test_d64_bam_sector() {
    let dir = tempfile::tempdir().unwrap();
    let p = profile("c64").unwrap();
    let mut disk = formatted("c64");
    cbm::format(&mut disk, "DEMO", "01").unwrap();
    let path = dir.path().join("demo.d64");
    api::save_image(&Image::new(disk, "d64").with_profile(Some(p)), &path, "auto").unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 174_848);

    let image = api::open_image(&path, None).unwrap();
    let bam = api::read_sector(&image, 17, 0, 0).unwrap();
    assert_eq!(bam.len(), 256);
    assert_eq!(bam[2], 0x41);
    assert_eq!(api::get_info(&image).cylinders, 35);
}

#[test]
fn test_scp_amiga_analysis() {
    let dir = tempfile::tempdir().unwrap();
    let p = profile("amiga-dd").unwrap();
    let mut disk = formatted("amiga-dd");
    amigados::format(&mut disk, "Capture", false).unwrap();
    disk.mark_unchanged();
    let mut image = Image::new(disk.clone(), "scp");
    image.flux = Some(capture(disk, p, 3));
    let path = dir.path().join("amiga.scp");
    api::save_image(&image, &path, "scp").unwrap();

    assert_eq!(api::detect_format(&path).unwrap().format, "scp");
    let opened = api::open_image(&path, None).unwrap();
    let report = api::analyze(&opened);
    assert_eq!(report.encoding, Encoding::AmigaMfm);
    assert_eq!(report.sectors_per_track, Some(11));
    assert!(report.tracks.iter().all(|t| t.sectors == 11));
    assert_eq!(report.cylinders, 80);
    assert!(report.confidence >= 90, "confidence {}", report.confidence);
    assert_eq!(report.filesystem_type.as_deref(), Some("OFS"));
}

fn bytes(cells: &mut Vec<u8>, prev: &mut u8, data: &[u8]) {
    for &b in data {
        *prev = encode_byte(b, *prev, cells);
    }
}

#[test]
fn test_synthetic_mfm_sector() {
    let mut cells = Vec::new();
    let mut prev = 0;
    bytes(&mut cells, &mut prev, &[0x4E; 60]);
    bytes(&mut cells, &mut prev, &[0x00; 12]);
    for _ in 0..3 {
        push_pattern(SYNC_A1, &mut cells);
    }
    prev = 1;
    let prefix = crc16(&[0xA1, 0xA1, 0xA1]);
    let header = [0xFE, 0x00, 0x00, 0x01, 0x02];
    bytes(&mut cells, &mut prev, &header);
    bytes(&mut cells, &mut prev, &crc16_update(prefix, &header).to_be_bytes());
    bytes(&mut cells, &mut prev, &[0x4E; 22]);
    bytes(&mut cells, &mut prev, &[0x00; 12]);
    for _ in 0..3 {
        push_pattern(SYNC_A1, &mut cells);
    }
    prev = 1;
    let mut field = vec![0xFB];
    field.extend((0..512u32).map(|i| (i * 7) as u8));
    bytes(&mut cells, &mut prev, &field);
    bytes(&mut cells, &mut prev, &crc16_update(prefix, &field).to_be_bytes());
    bytes(&mut cells, &mut prev, &[0x4E; 80]);

    let flux = Bitstream::from_bits(cells, 2000.0).to_flux();
    let config = RecoveryConfig {
        encoding: Some(Encoding::Mfm),
        ..RecoveryConfig::default()
    };
    let track = decode_flux(&flux, 0, 0, None, &config);
    assert_eq!(track.sector_count(), 1);
    let sector = &track.sectors()[0];
    assert_eq!(sector.id, SectorId::new(0, 0, 1, 2));
    assert!(sector.header_crc_ok);
    assert!(sector.data_crc_ok);
    assert_eq!(sector.data(), &field[1..]);
}

#[test]
fn test_woz_dos33_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let p = profile("apple2-dos33").unwrap();
    let mut disk = formatted("apple2-dos33");
    dos33::format(&mut disk, 254).unwrap();
    let mut hello = 0x0801u16.to_le_bytes().to_vec();
    let program = b"\x0A\x08\x0A\x00\xBA\x22HELLO\x22\x00\x00\x00";
    hello.extend((program.len() as u16).to_le_bytes());
    hello.extend_from_slice(program);
    dos33::Dos33Driver.write(&mut disk, "HELLO", &hello).unwrap();
    let path = dir.path().join("dos.woz");
    api::save_image(&Image::new(disk, "woz").with_profile(Some(p)), &path, "auto").unwrap();

    let image = api::open_image(&path, None).unwrap();
    assert_eq!(image.format, "woz");
    let entries = api::list_dir(&image, "/").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "HELLO");
    assert_eq!(api::read_file(&image, "HELLO").unwrap(), hello);
}

#[test]
fn test_blank_flux_analysis() {
    let dir = tempfile::tempdir().unwrap();
    let p = profile("pc-720k").unwrap();
    let blank = Disk::new(Geometry::new(80, 2, 0, 512));
    let mut image = Image::new(blank.clone(), "scp");
    let archive = capture(blank, p, 2);
    image.flux = Some(archive);
    let path = dir.path().join("blank.scp");
    api::save_image(&image, &path, "scp").unwrap();

    let opened = api::open_image(&path, None).unwrap();
    let report = api::analyze(&opened);
    assert!(report
        .tracks
        .iter()
        .all(|t| matches!(t.status, TrackStatus::Empty | TrackStatus::Unknown)));
    assert!(report.filesystem.is_none());
    assert!(report.is_blank());
}

#[test]
fn test_convert_keeps_sectors() {
    let dir = tempfile::tempdir().unwrap();
    let p = profile("pc-720k").unwrap();
    let mut disk = formatted("pc-720k");
    disk.write_sector(12, 1, 4, &[0x77; 512]).unwrap();
    let img = dir.path().join("disk.img");
    api::save_image(&Image::new(disk, "img").with_profile(Some(p)), &img, "img").unwrap();

    for target in ["disk.imd", "disk.hfe", "disk.scp", "disk.dsk"] {
        let out = dir.path().join(target);
        api::convert(&img, &out, "auto").unwrap();
        let back = api::open_image(&out, None).unwrap();
        assert_eq!(back.disk.read_sector(12, 1, 4).unwrap(), &[0x77; 512][..], "{}", target);
    }
}

#[test]
fn test_unknown_format_and_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let junk = dir.path().join("junk.xyz");
    std::fs::write(&junk, [0x13u8; 1000]).unwrap();
    assert!(api::open_image(&junk, Some("nonsense")).is_err());
    let err = api::open_image(dir.path().join("missing.adf"), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn test_read_job_with_session_replay() {
    let dir = tempfile::tempdir().unwrap();
    let p = profile("spectrum-plus3").unwrap();
    let mut disk = formatted("spectrum-plus3");
    disk.write_sector(1, 0, 1, &[0x3C; 512]).unwrap();
    let mut drive = MockDevice::new(disk).with_profile(Some(p));
    drive.inject_fault(2, 0, 1);
    let device = SharedDevice::new(Box::new(drive));

    let params = Params::for_profile(p);
    let job = api::start_read(&device, Some(p), CancelToken::new(), &params, Some(dir.path())).unwrap();
    let (result, session) = job.wait();
    let read = result.unwrap();
    assert_eq!(read.read_sector(1, 0, 1).unwrap(), &[0x3C; 512][..]);
    assert!(read.track(2, 0).is_some_and(|t| t.status == TrackStatus::Ok));

    let loaded = Session::load(session.file_path().unwrap()).unwrap();
    assert_eq!(loaded.operation, Operation::Read);
    assert_eq!(loaded.params, params);
    assert!(loaded.overrides_for(2, 0).count() >= 1);
    assert_eq!(loaded.results.outcome, Some(Outcome::Success));
}

#[test]
fn test_write_then_verify_job() {
    let p = profile("spectrum-plus3").unwrap();
    let mut source = formatted("spectrum-plus3");
    source.write_sector(0, 0, 1, &[0x11; 512]).unwrap();
    let drive = MockDevice::new(Disk::new(p.geometry)).with_profile(Some(p));
    let device = SharedDevice::new(Box::new(drive));
    let image = Image::new(source, "dsk").with_profile(Some(p));

    let params = Params::default();
    let (report, session) = api::start_write(&device, image.clone(), CancelToken::new(), &params, None)
        .unwrap()
        .wait();
    let report = report.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.tracks, 40);
    assert_eq!(session.results.report.as_ref(), Some(&report));

    let (verified, _) = api::start_verify(&device, image, CancelToken::new(), &params, None)
        .unwrap()
        .wait();
    assert_eq!(verified.unwrap().verified, 40);
}
