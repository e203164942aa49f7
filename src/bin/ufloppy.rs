/// Interactive floppy preservation console

use dez80::Instruction;

use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Context, Editor, Helper};
use std::path::PathBuf;
use std::time::Duration;
use unifloppy::api::{self, Job};
use unifloppy::boot::BootCode;
use unifloppy::*;

/// Command completer for the REPL
struct CommandCompleter {
    commands: Vec<&'static str>,
}

impl CommandCompleter {
    fn new() -> Self {
        Self {
            commands: vec![
                "analyze",
                "boot",
                "cat",
                "convert",
                "dasm",
                "detect",
                "dir",
                "disassemble",
                "exit",
                "fs-export",
                "fs-info",
                "fs-read",
                "get",
                "help",
                "hw",
                "info",
                "load",
                "ls",
                "map",
                "open",
                "params",
                "profiles",
                "protection",
                "quit",
                "read",
                "read-sector",
                "save",
                "sectors",
                "session",
                "set",
                "tracks",
                "verify",
                "write",
            ],
        }
    }
}

impl Completer for CommandCompleter {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        // Only complete the first word (command name)
        let line_to_cursor = &line[..pos];
        if line_to_cursor.contains(' ') {
            return Ok((pos, vec![]));
        }

        let prefix = line_to_cursor.to_lowercase();
        let matches: Vec<Pair> = self
            .commands
            .iter()
            .filter(|cmd| cmd.starts_with(&prefix))
            .map(|cmd| Pair {
                display: cmd.to_string(),
                replacement: cmd.to_string(),
            })
            .collect();

        Ok((0, matches))
    }
}

impl Hinter for CommandCompleter {
    type Hint = String;
}

impl Highlighter for CommandCompleter {}
impl Validator for CommandCompleter {}
impl Helper for CommandCompleter {}

/// Get the path to the history file
fn history_path() -> Option<PathBuf> {
    dirs::home_dir().map(|mut p| {
        p.push(".ufloppy_history");
        p
    })
}

/// Where sessions recorded by hardware commands are kept
fn session_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|mut p| {
        p.push("ufloppy");
        p.push("sessions");
        p
    })
}

/// Console state: the open image and the parameter namespace
struct Console {
    image: Option<Image>,
    params: Params,
}

impl Console {
    fn new() -> Self {
        Self {
            image: None,
            params: Params::default(),
        }
    }

    fn image(&self) -> Option<&Image> {
        if self.image.is_none() {
            println!("No image loaded. Use 'open <path>' or 'read <path>' first.");
        }
        self.image.as_ref()
    }

    /// Run one command line; returns false to leave the console
    fn run(&mut self, parts: &[String]) -> bool {
        let command = parts[0].to_lowercase();
        let args = &parts[1..];
        let result = match command.as_str() {
            "help" => {
                print_help();
                Ok(())
            }
            "quit" | "exit" => return false,
            "open" | "load" => self.open(args),
            "info" => {
                if let Some(img) = self.image() {
                    print_info(img);
                }
                Ok(())
            }
            "tracks" => {
                if let Some(img) = self.image() {
                    list_tracks(&img.disk);
                }
                Ok(())
            }
            "sectors" => {
                if let Some(img) = self.image() {
                    match (args.first(), args.get(1)) {
                        (Some(c), h) => {
                            let cylinder: u8 = c.parse().unwrap_or(0);
                            let head: u8 = h.and_then(|h| h.parse().ok()).unwrap_or(0);
                            list_sectors_on_track(&img.disk, cylinder, head);
                        }
                        (None, _) => {
                            for track in img.disk.tracks() {
                                list_sectors_on_track(&img.disk, track.cylinder, track.head);
                            }
                        }
                    }
                }
                Ok(())
            }
            "read-sector" => self.read_sector(args),
            "map" => {
                if let Some(img) = self.image() {
                    let head: u8 = args.first().and_then(|h| h.parse().ok()).unwrap_or(0);
                    draw_track_map(&img.disk, head);
                }
                Ok(())
            }
            "fs-info" => self.fs_info(),
            "dir" | "ls" | "cat" => self.list_dir(args),
            "fs-read" => self.fs_read(args),
            "fs-export" => self.fs_export(args),
            "save" => self.save(args),
            "convert" => convert(args),
            "detect" => detect(args),
            "analyze" => {
                if let Some(img) = self.image() {
                    print_analysis(&api::analyze(img));
                }
                Ok(())
            }
            "protection" => {
                if let Some(img) = self.image() {
                    match analysis::detect_protection(&img.disk) {
                        Some(result) => println!("{} [{}]", result.name, result.reason),
                        None => println!("No copy protection detected."),
                    }
                }
                Ok(())
            }
            "boot" => {
                if let Some(img) = self.image() {
                    let detection = BootDetection::detect(&img.disk);
                    if detection.is_bootable() {
                        println!("Bootable on {} [{}]", detection.system, detection.reason);
                    } else {
                        println!("Not bootable [{}]", detection.reason);
                    }
                }
                Ok(())
            }
            "disassemble" | "dasm" => self.disassemble(args),
            "profiles" => {
                for p in profile::profiles() {
                    println!(
                        "{:<16} {:<12} {:<10} {}",
                        p.name,
                        p.platform.to_string(),
                        p.encoding.to_string(),
                        p.description
                    );
                }
                Ok(())
            }
            "hw" => {
                let devices = api::enumerate_hardware();
                if devices.is_empty() {
                    println!("No controllers found.");
                }
                for d in devices {
                    println!(
                        "{:<12} {:<24} {} {}",
                        d.backend,
                        d.path,
                        d.name,
                        d.firmware.as_deref().unwrap_or("")
                    );
                }
                Ok(())
            }
            "set" => self.set(args),
            "get" | "params" => {
                self.get(args);
                Ok(())
            }
            "read" => self.read(args),
            "write" => self.write(false),
            "verify" => self.write(true),
            "session" => self.session(args),
            _ => {
                println!("Unknown command: {}. Type 'help' for available commands.", command);
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("Error: {} ({})", e, e.kind().code());
        }
        true
    }

    fn open(&mut self, args: &[String]) -> Result<()> {
        let Some(path) = args.first() else {
            println!("Usage: open <path> [format]");
            return Ok(());
        };
        let options = ParseOptions {
            strict: false,
            profile: None,
        };
        let hint = args.get(1).map(String::as_str).or(self.params.format_hint());
        let img = api::open_image_with(path, hint, &options)?;
        println!("Opened: {} ({})", path, img.format);
        for w in &img.warnings {
            println!("  warning: {}", w);
        }
        self.image = Some(img);
        Ok(())
    }

    fn read_sector(&self, args: &[String]) -> Result<()> {
        let Some(img) = self.image() else {
            return Ok(());
        };
        if args.len() < 3 {
            println!("Usage: read-sector <cylinder> <head> <sector_id>");
            return Ok(());
        }
        let cylinder: u8 = args[0].parse().unwrap_or(0);
        let head: u8 = args[1].parse().unwrap_or(0);
        let Some(sector_id) = parse_hex_or_dec(&args[2]) else {
            println!("Bad sector id: {}", args[2]);
            return Ok(());
        };
        let data = api::read_sector(img, cylinder, head, sector_id)?;
        println!("Sector {}:{}:{} ({} bytes):", cylinder, head, sector_id, data.len());
        print_hex_dump(&data, 256);
        Ok(())
    }

    fn fs_info(&self) -> Result<()> {
        let Some(img) = self.image() else {
            return Ok(());
        };
        let info = fs::mount(&img.disk)?.stat_fs();
        println!("{} filesystem", info.fs_type);
        if !info.volume_name.is_empty() {
            println!("Volume: {}", info.volume_name);
        }
        println!("Block size: {} bytes", info.block_size);
        println!("Total blocks: {}", info.total_blocks);
        println!("Total capacity: {} KB", info.total_blocks * info.block_size / 1024);
        println!("Free blocks: {}", info.free_blocks);
        println!("Free space: {} KB", info.free_blocks * info.block_size / 1024);
        Ok(())
    }

    fn list_dir(&self, args: &[String]) -> Result<()> {
        let Some(img) = self.image() else {
            return Ok(());
        };
        let path = args.first().map(String::as_str).unwrap_or("/");
        let entries = api::list_dir(img, path)?;
        if entries.is_empty() {
            println!("No files found.");
            return Ok(());
        }
        println!("{:<24} {:>8} {:<5} {:<4} {}", "Name", "Size", "Type", "Att", "Modified");
        println!("{}", "-".repeat(64));
        for entry in entries {
            let attrs = format!(
                "{}{}{}",
                if entry.attributes.read_only { "R" } else { "-" },
                if entry.attributes.system { "S" } else { "-" },
                if entry.attributes.hidden { "H" } else { "-" }
            );
            let kind = if entry.kind == fs::EntryKind::Directory {
                "<DIR>".to_string()
            } else {
                entry.file_type.clone().unwrap_or_default()
            };
            let modified = entry
                .modified
                .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            println!("{:<24} {:>8} {:<5} {:<4} {}", entry.name, entry.size, kind, attrs, modified);
        }
        Ok(())
    }

    fn fs_read(&self, args: &[String]) -> Result<()> {
        let Some(img) = self.image() else {
            return Ok(());
        };
        let Some(name) = args.first() else {
            println!("Usage: fs-read <path>");
            return Ok(());
        };
        let data = api::read_file(img, name)?;
        println!("File: {} ({} bytes)", name, data.len());
        print_hex_dump(&data, 256);
        Ok(())
    }

    fn fs_export(&self, args: &[String]) -> Result<()> {
        let Some(img) = self.image() else {
            return Ok(());
        };
        let Some(name) = args.first() else {
            println!("Usage: fs-export <path> [output_path]");
            return Ok(());
        };
        let output = args.get(1).cloned().unwrap_or_else(|| {
            name.rsplit(['/', ':']).next().unwrap_or(name).to_string()
        });
        let data = api::read_file(img, name)?;
        std::fs::write(&output, &data)?;
        println!("Exported {} ({} bytes) to {}", name, data.len(), output);
        Ok(())
    }

    fn save(&self, args: &[String]) -> Result<()> {
        let Some(img) = self.image() else {
            return Ok(());
        };
        let Some(path) = args.first() else {
            println!("Usage: save <path> [format]");
            return Ok(());
        };
        let format = args.get(1).map(String::as_str).unwrap_or("auto");
        api::save_image(img, path, format)?;
        println!("Saved to: {}", path);
        Ok(())
    }

    fn disassemble(&self, args: &[String]) -> Result<()> {
        let Some(img) = self.image() else {
            return Ok(());
        };
        if args.is_empty() {
            let detection = BootDetection::detect(&img.disk);
            if let Some(BootCode { origin, bytes }) = &detection.code {
                println!("{} boot code at {:04X}:", detection.system, origin);
                disassemble_z80(bytes, *origin);
                return Ok(());
            }
        }
        let cylinder: u8 = args.first().and_then(|c| c.parse().ok()).unwrap_or(0);
        let sector_id = match args.get(1) {
            Some(s) => parse_hex_or_dec(s),
            None => find_lowest_sector_id(&img.disk, cylinder, 0),
        };
        let Some(sector_id) = sector_id else {
            println!("No sectors found on cylinder {}.", cylinder);
            return Ok(());
        };
        let data = api::read_sector(img, cylinder, 0, sector_id)?;
        disassemble_z80(&data, 0);
        Ok(())
    }

    fn set(&mut self, args: &[String]) -> Result<()> {
        if args.len() < 2 {
            println!("Usage: set <name> <value>");
            return Ok(());
        }
        self.params.set(&args[0], &args[1])?;
        if std::env::var_os("RUST_LOG").is_none() {
            log::set_max_level(self.params.log_level());
        }
        println!("{} = {}", args[0], args[1]);
        Ok(())
    }

    fn get(&self, args: &[String]) {
        let names: Vec<&str> = match args.first() {
            Some(n) => vec![n.as_str()],
            None => Params::NAMES.to_vec(),
        };
        for name in names {
            match self.params.get(name) {
                Some(value) => println!("{:<20} {}", name, value),
                None => println!("Unknown parameter: {}", name),
            }
        }
    }

    /// Profile named on the command line, else the open image's
    fn profile_arg(&self, arg: Option<&String>) -> Result<Option<&'static PlatformProfile>> {
        match arg {
            Some(name) => Ok(Some(profile::profile(name)?)),
            None => Ok(self.image.as_ref().and_then(|i| i.profile)),
        }
    }

    fn read(&mut self, args: &[String]) -> Result<()> {
        let Some(output) = args.first() else {
            println!("Usage: read <output_path> [profile]");
            return Ok(());
        };
        let profile = self.profile_arg(args.get(1))?;
        let device = api::open_device(&self.params)?;
        println!("Reading from {} ({})", device.info().name, device.info().backend);
        let dir = session_dir();
        let job = api::start_read(&device, profile, CancelToken::new(), &self.params, dir.as_deref())?;
        let (result, session) = follow(job);
        let disk = result?;
        let img = Image::new(disk, "device").with_profile(profile);
        api::save_image(&img, output, "auto")?;
        println!("Saved to: {} (session {})", output, session.id);
        self.image = Some(img);
        Ok(())
    }

    fn write(&mut self, verify_only: bool) -> Result<()> {
        let Some(img) = self.image() else {
            return Ok(());
        };
        let img = img.clone();
        let device = api::open_device(&self.params)?;
        let dir = session_dir();
        let job = if verify_only {
            api::start_verify(&device, img, CancelToken::new(), &self.params, dir.as_deref())?
        } else {
            api::start_write(&device, img, CancelToken::new(), &self.params, dir.as_deref())?
        };
        let (result, _) = follow(job);
        let report = result?;
        println!("{} tracks, {} verified", report.tracks, report.verified);
        for f in &report.failures {
            println!(
                "  c{} h{}: sectors {:?} after {} attempt(s)",
                f.cylinder, f.head, f.sectors, f.attempts
            );
        }
        Ok(())
    }

    fn session(&mut self, args: &[String]) -> Result<()> {
        let Some(path) = args.first() else {
            println!("Usage: session <session.json>");
            return Ok(());
        };
        let session = Session::load(path)?;
        println!(
            "Session {} ({}, {}): {:?}",
            session.id,
            session.operation,
            session.created_at.format("%Y-%m-%d %H:%M:%S"),
            session.results.outcome
        );
        println!("{} track result(s), {} override(s)", session.results.tracks.len(), session.overrides.len());
        if let Some(e) = &session.results.error {
            println!("Error: {}", e);
        }
        self.params = session.params;
        println!("Parameters restored.");
        Ok(())
    }
}

/// Print a job's events until it finishes, then take its result
fn follow<T: Send + 'static>(job: Job<T>) -> (Result<T>, Session) {
    loop {
        let done = job.is_finished();
        for event in job.events().drain() {
            match event {
                ProgressEvent::Track {
                    cylinder,
                    head,
                    status,
                    good,
                    total,
                } => println!("  c{:02} h{}  {:<9} {}/{}", cylinder, head, status.to_string(), good, total),
                ProgressEvent::Log { level, message } => println!("  [{}] {}", level, message),
                ProgressEvent::Complete { outcome, tracks } => println!("Finished: {:?} ({} tracks)", outcome, tracks),
            }
        }
        if done {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    job.wait()
}

fn convert(args: &[String]) -> Result<()> {
    if args.len() < 2 {
        println!("Usage: convert <source> <destination> [format]");
        return Ok(());
    }
    let format = args.get(2).map(String::as_str).unwrap_or("auto");
    api::convert(&args[0], &args[1], format)?;
    println!("Converted {} to {}", args[0], args[1]);
    Ok(())
}

fn detect(args: &[String]) -> Result<()> {
    let Some(path) = args.first() else {
        println!("Usage: detect <path>");
        return Ok(());
    };
    let d = api::detect_format(path)?;
    println!("{}: {} ({}% confidence)", path, d.format, d.confidence);
    Ok(())
}

fn main() {
    let mut console = Console::new();
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Trace)
        .parse_env(env_logger::Env::default())
        .init();
    if std::env::var_os("RUST_LOG").is_none() {
        log::set_max_level(console.params.log_level());
    }

    println!("=== UniFloppy ===");
    println!("Interactive console for floppy disk images and flux controllers.");
    println!("Type 'help' for available commands\n");

    let mut rl = match Editor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("Failed to create editor: {}", e);
            std::process::exit(1);
        }
    };
    rl.set_helper(Some(CommandCompleter::new()));

    if let Some(history_path) = history_path() {
        let _ = rl.load_history(&history_path);
    }

    for path in std::env::args().skip(1).take(1) {
        console.run(&["open".to_string(), path]);
    }

    loop {
        let input = match rl.readline("> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        };

        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(input);

        let parts = parse_command_line(input);
        if parts.is_empty() {
            continue;
        }
        if !console.run(&parts) {
            break;
        }
    }

    if let Some(history_path) = history_path() {
        let _ = rl.save_history(&history_path);
    }
    println!("Goodbye!");
}

fn parse_command_line(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
            }
            ' ' | '\t' if !in_quotes => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            _ => {
                current.push(ch);
            }
        }
    }

    if !current.is_empty() {
        parts.push(current);
    }

    parts
}

fn print_help() {
    println!("Available commands:");
    println!("  open <path> [format]           - Open a disk image (use quotes for paths with spaces)");
    println!("  info                           - Show image information");
    println!("  tracks                         - List all tracks");
    println!("  sectors [cyl] [head]           - List sectors (all or one track)");
    println!("  read-sector <c> <h> <id>       - Read and display a sector");
    println!("  map [head]                     - Visual track map (white=ok, yellow=warning, red=bad)");
    println!("  fs-info                        - Show filesystem information");
    println!("  dir [path]                     - List files on disk (ls, cat)");
    println!("  fs-read <path>                 - Read and hex dump a file");
    println!("  fs-export <path> [output]      - Export a file to the host filesystem");
    println!("  analyze                        - Encoding, errors, filesystem and confidence report");
    println!("  protection                     - Detect copy protection scheme");
    println!("  boot                           - Detect what system the disk boots on");
    println!("  disassemble [cyl] [sector]     - Disassemble Z80 boot code or a sector (dasm)");
    println!("  save <path> [format]           - Save image (format defaults to the extension)");
    println!("  convert <src> <dst> [format]   - Convert between image formats");
    println!("  detect <path>                  - Identify an image format");
    println!("  profiles                       - List platform profiles");
    println!("  hw                             - List attached flux controllers");
    println!("  set <name> <value>             - Set a parameter (e.g. set hardware greaseweazle)");
    println!("  get [name]                     - Show parameters (params)");
    println!("  read <output> [profile]        - Read a disk from the controller and save it");
    println!("  write                          - Write the open image to the controller's disk");
    println!("  verify                         - Compare the controller's disk with the open image");
    println!("  session <path>                 - Show a saved session and restore its parameters");
    println!("  help                           - Show this help");
    println!("  quit, exit                     - Exit");
}

fn print_info(image: &Image) {
    if let Some(path) = &image.path {
        println!("Filename: {}", path.display());
    }
    let info = api::get_info(image);
    println!("Format: {} ({})", info.format_name, info.kind);
    println!("Platform: {}", info.platform);
    println!("Encoding: {}", image.disk.encoding);
    println!("Cylinders: {}", info.cylinders);
    println!("Heads: {}", info.heads);
    println!("Sectors per track: {}", info.sectors_per_track);
    println!("Sector size: {} bytes", info.sector_size);
    println!("Total capacity: {} KB", info.total_size / 1024);
    println!("Changed: {}", if image.disk.is_changed() { "Yes" } else { "No" });
    if let Some(flux) = &image.flux {
        println!("Flux captures: {} cylinders, {} heads", flux.cylinders(), flux.heads());
    }
}

fn list_tracks(disk: &Disk) {
    println!(
        "{:<4} {:<4} {:<10} {:<8} {:<6} {:<10} {:<8} {:<6}",
        "Cyl", "Head", "Encoding", "Sectors", "Good", "Status", "Driver", "Conf"
    );
    println!("{}", "-".repeat(64));
    for track in disk.tracks() {
        println!(
            "{:<4} {:<4} {:<10} {:<8} {:<6} {:<10} {:<8} {:<6}",
            track.cylinder,
            track.head,
            track.encoding.to_string(),
            track.sector_count(),
            track.good_sectors(),
            track.status.to_string(),
            track.driver.unwrap_or("-"),
            track.confidence
        );
    }
}

fn list_sectors_on_track(disk: &Disk, cylinder: u8, head: u8) {
    let Some(track) = disk.track(cylinder, head) else {
        println!("Track {} not found on head {}.", cylinder, head);
        return;
    };
    println!("Cylinder {} head {}:", cylinder, head);
    println!(
        "{:<6} {:<6} {:<6} {:<6} {:<12} {:<10} {:<10} {:<12} {:<12}",
        "Index", "Cyl", "Head", "ID", "Size", "CRC", "Data Size", "Quality", "Status"
    );
    println!("{}", "-".repeat(92));
    for (idx, sector) in track.sectors().iter().enumerate() {
        let size = format!("{} ({})", sector.id.size_code, sector.advertised_size());
        let crc = format!(
            "{}/{}",
            if sector.header_crc_ok { "ok" } else { "bad" },
            if sector.data_crc_ok { "ok" } else { "bad" }
        );
        println!(
            "{:<6} {:<6} {:<6} {:<6} {:<12} {:<10} {:<10} {:<12} {:<12}",
            idx,
            sector.id.cylinder,
            sector.id.head,
            sector.id.sector,
            size,
            crc,
            sector.actual_size(),
            sector.quality().to_string(),
            sector.status(track.filler_byte).to_string()
        );
    }
}

fn print_analysis(report: &AnalysisReport) {
    println!("Platform: {}", report.platform);
    println!("Encoding: {}", report.encoding);
    println!("Geometry: {} cylinders, {} heads", report.cylinders, report.heads);
    if let Some(spt) = report.sectors_per_track {
        println!("Sectors per track: {}", spt);
    }
    println!(
        "Tracks: {} ({} empty, {} bad)",
        report.tracks.len(),
        report.empty_tracks,
        report.bad_tracks
    );
    println!("CRC errors: {}", report.crc_errors);
    println!("Weak sectors: {}", report.weak_sectors);
    match (&report.filesystem, &report.filesystem_type) {
        (Some((name, confidence)), Some(fs_type)) => println!("Filesystem: {} / {} ({}%)", name, fs_type, confidence),
        (Some((name, confidence)), None) => println!("Filesystem: {} ({}%)", name, confidence),
        _ => println!("Filesystem: none detected"),
    }
    if report.boot.is_bootable() {
        println!("Boot: {} [{}]", report.boot.system, report.boot.reason);
    }
    if let Some(p) = &report.protection {
        println!("Protection: {} [{}]", p.name, p.reason);
    }
    println!("Confidence: {}%", report.confidence);
    if report.is_blank() {
        println!("The disk appears blank.");
    }
}

/// ANSI color codes for the track map
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BRIGHT_WHITE: &str = "\x1b[97m";
    pub const DARK_WHITE: &str = "\x1b[37m";
    pub const BRIGHT_RED: &str = "\x1b[91m";
    pub const BRIGHT_YELLOW: &str = "\x1b[93m";
    pub const BRIGHT_CYAN: &str = "\x1b[96m";
}

/// Draw one column per cylinder, one row per sector position
fn draw_track_map(disk: &Disk, head: u8) {
    const BLOCK: &str = "\u{2593}";
    const EMPTY: &str = "\u{2591}";

    let tracks: Vec<&Track> = disk.tracks().filter(|t| t.head == head).collect();
    let max_sectors = tracks.iter().map(|t| t.sector_count()).max().unwrap_or(0);
    if max_sectors == 0 {
        println!("No sectors found on head {}.", head);
        return;
    }

    println!("=== Track Map (Head {}) ===", head);
    println!(
        "Legend: {}Good{} {}Error{} {}Weak{} {}Missing{}",
        colors::BRIGHT_WHITE,
        colors::RESET,
        colors::BRIGHT_RED,
        colors::RESET,
        colors::BRIGHT_YELLOW,
        colors::RESET,
        colors::DARK_WHITE,
        colors::RESET
    );
    println!();

    for pos in (0..max_sectors).rev() {
        print!("{:>2} ", pos);
        for track in &tracks {
            match track.sectors().get(pos) {
                Some(s) if s.weak => print!("{}{}{}", colors::BRIGHT_YELLOW, BLOCK, colors::RESET),
                Some(s) if s.has_error() => print!("{}{}{}", colors::BRIGHT_RED, BLOCK, colors::RESET),
                Some(s) if s.is_deleted() => print!("{}{}{}", colors::BRIGHT_CYAN, BLOCK, colors::RESET),
                Some(_) => print!("{}{}{}", colors::BRIGHT_WHITE, BLOCK, colors::RESET),
                None => print!("{}{}{}", colors::DARK_WHITE, EMPTY, colors::RESET),
            }
        }
        println!();
    }

    print!("   ");
    for track in &tracks {
        print!("{}", track.cylinder % 10);
    }
    println!();
}

fn print_hex_dump(data: &[u8], max_bytes: usize) {
    let len = data.len().min(max_bytes);

    for (i, chunk) in data[..len].chunks(16).enumerate() {
        print!("{:04X}: ", i * 16);

        for (j, byte) in chunk.iter().enumerate() {
            print!("{:02X} ", byte);
            if j == 7 {
                print!(" ");
            }
        }

        // Pad if less than 16 bytes
        for j in chunk.len()..16 {
            print!("   ");
            if j == 7 {
                print!(" ");
            }
        }

        print!(" |");
        for byte in chunk {
            let c = if *byte >= 32 && *byte < 127 { *byte as char } else { '.' };
            print!("{}", c);
        }
        println!("|");
    }

    if data.len() > max_bytes {
        println!("... ({} more bytes)", data.len() - max_bytes);
    }
}

fn parse_hex_or_dec(s: &str) -> Option<u8> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn find_lowest_sector_id(disk: &Disk, cylinder: u8, head: u8) -> Option<u8> {
    disk.track(cylinder, head)?.sectors().iter().map(|s| s.id.sector).min()
}

fn disassemble_z80(data: &[u8], origin: u16) {
    let mut slice: &[u8] = data;
    let mut offset = 0usize;

    while !slice.is_empty() {
        let start_len = slice.len();
        let address = origin.wrapping_add(offset as u16);

        match Instruction::decode_one(&mut slice) {
            Ok(instruction) => {
                let consumed = start_len - slice.len();
                let bytes: Vec<String> = data[offset..offset + consumed]
                    .iter()
                    .map(|b| format!("{:02X}", b))
                    .collect();
                println!("{:04X}  {:<12} {}", address, bytes.join(" "), instruction);
                offset += consumed;
            }
            Err(_) => {
                // Invalid or truncated instruction - show as data byte
                let byte = data[offset];
                println!("{:04X}  {:02X}           DB {:02X}h", address, byte, byte);
                offset += 1;
                slice = &data[offset..];
            }
        }
    }
}
