/*!
# unifloppy

A floppy disk preservation toolkit: flux capture from USB floppy
controllers, software clock recovery, decoding of FM, MFM, GCR and their
variants, filesystem access, and conversion between disk image formats.

## Features

- Flux capture and write-back through Greaseweazle, KryoFlux,
  SuperCard Pro, FluxEngine, FC5025 and IEC drive backends, plus a mock
  drive for testing
- Adaptive PLL with presets, multi-revolution fusion and weak-bit
  detection
- Track drivers for IBM PC, Amiga, Commodore, Apple II, Macintosh, DEC
  RX02, Victor 9000 and North Star layouts
- Read-only filesystems: FAT, AmigaDOS, CP/M, CBM DOS, ProDOS, DOS 3.3,
  HFS, Acorn DFS, TRSDOS
- Image formats from raw sector dumps up to SCP, KryoFlux, A2R, WOZ,
  HFE, IPF and DSK
- Sessions that record every recovery override for reproducible re-reads

## Quick Start

```rust,no_run
use unifloppy::api;

// Open an image, probing the container
let image = api::open_image("workbench.adf", None)?;

// Read a sector
let boot = api::read_sector(&image, 0, 0, 0)?;
println!("{:02X?}", &boot[..4]);

// List the root directory through the detected filesystem
for entry in api::list_dir(&image, "/")? {
    println!("{}: {} bytes", entry.name, entry.size);
}

// Convert to another container
api::convert("workbench.adf", "workbench.hfe", "auto")?;
# Ok::<(), unifloppy::FloppyError>(())
```

Reading a disk from a controller runs on a worker thread:

```rust,no_run
use unifloppy::{api, profile, CancelToken, Params};

let device = api::open_device(&Params::default())?;
let pc = profile::profile("pc-1440k")?;
let job = api::start_read(&device, Some(pc), CancelToken::new(), &Params::for_profile(pc), None)?;
while !job.is_finished() {
    for event in job.events().drain() {
        println!("{:?}", event);
    }
    std::thread::sleep(std::time::Duration::from_millis(100));
}
let (disk, session) = job.wait();
println!("{} tracks, session {}", disk?.track_count(), session.id);
# Ok::<(), unifloppy::FloppyError>(())
```

## Modules

- `hw`: controller backends and the device trait
- `flux`: flux streams and the capture containers
- `pll`: clock recovery into bitstreams
- `encoding`: FM, MFM, GCR and M2FM bit codecs with CRCs
- `track`: sector layouts per platform
- `disk`: the in-memory disk model
- `fs`: read-only filesystem drivers
- `image`: image container codecs
- `recovery`: multi-pass track reading
- `writer`: write-back with precompensation and verification
- `session`: parameters, progress, cancellation and persisted sessions
- `api`: the operations a host calls
*/

/// Analysis reports and copy protection detection
pub mod analysis;
/// Public operations
pub mod api;
/// Boot sector detection
pub mod boot;
/// Disk model: geometry, tracks, sectors
pub mod disk;
/// Bit-level encodings and CRCs
pub mod encoding;
/// Error types and Result alias
pub mod error;
/// FDC (Floppy Disk Controller) status codes
pub mod fdc;
/// Flux streams and capture containers
pub mod flux;
/// Filesystem drivers
pub mod fs;
/// Controller backends
pub mod hw;
/// Image containers
pub mod image;
/// Bounds-checked binary reading and writing
pub mod io;
/// Clock recovery
pub mod pll;
/// Platform profiles
pub mod profile;
/// Multi-pass track recovery
pub mod recovery;
/// Sessions, parameters and progress reporting
pub mod session;
/// Track drivers
pub mod track;
/// Disk writing and verification
pub mod writer;

// Re-export common types
pub use analysis::{AnalysisReport, ProtectionResult, TrackAnalysis};
pub use boot::BootDetection;
pub use disk::{Disk, DiskBuilder, Geometry, Sector, SectorId, Track, TrackOverride, TrackStatus};
pub use encoding::Encoding;
pub use error::{ErrorKind, FloppyError, Result, Warning};
pub use flux::FluxStream;
pub use fs::{DirEntry, FsInfo, Volume};
pub use hw::{Capabilities, DeviceInfo, FluxDevice, SharedDevice};
pub use image::{Image, ImageKind, ParseOptions};
pub use pll::{Bitstream, PllConfig};
pub use profile::{Platform, PlatformProfile};
pub use recovery::RecoveryConfig;
pub use session::{CancelToken, Operation, Outcome, Params, Progress, ProgressEvent, ProgressQueue, Session};
pub use writer::{PrecompConfig, Report, WriteConfig};
