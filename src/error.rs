//! Error types shared by every layer of the toolkit.

use thiserror::Error;

/// Result type alias for toolkit operations
pub type Result<T> = std::result::Result<T, FloppyError>;

/// Stable error classification surfaced through the public API.
///
/// Every [`FloppyError`] maps to exactly one kind; the string codes are
/// part of the stable interface and never change between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller supplied an out-of-range or malformed argument
    InvalidArgument,
    /// Host or device I/O failure
    Io,
    /// Requested entity (file, sector, device) does not exist
    NotFound,
    /// Input is not in the expected format
    Format,
    /// Data failed its checksum
    Crc,
    /// Operation or variant is not implemented or not supported by the device
    Unsupported,
    /// A structure was recognised but is internally inconsistent
    Corrupt,
    /// Media or device refuses the operation (e.g. write protection)
    Permission,
    /// Device did not respond in time
    Timeout,
    /// Caller cancelled the operation
    Cancelled,
    /// Bug or broken invariant inside the toolkit
    Internal,
}

impl ErrorKind {
    /// Stable string code for this kind
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "E_INVALID_ARG",
            ErrorKind::Io => "E_IO",
            ErrorKind::NotFound => "E_NOT_FOUND",
            ErrorKind::Format => "E_FORMAT",
            ErrorKind::Crc => "E_CRC",
            ErrorKind::Unsupported => "E_UNSUPPORTED",
            ErrorKind::Corrupt => "E_CORRUPT",
            ErrorKind::Permission => "E_PERMISSION",
            ErrorKind::Timeout => "E_TIMEOUT",
            ErrorKind::Cancelled => "E_CANCELLED",
            ErrorKind::Internal => "E_INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Uniform fault classes reported by hardware backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareFault {
    /// No controller or drive answered
    NoDevice,
    /// Media is write protected
    WriteProtected,
    /// No index pulse seen (no disk, or motor not spinning)
    NoIndex,
    /// Head failed to reach the requested cylinder
    SeekError,
    /// Controller stopped responding
    Timeout,
    /// Transport level failure
    Io,
    /// The controller cannot perform this operation
    NotSupported,
}

impl HardwareFault {
    /// Error kind this fault surfaces as
    pub fn kind(&self) -> ErrorKind {
        match self {
            HardwareFault::NoDevice => ErrorKind::NotFound,
            HardwareFault::WriteProtected => ErrorKind::Permission,
            HardwareFault::NoIndex => ErrorKind::Timeout,
            HardwareFault::SeekError => ErrorKind::Io,
            HardwareFault::Timeout => ErrorKind::Timeout,
            HardwareFault::Io => ErrorKind::Io,
            HardwareFault::NotSupported => ErrorKind::Unsupported,
        }
    }
}

/// Errors that can occur anywhere in the toolkit
#[derive(Debug, Error)]
pub enum FloppyError {
    /// I/O error occurred while reading or writing host files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Argument outside its documented range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid track address
    #[error("Invalid track {cylinder}.{head} (max: {max_cylinder}.{max_head})")]
    InvalidTrack {
        /// Cylinder requested
        cylinder: u8,
        /// Head requested
        head: u8,
        /// Highest cylinder present
        max_cylinder: u8,
        /// Highest head present
        max_head: u8,
    },

    /// Sector id not present on the addressed track
    #[error("Sector not found: id={sector} on cylinder {cylinder}, head {head}")]
    SectorNotFound {
        /// Cylinder
        cylinder: u8,
        /// Head
        head: u8,
        /// Sector id
        sector: u8,
    },

    /// Named entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid or unrecognised format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Parse error at specific offset
    #[error("Parse error at offset {offset}: {message}")]
    ParseError {
        /// Byte offset where error occurred
        offset: usize,
        /// Error message
        message: String,
    },

    /// Checksum mismatch
    #[error("CRC error: {0}")]
    Crc(String),

    /// Unsupported format variant or operation
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Structurally recognised but inconsistent data
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// Media refuses the operation
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Operation timed out
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Disk is full, no free space
    #[error("Disk full: no free space available")]
    DiskFull,

    /// Failure reported by a hardware backend
    #[error("{backend} error {code:#04x} ({fault:?}): {message}")]
    Hardware {
        /// Backend name
        backend: &'static str,
        /// Uniform fault class
        fault: HardwareFault,
        /// Controller-local status code
        code: u32,
        /// Human readable detail
        message: String,
    },

    /// Internal invariant violated
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FloppyError {
    /// Create a parse error with context
    pub fn parse<S: Into<String>>(offset: usize, message: S) -> Self {
        FloppyError::ParseError {
            offset,
            message: message.into(),
        }
    }

    /// Create an invalid format error
    pub fn invalid_format<S: Into<String>>(message: S) -> Self {
        FloppyError::InvalidFormat(message.into())
    }

    /// Create an invalid argument error
    pub fn invalid_arg<S: Into<String>>(message: S) -> Self {
        FloppyError::InvalidArgument(message.into())
    }

    /// Create a corrupt-structure error
    pub fn corrupt<S: Into<String>>(message: S) -> Self {
        FloppyError::Corrupt(message.into())
    }

    /// Create an unsupported error
    pub fn unsupported<S: Into<String>>(message: S) -> Self {
        FloppyError::Unsupported(message.into())
    }

    /// Create a hardware error for a backend
    pub fn hardware<S: Into<String>>(
        backend: &'static str,
        fault: HardwareFault,
        code: u32,
        message: S,
    ) -> Self {
        FloppyError::Hardware {
            backend,
            fault,
            code,
            message: message.into(),
        }
    }

    /// Stable classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            FloppyError::Io(_) => ErrorKind::Io,
            FloppyError::InvalidArgument(_) | FloppyError::InvalidTrack { .. } => {
                ErrorKind::InvalidArgument
            }
            FloppyError::SectorNotFound { .. } | FloppyError::NotFound(_) => ErrorKind::NotFound,
            FloppyError::InvalidFormat(_) | FloppyError::ParseError { .. } => ErrorKind::Format,
            FloppyError::Crc(_) => ErrorKind::Crc,
            FloppyError::Unsupported(_) => ErrorKind::Unsupported,
            FloppyError::Corrupt(_) => ErrorKind::Corrupt,
            FloppyError::Permission(_) => ErrorKind::Permission,
            FloppyError::Timeout(_) => ErrorKind::Timeout,
            FloppyError::Cancelled => ErrorKind::Cancelled,
            FloppyError::DiskFull => ErrorKind::InvalidArgument,
            FloppyError::Hardware { fault, .. } => fault.kind(),
            FloppyError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<serde_json::Error> for FloppyError {
    fn from(err: serde_json::Error) -> Self {
        FloppyError::InvalidFormat(format!("JSON: {}", err))
    }
}

/// Non-fatal anomaly recorded while parsing in lenient mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    /// Byte offset in the input where the anomaly was found
    pub offset: usize,
    /// Description
    pub message: String,
}

impl Warning {
    /// Create a new warning
    pub fn new<S: Into<String>>(offset: usize, message: S) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "offset {:#x}: {}", self.offset, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FloppyError::InvalidTrack {
            cylinder: 90,
            head: 0,
            max_cylinder: 79,
            max_head: 1,
        };
        assert_eq!(err.to_string(), "Invalid track 90.0 (max: 79.1)");
    }

    #[test]
    fn test_parse_error() {
        let err = FloppyError::parse(256, "Invalid magic bytes");
        assert_eq!(
            err.to_string(),
            "Parse error at offset 256: Invalid magic bytes"
        );
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_hardware_fault_mapping() {
        let err = FloppyError::hardware("greaseweazle", HardwareFault::WriteProtected, 6, "wrprot");
        assert_eq!(err.kind(), ErrorKind::Permission);
        let err = FloppyError::hardware("scp", HardwareFault::NoIndex, 0x11, "no index");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let err = FloppyError::hardware("fc5025", HardwareFault::NotSupported, 0, "read only");
        assert_eq!(err.kind().code(), "E_UNSUPPORTED");
    }

    #[test]
    fn test_kind_codes_are_stable() {
        assert_eq!(FloppyError::Cancelled.kind().code(), "E_CANCELLED");
        assert_eq!(FloppyError::Crc("x".into()).kind().code(), "E_CRC");
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(FloppyError::from(io).kind().code(), "E_IO");
    }
}
