//! Error types for flashpipe
//!
//! Domain-specific error types using thiserror. Each family maps to one
//! entry of the pipeline's error taxonomy ([`ErrorKind`]), which is the name
//! observers see on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Image resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// Descriptor is neither a local file nor an http(s) URL
    #[error("Unsupported image descriptor '{descriptor}'")]
    InvalidDescriptor { descriptor: String },

    /// Listing could not be fetched
    #[error("Listing '{url}' is unreachable: {error} (traversed: {})", .path.join(" -> "))]
    Unreachable {
        url: String,
        error: String,
        path: Vec<String>,
    },

    /// No image file found within the depth bound
    #[error("No image found under '{root}' within depth {max_depth} (traversed: {})", .path.join(" -> "))]
    NoMatch {
        root: String,
        max_depth: usize,
        path: Vec<String>,
    },

    /// Local image file does not exist
    #[error("Local image '{path}' does not exist")]
    MissingLocalFile { path: PathBuf },

    /// Image file exists but cannot be opened or decoded
    #[error("Image '{path}' is unreadable: {error}")]
    UnreadableImage { path: PathBuf, error: String },
}

impl ResolutionError {
    /// Listing URLs visited before the failure
    pub fn traversal(&self) -> &[String] {
        match self {
            Self::Unreachable { path, .. } | Self::NoMatch { path, .. } => path,
            _ => &[],
        }
    }
}

/// Download errors
#[derive(Error, Debug)]
pub enum TransferError {
    /// Network error (connect, timeout, dropped body)
    #[error("Network error downloading '{url}': {error}")]
    Network { url: String, error: String },

    /// Non-success HTTP status
    #[error("Server answered HTTP {status} for '{url}'")]
    HttpStatus { url: String, status: u16 },

    /// Destination disk is full
    #[error("Destination disk is full while writing '{path}'")]
    DiskFull { path: PathBuf },

    /// IO error on the destination file
    #[error("IO error for '{path}': {error}")]
    Io { path: PathBuf, error: String },

    /// Checksum verification failed
    #[error("Checksum mismatch for '{file}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// Max retries exceeded
    #[error("Download of '{url}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },
}

impl TransferError {
    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// Target validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Identifier does not match the platform's whole-disk pattern
    #[error("'{identifier}' is not a valid whole-disk identifier on {platform}")]
    InvalidIdentifier { identifier: String, platform: String },

    /// Identifier unknown to the device inventory
    #[error("Device '{identifier}' was not found among attached devices")]
    UnknownDevice { identifier: String },

    /// Device holds a system mount
    #[error("Refusing to touch '{identifier}': it holds the system mount '{mount}'")]
    SystemDisk { identifier: String, mount: String },

    /// Device reports zero size (empty reader slot)
    #[error("Device '{identifier}' reports no media")]
    NoMedia { identifier: String },

    /// Device is larger than any plausible removable target
    #[error("Refusing to touch '{identifier}': {size} bytes exceeds the {limit} byte removable-device limit")]
    TooLarge {
        identifier: String,
        size: u64,
        limit: u64,
    },

    /// Device is smaller than the image
    #[error("Device '{device}' is too small: image needs {image_size} bytes but device holds {device_size} bytes")]
    DeviceTooSmall {
        device: String,
        device_size: u64,
        image_size: u64,
    },
}

/// Privilege errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PrivilegeError {
    /// Process lacks elevated privilege for the operation
    #[error("Insufficient privilege to {operation}")]
    NotElevated { operation: String },

    /// The OS refused access to the device
    #[error("Access to '{path}' was denied")]
    AccessDenied { path: String },
}

/// Device errors (never retried)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Device node does not exist
    #[error("Device '{path}' does not exist")]
    Missing { path: String },

    /// Device is mounted or claimed by another process
    #[error("Device '{path}' is busy (mounted or opened by another process)")]
    Busy { path: String },

    /// Device vanished while being written
    #[error("Device '{path}' disappeared after {written} bytes were written")]
    Removed { path: String, written: u64 },

    /// Generic device IO error
    #[error("IO error on device '{path}': {error}")]
    Io { path: String, error: String },

    /// Boot sector is blank after writing
    #[error("Sanity check failed: the first {bytes} bytes of '{path}' are all zero")]
    BlankBootSector { path: String, bytes: usize },

    /// Device enumeration failed
    #[error("Could not enumerate devices: {0}")]
    Enumeration(String),
}

/// External tool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// Tool could not be started
    #[error("Failed to start '{tool}': {error}")]
    Spawn { tool: String, error: String },

    /// Tool exited with a non-zero status
    #[error("'{tool}' exited with status {code:?}")]
    Failed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Neither the helper nor direct writing is available
    #[error("No write strategy available: helper '{helper}' not found and direct writing is disabled")]
    NoStrategy { helper: String },
}

/// Error taxonomy name as seen by observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ResolutionError,
    TransferError,
    ValidationError,
    PrivilegeError,
    DeviceError,
    ToolError,
    TimeoutError,
    CancelledError,
    ConflictError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ResolutionError => "ResolutionError",
            Self::TransferError => "TransferError",
            Self::ValidationError => "ValidationError",
            Self::PrivilegeError => "PrivilegeError",
            Self::DeviceError => "DeviceError",
            Self::ToolError => "ToolError",
            Self::TimeoutError => "TimeoutError",
            Self::CancelledError => "CancelledError",
            Self::ConflictError => "ConflictError",
        };
        f.write_str(name)
    }
}

/// Top-level pipeline error type
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Resolution error
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// Transfer error
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Validation error
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Privilege error
    #[error(transparent)]
    Privilege(#[from] PrivilegeError),

    /// Device error
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Tool error
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Run exceeded its wall-clock budget
    #[error("Run timed out after {limit_secs}s during {stage}")]
    Timeout { stage: String, limit_secs: u64 },

    /// Observer went away
    #[error("Run cancelled during {stage}: observer disconnected")]
    Cancelled { stage: String },

    /// Another run already targets the device
    #[error("Device '{device}' is already being imaged by another run")]
    Conflict { device: String },

    /// Failure relayed from a stage child process
    #[error("{message}")]
    Stage {
        kind: ErrorKind,
        message: String,
        detail: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Taxonomy name for the wire
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Resolution(_) => ErrorKind::ResolutionError,
            Self::Transfer(_) => ErrorKind::TransferError,
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::Privilege(_) => ErrorKind::PrivilegeError,
            Self::Device(_) | Self::Io(_) => ErrorKind::DeviceError,
            Self::Tool(_) => ErrorKind::ToolError,
            Self::Timeout { .. } => ErrorKind::TimeoutError,
            Self::Cancelled { .. } => ErrorKind::CancelledError,
            Self::Conflict { .. } => ErrorKind::ConflictError,
            Self::Stage { kind, .. } => *kind,
        }
    }

    /// Verbose diagnostic payload, if any
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Stage { detail, .. } if !detail.is_empty() => Some(detail.clone()),
            Self::Tool(ToolError::Failed { stderr, .. }) if !stderr.is_empty() => {
                Some(stderr.clone())
            }
            Self::Resolution(e) if !e.traversal().is_empty() => {
                Some(format!("traversed: {}", e.traversal().join(" -> ")))
            }
            _ => None,
        }
    }

    /// Actionable remediation hint for the observer
    pub fn remedy(&self) -> Option<&'static str> {
        match self.kind() {
            ErrorKind::PrivilegeError => Some(
                "Raw device access needs elevated privilege: re-run flashpipe with sudo \
                 (Linux/macOS) or from an Administrator prompt (Windows), or install dd \
                 so the helper strategy can be used.",
            ),
            ErrorKind::ValidationError => {
                Some("Pick a removable whole-disk device from `flashpipe devices`.")
            }
            ErrorKind::DeviceError => Some(
                "Check that the card is inserted, unmounted and not opened by another program.",
            ),
            ErrorKind::ConflictError => Some("Wait for the running job on this device to finish."),
            ErrorKind::CancelledError | ErrorKind::TimeoutError => {
                Some("Outcome unknown: verify the target device manually before use.")
            }
            _ => None,
        }
    }

    /// Short message with the remediation hint appended
    ///
    /// Failures relayed from a stage child already carry their hint.
    pub fn user_message(&self) -> String {
        if matches!(self, Self::Stage { .. }) {
            return self.to_string();
        }
        match self.remedy() {
            Some(remedy) => format!("{self}. {remedy}"),
            None => self.to_string(),
        }
    }
}
