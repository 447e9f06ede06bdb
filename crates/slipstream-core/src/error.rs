//! Error taxonomy shared across the subsystems
//!
//! Validation problems are surfaced to the caller and never logged as
//! internal errors; visibility refusals map to wire codes the peer
//! understands; everything filesystem-shaped stays an [`std::io::Error`]
//! where it originates.

use std::path::PathBuf;

use thiserror::Error;

/// Bad user input to the share configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShareValidationError {
    #[error("share path must be absolute: {0:?}")]
    NotAbsolute(PathBuf),

    #[error("share path does not exist: {0:?}")]
    PathMissing(PathBuf),

    #[error("directory is already shared: {0:?}")]
    AlreadyShared(PathBuf),

    #[error("path is inside the existing share root {0:?}")]
    NestedUnderExistingRoot(PathBuf),

    #[error("path contains the existing share root {0:?}")]
    ContainsExistingRoot(PathBuf),

    #[error("virtual name {0:?} is already in use by another root in the same profile")]
    DuplicateVirtualName(String),

    #[error("a share root needs at least one profile")]
    NoProfiles,

    #[error("unknown share root: {0:?}")]
    UnknownRoot(PathBuf),
}

/// Virtual path resolution failures, returned to the requesting peer
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareError {
    #[error("file not available")]
    NotFound,

    #[error("file access denied")]
    AccessDenied,
}

impl ShareError {
    pub fn wire_code(&self) -> WireCode {
        match self {
            ShareError::NotFound => WireCode::FileNotAvailable,
            ShareError::AccessDenied => WireCode::FileAccessDenied,
        }
    }
}

/// Classification of a hashing failure; per-file, never fatal to the pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashErrorKind {
    /// I/O failure while reading the file
    Io,
    /// Content read fine but did not match the SFV expectation
    Crc,
}

impl HashErrorKind {
    /// Stable identifier used in logs and events
    pub fn as_str(&self) -> &'static str {
        match self {
            HashErrorKind::Io => "io_error",
            HashErrorKind::Crc => "crc_error",
        }
    }
}

/// Status codes sent to peers on refused requests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum WireCode {
    ProtocolGeneric = 40,
    UnknownUser = 43,
    TransferGeneric = 50,
    FileNotAvailable = 51,
    SlotsFull = 53,
    FileAccessDenied = 54,
}

impl WireCode {
    /// Human-readable text accompanying the code on the wire
    pub fn message(&self) -> &'static str {
        match self {
            WireCode::ProtocolGeneric => "Protocol error",
            WireCode::UnknownUser => "Unknown user",
            WireCode::TransferGeneric => "Unable to send file",
            WireCode::FileNotAvailable => "File Not Available",
            WireCode::SlotsFull => "All upload slots are full",
            WireCode::FileAccessDenied => "File access denied",
        }
    }
}
