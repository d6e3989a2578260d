//! Error types for the CP/M filesystem driver.

use thiserror::Error;

/// Errors returned by every filesystem operation.
#[derive(Error, Debug)]
pub enum CpmError {
    #[error("Unknown format: {0}")]
    UnknownFormat(String),

    #[error("Bad geometry: {0}")]
    BadGeometry(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("File already exists: {0}")]
    AlreadyExists(String),

    #[error("Illegal CP/M filename: {0}")]
    InvalidName(String),

    #[error("Device full")]
    NoSpace,

    #[error("Directory full")]
    NoDirectorySpace,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Corrupt filesystem: {0}")]
    Corrupt(String),

    #[error("Read-only: {0}")]
    ReadOnly(String),

    #[error("Invalid file handle")]
    InvalidHandle,

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for filesystem operations.
pub type CpmResult<T> = Result<T, CpmError>;
