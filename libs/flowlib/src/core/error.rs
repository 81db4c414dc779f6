//! Error types for flowlib
//!
//! Defines the core error types used throughout flowlib. Every kind carries a
//! stable negative integer code for hosts (and C bindings) that speak errno
//! conventions.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid packet type: {0}")]
    InvalidType(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage version mismatch: stored {stored}, declared {declared}")]
    VersionMismatch { stored: u8, declared: u8 },

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled: superseded by a later write")]
    Cancelled,

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),
}

impl FlowError {
    /// Stable negative integer code, errno-flavored.
    ///
    /// IO errors report the negated OS errno when one is available.
    pub fn code(&self) -> i32 {
        match self {
            FlowError::InvalidArgument(_) => -22,       // EINVAL
            FlowError::InvalidType(_) => -91,           // EPROTOTYPE
            FlowError::NotFound(_) => -2,               // ENOENT
            FlowError::VersionMismatch { .. } => -71,   // EPROTO
            FlowError::OutOfMemory(_) => -12,           // ENOMEM
            FlowError::Io(err) => err.raw_os_error().map(|e| -e).unwrap_or(-5), // EIO
            FlowError::Cancelled => -125,               // ECANCELED
            FlowError::Busy(_) => -16,                  // EBUSY
            FlowError::NotSupported(_) => -95,          // ENOTSUP
        }
    }
}

/// Result type that uses FlowError
pub type Result<T> = std::result::Result<T, FlowError>;
