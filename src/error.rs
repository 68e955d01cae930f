//! Error types
//!
//! Construction-time failures are returned to the caller as [`Error`].
//! Runtime failures inside a reader thread are logged and end that thread.

use std::fmt;
use std::io;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for source and buffer construction
#[derive(Debug)]
pub enum Error {
    /// Memory for a buffer or a reader scratch area could not be reserved
    Allocation,
    /// Request disagrees with an existing base or claims a peer owned by another source
    ConfigConflict(String),
    /// None of the addresses in a listen set could be bound
    NoAddressBound(String),
    /// The base's reader thread has already exited
    BaseStopped(String),
    /// Listen specification or options are unusable
    InvalidSpec(String),
    /// Underlying I/O failure
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Allocation => write!(f, "Unable to allocate buffer memory"),
            Error::ConfigConflict(msg) => write!(f, "Configuration conflict: {}", msg),
            Error::NoAddressBound(name) => write!(f, "Failed to bind any addresses for {}", name),
            Error::BaseStopped(name) => write!(f, "Reader for {} is no longer running", name),
            Error::InvalidSpec(msg) => write!(f, "Invalid source specification: {}", msg),
            Error::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::Allocation
    }
}
