//! Error types for zvec-core.
//!
//! Every public operation surfaces one tagged [`Error`]; the facade exposes
//! the same failures as negative integer codes grouped as
//! `-(category * 1000 + kind)` for embedders that speak return codes.

use thiserror::Error;

/// Result type alias used throughout zvec-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in zvec operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied argument is out of range or inconsistent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Dimension or element type disagrees with the index meta.
    #[error("mismatch: {0}")]
    Mismatch(String),

    /// The memory quota would be exceeded.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// A key, segment, or named entry does not exist.
    #[error("not found: {0}")]
    NoExist(String),

    /// No kernel, metric, or operation exists for the request.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A persisted container failed structural validation.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// An I/O error from the underlying storage.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The search was cancelled via its token or deadline.
    #[error("operation cancelled")]
    Cancelled,

    /// A key collided and duplicates are forbidden.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The algorithm name is reserved but not built.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the negative integer code for this error.
    ///
    /// `0` is reserved for success and never returned here.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => -1001,
            Self::Mismatch(_) => -1002,
            Self::OutOfMemory(_) => -1003,
            Self::NoExist(_) => -1004,
            Self::Unsupported(_) => -1005,
            Self::InvalidFormat(_) => -1006,
            Self::Io(_) => -1007,
            Self::Cancelled => -1008,
            Self::AlreadyExists(_) => -1009,
            Self::NotImplemented(_) => -1010,
            Self::Internal(_) => -1099,
        }
    }
}

/// Converts a `Result` into the facade's integer code convention.
#[must_use]
pub fn to_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}
