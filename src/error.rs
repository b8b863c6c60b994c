//! Error types shared by the covariance, aggregation and caching code.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SfrError {
    /// A bin with no spaxels has no defined estimate
    #[error("spaxel bin must not be empty")]
    EmptyBin,

    #[error("unrecognised emission line {0:?}, expected \"Ha\" or \"Hb\"")]
    UnknownLine(String),

    /// Two inputs disagree on the number of pixels
    #[error("shape mismatch: expected {expected} entries, found {found}")]
    ShapeMismatch { expected: usize, found: usize },

    #[error("pixel index {index} is outside a grid of {pixels} pixels")]
    IndexOutOfRange { index: usize, pixels: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The key-value store backing the covariance cache failed
    #[error("cache storage failure for {key}: {source}")]
    Storage {
        key: String,
        source: rocksdb::Error,
    },

    /// A cached matrix exists but cannot be decoded into a valid covariance matrix
    #[error("corrupt cache entry {key}: {reason}")]
    CorruptCache { key: String, reason: String },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SfrError>;

/// Attach a path to a `std::io::Error`.
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SfrError {
    SfrError::Io {
        path: path.into(),
        source,
    }
}
