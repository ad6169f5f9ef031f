//! Precache error types.

use crate::checksummer::ChecksumError;
use crate::upstream::UpstreamError;
use irobot_index::IndexError;
use thiserror::Error;

/// Precache error type, projected onto HTTP statuses by the server crate.
#[derive(Debug, Error)]
pub enum PrecacheError {
    #[error("data object not found: {0}")]
    NotFound(String),

    #[error("access to data object denied: {0}")]
    Forbidden(String),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("precache cannot accommodate {required} bytes")]
    Full { required: u64 },

    #[error("data object in use: {0}")]
    InUse(String),

    #[error("checksum mismatch: upstream reports {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("worker pool is shut down")]
    PoolClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Checksum(ChecksumError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ChecksumError> for PrecacheError {
    fn from(e: ChecksumError) -> Self {
        match e {
            ChecksumError::Cancelled => Self::Cancelled,
            other => Self::Checksum(other),
        }
    }
}

impl From<UpstreamError> for PrecacheError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::NotFound(path) => Self::NotFound(path),
            UpstreamError::Forbidden(path) => Self::Forbidden(path),
            UpstreamError::Transient(reason) => Self::Upstream(reason),
            UpstreamError::Io(e) => Self::Upstream(e.to_string()),
            UpstreamError::Cancelled => Self::Cancelled,
        }
    }
}

/// Result type for precache operations.
pub type PrecacheResult<T> = std::result::Result<T, PrecacheError>;
