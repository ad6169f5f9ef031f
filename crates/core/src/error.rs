//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid size: {0}")]
    InvalidSize(String),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("invalid datatype id: {0}")]
    InvalidDatatype(i64),

    #[error("invalid status id: {0}")]
    InvalidStatus(i64),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
