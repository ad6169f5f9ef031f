//! Tracking index error types.

use irobot_core::{Datatype, Status};
use thiserror::Error;

/// Tracking index error type.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("entity {0} not found")]
    NotFound(i64),

    #[error("entity already tracked: {0}")]
    AlreadyExists(String),

    #[error("{datatype} status may not move {from} -> {to}")]
    InvalidTransition {
        datatype: Datatype,
        from: Status,
        to: Status,
    },

    #[error("{datatype} size already recorded as {recorded}, refusing {offered}")]
    SizeConflict {
        datatype: Datatype,
        recorded: u64,
        offered: u64,
    },

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] irobot_core::Error),
}

/// Result type for tracking index operations.
pub type IndexResult<T> = std::result::Result<T, IndexError>;
