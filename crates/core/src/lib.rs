//! Core domain types and shared logic for the iRobot data-object broker.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Datatype and status enumerations for tracked precache artifacts
//! - Data-object metadata (size, checksum, timestamps, AVUs)
//! - Configuration model with human-readable size and duration grammar
//! - Byte-range model and `Range` header parsing

pub mod config;
pub mod error;
pub mod range;
pub mod types;
pub mod units;

pub use error::{Error, Result};
pub use range::ByteRange;
pub use types::{Avu, Datatype, ObjectMetadata, Status};
pub use units::{DurationLimit, SizeLimit};

/// Default checksum chunk size: 64 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Default upstream connection limit.
pub const DEFAULT_MAX_CONNECTIONS: usize = 30;
