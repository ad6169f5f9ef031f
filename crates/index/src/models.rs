//! Row types mapping to the tracking index schema.

use irobot_core::Status;
use sqlx::FromRow;
use time::OffsetDateTime;

/// One tracked data object.
#[derive(Debug, Clone, FromRow)]
pub struct EntityRow {
    pub id: i64,
    pub upstream_path: String,
    pub precache_dir: String,
    /// Upstream-reported whole-file MD5, once known.
    pub checksum: Option<String>,
    pub last_access: OffsetDateTime,
}

/// The current status of one datatype slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentStatus {
    pub status: Status,
    pub timestamp: OffsetDateTime,
}

/// Current status across all three datatype slots.
#[derive(Debug, Clone, Copy)]
pub struct EntityStatus {
    pub data: CurrentStatus,
    pub metadata: CurrentStatus,
    pub checksums: CurrentStatus,
}

/// Recorded sizes across all three datatype slots; zero until known.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntitySizes {
    pub data: u64,
    pub metadata: u64,
    pub checksums: u64,
}

impl EntitySizes {
    pub fn total(&self) -> u64 {
        self.data + self.metadata + self.checksums
    }
}

/// A (entity, datatype) slot reset to Queued by startup repair.
#[derive(Debug, Clone)]
pub struct RepairedSlot {
    pub id: i64,
    pub upstream_path: String,
    pub precache_dir: String,
}

/// An entity eligible for eviction, oldest first.
#[derive(Debug, Clone, FromRow)]
pub struct EvictionCandidate {
    pub id: i64,
    pub upstream_path: String,
    pub precache_dir: String,
    /// Total recorded on-disk footprint in bytes.
    pub footprint: i64,
    pub last_access: OffsetDateTime,
}

/// A production rate estimate in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProductionRate {
    pub mean: f64,
    /// Standard error of the mean; zero with fewer than two samples.
    pub stderr: f64,
}

/// Rates for the two production channels, where known.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductionRates {
    pub fetch: Option<ProductionRate>,
    pub checksum: Option<ProductionRate>,
}
