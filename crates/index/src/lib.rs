//! Durable tracking index for the iRobot precache.
//!
//! A single-writer SQLite store recording every precache entity, its
//! on-disk paths and sizes, its append-only per-datatype status history and
//! its last access time. Production rates for the ETA estimator are derived
//! from the status log.

pub mod error;
pub mod models;
pub mod store;

pub use error::{IndexError, IndexResult};
pub use models::{
    CurrentStatus, EntityRow, EntitySizes, EntityStatus, EvictionCandidate, ProductionRate,
    ProductionRates, RepairedSlot,
};
pub use store::TrackingIndex;
