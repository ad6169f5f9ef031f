//! Precache machinery for the iRobot data-object broker.
//!
//! The precache materialises upstream data objects onto local disk: each
//! entity owns a directory holding the raw data, a JSON metadata sidecar and
//! a block-wise MD5 checksum table. The [`Precache`] manager admits, looks
//! up, refetches and deletes entities; bounded worker pools fetch and
//! checksum them; the invalidator expires and evicts them; and the ETA
//! estimator prices the queue for callers still waiting.

pub mod checksummer;
pub mod entity;
pub mod error;
pub mod eta;
mod invalidator;
pub mod manager;
pub mod pool;
pub mod rates;
pub mod upstream;

pub use entity::{Entity, EntityHandle, SlotStatuses};
pub use error::{PrecacheError, PrecacheResult};
pub use eta::Eta;
pub use manager::{ManifestEntry, OpenMode, Opened, Precache, PrecacheStatus};
pub use rates::{Channel, RateTracker};
pub use upstream::{UpstreamClient, UpstreamError, UpstreamGateway};
