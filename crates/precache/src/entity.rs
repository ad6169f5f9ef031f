//! In-memory entity state: per-slot status machine, readiness events and
//! contention accounting.

use irobot_core::{Datatype, ObjectMetadata, Status};
use irobot_index::EntitySizes;
use std::path::PathBuf;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::watch;

/// Current status across the three datatype slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatuses {
    pub data: Status,
    pub metadata: Status,
    pub checksums: Status,
}

/// One cached data object.
///
/// The entity mirrors the tracking index's current status through watch
/// channels so readers can await readiness; the index remains the durable
/// source of truth. The contention counter guards the entity against
/// eviction and deletion while handles are live.
#[derive(Debug)]
pub struct Entity {
    pub id: i64,
    pub upstream_path: String,
    pub dir: PathBuf,
    metadata: RwLock<ObjectMetadata>,
    contention: AtomicU32,
    mismatch_retries: AtomicU32,
    data: watch::Sender<Status>,
    metadata_slot: watch::Sender<Status>,
    checksums: watch::Sender<Status>,
}

impl Entity {
    pub fn new(
        id: i64,
        upstream_path: String,
        dir: PathBuf,
        metadata: ObjectMetadata,
        statuses: SlotStatuses,
    ) -> Self {
        Self {
            id,
            upstream_path,
            dir,
            metadata: RwLock::new(metadata),
            contention: AtomicU32::new(0),
            mismatch_retries: AtomicU32::new(0),
            data: watch::Sender::new(statuses.data),
            metadata_slot: watch::Sender::new(statuses.metadata),
            checksums: watch::Sender::new(statuses.checksums),
        }
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir.join("data")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join("metadata")
    }

    pub fn checksums_path(&self) -> PathBuf {
        self.dir.join("checksums")
    }

    fn slot(&self, datatype: Datatype) -> &watch::Sender<Status> {
        match datatype {
            Datatype::Data => &self.data,
            Datatype::Metadata => &self.metadata_slot,
            Datatype::Checksums => &self.checksums,
        }
    }

    pub fn status(&self, datatype: Datatype) -> Status {
        *self.slot(datatype).borrow()
    }

    pub fn statuses(&self) -> SlotStatuses {
        SlotStatuses {
            data: self.status(Datatype::Data),
            metadata: self.status(Datatype::Metadata),
            checksums: self.status(Datatype::Checksums),
        }
    }

    pub fn set_status(&self, datatype: Datatype, status: Status) {
        self.slot(datatype).send_replace(status);
    }

    pub fn subscribe(&self, datatype: Datatype) -> watch::Receiver<Status> {
        self.slot(datatype).subscribe()
    }

    /// Await a slot reaching a terminal state (Finished or Failed); callers
    /// bound the wait with their own deadline.
    pub async fn wait_terminal(&self, datatype: Datatype) -> Status {
        let mut rx = self.subscribe(datatype);
        match rx
            .wait_for(|s| matches!(s, Status::Finished | Status::Failed))
            .await
        {
            Ok(status) => *status,
            Err(_) => Status::Unknown,
        }
    }

    pub fn metadata(&self) -> ObjectMetadata {
        self.metadata.read().expect("entity metadata lock").clone()
    }

    pub fn set_metadata(&self, metadata: ObjectMetadata) {
        *self.metadata.write().expect("entity metadata lock") = metadata;
    }

    pub fn contention(&self) -> u32 {
        self.contention.load(Ordering::SeqCst)
    }

    pub fn acquire(&self) {
        self.contention.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release(&self) {
        let previous = self.contention.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "contention underflow");
    }

    /// Bump the mismatch retry count, returning the new total.
    pub fn record_mismatch(&self) -> u32 {
        self.mismatch_retries.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn clear_mismatches(&self) {
        self.mismatch_retries.store(0, Ordering::SeqCst);
    }
}

/// A live reference to an entity, handed out by the manager.
///
/// Holding a handle pins the entity: it cannot be evicted or deleted until
/// every handle is gone. Dropping the handle releases the contention, so
/// error paths release automatically.
#[derive(Debug)]
pub struct EntityHandle {
    entity: std::sync::Arc<Entity>,
    /// Slot statuses observed at open time.
    pub status: SlotStatuses,
    /// Recorded artifact sizes at open time.
    pub sizes: EntitySizes,
}

impl EntityHandle {
    pub(crate) fn acquire(
        entity: std::sync::Arc<Entity>,
        status: SlotStatuses,
        sizes: EntitySizes,
    ) -> Self {
        entity.acquire();
        Self {
            entity,
            status,
            sizes,
        }
    }

    pub fn id(&self) -> i64 {
        self.entity.id
    }

    pub fn upstream_path(&self) -> &str {
        &self.entity.upstream_path
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.entity.dir
    }

    pub fn data_path(&self) -> PathBuf {
        self.entity.data_path()
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.entity.metadata_path()
    }

    pub fn checksums_path(&self) -> PathBuf {
        self.entity.checksums_path()
    }

    pub fn metadata(&self) -> ObjectMetadata {
        self.entity.metadata()
    }

    /// Live (not open-time) status of a slot.
    pub fn current_status(&self, datatype: Datatype) -> Status {
        self.entity.status(datatype)
    }

    /// Await a slot reaching Finished or Failed.
    pub async fn wait_terminal(&self, datatype: Datatype) -> Status {
        self.entity.wait_terminal(datatype).await
    }
}

impl Drop for EntityHandle {
    fn drop(&mut self) {
        self.entity.release();
    }
}
