//! The precache manager: admission, lookup, refetch and deletion of
//! entities, and the public surface consumed by the HTTP layer.

use crate::checksummer;
use crate::entity::{Entity, EntityHandle, SlotStatuses};
use crate::error::{PrecacheError, PrecacheResult};
use crate::eta::{self, Eta};
use crate::pool::{Job, JobHandle, JobOutcome, WorkerPool};
use crate::rates::{Channel, RateTracker};
use crate::upstream::{ProgressFn, UpstreamClient, UpstreamGateway};
use irobot_core::config::PrecacheConfig;
use irobot_core::{Datatype, ObjectMetadata, Status};
use irobot_index::{IndexError, ProductionRates, TrackingIndex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How `open` treats the precache contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Use the cached entity, admitting it first if absent.
    Existing,
    /// Refetch if the upstream metadata has changed.
    ForceRefetch,
    /// Admit the entity but do not start fetching its data.
    MetadataOnly,
}

/// The result of an `open` call.
#[derive(Debug)]
pub struct Opened {
    pub handle: EntityHandle,
    /// Whether this call started (re)fetching the object.
    pub refetched: bool,
}

/// One row of the precache manifest.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub path: String,
    pub availability: SlotStatuses,
    pub last_accessed: OffsetDateTime,
    pub contention: u32,
}

/// Global precache status.
#[derive(Debug, Clone)]
pub struct PrecacheStatus {
    pub commitment: u64,
    pub rates: ProductionRates,
    pub active_downloads: usize,
    pub active_connections: usize,
    pub total_requests: u64,
    pub bytes_fetched: u64,
    pub started_at: OffsetDateTime,
}

pub(crate) struct PrecacheInner {
    pub(crate) config: PrecacheConfig,
    pub(crate) index: TrackingIndex,
    pub(crate) gateway: UpstreamGateway,
    /// The set of live entities, keyed by upstream path. Short-held mutex:
    /// upstream fetches never run under it.
    pub(crate) entities: tokio::sync::Mutex<HashMap<String, Arc<Entity>>>,
    /// At-most-one in-flight job per (entity, datatype).
    pub(crate) in_flight: std::sync::Mutex<HashMap<(i64, Datatype), JobHandle>>,
    pub(crate) fetch_pool: WorkerPool,
    pub(crate) checksum_pool: WorkerPool,
    pub(crate) rates: RateTracker,
    /// Exclusive lock serialising capacity eviction and the temporal sweep.
    /// Lock order is entities -> eviction -> index; never acquire them the
    /// other way round.
    pub(crate) eviction_lock: tokio::sync::Mutex<()>,
    pub(crate) started_at: OffsetDateTime,
    pub(crate) total_requests: AtomicU64,
    pub(crate) bytes_fetched: AtomicU64,
}

/// High-level precache management interface.
#[derive(Clone)]
pub struct Precache {
    pub(crate) inner: Arc<PrecacheInner>,
}

impl Precache {
    /// Start the precache: open and repair the tracking index, reconcile the
    /// on-disk state, then spawn the maintenance tasks.
    pub async fn start(
        config: PrecacheConfig,
        client: Arc<dyn UpstreamClient>,
        max_connections: usize,
    ) -> PrecacheResult<Self> {
        tracing::info!(location = %config.location.display(), "starting precache");
        fs::create_dir_all(&config.location).await?;

        let index =
            TrackingIndex::open(config.index_path(), config.index_in_precache()).await?;

        let inner = Arc::new(PrecacheInner {
            gateway: UpstreamGateway::new(client, max_connections),
            fetch_pool: WorkerPool::new("fetch", max_connections),
            checksum_pool: WorkerPool::new("checksum", config.checksum_workers()),
            rates: RateTracker::new(),
            entities: tokio::sync::Mutex::new(HashMap::new()),
            in_flight: std::sync::Mutex::new(HashMap::new()),
            eviction_lock: tokio::sync::Mutex::new(()),
            started_at: OffsetDateTime::now_utc(),
            total_requests: AtomicU64::new(0),
            bytes_fetched: AtomicU64::new(0),
            config,
            index,
        });

        let precache = Self { inner };
        precache.recover().await?;
        precache.inner.rates.refresh(&precache.inner.index).await?;
        precache.spawn_maintenance();
        Ok(precache)
    }

    /// Startup repair: reset slots interrupted mid-work, drop index rows
    /// whose directory is gone, remove directories the index does not know,
    /// then compact. Afterwards no entity is in Started state and every
    /// surviving directory is tracked.
    async fn recover(&self) -> PrecacheResult<()> {
        let inner = &self.inner;

        for slot in inner.index.repair_interrupted().await? {
            let dir = inner.config.location.join(&slot.precache_dir);
            for artifact in ["data", "checksums"] {
                match fs::remove_file(dir.join(artifact)).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let mut entities = inner.entities.lock().await;
        let mut tracked_dirs = Vec::new();
        for row in inner.index.all_entities().await? {
            let dir = inner.config.location.join(&row.precache_dir);
            if !dir.is_dir() {
                tracing::warn!(path = %row.upstream_path, "directory missing, dropping index row");
                inner.index.delete_entity(row.id).await?;
                continue;
            }

            let metadata: ObjectMetadata = match fs::read(dir.join("metadata")).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        tracing::warn!(path = %row.upstream_path, error = %e, "unreadable metadata sidecar, dropping entity");
                        inner.index.delete_entity(row.id).await?;
                        let _ = fs::remove_dir_all(&dir).await;
                        continue;
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %row.upstream_path, error = %e, "metadata sidecar missing, dropping entity");
                    inner.index.delete_entity(row.id).await?;
                    let _ = fs::remove_dir_all(&dir).await;
                    continue;
                }
            };

            let current = inner.index.current_status(row.id).await?;
            let entity = Arc::new(Entity::new(
                row.id,
                row.upstream_path.clone(),
                dir.clone(),
                metadata,
                SlotStatuses {
                    data: current.data.status,
                    metadata: current.metadata.status,
                    checksums: current.checksums.status,
                },
            ));
            tracked_dirs.push(dir);
            entities.insert(row.upstream_path, entity);
        }
        drop(entities);

        // Orphaned directories (interrupted sweeps, stale tombstones)
        let mut listing = fs::read_dir(&inner.config.location).await?;
        while let Some(entry) = listing.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if !tracked_dirs.contains(&path) {
                tracing::warn!(dir = %path.display(), "removing orphaned precache directory");
                let _ = fs::remove_dir_all(&path).await;
            }
        }

        inner.index.vacuum().await?;
        Ok(())
    }

    /// Open a data object, admitting it into the precache if necessary.
    ///
    /// The returned handle pins the entity against eviction until dropped.
    pub async fn open(&self, path: &str, mode: OpenMode) -> PrecacheResult<Opened> {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
        match mode {
            OpenMode::Existing => self.open_existing(path, true).await,
            OpenMode::MetadataOnly => self.open_existing(path, false).await,
            OpenMode::ForceRefetch => self.open_refetch(path).await,
        }
    }

    /// Release a handle. Dropping it has the same effect; this spelling is
    /// for call sites that want the release to be visible.
    pub fn release(&self, handle: EntityHandle) {
        drop(handle);
    }

    async fn open_existing(&self, path: &str, with_jobs: bool) -> PrecacheResult<Opened> {
        if let Some(opened) = self.open_cached(path, with_jobs).await? {
            return Ok(opened);
        }

        // Not cached: fetch metadata outside any lock to avoid head-of-line
        // blocking, then commit.
        let metadata = self.inner.gateway.fetch_metadata(path).await?;
        self.admit(path, metadata, with_jobs).await
    }

    async fn open_cached(&self, path: &str, with_jobs: bool) -> PrecacheResult<Option<Opened>> {
        let entity = {
            let entities = self.inner.entities.lock().await;
            entities.get(path).cloned()
        };
        let Some(entity) = entity else {
            return Ok(None);
        };

        self.inner.index.touch(entity.id).await?;
        if with_jobs {
            self.ensure_progress(&entity).await?;
        }

        let sizes = self.inner.index.sizes(entity.id).await?;
        let handle = EntityHandle::acquire(entity.clone(), entity.statuses(), sizes);
        Ok(Some(Opened {
            handle,
            refetched: false,
        }))
    }

    /// Restart work on an entity whose pipeline stalled: a Failed slot is
    /// reset on open, a Queued slot with no in-flight job (metadata-only
    /// admissions, startup leftovers) gets its job submitted.
    async fn ensure_progress(&self, entity: &Arc<Entity>) -> PrecacheResult<()> {
        let statuses = entity.statuses();

        if statuses.data == Status::Failed || statuses.checksums == Status::Failed {
            self.reset_entity(entity).await?;
            Self::submit_fetch(&self.inner, entity.clone())?;
            return Ok(());
        }

        if statuses.data == Status::Queued && !self.job_in_flight(entity.id, Datatype::Data) {
            Self::submit_fetch(&self.inner, entity.clone())?;
        } else if statuses.data == Status::Finished
            && statuses.checksums == Status::Queued
            && !self.job_in_flight(entity.id, Datatype::Checksums)
        {
            Self::submit_checksum(&self.inner, entity.clone())?;
        }
        Ok(())
    }

    fn job_in_flight(&self, id: i64, datatype: Datatype) -> bool {
        self.inner
            .in_flight
            .lock()
            .expect("in-flight lock")
            .contains_key(&(id, datatype))
    }

    /// Remove on-disk data/checksum artifacts, then reset the index rows and
    /// re-record the sizes the slots will have once refetched.
    async fn reset_entity(&self, entity: &Arc<Entity>) -> PrecacheResult<()> {
        Self::reset_entity_inner(&self.inner, entity).await
    }

    async fn reset_entity_inner(
        inner: &Arc<PrecacheInner>,
        entity: &Arc<Entity>,
    ) -> PrecacheResult<()> {
        // Artifacts first, so an interrupted reset leaves rows claiming less
        // than is on disk, never more
        for artifact in [entity.data_path(), entity.checksums_path()] {
            match fs::remove_file(&artifact).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        inner.index.reset(entity.id).await?;
        let metadata = entity.metadata();
        inner
            .index
            .set_size(entity.id, Datatype::Data, metadata.size)
            .await?;
        inner
            .index
            .set_size(
                entity.id,
                Datatype::Checksums,
                checksummer::checksum_file_size(metadata.size, inner.config.chunk_size),
            )
            .await?;

        entity.set_status(Datatype::Data, Status::Queued);
        entity.set_status(Datatype::Checksums, Status::Queued);
        Ok(())
    }

    /// Admission: reserve space (evicting if allowed), create the entity
    /// directory, seed the tracking rows, persist the metadata sidecar and
    /// kick off the fetch pipeline.
    async fn admit(
        &self,
        path: &str,
        metadata: ObjectMetadata,
        with_jobs: bool,
    ) -> PrecacheResult<Opened> {
        let inner = &self.inner;
        let sidecar = metadata.to_sidecar_bytes();
        let checksum_size =
            checksummer::checksum_file_size(metadata.size, inner.config.chunk_size);
        let required = metadata.size + sidecar.len() as u64 + checksum_size;

        let mut entities = inner.entities.lock().await;

        // Another request may have admitted the entity while we were at the
        // upstream; the map is authoritative
        if let Some(existing) = entities.get(path).cloned() {
            drop(entities);
            inner.index.touch(existing.id).await?;
            let sizes = inner.index.sizes(existing.id).await?;
            let handle = EntityHandle::acquire(existing.clone(), existing.statuses(), sizes);
            return Ok(Opened {
                handle,
                refetched: false,
            });
        }

        let _eviction = inner.eviction_lock.lock().await;
        if let Some(limit) = inner.config.size.limit() {
            let commitment = inner.index.commitment().await?;
            if commitment + required > limit {
                let needed = commitment + required - limit;
                self.free_space(&mut entities, needed, required).await?;
            }
        }

        let dir_name = Uuid::new_v4().simple().to_string();
        let dir = inner.config.location.join(&dir_name);
        fs::create_dir_all(&dir).await?;

        let id = inner.index.upsert_entity(path, &dir_name).await?;
        inner.index.set_size(id, Datatype::Data, metadata.size).await?;
        inner
            .index
            .set_size(id, Datatype::Metadata, sidecar.len() as u64)
            .await?;
        inner
            .index
            .set_size(id, Datatype::Checksums, checksum_size)
            .await?;
        inner.index.set_checksum(id, &metadata.checksum).await?;

        write_atomically(&dir.join("metadata"), &sidecar).await?;
        inner
            .index
            .log_status(id, Datatype::Metadata, Status::Finished)
            .await?;

        let entity = Arc::new(Entity::new(
            id,
            path.to_string(),
            dir,
            metadata,
            SlotStatuses {
                data: Status::Queued,
                metadata: Status::Finished,
                checksums: Status::Queued,
            },
        ));
        entities.insert(path.to_string(), entity.clone());
        drop(entities);

        tracing::info!(path, id, bytes = required, "admitted data object");

        if with_jobs {
            Self::submit_fetch(inner, entity.clone())?;
        }

        let sizes = inner.index.sizes(id).await?;
        let handle = EntityHandle::acquire(entity.clone(), entity.statuses(), sizes);
        Ok(Opened {
            handle,
            refetched: with_jobs,
        })
    }

    /// Force refetch: refetch only when the upstream metadata has changed.
    /// A changed, uncontended entity is dropped and re-admitted under a
    /// fresh directory.
    async fn open_refetch(&self, path: &str) -> PrecacheResult<Opened> {
        let inner = &self.inner;
        let fresh = inner.gateway.fetch_metadata(path).await?;

        let entity = {
            let entities = inner.entities.lock().await;
            entities.get(path).cloned()
        };

        if let Some(entity) = entity {
            if !entity.metadata().differs(&fresh) {
                inner.index.touch(entity.id).await?;
                let sizes = inner.index.sizes(entity.id).await?;
                let handle = EntityHandle::acquire(entity.clone(), entity.statuses(), sizes);
                return Ok(Opened {
                    handle,
                    refetched: false,
                });
            }

            if entity.contention() > 0
                || self.job_in_flight(entity.id, Datatype::Data)
                || self.job_in_flight(entity.id, Datatype::Checksums)
            {
                return Err(PrecacheError::InUse(path.to_string()));
            }

            tracing::info!(path, "upstream metadata changed, refetching");
            let mut entities = inner.entities.lock().await;
            // Re-check under the lock: a reader may have arrived meanwhile
            if entity.contention() > 0 {
                return Err(PrecacheError::InUse(path.to_string()));
            }
            let _eviction = inner.eviction_lock.lock().await;
            self.remove_entity(&mut entities, &entity).await?;
        }

        let opened = self.admit(path, fresh, true).await?;
        Ok(Opened {
            refetched: true,
            ..opened
        })
    }

    /// Delete one entity. Fails when the entity is contended or a job for it
    /// is in flight.
    pub async fn delete(&self, path: &str) -> PrecacheResult<()> {
        let inner = &self.inner;
        let mut entities = inner.entities.lock().await;
        let entity = entities
            .get(path)
            .cloned()
            .ok_or_else(|| PrecacheError::NotFound(path.to_string()))?;

        if entity.contention() > 0
            || self.job_in_flight(entity.id, Datatype::Data)
            || self.job_in_flight(entity.id, Datatype::Checksums)
        {
            return Err(PrecacheError::InUse(path.to_string()));
        }

        let _eviction = inner.eviction_lock.lock().await;
        self.remove_entity(&mut entities, &entity).await?;
        tracing::info!(path, "deleted data object");
        Ok(())
    }

    /// ETA for a datatype of an entity, `None` when no rate is known.
    pub async fn eta(&self, id: i64, datatype: Datatype) -> Option<Eta> {
        let inner = &self.inner;
        let entity = self.entity_by_id(id).await?;
        let now = OffsetDateTime::now_utc();

        match datatype {
            Datatype::Metadata => None,
            Datatype::Data => self.data_eta(&entity, now),
            Datatype::Checksums => {
                if entity.status(Datatype::Checksums) == Status::Finished {
                    return Some(Eta {
                        expected: now,
                        stderr_secs: 0.0,
                    });
                }
                // The checksum pipeline is ordered after data: its ETA uses
                // the data ETA as its base time
                let base = self.data_eta(&entity, now)?;
                let rate = inner.rates.get(Channel::Checksum)?;
                let own = eta::estimate(
                    &inner.checksum_pool.snapshot(),
                    rate,
                    id,
                    entity.metadata().size,
                    base.expected,
                )?;
                Some(Eta {
                    expected: own.expected,
                    stderr_secs: (base.stderr_secs.powi(2) + own.stderr_secs.powi(2)).sqrt(),
                })
            }
        }
    }

    fn data_eta(&self, entity: &Arc<Entity>, now: OffsetDateTime) -> Option<Eta> {
        if entity.status(Datatype::Data) == Status::Finished {
            return Some(Eta {
                expected: now,
                stderr_secs: 0.0,
            });
        }
        let rate = self.inner.rates.get(Channel::Fetch)?;
        eta::estimate(
            &self.inner.fetch_pool.snapshot(),
            rate,
            entity.id,
            entity.metadata().size,
            now,
        )
    }

    /// Snapshot of every cached entity.
    pub async fn manifest(&self) -> PrecacheResult<Vec<ManifestEntry>> {
        let rows = self.inner.index.all_entities().await?;
        let entities = self.inner.entities.lock().await;

        let mut manifest = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(entity) = entities.get(&row.upstream_path) else {
                continue;
            };
            manifest.push(ManifestEntry {
                path: row.upstream_path,
                availability: entity.statuses(),
                last_accessed: row.last_access,
                contention: entity.contention(),
            });
        }
        Ok(manifest)
    }

    /// Global operational counters.
    pub async fn status(&self) -> PrecacheResult<PrecacheStatus> {
        let inner = &self.inner;
        Ok(PrecacheStatus {
            commitment: inner.index.commitment().await?,
            rates: inner.rates.snapshot(),
            active_downloads: inner.fetch_pool.active_jobs(),
            active_connections: inner.gateway.active_connections(),
            total_requests: inner.total_requests.load(Ordering::Relaxed),
            bytes_fetched: inner.bytes_fetched.load(Ordering::Relaxed),
            started_at: inner.started_at,
        })
    }

    /// Read the chunk table of an entity's checksum sidecar.
    pub async fn chunk_table(
        &self,
        handle: &EntityHandle,
    ) -> PrecacheResult<Vec<checksummer::ChunkChecksum>> {
        Ok(checksummer::read_sidecar(&handle.checksums_path()).await?)
    }

    /// Cancel in-flight work and stop accepting jobs.
    pub async fn shutdown(&self) {
        let handles: Vec<JobHandle> = {
            let in_flight = self.inner.in_flight.lock().expect("in-flight lock");
            in_flight.values().cloned().collect()
        };
        for handle in handles {
            handle.cancel();
        }
        self.inner.fetch_pool.shutdown();
        self.inner.checksum_pool.shutdown();
    }

    pub(crate) async fn entity_by_id(&self, id: i64) -> Option<Arc<Entity>> {
        lookup_entity(&self.inner, id).await
    }

    // ------------------------------------------------------------------
    // Worker pipeline
    // ------------------------------------------------------------------

    /// Submit the data fetch for an entity. A second submission while one is
    /// in flight is a no-op: this is what makes concurrent opens of the same
    /// path fetch once.
    pub(crate) fn submit_fetch(
        inner: &Arc<PrecacheInner>,
        entity: Arc<Entity>,
    ) -> PrecacheResult<()> {
        let key = (entity.id, Datatype::Data);
        let mut in_flight = inner.in_flight.lock().expect("in-flight lock");
        if in_flight.contains_key(&key) {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let id = entity.id;
        let bytes = entity.metadata().size;
        let path = entity.upstream_path.clone();
        let data_path = entity.data_path();
        let weak = Arc::downgrade(inner);

        let work = {
            let cancel = cancel.clone();
            let weak = weak.clone();
            Box::pin(async move {
                // Jobs hold the entity id, not the entity: re-resolve through
                // the manager, which may have evicted it meanwhile
                let Some(inner) = weak.upgrade() else {
                    return Err(PrecacheError::Cancelled);
                };
                let Some(entity) = lookup_entity(&inner, id).await else {
                    return Err(PrecacheError::Cancelled);
                };

                record_status(&inner, id, Datatype::Data, Status::Started).await;
                entity.set_status(Datatype::Data, Status::Started);

                let on_bytes: ProgressFn = {
                    let weak = weak.clone();
                    Arc::new(move |n| {
                        if let Some(inner) = weak.upgrade() {
                            inner.bytes_fetched.fetch_add(n, Ordering::Relaxed);
                        }
                    })
                };

                inner
                    .gateway
                    .fetch_data(&path, &data_path, cancel, on_bytes)
                    .await?;
                Ok(())
            })
        };

        let on_complete: crate::pool::CompletionFn =
            Box::new(move |outcome| Box::pin(Self::fetch_completed(weak, id, outcome)));

        let handle = inner.fetch_pool.submit(Job {
            entity_id: id,
            datatype: Datatype::Data,
            bytes,
            cancel,
            work,
            on_complete,
        })?;
        in_flight.insert(key, handle);
        Ok(())
    }

    async fn fetch_completed(weak: Weak<PrecacheInner>, id: i64, outcome: JobOutcome) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner
            .in_flight
            .lock()
            .expect("in-flight lock")
            .remove(&(id, Datatype::Data));
        let Some(entity) = lookup_entity(&inner, id).await else {
            return;
        };

        match outcome {
            JobOutcome::Finished => {
                record_status(&inner, id, Datatype::Data, Status::Finished).await;
                entity.set_status(Datatype::Data, Status::Finished);
                let _ = inner.rates.refresh(&inner.index).await;
                tracing::info!(path = %entity.upstream_path, "data fetch finished");

                if let Err(e) = Self::submit_checksum(&inner, entity) {
                    tracing::error!(id, error = %e, "could not submit checksum job");
                }
            }
            JobOutcome::Failed(e) => {
                tracing::error!(path = %entity.upstream_path, error = %e, "data fetch failed");
                record_status(&inner, id, Datatype::Data, Status::Failed).await;
                entity.set_status(Datatype::Data, Status::Failed);
            }
            JobOutcome::Cancelled => {
                tracing::debug!(path = %entity.upstream_path, "data fetch cancelled");
            }
        }
    }

    /// Submit the checksum job for an entity whose data has landed.
    pub(crate) fn submit_checksum(
        inner: &Arc<PrecacheInner>,
        entity: Arc<Entity>,
    ) -> PrecacheResult<()> {
        let key = (entity.id, Datatype::Checksums);
        let mut in_flight = inner.in_flight.lock().expect("in-flight lock");
        if in_flight.contains_key(&key) {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let id = entity.id;
        let bytes = entity.metadata().size;
        let chunk_size = inner.config.chunk_size;
        let weak = Arc::downgrade(inner);

        let work = {
            let cancel = cancel.clone();
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return Err(PrecacheError::Cancelled);
                };
                let Some(entity) = lookup_entity(&inner, id).await else {
                    return Err(PrecacheError::Cancelled);
                };

                record_status(&inner, id, Datatype::Checksums, Status::Started).await;
                entity.set_status(Datatype::Checksums, Status::Started);

                let computed = checksummer::compute(
                    &entity.data_path(),
                    &entity.checksums_path(),
                    chunk_size,
                    &cancel,
                )
                .await?;

                let expected = entity.metadata().checksum;
                if computed != expected {
                    return Err(PrecacheError::ChecksumMismatch {
                        expected,
                        actual: computed,
                    });
                }
                Ok(())
            })
        };

        let on_complete: crate::pool::CompletionFn =
            Box::new(move |outcome| Box::pin(Self::checksum_completed(weak, id, outcome)));

        let handle = inner.checksum_pool.submit(Job {
            entity_id: id,
            datatype: Datatype::Checksums,
            bytes,
            cancel,
            work,
            on_complete,
        })?;
        in_flight.insert(key, handle);
        Ok(())
    }

    async fn checksum_completed(weak: Weak<PrecacheInner>, id: i64, outcome: JobOutcome) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner
            .in_flight
            .lock()
            .expect("in-flight lock")
            .remove(&(id, Datatype::Checksums));
        let Some(entity) = lookup_entity(&inner, id).await else {
            return;
        };

        match outcome {
            JobOutcome::Finished => {
                record_status(&inner, id, Datatype::Checksums, Status::Finished).await;
                entity.set_status(Datatype::Checksums, Status::Finished);
                entity.clear_mismatches();
                let _ = inner.rates.refresh(&inner.index).await;
                tracing::info!(path = %entity.upstream_path, "checksumming finished");
            }
            JobOutcome::Failed(PrecacheError::ChecksumMismatch { expected, actual }) => {
                let attempts = entity.record_mismatch();
                tracing::warn!(
                    path = %entity.upstream_path,
                    expected,
                    actual,
                    attempts,
                    "whole-file checksum mismatch"
                );

                if attempts <= inner.config.checksum_retries {
                    match Self::reset_entity_inner(&inner, &entity).await {
                        Ok(()) => {
                            if let Err(e) = Self::submit_fetch(&inner, entity) {
                                tracing::error!(id, error = %e, "could not resubmit fetch after mismatch");
                            }
                        }
                        Err(e) => {
                            tracing::error!(id, error = %e, "mismatch reset failed");
                            record_status(&inner, id, Datatype::Checksums, Status::Failed).await;
                            entity.set_status(Datatype::Checksums, Status::Failed);
                        }
                    }
                } else {
                    tracing::error!(
                        path = %entity.upstream_path,
                        "checksum mismatch persists after retry, marking failed"
                    );
                    record_status(&inner, id, Datatype::Checksums, Status::Failed).await;
                    entity.set_status(Datatype::Checksums, Status::Failed);
                }
            }
            JobOutcome::Failed(e) => {
                tracing::error!(path = %entity.upstream_path, error = %e, "checksumming failed");
                record_status(&inner, id, Datatype::Checksums, Status::Failed).await;
                entity.set_status(Datatype::Checksums, Status::Failed);
            }
            JobOutcome::Cancelled => {
                tracing::debug!(path = %entity.upstream_path, "checksumming cancelled");
            }
        }
    }
}

pub(crate) async fn lookup_entity(inner: &Arc<PrecacheInner>, id: i64) -> Option<Arc<Entity>> {
    let entities = inner.entities.lock().await;
    entities.values().find(|e| e.id == id).cloned()
}

/// Record a status transition from a worker callback. Index write failures
/// are fatal: the supervisor restarts the process and startup repair sorts
/// out the partial state. Transition conflicts are merely logged.
pub(crate) async fn record_status(
    inner: &Arc<PrecacheInner>,
    id: i64,
    datatype: Datatype,
    status: Status,
) {
    match inner.index.log_status(id, datatype, status).await {
        Ok(()) => {}
        Err(IndexError::InvalidTransition { datatype, from, to }) => {
            tracing::warn!(id, %datatype, %from, %to, "dropping conflicting status transition");
        }
        Err(IndexError::Sqlx(e))
            if e.as_database_error()
                .is_some_and(|db| db.is_foreign_key_violation()) =>
        {
            // The entity was deleted between job start and this write
            tracing::debug!(id, %datatype, "entity gone, dropping status transition");
        }
        Err(e) => panic!("tracking index write failed: {e}"),
    }
}

/// Write a file atomically via temp-and-rename.
pub(crate) async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let temp: PathBuf = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    let mut file = fs::File::create(&temp).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    drop(file);
    fs::rename(&temp, path).await
}
