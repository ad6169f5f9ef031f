//! Cache invalidation: the temporal sweep and capacity-driven eviction.
//!
//! Both run under the exclusive eviction lock and never touch an entity that
//! is contended or has a job in flight. Deletion order is tracking rows
//! first, then a rename to a tombstone, then removal. An interrupted sweep
//! can leave an orphan directory for startup repair but never a dangling row.

use crate::entity::Entity;
use crate::error::{PrecacheError, PrecacheResult};
use crate::manager::{Precache, PrecacheInner};
use irobot_core::Datatype;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::fs;

/// Tracking-index vacuum period.
const VACUUM_PERIOD: Duration = Duration::from_secs(12 * 3600);

/// Production-rate refresh period.
const RATE_REFRESH_PERIOD: Duration = Duration::from_secs(15 * 60);

impl Precache {
    /// Spawn the maintenance timers: the temporal sweep (at half the expiry
    /// limit), the index vacuum and the rate refresh. The tasks hold weak
    /// references and wind down with the precache.
    pub(crate) fn spawn_maintenance(&self) {
        if let Some(expiry) = self.inner.config.expiry.as_duration() {
            // Sweep at half the expiry limit, but never spin on a tiny one
            let period = (expiry / 2).max(Duration::from_secs(1));
            spawn_periodic("temporal-sweep", period, &self.inner, |precache| async move {
                if let Err(e) = precache.sweep_expired().await {
                    tracing::error!(error = %e, "temporal sweep failed");
                }
            });
        }

        spawn_periodic("index-vacuum", VACUUM_PERIOD, &self.inner, |precache| async move {
            if let Err(e) = precache.inner.index.vacuum().await {
                tracing::error!(error = %e, "index vacuum failed");
            }
        });

        spawn_periodic("rate-refresh", RATE_REFRESH_PERIOD, &self.inner, |precache| async move {
            if let Err(e) = precache.inner.rates.refresh(&precache.inner.index).await {
                tracing::error!(error = %e, "rate refresh failed");
            }
        });
    }

    /// Delete every unpinned entity whose last access predates the expiry
    /// limit.
    pub async fn sweep_expired(&self) -> PrecacheResult<usize> {
        let inner = &self.inner;
        if inner.config.expiry.is_unlimited() {
            return Ok(0);
        }

        let now = OffsetDateTime::now_utc();
        let mut entities = inner.entities.lock().await;
        let _eviction = inner.eviction_lock.lock().await;

        let mut swept = 0;
        for candidate in inner.index.eviction_candidates(now).await? {
            let expired = inner
                .config
                .expiry
                .expires_at(candidate.last_access)
                .is_some_and(|at| at <= now);
            if !expired {
                continue;
            }

            let Some(entity) = entities.get(&candidate.upstream_path).cloned() else {
                continue;
            };
            if entity.contention() > 0 || any_job_in_flight(inner, entity.id) {
                continue;
            }

            tracing::debug!(path = %entity.upstream_path, "expiring data object");
            self.remove_entity(&mut entities, &entity).await?;
            swept += 1;
        }
        Ok(swept)
    }

    /// Evict enough entities to free `needed` bytes, oldest first, skipping
    /// anything younger than the age threshold.
    ///
    /// All-or-nothing: if the budget cannot be met the precache is left
    /// untouched and the caller gets `Full`. Callers hold the eviction lock.
    pub(crate) async fn free_space(
        &self,
        entities: &mut HashMap<String, Arc<Entity>>,
        needed: u64,
        required: u64,
    ) -> PrecacheResult<()> {
        let inner = &self.inner;

        // An unlimited age threshold disables capacity eviction outright
        let Some(threshold) = inner.config.age_threshold.as_duration() else {
            return Err(PrecacheError::Full { required });
        };
        let cutoff = OffsetDateTime::now_utc() - threshold;

        let mut chosen = Vec::new();
        let mut freed = 0u64;
        for candidate in inner.index.eviction_candidates(cutoff).await? {
            if freed >= needed {
                break;
            }
            let Some(entity) = entities.get(&candidate.upstream_path).cloned() else {
                continue;
            };
            if entity.contention() > 0 || any_job_in_flight(inner, entity.id) {
                continue;
            }
            freed += candidate.footprint as u64;
            chosen.push(entity);
        }

        if freed < needed {
            return Err(PrecacheError::Full { required });
        }

        for entity in chosen {
            tracing::info!(path = %entity.upstream_path, "evicting data object for capacity");
            self.remove_entity(entities, &entity).await?;
        }
        Ok(())
    }

    /// Remove one entity: map entry, tracking rows, then the directory via a
    /// tombstone rename so concurrent readers holding file handles are
    /// unaffected.
    pub(crate) async fn remove_entity(
        &self,
        entities: &mut HashMap<String, Arc<Entity>>,
        entity: &Arc<Entity>,
    ) -> PrecacheResult<()> {
        entities.remove(&entity.upstream_path);
        self.inner.index.delete_entity(entity.id).await?;

        let dir = &entity.dir;
        let tombstone = dir.with_file_name(format!(
            "{}.tombstone",
            dir.file_name().and_then(|n| n.to_str()).unwrap_or("gone")
        ));
        match fs::rename(dir, &tombstone).await {
            Ok(()) => {
                if let Err(e) = fs::remove_dir_all(&tombstone).await {
                    // Startup repair clears stragglers
                    tracing::warn!(dir = %tombstone.display(), error = %e, "tombstone removal failed");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

pub(crate) fn any_job_in_flight(inner: &PrecacheInner, id: i64) -> bool {
    let in_flight = inner.in_flight.lock().expect("in-flight lock");
    in_flight.contains_key(&(id, Datatype::Data))
        || in_flight.contains_key(&(id, Datatype::Checksums))
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    inner: &Arc<PrecacheInner>,
    tick: F,
) where
    F: Fn(Precache) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer.tick().await; // the first tick fires immediately
        loop {
            timer.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            tracing::debug!(task = name, "maintenance tick");
            tick(Precache { inner }).await;
        }
    });
}
