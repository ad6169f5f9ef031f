//! SQLite-backed tracking index.

use crate::error::{IndexError, IndexResult};
use crate::models::{
    CurrentStatus, EntityRow, EntitySizes, EntityStatus, EvictionCandidate, ProductionRate,
    ProductionRates, RepairedSlot,
};
use irobot_core::{Datatype, Status};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Durable, transactional record of every precache entity.
///
/// SQLite permits limited write concurrency; a single pooled connection
/// serialises all mutations, which is exactly the single-writer discipline
/// the precache requires.
pub struct TrackingIndex {
    pool: Pool<Sqlite>,
    path: PathBuf,
    in_precache: bool,
}

impl TrackingIndex {
    /// Open (creating if necessary) the tracking index at `path`.
    ///
    /// `in_precache` marks an index stored inside the precache root, whose
    /// own file size then counts towards the commitment.
    pub async fn open(path: impl AsRef<Path>, in_precache: bool) -> IndexResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        tracing::info!(path = %path.display(), "tracking index ready");

        Ok(Self {
            pool,
            path,
            in_precache,
        })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Track a new entity, seeding a Queued status for each datatype and a
    /// fresh last-access time.
    pub async fn upsert_entity(&self, upstream_path: &str, precache_dir: &str) -> IndexResult<i64> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO data_objects (upstream_path, precache_dir, last_access) VALUES (?, ?, ?)",
        )
        .bind(upstream_path)
        .bind(precache_dir)
        .bind(now)
        .execute(&mut *tx)
        .await;

        let id = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(e) if is_unique_violation(&e) => {
                return Err(IndexError::AlreadyExists(upstream_path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        for datatype in Datatype::ALL {
            sqlx::query(
                "INSERT INTO status_log (data_object, datatype, status, timestamp) VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(datatype.as_i64())
            .bind(Status::Queued.as_i64())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    /// Record the size of a datatype slot. Sizes are written once; a second
    /// write with a differing value is rejected.
    pub async fn set_size(&self, id: i64, datatype: Datatype, bytes: u64) -> IndexResult<()> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT size FROM data_sizes WHERE data_object = ? AND datatype = ?")
                .bind(id)
                .bind(datatype.as_i64())
                .fetch_optional(&mut *tx)
                .await?;

        match existing {
            Some(recorded) if recorded as u64 != bytes => {
                return Err(IndexError::SizeConflict {
                    datatype,
                    recorded: recorded as u64,
                    offered: bytes,
                });
            }
            Some(_) => return Ok(()),
            None => {}
        }

        sqlx::query("INSERT INTO data_sizes (data_object, datatype, size) VALUES (?, ?, ?)")
            .bind(id)
            .bind(datatype.as_i64())
            .bind(bytes as i64)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Append a status transition, rejecting anything that is not strictly
    /// increasing. Resets go through [`TrackingIndex::reset`] instead.
    pub async fn log_status(&self, id: i64, datatype: Datatype, status: Status) -> IndexResult<()> {
        let mut tx = self.pool.begin().await?;

        if let Some(current) = current_status_in(&mut tx, id, datatype).await?
            && status <= current.status
        {
            return Err(IndexError::InvalidTransition {
                datatype,
                from: current.status,
                to: status,
            });
        }

        sqlx::query(
            "INSERT INTO status_log (data_object, datatype, status, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(datatype.as_i64())
        .bind(status.as_i64())
        .bind(OffsetDateTime::now_utc())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Reset the data and checksum slots back to Queued, dropping their
    /// progressed status history and recorded sizes. Metadata is untouched.
    ///
    /// Callers must first remove the on-disk artifacts the erased statuses
    /// referenced.
    pub async fn reset(&self, id: i64) -> IndexResult<()> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM status_log WHERE data_object = ? AND datatype IN (1, 3) AND status >= ?",
        )
        .bind(id)
        .bind(Status::Started.as_i64())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM data_sizes WHERE data_object = ? AND datatype IN (1, 3)")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for datatype in [Datatype::Data, Datatype::Checksums] {
            sqlx::query(
                "INSERT INTO status_log (data_object, datatype, status, timestamp) VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(datatype.as_i64())
            .bind(Status::Queued.as_i64())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Update the entity's last access time to now.
    pub async fn touch(&self, id: i64) -> IndexResult<()> {
        let done = sqlx::query("UPDATE data_objects SET last_access = ? WHERE id = ?")
            .bind(OffsetDateTime::now_utc())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(IndexError::NotFound(id));
        }
        Ok(())
    }

    /// Record the upstream-reported whole-file checksum.
    pub async fn set_checksum(&self, id: i64, checksum: &str) -> IndexResult<()> {
        let done = sqlx::query("UPDATE data_objects SET checksum = ? WHERE id = ?")
            .bind(checksum)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(IndexError::NotFound(id));
        }
        Ok(())
    }

    /// Derived per-slot current status view.
    pub async fn current_status(&self, id: i64) -> IndexResult<EntityStatus> {
        let mut tx = self.pool.begin().await?;
        let data = current_status_in(&mut tx, id, Datatype::Data).await?;
        let metadata = current_status_in(&mut tx, id, Datatype::Metadata).await?;
        let checksums = current_status_in(&mut tx, id, Datatype::Checksums).await?;
        tx.commit().await?;

        let fallback = CurrentStatus {
            status: Status::Unknown,
            timestamp: OffsetDateTime::UNIX_EPOCH,
        };
        Ok(EntityStatus {
            data: data.unwrap_or(fallback),
            metadata: metadata.unwrap_or(fallback),
            checksums: checksums.unwrap_or(fallback),
        })
    }

    /// Recorded sizes for an entity; unknown slots report zero.
    pub async fn sizes(&self, id: i64) -> IndexResult<EntitySizes> {
        let rows: Vec<(i64, i64)> =
            sqlx::query_as("SELECT datatype, size FROM data_sizes WHERE data_object = ?")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        let mut sizes = EntitySizes::default();
        for (datatype, size) in rows {
            match Datatype::from_i64(datatype)? {
                Datatype::Data => sizes.data = size as u64,
                Datatype::Metadata => sizes.metadata = size as u64,
                Datatype::Checksums => sizes.checksums = size as u64,
            }
        }
        Ok(sizes)
    }

    /// Total bytes accounted to entities, plus the index's own size when it
    /// lives inside the precache.
    ///
    /// This is the recorded footprint rather than the physical size on disk
    /// (modulo device block size), so it is generally a slight underestimate.
    pub async fn commitment(&self) -> IndexResult<u64> {
        let committed: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(size), 0) FROM data_sizes")
            .fetch_one(&self.pool)
            .await?;

        let db_size = if self.in_precache {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        Ok(committed as u64 + db_size)
    }

    pub async fn entity_by_path(&self, upstream_path: &str) -> IndexResult<Option<EntityRow>> {
        let row =
            sqlx::query_as::<_, EntityRow>("SELECT * FROM data_objects WHERE upstream_path = ?")
                .bind(upstream_path)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    pub async fn entity(&self, id: i64) -> IndexResult<Option<EntityRow>> {
        let row = sqlx::query_as::<_, EntityRow>("SELECT * FROM data_objects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn all_entities(&self) -> IndexResult<Vec<EntityRow>> {
        let rows = sqlx::query_as::<_, EntityRow>("SELECT * FROM data_objects ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Entities last accessed at or before `cutoff`, oldest first, with their
    /// recorded footprints. In-flight and contended entities are the caller's
    /// concern; contention lives in memory, not in the index.
    pub async fn eviction_candidates(
        &self,
        cutoff: OffsetDateTime,
    ) -> IndexResult<Vec<EvictionCandidate>> {
        let rows = sqlx::query_as::<_, EvictionCandidate>(
            r#"
            SELECT o.id, o.upstream_path, o.precache_dir,
                   COALESCE(SUM(z.size), 0) AS footprint,
                   o.last_access
            FROM data_objects o
            LEFT JOIN data_sizes z ON z.data_object = o.id
            WHERE o.last_access <= ?
            GROUP BY o.id
            ORDER BY o.last_access ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Remove an entity and (by cascade) its status history and sizes.
    pub async fn delete_entity(&self, id: i64) -> IndexResult<()> {
        let done = sqlx::query("DELETE FROM data_objects WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(IndexError::NotFound(id));
        }
        Ok(())
    }

    /// Production rates for the fetch and checksum channels, derived from
    /// Started -> Finished pairs in the status log joined with the data size.
    pub async fn production_rates(&self) -> IndexResult<ProductionRates> {
        Ok(ProductionRates {
            fetch: self.channel_rate(Datatype::Data).await?,
            checksum: self.channel_rate(Datatype::Checksums).await?,
        })
    }

    async fn channel_rate(&self, datatype: Datatype) -> IndexResult<Option<ProductionRate>> {
        let rows: Vec<(OffsetDateTime, Option<OffsetDateTime>, i64)> = sqlx::query_as(
            r#"
            SELECT f.timestamp AS finished_at,
                   (SELECT s.timestamp FROM status_log s
                     WHERE s.data_object = f.data_object AND s.datatype = f.datatype
                       AND s.status = 2 AND s.id < f.id
                     ORDER BY s.id DESC LIMIT 1) AS started_at,
                   z.size AS bytes
            FROM status_log f
            JOIN data_sizes z ON z.data_object = f.data_object AND z.datatype = 1
            WHERE f.status = 3 AND f.datatype = ?
            "#,
        )
        .bind(datatype.as_i64())
        .fetch_all(&self.pool)
        .await?;

        let samples = rows.into_iter().filter_map(|(finished, started, bytes)| {
            let started = started?;
            let secs = (finished - started).as_seconds_f64().max(1e-3);
            Some(bytes as f64 / secs)
        });

        Ok(summarise(samples))
    }

    /// Reset every entity left with a Started slot by a crash mid-work.
    ///
    /// Returns the affected entities so the caller can delete the on-disk
    /// artifacts those statuses referenced.
    pub async fn repair_interrupted(&self) -> IndexResult<Vec<RepairedSlot>> {
        let rows: Vec<(i64, String, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT o.id, o.upstream_path, o.precache_dir
            FROM data_objects o
            JOIN status_log s1 ON s1.data_object = o.id
            WHERE s1.status = 2
              AND NOT EXISTS (
                SELECT 1 FROM status_log s2
                WHERE s2.data_object = s1.data_object AND s2.datatype = s1.datatype
                  AND (s2.status > s1.status OR (s2.status = s1.status AND s2.id > s1.id))
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut repaired = Vec::with_capacity(rows.len());
        for (id, upstream_path, precache_dir) in rows {
            tracing::warn!(
                id,
                upstream_path = %upstream_path,
                "entity was mid-work at shutdown, resetting to queued"
            );
            self.reset(id).await?;
            repaired.push(RepairedSlot {
                id,
                upstream_path,
                precache_dir,
            });
        }
        Ok(repaired)
    }

    /// Compact the index.
    pub async fn vacuum(&self) -> IndexResult<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }
}

async fn current_status_in(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    id: i64,
    datatype: Datatype,
) -> IndexResult<Option<CurrentStatus>> {
    let row: Option<(i64, OffsetDateTime)> = sqlx::query_as(
        r#"
        SELECT status, timestamp FROM status_log
        WHERE data_object = ? AND datatype = ?
        ORDER BY status DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(id)
    .bind(datatype.as_i64())
    .fetch_optional(&mut **tx)
    .await?;

    row.map(|(status, timestamp)| {
        Ok(CurrentStatus {
            status: Status::from_i64(status)?,
            timestamp,
        })
    })
    .transpose()
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

/// Reduce rate samples to (mean, standard error) with Welford's algorithm.
fn summarise(samples: impl Iterator<Item = f64>) -> Option<ProductionRate> {
    let mut n = 0u64;
    let mut mean = 0.0f64;
    let mut m2 = 0.0f64;

    for sample in samples {
        n += 1;
        let delta = sample - mean;
        mean += delta / n as f64;
        m2 += delta * (sample - mean);
    }

    match n {
        0 => None,
        1 => Some(ProductionRate { mean, stderr: 0.0 }),
        _ => Some(ProductionRate {
            mean,
            stderr: (m2 / (n as f64 * (n - 1) as f64)).sqrt(),
        }),
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS data_objects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    upstream_path TEXT NOT NULL UNIQUE,
    precache_dir TEXT NOT NULL UNIQUE,
    checksum TEXT,
    last_access TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_data_objects_last_access ON data_objects(last_access);

CREATE TABLE IF NOT EXISTS status_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    data_object INTEGER NOT NULL REFERENCES data_objects(id) ON DELETE CASCADE,
    datatype INTEGER NOT NULL CHECK (datatype IN (1, 2, 3)),
    status INTEGER NOT NULL CHECK (status BETWEEN 1 AND 5),
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_status_log_current ON status_log(data_object, datatype, status DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_status_log_channel ON status_log(datatype, status);

CREATE TABLE IF NOT EXISTS data_sizes (
    data_object INTEGER NOT NULL REFERENCES data_objects(id) ON DELETE CASCADE,
    datatype INTEGER NOT NULL CHECK (datatype IN (1, 2, 3)),
    size INTEGER NOT NULL CHECK (size >= 0),
    PRIMARY KEY (data_object, datatype)
);
"#;
