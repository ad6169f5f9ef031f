//! Probabilistic ETA estimation from the queue state.
//!
//! For an entity on one channel, the estimate decomposes into: the shortest
//! remaining duration among running jobs (when a worker frees up), the queue
//! ahead of the entity divided across the channel's workers, and the entity's
//! own transfer time. Each term's uncertainty propagates from the rate's
//! standard error; terms sum, errors sum in quadrature.

use crate::pool::QueueSnapshot;
use irobot_index::ProductionRate;
use time::OffsetDateTime;

/// An estimated completion time with its standard error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Eta {
    pub expected: OffsetDateTime,
    pub stderr_secs: f64,
}

impl Eta {
    /// Render as the `iRobot-ETA` header value:
    /// `<ISO8601 UTC> +/- <integer seconds>`.
    pub fn to_header_value(&self) -> String {
        let stamp = self
            .expected
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| self.expected.unix_timestamp().to_string());
        format!("{} +/- {}", stamp, self.stderr_secs.round() as i64)
    }
}

/// Estimate completion of `entity_id` (payload `entity_bytes`) on the channel
/// described by `snapshot`, measuring from `base`.
///
/// Returns `None` when no rate is known for the channel or the rate is
/// degenerate.
pub fn estimate(
    snapshot: &QueueSnapshot,
    rate: ProductionRate,
    entity_id: i64,
    entity_bytes: u64,
    base: OffsetDateTime,
) -> Option<Eta> {
    if rate.mean <= 0.0 {
        return None;
    }
    // d(size/rate)/d(rate) = -size/rate^2, so each term's error contribution
    // is size/mean^2 * stderr
    let term_err = |bytes: f64| bytes / (rate.mean * rate.mean) * rate.stderr;

    // Already running: completion is start + size/rate
    if let Some(running) = snapshot.running.iter().find(|job| job.entity_id == entity_id) {
        let duration = running.bytes as f64 / rate.mean;
        return Some(Eta {
            expected: running.started_at + time::Duration::seconds_f64(duration),
            stderr_secs: term_err(running.bytes as f64),
        });
    }

    // Wait for the first worker to free up
    let (wait, wait_err) = snapshot
        .running
        .iter()
        .map(|job| {
            let elapsed = (base - job.started_at).as_seconds_f64().max(0.0);
            let remaining = (job.bytes as f64 / rate.mean - elapsed).max(0.0);
            (remaining, term_err(job.bytes as f64))
        })
        .min_by(|(a, _), (b, _)| a.total_cmp(b))
        .unwrap_or((0.0, 0.0));

    // Queue ahead of the entity, spread across the channel's workers
    let ahead: u64 = snapshot
        .queued
        .iter()
        .take_while(|job| job.entity_id != entity_id)
        .map(|job| job.bytes)
        .sum();
    let queue_bytes = ahead as f64 / snapshot.concurrency.max(1) as f64;
    let queue = queue_bytes / rate.mean;

    // The entity's own transfer
    let own = entity_bytes as f64 / rate.mean;

    let stderr_secs = (wait_err.powi(2)
        + term_err(queue_bytes).powi(2)
        + term_err(entity_bytes as f64).powi(2))
    .sqrt();

    Some(Eta {
        expected: base + time::Duration::seconds_f64(wait + queue + own),
        stderr_secs,
    })
}
