//! Administrative endpoints: /status, /config and /manifest.

use crate::error::ApiResult;
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::ALLOW;
use axum::response::{IntoResponse, Response};
use irobot_core::Status;
use irobot_index::ProductionRate;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Serialize)]
pub struct RateBody {
    rate: f64,
    stderr: f64,
}

impl From<ProductionRate> for RateBody {
    fn from(rate: ProductionRate) -> Self {
        Self {
            rate: rate.mean,
            stderr: rate.stderr,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusBody {
    commitment: u64,
    production_rates: RatesBody,
    active_downloads: usize,
    active_connections: usize,
    total_requests: u64,
    bytes_fetched: u64,
    since: String,
}

#[derive(Debug, Serialize)]
pub struct RatesBody {
    fetch: Option<RateBody>,
    checksum: Option<RateBody>,
}

/// GET /status: global precache counters.
pub async fn status(State(state): State<AppState>) -> ApiResult<Json<StatusBody>> {
    let status = state
        .precache
        .status()
        .await
        .map_err(|e| crate::error::ApiError::Internal(e.to_string()))?;

    Ok(Json(StatusBody {
        commitment: status.commitment,
        production_rates: RatesBody {
            fetch: status.rates.fetch.map(RateBody::from),
            checksum: status.rates.checksum.map(RateBody::from),
        },
        active_downloads: status.active_downloads,
        active_connections: status.active_connections,
        total_requests: status.total_requests,
        bytes_fetched: status.bytes_fetched,
        since: rfc3339(status.started_at),
    }))
}

/// GET /config: echo of the active configuration.
pub async fn config_echo(State(state): State<AppState>) -> Response {
    Json(state.config.as_ref().clone()).into_response()
}

#[derive(Debug, Serialize)]
pub struct AvailabilityBody {
    data: bool,
    metadata: bool,
    checksums: bool,
}

#[derive(Debug, Serialize)]
pub struct ManifestEntryBody {
    path: String,
    availability: AvailabilityBody,
    last_accessed: String,
    contention: u32,
}

/// GET /manifest: every cached entity and its availability.
pub async fn manifest(State(state): State<AppState>) -> ApiResult<Json<Vec<ManifestEntryBody>>> {
    let manifest = state
        .precache
        .manifest()
        .await
        .map_err(|e| crate::error::ApiError::Internal(e.to_string()))?;

    Ok(Json(
        manifest
            .into_iter()
            .map(|entry| ManifestEntryBody {
                path: entry.path,
                availability: AvailabilityBody {
                    data: entry.availability.data == Status::Finished,
                    metadata: entry.availability.metadata == Status::Finished,
                    checksums: entry.availability.checksums == Status::Finished,
                },
                last_accessed: rfc3339(entry.last_accessed),
                contention: entry.contention,
            })
            .collect(),
    ))
}

/// OPTIONS for the admin endpoints.
pub async fn admin_options() -> Response {
    (StatusCode::NO_CONTENT, [(ALLOW, "GET, HEAD, OPTIONS")]).into_response()
}

fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}
