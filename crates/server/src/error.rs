//! API error types and their HTTP projection.

use axum::Json;
use axum::http::StatusCode;
use axum::http::header::CONTENT_RANGE;
use axum::response::{IntoResponse, Response};
use irobot_precache::PrecacheError;
use serde::Serialize;

/// JSON error body attached to every 4xx/5xx response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: u16,
    pub reason: String,
    pub description: String,
}

/// API error type; the single place precache failures become HTTP statuses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no acceptable representation: {0}")]
    Unacceptable(String),

    #[error("unsatisfiable range: {description}")]
    BadRange { description: String, size: u64 },

    #[error("bad gateway: {0}")]
    Upstream(String),

    #[error("insufficient storage: {0}")]
    Full(String),

    #[error("response deadline exceeded")]
    Deadline,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unacceptable(_) => StatusCode::NOT_ACCEPTABLE,
            Self::BadRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Full(_) => StatusCode::INSUFFICIENT_STORAGE,
            Self::Deadline => StatusCode::GATEWAY_TIMEOUT,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PrecacheError> for ApiError {
    fn from(e: PrecacheError) -> Self {
        match e {
            PrecacheError::NotFound(path) => Self::NotFound(path),
            PrecacheError::Forbidden(path) => Self::Forbidden(path),
            PrecacheError::InUse(path) => Self::Conflict(path),
            PrecacheError::Full { required } => {
                Self::Full(format!("cannot accommodate {required} bytes"))
            }
            PrecacheError::Upstream(reason) => Self::Upstream(reason),
            // Mismatches that survive the retry budget surface as gateway
            // trouble: the upstream keeps contradicting itself
            PrecacheError::ChecksumMismatch { .. } => {
                Self::Upstream("upstream checksum mismatch".to_string())
            }
            PrecacheError::Cancelled => Self::Deadline,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            description: self.to_string(),
        };

        match self {
            // RFC 7233: an unsatisfiable range names the current length
            Self::BadRange { size, .. } => (
                status,
                [(CONTENT_RANGE, format!("bytes */{size}"))],
                Json(body),
            )
                .into_response(),
            _ => (status, Json(body)).into_response(),
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
