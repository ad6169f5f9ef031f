//! Upstream gateway: the opaque fetcher for data and metadata.
//!
//! The precache treats the upstream store as an external collaborator behind
//! [`UpstreamClient`]. The [`UpstreamGateway`] wraps a client with the shared
//! connection semaphore, so every fetch (metadata or data) holds one of the
//! configured `max_connections` permits for its duration.

pub mod filesystem;

pub use filesystem::FilesystemUpstream;

use async_trait::async_trait;
use irobot_core::ObjectMetadata;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Upstream failure kinds.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("not found on upstream: {0}")]
    NotFound(String),

    #[error("upstream denied access: {0}")]
    Forbidden(String),

    #[error("transient upstream error: {0}")]
    Transient(String),

    #[error("upstream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream fetch cancelled")]
    Cancelled,
}

/// Result type for upstream operations.
pub type UpstreamResult<T> = std::result::Result<T, UpstreamError>;

/// Per-chunk progress callback invoked with the number of bytes just read.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// A client for one upstream object store.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Fetch the attribute/value/unit and filesystem metadata of a data
    /// object.
    async fn fetch_metadata(&self, path: &str) -> UpstreamResult<ObjectMetadata>;

    /// Stream a data object into `dst`, invoking `on_bytes` per chunk and
    /// polling `cancel` at chunk boundaries.
    async fn fetch_data(
        &self,
        path: &str,
        dst: &Path,
        cancel: CancellationToken,
        on_bytes: ProgressFn,
    ) -> UpstreamResult<()>;
}

/// Connection-bounded front to an [`UpstreamClient`].
pub struct UpstreamGateway {
    client: Arc<dyn UpstreamClient>,
    permits: Arc<Semaphore>,
    active: AtomicUsize,
}

impl UpstreamGateway {
    pub fn new(client: Arc<dyn UpstreamClient>, max_connections: usize) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(max_connections)),
            active: AtomicUsize::new(0),
        }
    }

    /// Upstream connections currently in use.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub async fn fetch_metadata(&self, path: &str) -> UpstreamResult<ObjectMetadata> {
        let _permit = self.acquire().await?;
        let guard = ActiveGuard::enter(&self.active);
        let result = self.client.fetch_metadata(path).await;
        drop(guard);
        result
    }

    pub async fn fetch_data(
        &self,
        path: &str,
        dst: &Path,
        cancel: CancellationToken,
        on_bytes: ProgressFn,
    ) -> UpstreamResult<()> {
        let _permit = self.acquire().await?;
        let guard = ActiveGuard::enter(&self.active);
        let result = self.client.fetch_data(path, dst, cancel, on_bytes).await;
        drop(guard);
        result
    }

    async fn acquire(&self) -> UpstreamResult<tokio::sync::SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| UpstreamError::Transient("connection pool closed".to_string()))
    }
}

/// Keeps the active-connection gauge honest on every exit path.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
