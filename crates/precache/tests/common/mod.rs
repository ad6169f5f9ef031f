//! Common test utilities: a programmable in-memory upstream and a precache
//! harness on temporary directories.

use async_trait::async_trait;
use irobot_core::ObjectMetadata;
use irobot_core::config::{AppConfig, PrecacheConfig};
use irobot_precache::upstream::{ProgressFn, UpstreamClient, UpstreamError, UpstreamResult};
use irobot_precache::{Precache, PrecacheResult};
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// In-memory upstream with failure injection.
#[derive(Default)]
pub struct MockUpstream {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    pub metadata_fetches: AtomicUsize,
    pub data_fetches: AtomicUsize,
    corrupt_next: AtomicBool,
    corrupt_always: AtomicBool,
    fetch_delay: Mutex<Duration>,
}

impl MockUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), bytes.into());
    }

    /// Serve corrupted bytes (same length, flipped first byte) on the next
    /// data fetch only.
    pub fn corrupt_next_fetch(&self) {
        self.corrupt_next.store(true, Ordering::SeqCst);
    }

    /// Serve corrupted bytes on every data fetch.
    pub fn corrupt_every_fetch(&self) {
        self.corrupt_always.store(true, Ordering::SeqCst);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    fn bytes_for(&self, path: &str) -> UpstreamResult<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| UpstreamError::NotFound(path.to_string()))
    }
}

#[async_trait]
impl UpstreamClient for MockUpstream {
    async fn fetch_metadata(&self, path: &str) -> UpstreamResult<ObjectMetadata> {
        self.metadata_fetches.fetch_add(1, Ordering::SeqCst);
        let bytes = self.bytes_for(path)?;
        Ok(ObjectMetadata {
            checksum: format!("{:x}", Md5::digest(&bytes)),
            size: bytes.len() as u64,
            created: OffsetDateTime::UNIX_EPOCH,
            modified: OffsetDateTime::UNIX_EPOCH + Duration::from_secs(bytes.len() as u64),
            avus: Vec::new(),
        })
    }

    async fn fetch_data(
        &self,
        path: &str,
        dst: &Path,
        cancel: CancellationToken,
        on_bytes: ProgressFn,
    ) -> UpstreamResult<()> {
        self.data_fetches.fetch_add(1, Ordering::SeqCst);

        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if cancel.is_cancelled() {
            return Err(UpstreamError::Cancelled);
        }

        let mut bytes = self.bytes_for(path)?;
        let corrupt = self.corrupt_always.load(Ordering::SeqCst)
            || self.corrupt_next.swap(false, Ordering::SeqCst);
        if corrupt && !bytes.is_empty() {
            bytes[0] ^= 0xff;
        }

        tokio::fs::write(dst, &bytes).await?;
        on_bytes(bytes.len() as u64);
        Ok(())
    }
}

/// A precache on temporary directories with a mock upstream.
pub struct TestPrecache {
    pub precache: Precache,
    pub upstream: Arc<MockUpstream>,
    pub config: PrecacheConfig,
    _temp: TempDir,
}

impl TestPrecache {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Build with modified precache settings. The tracking index is kept
    /// outside the precache so capacity tests see exact commitments.
    pub async fn with_config<F>(modify: F) -> Self
    where
        F: FnOnce(&mut PrecacheConfig),
    {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig::for_testing(temp.path().join("precache"), temp.path())
            .precache;
        config.index = temp.path().join("index.db");
        modify(&mut config);

        let upstream = MockUpstream::new();
        let precache = Precache::start(config.clone(), upstream.clone(), 4)
            .await
            .expect("precache start");

        Self {
            precache,
            upstream,
            config,
            _temp: temp,
        }
    }

    /// Reopen the precache on the same directories, as after a restart.
    pub async fn restart(&mut self) -> PrecacheResult<()> {
        self.precache.shutdown().await;
        let fresh = Precache::start(self.config.clone(), self.upstream.clone(), 4).await?;
        self.precache = fresh;
        Ok(())
    }
}
