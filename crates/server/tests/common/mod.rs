//! Common test utilities: a programmable mock upstream and a full test
//! server on temporary directories.

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use bytes::Bytes;
use irobot_core::ObjectMetadata;
use irobot_core::config::AppConfig;
use irobot_precache::Precache;
use irobot_precache::upstream::{ProgressFn, UpstreamClient, UpstreamError, UpstreamResult};
use irobot_server::auth::AuthChain;
use irobot_server::{AppState, create_router};
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// In-memory upstream with latency and corruption injection.
#[derive(Default)]
pub struct MockUpstream {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    pub metadata_fetches: AtomicUsize,
    pub data_fetches: AtomicUsize,
    corrupt_next: AtomicBool,
    fetch_delay: Mutex<Duration>,
    metadata_delay: Mutex<Duration>,
}

#[allow(dead_code)] // each test file compiles common/ separately
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

    pub fn corrupt_next_fetch(&self) {
        self.corrupt_next.store(true, Ordering::SeqCst);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    pub fn set_metadata_delay(&self, delay: Duration) {
        *self.metadata_delay.lock().unwrap() = delay;
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
        let delay = *self.metadata_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

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
        if self.corrupt_next.swap(false, Ordering::SeqCst) && !bytes.is_empty() {
            bytes[0] ^= 0xff;
        }

        tokio::fs::write(dst, &bytes).await?;
        on_bytes(bytes.len() as u64);
        Ok(())
    }
}

/// A full server with all dependencies on temporary directories.
pub struct TestServer {
    pub router: Router,
    pub state: AppState,
    pub upstream: Arc<MockUpstream>,
    pub temp: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with custom config modifications.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config =
            AppConfig::for_testing(temp.path().join("precache"), temp.path().join("upstream"));
        // Keep the index outside the precache so capacity tests see exact
        // commitments
        config.precache.index = temp.path().join("index.db");
        modifier(&mut config);

        let upstream = MockUpstream::new();
        let precache = Precache::start(
            config.precache.clone(),
            upstream.clone(),
            config.upstream.max_connections,
        )
        .await
        .expect("precache start");

        let auth = AuthChain::from_config(&config.httpd).expect("auth chain");
        let state = AppState::new(config, precache, auth);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            upstream,
            temp,
        }
    }
}

/// Issue one request and collect the response.
#[allow(dead_code)]
pub async fn request(
    router: &Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
) -> (StatusCode, HeaderMap, Bytes) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let response = router
        .clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body)
}

/// Poll a GET until the response carries the wanted status.
#[allow(dead_code)]
pub async fn poll_until(
    router: &Router,
    uri: &str,
    headers: &[(&str, &str)],
    wanted: StatusCode,
) -> (HeaderMap, Bytes) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let (status, response_headers, body) = request(router, "GET", uri, headers).await;
        if status == wanted {
            return (response_headers, body);
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out polling {uri} for {wanted}, last status {status}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
