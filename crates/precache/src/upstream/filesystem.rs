//! Filesystem-backed upstream client.
//!
//! Serves a local directory tree as the upstream object store. Useful for
//! development and tests; production deployments plug in a real gateway
//! behind the same trait.

use crate::upstream::{ProgressFn, UpstreamClient, UpstreamError, UpstreamResult};
use async_trait::async_trait;
use irobot_core::ObjectMetadata;
use md5::{Digest, Md5};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Streaming read/copy buffer size (64 KiB).
const IO_CHUNK_SIZE: usize = 64 * 1024;

/// Upstream client reading from a local directory tree.
pub struct FilesystemUpstream {
    root: PathBuf,
}

impl FilesystemUpstream {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Resolve an upstream path against the root, rejecting traversal.
    fn resolve(&self, path: &str) -> UpstreamResult<PathBuf> {
        let relative = path.trim_start_matches('/');
        for component in Path::new(relative).components() {
            match component {
                std::path::Component::Normal(_) => {}
                _ => return Err(UpstreamError::Forbidden(path.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }

    fn map_io(path: &str, e: std::io::Error) -> UpstreamError {
        match e.kind() {
            ErrorKind::NotFound => UpstreamError::NotFound(path.to_string()),
            ErrorKind::PermissionDenied => UpstreamError::Forbidden(path.to_string()),
            _ => UpstreamError::Io(e),
        }
    }
}

#[async_trait]
impl UpstreamClient for FilesystemUpstream {
    async fn fetch_metadata(&self, path: &str) -> UpstreamResult<ObjectMetadata> {
        let source = self.resolve(path)?;
        let stat = fs::metadata(&source)
            .await
            .map_err(|e| Self::map_io(path, e))?;
        if !stat.is_file() {
            return Err(UpstreamError::NotFound(path.to_string()));
        }

        // Whole-file MD5, streamed
        let mut file = fs::File::open(&source)
            .await
            .map_err(|e| Self::map_io(path, e))?;
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; IO_CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await.map_err(|e| Self::map_io(path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        let modified = stat
            .modified()
            .map(OffsetDateTime::from)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let created = stat
            .created()
            .map(OffsetDateTime::from)
            .unwrap_or(modified);

        Ok(ObjectMetadata {
            checksum: format!("{:x}", hasher.finalize()),
            size: stat.len(),
            created,
            modified,
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
        let source = self.resolve(path)?;
        let mut reader = fs::File::open(&source)
            .await
            .map_err(|e| Self::map_io(path, e))?;
        let mut writer = fs::File::create(dst).await?;

        let mut buf = vec![0u8; IO_CHUNK_SIZE];
        loop {
            if cancel.is_cancelled() {
                return Err(UpstreamError::Cancelled);
            }
            let n = reader.read(&mut buf).await.map_err(|e| Self::map_io(path, e))?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            on_bytes(n as u64);
        }

        writer.flush().await?;
        Ok(())
    }
}
