//! Configuration types shared across crates.

use crate::units::{DurationLimit, SizeLimit, parse_human_size};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Precache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrecacheConfig {
    /// Directory holding the precache (entity directories and, by default,
    /// the tracking index).
    pub location: PathBuf,
    /// Tracking index filename; resolved relative to `location` unless
    /// absolute.
    #[serde(default = "default_index")]
    pub index: PathBuf,
    /// Total precache capacity ("unlimited" or a byte size).
    #[serde(default = "default_unlimited_size")]
    pub size: SizeLimit,
    /// Entities younger than this are never capacity-evicted. The unlimited
    /// default disables capacity eviction entirely, which is the safe
    /// anti-DoS posture: a burst of new requests can then never flush the
    /// cache.
    #[serde(default = "default_unlimited_duration")]
    pub age_threshold: DurationLimit,
    /// Entities unaccessed for this long are expired by the temporal sweep.
    #[serde(default = "default_unlimited_duration")]
    pub expiry: DurationLimit,
    /// Checksummer chunk size in bytes; also the alignment unit for range
    /// responses.
    #[serde(default = "default_chunk_size", deserialize_with = "de_byte_size")]
    pub chunk_size: u64,
    /// Checksummer worker count; 0 selects the CPU count.
    #[serde(default)]
    pub checksum_workers: usize,
    /// Fetch retries after a whole-file checksum mismatch.
    #[serde(default = "default_checksum_retries")]
    pub checksum_retries: u32,
}

impl PrecacheConfig {
    /// Absolute path of the tracking index.
    pub fn index_path(&self) -> PathBuf {
        if self.index.is_absolute() {
            self.index.clone()
        } else {
            self.location.join(&self.index)
        }
    }

    /// Whether the tracking index lives inside the precache (and therefore
    /// counts towards the commitment).
    pub fn index_in_precache(&self) -> bool {
        self.index_path().starts_with(&self.location)
    }

    /// Effective checksummer worker count.
    pub fn checksum_workers(&self) -> usize {
        if self.checksum_workers > 0 {
            self.checksum_workers
        } else {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("precache.chunk_size must be positive".to_string());
        }
        if self.index.file_name().is_none() {
            return Err("precache.index must name a file".to_string());
        }
        if let Some(limit) = self.size.limit()
            && limit < self.chunk_size
        {
            return Err(format!(
                "precache.size {} is smaller than one chunk ({})",
                limit, self.chunk_size
            ));
        }
        Ok(())
    }
}

fn default_index() -> PathBuf {
    PathBuf::from("index.db")
}

fn default_unlimited_size() -> SizeLimit {
    SizeLimit::UNLIMITED
}

fn default_unlimited_duration() -> DurationLimit {
    DurationLimit::Unlimited
}

fn default_chunk_size() -> u64 {
    crate::DEFAULT_CHUNK_SIZE
}

fn default_checksum_retries() -> u32 {
    1
}

/// Accept either an integer byte count or a suffixed size string.
fn de_byte_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Human(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Bytes(bytes) => Ok(bytes),
        Raw::Human(s) => parse_human_size(&s).map_err(de::Error::custom),
    }
}

/// Upstream gateway configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Root of the upstream object tree (filesystem backend).
    pub location: PathBuf,
    /// Concurrent upstream connection limit; also the fetch pool width.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_connections() -> usize {
    crate::DEFAULT_MAX_CONNECTIONS
}

impl UpstreamConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("upstream.max_connections must be positive".to_string());
        }
        Ok(())
    }
}

/// HTTP daemon configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpdConfig {
    /// Interface address to bind.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on.
    #[serde(default = "default_listen")]
    pub listen: u16,
    /// Per-request response deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Ordered list of authentication handlers; empty disables auth.
    #[serde(default)]
    pub authentication: Vec<String>,
    /// Credentials file for the `basic` authenticator
    /// (`user:sha256-hex` per line).
    #[serde(default)]
    pub credentials: Option<PathBuf>,
    /// How long a validated credential stays cached, in seconds.
    #[serde(default = "default_auth_cache_secs")]
    pub auth_cache_secs: u64,
}

impl HttpdConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_ms == 0 {
            return Err("httpd.timeout_ms must be positive".to_string());
        }
        for handler in &self.authentication {
            match handler.as_str() {
                "basic" => {
                    if self.credentials.is_none() {
                        return Err(
                            "httpd.authentication includes 'basic' but no credentials file is configured"
                                .to_string(),
                        );
                    }
                }
                other => return Err(format!("unknown authentication handler '{other}'")),
            }
        }
        Ok(())
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen() -> u16 {
    5000
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_auth_cache_secs() -> u64 {
    600
}

impl Default for HttpdConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            listen: default_listen(),
            timeout_ms: default_timeout_ms(),
            authentication: Vec::new(),
            credentials: None,
            auth_cache_secs: default_auth_cache_secs(),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    pub precache: PrecacheConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub httpd: HttpdConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.precache.validate()?;
        self.upstream.validate()?;
        self.httpd.validate()
    }

    /// Create a test configuration rooted at the given directories.
    ///
    /// **For testing only.** Unlimited capacity, tiny chunks, no auth.
    pub fn for_testing(precache_root: impl AsRef<Path>, upstream_root: impl AsRef<Path>) -> Self {
        Self {
            precache: PrecacheConfig {
                location: precache_root.as_ref().to_path_buf(),
                index: default_index(),
                size: SizeLimit::UNLIMITED,
                age_threshold: DurationLimit::Unlimited,
                expiry: DurationLimit::Unlimited,
                chunk_size: 1024,
                checksum_workers: 2,
                checksum_retries: 1,
            },
            upstream: UpstreamConfig {
                location: upstream_root.as_ref().to_path_buf(),
                max_connections: 4,
            },
            httpd: HttpdConfig::default(),
        }
    }
}
