use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Configuration for the transport-layer caching middleware.
///
/// All durations and integer limits must be strictly positive; `validate`
/// rejects anything else before a store is allowed to exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default time-to-live for admitted responses.
    pub default_ttl: Duration,
    /// Per-content-type TTL overrides, keyed by normalized content type.
    pub content_type_ttls: HashMap<String, Duration>,
    /// Upper bound on store memory, in megabytes.
    pub max_memory_mb: u64,
    /// Upper bound on the number of cached entries.
    pub max_entries: usize,
    /// Content-type substrings that bar a response from admission.
    pub excluded_types: Vec<String>,
    /// When false, every metrics update is a no-op.
    pub enable_metrics: bool,
    /// Period of the background expired-entry sweep.
    pub cleanup_interval: Duration,
    /// Read size hint for connection analysis buffers.
    pub buffer_size: usize,
    /// Maximum time a connection is considered fresh for analysis.
    pub connection_timeout: Duration,
    /// Request headers folded into the cache fingerprint.
    pub vary_headers: Vec<String>,
    /// Status codes the handler-level entry point will store.
    pub include_status_codes: Vec<u16>,
    /// When true, replayed responses carry the recorded status line
    /// instead of the fixed `200 OK`.
    pub serve_stored_status: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(15 * 60),
            content_type_ttls: HashMap::new(),
            max_memory_mb: 512,
            max_entries: 10_000,
            excluded_types: vec![
                "text/html".to_string(),
                "application/xhtml+xml".to_string(),
            ],
            enable_metrics: true,
            cleanup_interval: Duration::from_secs(5 * 60),
            buffer_size: 8192,
            connection_timeout: Duration::from_secs(30),
            vary_headers: vec![
                "Accept".to_string(),
                "Accept-Encoding".to_string(),
                "Accept-Language".to_string(),
                "Authorization".to_string(),
            ],
            include_status_codes: vec![200],
            serve_stored_status: false,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_ttl.is_zero() {
            anyhow::bail!("default TTL must be positive, got {:?}", self.default_ttl);
        }
        if self.cleanup_interval.is_zero() {
            anyhow::bail!(
                "cleanup interval must be positive, got {:?}",
                self.cleanup_interval
            );
        }
        if self.max_memory_mb == 0 {
            anyhow::bail!("max memory must be positive, got {} MB", self.max_memory_mb);
        }
        if self.max_entries == 0 {
            anyhow::bail!("max entries must be positive, got {}", self.max_entries);
        }
        if self.buffer_size == 0 {
            anyhow::bail!("buffer size must be positive, got {}", self.buffer_size);
        }
        if self.connection_timeout.is_zero() {
            anyhow::bail!(
                "connection timeout must be positive, got {:?}",
                self.connection_timeout
            );
        }
        for (content_type, ttl) in &self.content_type_ttls {
            if ttl.is_zero() {
                anyhow::bail!(
                    "TTL for content type {} must be positive, got {:?}",
                    content_type,
                    ttl
                );
            }
        }
        Ok(())
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb * 1024 * 1024
    }

    /// TTL for a normalized content type, falling back to `default_ttl`.
    pub fn ttl_for_content_type(&self, content_type: &str) -> Duration {
        self.content_type_ttls
            .get(content_type)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// Whether a content type matches any excluded-type substring.
    pub fn is_content_type_excluded(&self, content_type: &str) -> bool {
        let lower = content_type.to_ascii_lowercase();
        self.excluded_types
            .iter()
            .any(|excluded| lower.contains(&excluded.to_ascii_lowercase()))
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}
