use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Performance counters for the caching system.
///
/// When disabled, every update is a no-op and `snapshot` returns zeroes.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    enabled: bool,

    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
    deletions: AtomicU64,

    total_memory_bytes: AtomicU64,
    entry_count: AtomicU64,

    total_lookup_nanos: AtomicU64,
    total_store_nanos: AtomicU64,
    lookup_count: AtomicU64,
    store_count: AtomicU64,

    errors: DashMap<String, u64>,
}

/// A point-in-time snapshot of cache metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub deletions: u64,

    pub hit_ratio: f64,
    pub avg_lookup_time_ms: f64,
    pub avg_store_time_ms: f64,

    pub total_memory_bytes: u64,
    pub entry_count: u64,
    pub avg_entry_size: u64,

    pub errors: HashMap<String, u64>,
}

impl CacheMetrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_hit(&self) {
        if self.enabled {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_miss(&self) {
        if self.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_store(&self) {
        if self.enabled {
            self.stores.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_eviction(&self) {
        if self.enabled {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_deletion(&self) {
        if self.enabled {
            self.deletions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_lookup_time(&self, elapsed: Duration) {
        if self.enabled {
            self.total_lookup_nanos
                .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
            self.lookup_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_store_time(&self, elapsed: Duration) {
        if self.enabled {
            self.total_store_nanos
                .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
            self.store_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn update_memory_usage(&self, bytes: u64, entries: usize) {
        if self.enabled {
            self.total_memory_bytes.store(bytes, Ordering::Relaxed);
            self.entry_count.store(entries as u64, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self, error_type: &str) {
        if self.enabled {
            *self.errors.entry(error_type.to_string()).or_insert(0) += 1;
        }
    }

    pub fn snapshot(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookup_count = self.lookup_count.load(Ordering::Relaxed);
        let store_count = self.store_count.load(Ordering::Relaxed);
        let total_memory_bytes = self.total_memory_bytes.load(Ordering::Relaxed);
        let entry_count = self.entry_count.load(Ordering::Relaxed);

        let total_requests = hits + misses;
        let hit_ratio = if total_requests > 0 {
            hits as f64 / total_requests as f64
        } else {
            0.0
        };

        let avg_lookup_time_ms = if lookup_count > 0 {
            self.total_lookup_nanos.load(Ordering::Relaxed) as f64 / lookup_count as f64 / 1e6
        } else {
            0.0
        };

        let avg_store_time_ms = if store_count > 0 {
            self.total_store_nanos.load(Ordering::Relaxed) as f64 / store_count as f64 / 1e6
        } else {
            0.0
        };

        let avg_entry_size = if entry_count > 0 {
            total_memory_bytes / entry_count
        } else {
            0
        };

        CacheStats {
            hits,
            misses,
            stores: self.stores.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            deletions: self.deletions.load(Ordering::Relaxed),
            hit_ratio,
            avg_lookup_time_ms,
            avg_store_time_ms,
            total_memory_bytes,
            entry_count,
            avg_entry_size,
            errors: self
                .errors
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }

    pub fn reset(&self) {
        if !self.enabled {
            return;
        }
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.stores.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.deletions.store(0, Ordering::Relaxed);
        self.total_memory_bytes.store(0, Ordering::Relaxed);
        self.entry_count.store(0, Ordering::Relaxed);
        self.total_lookup_nanos.store(0, Ordering::Relaxed);
        self.total_store_nanos.store(0, Ordering::Relaxed);
        self.lookup_count.store(0, Ordering::Relaxed);
        self.store_count.store(0, Ordering::Relaxed);
        self.errors.clear();
    }
}
