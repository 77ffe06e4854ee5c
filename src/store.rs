use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::HeaderMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::debug;

use crate::config::CacheConfig;
use crate::metrics::CacheMetrics;

/// A stored response: body, headers, timestamps, and byte cost.
///
/// The cost is fixed at insertion; headers are never mutated afterwards.
/// `last_access` is the only mutable field and backs LRU ordering.
#[derive(Debug)]
pub struct Artifact {
    pub body: Bytes,
    pub headers: HeaderMap,
    pub status: u16,
    pub content_type: String,
    pub expires_at: Instant,
    pub stored_at: Instant,
    pub cost: u64,
    last_access: Mutex<Instant>,
}

impl Artifact {
    fn new(body: Bytes, headers: HeaderMap, status: u16, ttl: Duration) -> Self {
        let now = Instant::now();
        let cost = body.len() as u64 + header_cost(&headers);
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        Self {
            body,
            headers,
            status,
            content_type,
            expires_at: now + ttl,
            stored_at: now,
            cost,
            last_access: Mutex::new(now),
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    /// Seconds since the artifact was stored.
    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }
}

fn header_cost(headers: &HeaderMap) -> u64 {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().len() + value.len()) as u64)
        .sum()
}

#[derive(Debug, Default)]
struct StoreInner {
    entries: HashMap<String, Arc<Artifact>>,
    bytes: u64,
}

/// TTL + LRU + byte-budget keyed container with a background sweep.
///
/// `get` never returns an expired artifact, whether or not the sweep has
/// run; the sweep only reclaims memory earlier than lazy expiry would.
pub struct ArtifactStore {
    inner: Arc<RwLock<StoreInner>>,
    config: Arc<CacheConfig>,
    metrics: Arc<CacheMetrics>,
    stop_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl ArtifactStore {
    /// Create the store and spawn its sweep task. The task holds only a
    /// weak reference, so dropping the store also ends the task.
    pub fn new(config: Arc<CacheConfig>, metrics: Arc<CacheMetrics>) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let store = Arc::new(Self {
            inner: Arc::new(RwLock::new(StoreInner::default())),
            config: config.clone(),
            metrics: metrics.clone(),
            stop_tx,
            closed: AtomicBool::new(false),
        });

        spawn_sweep(
            Arc::downgrade(&store.inner),
            metrics,
            config.cleanup_interval,
            stop_rx,
        );

        store
    }

    /// Look up a live artifact. Expired entries are removed on the spot and
    /// reported as misses.
    pub fn get(&self, key: &str) -> Option<Arc<Artifact>> {
        let start = Instant::now();
        let result = self.lookup(key);
        self.metrics.record_lookup_time(start.elapsed());
        result
    }

    fn lookup(&self, key: &str) -> Option<Arc<Artifact>> {
        {
            let inner = self.inner.read();
            match inner.entries.get(key) {
                None => {
                    self.metrics.record_miss();
                    return None;
                }
                Some(artifact) if !artifact.is_expired() => {
                    artifact.touch();
                    self.metrics.record_hit();
                    return Some(artifact.clone());
                }
                Some(_) => {}
            }
        }

        // Expired: re-check under the write lock before removing, in case a
        // concurrent put replaced the entry.
        let mut inner = self.inner.write();
        if inner
            .entries
            .get(key)
            .map(|artifact| artifact.is_expired())
            .unwrap_or(false)
        {
            if let Some(artifact) = inner.entries.remove(key) {
                inner.bytes -= artifact.cost;
            }
            self.metrics
                .update_memory_usage(inner.bytes, inner.entries.len());
        }
        self.metrics.record_miss();
        None
    }

    /// Insert an artifact, evicting in LRU order until both the byte budget
    /// and the entry cap admit it. Never fails; a zero TTL means the
    /// configured default.
    pub fn put(&self, key: &str, body: Bytes, headers: HeaderMap, status: u16, ttl: Duration) {
        let start = Instant::now();
        let ttl = if ttl.is_zero() {
            self.config.default_ttl
        } else {
            ttl
        };
        let artifact = Artifact::new(body, headers, status, ttl);
        let cost = artifact.cost;

        {
            let mut inner = self.inner.write();

            let evicted = self.make_room(&mut inner, cost);
            for _ in 0..evicted {
                self.metrics.record_eviction();
            }

            if let Some(prior) = inner.entries.remove(key) {
                inner.bytes -= prior.cost;
            }
            inner.bytes += cost;
            inner.entries.insert(key.to_string(), Arc::new(artifact));

            self.metrics.record_store();
            self.metrics
                .update_memory_usage(inner.bytes, inner.entries.len());
        }

        self.metrics.record_store_time(start.elapsed());
    }

    /// Evict least-recently-used artifacts until the incoming cost fits.
    /// The byte deficit intentionally includes the new cost twice, leaving
    /// headroom after admission. Returns the number of evictions.
    fn make_room(&self, inner: &mut StoreInner, cost: u64) -> u64 {
        let budget = self.config.max_memory_bytes();
        let projected = inner.bytes + cost;
        let over_budget = projected > budget;
        let over_entries = inner.entries.len() >= self.config.max_entries;
        if !over_budget && !over_entries {
            return 0;
        }

        let deficit = if over_budget {
            projected - budget + cost
        } else {
            0
        };

        let mut order: Vec<(String, Instant)> = inner
            .entries
            .iter()
            .map(|(key, artifact)| (key.clone(), artifact.last_access()))
            .collect();
        order.sort_by_key(|(_, accessed)| *accessed);

        let mut freed = 0u64;
        let mut evicted = 0u64;
        for (key, _) in order {
            if freed >= deficit && inner.entries.len() < self.config.max_entries {
                break;
            }
            if let Some(artifact) = inner.entries.remove(&key) {
                inner.bytes -= artifact.cost;
                freed += artifact.cost;
                evicted += 1;
            }
        }
        evicted
    }

    /// Remove an entry by key. Returns whether anything was removed.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.entries.remove(key) {
            Some(artifact) => {
                inner.bytes -= artifact.cost;
                self.metrics.record_deletion();
                self.metrics
                    .update_memory_usage(inner.bytes, inner.entries.len());
                true
            }
            None => false,
        }
    }

    /// Remove every entry, recording one deletion per removed artifact.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.bytes = 0;
        for _ in 0..removed {
            self.metrics.record_deletion();
        }
        self.metrics.update_memory_usage(0, 0);
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn bytes(&self) -> u64 {
        self.inner.read().bytes
    }

    /// Stop the sweep task. Idempotent and safe to call concurrently.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.stop_tx.send(true);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn spawn_sweep(
    inner: Weak<RwLock<StoreInner>>,
    metrics: Arc<CacheMetrics>,
    period: Duration,
    mut stop_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        // The first interval tick completes immediately; the first sweep
        // should happen one full period after construction.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    sweep_expired(&inner, &metrics);
                }
                _ = stop_rx.changed() => break,
            }
        }
    });
}

fn sweep_expired(inner: &RwLock<StoreInner>, metrics: &CacheMetrics) {
    let mut inner = inner.write();
    let mut freed = 0u64;
    let mut removed = 0usize;

    inner.entries.retain(|_, artifact| {
        if artifact.is_expired() {
            freed += artifact.cost;
            removed += 1;
            false
        } else {
            true
        }
    });
    inner.bytes -= freed;

    if removed > 0 {
        for _ in 0..removed {
            metrics.record_deletion();
        }
        metrics.update_memory_usage(inner.bytes, inner.entries.len());
        debug!(removed, freed, "sweep removed expired artifacts");
    }
}
