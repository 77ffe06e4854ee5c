use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use dashmap::DashMap;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::metrics::{CacheMetrics, CacheStats};
use crate::store::ArtifactStore;
use crate::stream::{CachingStream, StateHandle};

/// Wraps a `TcpListener` so every accepted connection is decorated with a
/// caching interceptor sharing one store.
pub struct CachingListener {
    inner: TcpListener,
    store: Arc<ArtifactStore>,
    config: Arc<CacheConfig>,
    metrics: Arc<CacheMetrics>,
    connections: Arc<DashMap<String, StateHandle>>,
}

/// Aggregate statistics for a caching listener.
#[derive(Debug, Clone, Serialize)]
pub struct ListenerStats {
    pub cache: CacheStats,
    pub active_connections: usize,
    pub cache_entries: usize,
    pub cache_bytes: u64,
    pub listener_address: String,
}

impl CachingListener {
    /// Bind a new listener and wrap it. Fails fast on invalid configuration.
    pub async fn bind(addr: impl ToSocketAddrs, config: CacheConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::wrap(listener, config)
    }

    /// Wrap an already-bound listener. Fails fast on invalid configuration.
    pub fn wrap(listener: TcpListener, config: CacheConfig) -> Result<Self> {
        config.validate().context("invalid cache configuration")?;

        let config = Arc::new(config);
        let metrics = Arc::new(CacheMetrics::new(config.enable_metrics));
        let store = ArtifactStore::new(config.clone(), metrics.clone());

        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "caching listener started");
        }

        Ok(Self {
            inner: listener,
            store,
            config,
            metrics,
            connections: Arc::new(DashMap::new()),
        })
    }

    /// Accept the next connection, wrapped in a caching interceptor and
    /// registered until it closes.
    pub async fn accept(&self) -> io::Result<(CachingStream<TcpStream>, SocketAddr)> {
        let (stream, peer_addr) = self.inner.accept().await?;

        let conn = CachingStream::new(stream, self.store.clone(), self.config.clone());

        let id = conn.id().to_string();
        self.connections.insert(id.clone(), conn.state_handle());

        let connections = self.connections.clone();
        let registered_id = id.clone();
        conn.set_close_callback(move || {
            connections.remove(&registered_id);
        });

        debug!(peer = %peer_addr, id = %id, "accepted connection");
        Ok((conn, peer_addr))
    }

    /// Close the store first, then the underlying listener.
    pub fn close(self) {
        self.store.close();
        drop(self.inner);
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            cache: self.metrics.snapshot(),
            active_connections: self.connections.len(),
            cache_entries: self.store.len(),
            cache_bytes: self.store.bytes(),
            listener_address: self
                .inner
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_default(),
        }
    }

    pub fn clear_cache(&self) {
        self.store.clear();
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &Arc<CacheConfig> {
        &self.config
    }
}
