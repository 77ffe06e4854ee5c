use std::future::Future;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use tracing::debug;

use crate::classify::{normalize_content_type, sniff_content_type};
use crate::config::CacheConfig;
use crate::fingerprint;
use crate::metrics::CacheMetrics;
use crate::store::ArtifactStore;

/// A downstream HTTP handler. Implemented for any async closure taking a
/// `Request<Bytes>` and returning a `Response<Bytes>`.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, request: Request<Bytes>) -> Response<Bytes>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Request<Bytes>) -> Fut + Send + Sync,
    Fut: Future<Output = Response<Bytes>> + Send,
{
    async fn call(&self, request: Request<Bytes>) -> Response<Bytes> {
        (self)(request).await
    }
}

/// Handler-level caching entry point.
///
/// Simpler than the byte-level interceptor: it gates on GET/HEAD, serves
/// hits with an `X-Cache-Status: HIT` header, and stores misses that pass
/// a narrower admission filter. Shares the key derivation and the store
/// with the byte path, so the two produce identical fingerprints.
pub struct CachedHandler<H> {
    inner: H,
    store: Arc<ArtifactStore>,
    config: Arc<CacheConfig>,
    metrics: Arc<CacheMetrics>,
}

impl<H: Handler> CachedHandler<H> {
    /// Build a self-contained cached handler with its own store.
    pub fn new(inner: H, config: CacheConfig) -> Result<Self> {
        config.validate().context("invalid cache configuration")?;
        let config = Arc::new(config);
        let metrics = Arc::new(CacheMetrics::new(config.enable_metrics));
        let store = ArtifactStore::new(config.clone(), metrics.clone());
        Ok(Self {
            inner,
            store,
            config,
            metrics,
        })
    }

    /// Build a cached handler sharing an existing store, typically the one
    /// owned by a `CachingListener`.
    pub fn with_store(
        inner: H,
        store: Arc<ArtifactStore>,
        config: Arc<CacheConfig>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            inner,
            store,
            config,
            metrics,
        }
    }

    pub async fn handle(&self, request: Request<Bytes>) -> Response<Bytes> {
        let method = request.method().clone();
        if method != Method::GET && method != Method::HEAD {
            return self.inner.call(request).await;
        }

        let key = fingerprint::for_request(
            method.as_str(),
            request.uri().path(),
            request.uri().query().unwrap_or(""),
            request.headers(),
            &self.config.vary_headers,
        );

        if let Some(artifact) = self.store.get(&key) {
            debug!(fingerprint = %key, "handler cache hit");
            return hit_response(&artifact, &method);
        }

        let response = self.inner.call(request).await;

        let status = response.status().as_u16();
        if self.admits(status, response.headers()) {
            // HEAD responses store headers only; the entry then serves
            // zero body bytes until a GET repopulates it.
            let body = if method == Method::HEAD {
                Bytes::new()
            } else {
                response.body().clone()
            };
            let content_type = declared_content_type(response.headers(), &body);
            let ttl = self.config.ttl_for_content_type(&content_type);
            debug!(fingerprint = %key, status, content_type = %content_type, "handler storing response");
            self.store
                .put(&key, body, response.headers().clone(), status, ttl);
        }

        response
    }

    /// Delete the entry a GET for this path/query/headers would hit.
    /// Returns whether anything was removed.
    pub fn invalidate(&self, path: &str, query: &str, headers: &HeaderMap) -> bool {
        let key =
            fingerprint::for_request("GET", path, query, headers, &self.config.vary_headers);
        self.store.delete(&key)
    }

    fn admits(&self, status: u16, headers: &HeaderMap) -> bool {
        if !self.status_admitted(status) {
            return false;
        }
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        !self.config.is_content_type_excluded(content_type)
    }

    fn status_admitted(&self, status: u16) -> bool {
        if self.config.include_status_codes.is_empty() {
            status == 200
        } else {
            self.config.include_status_codes.contains(&status)
        }
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn clear(&self) {
        self.store.clear();
    }
}

fn hit_response(artifact: &crate::store::Artifact, method: &Method) -> Response<Bytes> {
    let body = if method == Method::HEAD {
        Bytes::new()
    } else {
        artifact.body.clone()
    };

    let mut response = Response::new(body);
    *response.status_mut() =
        StatusCode::from_u16(artifact.status).unwrap_or(StatusCode::OK);
    *response.headers_mut() = artifact.headers.clone();
    response
        .headers_mut()
        .insert("x-cache-status", HeaderValue::from_static("HIT"));
    response
}

fn declared_content_type(headers: &HeaderMap, body: &[u8]) -> String {
    match headers.get(CONTENT_TYPE).and_then(|value| value.to_str().ok()) {
        Some(raw) => normalize_content_type(raw),
        None => sniff_content_type(body).to_string(),
    }
}
