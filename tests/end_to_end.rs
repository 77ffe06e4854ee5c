use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tapcache::{ArtifactStore, CacheConfig, CacheMetrics, CachedHandler, CachingStream};

const REQUEST: &[u8] =
    b"GET /api/data?id=123 HTTP/1.1\r\nHost: example.com\r\nAccept: application/json\r\n\r\n";
const RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 8\r\n\r\n{\"ok\":1}";

fn shared_parts() -> (Arc<ArtifactStore>, Arc<CacheConfig>, Arc<CacheMetrics>) {
    let config = Arc::new(CacheConfig::default());
    let metrics = Arc::new(CacheMetrics::new(true));
    let store = ArtifactStore::new(config.clone(), metrics.clone());
    (store, config, metrics)
}

/// Drive one request/response exchange through a byte-level interceptor so
/// the shared store gets populated by the wire path.
async fn populate_via_byte_path(store: Arc<ArtifactStore>, config: Arc<CacheConfig>) {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let mut conn = CachingStream::new(server, store, config);

    client.write_all(REQUEST).await.unwrap();
    let mut buf = [0u8; 4096];
    conn.read(&mut buf).await.unwrap();
    conn.write_all(RESPONSE).await.unwrap();

    let mut out = vec![0u8; RESPONSE.len()];
    client.read_exact(&mut out).await.unwrap();
}

fn passthrough_handler(
    _request: Request<Bytes>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Response<Bytes>> + Send>> {
    Box::pin(async {
        let mut response = Response::new(Bytes::from_static(b"FRESH FROM HANDLER"));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    })
}

// The byte path and the handler path must derive identical fingerprints for
// identical requests: an entry stored by the wire interceptor is a hit for
// the handler wrapper, with no downstream invocation.
#[tokio::test]
async fn test_byte_path_and_handler_path_share_fingerprints() {
    let (store, config, metrics) = shared_parts();
    populate_via_byte_path(store.clone(), config.clone()).await;
    assert_eq!(store.len(), 1);

    let cached = CachedHandler::with_store(passthrough_handler, store, config, metrics);

    let request = Request::builder()
        .method(Method::GET)
        .uri("/api/data?id=123")
        .header("accept", "application/json")
        .body(Bytes::new())
        .unwrap();
    let response = cached.handle(request).await;

    assert_eq!(
        response.headers().get("x-cache-status").unwrap(),
        HeaderValue::from_static("HIT")
    );
    assert_eq!(response.body().as_ref(), br#"{"ok":1}"#);
}

// A HEAD through the handler wrapper hits the entry a GET populated on the
// wire: same fingerprint, headers and HIT marker, zero body bytes.
#[tokio::test]
async fn test_head_hits_wire_populated_entry() {
    let (store, config, metrics) = shared_parts();
    populate_via_byte_path(store.clone(), config.clone()).await;

    let cached = CachedHandler::with_store(passthrough_handler, store.clone(), config, metrics);

    let request = Request::builder()
        .method(Method::HEAD)
        .uri("/api/data?id=123")
        .header("accept", "application/json")
        .body(Bytes::new())
        .unwrap();
    let response = cached.handle(request).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-cache-status").unwrap(),
        HeaderValue::from_static("HIT")
    );
    assert!(response.body().is_empty());
    assert_eq!(
        response.headers().get(CONTENT_TYPE).unwrap(),
        HeaderValue::from_static("application/json")
    );

    // Still one entry: the HEAD populated nothing new.
    assert_eq!(store.len(), 1);
}

// An entry stored through the handler wrapper replays on the wire path.
#[tokio::test]
async fn test_handler_populated_entry_replays_on_wire() {
    let (store, config, metrics) = shared_parts();

    let cached = CachedHandler::with_store(
        passthrough_handler,
        store.clone(),
        config.clone(),
        metrics.clone(),
    );
    let request = Request::builder()
        .method(Method::GET)
        .uri("/api/data?id=123")
        .header("accept", "application/json")
        .body(Bytes::new())
        .unwrap();
    cached.handle(request).await;
    assert_eq!(store.len(), 1);

    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let mut conn = CachingStream::new(server, store, config);

    client.write_all(REQUEST).await.unwrap();
    let mut buf = [0u8; 4096];
    conn.read(&mut buf).await.unwrap();
    conn.write_all(b"BYTES THE HANDLER WOULD HAVE SENT")
        .await
        .unwrap();

    let mut acc = Vec::new();
    let mut tmp = [0u8; 1024];
    while !acc
        .windows(18)
        .any(|window| window == b"FRESH FROM HANDLER".as_slice())
    {
        let n = client.read(&mut tmp).await.unwrap();
        assert!(n > 0, "stream ended before replay arrived");
        acc.extend_from_slice(&tmp[..n]);
    }
    let text = String::from_utf8_lossy(&acc);
    assert!(text.contains("X-Cache-Status: HIT"));
    assert!(!text.contains("BYTES THE HANDLER"));
}

// Keep-alive: after a replay the connection returns to neutral, and a
// request for a different resource passes through untouched.
#[tokio::test]
async fn test_keep_alive_rekeys_per_request() {
    let (store, config, _metrics) = shared_parts();
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let mut conn = CachingStream::new(server, store.clone(), config);
    let mut buf = [0u8; 4096];

    // Request A populates.
    client.write_all(REQUEST).await.unwrap();
    conn.read(&mut buf).await.unwrap();
    conn.write_all(RESPONSE).await.unwrap();
    let mut out = vec![0u8; RESPONSE.len()];
    client.read_exact(&mut out).await.unwrap();

    // Request B, a different path, misses and passes through.
    let other: &[u8] = b"GET /other HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let other_response: &[u8] =
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";
    client.write_all(other).await.unwrap();
    conn.read(&mut buf).await.unwrap();
    conn.write_all(other_response).await.unwrap();

    let mut out = vec![0u8; other_response.len()];
    client.read_exact(&mut out).await.unwrap();
    assert_eq!(out, other_response);

    // Both resources are now cached independently.
    assert_eq!(store.len(), 2);
}

// Store invariants exercised end to end: no matter how many wire
// admissions occur, the store never exceeds its configured bounds.
#[tokio::test]
async fn test_store_bounds_hold_under_wire_admissions() {
    let config = Arc::new(CacheConfig {
        max_memory_mb: 1,
        max_entries: 5,
        ..Default::default()
    });
    let metrics = Arc::new(CacheMetrics::new(true));
    let store = ArtifactStore::new(config.clone(), metrics.clone());

    for i in 0..20 {
        let (mut client, server) = tokio::io::duplex(256 * 1024);
        let mut conn =
            CachingStream::new(server, store.clone(), config.clone());

        let request = format!("GET /bulk/{} HTTP/1.1\r\nHost: example.com\r\n\r\n", i);
        client.write_all(request.as_bytes()).await.unwrap();
        let mut buf = [0u8; 4096];
        conn.read(&mut buf).await.unwrap();

        let body = vec![b'x'; 10 * 1024];
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(&body);
        conn.write_all(&response).await.unwrap();

        let mut sink = vec![0u8; response.len()];
        client.read_exact(&mut sink).await.unwrap();

        assert!(store.bytes() <= config.max_memory_bytes());
        assert!(store.len() <= config.max_entries);
    }

    let stats = metrics.snapshot();
    assert_eq!(stats.stores, 20);
    assert!(stats.evictions >= 15);
}

#[tokio::test]
async fn test_expiration_on_wire_path() {
    let config = Arc::new(CacheConfig {
        content_type_ttls: [("application/json".to_string(), Duration::from_millis(60))]
            .into_iter()
            .collect(),
        ..Default::default()
    });
    let metrics = Arc::new(CacheMetrics::new(true));
    let store = ArtifactStore::new(config.clone(), metrics.clone());

    populate_via_byte_path(store.clone(), config.clone()).await;
    assert_eq!(store.len(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;

    // Expired: a new connection for the same request passes through.
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let mut conn = CachingStream::new(server, store.clone(), config);

    client.write_all(REQUEST).await.unwrap();
    let mut buf = [0u8; 4096];
    conn.read(&mut buf).await.unwrap();
    conn.write_all(RESPONSE).await.unwrap();

    let mut out = vec![0u8; RESPONSE.len()];
    client.read_exact(&mut out).await.unwrap();
    assert_eq!(out, RESPONSE);
}
