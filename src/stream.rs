use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

use crate::classify::Classifier;
use crate::config::CacheConfig;
use crate::store::{Artifact, ArtifactStore};

/// Hard cap on either analysis buffer.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;
/// Read buffer limit while no request has parsed; beyond this the traffic
/// is treated as non-HTTP and the buffer is dropped.
const READ_PARSE_CAP: usize = 8 * 1024;
/// Write buffer limit before analysis; beyond this the response is not
/// worth capturing.
const WRITE_ANALYZE_CAP: usize = 16 * 1024;
/// Writes under this size after complete headers suggest the end of a
/// response.
const SMALL_WRITE_THRESHOLD: usize = 1024;
const MAX_HEADERS: usize = 64;

/// Shared per-connection state, visible to the listener registry.
pub struct ConnState {
    request_parsed: bool,
    fingerprint: String,
    closed: bool,
    close_callback: Option<Box<dyn FnOnce() + Send + Sync>>,
}

pub(crate) type StateHandle = Arc<RwLock<ConnState>>;

/// Statistics for a single intercepted connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub id: String,
    pub request_parsed: bool,
    pub has_fingerprint: bool,
    pub read_buffered: usize,
    pub write_buffered: usize,
    pub closed: bool,
}

/// In-flight serialized cache hit being drained to the underlying stream.
struct Replay {
    data: Bytes,
    written: usize,
    /// Length of the caller's buffer, reported back once the drain ends so
    /// the caller believes its own bytes were written.
    reported_len: usize,
}

/// Wraps a byte-oriented connection with transparent response caching.
///
/// Request bytes are parsed on ingress to derive a cache fingerprint;
/// response bytes are captured on egress and admitted to the store when
/// the classifier allows. A later matching request is answered from the
/// store without the handler's bytes ever reaching the wire.
///
/// Implements `AsyncRead` and `AsyncWrite`, so it is substitutable for the
/// wrapped stream anywhere a listener hands one out.
pub struct CachingStream<S> {
    inner: S,
    id: String,
    store: Arc<ArtifactStore>,
    classifier: Classifier,
    config: Arc<CacheConfig>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    replay: Option<Replay>,
    state: StateHandle,
}

impl<S> CachingStream<S> {
    pub fn new(inner: S, store: Arc<ArtifactStore>, config: Arc<CacheConfig>) -> Self {
        let read_buf = BytesMut::with_capacity(config.buffer_size);
        Self {
            inner,
            id: Uuid::new_v4().simple().to_string(),
            store,
            classifier: Classifier::new(config.clone()),
            config,
            read_buf,
            write_buf: BytesMut::new(),
            replay: None,
            state: Arc::new(RwLock::new(ConnState {
                request_parsed: false,
                fingerprint: String::new(),
                closed: false,
                close_callback: None,
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Configured bound for how long this connection stays interesting for
    /// analysis. Callers enforce it with `tokio::time::timeout`.
    pub fn connection_timeout(&self) -> std::time::Duration {
        self.config.connection_timeout
    }

    /// Register a callback invoked exactly once when the connection closes.
    pub fn set_close_callback(&self, callback: impl FnOnce() + Send + Sync + 'static) {
        self.state.write().close_callback = Some(Box::new(callback));
    }

    pub(crate) fn state_handle(&self) -> StateHandle {
        self.state.clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        let state = self.state.read();
        ConnectionStats {
            id: self.id.clone(),
            request_parsed: state.request_parsed,
            has_fingerprint: !state.fingerprint.is_empty(),
            read_buffered: self.read_buf.len(),
            write_buffered: self.write_buf.len(),
            closed: state.closed,
        }
    }

    /// Accumulate ingress bytes and attempt a request parse once the headers
    /// are complete.
    fn ingest(&mut self, chunk: &[u8]) {
        if self.read_buf.len() + chunk.len() > MAX_BUFFER_SIZE {
            self.read_buf.clear();
        }
        self.read_buf.extend_from_slice(chunk);

        if self.state.read().request_parsed {
            return;
        }

        let snapshot = if self.read_buf.is_empty() {
            None
        } else {
            Some(self.read_buf.clone().freeze())
        };

        if self.read_buf.len() > READ_PARSE_CAP {
            self.read_buf.clear();
        }

        if let Some(data) = snapshot {
            self.try_parse_request(&data);
        }
    }

    fn try_parse_request(&mut self, data: &[u8]) {
        if find_header_terminator(data).is_none() {
            return;
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        let Ok(httparse::Status::Complete(_)) = request.parse(data) else {
            return;
        };
        let (Some(method), Some(target)) = (request.method, request.path) else {
            return;
        };

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };

        let mut chosen = BTreeMap::new();
        for name in &self.config.vary_headers {
            for header in request.headers.iter() {
                if header.name.eq_ignore_ascii_case(name) {
                    if let Ok(value) = std::str::from_utf8(header.value) {
                        if !value.is_empty() {
                            chosen.insert(name.clone(), value.to_string());
                        }
                    }
                    break;
                }
            }
        }

        let fingerprint = crate::fingerprint::derive(method, path, query, &chosen);
        debug!(id = %self.id, method, path, fingerprint = %fingerprint, "parsed request");

        {
            let mut state = self.state.write();
            state.request_parsed = true;
            state.fingerprint = fingerprint;
        }
        self.read_buf.clear();
    }

    /// Accumulate egress bytes and classify the response once the
    /// completion heuristic fires.
    fn buffer_response(&mut self, chunk: &[u8]) {
        if self.write_buf.len() + chunk.len() > MAX_BUFFER_SIZE {
            self.write_buf.clear();
        }
        self.write_buf.extend_from_slice(chunk);

        if self.write_buf.len() > WRITE_ANALYZE_CAP {
            self.write_buf.clear();
            return;
        }

        if response_may_be_complete(&self.write_buf, chunk) {
            self.classify_and_store();
        }
    }

    fn classify_and_store(&mut self) {
        let (request_parsed, fingerprint) = {
            let state = self.state.read();
            (state.request_parsed, state.fingerprint.clone())
        };
        if !request_parsed || fingerprint.is_empty() || self.write_buf.is_empty() {
            return;
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        let Ok(httparse::Status::Complete(body_start)) = response.parse(&self.write_buf) else {
            return;
        };
        let Some(status) = response.code else { return };
        let header_map = header_map_from_parsed(response.headers);
        let body = Bytes::copy_from_slice(&self.write_buf[body_start..]);

        let analysis = self.classifier.analyze(&body, &header_map, status);
        if analysis.is_cacheable {
            debug!(
                id = %self.id,
                fingerprint = %fingerprint,
                content_type = %analysis.content_type,
                size = analysis.size,
                "admitting response"
            );
            self.store.put(
                &fingerprint,
                body,
                header_map,
                status,
                analysis.recommended_ttl,
            );
        }

        // Classified either way; this response is settled and the connection
        // returns to neutral so keep-alive requests re-key.
        self.write_buf.clear();
        let mut state = self.state.write();
        state.fingerprint.clear();
        state.request_parsed = false;
    }

    fn poll_drain_replay(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>>
    where
        S: AsyncWrite + Unpin,
    {
        let Some(mut replay) = self.replay.take() else {
            return Poll::Ready(Ok(0));
        };

        while replay.written < replay.data.len() {
            match Pin::new(&mut self.inner).poll_write(cx, &replay.data[replay.written..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "cached response truncated",
                    )));
                }
                Poll::Ready(Ok(n)) => replay.written += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {
                    self.replay = Some(replay);
                    return Poll::Pending;
                }
            }
        }

        Poll::Ready(Ok(replay.reported_len))
    }

    /// Mark the connection closed, release buffer memory, and fire the
    /// close callback. Idempotent.
    fn mark_closed(&mut self) {
        if self.state.read().closed {
            return;
        }

        self.read_buf = BytesMut::new();
        self.write_buf = BytesMut::new();
        self.replay = None;

        let callback = {
            let mut state = self.state.write();
            if state.closed {
                return;
            }
            state.closed = true;
            state.close_callback.take()
        };

        if let Some(callback) = callback {
            callback();
        }
        debug!(id = %self.id, "connection closed");
    }
}

impl CachingStream<TcpStream> {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for CachingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.state.read().closed {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let filled = buf.filled();
        if filled.len() > before {
            let chunk = filled[before..].to_vec();
            this.ingest(&chunk);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for CachingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.replay.is_some() {
            return this.poll_drain_replay(cx);
        }

        if this.state.read().closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closed",
            )));
        }

        let fingerprint = this.state.read().fingerprint.clone();
        if !fingerprint.is_empty() {
            if let Some(artifact) = this.store.get(&fingerprint) {
                {
                    // One replay per request; back to neutral immediately.
                    let mut state = this.state.write();
                    state.fingerprint.clear();
                    state.request_parsed = false;
                }
                debug!(id = %this.id, fingerprint = %fingerprint, "serving cached response");
                this.replay = Some(Replay {
                    data: build_http_response(&artifact, this.config.serve_stored_status),
                    written: 0,
                    reported_len: buf.len(),
                });
                return this.poll_drain_replay(cx);
            }
        }

        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.buffer_response(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.mark_closed();
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<S> Drop for CachingStream<S> {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

/// Serialize an artifact as an HTTP/1.1 response for wire replay.
fn build_http_response(artifact: &Artifact, serve_stored_status: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(artifact.body.len() + 256);

    if serve_stored_status {
        let reason = StatusCode::from_u16(artifact.status)
            .ok()
            .and_then(|status| status.canonical_reason())
            .unwrap_or("OK");
        buf.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", artifact.status, reason).as_bytes());
    } else {
        buf.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    }

    for (name, value) in artifact.headers.iter() {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"X-Cache-Status: HIT\r\n");
    buf.extend_from_slice(format!("X-Cache-Age: {}\r\n", artifact.age().as_secs()).as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&artifact.body);

    buf.freeze()
}

fn header_map_from_parsed(parsed: &[httparse::Header<'_>]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for header in parsed {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(header.name.as_bytes()),
            HeaderValue::from_bytes(header.value),
        ) {
            map.append(name, value);
        }
    }
    map
}

/// Headers are complete and this write looks like the end of the response:
/// either a small trailing chunk or a write that itself carries a
/// terminator.
fn response_may_be_complete(accumulated: &[u8], chunk: &[u8]) -> bool {
    find_header_terminator(accumulated).is_some()
        && (chunk.len() < SMALL_WRITE_THRESHOLD || find_header_terminator(chunk).is_some())
}

/// Offset just past the end-of-headers sentinel, CRLF pairs preferred.
fn find_header_terminator(data: &[u8]) -> Option<usize> {
    if let Some(pos) = find_subsequence(data, b"\r\n\r\n") {
        return Some(pos + 4);
    }
    find_subsequence(data, b"\n\n").map(|pos| pos + 2)
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
