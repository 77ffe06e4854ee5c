use std::sync::Arc;
use std::time::Duration;

use http::header::CONTENT_TYPE;
use http::HeaderMap;

use crate::config::CacheConfig;

/// Status codes eligible for byte-level admission.
const CACHEABLE_STATUS: &[u16] = &[200, 201, 300, 301, 302, 304, 307, 308, 410];

const HTML_TYPES: &[&str] = &["text/html", "application/xhtml+xml", "application/xhtml"];

/// Decides cacheability and recommends a TTL from response headers and status.
#[derive(Clone)]
pub struct Classifier {
    config: Arc<CacheConfig>,
}

/// Result of analyzing a response for admission.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub status: u16,
    /// Normalized content type, sniffed from the body when no header is present.
    pub content_type: String,
    pub size: usize,
    pub is_html: bool,
    pub is_cacheable: bool,
    pub recommended_ttl: Duration,
}

impl Classifier {
    pub fn new(config: Arc<CacheConfig>) -> Self {
        Self { config }
    }

    /// Analyze a response for caching. Rules are evaluated in order: status,
    /// content-type exclusion, HTML rejection, size cap. Any miss means the
    /// response is not cacheable.
    pub fn analyze(&self, body: &[u8], headers: &HeaderMap, status: u16) -> Analysis {
        let declared = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let content_type = match &declared {
            Some(raw) => normalize_content_type(raw),
            None => sniff_content_type(body).to_string(),
        };

        // HTML is judged from the header alone; a JSON body that happens to
        // start with "<html>" stays JSON.
        let is_html = declared
            .as_deref()
            .map(is_html_content_type)
            .unwrap_or(false);

        let is_cacheable = is_cacheable_status(status)
            && !self.config.is_content_type_excluded(&content_type)
            && !is_html
            && body.len() as u64 <= self.config.max_memory_bytes() / 10;

        let recommended_ttl = if is_cacheable {
            self.config.ttl_for_content_type(&content_type)
        } else {
            Duration::ZERO
        };

        Analysis {
            status,
            content_type,
            size: body.len(),
            is_html,
            is_cacheable,
            recommended_ttl,
        }
    }
}

fn is_cacheable_status(status: u16) -> bool {
    CACHEABLE_STATUS.contains(&status)
}

fn is_html_content_type(content_type: &str) -> bool {
    if content_type.is_empty() {
        return false;
    }
    let lower = content_type.to_ascii_lowercase();
    HTML_TYPES.iter().any(|html| lower.contains(html))
}

/// Strip parameters, trim, and lowercase a Content-Type value.
pub fn normalize_content_type(raw: &str) -> String {
    let main = raw.split(';').next().unwrap_or(raw);
    main.trim().to_ascii_lowercase()
}

/// Detect a content type from leading body bytes. Used only when the
/// response carries no Content-Type header.
pub fn sniff_content_type(data: &[u8]) -> &'static str {
    if data.is_empty() {
        return "application/octet-stream";
    }

    let trimmed = trim_ascii_start(data);
    if let Some(&first) = trimmed.first() {
        if first == b'{' || first == b'[' {
            return "application/json";
        }
    }
    if trimmed.starts_with(b"<?xml") {
        return "application/xml";
    }

    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg";
    }
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        return "image/png";
    }
    if data.starts_with(b"GIF8") {
        return "image/gif";
    }
    if data.starts_with(b"%PDF") {
        return "application/pdf";
    }

    if is_plain_text(data) {
        return "text/plain";
    }

    "application/octet-stream"
}

fn trim_ascii_start(data: &[u8]) -> &[u8] {
    let mut slice = data;
    while let Some((first, rest)) = slice.split_first() {
        if first.is_ascii_whitespace() {
            slice = rest;
        } else {
            break;
        }
    }
    slice
}

/// At least 95% printable ASCII (plus tab/newline/carriage return) in the
/// first 512 bytes.
fn is_plain_text(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }

    let sample = &data[..data.len().min(512)];
    let non_printable = sample
        .iter()
        .filter(|&&b| !((32..=126).contains(&b) || b == 9 || b == 10 || b == 13))
        .count();

    (non_printable as f64) / (sample.len() as f64) < 0.05
}
