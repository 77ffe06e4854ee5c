use std::collections::BTreeMap;

use http::HeaderMap;
use sha2::{Digest, Sha256};

/// Derive the cache fingerprint for a request.
///
/// HEAD is aliased to GET so both methods share one stored entry; every
/// other method token fingerprints distinctly. Components are joined with
/// `|`, and header names and values are escaped so neither the delimiter
/// nor the `=` separator can occur raw inside a component.
pub fn derive(
    method: &str,
    path: &str,
    query: &str,
    headers: &BTreeMap<String, String>,
) -> String {
    let method = if method == "HEAD" { "GET" } else { method };

    let mut parts: Vec<String> = Vec::with_capacity(3 + headers.len());
    parts.push(method.to_string());
    parts.push(path.to_string());

    if !query.is_empty() {
        parts.push(format!("query={}", query));
    }

    // BTreeMap iteration gives byte-ascending key order.
    for (name, value) in headers {
        parts.push(format!("{}={}", escape(name), escape(value)));
    }

    let digest = Sha256::digest(parts.join("|").as_bytes());
    let hex = format!("{:x}", digest);
    hex[..16].to_string()
}

/// Collect the configured subset of request headers for fingerprinting.
/// Missing and empty headers contribute nothing.
pub fn vary_headers(headers: &HeaderMap, names: &[String]) -> BTreeMap<String, String> {
    let mut chosen = BTreeMap::new();
    for name in names {
        if let Some(value) = headers.get(name.as_str()) {
            if let Ok(value) = value.to_str() {
                if !value.is_empty() {
                    chosen.insert(name.clone(), value.to_string());
                }
            }
        }
    }
    chosen
}

/// Fingerprint a request described by parsed `http` types. The byte-level
/// interceptor and the handler wrapper both route through `derive`, so the
/// two paths produce identical keys for identical requests.
pub fn for_request(
    method: &str,
    path: &str,
    query: &str,
    headers: &HeaderMap,
    names: &[String],
) -> String {
    derive(method, path, query, &vary_headers(headers, names))
}

fn escape(component: &str) -> String {
    // The escape introducer must be escaped first.
    component
        .replace('%', "%25")
        .replace('|', "%7C")
        .replace('=', "%3D")
}
