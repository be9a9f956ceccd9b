//! Cache-key derivation.
//!
//! The default fingerprint is a SHA-256 hex digest over a canonical
//! rendering of the request line, so keys are stable across processes and
//! platforms and are safe to use verbatim as file names.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::model::Request;

/// A custom key deriver: `(request, body_bytes)` to a stable string.
///
/// Derivers that produce colliding strings for semantically distinct
/// requests are a correctness bug in the caller, not in the cache.
pub type KeyGenerator =
    Arc<dyn Fn(&Request, Option<&[u8]>) -> String + Send + Sync>;

/// Methods whose bodies are semantically significant and participate in
/// the default fingerprint.
pub const DEFAULT_BODY_KEYED_METHODS: &[&str] = &["POST", "PUT", "PATCH"];

/// Derives the default fingerprint for a request.
///
/// The digest covers the uppercased method and the normalized URL
/// (scheme, lowercased host, explicit-or-default port, raw path, raw
/// query), plus the body bytes when supplied.
#[must_use]
pub fn generate_key(request: &Request, body: Option<&[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.method.to_ascii_uppercase().as_bytes());
    hasher.update(b"|");
    hasher.update(request.url.scheme().as_bytes());
    hasher.update(b"://");
    // the url crate lowercases registered hosts during parsing
    hasher.update(request.url.host_str().unwrap_or_default().as_bytes());
    hasher.update(b":");
    let port = request.url.port_or_known_default().unwrap_or(0);
    hasher.update(port.to_string().as_bytes());
    hasher.update(request.url.path().as_bytes());
    if let Some(query) = request.url.query() {
        hasher.update(b"?");
        hasher.update(query.as_bytes());
    }
    if let Some(body) = body {
        hasher.update(b"|");
        hasher.update(body);
    }
    hex::encode(hasher.finalize())
}
