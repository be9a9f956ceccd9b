//! Transport-agnostic request/response model.
//!
//! The cache core owns its message types instead of borrowing a client
//! library's: a stored entry must own its body bytes, keep headers as an
//! ordered byte-pair list and carry an extensions mapping for per-request
//! flags and cache annotations.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::time::SystemTime;

use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use futures::StreamExt;
use url::Url;

use crate::error::TransportError;
use crate::headers::Headers;

/// A boxed chunk stream that is both `Send` and `Sync`, unlike
/// `futures::stream::BoxStream`, so that `Body` itself can be `Sync`.
type SyncBoxStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync>>;

/// A message body: either fully buffered bytes or a lazy chunk sequence.
///
/// Lazy bodies are fully consumed into an owned buffer before an entry is
/// admitted to storage; admitting an un-read body is a programming error
/// surfaced as [`SerializeError::UnreadBody`](crate::SerializeError).
pub enum Body {
    /// Fully materialized bytes.
    Complete(Bytes),
    /// A blocking chunk sequence.
    Iter(Box<dyn Iterator<Item = io::Result<Bytes>> + Send + Sync>),
    /// A cooperative chunk stream.
    Stream(SyncBoxStream),
}

impl Body {
    /// An empty, fully materialized body.
    #[must_use]
    pub fn empty() -> Self {
        Body::Complete(Bytes::new())
    }

    /// A fully materialized body from the given bytes.
    #[must_use]
    pub fn complete(bytes: impl Into<Bytes>) -> Self {
        Body::Complete(bytes.into())
    }

    /// Whether the body has been fully materialized.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Body::Complete(_))
    }

    /// The materialized bytes, if the body has been fully read.
    #[must_use]
    pub fn bytes(&self) -> Option<&Bytes> {
        match self {
            Body::Complete(bytes) => Some(bytes),
            _ => None,
        }
    }

    fn read_blocking(&mut self) -> Result<&Bytes, TransportError> {
        let buffered = match self {
            Body::Complete(_) => None,
            Body::Iter(chunks) => {
                let mut buf = BytesMut::new();
                for chunk in chunks {
                    let chunk = chunk.map_err(TransportError::Body)?;
                    buf.extend_from_slice(&chunk);
                }
                Some(buf.freeze())
            }
            Body::Stream(_) => {
                return Err(TransportError::Body(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "cooperative body read from a blocking context",
                )));
            }
        };
        if let Some(bytes) = buffered {
            *self = Body::Complete(bytes);
        }
        match self {
            Body::Complete(bytes) => Ok(bytes),
            _ => Err(TransportError::Body(io::Error::other(
                "body failed to materialize",
            ))),
        }
    }

    async fn read_cooperative(&mut self) -> Result<&Bytes, TransportError> {
        let buffered = match self {
            Body::Stream(chunks) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = chunks.next().await {
                    let chunk = chunk.map_err(TransportError::Body)?;
                    buf.extend_from_slice(&chunk);
                }
                Some(buf.freeze())
            }
            _ => None,
        };
        if let Some(bytes) = buffered {
            *self = Body::Complete(bytes);
        }
        self.read_blocking()
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Complete(bytes) => {
                f.debug_tuple("Complete").field(&bytes.len()).finish()
            }
            Body::Iter(_) => f.write_str("Iter(..)"),
            Body::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Complete(bytes)
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Body::Complete(Bytes::from_static(bytes))
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Complete(Bytes::from(bytes))
    }
}

/// A value carried in a message's extensions mapping.
#[derive(Clone, Debug, PartialEq)]
pub enum ExtensionValue {
    /// A boolean flag, e.g. `cache_disabled` or `from_cache`.
    Bool(bool),
    /// A textual value, e.g. `sni_hostname`.
    Str(String),
    /// A byte value, e.g. `reason_phrase` or `http_version`.
    Bytes(Bytes),
    /// Cache annotations attached to a served response.
    Metadata(CacheMetadata),
}

/// An opaque string-keyed mapping attached to requests and responses.
///
/// The core reads `cache_disabled` from requests and writes `from_cache`
/// and `cache_metadata` to responses; everything else passes through
/// untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Extensions(HashMap<String, ExtensionValue>);

impl Extensions {
    /// Creates an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ExtensionValue> {
        self.0.get(key)
    }

    /// Stores `value` under `key`, replacing any prior value.
    pub fn insert(&mut self, key: impl Into<String>, value: ExtensionValue) {
        self.0.insert(key.into(), value);
    }

    /// Iterates over the entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ExtensionValue)> {
        self.0.iter()
    }

    /// Whether the mapping is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-entry sidecar stored alongside the response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheMetadata {
    /// The entry's fingerprint.
    pub cache_key: String,
    /// When the entry was first admitted. Never rewritten by a 304
    /// revalidation; a full replacement starts a new entry.
    pub created_at: SystemTime,
    /// Incremented on every cache hit and every successful 304
    /// revalidation; reset to zero on full replacement. Advisory only.
    pub number_of_uses: u64,
}

impl CacheMetadata {
    /// Metadata for a freshly admitted entry.
    #[must_use]
    pub fn new(cache_key: impl Into<String>, created_at: SystemTime) -> Self {
        Self { cache_key: cache_key.into(), created_at, number_of_uses: 0 }
    }
}

/// An outbound HTTP request.
#[derive(Debug)]
pub struct Request {
    /// The request method, matched case-insensitively.
    pub method: String,
    /// The target URL.
    pub url: Url,
    /// Ordered header fields.
    pub headers: Headers,
    /// The request body.
    pub body: Body,
    /// Opaque per-request extensions.
    pub extensions: Extensions,
}

impl Request {
    /// Creates a request with empty headers and body.
    #[must_use]
    pub fn new(method: impl Into<String>, url: Url) -> Self {
        Self {
            method: method.into(),
            url,
            headers: Headers::new(),
            body: Body::empty(),
            extensions: Extensions::new(),
        }
    }

    /// Appends a header field.
    #[must_use]
    pub fn header(
        mut self,
        name: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets an extension value.
    #[must_use]
    pub fn extension(
        mut self,
        key: impl Into<String>,
        value: ExtensionValue,
    ) -> Self {
        self.extensions.insert(key, value);
        self
    }

    /// Whether the `cache_disabled` extension requests a pass-through.
    #[must_use]
    pub fn cache_disabled(&self) -> bool {
        matches!(
            self.extensions.get("cache_disabled"),
            Some(ExtensionValue::Bool(true))
        )
    }

    /// Fully reads a blocking body into an owned buffer.
    pub fn read(&mut self) -> Result<&Bytes, TransportError> {
        self.body.read_blocking()
    }

    /// Fully reads a body, awaiting cooperative chunk streams.
    pub async fn read_async(&mut self) -> Result<&Bytes, TransportError> {
        self.body.read_cooperative().await
    }

    /// A copy carrying the method, URL, headers and extensions, plus the
    /// body when it is already materialized. Used for conditional requests
    /// and for the originating-request side of a stored entry.
    #[must_use]
    pub fn clone_shape(&self) -> Request {
        Request {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self
                .body
                .bytes()
                .cloned()
                .map(Body::Complete)
                .unwrap_or_default(),
            extensions: self.extensions.clone(),
        }
    }
}

/// An inbound HTTP response.
#[derive(Debug)]
pub struct Response {
    /// The status code.
    pub status: u16,
    /// Ordered header fields.
    pub headers: Headers,
    /// The response body.
    pub body: Body,
    /// Opaque per-response extensions.
    pub extensions: Extensions,
}

impl Response {
    /// Creates a response with empty headers and body.
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::empty(),
            extensions: Extensions::new(),
        }
    }

    /// Appends a header field.
    #[must_use]
    pub fn header(
        mut self,
        name: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets the response body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Fully reads a blocking body into an owned buffer.
    pub fn read(&mut self) -> Result<&Bytes, TransportError> {
        self.body.read_blocking()
    }

    /// Fully reads a body, awaiting cooperative chunk streams.
    pub async fn read_async(&mut self) -> Result<&Bytes, TransportError> {
        self.body.read_cooperative().await
    }

    /// Whether this response was served from the cache.
    #[must_use]
    pub fn from_cache(&self) -> bool {
        matches!(
            self.extensions.get("from_cache"),
            Some(ExtensionValue::Bool(true))
        )
    }

    pub(crate) fn set_from_cache(&mut self, from_cache: bool) {
        self.extensions
            .insert("from_cache", ExtensionValue::Bool(from_cache));
    }

    /// The cache annotations attached to a served response.
    #[must_use]
    pub fn cache_metadata(&self) -> Option<&CacheMetadata> {
        match self.extensions.get("cache_metadata") {
            Some(ExtensionValue::Metadata(metadata)) => Some(metadata),
            _ => None,
        }
    }

    pub(crate) fn set_cache_metadata(&mut self, metadata: CacheMetadata) {
        self.extensions
            .insert("cache_metadata", ExtensionValue::Metadata(metadata));
    }

    /// A copy of this response, available once the body is materialized.
    #[must_use]
    pub fn clone_complete(&self) -> Option<Response> {
        Some(Response {
            status: self.status,
            headers: self.headers.clone(),
            body: Body::Complete(self.body.bytes()?.clone()),
            extensions: self.extensions.clone(),
        })
    }
}

/// A stored entry: the cached response, the request that produced it and
/// the metadata sidecar.
#[derive(Debug)]
pub struct StoredEntry {
    /// The cached response; its body is always fully materialized.
    pub response: Response,
    /// The originating request, retained for `Vary` matching and for
    /// reconstructing conditional requests. Its body is not stored.
    pub request: Request,
    /// The metadata sidecar.
    pub metadata: CacheMetadata,
}

impl StoredEntry {
    /// A deep copy, available when the bodies are materialized. Stored
    /// entries always satisfy this; the in-memory backend relies on it.
    #[must_use]
    pub fn clone_entry(&self) -> Option<StoredEntry> {
        Some(StoredEntry {
            response: self.response.clone_complete()?,
            request: self.request.clone_shape(),
            metadata: self.metadata.clone(),
        })
    }
}
