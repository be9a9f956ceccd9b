#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! An HTTP caching layer that sits between a client and an origin (or any
//! lower-level request dispatcher) and follows the shared/private-cache
//! semantics of RFC 9111: freshness computation, conditional validation
//! with `If-None-Match`/`If-Modified-Since`, stale fallback on connection
//! failure, `Vary`-keyed variant selection and the request directives
//! `no-cache`, `no-store`, `max-age`, `max-stale`, `min-fresh` and
//! `only-if-cached`.
//!
//! The crate is built from three pieces:
//!
//! - the [`Controller`], a pure decision engine that never performs I/O;
//! - a storage contract ([`Storage`] / [`AsyncStorage`]) with filesystem,
//!   embedded SQL, distributed key/value, object store and in-memory
//!   backends sharing one set of semantics;
//! - the wrappers ([`CacheTransport`] / [`AsyncCacheTransport`]) that
//!   implement the same dispatch contract as the transport they wrap, so
//!   they can be stacked anywhere a transport is expected.
//!
//! ## Basic usage
//!
//! ```no_run
//! use hishel::{CacheTransport, FileStorage, MockTransport, Transport};
//!
//! # fn main() -> Result<(), hishel::Error> {
//! let transport = MockTransport::new(); // any Transport implementation
//! let storage = FileStorage::new()?;    // entries under .cache/hishel
//! let cache = CacheTransport::new(transport, storage);
//!
//! let request = hishel::Request::new(
//!     "GET",
//!     url::Url::parse("https://example.com").unwrap(),
//! );
//! let response = cache.handle(request)?;
//! println!("served from cache: {}", response.from_cache());
//! # Ok(())
//! # }
//! ```
//!
//! ## Tuning decisions
//!
//! The [`Controller`] carries every knob of the decision engine:
//!
//! ```
//! use hishel::Controller;
//!
//! let controller = Controller::new()
//!     .with_cacheable_methods(&["GET", "HEAD", "POST"])
//!     .with_allow_heuristics(true)
//!     .with_allow_stale(true);
//! ```
//!
//! ## Execution models
//!
//! Every piece exists for parallel threads with blocking I/O and for
//! cooperative tasks; the decision engine is shared verbatim between the
//! two. Backends implement the family their underlying library supports
//! natively, and the type system keeps the families apart: an
//! [`AsyncCacheTransport`] does not accept a blocking [`Storage`].
//!
//! ## Storage backends
//!
//! | Backend | Families | Feature |
//! |---|---|---|
//! | [`FileStorage`] / [`AsyncFileStorage`] | blocking + cooperative | built in |
//! | [`InMemoryStorage`] / [`AsyncInMemoryStorage`] | blocking + cooperative | built in |
//! | [`SqliteStorage`] | blocking | `manager-sqlite` |
//! | [`RedisStorage`] / [`AsyncRedisStorage`] | blocking + cooperative | `manager-redis` |
//! | [`S3Storage`] | cooperative | `manager-s3` |

mod clock;
mod controller;
mod error;
mod headers;
mod key;
mod lfu;
mod model;
mod serializer;
mod storage;
mod transport;
mod wrapper;

pub use clock::{Clock, SystemClock};
pub use controller::{CacheDecision, Controller};
pub use error::{Error, Result, SerializeError, StorageError, TransportError};
pub use headers::{
    fmt_http_date, is_hop_by_hop, parse_http_date, CacheControl, Headers,
    MaxStale, Vary,
};
pub use key::{generate_key, KeyGenerator, DEFAULT_BODY_KEYED_METHODS};
pub use lfu::LfuCache;
pub use model::{
    Body, CacheMetadata, ExtensionValue, Extensions, Request, Response,
    StoredEntry,
};
pub use serializer::{BinarySerializer, JsonSerializer, Serializer};
pub use storage::{
    AsyncFileStorage, AsyncInMemoryStorage, AsyncStorage, FileStorage,
    InMemoryStorage, Storage, DEFAULT_CHECK_TTL_EVERY,
};
#[cfg(feature = "manager-redis")]
#[cfg_attr(docsrs, doc(cfg(feature = "manager-redis")))]
pub use storage::{AsyncRedisStorage, RedisStorage};
#[cfg(feature = "manager-s3")]
#[cfg_attr(docsrs, doc(cfg(feature = "manager-s3")))]
pub use storage::S3Storage;
#[cfg(feature = "manager-sqlite")]
#[cfg_attr(docsrs, doc(cfg(feature = "manager-sqlite")))]
pub use storage::SqliteStorage;
pub use transport::{
    AsyncMockTransport, AsyncTransport, MockTransport, Transport,
};
pub use wrapper::{AsyncCacheTransport, CacheTransport};

#[cfg(test)]
mod test;
