use thiserror::Error;

/// A `Result` typedef defaulting to the crate-level [`Error`] type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure raised by a storage backend while admitting or retrieving an
/// entry.
///
/// Unknown keys, expired entries and corrupt payloads are *not* errors;
/// backends report those as an absent entry. This type covers genuine
/// backend unavailability, which is always propagated to the caller.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not complete an I/O operation.
    #[error("storage i/o failure")]
    Io(#[from] std::io::Error),
    /// Error from the embedded SQL store.
    #[cfg(feature = "manager-sqlite")]
    #[error("sqlite storage failure")]
    Sqlite(#[from] rusqlite::Error),
    /// Error from the distributed key/value store.
    #[cfg(feature = "manager-redis")]
    #[error("redis storage failure")]
    Redis(#[from] redis::RedisError),
    /// Error from the object store.
    #[cfg(feature = "manager-s3")]
    #[error("object store failure: {0}")]
    ObjectStore(String),
    /// An entry could not be encoded for admission.
    #[error("failed to encode cache entry")]
    Serialize(#[from] SerializeError),
    /// The backend was constructed with a missing or unusable dependency.
    #[error("storage backend misconfigured: {0}")]
    Misconfigured(String),
}

/// Failure raised by the wrapped transport while dispatching a request.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The origin could not be reached. A stored response may still be
    /// served when the controller allows stale fallback.
    #[error("connection to the origin failed: {0}")]
    Connect(String),
    /// A lazy message body failed while being read to completion.
    #[error("failed to read message body")]
    Body(#[source] std::io::Error),
    /// Any other transport failure.
    #[error("transport failure: {0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Failure raised by a [`Serializer`](crate::Serializer) round-trip.
#[derive(Debug, Error)]
pub enum SerializeError {
    /// The encoded form does not describe a stored entry.
    #[error("malformed cache entry: {0}")]
    Malformed(String),
    /// The response body has not been read to completion. Admitting a
    /// half-streamed entry is a programming error in the caller.
    #[error("response body has not been read to completion")]
    UnreadBody,
    /// Error from the JSON encoder.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Error from the binary encoder.
    #[error(transparent)]
    Postcard(#[from] postcard::Error),
}

/// Top-level error for a cached dispatch.
#[derive(Debug, Error)]
pub enum Error {
    /// A storage backend failed; never silently downgraded to a miss.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The wrapped transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Error {
    /// Whether this error is a transport-level connection failure, the
    /// trigger for the serve-stale fallback.
    #[must_use]
    pub fn is_connect(&self) -> bool {
        matches!(self, Error::Transport(TransportError::Connect(_)))
    }
}
