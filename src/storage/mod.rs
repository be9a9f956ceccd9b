//! Storage backends for cached entries.
//!
//! Every backend speaks the same four-operation contract: admit (or
//! replace) an entry, retrieve one, sweep entries past their TTL and
//! release resources on close. Two trait families cover the two execution
//! models: [`Storage`] for parallel threads with blocking I/O and
//! [`AsyncStorage`] for cooperative tasks. A wrapper only accepts
//! backends of its own family, so mixing the models is a compile error
//! rather than a runtime surprise.
//!
//! Shared semantics, regardless of backend:
//!
//! - re-admission replaces the prior entry atomically; concurrent readers
//!   observe either the old entry or the new one, never a partial write;
//! - unknown keys, empty payloads, corrupt payloads and TTL-expired
//!   entries all read as absent (corruption is logged at debug level);
//! - when a TTL is configured, an on-access sweep removes aged entries,
//!   throttled to once per `check_ttl_every` per instance.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::model::{CacheMetadata, Request, Response, StoredEntry};

mod file;
mod memory;
#[cfg(feature = "manager-redis")]
mod redis;
#[cfg(feature = "manager-s3")]
mod s3;
#[cfg(feature = "manager-sqlite")]
mod sqlite;

pub use file::{AsyncFileStorage, FileStorage};
pub use memory::{AsyncInMemoryStorage, InMemoryStorage};
#[cfg(feature = "manager-redis")]
pub use redis::{AsyncRedisStorage, RedisStorage};
#[cfg(feature = "manager-s3")]
pub use s3::S3Storage;
#[cfg(feature = "manager-sqlite")]
pub use sqlite::SqliteStorage;

/// How often an on-access TTL sweep may run, unless configured otherwise.
pub const DEFAULT_CHECK_TTL_EVERY: Duration = Duration::from_secs(60);

/// Blocking storage contract.
pub trait Storage: Send + Sync {
    /// Admits an entry, replacing any prior entry under the same key. The
    /// response body must be fully materialized.
    fn store(
        &self,
        key: &str,
        response: &Response,
        request: &Request,
        metadata: &CacheMetadata,
    ) -> Result<(), StorageError>;

    /// Retrieves the entry under `key`, or `None` for unknown, corrupt or
    /// expired entries.
    fn retrieve(&self, key: &str) -> Result<Option<StoredEntry>, StorageError>;

    /// Releases backend resources.
    fn close(&self) -> Result<(), StorageError>;
}

/// Cooperative storage contract; semantics identical to [`Storage`].
#[async_trait]
pub trait AsyncStorage: Send + Sync {
    /// Admits an entry, replacing any prior entry under the same key. The
    /// response body must be fully materialized.
    async fn store(
        &self,
        key: &str,
        response: &Response,
        request: &Request,
        metadata: &CacheMetadata,
    ) -> Result<(), StorageError>;

    /// Retrieves the entry under `key`, or `None` for unknown, corrupt or
    /// expired entries.
    async fn retrieve(
        &self,
        key: &str,
    ) -> Result<Option<StoredEntry>, StorageError>;

    /// Releases backend resources.
    async fn close(&self) -> Result<(), StorageError>;
}

/// Rate limit for on-access TTL sweeps.
///
/// The critical section is a timestamp compare-and-set, so a plain mutex
/// is used from both execution families.
#[derive(Debug)]
pub(crate) struct SweepTimer {
    every: Duration,
    last: Mutex<Option<Instant>>,
}

impl SweepTimer {
    pub(crate) fn new(every: Duration) -> Self {
        Self { every, last: Mutex::new(None) }
    }

    /// Whether a sweep is due now; arms the timer when it is.
    pub(crate) fn due(&self) -> bool {
        let mut last =
            self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.every => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_timer_arms_once_per_interval() {
        let timer = SweepTimer::new(Duration::from_secs(3600));
        assert!(timer.due());
        assert!(!timer.due());
    }

    #[test]
    fn zero_interval_always_due() {
        let timer = SweepTimer::new(Duration::ZERO);
        assert!(timer.due());
        assert!(timer.due());
    }
}
