//! In-memory storage over a bounded LFU map.
//!
//! Entries are deep-copied in and out; no serializer is involved. The
//! admission instant is kept next to each entry so the TTL sweep can age
//! entries out.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{AsyncStorage, Storage, SweepTimer, DEFAULT_CHECK_TTL_EVERY};
use crate::error::{SerializeError, StorageError};
use crate::lfu::LfuCache;
use crate::model::{CacheMetadata, Request, Response, StoredEntry};

/// The default entry capacity.
pub const DEFAULT_CAPACITY: usize = 128;

struct Shared {
    cache: LfuCache<String, (StoredEntry, Instant)>,
}

impl Shared {
    fn new(capacity: usize) -> Self {
        Self { cache: LfuCache::new(capacity) }
    }

    fn store(
        &mut self,
        key: &str,
        response: &Response,
        request: &Request,
        metadata: &CacheMetadata,
    ) -> Result<(), StorageError> {
        let entry = StoredEntry {
            response: response
                .clone_complete()
                .ok_or(SerializeError::UnreadBody)
                .map_err(StorageError::Serialize)?,
            request: request.clone_shape(),
            metadata: metadata.clone(),
        };
        self.cache.insert(key.to_string(), (entry, Instant::now()));
        Ok(())
    }

    fn retrieve(
        &mut self,
        key: &str,
        ttl: Option<Duration>,
    ) -> Option<StoredEntry> {
        let key = key.to_string();
        if let Some(ttl) = ttl {
            let expired = self
                .cache
                .iter()
                .find(|(k, _)| **k == key)
                .is_some_and(|(_, (_, admitted))| admitted.elapsed() > ttl);
            if expired {
                self.cache.remove(&key);
                return None;
            }
        }
        self.cache
            .get(&key)
            .and_then(|(entry, _)| entry.clone_entry())
    }

    fn remove_expired(&mut self, ttl: Duration) {
        let expired: Vec<String> = self
            .cache
            .iter()
            .filter(|(_, (_, admitted))| admitted.elapsed() > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.cache.remove(&key);
        }
    }
}

/// Blocking in-memory storage with LFU eviction.
#[derive(Debug)]
pub struct InMemoryStorage {
    shared: Mutex<Shared>,
    ttl: Option<Duration>,
    sweep: SweepTimer,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").field("cache", &self.cache).finish()
    }
}

impl InMemoryStorage {
    /// Creates storage bounded to the default capacity of 128 entries.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates storage bounded to `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Mutex::new(Shared::new(capacity)),
            ttl: None,
            sweep: SweepTimer::new(DEFAULT_CHECK_TTL_EVERY),
        }
    }

    /// Sets the maximum entry age.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets how often the on-access sweep may run.
    #[must_use]
    pub fn with_check_ttl_every(mut self, every: Duration) -> Self {
        self.sweep = SweepTimer::new(every);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sweep_if_due(&self) {
        if let Some(ttl) = self.ttl {
            if self.sweep.due() {
                self.lock().remove_expired(ttl);
            }
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for InMemoryStorage {
    fn store(
        &self,
        key: &str,
        response: &Response,
        request: &Request,
        metadata: &CacheMetadata,
    ) -> Result<(), StorageError> {
        self.lock().store(key, response, request, metadata)?;
        self.sweep_if_due();
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<StoredEntry>, StorageError> {
        self.sweep_if_due();
        Ok(self.lock().retrieve(key, self.ttl))
    }

    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Cooperative in-memory storage with LFU eviction.
#[derive(Debug)]
pub struct AsyncInMemoryStorage {
    shared: tokio::sync::Mutex<Shared>,
    ttl: Option<Duration>,
    sweep: SweepTimer,
}

impl AsyncInMemoryStorage {
    /// Creates storage bounded to the default capacity of 128 entries.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates storage bounded to `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: tokio::sync::Mutex::new(Shared::new(capacity)),
            ttl: None,
            sweep: SweepTimer::new(DEFAULT_CHECK_TTL_EVERY),
        }
    }

    /// Sets the maximum entry age.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets how often the on-access sweep may run.
    #[must_use]
    pub fn with_check_ttl_every(mut self, every: Duration) -> Self {
        self.sweep = SweepTimer::new(every);
        self
    }

    async fn sweep_if_due(&self) {
        if let Some(ttl) = self.ttl {
            if self.sweep.due() {
                self.shared.lock().await.remove_expired(ttl);
            }
        }
    }
}

impl Default for AsyncInMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AsyncStorage for AsyncInMemoryStorage {
    async fn store(
        &self,
        key: &str,
        response: &Response,
        request: &Request,
        metadata: &CacheMetadata,
    ) -> Result<(), StorageError> {
        self.shared.lock().await.store(key, response, request, metadata)?;
        self.sweep_if_due().await;
        Ok(())
    }

    async fn retrieve(
        &self,
        key: &str,
    ) -> Result<Option<StoredEntry>, StorageError> {
        self.sweep_if_due().await;
        Ok(self.shared.lock().await.retrieve(key, self.ttl))
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::SystemTime;
    use url::Url;

    fn entry(status: u16) -> (Response, Request, CacheMetadata) {
        let response =
            Response::new(status).body(Bytes::from_static(b"body"));
        let request =
            Request::new("GET", Url::parse("https://example.com").unwrap());
        let metadata = CacheMetadata::new("k", SystemTime::now());
        (response, request, metadata)
    }

    #[test]
    fn store_retrieve_replace() {
        let storage = InMemoryStorage::new();
        let (response, request, metadata) = entry(200);
        storage.store("k", &response, &request, &metadata).unwrap();
        assert_eq!(
            storage.retrieve("k").unwrap().unwrap().response.status,
            200
        );
        let (response, request, metadata) = entry(301);
        storage.store("k", &response, &request, &metadata).unwrap();
        assert_eq!(
            storage.retrieve("k").unwrap().unwrap().response.status,
            301
        );
        assert!(storage.retrieve("other").unwrap().is_none());
    }

    #[test]
    fn capacity_evicts_least_frequent() {
        let storage = InMemoryStorage::with_capacity(2);
        for key in ["a", "b"] {
            let (response, request, metadata) = entry(200);
            storage.store(key, &response, &request, &metadata).unwrap();
        }
        // touch "a" so "b" is the cold key
        storage.retrieve("a").unwrap();
        let (response, request, metadata) = entry(200);
        storage.store("c", &response, &request, &metadata).unwrap();
        assert!(storage.retrieve("a").unwrap().is_some());
        assert!(storage.retrieve("b").unwrap().is_none());
        assert!(storage.retrieve("c").unwrap().is_some());
    }

    #[test]
    fn ttl_expires_entries() {
        let storage = InMemoryStorage::new()
            .with_ttl(Duration::ZERO)
            .with_check_ttl_every(Duration::ZERO);
        let (response, request, metadata) = entry(200);
        storage.store("k", &response, &request, &metadata).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(storage.retrieve("k").unwrap().is_none());
    }

    #[test]
    fn unread_body_is_a_storage_error() {
        let storage = InMemoryStorage::new();
        let mut response = Response::new(200);
        response.body =
            crate::model::Body::Iter(Box::new(std::iter::empty()));
        let request =
            Request::new("GET", Url::parse("https://example.com").unwrap());
        let metadata = CacheMetadata::new("k", SystemTime::now());
        assert!(storage.store("k", &response, &request, &metadata).is_err());
    }

    #[tokio::test]
    async fn async_store_retrieve() {
        let storage = AsyncInMemoryStorage::with_capacity(4);
        let (response, request, metadata) = entry(200);
        storage.store("k", &response, &request, &metadata).await.unwrap();
        assert!(storage.retrieve("k").await.unwrap().is_some());
        storage.close().await.unwrap();
    }
}
