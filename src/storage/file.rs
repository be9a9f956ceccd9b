//! Filesystem storage: one file per key under a base directory.
//!
//! Keys are hex fingerprints and therefore filesystem-safe as names.
//! Writes land in a temporary sibling and are renamed into place, so a
//! concurrent reader observes either the prior entry or the new one. An
//! empty file (a partial write interrupted by a crash) reads as absent.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use log::debug;

use super::{
    AsyncStorage, Storage, SweepTimer, DEFAULT_CHECK_TTL_EVERY,
};
use crate::error::StorageError;
use crate::model::{CacheMetadata, Request, Response, StoredEntry};
use crate::serializer::{JsonSerializer, Serializer};

const DEFAULT_BASE_PATH: &str = ".cache/hishel";

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn expired(modified: SystemTime, ttl: Duration) -> bool {
    SystemTime::now()
        .duration_since(modified)
        .is_ok_and(|age| age > ttl)
}

/// Blocking filesystem storage.
pub struct FileStorage {
    base_path: PathBuf,
    serializer: Arc<dyn Serializer>,
    ttl: Option<Duration>,
    sweep: SweepTimer,
    lock: Mutex<()>,
}

impl FileStorage {
    /// Opens storage under the default base directory `.cache/hishel`.
    pub fn new() -> Result<Self, StorageError> {
        Self::in_dir(DEFAULT_BASE_PATH)
    }

    /// Opens storage under `base_path`, creating it when missing.
    pub fn in_dir(base_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            serializer: Arc::new(JsonSerializer),
            ttl: None,
            sweep: SweepTimer::new(DEFAULT_CHECK_TTL_EVERY),
            lock: Mutex::new(()),
        })
    }

    /// Replaces the serializer.
    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Sets the maximum age after which entries read as absent and are
    /// removed by the sweep.
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

    fn entry_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    fn remove_expired(&self) {
        let Some(ttl) = self.ttl else { return };
        if !self.sweep.due() {
            return;
        }
        let _guard = lock_unpoisoned(&self.lock);
        let Ok(entries) = std::fs::read_dir(&self.base_path) else {
            return;
        };
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else { continue };
            if !metadata.is_file() {
                continue;
            }
            if metadata.modified().is_ok_and(|m| expired(m, ttl)) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage")
            .field("base_path", &self.base_path)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl Storage for FileStorage {
    fn store(
        &self,
        key: &str,
        response: &Response,
        request: &Request,
        metadata: &CacheMetadata,
    ) -> Result<(), StorageError> {
        let encoded = self.serializer.dumps(response, request, metadata)?;
        let path = self.entry_path(key);
        let tmp = self
            .base_path
            .join(format!("{key}.{}.tmp", std::process::id()));
        {
            let _guard = lock_unpoisoned(&self.lock);
            std::fs::write(&tmp, &encoded)?;
            std::fs::rename(&tmp, &path)?;
        }
        self.remove_expired();
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<StoredEntry>, StorageError> {
        self.remove_expired();
        let path = self.entry_path(key);
        let _guard = lock_unpoisoned(&self.lock);
        if let Some(ttl) = self.ttl {
            match std::fs::metadata(&path) {
                Ok(meta) if meta.modified().is_ok_and(|m| expired(m, ttl)) => {
                    let _ = std::fs::remove_file(&path);
                    return Ok(None);
                }
                _ => {}
            }
        }
        let encoded = match std::fs::read(&path) {
            Ok(encoded) => encoded,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        if encoded.is_empty() {
            debug!("empty cache file for key {key}, treating as absent");
            return Ok(None);
        }
        match self.serializer.loads(&encoded) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                debug!("corrupt cache file for key {key}: {err}");
                Ok(None)
            }
        }
    }

    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Cooperative filesystem storage.
pub struct AsyncFileStorage {
    base_path: PathBuf,
    serializer: Arc<dyn Serializer>,
    ttl: Option<Duration>,
    sweep: SweepTimer,
    lock: tokio::sync::Mutex<()>,
}

impl AsyncFileStorage {
    /// Opens storage under the default base directory `.cache/hishel`.
    pub async fn new() -> Result<Self, StorageError> {
        Self::in_dir(DEFAULT_BASE_PATH).await
    }

    /// Opens storage under `base_path`, creating it when missing.
    pub async fn in_dir(
        base_path: impl Into<PathBuf>,
    ) -> Result<Self, StorageError> {
        let base_path = base_path.into();
        tokio::fs::create_dir_all(&base_path).await?;
        Ok(Self {
            base_path,
            serializer: Arc::new(JsonSerializer),
            ttl: None,
            sweep: SweepTimer::new(DEFAULT_CHECK_TTL_EVERY),
            lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Replaces the serializer.
    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Sets the maximum age after which entries read as absent and are
    /// removed by the sweep.
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

    fn entry_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    async fn remove_expired(&self) {
        let Some(ttl) = self.ttl else { return };
        if !self.sweep.due() {
            return;
        }
        let _guard = self.lock.lock().await;
        let Ok(mut entries) = tokio::fs::read_dir(&self.base_path).await
        else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else { continue };
            if !metadata.is_file() {
                continue;
            }
            if metadata.modified().is_ok_and(|m| expired(m, ttl)) {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }
}

impl std::fmt::Debug for AsyncFileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFileStorage")
            .field("base_path", &self.base_path)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AsyncStorage for AsyncFileStorage {
    async fn store(
        &self,
        key: &str,
        response: &Response,
        request: &Request,
        metadata: &CacheMetadata,
    ) -> Result<(), StorageError> {
        let encoded = self.serializer.dumps(response, request, metadata)?;
        let path = self.entry_path(key);
        let tmp = self
            .base_path
            .join(format!("{key}.{}.tmp", std::process::id()));
        {
            let _guard = self.lock.lock().await;
            tokio::fs::write(&tmp, &encoded).await?;
            tokio::fs::rename(&tmp, &path).await?;
        }
        self.remove_expired().await;
        Ok(())
    }

    async fn retrieve(
        &self,
        key: &str,
    ) -> Result<Option<StoredEntry>, StorageError> {
        self.remove_expired().await;
        let path = self.entry_path(key);
        let _guard = self.lock.lock().await;
        if let Some(ttl) = self.ttl {
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.modified().is_ok_and(|m| expired(m, ttl)) => {
                    let _ = tokio::fs::remove_file(&path).await;
                    return Ok(None);
                }
                _ => {}
            }
        }
        let encoded = match tokio::fs::read(&path).await {
            Ok(encoded) => encoded,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        if encoded.is_empty() {
            debug!("empty cache file for key {key}, treating as absent");
            return Ok(None);
        }
        match self.serializer.loads(&encoded) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                debug!("corrupt cache file for key {key}: {err}");
                Ok(None)
            }
        }
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

impl FileStorage {
    #[cfg(test)]
    pub(crate) fn base_path_for_tests(&self) -> &std::path::Path {
        &self.base_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::BinarySerializer;
    use bytes::Bytes;
    use url::Url;

    fn entry() -> (Response, Request, CacheMetadata) {
        let response = Response::new(200)
            .header("Cache-Control", "max-age=60")
            .body(Bytes::from_static(b"payload"));
        let request =
            Request::new("GET", Url::parse("https://example.com").unwrap());
        let metadata = CacheMetadata::new("k", SystemTime::now());
        (response, request, metadata)
    }

    #[test]
    fn store_then_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::in_dir(dir.path()).unwrap();
        let (response, request, metadata) = entry();
        storage.store("deadbeef", &response, &request, &metadata).unwrap();
        let stored = storage.retrieve("deadbeef").unwrap().unwrap();
        assert_eq!(stored.response.status, 200);
        assert_eq!(
            stored.response.body.bytes().unwrap().as_ref(),
            b"payload"
        );
        assert!(storage.retrieve("cafebabe").unwrap().is_none());
    }

    #[test]
    fn readmission_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::in_dir(dir.path()).unwrap();
        let (response, request, metadata) = entry();
        storage.store("k", &response, &request, &metadata).unwrap();
        let replacement = Response::new(404).body(Bytes::from_static(b"gone"));
        storage.store("k", &replacement, &request, &metadata).unwrap();
        let stored = storage.retrieve("k").unwrap().unwrap();
        assert_eq!(stored.response.status, 404);
    }

    #[test]
    fn empty_file_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::in_dir(dir.path()).unwrap();
        let (response, request, metadata) = entry();
        storage.store("k", &response, &request, &metadata).unwrap();
        std::fs::write(storage.base_path_for_tests().join("k"), b"").unwrap();
        assert!(storage.retrieve("k").unwrap().is_none());
        // re-admission after the corrupt read works again
        storage.store("k", &response, &request, &metadata).unwrap();
        assert!(storage.retrieve("k").unwrap().is_some());
    }

    #[test]
    fn corrupt_file_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::in_dir(dir.path()).unwrap();
        std::fs::write(dir.path().join("k"), b"not a cache entry").unwrap();
        assert!(storage.retrieve("k").unwrap().is_none());
    }

    #[test]
    fn expired_entry_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::in_dir(dir.path())
            .unwrap()
            .with_ttl(Duration::ZERO)
            .with_check_ttl_every(Duration::ZERO);
        let (response, request, metadata) = entry();
        storage.store("k", &response, &request, &metadata).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(storage.retrieve("k").unwrap().is_none());
        assert!(!dir.path().join("k").exists());
    }

    #[test]
    fn binary_serializer_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::in_dir(dir.path())
            .unwrap()
            .with_serializer(Arc::new(BinarySerializer));
        let (response, request, metadata) = entry();
        storage.store("k", &response, &request, &metadata).unwrap();
        let stored = storage.retrieve("k").unwrap().unwrap();
        assert_eq!(
            stored.response.body.bytes().unwrap().as_ref(),
            b"payload"
        );
    }

    #[tokio::test]
    async fn async_store_then_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let storage = AsyncFileStorage::in_dir(dir.path()).await.unwrap();
        let (response, request, metadata) = entry();
        storage
            .store("deadbeef", &response, &request, &metadata)
            .await
            .unwrap();
        let stored = storage.retrieve("deadbeef").await.unwrap().unwrap();
        assert_eq!(
            stored.response.body.bytes().unwrap().as_ref(),
            b"payload"
        );
        assert!(storage.retrieve("cafebabe").await.unwrap().is_none());
        storage.close().await.unwrap();
    }
}
