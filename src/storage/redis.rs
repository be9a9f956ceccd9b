//! Distributed key/value storage over Redis.
//!
//! TTL enforcement is delegated to the store: entries are written with a
//! per-key `PX` expiry, so no in-process sweep runs. Retrievals and
//! admissions are independent round-trips with no cross-operation
//! transaction.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use super::{AsyncStorage, Storage};
use crate::error::StorageError;
use crate::model::{CacheMetadata, Request, Response, StoredEntry};
use crate::serializer::{JsonSerializer, Serializer};

fn set_command(key: &str, data: &[u8], ttl: Option<Duration>) -> redis::Cmd {
    let mut cmd = redis::cmd("SET");
    cmd.arg(key).arg(data);
    if let Some(ttl) = ttl {
        cmd.arg("PX").arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
    }
    cmd
}

fn decode(
    key: &str,
    payload: Option<Vec<u8>>,
    serializer: &dyn Serializer,
) -> Option<StoredEntry> {
    let payload = payload?;
    if payload.is_empty() {
        debug!("empty redis value for key {key}, treating as absent");
        return None;
    }
    match serializer.loads(&payload) {
        Ok(entry) => Some(entry),
        Err(err) => {
            debug!("corrupt redis value for key {key}: {err}");
            None
        }
    }
}

/// Blocking Redis storage.
pub struct RedisStorage {
    connection: Mutex<redis::Connection>,
    serializer: Arc<dyn Serializer>,
    ttl: Option<Duration>,
}

impl RedisStorage {
    /// Connects using an existing client. Fails fast when the server is
    /// unreachable.
    pub fn new(client: &redis::Client) -> Result<Self, StorageError> {
        let connection = client.get_connection().map_err(|err| {
            StorageError::Misconfigured(format!(
                "cannot connect to redis: {err}"
            ))
        })?;
        Ok(Self {
            connection: Mutex::new(connection),
            serializer: Arc::new(JsonSerializer),
            ttl: None,
        })
    }

    /// Connects to a redis URL such as `redis://127.0.0.1/`.
    pub fn from_url(url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url).map_err(|err| {
            StorageError::Misconfigured(format!("invalid redis url: {err}"))
        })?;
        Self::new(&client)
    }

    /// Replaces the serializer.
    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Sets the per-key expiry handed to the store.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn lock(&self) -> MutexGuard<'_, redis::Connection> {
        self.connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl Storage for RedisStorage {
    fn store(
        &self,
        key: &str,
        response: &Response,
        request: &Request,
        metadata: &CacheMetadata,
    ) -> Result<(), StorageError> {
        let encoded = self.serializer.dumps(response, request, metadata)?;
        set_command(key, &encoded, self.ttl)
            .query::<()>(&mut *self.lock())?;
        Ok(())
    }

    fn retrieve(&self, key: &str) -> Result<Option<StoredEntry>, StorageError> {
        let payload: Option<Vec<u8>> =
            redis::cmd("GET").arg(key).query(&mut *self.lock())?;
        Ok(decode(key, payload, self.serializer.as_ref()))
    }

    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Cooperative Redis storage over a multiplexed connection.
pub struct AsyncRedisStorage {
    connection: redis::aio::MultiplexedConnection,
    serializer: Arc<dyn Serializer>,
    ttl: Option<Duration>,
}

impl AsyncRedisStorage {
    /// Connects using an existing client. Fails fast when the server is
    /// unreachable.
    pub async fn new(client: &redis::Client) -> Result<Self, StorageError> {
        let connection =
            client.get_multiplexed_async_connection().await.map_err(
                |err| {
                    StorageError::Misconfigured(format!(
                        "cannot connect to redis: {err}"
                    ))
                },
            )?;
        Ok(Self {
            connection,
            serializer: Arc::new(JsonSerializer),
            ttl: None,
        })
    }

    /// Connects to a redis URL such as `redis://127.0.0.1/`.
    pub async fn from_url(url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url).map_err(|err| {
            StorageError::Misconfigured(format!("invalid redis url: {err}"))
        })?;
        Self::new(&client).await
    }

    /// Replaces the serializer.
    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Sets the per-key expiry handed to the store.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

impl std::fmt::Debug for AsyncRedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncRedisStorage")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AsyncStorage for AsyncRedisStorage {
    async fn store(
        &self,
        key: &str,
        response: &Response,
        request: &Request,
        metadata: &CacheMetadata,
    ) -> Result<(), StorageError> {
        let encoded = self.serializer.dumps(response, request, metadata)?;
        let mut connection = self.connection.clone();
        set_command(key, &encoded, self.ttl)
            .query_async::<()>(&mut connection)
            .await?;
        Ok(())
    }

    async fn retrieve(
        &self,
        key: &str,
    ) -> Result<Option<StoredEntry>, StorageError> {
        let mut connection = self.connection.clone();
        let payload: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await?;
        Ok(decode(key, payload, self.serializer.as_ref()))
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_command_carries_px_expiry() {
        let cmd =
            set_command("k", b"v", Some(Duration::from_secs(2)));
        let packed = cmd.get_packed_command();
        let rendered = String::from_utf8_lossy(&packed);
        assert!(rendered.contains("PX"));
        assert!(rendered.contains("2000"));
        let cmd = set_command("k", b"v", None);
        let packed = cmd.get_packed_command();
        assert!(!String::from_utf8_lossy(&packed).contains("PX"));
    }

    #[test]
    fn invalid_url_fails_fast() {
        assert!(matches!(
            RedisStorage::from_url("not a url"),
            Err(StorageError::Misconfigured(_))
        ));
    }
}
