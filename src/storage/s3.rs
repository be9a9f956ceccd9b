//! Object store storage over S3.
//!
//! One object per key in a flat namespace. The store has no native
//! per-object expiry hook we can set at write time, so the TTL sweep
//! lists objects and deletes those whose `LastModified` exceeds the
//! configured age. Credentials and bucket reachability are verified at
//! construction.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use log::debug;

use super::{AsyncStorage, SweepTimer, DEFAULT_CHECK_TTL_EVERY};
use crate::error::StorageError;
use crate::model::{CacheMetadata, Request, Response, StoredEntry};
use crate::serializer::{JsonSerializer, Serializer};

fn object_store_error(err: impl std::fmt::Display) -> StorageError {
    StorageError::ObjectStore(err.to_string())
}

/// Cooperative S3 object store storage.
pub struct S3Storage {
    client: Client,
    bucket: String,
    serializer: Arc<dyn Serializer>,
    ttl: Option<Duration>,
    sweep: SweepTimer,
}

impl S3Storage {
    /// Connects with ambient AWS configuration and verifies the bucket is
    /// reachable. Missing credentials or an unknown bucket fail here, not
    /// on first use.
    pub async fn new(bucket: impl Into<String>) -> Result<Self, StorageError> {
        let config = aws_config::load_defaults(
            aws_config::BehaviorVersion::latest(),
        )
        .await;
        Self::with_client(Client::new(&config), bucket).await
    }

    /// Connects with an existing client and verifies the bucket is
    /// reachable.
    pub async fn with_client(
        client: Client,
        bucket: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let bucket = bucket.into();
        client.head_bucket().bucket(&bucket).send().await.map_err(|err| {
            StorageError::Misconfigured(format!(
                "s3 bucket {bucket} is not reachable: {err}"
            ))
        })?;
        Ok(Self {
            client,
            bucket,
            serializer: Arc::new(JsonSerializer),
            ttl: None,
            sweep: SweepTimer::new(DEFAULT_CHECK_TTL_EVERY),
        })
    }

    /// Replaces the serializer.
    #[must_use]
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Sets the maximum object age.
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

    async fn remove_expired(&self) -> Result<(), StorageError> {
        let Some(ttl) = self.ttl else { return Ok(()) };
        if !self.sweep.due() {
            return Ok(());
        }
        let cutoff = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .saturating_sub(ttl)
            .as_secs() as i64;
        let mut continuation: Option<String> = None;
        loop {
            let listing = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(object_store_error)?;
            for object in listing.contents() {
                let Some(key) = object.key() else { continue };
                let aged = object
                    .last_modified()
                    .is_some_and(|modified| modified.secs() < cutoff);
                if aged {
                    let _ = self
                        .client
                        .delete_object()
                        .bucket(&self.bucket)
                        .key(key)
                        .send()
                        .await;
                }
            }
            match listing.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Storage")
            .field("bucket", &self.bucket)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AsyncStorage for S3Storage {
    async fn store(
        &self,
        key: &str,
        response: &Response,
        request: &Request,
        metadata: &CacheMetadata,
    ) -> Result<(), StorageError> {
        let encoded = self.serializer.dumps(response, request, metadata)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(encoded))
            .send()
            .await
            .map_err(object_store_error)?;
        self.remove_expired().await
    }

    async fn retrieve(
        &self,
        key: &str,
    ) -> Result<Option<StoredEntry>, StorageError> {
        self.remove_expired().await?;
        let object = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(object) => object,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    return Ok(None);
                }
                return Err(object_store_error(service_err));
            }
        };
        let payload = object
            .body
            .collect()
            .await
            .map_err(object_store_error)?
            .into_bytes();
        if payload.is_empty() {
            debug!("empty s3 object for key {key}, treating as absent");
            return Ok(None);
        }
        match self.serializer.loads(&payload) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                debug!("corrupt s3 object for key {key}: {err}");
                Ok(None)
            }
        }
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
