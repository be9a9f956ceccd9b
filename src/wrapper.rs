//! The cache orchestrator.
//!
//! [`CacheTransport`] and [`AsyncCacheTransport`] wrap a transport and a
//! storage backend of the matching execution family and implement the
//! same dispatch contract, so they can stand wherever the wrapped
//! transport could. All decision making lives in the shared
//! [`Controller`]; the wrappers only move data between the transport, the
//! store and the caller.

use log::debug;

use crate::controller::{CacheDecision, Controller};
use crate::error::Error;
use crate::headers::CacheControl;
use crate::model::{CacheMetadata, Request, Response, StoredEntry};
use crate::storage::{AsyncStorage, Storage};
use crate::transport::{AsyncTransport, Transport};

fn gateway_timeout() -> Response {
    let mut response = Response::new(504);
    response.set_from_cache(false);
    response
}

/// A blocking caching layer over a blocking transport.
#[derive(Debug)]
pub struct CacheTransport<T: Transport, S: Storage> {
    transport: T,
    storage: S,
    controller: Controller,
}

impl<T: Transport, S: Storage> CacheTransport<T, S> {
    /// Wraps `transport` with `storage` and a default [`Controller`].
    pub fn new(transport: T, storage: S) -> Self {
        Self { transport, storage, controller: Controller::new() }
    }

    /// Replaces the controller.
    #[must_use]
    pub fn with_controller(mut self, controller: Controller) -> Self {
        self.controller = controller;
        self
    }

    /// Releases storage resources.
    pub fn close(&self) -> Result<(), Error> {
        Ok(self.storage.close()?)
    }

    fn serve_hit(
        &self,
        key: &str,
        mut response: Response,
        entry: &StoredEntry,
    ) -> Response {
        let mut metadata = entry.metadata.clone();
        metadata.number_of_uses += 1;
        // counter updates are advisory; a failed re-store never fails the hit
        if let Err(err) = self.storage.store(
            key,
            &entry.response,
            &entry.request,
            &metadata,
        ) {
            debug!("failed to persist use counter for {key}: {err}");
        }
        response.set_from_cache(true);
        response.set_cache_metadata(metadata);
        response
    }
}

impl<T: Transport, S: Storage> Transport for CacheTransport<T, S> {
    fn handle(&self, mut request: Request) -> Result<Response, Error> {
        if request.cache_disabled() {
            // forced pass-through: the store is neither consulted nor updated
            let mut response = self.transport.handle(request)?;
            response.set_from_cache(false);
            return Ok(response);
        }

        if self.controller.body_keyed(&request.method) {
            request.read()?;
        }
        let key = self.controller.cache_key(&request);
        let only_if_cached =
            CacheControl::from_headers(&request.headers).only_if_cached;

        if let Some(entry) = self.storage.retrieve(&key)? {
            match self
                .controller
                .construct_response_from_cache(&request, &entry)
            {
                CacheDecision::Fresh(response) => {
                    return Ok(self.serve_hit(&key, response, &entry));
                }
                CacheDecision::NeedsValidation(validation) => {
                    if only_if_cached {
                        return Ok(gateway_timeout());
                    }
                    let StoredEntry {
                        response: stored_response,
                        request: stored_request,
                        metadata: stored_metadata,
                    } = entry;
                    let new_response =
                        match self.transport.handle(validation) {
                            Ok(new_response) => new_response,
                            Err(err)
                                if err.is_connect()
                                    && self
                                        .controller
                                        .allowed_stale(&stored_response) =>
                            {
                                let mut response = stored_response;
                                let mut metadata = stored_metadata;
                                metadata.number_of_uses += 1;
                                if let Err(err) = self.storage.store(
                                    &key,
                                    &response,
                                    &stored_request,
                                    &metadata,
                                ) {
                                    debug!(
                                        "failed to persist use counter \
                                         for {key}: {err}"
                                    );
                                }
                                response.set_from_cache(true);
                                response.set_cache_metadata(metadata);
                                return Ok(response);
                            }
                            Err(err) => return Err(err),
                        };
                    let revalidated = new_response.status == 304;
                    let mut full = self
                        .controller
                        .handle_validation_response(
                            stored_response,
                            new_response,
                        );
                    full.read()?;
                    let metadata = if revalidated {
                        CacheMetadata {
                            cache_key: key.clone(),
                            created_at: stored_metadata.created_at,
                            number_of_uses: stored_metadata.number_of_uses
                                + 1,
                        }
                    } else {
                        CacheMetadata::new(key.clone(), self.controller.now())
                    };
                    self.storage.store(&key, &full, &request, &metadata)?;
                    full.set_from_cache(revalidated);
                    if revalidated {
                        full.set_cache_metadata(metadata);
                    }
                    return Ok(full);
                }
                CacheDecision::Miss => {
                    if only_if_cached {
                        return Ok(gateway_timeout());
                    }
                }
            }
        } else if only_if_cached {
            return Ok(gateway_timeout());
        }

        let stored_request = request.clone_shape();
        let mut response = self.transport.handle(request)?;
        if self.controller.is_cachable(&stored_request, &response) {
            response.read()?;
            let metadata =
                CacheMetadata::new(key.clone(), self.controller.now());
            self.storage.store(&key, &response, &stored_request, &metadata)?;
        }
        response.set_from_cache(false);
        Ok(response)
    }
}

/// A cooperative caching layer over a cooperative transport.
#[derive(Debug)]
pub struct AsyncCacheTransport<T: AsyncTransport, S: AsyncStorage> {
    transport: T,
    storage: S,
    controller: Controller,
}

impl<T: AsyncTransport, S: AsyncStorage> AsyncCacheTransport<T, S> {
    /// Wraps `transport` with `storage` and a default [`Controller`].
    pub fn new(transport: T, storage: S) -> Self {
        Self { transport, storage, controller: Controller::new() }
    }

    /// Replaces the controller.
    #[must_use]
    pub fn with_controller(mut self, controller: Controller) -> Self {
        self.controller = controller;
        self
    }

    /// Releases storage resources.
    pub async fn close(&self) -> Result<(), Error> {
        Ok(self.storage.close().await?)
    }

    async fn serve_hit(
        &self,
        key: &str,
        mut response: Response,
        entry: &StoredEntry,
    ) -> Response {
        let mut metadata = entry.metadata.clone();
        metadata.number_of_uses += 1;
        // counter updates are advisory; a failed re-store never fails the hit
        if let Err(err) = self
            .storage
            .store(key, &entry.response, &entry.request, &metadata)
            .await
        {
            debug!("failed to persist use counter for {key}: {err}");
        }
        response.set_from_cache(true);
        response.set_cache_metadata(metadata);
        response
    }
}

#[async_trait::async_trait]
impl<T: AsyncTransport, S: AsyncStorage> AsyncTransport
    for AsyncCacheTransport<T, S>
{
    async fn handle(&self, mut request: Request) -> Result<Response, Error> {
        if request.cache_disabled() {
            // forced pass-through: the store is neither consulted nor updated
            let mut response = self.transport.handle(request).await?;
            response.set_from_cache(false);
            return Ok(response);
        }

        if self.controller.body_keyed(&request.method) {
            request.read_async().await?;
        }
        let key = self.controller.cache_key(&request);
        let only_if_cached =
            CacheControl::from_headers(&request.headers).only_if_cached;

        if let Some(entry) = self.storage.retrieve(&key).await? {
            match self
                .controller
                .construct_response_from_cache(&request, &entry)
            {
                CacheDecision::Fresh(response) => {
                    return Ok(self.serve_hit(&key, response, &entry).await);
                }
                CacheDecision::NeedsValidation(validation) => {
                    if only_if_cached {
                        return Ok(gateway_timeout());
                    }
                    let StoredEntry {
                        response: stored_response,
                        request: stored_request,
                        metadata: stored_metadata,
                    } = entry;
                    let new_response =
                        match self.transport.handle(validation).await {
                            Ok(new_response) => new_response,
                            Err(err)
                                if err.is_connect()
                                    && self
                                        .controller
                                        .allowed_stale(&stored_response) =>
                            {
                                let mut response = stored_response;
                                let mut metadata = stored_metadata;
                                metadata.number_of_uses += 1;
                                if let Err(err) = self
                                    .storage
                                    .store(
                                        &key,
                                        &response,
                                        &stored_request,
                                        &metadata,
                                    )
                                    .await
                                {
                                    debug!(
                                        "failed to persist use counter \
                                         for {key}: {err}"
                                    );
                                }
                                response.set_from_cache(true);
                                response.set_cache_metadata(metadata);
                                return Ok(response);
                            }
                            Err(err) => return Err(err),
                        };
                    let revalidated = new_response.status == 304;
                    let mut full = self
                        .controller
                        .handle_validation_response(
                            stored_response,
                            new_response,
                        );
                    full.read_async().await?;
                    let metadata = if revalidated {
                        CacheMetadata {
                            cache_key: key.clone(),
                            created_at: stored_metadata.created_at,
                            number_of_uses: stored_metadata.number_of_uses
                                + 1,
                        }
                    } else {
                        CacheMetadata::new(key.clone(), self.controller.now())
                    };
                    self.storage
                        .store(&key, &full, &request, &metadata)
                        .await?;
                    full.set_from_cache(revalidated);
                    if revalidated {
                        full.set_cache_metadata(metadata);
                    }
                    return Ok(full);
                }
                CacheDecision::Miss => {
                    if only_if_cached {
                        return Ok(gateway_timeout());
                    }
                }
            }
        } else if only_if_cached {
            return Ok(gateway_timeout());
        }

        let stored_request = request.clone_shape();
        let mut response = self.transport.handle(request).await?;
        if self.controller.is_cachable(&stored_request, &response) {
            response.read_async().await?;
            let metadata =
                CacheMetadata::new(key.clone(), self.controller.now());
            self.storage
                .store(&key, &response, &stored_request, &metadata)
                .await?;
        }
        response.set_from_cache(false);
        Ok(response)
    }
}
