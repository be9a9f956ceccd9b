//! The dispatch contract consumed (and re-implemented) by the cache.
//!
//! A transport takes a request and yields a response or an error;
//! connection failures are distinguishable so the cache can fall back to
//! a stored response. The cache wrappers implement the same contract, so
//! they stack in front of any transport.
//!
//! Scripted mock transports are included for tests of code built on top
//! of the cache.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, TransportError};
use crate::model::{Request, Response};

/// A blocking request dispatcher.
pub trait Transport: Send + Sync {
    /// Dispatches a request.
    fn handle(&self, request: Request) -> Result<Response, Error>;
}

/// A cooperative request dispatcher.
#[async_trait]
pub trait AsyncTransport: Send + Sync {
    /// Dispatches a request.
    async fn handle(&self, request: Request) -> Result<Response, Error>;
}

fn exhausted() -> Error {
    TransportError::Other(Box::new(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "mock transport has no scripted response left",
    )))
    .into()
}

/// A blocking transport that replays scripted responses in order.
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<Result<Response, Error>>>,
}

impl MockTransport {
    /// An empty mock; add responses before dispatching.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends responses to the script.
    pub fn add_responses(
        &self,
        responses: impl IntoIterator<Item = Response>,
    ) {
        self.queue().extend(responses.into_iter().map(Ok));
    }

    /// Appends a failure to the script.
    pub fn add_error(&self, error: Error) {
        self.queue().push_back(Err(error));
    }

    fn queue(
        &self,
    ) -> std::sync::MutexGuard<'_, VecDeque<Result<Response, Error>>> {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Transport for MockTransport {
    fn handle(&self, _request: Request) -> Result<Response, Error> {
        self.queue().pop_front().unwrap_or_else(|| Err(exhausted()))
    }
}

/// A cooperative transport that replays scripted responses in order.
#[derive(Debug, Default)]
pub struct AsyncMockTransport {
    responses: Mutex<VecDeque<Result<Response, Error>>>,
}

impl AsyncMockTransport {
    /// An empty mock; add responses before dispatching.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends responses to the script.
    pub fn add_responses(
        &self,
        responses: impl IntoIterator<Item = Response>,
    ) {
        self.queue().extend(responses.into_iter().map(Ok));
    }

    /// Appends a failure to the script.
    pub fn add_error(&self, error: Error) {
        self.queue().push_back(Err(error));
    }

    fn queue(
        &self,
    ) -> std::sync::MutexGuard<'_, VecDeque<Result<Response, Error>>> {
        self.responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AsyncTransport for AsyncMockTransport {
    async fn handle(&self, _request: Request) -> Result<Response, Error> {
        self.queue().pop_front().unwrap_or_else(|| Err(exhausted()))
    }
}
