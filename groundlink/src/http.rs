//! HTTP client with ambient header injection and bounded retry.
//!
//! All outbound traffic of the agent goes through [`HttpClient`], a thin
//! composition over [`reqwest::Client`]:
//!
//! - every request gains `x-client-version` / `x-device-id` headers from the
//!   [`RequestContext`] when those values are non-empty;
//! - transport errors are retried with a fixed backoff. Responses with an
//!   error status are **not** retried; status handling belongs to callers.
//!
//! Backoff waits are cancellation-aware: a fired [`CancellationToken`]
//! aborts the operation immediately with [`HttpClientError::Cancelled`].

use crate::context::{RequestContext, CLIENT_VERSION_HEADER, DEVICE_ID_HEADER};
use reqwest::header::HeaderValue;
use reqwest::{Method, Request, Response};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default number of retries after a failed attempt.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default fixed backoff between attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Errors produced by [`HttpClient`].
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// Rejected builder option.
    #[error("invalid http client configuration: {0}")]
    Configuration(String),

    /// The request itself could not be constructed.
    #[error("failed to build request: {0}")]
    Request(#[source] reqwest::Error),

    /// Transport-level failure, after exhausting all retries.
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// The cancellation token fired before the operation completed.
    #[error("request cancelled")]
    Cancelled,
}

/// Builder for [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpClientBuilder {
    context: RequestContext,
    retry_count: u32,
    retry_backoff: Duration,
    timeout: Option<Duration>,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self {
            context: RequestContext::new(),
            retry_count: DEFAULT_RETRY_COUNT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            timeout: None,
        }
    }
}

impl HttpClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ambient context injected into every request.
    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    /// Number of retries after the first failed attempt.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Fixed delay between attempts. Must be greater than zero.
    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    /// Total per-request deadline. A zero timeout means no deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<HttpClient, HttpClientError> {
        if self.retry_backoff.is_zero() {
            return Err(HttpClientError::Configuration(
                "retry backoff must be greater than zero".to_string(),
            ));
        }

        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("groundlink/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = self.timeout.filter(|t| !t.is_zero()) {
            builder = builder.timeout(timeout);
        }

        let inner = builder
            .build()
            .map_err(|e| HttpClientError::Configuration(e.to_string()))?;

        Ok(HttpClient {
            inner,
            context: self.context,
            retry_count: self.retry_count,
            retry_backoff: self.retry_backoff,
        })
    }
}

/// Shared outbound HTTP client for all agent services.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    context: RequestContext,
    retry_count: u32,
    retry_backoff: Duration,
}

impl HttpClient {
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    /// Client with default retry policy and no ambient context.
    pub fn with_defaults() -> Result<Self, HttpClientError> {
        HttpClientBuilder::new().build()
    }

    /// The ambient context this client stamps onto requests.
    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Starts building a request that will go through [`Self::execute`].
    ///
    /// Intended for pluggable request builders (event batch signing etc.).
    pub fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        self.inner.request(method, url)
    }

    /// GET with retry and header injection.
    pub async fn get(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Response, HttpClientError> {
        let request = self
            .inner
            .get(url)
            .build()
            .map_err(HttpClientError::Request)?;
        self.execute(request, cancel).await
    }

    /// HEAD with retry and header injection.
    pub async fn head(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Response, HttpClientError> {
        let request = self
            .inner
            .head(url)
            .build()
            .map_err(HttpClientError::Request)?;
        self.execute(request, cancel).await
    }

    /// GET of an inclusive byte range.
    pub async fn get_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<Response, HttpClientError> {
        let request = self
            .inner
            .get(url)
            .header(reqwest::header::RANGE, format!("bytes={start}-{end}"))
            .build()
            .map_err(HttpClientError::Request)?;
        self.execute(request, cancel).await
    }

    /// Builds a JSON POST request without sending it.
    ///
    /// Useful where request construction is pluggable and sending happens
    /// through [`Self::execute`] later.
    pub fn post_json_request<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<Request, HttpClientError> {
        self.inner
            .post(url)
            .json(body)
            .build()
            .map_err(HttpClientError::Request)
    }

    /// POST with a JSON body, retry, and header injection.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        cancel: &CancellationToken,
    ) -> Result<Response, HttpClientError> {
        let request = self.post_json_request(url, body)?;
        self.execute(request, cancel).await
    }

    /// Executes a prepared request with header injection and retry.
    ///
    /// Requests with a streaming body cannot be replayed and are sent
    /// exactly once.
    pub async fn execute(
        &self,
        mut request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response, HttpClientError> {
        self.inject_context_headers(&mut request);

        let mut attempt: u32 = 0;
        loop {
            let this_attempt = match request.try_clone() {
                Some(clone) if attempt < self.retry_count => clone,
                // Last attempt, or a body that cannot be replayed: the
                // original request is consumed and its error is final.
                _ => return self.send(request, cancel).await,
            };

            match self.send(this_attempt, cancel).await {
                Ok(response) => return Ok(response),
                Err(HttpClientError::Transport(err)) => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max_attempts = self.retry_count + 1,
                        backoff_ms = self.retry_backoff.as_millis() as u64,
                        error = %err,
                        "transport error, retrying"
                    );

                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => return Err(HttpClientError::Cancelled),
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn send(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response, HttpClientError> {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(HttpClientError::Cancelled),
            result = self.inner.execute(request) => {
                result.map_err(HttpClientError::Transport)
            }
        }
    }

    fn inject_context_headers(&self, request: &mut Request) {
        let headers = request.headers_mut();

        let client_version = self.context.client_version();
        if !client_version.is_empty() {
            if let Ok(value) = HeaderValue::from_str(client_version) {
                headers.insert(CLIENT_VERSION_HEADER, value);
            }
        }

        let device_id = self.context.device_id();
        if !device_id.is_empty() {
            if let Ok(value) = HeaderValue::from_str(device_id) {
                headers.insert(DEVICE_ID_HEADER, value);
            }
        }
    }
}
