//! Periodic shipment of event batches to the collector.
//!
//! The drain service aggregates events from every registered producer and
//! POSTs them to the collector endpoint as a single JSON array. A failed
//! attempt loses that batch; there is no retry queue or persistence.

use super::{Emitter, Event};
use crate::http::{HttpClient, HttpClientError};
use crate::lifecycle::{CloseError, Closer};
use async_trait::async_trait;
use reqwest::{Request, StatusCode};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name under which the service registers with the lifecycle manager.
pub const SERVICE_NAME: &str = "EventDrainService";

/// Default interval between flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Errors from building or running the drain service.
#[derive(Debug, Error)]
pub enum DrainError {
    /// Rejected builder option.
    #[error("invalid drain service configuration: {0}")]
    Configuration(String),

    /// The request builder failed to produce a request.
    #[error("failed to build event batch request: {0}")]
    RequestBuild(String),

    #[error(transparent)]
    Http(#[from] HttpClientError),

    /// The collector answered outside the 2xx range; the batch is lost.
    #[error("collector rejected event batch: {0}")]
    UnexpectedStatus(StatusCode),
}

/// Builds the outbound request for one event batch.
///
/// Pluggable so embedders can add signing, compression, or extra headers.
pub type RequestBuilder =
    Arc<dyn Fn(&HttpClient, &str, &[Event]) -> Result<Request, DrainError> + Send + Sync>;

fn default_request_builder() -> RequestBuilder {
    Arc::new(|client, endpoint, events| {
        client
            .post_json_request(endpoint, events)
            .map_err(|err| DrainError::RequestBuild(err.to_string()))
    })
}

/// Builder for [`EventDrainService`].
pub struct EventDrainServiceBuilder {
    endpoint: String,
    interval: Duration,
    client: Option<HttpClient>,
    request_builder: RequestBuilder,
}

impl EventDrainServiceBuilder {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            interval: DEFAULT_FLUSH_INTERVAL,
            client: None,
            request_builder: default_request_builder(),
        }
    }

    /// Interval between flushes. Must be greater than zero.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// HTTP client used for batch shipment.
    pub fn with_http_client(mut self, client: HttpClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Custom request construction for event batches.
    pub fn with_request_builder(
        mut self,
        builder: impl Fn(&HttpClient, &str, &[Event]) -> Result<Request, DrainError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.request_builder = Arc::new(builder);
        self
    }

    /// Validates the configuration and starts the flush worker.
    pub fn start(self, parent: &CancellationToken) -> Result<EventDrainService, DrainError> {
        if self.endpoint.is_empty() {
            return Err(DrainError::Configuration(
                "collector endpoint cannot be empty".to_string(),
            ));
        }
        if self.interval.is_zero() {
            return Err(DrainError::Configuration(
                "flush interval must be greater than zero".to_string(),
            ));
        }

        let client = match self.client {
            Some(client) => client,
            None => HttpClient::with_defaults()
                .map_err(|err| DrainError::Configuration(err.to_string()))?,
        };

        let inner = Arc::new(DrainInner {
            endpoint: self.endpoint,
            client,
            request_builder: self.request_builder,
            producers: RwLock::new(Vec::new()),
        });

        let cancel = parent.child_token();
        let worker = tokio::spawn(run_worker(
            Arc::clone(&inner),
            self.interval,
            cancel.clone(),
        ));

        info!(
            interval_secs = self.interval.as_secs(),
            endpoint = %inner.endpoint,
            "event drain service started"
        );

        Ok(EventDrainService {
            inner,
            cancel,
            worker: Mutex::new(Some(worker)),
        })
    }
}

struct DrainInner {
    endpoint: String,
    client: HttpClient,
    request_builder: RequestBuilder,
    producers: RwLock<Vec<Arc<dyn Emitter>>>,
}

impl DrainInner {
    fn snapshot_producers(&self) -> Vec<Arc<dyn Emitter>> {
        self.producers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn flush(&self, cancel: &CancellationToken) -> Result<usize, DrainError> {
        let producers = self.snapshot_producers();

        let mut batch = Vec::new();
        for producer in &producers {
            batch.extend(producer.poll_events());
        }

        if batch.is_empty() {
            return Ok(0);
        }

        let request = (self.request_builder)(&self.client, &self.endpoint, &batch)?;
        let response = self.client.execute(request, cancel).await?;

        if !response.status().is_success() {
            return Err(DrainError::UnexpectedStatus(response.status()));
        }

        debug!(count = batch.len(), "shipped event batch");
        Ok(batch.len())
    }
}

async fn run_worker(inner: Arc<DrainInner>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // Skip the immediate first tick; the first flush happens one interval in.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("event drain worker shutting down");
                return;
            }

            _ = ticker.tick() => {
                if let Err(err) = inner.flush(&cancel).await {
                    // The batch is gone; producers have already handed it over.
                    warn!(error = %err, "failed to ship event batch");
                }
            }
        }
    }
}

/// Ships accumulated events from all registered producers on a ticker.
pub struct EventDrainService {
    inner: Arc<DrainInner>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventDrainService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDrainService").finish_non_exhaustive()
    }
}

impl EventDrainService {
    pub fn builder(endpoint: impl Into<String>) -> EventDrainServiceBuilder {
        EventDrainServiceBuilder::new(endpoint)
    }

    /// Registers an event producer for draining.
    pub fn register_producer(&self, producer: Arc<dyn Emitter>) {
        self.inner
            .producers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(producer);
    }

    /// Polls all producers and ships the combined batch immediately.
    ///
    /// Returns the number of events shipped.
    pub async fn flush(&self) -> Result<usize, DrainError> {
        self.inner.flush(&self.cancel).await
    }
}

#[async_trait]
impl Closer for EventDrainService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn close(&self, ctx: &CancellationToken) -> Result<(), CloseError> {
        self.cancel.cancel();

        for producer in self.inner.snapshot_producers() {
            if let Err(err) = producer.close(ctx).await {
                warn!(error = %err, "failed to close event producer");
            }
        }

        let handle = {
            let mut worker = self
                .worker
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            worker.take()
        };
        let Some(handle) = handle else {
            return Ok(());
        };

        tokio::select! {
            result = handle => {
                result.map_err(|err| CloseError::Other(format!("drain worker failed: {err}")))
            }
            _ = ctx.cancelled() => Err(CloseError::Cancelled),
        }
    }
}
