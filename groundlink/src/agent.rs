//! High-level facade wiring all agent services together.
//!
//! Most embedders need the same arrangement: one shared HTTP client, a
//! config service, an update service, an event drain shipping both
//! services' events, and a lifecycle manager that tears everything down in
//! the right order. [`Agent`] builds exactly that from one [`AgentConfig`].

use crate::config::{ConfigService, ConfigServiceError, ConfigStorage, FileStorage};
use crate::context::RequestContext;
use crate::event::drain::DrainError;
use crate::event::{BufferedEmitter, Emitter, EventDrainService};
use crate::http::{HttpClient, HttpClientError};
use crate::lifecycle::{Closer, LifecycleManager, ShutdownError};
use crate::update::{
    HttpUpdateRequester, RangedUpdateRequester, UpdateRequester, UpdateService,
    UpdateServiceError,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Errors from assembling the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Http(#[from] HttpClientError),

    #[error(transparent)]
    Config(#[from] ConfigServiceError),

    #[error(transparent)]
    Update(#[from] UpdateServiceError),

    #[error(transparent)]
    Drain(#[from] DrainError),
}

/// Configuration for [`Agent::start`].
///
/// Every service is optional; a service is built only when its URL is set.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Version of the embedding binary; announced in outbound headers and
    /// compared against the update manifest.
    pub client_version: String,
    /// Stable device identifier; announced in outbound headers and event
    /// correlation fields.
    pub device_id: String,

    /// Manifest URL for self-updates.
    pub update_manifest_url: Option<String>,
    /// Use ranged, resumable downloads for update binaries.
    pub resumable_downloads: bool,

    /// Manifest URL for remote configuration.
    pub config_manifest_url: Option<String>,
    /// Persist the config to this file instead of memory only.
    pub config_file: Option<PathBuf>,
    /// Overlay environment variables with this prefix onto the config.
    pub env_key_prefix: Option<String>,

    /// Collector endpoint for event batches.
    pub events_endpoint: Option<String>,
    pub event_flush_interval: Duration,

    pub initial_poll_delay: Duration,
    pub poll_interval: Duration,
}

impl AgentConfig {
    pub fn new(client_version: impl Into<String>) -> Self {
        Self {
            client_version: client_version.into(),
            device_id: String::new(),
            update_manifest_url: None,
            resumable_downloads: false,
            config_manifest_url: None,
            config_file: None,
            env_key_prefix: None,
            events_endpoint: None,
            event_flush_interval: crate::event::drain::DEFAULT_FLUSH_INTERVAL,
            initial_poll_delay: crate::update::service::DEFAULT_INITIAL_POLL_DELAY,
            poll_interval: crate::update::service::DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Running set of agent services.
pub struct Agent {
    cancel: CancellationToken,
    lifecycle: LifecycleManager,
    config_service: Option<Arc<ConfigService>>,
    update_service: Option<Arc<UpdateService>>,
    drain_service: Option<Arc<EventDrainService>>,
}

impl Agent {
    /// Builds and starts all configured services.
    pub async fn start(config: AgentConfig) -> Result<Self, AgentError> {
        let cancel = CancellationToken::new();
        let lifecycle = LifecycleManager::new();

        let context = RequestContext::new()
            .with_client_version(&config.client_version)
            .with_device_id(&config.device_id);

        let client = HttpClient::builder()
            .with_context(context.clone())
            .build()?;

        let mut producers: Vec<Arc<dyn Emitter>> = Vec::new();

        let config_service = match &config.config_manifest_url {
            Some(url) => {
                let emitter: Arc<dyn Emitter> = Arc::new(BufferedEmitter::with_defaults());
                producers.push(Arc::clone(&emitter));

                let mut builder = ConfigService::builder(url.as_str())
                    .with_context(context.clone())
                    .with_http_client(client.clone())
                    .with_emitter(emitter)
                    .with_initial_poll_delay(config.initial_poll_delay)
                    .with_poll_interval(config.poll_interval);
                if let Some(path) = &config.config_file {
                    let storage: Arc<dyn ConfigStorage> = Arc::new(FileStorage::new(path));
                    builder = builder.with_storage(storage);
                }
                if let Some(prefix) = &config.env_key_prefix {
                    builder = builder.with_env_vars(prefix.as_str());
                }

                let service = Arc::new(builder.start(&cancel).await?);
                lifecycle.register(Box::new(Arc::clone(&service)));
                Some(service)
            }
            None => None,
        };

        let update_service = match &config.update_manifest_url {
            Some(url) => {
                let emitter: Arc<dyn Emitter> = Arc::new(BufferedEmitter::with_defaults());
                producers.push(Arc::clone(&emitter));

                let update_requester: Arc<dyn UpdateRequester> = if config.resumable_downloads {
                    Arc::new(RangedUpdateRequester::new(
                        client.clone(),
                        std::env::temp_dir(),
                    ))
                } else {
                    Arc::new(HttpUpdateRequester::new(client.clone()))
                };

                let service = Arc::new(
                    UpdateService::builder(url.as_str(), config.client_version.as_str())
                        .with_context(context.clone())
                        .with_http_client(client.clone())
                        .with_update_requester(update_requester)
                        .with_emitter(emitter)
                        .with_initial_poll_delay(config.initial_poll_delay)
                        .with_poll_interval(config.poll_interval)
                        .start(&cancel)?,
                );
                lifecycle.register(Box::new(Arc::clone(&service)));
                Some(service)
            }
            None => None,
        };

        let drain_service = match &config.events_endpoint {
            Some(endpoint) => {
                let service = Arc::new(
                    EventDrainService::builder(endpoint.as_str())
                        .with_http_client(client)
                        .with_flush_interval(config.event_flush_interval)
                        .start(&cancel)?,
                );
                for producer in producers {
                    service.register_producer(producer);
                }
                lifecycle.register(Box::new(Arc::clone(&service)));
                Some(service)
            }
            None => None,
        };

        info!(
            config = config_service.is_some(),
            update = update_service.is_some(),
            events = drain_service.is_some(),
            "agent started"
        );

        Ok(Self {
            cancel,
            lifecycle,
            config_service,
            update_service,
            drain_service,
        })
    }

    pub fn config_service(&self) -> Option<&Arc<ConfigService>> {
        self.config_service.as_ref()
    }

    pub fn update_service(&self) -> Option<&Arc<UpdateService>> {
        self.update_service.as_ref()
    }

    pub fn drain_service(&self) -> Option<&Arc<EventDrainService>> {
        self.drain_service.as_ref()
    }

    /// Registers an additional component for shutdown.
    pub fn register_closer(&self, closer: Box<dyn Closer>) {
        self.lifecycle.register(closer);
    }

    /// Stops all services in reverse start order.
    pub async fn shutdown(&self, ctx: &CancellationToken) -> Result<(), ShutdownError> {
        self.cancel.cancel();
        self.lifecycle.close_all(ctx).await
    }
}
