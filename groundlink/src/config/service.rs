//! Remote configuration reconciliation service.
//!
//! A background worker periodically fetches the config manifest, and when
//! its `{version, hash}` pair differs from the current snapshot, downloads
//! the artifact, verifies it against the manifest hash, overlays
//! environment variables, persists the result, and swaps the in-memory
//! snapshot.

use super::storage::{ConfigStorage, MemoryStorage, StorageError};
use super::{Config, Properties, PropertyValue};
use crate::context::RequestContext;
use crate::event::{Emitter, Event, EventType, NoopEmitter};
use crate::http::{HttpClient, HttpClientError};
use crate::lifecycle::{CloseError, Closer};
use crate::manifest::{Manifest, ManifestError, ManifestRequestError, ManifestRequester};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name under which the service registers with the lifecycle manager.
pub const SERVICE_NAME: &str = "ConfigService";

/// Default delay before the first reconcile tick.
pub const DEFAULT_INITIAL_POLL_DELAY: Duration = Duration::from_secs(60);

/// Default interval between reconcile ticks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3600);

/// Emitted when the manifest matches the current snapshot.
pub const CONFIG_UP_TO_DATE_EVENT: EventType = EventType::new("config_up_to_date");

/// Emitted after a new config has been verified and persisted.
pub const CONFIG_REFRESHED_EVENT: EventType = EventType::new("config_refreshed");

/// Emitted when a reconcile attempt fails; carries `is_error`.
pub const CONFIG_REFRESH_FAILED_EVENT: EventType = EventType::new("config_refresh_failed");

/// Errors from fetching the config artifact.
#[derive(Debug, Error)]
pub enum ConfigFetchError {
    #[error("failed to fetch config artifact: {0}")]
    Http(#[from] HttpClientError),

    #[error("unexpected status code: {0}")]
    UnexpectedStatus(StatusCode),

    #[error("failed to read config artifact: {0}")]
    Read(#[source] reqwest::Error),
}

/// Errors from building or running the config service.
#[derive(Debug, Error)]
pub enum ConfigServiceError {
    /// Rejected builder option.
    #[error("invalid config service configuration: {0}")]
    Configuration(String),

    #[error("failed to fetch config manifest: {0}")]
    Manifest(#[from] ManifestRequestError),

    #[error(transparent)]
    Fetch(#[from] ConfigFetchError),

    /// Artifact content did not match the manifest hash.
    #[error("config content rejected: {0}")]
    Integrity(#[from] ManifestError),

    #[error("invalid config JSON: {0}")]
    Decode(#[source] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Fetches the raw config artifact named by a manifest.
#[async_trait]
pub trait ConfigFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ConfigFetchError>;
}

/// HTTP-backed [`ConfigFetcher`].
#[derive(Debug, Clone)]
pub struct HttpConfigFetcher {
    client: HttpClient,
}

impl HttpConfigFetcher {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConfigFetcher for HttpConfigFetcher {
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ConfigFetchError> {
        let response = self.client.get(url, cancel).await?;

        if response.status() != StatusCode::OK {
            return Err(ConfigFetchError::UnexpectedStatus(response.status()));
        }

        let bytes = response.bytes().await.map_err(ConfigFetchError::Read)?;
        Ok(bytes.to_vec())
    }
}

/// Builder for [`ConfigService`].
pub struct ConfigServiceBuilder {
    manifest_url: String,
    initial_poll_delay: Duration,
    poll_interval: Duration,
    extend_with_env_vars: bool,
    env_key_prefix: String,
    context: RequestContext,
    http_client: Option<HttpClient>,
    requester: Option<Arc<dyn ManifestRequester>>,
    fetcher: Option<Arc<dyn ConfigFetcher>>,
    storage: Option<Arc<dyn ConfigStorage>>,
    emitter: Option<Arc<dyn Emitter>>,
}

impl ConfigServiceBuilder {
    pub fn new(manifest_url: impl Into<String>) -> Self {
        Self {
            manifest_url: manifest_url.into(),
            initial_poll_delay: DEFAULT_INITIAL_POLL_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            extend_with_env_vars: false,
            env_key_prefix: String::new(),
            context: RequestContext::new(),
            http_client: None,
            requester: None,
            fetcher: None,
            storage: None,
            emitter: None,
        }
    }

    /// Delay before the first reconcile. Zero means reconcile immediately.
    pub fn with_initial_poll_delay(mut self, delay: Duration) -> Self {
        self.initial_poll_delay = delay;
        self
    }

    /// Interval between reconciles. Must be greater than zero.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overlays environment variables with the given prefix onto fetched
    /// properties. Existing properties always win over the environment.
    pub fn with_env_vars(mut self, prefix: impl Into<String>) -> Self {
        self.extend_with_env_vars = true;
        self.env_key_prefix = prefix.into();
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_http_client(mut self, client: HttpClient) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn with_manifest_requester(mut self, requester: Arc<dyn ManifestRequester>) -> Self {
        self.requester = Some(requester);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ConfigFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn ConfigStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn Emitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Validates options, loads the initial snapshot, and starts the
    /// reconcile worker.
    ///
    /// When storage holds no config yet, one immediate best-effort refresh
    /// runs before the worker starts; its failure is reported but does not
    /// fail construction.
    pub async fn start(
        self,
        parent: &CancellationToken,
    ) -> Result<ConfigService, ConfigServiceError> {
        if self.manifest_url.is_empty() {
            return Err(ConfigServiceError::Configuration(
                "manifest URL cannot be empty".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigServiceError::Configuration(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if self.extend_with_env_vars && self.env_key_prefix.is_empty() {
            return Err(ConfigServiceError::Configuration(
                "env key prefix cannot be empty".to_string(),
            ));
        }

        let context = self.context.with_service(SERVICE_NAME);

        let client = match self.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .with_context(context.clone())
                .build()
                .map_err(|err| ConfigServiceError::Configuration(err.to_string()))?,
        };

        let requester = self
            .requester
            .unwrap_or_else(|| Arc::new(crate::manifest::HttpManifestRequester::new(client.clone())));
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpConfigFetcher::new(client)));
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoopEmitter));

        let current = storage.get().await?;

        let inner = Arc::new(ConfigServiceInner {
            manifest_url: self.manifest_url,
            extend_with_env_vars: self.extend_with_env_vars,
            env_key_prefix: self.env_key_prefix,
            context,
            requester,
            fetcher,
            storage,
            emitter,
            current: RwLock::new(current),
        });

        let cancel = parent.child_token();

        if inner.current_snapshot().is_none() {
            inner.refresh_and_report(&cancel).await;
        }

        let worker = tokio::spawn(run_worker(
            Arc::clone(&inner),
            self.initial_poll_delay,
            self.poll_interval,
            cancel.clone(),
        ));

        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            initial_delay_secs = self.initial_poll_delay.as_secs(),
            "config service started"
        );

        Ok(ConfigService {
            inner,
            cancel,
            worker: Mutex::new(Some(worker)),
        })
    }
}

struct ConfigServiceInner {
    manifest_url: String,
    extend_with_env_vars: bool,
    env_key_prefix: String,
    context: RequestContext,
    requester: Arc<dyn ManifestRequester>,
    fetcher: Arc<dyn ConfigFetcher>,
    storage: Arc<dyn ConfigStorage>,
    emitter: Arc<dyn Emitter>,
    current: RwLock<Option<Config>>,
}

impl ConfigServiceInner {
    fn current_snapshot(&self) -> Option<Config> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn refresh(&self, cancel: &CancellationToken) -> Result<(), ConfigServiceError> {
        let manifest = self.requester.fetch(&self.manifest_url, cancel).await?;
        let current = self.current_snapshot();

        if let Some(current) = &current {
            if current.version == manifest.version && current.hash == manifest.hash {
                debug!(version = %manifest.version, "config is up to date");
                self.emitter.push(
                    Event::new(&self.context, CONFIG_UP_TO_DATE_EVENT)
                        .with_message(format!("config version {} is current", manifest.version)),
                );
                return Ok(());
            }
        }

        let config = self.fetch_and_verify(&manifest, cancel).await?;

        let properties_unchanged = current
            .as_ref()
            .is_some_and(|c| c.properties == config.properties);
        if properties_unchanged {
            // Adopt the new {version, hash} meta anyway: the stored meta
            // must identify the manifest that produced the accepted
            // content, or every later tick re-downloads the artifact.
            info!(
                version = %config.version,
                "config properties unchanged, adopting new version meta"
            );
        }

        self.storage.save(Some(&config)).await?;
        {
            let mut current = self
                .current
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *current = Some(config.clone());
        }

        info!(version = %config.version, "config refreshed");
        self.emitter.push(
            Event::new(&self.context, CONFIG_REFRESHED_EVENT)
                .with_message(format!("config refreshed to version {}", config.version))
                .with_data_field("version", config.version.clone().into())
                .with_data_field("hash", config.hash.clone().into()),
        );

        Ok(())
    }

    async fn fetch_and_verify(
        &self,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<Config, ConfigServiceError> {
        let bytes = self.fetcher.fetch(&manifest.url, cancel).await?;
        manifest.verify(&bytes)?;

        let mut properties: Properties =
            serde_json::from_slice(&bytes).map_err(ConfigServiceError::Decode)?;

        if self.extend_with_env_vars {
            debug!(prefix = %self.env_key_prefix, "extending config with environment variables");
            extend_with_environment_variables(&mut properties, &self.env_key_prefix);
        }

        Ok(Config {
            version: manifest.version.clone(),
            hash: manifest.hash.clone(),
            properties,
        })
    }

    async fn refresh_and_report(&self, cancel: &CancellationToken) {
        if let Err(err) = self.refresh(cancel).await {
            warn!(error = %err, "failed to refresh config");
            self.emitter.push(
                Event::new(&self.context, CONFIG_REFRESH_FAILED_EVENT)
                    .with_message(err.to_string())
                    .as_error(),
            );
        }
    }
}

/// Overlays prefixed environment variables onto `properties`.
///
/// The prefix is stripped and the remainder lowercased to form the key;
/// existing properties are never overwritten.
fn extend_with_environment_variables(properties: &mut Properties, prefix: &str) {
    for (name, value) in std::env::vars() {
        let Some(stripped) = name.strip_prefix(prefix) else {
            continue;
        };

        let key = stripped.to_lowercase();
        if properties.contains_key(&key) {
            debug!(key = %key, "environment variable shadowed by existing property");
            continue;
        }

        properties.insert(key, PropertyValue::String(value));
    }
}

async fn run_worker(
    inner: Arc<ConfigServiceInner>,
    initial_delay: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    if !initial_delay.is_zero() {
        debug!(delay_secs = initial_delay.as_secs(), "waiting for initial poll delay");
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("config worker stopped during initial delay");
                return;
            }
            _ = tokio::time::sleep(initial_delay) => {}
        }
    }

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("config worker shutting down");
                return;
            }

            // The first tick fires immediately after the initial delay.
            _ = ticker.tick() => inner.refresh_and_report(&cancel).await,
        }
    }
}

/// Polling reconciliation of remote configuration.
pub struct ConfigService {
    inner: Arc<ConfigServiceInner>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConfigService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigService").finish_non_exhaustive()
    }
}

impl ConfigService {
    pub fn builder(manifest_url: impl Into<String>) -> ConfigServiceBuilder {
        ConfigServiceBuilder::new(manifest_url)
    }

    /// Snapshot of the current configuration, if any.
    pub fn current(&self) -> Option<Config> {
        self.inner.current_snapshot()
    }

    /// Runs one reconcile immediately, outside the polling schedule.
    pub async fn refresh(&self) -> Result<(), ConfigServiceError> {
        self.inner.refresh(&self.cancel).await
    }

    /// The emitter carrying this service's events; register it with the
    /// event drain service to ship them.
    pub fn emitter(&self) -> Arc<dyn Emitter> {
        Arc::clone(&self.inner.emitter)
    }
}

#[async_trait]
impl Closer for ConfigService {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn close(&self, ctx: &CancellationToken) -> Result<(), CloseError> {
        self.cancel.cancel();

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
                result.map_err(|err| CloseError::Other(format!("config worker failed: {err}")))
            }
            _ = ctx.cancelled() => Err(CloseError::Cancelled),
        }
    }
}
