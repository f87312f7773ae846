//! Self-update service.
//!
//! A background worker polls the update manifest. When the manifest's
//! version differs from the running binary's, the manifest is announced on
//! the update-available channel; the embedder's listener then calls
//! [`UpdateService::apply_update`], which downloads, verifies, and
//! atomically swaps the binary. The new binary takes effect on the next
//! launch.

use super::requester::{UpdateFetchError, UpdateRequester};
use super::swap::{self, SwapError};
use crate::context::RequestContext;
use crate::event::{Emitter, Event, EventType, NoopEmitter};
use crate::hash::Hasher;
use crate::http::HttpClient;
use crate::lifecycle::{CloseError, Closer};
use crate::manifest::{
    HttpManifestRequester, Manifest, ManifestError, ManifestRequestError, ManifestRequester,
};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name under which the service registers with the lifecycle manager.
pub const SERVICE_NAME: &str = "UpdateService";

/// Default delay before the first update check.
pub const DEFAULT_INITIAL_POLL_DELAY: Duration = Duration::from_secs(60);

/// Default interval between update checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3600);

/// Emitted when the manifest version matches the running binary.
pub const NO_UPDATE_AVAILABLE_EVENT: EventType = EventType::new("no_update_available");

/// Emitted when a newer version has been announced.
pub const UPDATE_AVAILABLE_EVENT: EventType = EventType::new("update_available");

/// Emitted when the binary download begins.
pub const UPDATE_DOWNLOAD_STARTED_EVENT: EventType = EventType::new("update_download_started");

/// Emitted when the binary has been fully staged.
pub const UPDATE_DOWNLOADED_EVENT: EventType = EventType::new("update_downloaded");

/// Emitted when the swap finished; carries `is_error` when an apply
/// attempt failed at any step.
pub const UPDATE_APPLIED_EVENT: EventType = EventType::new("update_applied");

/// Emitted when a scheduled update check failed; carries `is_error`.
pub const UPDATE_CHECK_FAILED_EVENT: EventType = EventType::new("update_check_failed");

/// Errors from building or running the update service.
#[derive(Debug, Error)]
pub enum UpdateServiceError {
    /// Rejected builder option.
    #[error("invalid update service configuration: {0}")]
    Configuration(String),

    #[error("failed to fetch update manifest: {0}")]
    Manifest(#[from] ManifestRequestError),

    #[error(transparent)]
    Fetch(#[from] UpdateFetchError),

    #[error("failed to resolve install path: {0}")]
    InstallPath(#[source] io::Error),

    #[error("failed to stage update: {0}")]
    Stage(#[source] io::Error),

    /// Downloaded content did not match the manifest hash. The staged file
    /// has been removed; no swap happened.
    #[error("update content rejected: {0}")]
    Integrity(#[from] ManifestError),

    #[error(transparent)]
    Swap(#[from] SwapError),

    /// The update listener side of a channel is gone.
    #[error("update channel closed")]
    ChannelClosed,

    #[error("update operation cancelled")]
    Cancelled,
}

/// Builder for [`UpdateService`].
pub struct UpdateServiceBuilder {
    manifest_url: String,
    current_version: String,
    initial_poll_delay: Duration,
    poll_interval: Duration,
    context: RequestContext,
    install_path: Option<PathBuf>,
    http_client: Option<HttpClient>,
    requester: Option<Arc<dyn ManifestRequester>>,
    update_requester: Option<Arc<dyn UpdateRequester>>,
    emitter: Option<Arc<dyn Emitter>>,
}

impl UpdateServiceBuilder {
    pub fn new(manifest_url: impl Into<String>, current_version: impl Into<String>) -> Self {
        Self {
            manifest_url: manifest_url.into(),
            current_version: current_version.into(),
            initial_poll_delay: DEFAULT_INITIAL_POLL_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            context: RequestContext::new(),
            install_path: None,
            http_client: None,
            requester: None,
            update_requester: None,
            emitter: None,
        }
    }

    /// Delay before the first update check. Zero means check immediately.
    pub fn with_initial_poll_delay(mut self, delay: Duration) -> Self {
        self.initial_poll_delay = delay;
        self
    }

    /// Interval between update checks. Must be greater than zero.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    /// Overrides the binary that gets replaced. Defaults to the running
    /// executable, resolved at apply time.
    pub fn with_install_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.install_path = Some(path.into());
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

    pub fn with_update_requester(mut self, requester: Arc<dyn UpdateRequester>) -> Self {
        self.update_requester = Some(requester);
        self
    }

    pub fn with_emitter(mut self, emitter: Arc<dyn Emitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Validates options and starts the polling worker.
    pub fn start(self, parent: &CancellationToken) -> Result<UpdateService, UpdateServiceError> {
        if self.manifest_url.is_empty() {
            return Err(UpdateServiceError::Configuration(
                "manifest URL cannot be empty".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(UpdateServiceError::Configuration(
                "poll interval must be greater than zero".to_string(),
            ));
        }

        // Fall back to the ambient client version when none was given.
        let current_version = if self.current_version.is_empty() {
            self.context.client_version().to_string()
        } else {
            self.current_version
        };
        if current_version.is_empty() {
            return Err(UpdateServiceError::Configuration(
                "current client version cannot be empty".to_string(),
            ));
        }

        let context = self.context.with_service(SERVICE_NAME);

        let client = match self.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .with_context(context.clone())
                .build()
                .map_err(|err| UpdateServiceError::Configuration(err.to_string()))?,
        };

        let requester = self
            .requester
            .unwrap_or_else(|| Arc::new(HttpManifestRequester::new(client.clone())));
        let update_requester = self
            .update_requester
            .unwrap_or_else(|| Arc::new(super::requester::HttpUpdateRequester::new(client)));
        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoopEmitter));

        let (available_tx, available_rx) = mpsc::channel(1);
        let (applied_tx, applied_rx) = mpsc::channel(1);

        let inner = Arc::new(UpdateServiceInner {
            manifest_url: self.manifest_url,
            current_version,
            install_path: self.install_path,
            context,
            requester,
            update_requester,
            emitter,
            available_tx,
            applied_tx,
            available_rx: Mutex::new(Some(available_rx)),
            applied_rx: Mutex::new(Some(applied_rx)),
        });

        let cancel = parent.child_token();
        let worker = tokio::spawn(run_worker(
            Arc::clone(&inner),
            self.initial_poll_delay,
            self.poll_interval,
            cancel.clone(),
        ));

        info!(
            current_version = %inner.current_version,
            poll_interval_secs = self.poll_interval.as_secs(),
            initial_delay_secs = self.initial_poll_delay.as_secs(),
            "update service started"
        );

        Ok(UpdateService {
            inner,
            cancel,
            worker: Mutex::new(Some(worker)),
        })
    }
}

struct UpdateServiceInner {
    manifest_url: String,
    current_version: String,
    install_path: Option<PathBuf>,
    context: RequestContext,
    requester: Arc<dyn ManifestRequester>,
    update_requester: Arc<dyn UpdateRequester>,
    emitter: Arc<dyn Emitter>,
    available_tx: mpsc::Sender<Manifest>,
    applied_tx: mpsc::Sender<Manifest>,
    available_rx: Mutex<Option<mpsc::Receiver<Manifest>>>,
    applied_rx: Mutex<Option<mpsc::Receiver<Manifest>>>,
}

fn manifest_value(manifest: &Manifest) -> Value {
    serde_json::to_value(manifest).unwrap_or(Value::Null)
}

impl UpdateServiceInner {
    async fn check(&self, cancel: &CancellationToken) -> Result<(), UpdateServiceError> {
        let manifest = self.requester.fetch(&self.manifest_url, cancel).await?;

        if manifest.version == self.current_version {
            debug!(version = %self.current_version, "no update available");
            self.emitter.push(
                Event::new(&self.context, NO_UPDATE_AVAILABLE_EVENT)
                    .with_message(format!("version {} is current", self.current_version)),
            );
            return Ok(());
        }

        info!(
            current = %self.current_version,
            available = %manifest.version,
            "update available"
        );
        self.emitter.push(
            Event::new(&self.context, UPDATE_AVAILABLE_EVENT)
                .with_message(format!("update {} is available", manifest.version))
                .with_data_field("manifest", manifest_value(&manifest)),
        );

        tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(UpdateServiceError::Cancelled),
            sent = self.available_tx.send(manifest) => {
                sent.map_err(|_| UpdateServiceError::ChannelClosed)
            }
        }
    }

    async fn apply(
        &self,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateServiceError> {
        info!(version = %manifest.version, "applying update");
        self.emitter.push(
            Event::new(&self.context, UPDATE_DOWNLOAD_STARTED_EVENT)
                .with_message(format!("downloading update {}", manifest.version))
                .with_data_field("manifest", manifest_value(manifest)),
        );

        // Refuse hashless manifests before any bytes move.
        let verifier = manifest.verifier()?;

        let target = self.resolve_install_path()?;
        let parent = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| {
                UpdateServiceError::Stage(io::Error::other(
                    "install path has no parent directory",
                ))
            })?;

        let mut reader = self.update_requester.fetch(manifest, cancel).await?;

        // Stage next to the target so the final rename never crosses a
        // filesystem boundary.
        let staging = parent.join(format!(".update-{}.partial", manifest.version));
        let guard = StagingGuard::new(staging.clone());

        let mut out = tokio::fs::File::create(&staging)
            .await
            .map_err(UpdateServiceError::Stage)?;
        let mut hasher = Hasher::new(verifier.algorithm());
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            let n = tokio::select! {
                biased;

                _ = cancel.cancelled() => return Err(UpdateServiceError::Cancelled),
                read = reader.read(&mut buf) => read.map_err(UpdateServiceError::Stage)?,
            };
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n])
                .await
                .map_err(UpdateServiceError::Stage)?;
        }

        out.flush().await.map_err(UpdateServiceError::Stage)?;
        out.sync_all().await.map_err(UpdateServiceError::Stage)?;
        drop(out);

        self.emitter.push(
            Event::new(&self.context, UPDATE_DOWNLOADED_EVENT)
                .with_message(format!("update {} downloaded", manifest.version))
                .with_data_field("manifest", manifest_value(manifest)),
        );

        verifier
            .check(hasher.finalize_hex())
            .map_err(ManifestError::from)?;
        debug!(version = %manifest.version, "checksum matches, proceeding with swap");

        let swap_target = target.clone();
        let swap_staged = staging.clone();
        tokio::task::spawn_blocking(move || swap::swap_binary(&swap_target, &swap_staged))
            .await
            .map_err(|err| UpdateServiceError::Stage(io::Error::other(err)))??;

        // The staged file was renamed into place; nothing left to clean up.
        guard.disarm();

        info!(version = %manifest.version, "update applied");
        self.emitter.push(
            Event::new(&self.context, UPDATE_APPLIED_EVENT)
                .with_message(format!("update {} applied", manifest.version))
                .with_data_field("manifest", manifest_value(manifest)),
        );

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                warn!("update applied but listener notification was cancelled");
            }
            sent = self.applied_tx.send(manifest.clone()) => {
                if sent.is_err() {
                    warn!("update applied but the applied channel is closed");
                }
            }
        }

        Ok(())
    }

    fn resolve_install_path(&self) -> Result<PathBuf, UpdateServiceError> {
        match &self.install_path {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(UpdateServiceError::InstallPath),
        }
    }

    async fn check_and_report(&self, cancel: &CancellationToken) {
        match self.check(cancel).await {
            Ok(()) | Err(UpdateServiceError::Cancelled) => {}
            Err(err) => {
                warn!(error = %err, "update check failed");
                self.emitter.push(
                    Event::new(&self.context, UPDATE_CHECK_FAILED_EVENT)
                        .with_message(err.to_string())
                        .as_error(),
                );
            }
        }
    }
}

/// Removes the apply-side staging file unless disarmed.
struct StagingGuard {
    path: PathBuf,
    armed: bool,
}

impl StagingGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

async fn run_worker(
    inner: Arc<UpdateServiceInner>,
    initial_delay: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    if !initial_delay.is_zero() {
        debug!(
            delay_secs = initial_delay.as_secs(),
            "waiting for initial poll delay"
        );
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("update worker stopped during initial delay");
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
                debug!("update worker shutting down");
                return;
            }

            // The first tick fires immediately after the initial delay.
            _ = ticker.tick() => inner.check_and_report(&cancel).await,
        }
    }
}

/// Polling self-update service.
pub struct UpdateService {
    inner: Arc<UpdateServiceInner>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for UpdateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateService").finish_non_exhaustive()
    }
}

impl UpdateService {
    pub fn builder(
        manifest_url: impl Into<String>,
        current_version: impl Into<String>,
    ) -> UpdateServiceBuilder {
        UpdateServiceBuilder::new(manifest_url, current_version)
    }

    /// Version the service considers currently installed.
    pub fn current_version(&self) -> &str {
        &self.inner.current_version
    }

    /// Runs one update check immediately, outside the polling schedule.
    ///
    /// Safe to call concurrently with the worker.
    pub async fn trigger_update_check(&self) -> Result<(), UpdateServiceError> {
        self.inner.check(&self.cancel).await
    }

    /// Downloads, verifies, and installs the given update.
    ///
    /// On failure an `update_applied` event with `is_error` is emitted and
    /// the staged artifact is removed; the running binary stays in place.
    pub async fn apply_update(&self, manifest: &Manifest) -> Result<(), UpdateServiceError> {
        match self.inner.apply(manifest, &self.cancel).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.emitter.push(
                    Event::new(&self.inner.context, UPDATE_APPLIED_EVENT)
                        .with_message(err.to_string())
                        .with_data_field("manifest", manifest_value(manifest))
                        .as_error(),
                );
                Err(err)
            }
        }
    }

    /// Registers the handler invoked for each announced update.
    ///
    /// Only one listener per direction; later calls are ignored. The
    /// handler typically ends by calling [`Self::apply_update`].
    pub fn listen_for_update_available<F, Fut>(&self, handler: F)
    where
        F: Fn(Manifest) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_listener(&self.inner.available_rx, handler);
    }

    /// Registers the handler invoked after an update has been applied.
    pub fn listen_for_update_applied<F, Fut>(&self, handler: F)
    where
        F: Fn(Manifest) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_listener(&self.inner.applied_rx, handler);
    }

    fn spawn_listener<F, Fut>(&self, slot: &Mutex<Option<mpsc::Receiver<Manifest>>>, handler: F)
    where
        F: Fn(Manifest) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let receiver = {
            let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.take()
        };
        let Some(mut receiver) = receiver else {
            warn!("update listener already registered, ignoring");
            return;
        };

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => return,

                    received = receiver.recv() => match received {
                        Some(manifest) => handler(manifest).await,
                        None => return,
                    }
                }
            }
        });
    }

    /// The emitter carrying this service's events; register it with the
    /// event drain service to ship them.
    pub fn emitter(&self) -> Arc<dyn Emitter> {
        Arc::clone(&self.inner.emitter)
    }
}

#[async_trait]
impl Closer for UpdateService {
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
                result.map_err(|err| CloseError::Other(format!("update worker failed: {err}")))
            }
            _ = ctx.cancelled() => Err(CloseError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::BufferedEmitter;
    use crate::hash::{digest_hex, HashAlgorithm};
    use crate::update::requester::ArtifactReader;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct MockManifestRequester {
        manifest: Manifest,
        fetches: AtomicUsize,
    }

    impl MockManifestRequester {
        fn returning(manifest: Manifest) -> Arc<Self> {
            Arc::new(Self {
                manifest,
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ManifestRequester for MockManifestRequester {
        async fn fetch(
            &self,
            _url: &str,
            _cancel: &CancellationToken,
        ) -> Result<Manifest, ManifestRequestError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.manifest.clone())
        }
    }

    struct MockUpdateRequester {
        content: Vec<u8>,
        fetches: AtomicUsize,
    }

    impl MockUpdateRequester {
        fn serving(content: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                content: content.to_vec(),
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl UpdateRequester for MockUpdateRequester {
        async fn fetch(
            &self,
            _manifest: &Manifest,
            _cancel: &CancellationToken,
        ) -> Result<ArtifactReader, UpdateFetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Box::pin(std::io::Cursor::new(self.content.clone())))
        }
    }

    fn manifest_for(version: &str, content: &[u8]) -> Manifest {
        Manifest {
            version: version.to_string(),
            hash: format!("sha256:{}", digest_hex(HashAlgorithm::Sha256, content)),
            url: "http://cp.local/binary".to_string(),
        }
    }

    struct TestSetup {
        _dir: TempDir,
        target: PathBuf,
        service: UpdateService,
        manifest_requester: Arc<MockManifestRequester>,
        update_requester: Arc<MockUpdateRequester>,
        emitter: Arc<BufferedEmitter>,
    }

    fn start_service(current_version: &str, manifest: Manifest, content: &[u8]) -> TestSetup {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("app");
        std::fs::write(&target, b"old binary").unwrap();

        let manifest_requester = MockManifestRequester::returning(manifest);
        let update_requester = MockUpdateRequester::serving(content);
        let emitter = Arc::new(BufferedEmitter::with_defaults());

        let service = UpdateService::builder("http://cp.local/manifest", current_version)
            .with_manifest_requester(
                Arc::clone(&manifest_requester) as Arc<dyn ManifestRequester>
            )
            .with_update_requester(Arc::clone(&update_requester) as Arc<dyn UpdateRequester>)
            .with_emitter(Arc::clone(&emitter) as Arc<dyn Emitter>)
            .with_install_path(&target)
            // Keep the schedule out of the way; tests drive checks directly.
            .with_initial_poll_delay(Duration::from_secs(3600))
            .start(&CancellationToken::new())
            .unwrap();

        TestSetup {
            _dir: dir,
            target,
            service,
            manifest_requester,
            update_requester,
            emitter,
        }
    }

    async fn polled_event_types(emitter: &BufferedEmitter) -> Vec<(&'static str, bool)> {
        tokio::task::yield_now().await;
        emitter
            .poll_events()
            .iter()
            .map(|e| (e.event_type.as_str(), e.is_error))
            .collect()
    }

    #[tokio::test]
    async fn empty_version_is_rejected() {
        let err = UpdateService::builder("http://cp.local/manifest", "")
            .start(&CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, UpdateServiceError::Configuration(_)));
    }

    #[tokio::test]
    async fn version_falls_back_to_ambient_context() {
        let service = UpdateService::builder("http://cp.local/manifest", "")
            .with_context(RequestContext::new().with_client_version("1.5.0"))
            .with_initial_poll_delay(Duration::from_secs(3600))
            .start(&CancellationToken::new())
            .unwrap();

        assert_eq!(service.current_version(), "1.5.0");
        service.close(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn zero_poll_interval_is_rejected() {
        let err = UpdateService::builder("http://cp.local/manifest", "1.0.0")
            .with_poll_interval(Duration::ZERO)
            .start(&CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, UpdateServiceError::Configuration(_)));
    }

    #[tokio::test]
    async fn matching_version_is_a_no_op() {
        let content = b"new binary bytes";
        let setup = start_service("1.0.0", manifest_for("1.0.0", content), content);

        setup.service.trigger_update_check().await.unwrap();

        // No artifact fetch, no file writes, one no-op event.
        assert_eq!(setup.update_requester.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(&setup.target).unwrap(), b"old binary");
        assert_eq!(
            polled_event_types(&setup.emitter).await,
            vec![("no_update_available", false)]
        );

        setup.service.close(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn newer_version_is_announced_to_the_listener() {
        let content = b"new binary bytes";
        let setup = start_service("1.0.0", manifest_for("2.0.0", content), content);

        let (seen_tx, mut seen_rx) = mpsc::channel(1);
        setup.service.listen_for_update_available(move |manifest| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(manifest).await;
            }
        });

        setup.service.trigger_update_check().await.unwrap();

        let announced = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(announced.version, "2.0.0");

        assert_eq!(
            polled_event_types(&setup.emitter).await,
            vec![("update_available", false)]
        );

        setup.service.close(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn apply_update_swaps_the_binary() {
        let content = b"new binary bytes";
        let manifest = manifest_for("2.0.0", content);
        let setup = start_service("1.0.0", manifest.clone(), content);

        let (applied_tx, mut applied_rx) = mpsc::channel(1);
        setup.service.listen_for_update_applied(move |manifest| {
            let applied_tx = applied_tx.clone();
            async move {
                let _ = applied_tx.send(manifest).await;
            }
        });

        setup.service.apply_update(&manifest).await.unwrap();

        assert_eq!(std::fs::read(&setup.target).unwrap(), content);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&setup.target)
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o100, 0o100, "owner-executable bit must be set");
        }

        // No backup slot, no staging leftovers.
        let dir = setup.target.parent().unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name != "app")
            .collect();
        assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");

        let applied = tokio::time::timeout(Duration::from_secs(1), applied_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(applied.version, "2.0.0");

        assert_eq!(
            polled_event_types(&setup.emitter).await,
            vec![
                ("update_download_started", false),
                ("update_downloaded", false),
                ("update_applied", false),
            ]
        );

        setup.service.close(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn checksum_mismatch_aborts_before_the_swap() {
        let expected = b"new binary bytes";
        let manifest = manifest_for("2.0.0", expected);
        // The requester serves different bytes than the manifest promises.
        let setup = start_service("1.0.0", manifest.clone(), b"tampered bytes!!");

        let err = setup.service.apply_update(&manifest).await.unwrap_err();
        assert!(matches!(err, UpdateServiceError::Integrity(_)));

        // Binary untouched, staging removed.
        assert_eq!(std::fs::read(&setup.target).unwrap(), b"old binary");
        let dir = setup.target.parent().unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name != "app")
            .collect();
        assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");

        let events = polled_event_types(&setup.emitter).await;
        assert_eq!(events.last(), Some(&("update_applied", true)));

        setup.service.close(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn hashless_manifest_is_refused_before_download() {
        let setup = start_service("1.0.0", manifest_for("2.0.0", b"x"), b"x");

        let manifest = Manifest {
            version: "2.0.0".to_string(),
            hash: String::new(),
            url: "http://cp.local/binary".to_string(),
        };

        let err = setup.service.apply_update(&manifest).await.unwrap_err();
        assert!(matches!(
            err,
            UpdateServiceError::Integrity(ManifestError::MissingHash(_))
        ));
        assert_eq!(setup.update_requester.fetches.load(Ordering::SeqCst), 0);

        setup.service.close(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn worker_polls_on_schedule() {
        let content = b"bytes";
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("app");
        std::fs::write(&target, b"old").unwrap();

        let manifest_requester =
            MockManifestRequester::returning(manifest_for("1.0.0", content));

        let service = UpdateService::builder("http://cp.local/manifest", "1.0.0")
            .with_manifest_requester(
                Arc::clone(&manifest_requester) as Arc<dyn ManifestRequester>
            )
            .with_install_path(&target)
            .with_initial_poll_delay(Duration::ZERO)
            .with_poll_interval(Duration::from_millis(10))
            .start(&CancellationToken::new())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        service.close(&CancellationToken::new()).await.unwrap();

        assert!(manifest_requester.fetches.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let content = b"bytes";
        let setup = start_service("1.0.0", manifest_for("1.0.0", content), content);

        let ctx = CancellationToken::new();
        setup.service.close(&ctx).await.unwrap();
        setup.service.close(&ctx).await.unwrap();
    }
}
