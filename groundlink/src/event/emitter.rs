//! Buffered event collection.
//!
//! Producers push events without blocking; a background collector task
//! moves them from a bounded queue into an internal buffer that consumers
//! drain with `poll_events`. When the queue is full or the emitter is
//! closed, the incoming event is dropped and handed to the drop callback.

use super::Event;
use crate::lifecycle::CloseError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Queue capacity used when none (or zero) is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Callback receiving events that could not be enqueued.
pub type DropCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// Sink and source of status events.
#[async_trait]
pub trait Emitter: Send + Sync {
    /// Hands an event to the emitter. Never blocks the caller.
    fn push(&self, event: Event);

    /// Takes ownership of all events accumulated so far.
    fn poll_events(&self) -> Vec<Event>;

    /// Stops collecting. Idempotent.
    async fn close(&self, ctx: &CancellationToken) -> Result<(), CloseError>;
}

/// Emitter that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEmitter;

#[async_trait]
impl Emitter for NoopEmitter {
    fn push(&self, _event: Event) {}

    fn poll_events(&self) -> Vec<Event> {
        Vec::new()
    }

    async fn close(&self, _ctx: &CancellationToken) -> Result<(), CloseError> {
        Ok(())
    }
}

/// Builder for [`BufferedEmitter`].
#[derive(Default)]
pub struct BufferedEmitterBuilder {
    buffer_size: usize,
    drop_callback: Option<DropCallback>,
}

impl BufferedEmitterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue capacity. Zero falls back to [`DEFAULT_BUFFER_SIZE`].
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Callback invoked with each dropped event.
    pub fn with_drop_callback(mut self, callback: impl Fn(Event) + Send + Sync + 'static) -> Self {
        self.drop_callback = Some(Arc::new(callback));
        self
    }

    /// Builds the emitter and spawns its collector task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> BufferedEmitter {
        let buffer_size = if self.buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.buffer_size
        };

        let (queue_tx, queue_rx) = mpsc::channel(buffer_size);
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let closed = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));

        let collector = tokio::spawn(collector(
            queue_rx,
            Arc::clone(&buffer),
            closed.clone(),
            Arc::clone(&finished),
        ));

        BufferedEmitter {
            queue_tx,
            buffer,
            drop_callback: self.drop_callback,
            closed,
            finished,
            collector: Mutex::new(Some(collector)),
            buffer_size,
        }
    }
}

/// Bounded in-memory event queue with a single background collector.
pub struct BufferedEmitter {
    queue_tx: mpsc::Sender<Event>,
    buffer: Arc<Mutex<Vec<Event>>>,
    drop_callback: Option<DropCallback>,
    closed: CancellationToken,
    finished: Arc<AtomicBool>,
    collector: Mutex<Option<JoinHandle<()>>>,
    buffer_size: usize,
}

impl BufferedEmitter {
    pub fn builder() -> BufferedEmitterBuilder {
        BufferedEmitterBuilder::new()
    }

    /// Emitter with default capacity and no drop callback.
    pub fn with_defaults() -> Self {
        BufferedEmitterBuilder::new().build()
    }

    /// Effective queue capacity.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn drop_event(&self, event: Event) {
        if let Some(callback) = &self.drop_callback {
            callback(event);
        }
    }

    fn lock_buffer(buffer: &Mutex<Vec<Event>>) -> MutexGuard<'_, Vec<Event>> {
        buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn collector(
    mut queue_rx: mpsc::Receiver<Event>,
    buffer: Arc<Mutex<Vec<Event>>>,
    closed: CancellationToken,
    finished: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = closed.cancelled() => break,

            received = queue_rx.recv() => match received {
                Some(event) => BufferedEmitter::lock_buffer(&buffer).push(event),
                None => break,
            }
        }
    }

    // Bounded final drain: whatever was queued before the shutdown signal
    // must still become visible to poll_events.
    while let Ok(event) = queue_rx.try_recv() {
        BufferedEmitter::lock_buffer(&buffer).push(event);
    }

    finished.store(true, Ordering::Release);
}

#[async_trait]
impl Emitter for BufferedEmitter {
    fn push(&self, event: Event) {
        if self.finished.load(Ordering::Acquire) {
            self.drop_event(event);
            return;
        }

        match self.queue_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) | Err(TrySendError::Closed(event)) => {
                self.drop_event(event);
            }
        }
    }

    fn poll_events(&self) -> Vec<Event> {
        std::mem::take(&mut *Self::lock_buffer(&self.buffer))
    }

    async fn close(&self, ctx: &CancellationToken) -> Result<(), CloseError> {
        self.closed.cancel();

        let handle = {
            let mut collector = self
                .collector
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            collector.take()
        };
        let Some(handle) = handle else {
            return Ok(());
        };

        tokio::select! {
            result = handle => {
                result.map_err(|err| CloseError::Other(format!("collector task failed: {err}")))
            }
            _ = ctx.cancelled() => {
                // The collector keeps draining in the background; we just
                // stop waiting for it.
                warn!("emitter collector did not finish draining in time");
                Err(CloseError::Cancelled)
            }
        }
    }
}
