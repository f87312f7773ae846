//! Component lifecycle management.
//!
//! Long-running components register with a [`LifecycleManager`], which shuts
//! them down in reverse registration order. Every component is attempted
//! even when earlier ones fail; failures are aggregated into a single
//! [`ShutdownError`].

use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Error from closing a single component.
#[derive(Debug, Error)]
pub enum CloseError {
    /// The close context fired before the component finished shutting down.
    #[error("close cancelled before completion")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// A named component that can be shut down.
///
/// `close` must be idempotent: a second call returns without effect.
#[async_trait]
pub trait Closer: Send + Sync {
    fn name(&self) -> &str;

    /// Shuts the component down, waiting for its worker to finish unless
    /// `ctx` fires first.
    async fn close(&self, ctx: &CancellationToken) -> Result<(), CloseError>;
}

#[async_trait]
impl<T: Closer + ?Sized> Closer for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn close(&self, ctx: &CancellationToken) -> Result<(), CloseError> {
        (**self).close(ctx).await
    }
}

/// One component's failure inside [`ShutdownError`].
#[derive(Debug)]
pub struct ComponentError {
    pub name: String,
    pub error: CloseError,
}

/// Aggregate of every component failure during [`LifecycleManager::close_all`].
#[derive(Debug)]
pub struct ShutdownError {
    pub failures: Vec<ComponentError>,
}

impl std::error::Error for ShutdownError {}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to close {} component(s):", self.failures.len())?;
        for failure in &self.failures {
            write!(f, " {}: {};", failure.name, failure.error)?;
        }
        Ok(())
    }
}

/// LIFO registry of closable components.
///
/// Registration prepends, so `close_all` visits components in reverse
/// registration order: the most recently started component is torn down
/// first.
#[derive(Default)]
pub struct LifecycleManager {
    closers: Mutex<Vec<Box<dyn Closer>>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a component for shutdown.
    pub fn register(&self, closer: Box<dyn Closer>) {
        let name = closer.name().to_string();
        let mut closers = self.lock_closers();
        closers.insert(0, closer);
        info!(component = %name, "registered component for shutdown");
    }

    /// Number of registered components.
    pub fn len(&self) -> usize {
        self.lock_closers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_closers().is_empty()
    }

    /// Closes every registered component in list order.
    ///
    /// Never short-circuits: each component is attempted, and all failures
    /// are collected into the returned [`ShutdownError`].
    pub async fn close_all(&self, ctx: &CancellationToken) -> Result<(), ShutdownError> {
        let closers = std::mem::take(&mut *self.lock_closers());

        let mut failures = Vec::new();
        for closer in &closers {
            if let Err(err) = closer.close(ctx).await {
                error!(component = %closer.name(), error = %err, "failed to close component");
                failures.push(ComponentError {
                    name: closer.name().to_string(),
                    error: err,
                });
            }
        }

        if failures.is_empty() {
            info!(count = closers.len(), "closed all components");
            Ok(())
        } else {
            Err(ShutdownError { failures })
        }
    }

    fn lock_closers(&self) -> std::sync::MutexGuard<'_, Vec<Box<dyn Closer>>> {
        self.closers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
