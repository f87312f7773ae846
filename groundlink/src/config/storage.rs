//! Persistence for the last-known configuration.

use super::Config;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors from loading or persisting a configuration.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("config storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("config (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Pluggable persistence for the last-known config.
///
/// `save(None)` clears the stored config.
#[async_trait]
pub trait ConfigStorage: Send + Sync {
    async fn get(&self) -> Result<Option<Config>, StorageError>;
    async fn save(&self, config: Option<&Config>) -> Result<(), StorageError>;
}

/// Keeps the config in process memory only.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    config: RwLock<Option<Config>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStorage for MemoryStorage {
    async fn get(&self) -> Result<Option<Config>, StorageError> {
        Ok(self.config.read().await.clone())
    }

    async fn save(&self, config: Option<&Config>) -> Result<(), StorageError> {
        *self.config.write().await = config.cloned();
        Ok(())
    }
}

/// Persists the config as JSON on disk.
///
/// Writes go to `<path>.tmp` and are committed with a rename, so the file
/// at `<path>` always holds either the previous or the new content, never a
/// partial write.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    // Excludes readers during the write-then-rename window.
    lock: RwLock<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut os_string = self.path.clone().into_os_string();
        os_string.push(".tmp");
        PathBuf::from(os_string)
    }
}

#[async_trait]
impl ConfigStorage for FileStorage {
    async fn get(&self) -> Result<Option<Config>, StorageError> {
        let _guard = self.lock.read().await;

        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        Ok(Some(serde_json::from_slice(&data)?))
    }

    async fn save(&self, config: Option<&Config>) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;

        let Some(config) = config else {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        };

        let data = serde_json::to_vec(config)?;
        let temp_path = self.temp_path();
        tokio::fs::write(&temp_path, &data).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}
