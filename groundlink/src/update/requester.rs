//! Fetching of update binaries.
//!
//! Two strategies exist behind one trait: a plain whole-body GET, and a
//! resumable ranged download that stages chunks into a temp file and can
//! pick up where a previous attempt stopped.

use crate::http::{HttpClient, HttpClientError};
use crate::manifest::Manifest;
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::CONTENT_LENGTH;
use reqwest::StatusCode;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default size of one ranged request (2 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 2 * 1024 * 1024;

/// Streaming source of the downloaded binary.
pub type ArtifactReader = Pin<Box<dyn AsyncRead + Send>>;

/// Errors from fetching an update binary.
#[derive(Debug, Error)]
pub enum UpdateFetchError {
    #[error("failed to fetch update: {0}")]
    Http(#[from] HttpClientError),

    #[error("unexpected status code: {0}")]
    UnexpectedStatus(StatusCode),

    #[error("missing or invalid Content-Length header")]
    InvalidContentLength,

    #[error("staging I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Obtains a streaming reader over the binary a manifest points at.
#[async_trait]
pub trait UpdateRequester: Send + Sync {
    async fn fetch(
        &self,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<ArtifactReader, UpdateFetchError>;
}

/// Whole-body requester: one GET, the response body streams straight
/// through.
#[derive(Debug, Clone)]
pub struct HttpUpdateRequester {
    client: HttpClient,
}

impl HttpUpdateRequester {
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UpdateRequester for HttpUpdateRequester {
    async fn fetch(
        &self,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<ArtifactReader, UpdateFetchError> {
        let response = self.client.get(&manifest.url, cancel).await?;

        if response.status() != StatusCode::OK {
            return Err(UpdateFetchError::UnexpectedStatus(response.status()));
        }

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }
}

/// Ranged, resumable requester.
///
/// Downloads into `<temp_dir>/update-<version>.tmp` in fixed-size chunks.
/// If that file already exists from a prior attempt, the download resumes
/// from its size. The returned reader unlinks the staging file when
/// dropped.
#[derive(Debug, Clone)]
pub struct RangedUpdateRequester {
    client: HttpClient,
    temp_dir: PathBuf,
    chunk_size: u64,
}

impl RangedUpdateRequester {
    pub fn new(client: HttpClient, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            temp_dir: temp_dir.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Size of each `Range` request. Zero falls back to the default.
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        self
    }

    fn staging_path(&self, manifest: &Manifest) -> PathBuf {
        self.temp_dir.join(format!("update-{}.tmp", manifest.version))
    }

    async fn total_size(
        &self,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<u64, UpdateFetchError> {
        let response = self.client.head(&manifest.url, cancel).await?;

        if !response.status().is_success() {
            return Err(UpdateFetchError::UnexpectedStatus(response.status()));
        }

        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or(UpdateFetchError::InvalidContentLength)
    }
}

#[async_trait]
impl UpdateRequester for RangedUpdateRequester {
    async fn fetch(
        &self,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<ArtifactReader, UpdateFetchError> {
        let staging = self.staging_path(manifest);

        let mut start = match tokio::fs::metadata(&staging).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };

        let total = self.total_size(manifest, cancel).await?;

        if start > 0 {
            info!(
                version = %manifest.version,
                resumed_at = start,
                total,
                "resuming partial update download"
            );
        }

        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&staging)
            .await?;

        while start < total {
            let end = (start + self.chunk_size - 1).min(total - 1);
            debug!(start, end, total, "requesting update chunk");

            let response = self
                .client
                .get_range(&manifest.url, start, end, cancel)
                .await?;

            match response.status() {
                StatusCode::PARTIAL_CONTENT | StatusCode::OK => {}
                status => return Err(UpdateFetchError::UnexpectedStatus(status)),
            }

            let mut stream = response.bytes_stream().map_err(std::io::Error::other);
            while let Some(chunk) = stream.try_next().await? {
                out.write_all(&chunk).await?;
                start += chunk.len() as u64;
            }
        }

        out.flush().await?;
        out.sync_all().await?;
        drop(out);

        let file = File::open(&staging).await?;
        Ok(Box::pin(UnlinkOnRead::new(file, staging)))
    }
}

/// Reader over a staged file that unlinks the file once dropped.
///
/// Successful consumers and error paths alike end up removing the staging
/// file; only a download that failed before the reader existed leaves it
/// behind, which is exactly what enables resumption.
struct UnlinkOnRead {
    file: File,
    path: PathBuf,
}

impl UnlinkOnRead {
    fn new(file: File, path: PathBuf) -> Self {
        Self { file, path }
    }
}

impl AsyncRead for UnlinkOnRead {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

impl Drop for UnlinkOnRead {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[test]
    fn zero_chunk_size_falls_back_to_default() {
        let requester =
            RangedUpdateRequester::new(HttpClient::with_defaults().unwrap(), "/tmp")
                .with_chunk_size(0);
        assert_eq!(requester.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn staging_path_includes_the_version() {
        let requester =
            RangedUpdateRequester::new(HttpClient::with_defaults().unwrap(), "/var/tmp");
        let manifest = Manifest {
            version: "2.0.0".to_string(),
            hash: String::new(),
            url: String::new(),
        };
        assert_eq!(
            requester.staging_path(&manifest),
            PathBuf::from("/var/tmp/update-2.0.0.tmp")
        );
    }

    #[tokio::test]
    async fn unlink_on_read_removes_the_file_after_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("staged.tmp");
        tokio::fs::write(&path, b"staged bytes").await.unwrap();

        let file = File::open(&path).await.unwrap();
        let mut reader = UnlinkOnRead::new(file, path.clone());

        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"staged bytes");
        assert!(path.exists());

        drop(reader);
        assert!(!path.exists());
    }
}
