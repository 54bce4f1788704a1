use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use docshift_core::{LibraryClient, LibraryError};
use futures_util::StreamExt;
use reqwest::Body;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use super::throttle::ThrottleAware;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Api(#[from] LibraryError),
    #[error("stream failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
}

impl ThrottleAware for TransferError {
    fn is_throttled(&self) -> bool {
        match self {
            TransferError::Api(err) => err.is_throttled(),
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            TransferError::Api(err) => err.retry_after(),
            _ => None,
        }
    }
}

/// Moves file bodies between libraries through a local spool file, so an
/// upload can be replayed without downloading again.
#[derive(Clone)]
pub struct TransferClient {
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 4,
            upload_concurrency: 2,
        }
    }
}

impl TransferClient {
    pub fn new() -> Self {
        Self::with_config(TransferConfig::default())
    }

    pub fn with_config(config: TransferConfig) -> Self {
        Self {
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
        }
    }

    /// Streams the file at `server_relative_url` into `target`; returns bytes written.
    pub async fn download_to_path(
        &self,
        client: &LibraryClient,
        server_relative_url: &str,
        target: &Path,
    ) -> Result<u64, TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let response = client.download_file(server_relative_url).await?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let written = match write_partial(response, &partial).await {
            Ok(written) => written,
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(err);
            }
        };
        if let Err(err) = tokio::fs::rename(&partial, target).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err.into());
        }
        Ok(written)
    }

    pub async fn upload_from_path(
        &self,
        client: &LibraryClient,
        server_relative_url: &str,
        source: &Path,
        overwrite: bool,
    ) -> Result<(), TransferError> {
        let _permit = self
            .upload_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        let file = tokio::fs::File::open(source).await?;
        let body = Body::wrap_stream(ReaderStream::new(file));
        client
            .upload_file(server_relative_url, body, overwrite)
            .await?;
        Ok(())
    }
}

/// Streams a response body into `partial` and syncs it; the caller owns cleanup.
async fn write_partial(response: reqwest::Response, partial: &Path) -> Result<u64, TransferError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

/// A uniquely named file under the spool directory, removed on drop.
#[derive(Debug)]
pub struct SpoolFile {
    path: PathBuf,
}

impl SpoolFile {
    pub fn new(spool_dir: &Path) -> Self {
        Self {
            path: spool_dir.join(format!("{}.spool", Uuid::new_v4())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        let _ = std::fs::remove_file(partial_path(&self.path));
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
