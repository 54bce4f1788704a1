use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use super::error::MigrationError;
use super::model::{CopiedFile, CopyBatch, CopyRequest, FileRecord};
use super::retry::{self, Abandoned, DEFAULT_MAX_ATTEMPTS};

/// Copies one file at a time for a [`CopyExecutor`].
#[async_trait]
pub trait FileListProcessor: Send + Sync {
    /// Called once per batch before any file is processed.
    async fn init(&mut self) -> Result<(), MigrationError>;

    async fn process_file(
        &self,
        file: &FileRecord,
        request: &CopyRequest,
    ) -> Result<CopiedFile, MigrationError>;
}

#[derive(Debug)]
pub struct CopyOutcome {
    pub copied: Vec<CopiedFile>,
    pub abandoned: Vec<Abandoned<FileRecord>>,
    pub elapsed: Duration,
}

impl CopyOutcome {
    pub fn is_complete(&self) -> bool {
        self.abandoned.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CopyExecutor {
    max_attempts: u32,
}

impl Default for CopyExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl CopyExecutor {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Runs every item of `batch` through `processor`, retrying failures.
    ///
    /// Only an invalid batch or a failing `init` is an error; item failures
    /// end up in [`CopyOutcome::abandoned`].
    pub async fn complete_copy<P>(
        &self,
        batch: &CopyBatch,
        processor: &mut P,
    ) -> Result<CopyOutcome, MigrationError>
    where
        P: FileListProcessor + ?Sized,
    {
        if batch.items.is_empty() {
            return Err(MigrationError::InvalidRequest("copy batch has no items".into()));
        }
        batch.request.validate()?;

        processor.init().await?;
        let started = Instant::now();
        let processor: &P = processor;
        let request = &batch.request;

        let outcome = retry::complete_with_retries(
            batch.items.clone(),
            |file: FileRecord| async move { processor.process_file(&file, request).await },
            self.max_attempts,
        )
        .await;

        let elapsed = started.elapsed();
        if outcome.abandoned.is_empty() {
            info!(
                files = outcome.results.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "copy batch finished"
            );
        } else {
            warn!(
                copied = outcome.results.len(),
                abandoned = outcome.abandoned.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "copy batch finished with abandoned files"
            );
        }

        Ok(CopyOutcome {
            copied: outcome.results,
            abandoned: outcome.abandoned,
            elapsed,
        })
    }
}
