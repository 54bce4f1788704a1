use tracing::{info, warn};
use uuid::Uuid;

use super::crawler::{self, ListLoader};
use super::error::MigrationError;
use super::executor::{CopyExecutor, CopyOutcome, FileListProcessor};
use super::model::{CopyBatch, CopyRequest};
use super::paths;
use super::planner::{self, BatchPolicy, BatchSink, PlanSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartCopySummary {
    pub files_found: usize,
    pub folders_found: usize,
    pub ignored: usize,
    pub plan: PlanSummary,
}

/// Ties crawling, planning and batch execution together.
#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationEngine {
    policy: BatchPolicy,
    executor: CopyExecutor,
}

impl MigrationEngine {
    pub fn new(policy: BatchPolicy, executor: CopyExecutor) -> Self {
        Self { policy, executor }
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    /// Crawls the source folder and hands every in-scope file to `sink`.
    ///
    /// Invalid records and files outside the source folder are skipped and
    /// counted in [`StartCopySummary::ignored`].
    pub async fn start_copy<L, S>(
        &self,
        request: &CopyRequest,
        request_id: Option<Uuid>,
        loader: &L,
        sink: &S,
    ) -> Result<StartCopySummary, MigrationError>
    where
        L: ListLoader + ?Sized,
        L::Error: std::error::Error + Send + Sync + 'static,
        S: BatchSink + ?Sized,
    {
        request.validate()?;
        let source = paths::resolve(&request.source_site, &request.source_path)?;
        info!(
            container = %source.container_path,
            folder = %source.item_relative_path,
            destination = %request.dest_path,
            "starting copy"
        );

        let crawl = crawler::crawl_all(loader, &request.source_path)
            .await
            .map_err(|err| MigrationError::Crawl(Box::new(err)))?;
        let files_found = crawl.files.len();
        let folders_found = crawl.folders.len();

        let (in_scope, ignored): (Vec<_>, Vec<_>) = crawl
            .files
            .into_iter()
            .partition(|file| file.is_valid() && paths::is_valid_for(file, request));
        if !ignored.is_empty() {
            warn!(ignored = ignored.len(), "skipping files that are invalid or outside the source folder");
        }

        let plan = planner::dispatch(in_scope, request, request_id, &self.policy, sink).await?;
        Ok(StartCopySummary {
            files_found,
            folders_found,
            ignored: ignored.len(),
            plan,
        })
    }

    pub async fn complete_copy<P>(
        &self,
        batch: &CopyBatch,
        processor: &mut P,
    ) -> Result<CopyOutcome, MigrationError>
    where
        P: FileListProcessor + ?Sized,
    {
        self.executor.complete_copy(batch, processor).await
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
