use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::MigrationError;
use super::model::{BulkCopyBatch, CopyBatch, CopyRequest, FileRecord};
use super::paths;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
/// Files strictly larger than this go through per-file transfer.
pub const LARGE_FILE_THRESHOLD: u64 = 2_147_483_647;

/// Receives planned work. Each call gets a freshly built batch.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn receive_batch(&self, batch: CopyBatch) -> Result<(), MigrationError>;
    async fn receive_bulk_batch(&self, batch: BulkCopyBatch) -> Result<(), MigrationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_batch_size: usize,
    /// `None` sends every file through per-file transfer.
    pub large_file_threshold: Option<u64>,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            large_file_threshold: Some(LARGE_FILE_THRESHOLD),
        }
    }
}

impl BatchPolicy {
    pub fn is_large(&self, file: &FileRecord) -> bool {
        match self.large_file_threshold {
            Some(threshold) => file.size_bytes > threshold,
            None => true,
        }
    }

    fn batch_size(&self) -> usize {
        self.max_batch_size.max(1)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub copy_batches: usize,
    pub bulk_batches: usize,
    pub large_files: usize,
    pub bulk_files: usize,
}

/// Accumulates items and hands out a full chunk every `max` pushes.
#[derive(Debug)]
struct Chunker<T> {
    max: usize,
    buffer: Vec<T>,
}

impl<T> Chunker<T> {
    fn new(max: usize) -> Self {
        Self {
            max,
            buffer: Vec::with_capacity(max),
        }
    }

    fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.buffer.push(item);
        if self.buffer.len() >= self.max {
            Some(std::mem::replace(&mut self.buffer, Vec::with_capacity(self.max)))
        } else {
            None
        }
    }

    fn finish(self) -> Option<Vec<T>> {
        (!self.buffer.is_empty()).then_some(self.buffer)
    }
}

/// Splits files into consecutive batches of at most `max_batch_size`, in crawl order.
pub fn plan_batches(
    files: Vec<FileRecord>,
    request: &CopyRequest,
    request_id: Option<Uuid>,
    max_batch_size: usize,
) -> Vec<CopyBatch> {
    let mut chunker = Chunker::new(max_batch_size.max(1));
    let mut batches = Vec::new();
    for file in files {
        if let Some(items) = chunker.push(file) {
            batches.push(copy_batch(request, request_id, items));
        }
    }
    if let Some(items) = chunker.finish() {
        batches.push(copy_batch(request, request_id, items));
    }
    batches
}

/// Routes files to the sink: large ones as [`CopyBatch`]es, the rest as
/// [`BulkCopyBatch`]es grouped by their folder below the source folder. Full batches are handed over as
/// soon as they fill; partial ones at the end, in first-seen order.
pub async fn dispatch<S>(
    files: Vec<FileRecord>,
    request: &CopyRequest,
    request_id: Option<Uuid>,
    policy: &BatchPolicy,
    sink: &S,
) -> Result<PlanSummary, MigrationError>
where
    S: BatchSink + ?Sized,
{
    let size = policy.batch_size();
    let mut summary = PlanSummary::default();
    let mut large = Chunker::new(size);
    let mut groups: Vec<(String, Chunker<String>)> = Vec::new();
    let mut group_index: HashMap<String, usize> = HashMap::new();

    for file in files {
        if policy.is_large(&file) {
            summary.large_files += 1;
            if let Some(items) = large.push(file) {
                sink.receive_batch(copy_batch(request, request_id, items)).await?;
                summary.copy_batches += 1;
            }
            continue;
        }

        summary.bulk_files += 1;
        let subfolder = paths::source_subfolder(&file, request)?;
        let index = match group_index.get(&subfolder) {
            Some(index) => *index,
            None => {
                groups.push((subfolder.clone(), Chunker::new(size)));
                group_index.insert(subfolder, groups.len() - 1);
                groups.len() - 1
            }
        };
        let (subfolder, chunker) = &mut groups[index];
        if let Some(source_urls) = chunker.push(file.full_url()) {
            sink.receive_bulk_batch(bulk_batch(request, subfolder, source_urls))
                .await?;
            summary.bulk_batches += 1;
        }
    }

    if let Some(items) = large.finish() {
        sink.receive_batch(copy_batch(request, request_id, items)).await?;
        summary.copy_batches += 1;
    }
    for (subfolder, chunker) in groups {
        if let Some(source_urls) = chunker.finish() {
            sink.receive_bulk_batch(bulk_batch(request, &subfolder, source_urls))
                .await?;
            summary.bulk_batches += 1;
        }
    }

    if summary.copy_batches == 0 && summary.bulk_batches == 0 {
        debug!("nothing to copy");
    } else {
        info!(
            copy_batches = summary.copy_batches,
            bulk_batches = summary.bulk_batches,
            large_files = summary.large_files,
            bulk_files = summary.bulk_files,
            "batches planned"
        );
    }
    Ok(summary)
}

fn copy_batch(request: &CopyRequest, request_id: Option<Uuid>, items: Vec<FileRecord>) -> CopyBatch {
    CopyBatch {
        request_id,
        request: request.clone(),
        items,
    }
}

fn bulk_batch(request: &CopyRequest, subfolder: &str, source_urls: Vec<String>) -> BulkCopyBatch {
    BulkCopyBatch {
        request: request.clone(),
        subfolder: subfolder.to_string(),
        source_urls,
    }
}
