use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use docshift_core::{
    CopyJobOptions, CopyJobState, LibraryClient, ListInfo, ListItem, NameConflictBehavior,
};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::migrate::backoff::Backoff;
use crate::migrate::cache::{FolderCache, ListCache};
use crate::migrate::conflict;
use crate::migrate::crawler::ListLoader;
use crate::migrate::executor::FileListProcessor;
use crate::migrate::model::{
    BulkCopyBatch, ConflictPolicy, ContainerRef, CopiedFile, CopyBatch, CopyRequest, CrawlPage,
    FileRecord, QueueMessage,
};
use crate::migrate::paths::{self, PathError};
use crate::migrate::planner::BatchSink;
use crate::migrate::throttle::Throttler;
use crate::migrate::transfer::{SpoolFile, TransferClient};
use crate::migrate::MigrationError;
use crate::storage::StateStore;
use crate::token_provider::TokenCache;

/// Hands out library clients bound to a web, carrying the current token.
#[derive(Clone)]
pub struct SiteConnector {
    http: reqwest::Client,
    tokens: Arc<TokenCache>,
    throttler: Throttler,
}

impl SiteConnector {
    pub fn new(tokens: Arc<TokenCache>, throttler: Throttler) -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens,
            throttler,
        }
    }

    pub fn throttler(&self) -> &Throttler {
        &self.throttler
    }

    pub async fn client(&self, web_url: &str) -> Result<LibraryClient, MigrationError> {
        let token = self.tokens.access_token().await?;
        Ok(LibraryClient::with_http(self.http.clone(), web_url, token)?)
    }

    pub async fn warm_up(&self) -> Result<(), MigrationError> {
        self.tokens.access_token().await?;
        Ok(())
    }

    /// Auth failures drop the cached token so a retry fetches a new one.
    pub async fn observe(&self, err: &MigrationError) {
        if err.is_auth() {
            self.tokens.invalidate().await;
        }
    }
}

/// Rejects requests whose sites are outside the tenant or whose folders are missing.
pub async fn verify_scope(
    connector: &SiteConnector,
    tenant_url: &str,
    request: &CopyRequest,
) -> Result<(), MigrationError> {
    for site in [&request.source_site, &request.dest_site] {
        if !paths::is_within_tenant(site, tenant_url) {
            return Err(MigrationError::InvalidRequest(format!(
                "{site} is outside {tenant_url}"
            )));
        }
    }

    let source_exists = folder_exists(connector, &request.source_site, &request.source_path).await?;
    let dest_exists = folder_exists(connector, &request.dest_site, &request.dest_path).await?;
    if !source_exists || !dest_exists {
        return Err(MigrationError::InvalidRequest(
            "source or destination folder not found".into(),
        ));
    }
    Ok(())
}

async fn folder_exists(
    connector: &SiteConnector,
    site: &str,
    relative_path: &str,
) -> Result<bool, MigrationError> {
    let web_path =
        paths::web_relative_path(site).ok_or_else(|| PathError::InvalidSiteUrl(site.to_string()))?;
    let folder = format!(
        "{web_path}{}",
        relative_path.trim_end_matches(paths::SEPARATOR)
    );
    let client = connector.client(site).await?;
    Ok(connector
        .throttler()
        .run("folder exists", || client.folder_exists(&folder))
        .await?)
}

/// Pages through every item of the list that holds the source folder.
pub struct RemoteListLoader {
    connector: SiteConnector,
    web_url: String,
    list: ListInfo,
    page_size: u32,
}

impl RemoteListLoader {
    pub async fn open(
        connector: &SiteConnector,
        request: &CopyRequest,
        page_size: u32,
    ) -> Result<Self, MigrationError> {
        let source = paths::resolve(&request.source_site, &request.source_path)?;
        let container = source
            .container_server_relative()
            .ok_or_else(|| PathError::InvalidSiteUrl(request.source_site.clone()))?;
        let client = connector.client(&request.source_site).await?;
        let list = connector
            .throttler()
            .run("get list", || client.get_list_by_path(&container))
            .await?;
        Ok(Self {
            connector: connector.clone(),
            web_url: request.source_site.trim_end_matches(paths::SEPARATOR).to_string(),
            list,
            page_size,
        })
    }

    fn file_record(&self, item: ListItem) -> FileRecord {
        let subfolder = item
            .dir
            .strip_prefix(self.list.server_relative_url.as_str())
            .unwrap_or_default()
            .trim_matches(paths::SEPARATOR)
            .to_string();
        FileRecord {
            site_url: self.web_url.clone(),
            web_url: self.web_url.clone(),
            server_relative_path: item.server_relative_url,
            container: ContainerRef {
                title: self.list.title.clone(),
                server_relative_url: self.list.server_relative_url.clone(),
            },
            subfolder,
            author: item.editor.unwrap_or_default(),
            last_modified: item
                .modified
                .as_deref()
                .and_then(|value| OffsetDateTime::parse(value, &Rfc3339).ok()),
            size_bytes: item.size.unwrap_or(0),
            drive_id: item.drive_id,
            item_id: item.item_id,
        }
    }
}

#[async_trait]
impl ListLoader for RemoteListLoader {
    type Cursor = String;
    type Error = MigrationError;

    async fn get_page(
        &self,
        cursor: Option<String>,
        _start_path: &str,
    ) -> Result<CrawlPage<String>, MigrationError> {
        let client = self.connector.client(&self.web_url).await?;
        let page = self
            .connector
            .throttler()
            .run("list items", || {
                client.list_items_page(&self.list.id, self.page_size, cursor.as_deref())
            })
            .await?;

        let mut files = Vec::new();
        let mut folders = Vec::new();
        for item in page.items {
            if item.is_folder {
                folders.push(item.server_relative_url);
            } else {
                files.push(self.file_record(item));
            }
        }
        Ok(CrawlPage {
            container_title: self.list.title.clone(),
            files,
            folders,
            next_page_token: page.next_cursor,
        })
    }
}

/// Copies one file by download to spool, then upload to the destination.
pub struct RemoteFileListProcessor {
    connector: SiteConnector,
    transfer: TransferClient,
    spool_dir: PathBuf,
    lists: ListCache,
    folders: FolderCache,
}

impl RemoteFileListProcessor {
    pub fn new(connector: SiteConnector, transfer: TransferClient, spool_dir: PathBuf) -> Self {
        Self {
            connector,
            transfer,
            spool_dir,
            lists: ListCache::new(),
            folders: FolderCache::new(),
        }
    }

    async fn copy_one(
        &self,
        file: &FileRecord,
        request: &CopyRequest,
    ) -> Result<CopiedFile, MigrationError> {
        let throttler = self.connector.throttler();
        let transfer = &self.transfer;
        let source = self.connector.client(&file.web_url).await?;
        let spool = SpoolFile::new(&self.spool_dir);

        let bytes = throttler
            .run("download file", || {
                transfer.download_to_path(&source, &file.server_relative_path, spool.path())
            })
            .await?;

        let dest = paths::destination_for(file, request)?;
        let target = self.connector.client(&dest.web_url).await?;
        let list = self
            .lists
            .get_or_load(&target, throttler, &dest.container_url)
            .await?;
        self.folders
            .ensure_chain(&target, throttler, &list.server_relative_url, &dest.folder_path)
            .await?;

        let target = &target;
        let spool = &spool;
        let written = conflict::upload_with_policy(&dest, request.conflict_policy, |path, overwrite| async move {
            throttler
                .run("upload file", || {
                    transfer.upload_from_path(target, &path, spool.path(), overwrite)
                })
                .await
                .map_err(MigrationError::from)
        })
        .await?;

        if request.delete_after_copy {
            debug!(source = %file, "deleteAfterCopy is accepted but not applied");
        }
        info!(source = %file, destination = %written, bytes, "file copied");
        Ok(CopiedFile {
            source: file.full_url(),
            destination: paths::full_url(&dest.web_url, &written),
        })
    }
}

#[async_trait]
impl FileListProcessor for RemoteFileListProcessor {
    async fn init(&mut self) -> Result<(), MigrationError> {
        tokio::fs::create_dir_all(&self.spool_dir).await?;
        self.lists.clear().await;
        self.folders.clear().await;
        self.connector.warm_up().await
    }

    async fn process_file(
        &self,
        file: &FileRecord,
        request: &CopyRequest,
    ) -> Result<CopiedFile, MigrationError> {
        let result = self.copy_one(file, request).await;
        if let Err(err) = &result {
            self.connector.observe(err).await;
        }
        result
    }
}

/// Runs a provider-side copy job per bulk batch and waits for it to finish.
pub struct BulkCopier {
    connector: SiteConnector,
    lists: ListCache,
    folders: FolderCache,
    poll: Backoff,
    max_polls: u32,
}

impl BulkCopier {
    pub fn new(connector: SiteConnector, poll_interval: Duration, max_polls: u32) -> Self {
        Self {
            connector,
            lists: ListCache::new(),
            folders: FolderCache::new(),
            poll: Backoff::polling(poll_interval),
            max_polls: max_polls.max(1),
        }
    }

    pub fn with_poll_backoff(mut self, poll: Backoff) -> Self {
        self.poll = poll;
        self
    }

    pub async fn copy(&self, batch: &BulkCopyBatch) -> Result<(), MigrationError> {
        let request = &batch.request;
        let throttler = self.connector.throttler();
        let folder = paths::bulk_destination_folder(request, &batch.subfolder)?;
        let container = paths::resolve(&request.dest_site, &request.dest_path)?
            .container_server_relative()
            .ok_or_else(|| PathError::InvalidSiteUrl(request.dest_site.clone()))?;

        let client = self.connector.client(&request.dest_site).await?;
        let list = self.lists.get_or_load(&client, throttler, &container).await?;
        self.folders
            .ensure_chain(&client, throttler, &list.server_relative_url, &folder)
            .await?;

        let destination = paths::full_url(&request.dest_site, &folder);
        let options = job_options(request);
        if request.delete_after_copy {
            debug!(destination = %destination, "deleteAfterCopy is accepted but not applied");
        }
        let job = throttler
            .run("create copy job", || {
                client.create_copy_job(&batch.source_urls, &destination, &options)
            })
            .await?;
        info!(
            job_id = %job.id,
            files = batch.source_urls.len(),
            destination = %destination,
            "bulk copy job started"
        );

        for attempt in 0..self.max_polls {
            tokio::time::sleep(self.poll.delay(attempt)).await;
            let client = self.connector.client(&request.dest_site).await?;
            let status = throttler
                .run("copy job status", || client.get_copy_job_status(&job.id))
                .await?;
            match status.state {
                CopyJobState::Succeeded => {
                    info!(job_id = %job.id, "bulk copy job finished");
                    return Ok(());
                }
                CopyJobState::Failed => {
                    return Err(MigrationError::BulkJob {
                        job_id: job.id,
                        reason: status.error.unwrap_or_else(|| "no reason given".into()),
                    });
                }
                CopyJobState::Queued | CopyJobState::Processing => {}
            }
        }

        Err(MigrationError::BulkJob {
            job_id: job.id,
            reason: format!("still running after {} status checks", self.max_polls),
        })
    }
}

fn job_options(request: &CopyRequest) -> CopyJobOptions {
    CopyJobOptions {
        name_conflict: match request.conflict_policy {
            ConflictPolicy::Fail => NameConflictBehavior::Fail,
            ConflictPolicy::Rename => NameConflictBehavior::KeepBoth,
            ConflictPolicy::Replace => NameConflictBehavior::Replace,
        },
        is_move: false,
        exclude_children: true,
        ignore_version_history: true,
    }
}

/// Queues per-file batches and runs bulk batches inline.
///
/// Batches are keyed by their position in the plan, so replanning a job after
/// a redelivered start skips whatever the earlier attempt already handed over.
/// A failed bulk job fails the migration but does not stop planning.
pub struct QueueBatchSink {
    store: StateStore,
    bulk: Arc<BulkCopier>,
    job_id: Uuid,
    next_copy: AtomicUsize,
    next_bulk: AtomicUsize,
    queued: AtomicUsize,
    skipped: AtomicUsize,
    bulk_failures: AtomicUsize,
}

impl QueueBatchSink {
    pub fn new(store: StateStore, bulk: Arc<BulkCopier>, job_id: Uuid) -> Self {
        Self {
            store,
            bulk,
            job_id,
            next_copy: AtomicUsize::new(0),
            next_bulk: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            bulk_failures: AtomicUsize::new(0),
        }
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Batches left alone because an earlier planning attempt handled them.
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    pub fn bulk_failures(&self) -> usize {
        self.bulk_failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchSink for QueueBatchSink {
    async fn receive_batch(&self, batch: CopyBatch) -> Result<(), MigrationError> {
        let key = format!("copy:{}", self.next_copy.fetch_add(1, Ordering::SeqCst));
        let files = batch.items.len();
        let body = QueueMessage::CopyBatch(batch).to_json()?;
        if self.store.enqueue_batch(self.job_id, &key, &body).await? {
            self.queued.fetch_add(1, Ordering::SeqCst);
            debug!(job = %self.job_id, batch = %key, files, "copy batch queued");
        } else {
            self.skipped.fetch_add(1, Ordering::SeqCst);
            debug!(job = %self.job_id, batch = %key, "copy batch already queued");
        }
        Ok(())
    }

    async fn receive_bulk_batch(&self, batch: BulkCopyBatch) -> Result<(), MigrationError> {
        let key = format!("bulk:{}", self.next_bulk.fetch_add(1, Ordering::SeqCst));
        if self.store.batch_recorded(self.job_id, &key).await? {
            self.skipped.fetch_add(1, Ordering::SeqCst);
            debug!(job = %self.job_id, batch = %key, "bulk batch already copied");
            return Ok(());
        }

        if let Err(err) = self.bulk.copy(&batch).await {
            self.bulk_failures.fetch_add(1, Ordering::SeqCst);
            error!(
                job = %self.job_id,
                subfolder = %batch.subfolder,
                files = batch.source_urls.len(),
                error = %err,
                "bulk copy failed"
            );
            self.store.mark_failed(self.job_id, &err.to_string()).await?;
        }
        self.store.record_batch(self.job_id, &key).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "remote_tests.rs"]
mod tests;
