//! Queue consumer: plans started jobs and executes queued copy batches.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::migrate::model::{AsyncStartCopy, CopyBatch, QueueMessage};
use crate::migrate::transfer::TransferClient;
use crate::migrate::{MigrationEngine, MigrationError, StartCopySummary};
use crate::remote::{
    BulkCopier, QueueBatchSink, RemoteFileListProcessor, RemoteListLoader, SiteConnector,
    verify_scope,
};
use crate::storage::{QueuedMessage, StateStore, StoreError};

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub tenant_url: String,
    pub spool_dir: PathBuf,
    pub page_size: u32,
    /// Lease taken on a received message. It is renewed while the message is
    /// being handled.
    pub visibility: Duration,
    /// Deliveries beyond this count are dead-lettered.
    pub max_deliveries: i64,
    pub poll_interval: Duration,
}

#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    store: StateStore,
    connector: SiteConnector,
    engine: MigrationEngine,
    transfer: TransferClient,
    bulk: Arc<BulkCopier>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        store: StateStore,
        connector: SiteConnector,
        engine: MigrationEngine,
        transfer: TransferClient,
        bulk: Arc<BulkCopier>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                store,
                connector,
                engine,
                transfer,
                bulk,
                settings,
            }),
        }
    }

    pub async fn run(self) {
        let poll_interval = self.inner.settings.poll_interval;
        loop {
            match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => error!(error = %err, "worker iteration failed"),
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Handles at most one message. Returns `Ok(false)` when the queue was empty.
    ///
    /// A store error leaves the message leased, so it is delivered again once
    /// the lease runs out.
    pub async fn run_once(&self) -> Result<bool, StoreError> {
        let inner = &self.inner;
        let Some(message) = inner
            .store
            .receive_message(inner.settings.visibility)
            .await?
        else {
            return Ok(false);
        };

        let heartbeat =
            LeaseHeartbeat::start(inner.store.clone(), message.id, inner.settings.visibility);
        if message.delivery_count > inner.settings.max_deliveries {
            self.dead_letter(&message).await?;
        } else {
            match QueueMessage::parse(&message.body) {
                Some(QueueMessage::StartCopy(start)) => self.handle_start(start).await?,
                Some(QueueMessage::CopyBatch(batch)) => self.handle_batch(batch).await?,
                None => error!(message_id = message.id, "dropping unreadable queue message"),
            }
        }

        drop(heartbeat);
        inner.store.ack_message(message.id).await?;
        Ok(true)
    }

    async fn dead_letter(&self, message: &QueuedMessage) -> Result<(), StoreError> {
        let job = match QueueMessage::parse(&message.body) {
            Some(QueueMessage::StartCopy(start)) => Some(start.request_id),
            Some(QueueMessage::CopyBatch(batch)) => batch.request_id,
            None => None,
        };
        error!(
            message_id = message.id,
            deliveries = message.delivery_count,
            job = ?job,
            "giving up on queue message"
        );
        if let Some(job) = job {
            self.inner
                .store
                .mark_failed(
                    job,
                    &format!(
                        "queue message was not processed after {} deliveries",
                        message.delivery_count
                    ),
                )
                .await?;
        }
        Ok(())
    }

    async fn handle_start(&self, start: AsyncStartCopy) -> Result<(), StoreError> {
        let inner = &self.inner;
        let job_id = start.request_id;
        match inner.store.get_job(job_id).await? {
            None => {
                warn!(job = %job_id, "start message for unknown job");
                return Ok(());
            }
            Some(job) if job.planned || job.error.is_some() => {
                info!(job = %job_id, "job already planned; skipping redelivered start");
                return Ok(());
            }
            Some(_) => {}
        }

        match self.plan(&start).await {
            Ok(summary) => {
                info!(
                    job = %job_id,
                    files = summary.files_found,
                    folders = summary.folders_found,
                    ignored = summary.ignored,
                    copy_batches = summary.plan.copy_batches,
                    bulk_batches = summary.plan.bulk_batches,
                    "copy planned"
                );
                inner.store.mark_planned(job_id).await
            }
            Err(MigrationError::Store(err)) => Err(err),
            Err(err) => {
                error!(job = %job_id, error = %err, "copy could not be started");
                inner.store.mark_failed(job_id, &err.to_string()).await?;
                Ok(())
            }
        }
    }

    async fn plan(&self, start: &AsyncStartCopy) -> Result<StartCopySummary, MigrationError> {
        let inner = &self.inner;
        let request = &start.start;
        verify_scope(&inner.connector, &inner.settings.tenant_url, request).await?;
        let loader =
            RemoteListLoader::open(&inner.connector, request, inner.settings.page_size).await?;
        let sink = QueueBatchSink::new(
            inner.store.clone(),
            Arc::clone(&inner.bulk),
            start.request_id,
        );
        inner
            .engine
            .start_copy(request, Some(start.request_id), &loader, &sink)
            .await
    }

    async fn handle_batch(&self, batch: CopyBatch) -> Result<(), StoreError> {
        let inner = &self.inner;
        let mut processor = RemoteFileListProcessor::new(
            inner.connector.clone(),
            inner.transfer.clone(),
            inner.settings.spool_dir.clone(),
        );

        let abandoned = match inner.engine.complete_copy(&batch, &mut processor).await {
            Ok(outcome) => outcome.abandoned.len(),
            Err(err) => {
                error!(job = ?batch.request_id, files = batch.items.len(), error = %err, "copy batch failed");
                if let Some(job_id) = batch.request_id {
                    inner.store.mark_failed(job_id, &err.to_string()).await?;
                }
                batch.items.len()
            }
        };

        match batch.request_id {
            Some(job_id) => inner.store.complete_batch(job_id, abandoned as i64).await,
            None => Ok(()),
        }
    }
}

/// Renews the lease on a message until dropped.
struct LeaseHeartbeat(JoinHandle<()>);

impl LeaseHeartbeat {
    fn start(store: StateStore, message_id: i64, visibility: Duration) -> Self {
        let period = (visibility / 3).max(MIN_HEARTBEAT);
        Self(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.extend_lease(message_id, visibility).await {
                    Ok(true) => debug!(message_id, "lease extended"),
                    Ok(false) => {
                        warn!(message_id, "leased message is gone; stopping lease renewal");
                        break;
                    }
                    Err(err) => warn!(message_id, error = %err, "failed to extend lease"),
                }
            }
        }))
    }
}

impl Drop for LeaseHeartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
