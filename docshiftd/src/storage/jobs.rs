use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{StateStore, StoreError, now_unix, now_unix_ms};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Running,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub id: Uuid,
    pub created_at: i64,
    pub error: Option<String>,
    pub finished_at: Option<i64>,
    pub planned: bool,
    pub outstanding_batches: i64,
    pub abandoned_files: i64,
}

impl JobStatus {
    /// An error wins over completion.
    pub fn state(&self) -> JobState {
        match (&self.error, self.finished_at) {
            (Some(error), _) => JobState::Failed(error.clone()),
            (None, Some(_)) => JobState::Succeeded,
            (None, None) => JobState::Running,
        }
    }

    pub fn finished_at_utc(&self) -> Option<OffsetDateTime> {
        self.finished_at
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
    }
}

impl StateStore {
    pub async fn create_job(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO migration_jobs (id, created_at) VALUES (?1, ?2)")
            .bind(id.to_string())
            .bind(now_unix())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<JobStatus>, StoreError> {
        let row = sqlx::query(
            "SELECT id, created_at, error, finished_at, planned, outstanding_batches, abandoned_files
             FROM migration_jobs WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| job_from_row(&row)).transpose()
    }

    /// Records the first error for a job. Later errors and finished jobs are
    /// left untouched; returns whether the error was stored.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE migration_jobs SET error = ?2
             WHERE id = ?1 AND error IS NULL AND finished_at IS NULL",
        )
        .bind(id.to_string())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Crawl and planning are done. Batches are counted as they are queued.
    pub async fn mark_planned(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE migration_jobs SET planned = 1 WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        self.try_finish(id).await
    }

    /// Queues a per-file batch and counts it as outstanding, once per
    /// `batch_key`. Returns `false` when the key was already queued for the job.
    pub async fn enqueue_batch(
        &self,
        id: Uuid,
        batch_key: &str,
        body: &str,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let recorded = sqlx::query(
            "INSERT OR IGNORE INTO job_batches (job_id, batch_key, recorded_at) VALUES (?1, ?2, ?3)",
        )
        .bind(id.to_string())
        .bind(batch_key)
        .bind(now_unix())
        .execute(&mut *tx)
        .await?;
        if recorded.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let now = now_unix_ms();
        sqlx::query(
            "INSERT INTO queue_messages (body, enqueued_at, visible_at) VALUES (?1, ?2, ?2)",
        )
        .bind(body)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE migration_jobs SET outstanding_batches = outstanding_batches + 1 WHERE id = ?1",
        )
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn batch_recorded(&self, id: Uuid, batch_key: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM job_batches WHERE job_id = ?1 AND batch_key = ?2")
            .bind(id.to_string())
            .bind(batch_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Remembers a batch that ran inline, so a replanned job skips it.
    pub async fn record_batch(&self, id: Uuid, batch_key: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO job_batches (job_id, batch_key, recorded_at) VALUES (?1, ?2, ?3)",
        )
        .bind(id.to_string())
        .bind(batch_key)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// One queued batch has been executed; `abandoned` files in it gave up.
    pub async fn complete_batch(&self, id: Uuid, abandoned: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE migration_jobs
             SET outstanding_batches = outstanding_batches - 1,
                 abandoned_files = abandoned_files + ?2
             WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(abandoned)
        .execute(&self.pool)
        .await?;
        if abandoned > 0 {
            self.mark_failed(id, &format!("{abandoned} file(s) could not be copied"))
                .await?;
        }
        self.try_finish(id).await
    }

    async fn try_finish(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE migration_jobs SET finished_at = ?2
             WHERE id = ?1 AND planned = 1 AND outstanding_batches <= 0
               AND finished_at IS NULL AND error IS NULL",
        )
        .bind(id.to_string())
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn job_from_row(row: &SqliteRow) -> Result<JobStatus, StoreError> {
    let id: String = row.try_get("id")?;
    Ok(JobStatus {
        id: Uuid::parse_str(&id).map_err(|_| StoreError::InvalidJobId(id.clone()))?,
        created_at: row.try_get("created_at")?,
        error: row.try_get("error")?,
        finished_at: row.try_get("finished_at")?,
        planned: row.try_get::<i64, _>("planned")? != 0,
        outstanding_batches: row.try_get("outstanding_batches")?,
        abandoned_files: row.try_get("abandoned_files")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_store() -> StateStore {
        StateStore::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn new_job_is_running() {
        let store = make_store().await;
        let id = Uuid::new_v4();
        store.create_job(id).await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state(), JobState::Running);
        assert!(!job.planned);
    }

    #[tokio::test]
    async fn unknown_job_is_none() {
        let store = make_store().await;
        assert!(store.get_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn planned_without_batches_finishes_immediately() {
        let store = make_store().await;
        let id = Uuid::new_v4();
        store.create_job(id).await.unwrap();
        store.mark_planned(id).await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state(), JobState::Succeeded);
        assert!(job.finished_at_utc().is_some());
    }

    #[tokio::test]
    async fn finishes_after_last_batch() {
        let store = make_store().await;
        let id = Uuid::new_v4();
        store.create_job(id).await.unwrap();
        assert!(store.enqueue_batch(id, "copy:0", "a").await.unwrap());
        assert!(store.enqueue_batch(id, "copy:1", "b").await.unwrap());
        store.mark_planned(id).await.unwrap();

        store.complete_batch(id, 0).await.unwrap();
        assert_eq!(
            store.get_job(id).await.unwrap().unwrap().state(),
            JobState::Running
        );

        store.complete_batch(id, 0).await.unwrap();
        assert_eq!(
            store.get_job(id).await.unwrap().unwrap().state(),
            JobState::Succeeded
        );
    }

    #[tokio::test]
    async fn batch_finishing_before_planning_is_counted() {
        let store = make_store().await;
        let id = Uuid::new_v4();
        store.create_job(id).await.unwrap();
        store.enqueue_batch(id, "copy:0", "a").await.unwrap();

        store.complete_batch(id, 0).await.unwrap();
        assert_eq!(
            store.get_job(id).await.unwrap().unwrap().state(),
            JobState::Running
        );
        store.mark_planned(id).await.unwrap();
        assert_eq!(
            store.get_job(id).await.unwrap().unwrap().state(),
            JobState::Succeeded
        );
    }

    #[tokio::test]
    async fn abandoned_files_fail_the_job() {
        let store = make_store().await;
        let id = Uuid::new_v4();
        store.create_job(id).await.unwrap();
        store.enqueue_batch(id, "copy:0", "a").await.unwrap();
        store.mark_planned(id).await.unwrap();
        store.complete_batch(id, 2).await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(
            job.state(),
            JobState::Failed("2 file(s) could not be copied".into())
        );
        assert_eq!(job.abandoned_files, 2);
    }

    #[tokio::test]
    async fn batch_key_is_queued_once() {
        let store = make_store().await;
        let id = Uuid::new_v4();
        store.create_job(id).await.unwrap();

        assert!(store.enqueue_batch(id, "copy:0", "a").await.unwrap());
        assert!(!store.enqueue_batch(id, "copy:0", "a").await.unwrap());

        assert_eq!(store.queue_depth().await.unwrap(), 1);
        assert_eq!(store.get_job(id).await.unwrap().unwrap().outstanding_batches, 1);
    }

    #[tokio::test]
    async fn batch_keys_are_per_job() {
        let store = make_store().await;
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        store.create_job(a).await.unwrap();
        store.create_job(b).await.unwrap();

        store.record_batch(a, "bulk:0").await.unwrap();
        assert!(store.batch_recorded(a, "bulk:0").await.unwrap());
        assert!(!store.batch_recorded(b, "bulk:0").await.unwrap());
        assert!(store.enqueue_batch(b, "copy:0", "x").await.unwrap());
    }

    #[tokio::test]
    async fn first_error_wins() {
        let store = make_store().await;
        let id = Uuid::new_v4();
        store.create_job(id).await.unwrap();

        assert!(store.mark_failed(id, "crawl failed").await.unwrap());
        assert!(!store.mark_failed(id, "second").await.unwrap());
        assert_eq!(
            store.get_job(id).await.unwrap().unwrap().state(),
            JobState::Failed("crawl failed".into())
        );
    }
}
