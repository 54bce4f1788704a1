use std::time::Duration;

use sqlx::Row;

use super::{StateStore, StoreError, now_unix_ms};

/// A leased message. It stays invisible to other receivers until the lease
/// runs out or it is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: i64,
    pub body: String,
    pub delivery_count: i64,
}

impl StateStore {
    pub async fn send_message(&self, body: &str) -> Result<i64, StoreError> {
        let now = now_unix_ms();
        let result = sqlx::query(
            "INSERT INTO queue_messages (body, enqueued_at, visible_at) VALUES (?1, ?2, ?2)",
        )
        .bind(body)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Leases the oldest visible message for `visibility`.
    pub async fn receive_message(
        &self,
        visibility: Duration,
    ) -> Result<Option<QueuedMessage>, StoreError> {
        let now = now_unix_ms();
        let lease_until = now.saturating_add(visibility.as_millis() as i64);
        let row = sqlx::query(
            "UPDATE queue_messages
             SET visible_at = ?1, delivery_count = delivery_count + 1
             WHERE id = (
                 SELECT id FROM queue_messages
                 WHERE visible_at <= ?2
                 ORDER BY id ASC
                 LIMIT 1
             )
             RETURNING id, body, delivery_count",
        )
        .bind(lease_until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(QueuedMessage {
            id: row.try_get("id")?,
            body: row.try_get("body")?,
            delivery_count: row.try_get("delivery_count")?,
        }))
    }

    pub async fn ack_message(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM queue_messages WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Pushes the lease on a message out to `visibility` from now. Returns
    /// `false` when the message no longer exists.
    pub async fn extend_lease(&self, id: i64, visibility: Duration) -> Result<bool, StoreError> {
        let lease_until = now_unix_ms().saturating_add(visibility.as_millis() as i64);
        let result = sqlx::query("UPDATE queue_messages SET visible_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(lease_until)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Makes a leased message visible again right away.
    pub async fn release_message(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE queue_messages SET visible_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(now_unix_ms())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn queue_depth(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS depth FROM queue_messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("depth")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_store() -> StateStore {
        StateStore::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn messages_are_received_in_order() {
        let store = make_store().await;
        store.send_message("first").await.unwrap();
        store.send_message("second").await.unwrap();

        let lease = Duration::from_secs(60);
        let a = store.receive_message(lease).await.unwrap().unwrap();
        let b = store.receive_message(lease).await.unwrap().unwrap();
        assert_eq!(a.body, "first");
        assert_eq!(b.body, "second");
        assert_eq!(a.delivery_count, 1);
        assert!(store.receive_message(lease).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn acked_message_is_gone() {
        let store = make_store().await;
        store.send_message("only").await.unwrap();
        let msg = store
            .receive_message(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        store.ack_message(msg.id).await.unwrap();

        assert_eq!(store.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let store = make_store().await;
        store.send_message("retry me").await.unwrap();

        let first = store
            .receive_message(Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let second = store
            .receive_message(Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.delivery_count, 2);
    }

    #[tokio::test]
    async fn extended_lease_keeps_message_hidden() {
        let store = make_store().await;
        store.send_message("long job").await.unwrap();
        let msg = store
            .receive_message(Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        assert!(store.extend_lease(msg.id, Duration::from_secs(60)).await.unwrap());
        assert!(store.receive_message(Duration::from_secs(60)).await.unwrap().is_none());

        store.ack_message(msg.id).await.unwrap();
        assert!(!store.extend_lease(msg.id, Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn released_message_is_visible_again() {
        let store = make_store().await;
        store.send_message("again").await.unwrap();
        let lease = Duration::from_secs(60);
        let msg = store.receive_message(lease).await.unwrap().unwrap();
        assert!(store.receive_message(lease).await.unwrap().is_none());

        store.release_message(msg.id).await.unwrap();
        assert!(store.receive_message(lease).await.unwrap().is_some());
    }
}
