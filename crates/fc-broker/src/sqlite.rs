//! Embedded SQLite FIFO broker.
//!
//! A real broker for single-node and development deployments, mimicking SQS
//! FIFO semantics: per-group ordering, visibility timeouts, and dedup-id
//! idempotent publishing. Rows are claimed with a conditional UPDATE on
//! `inflight_owner`, so when two consumers compete for the same group
//! exactly one wins.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use fc_core::{MessagePointer, ReceivedPointer};

use crate::{BrokerError, QueueAdapter, QueueDepth, QueuePublisher, Result};

pub struct SqliteBroker {
    pool: Pool<Sqlite>,
    queue_name: String,
    visibility_timeout_seconds: u32,
    running: AtomicBool,
    total_polled: AtomicU64,
    total_acked: AtomicU64,
    total_nacked: AtomicU64,
}

impl SqliteBroker {
    pub fn new(pool: Pool<Sqlite>, queue_name: String, visibility_timeout_seconds: u32) -> Self {
        Self {
            pool,
            queue_name,
            visibility_timeout_seconds,
            running: AtomicBool::new(true),
            total_polled: AtomicU64::new(0),
            total_acked: AtomicU64::new(0),
            total_nacked: AtomicU64::new(0),
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                id TEXT PRIMARY KEY,
                queue_name TEXT NOT NULL,
                group_id TEXT,
                dedup_id TEXT NOT NULL,
                body TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                inflight_owner TEXT,
                receive_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                UNIQUE(queue_name, dedup_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_visible
            ON queue_messages (queue_name, visible_at, group_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_owner
            ON queue_messages (queue_name, inflight_owner)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.queue_name, "embedded queue schema initialized");
        Ok(())
    }

    /// Clear claims whose visibility window has lapsed so the rows become
    /// eligible again.
    async fn reclaim_expired(&self, now: i64) -> Result<u64> {
        let reclaimed = sqlx::query(
            r#"
            UPDATE queue_messages
            SET inflight_owner = NULL
            WHERE queue_name = ? AND inflight_owner IS NOT NULL AND visible_at <= ?
            "#,
        )
        .bind(&self.queue_name)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if reclaimed > 0 {
            debug!(queue = %self.queue_name, reclaimed, "reclaimed expired claims");
        }
        Ok(reclaimed)
    }
}

#[async_trait]
impl QueueAdapter for SqliteBroker {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn receive_batch(
        &self,
        max_messages: u32,
        _wait: Duration,
    ) -> Result<Vec<ReceivedPointer>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::Stopped);
        }

        let now = Utc::now().timestamp();
        let claim_until = now + self.visibility_timeout_seconds as i64;

        self.reclaim_expired(now).await?;

        // First unclaimed row per group, excluding groups that still have a
        // row in flight (FIFO: a claimed head blocks the rest of its group).
        let rows = sqlx::query(
            r#"
            WITH eligible AS (
                SELECT id,
                       ROW_NUMBER() OVER (
                           PARTITION BY COALESCE(group_id, id)
                           ORDER BY created_at, id
                       ) AS rn
                FROM queue_messages
                WHERE queue_name = ?1 AND visible_at <= ?2 AND inflight_owner IS NULL
                  AND COALESCE(group_id, id) NOT IN (
                      SELECT COALESCE(group_id, id) FROM queue_messages
                      WHERE queue_name = ?1 AND inflight_owner IS NOT NULL
                  )
            )
            SELECT id FROM eligible WHERE rn = 1 LIMIT ?3
            "#,
        )
        .bind(&self.queue_name)
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut received = Vec::with_capacity(rows.len());

        for row in rows {
            let id: String = row.get("id");
            let receipt_handle = uuid::Uuid::new_v4().to_string();

            // Conditional claim: only one competing consumer can win the row.
            let claimed = sqlx::query(
                r#"
                UPDATE queue_messages
                SET inflight_owner = ?, visible_at = ?, receive_count = receive_count + 1
                WHERE id = ? AND queue_name = ? AND inflight_owner IS NULL AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(claim_until)
            .bind(&id)
            .bind(&self.queue_name)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 0 {
                continue;
            }

            let claimed_row = sqlx::query(
                "SELECT body, receive_count FROM queue_messages WHERE id = ? AND queue_name = ?",
            )
            .bind(&id)
            .bind(&self.queue_name)
            .fetch_optional(&self.pool)
            .await?;

            let Some(claimed_row) = claimed_row else {
                continue;
            };

            let body: String = claimed_row.get("body");
            let receive_count: i64 = claimed_row.get("receive_count");
            let pointer: MessagePointer = serde_json::from_str(&body)?;

            received.push(ReceivedPointer {
                pointer,
                receipt_handle,
                broker_message_id: Some(id),
                queue_id: self.queue_name.clone(),
                receive_count: receive_count as u32,
            });
        }

        if !received.is_empty() {
            self.total_polled
                .fetch_add(received.len() as u64, Ordering::Relaxed);
            debug!(queue = %self.queue_name, count = received.len(), "claimed messages");
        }

        Ok(received)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let deleted = sqlx::query(
            "DELETE FROM queue_messages WHERE inflight_owner = ? AND queue_name = ?",
        )
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if deleted == 0 {
            // Handle expired or already acked; idempotent by contract.
            debug!(
                receipt_handle = %receipt_handle,
                queue = %self.queue_name,
                "ack for unknown handle ignored"
            );
            return Ok(());
        }

        self.total_acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: u32) -> Result<()> {
        let visible_at = Utc::now().timestamp() + delay_seconds as i64;

        let updated = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = ?, inflight_owner = NULL
            WHERE inflight_owner = ? AND queue_name = ?
            "#,
        )
        .bind(visible_at)
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            warn!(
                receipt_handle = %receipt_handle,
                queue = %self.queue_name,
                "nack for unknown handle ignored"
            );
            return Ok(());
        }

        self.total_nacked.fetch_add(1, Ordering::Relaxed);
        debug!(
            receipt_handle = %receipt_handle,
            queue = %self.queue_name,
            delay_seconds,
            "message returned to queue"
        );
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        let visible_at = Utc::now().timestamp() + seconds as i64;

        sqlx::query(
            "UPDATE queue_messages SET visible_at = ? WHERE inflight_owner = ? AND queue_name = ?",
        )
        .bind(visible_at)
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "embedded queue consumer stopped");
    }

    async fn depth(&self) -> Result<Option<QueueDepth>> {
        let now = Utc::now().timestamp();

        let pending: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM queue_messages WHERE queue_name = ? AND visible_at <= ? AND inflight_owner IS NULL",
        )
        .bind(&self.queue_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?
        .get("n");

        let in_flight: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM queue_messages WHERE queue_name = ? AND inflight_owner IS NOT NULL",
        )
        .bind(&self.queue_name)
        .fetch_one(&self.pool)
        .await?
        .get("n");

        Ok(Some(QueueDepth {
            queue_id: self.queue_name.clone(),
            pending: pending as u64,
            in_flight: in_flight as u64,
        }))
    }
}

#[async_trait]
impl QueuePublisher for SqliteBroker {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn publish(&self, pointer: MessagePointer) -> Result<String> {
        let now = Utc::now().timestamp();
        let body = serde_json::to_string(&pointer)?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO queue_messages
                (id, queue_name, group_id, dedup_id, body, visible_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&pointer.id)
        .bind(&self.queue_name)
        .bind(&pointer.message_group_id)
        .bind(&pointer.id)
        .bind(&body)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            debug!(
                pointer_id = %pointer.id,
                queue = %self.queue_name,
                "duplicate dedup id, publish skipped"
            );
        }

        Ok(pointer.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_core::{DispatchMode, MediationType};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn broker() -> SqliteBroker {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let broker = SqliteBroker::new(pool, "orders.fifo".to_string(), 30);
        broker.init_schema().await.unwrap();
        broker
    }

    fn pointer(id: &str, group: Option<&str>) -> MessagePointer {
        MessagePointer {
            id: id.to_string(),
            pool_code: "ORDERS".to_string(),
            auth_token: None,
            mediation_type: MediationType::HTTP,
            mediation_target: "http://localhost:9099/hook".to_string(),
            message_group_id: group.map(|s| s.to_string()),
            dispatch_mode: DispatchMode::BlockOnError,
        }
    }

    #[tokio::test]
    async fn publish_poll_ack_round_trip() {
        let broker = broker().await;
        broker.publish(pointer("p1", None)).await.unwrap();

        let batch = broker
            .receive_batch(10, Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].pointer.id, "p1");
        assert_eq!(batch[0].receive_count, 1);

        broker.ack(&batch[0].receipt_handle).await.unwrap();

        let batch = broker
            .receive_batch(10, Duration::from_secs(0))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn ack_is_idempotent() {
        let broker = broker().await;
        broker.publish(pointer("p1", None)).await.unwrap();

        let batch = broker
            .receive_batch(10, Duration::from_secs(0))
            .await
            .unwrap();
        broker.ack(&batch[0].receipt_handle).await.unwrap();
        // Second ack of the same handle is a no-op, not an error.
        broker.ack(&batch[0].receipt_handle).await.unwrap();
    }

    #[tokio::test]
    async fn nack_zero_makes_message_reappear() {
        let broker = broker().await;
        broker.publish(pointer("p1", None)).await.unwrap();

        let batch = broker
            .receive_batch(10, Duration::from_secs(0))
            .await
            .unwrap();
        broker.nack(&batch[0].receipt_handle, 0).await.unwrap();

        let batch = broker
            .receive_batch(10, Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].pointer.id, "p1");
        assert_eq!(batch[0].receive_count, 2);
    }

    #[tokio::test]
    async fn nack_with_delay_hides_message() {
        let broker = broker().await;
        broker.publish(pointer("p1", None)).await.unwrap();

        let batch = broker
            .receive_batch(10, Duration::from_secs(0))
            .await
            .unwrap();
        broker.nack(&batch[0].receipt_handle, 60).await.unwrap();

        let batch = broker
            .receive_batch(10, Duration::from_secs(0))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn in_flight_head_blocks_rest_of_group() {
        let broker = broker().await;
        broker.publish(pointer("p1", Some("g"))).await.unwrap();
        broker.publish(pointer("p2", Some("g"))).await.unwrap();

        let first = broker
            .receive_batch(10, Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].pointer.id, "p1");

        // p1 is in flight, so p2 must not be visible yet.
        let while_in_flight = broker
            .receive_batch(10, Duration::from_secs(0))
            .await
            .unwrap();
        assert!(while_in_flight.is_empty());

        broker.ack(&first[0].receipt_handle).await.unwrap();

        let second = broker
            .receive_batch(10, Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].pointer.id, "p2");
    }

    #[tokio::test]
    async fn duplicate_dedup_id_collapses() {
        let broker = broker().await;
        broker.publish(pointer("p1", None)).await.unwrap();
        broker.publish(pointer("p1", None)).await.unwrap();

        let batch = broker
            .receive_batch(10, Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn competing_consumers_one_wins_per_group() {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let a = SqliteBroker::new(pool.clone(), "orders.fifo".to_string(), 30);
        a.init_schema().await.unwrap();
        let b = SqliteBroker::new(pool, "orders.fifo".to_string(), 30);

        a.publish(pointer("p1", Some("g"))).await.unwrap();

        let (ra, rb) = tokio::join!(
            a.receive_batch(10, Duration::from_secs(0)),
            b.receive_batch(10, Duration::from_secs(0)),
        );

        let claimed = ra.unwrap().len() + rb.unwrap().len();
        assert_eq!(claimed, 1, "exactly one consumer must claim the group head");
    }

    #[tokio::test]
    async fn depth_reports_pending_and_in_flight() {
        let broker = broker().await;
        broker.publish(pointer("p1", None)).await.unwrap();
        broker.publish(pointer("p2", None)).await.unwrap();

        let batch = broker
            .receive_batch(1, Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);

        let depth = broker.depth().await.unwrap().unwrap();
        assert_eq!(depth.pending, 1);
        assert_eq!(depth.in_flight, 1);
    }
}
