//! # Transactional Outbox Pattern Implementation
//!
//! Guarantees that a task's business-logic commit and the corresponding
//! broker message are never inconsistent: both are written in the same
//! Postgres transaction, and a background processor is the only thing that
//! ever talks to the broker.
//!
//! ## Usage Example
//!
//! ### 1. Insert the task row and its outbox event in the same transaction
//!
//! ```rust,no_run
//! use transactional_outbox::{OutboxEvent, OutboxRepository, SqlxOutboxRepository};
//! use sqlx::PgPool;
//! use uuid::Uuid;
//! use serde_json::json;
//!
//! async fn dispatch_task(
//!     pool: &PgPool,
//!     outbox_repo: &SqlxOutboxRepository,
//!     task_id: Uuid,
//! ) -> Result<(), Box<dyn std::error::Error>> {
//!     let mut tx = pool.begin().await?;
//!
//!     let event = OutboxEvent::new(
//!         task_id,
//!         "tasks.medium".to_string(),
//!         json!({ "task_id": task_id }),
//!     );
//!     outbox_repo.enqueue(&mut tx, &event).await?;
//!
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### 2. Start the background processor
//!
//! ```rust,no_run
//! use transactional_outbox::{OutboxProcessor, SqlxOutboxRepository};
//! use sqlx::PgPool;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # struct MyPublisher;
//! # #[async_trait::async_trait]
//! # impl transactional_outbox::OutboxPublisher for MyPublisher {
//! #     async fn publish(&self, _: &transactional_outbox::OutboxEvent) -> transactional_outbox::OutboxResult<()> { Ok(()) }
//! # }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPool::connect("postgresql://localhost/taskdisp").await?;
//!     let repository = Arc::new(SqlxOutboxRepository::new(pool));
//!     let publisher = Arc::new(MyPublisher);
//!
//!     let processor = OutboxProcessor::new(
//!         repository,
//!         publisher,
//!         100,
//!         Duration::from_secs(5),
//!         20,
//!     );
//!
//!     processor.start().await?;
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod error;
pub mod macros;
pub mod metrics;

pub use error::{OutboxError, OutboxResult};

/// Status of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    New,
    Sent,
    Failed,
}

impl OutboxStatus {
    fn as_db_str(&self) -> &'static str {
        match self {
            OutboxStatus::New => "new",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
        }
    }

    fn from_db_str(s: &str) -> Self {
        match s {
            "sent" => OutboxStatus::Sent,
            "failed" => OutboxStatus::Failed,
            _ => OutboxStatus::New,
        }
    }
}

/// Represents a row in the outbox table: one pending broker publish tied to a task.
///
/// Rows are created within the transaction that moves a task to `pending`,
/// ensuring the task and its dispatch message are never inconsistent. A
/// background processor is the only thing that ever reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,

    /// Task this event will dispatch.
    pub task_id: Uuid,

    /// Broker routing key, e.g. `tasks.high` / `tasks.medium` / `tasks.low`.
    pub routing_key: String,

    /// Message body delivered to the broker.
    pub payload: serde_json::Value,

    pub status: OutboxStatus,

    /// Number of failed publish attempts.
    pub attempts: i32,

    /// Earliest time the processor should retry this event.
    pub next_attempt_at: DateTime<Utc>,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Set once the event is successfully published.
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn new(task_id: Uuid, routing_key: String, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id,
            routing_key,
            payload,
            status: OutboxStatus::New,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
            sent_at: None,
        }
    }
}

/// Repository trait for managing outbox events in the database.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert a new event into the outbox within a transaction.
    ///
    /// This method MUST be called within the same transaction as the task
    /// state change it is reporting, so the two are committed atomically.
    async fn enqueue(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> OutboxResult<()>;

    /// Claim up to `limit` events that are due for (re)delivery, locking
    /// them against other processor replicas via `FOR UPDATE SKIP LOCKED`.
    async fn claim_batch(&self, limit: i32) -> OutboxResult<Vec<OutboxEvent>>;

    /// Mark an event as successfully published.
    async fn mark_sent(&self, event_id: Uuid) -> OutboxResult<()>;

    /// Mark an event for retry after `next_attempt_at`, recording the error
    /// and incrementing `attempts`.
    async fn mark_retry(
        &self,
        event_id: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> OutboxResult<()>;

    /// Mark an event as permanently failed (exceeded the attempt cap).
    async fn mark_failed(&self, event_id: Uuid, error: &str) -> OutboxResult<()>;

    /// Compute pending count and oldest pending age (seconds). Age is 0 if none pending.
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// SQLx-based implementation of `OutboxRepository` using PostgreSQL.
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<OutboxEvent, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(OutboxEvent {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            routing_key: row.try_get("routing_key")?,
            payload: row.try_get("payload")?,
            status: OutboxStatus::from_db_str(&status),
            attempts: row.try_get("attempts")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            sent_at: row.try_get("sent_at")?,
        })
    }

    pub async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_events
            WHERE status != 'sent'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute pending stats")?;

        let pending: i64 = rec.try_get("pending").unwrap_or(0);
        let age: i64 = rec.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn enqueue(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id, task_id, routing_key, payload, status,
                attempts, next_attempt_at, last_error, created_at, sent_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.id)
        .bind(event.task_id)
        .bind(&event.routing_key)
        .bind(&event.payload)
        .bind(event.status.as_db_str())
        .bind(event.attempts)
        .bind(event.next_attempt_at)
        .bind(&event.last_error)
        .bind(event.created_at)
        .bind(event.sent_at)
        .execute(&mut **tx)
        .await
        .context("Failed to insert event into outbox")?;

        debug!(
            event_id = %event.id,
            task_id = %event.task_id,
            routing_key = %event.routing_key,
            "Event inserted into outbox"
        );

        Ok(())
    }

    async fn claim_batch(&self, limit: i32) -> OutboxResult<Vec<OutboxEvent>> {
        let mut tx = self.pool.begin().await.context("Failed to start claim transaction")?;

        let rows = sqlx::query(
            r#"
            SELECT id, task_id, routing_key, payload, status,
                   attempts, next_attempt_at, last_error, created_at, sent_at
            FROM outbox_events
            WHERE status != 'sent' AND next_attempt_at <= NOW()
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to claim outbox events")?;

        let events = rows
            .iter()
            .map(Self::row_to_event)
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("Failed to parse claimed events")?;

        tx.commit().await.context("Failed to commit claim transaction")?;

        debug!(count = events.len(), "Claimed outbox events");

        Ok(events)
    }

    async fn mark_sent(&self, event_id: Uuid) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'sent', sent_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark event as sent")?;

        if result.rows_affected() == 0 {
            warn!(event_id = %event_id, "Event not found when marking as sent");
            return Err(OutboxError::EventNotFound(event_id));
        }

        debug!(event_id = %event_id, "Event marked as sent");
        Ok(())
    }

    async fn mark_retry(
        &self,
        event_id: Uuid,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET attempts = attempts + 1,
                next_attempt_at = $2,
                last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(next_attempt_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to mark event for retry")?;

        if result.rows_affected() == 0 {
            warn!(event_id = %event_id, "Event not found when marking for retry");
            return Err(OutboxError::EventNotFound(event_id));
        }

        Ok(())
    }

    async fn mark_failed(&self, event_id: Uuid, error: &str) -> OutboxResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'failed',
                attempts = attempts + 1,
                last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("Failed to mark event as failed")?;

        if result.rows_affected() == 0 {
            warn!(event_id = %event_id, "Event not found when marking as failed");
            return Err(OutboxError::EventNotFound(event_id));
        }

        warn!(event_id = %event_id, error = %error, "Event marked as failed");
        Ok(())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        SqlxOutboxRepository::pending_stats(self).await
    }
}

/// Publisher trait for delivering events to the broker.
///
/// Implementations should be idempotent — the processor may call `publish`
/// more than once for the same event if a crash occurs between a successful
/// send and `mark_sent` committing.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()>;
}

/// Background processor for publishing outbox events.
///
/// - Polls the database for due events at a fixed interval.
/// - Publishes each event via the configured publisher.
/// - Backs off exponentially per-event, capped, and gives up after
///   `max_attempts`, leaving the row `failed` for manual inspection.
pub struct OutboxProcessor<R: OutboxRepository, P: OutboxPublisher> {
    repository: Arc<R>,
    publisher: Arc<P>,
    batch_size: i32,
    poll_interval: Duration,
    max_attempts: i32,
    metrics: Option<crate::metrics::OutboxMetrics>,
}

impl<R: OutboxRepository, P: OutboxPublisher> OutboxProcessor<R, P> {
    pub fn new(
        repository: Arc<R>,
        publisher: Arc<P>,
        batch_size: i32,
        poll_interval: Duration,
        max_attempts: i32,
    ) -> Self {
        Self {
            repository,
            publisher,
            batch_size,
            poll_interval,
            max_attempts,
            metrics: None,
        }
    }

    /// Create a processor that also updates Prometheus metrics each polling cycle.
    pub fn new_with_metrics(
        repository: Arc<R>,
        publisher: Arc<P>,
        metrics: crate::metrics::OutboxMetrics,
        batch_size: i32,
        poll_interval: Duration,
        max_attempts: i32,
    ) -> Self {
        Self {
            repository,
            publisher,
            batch_size,
            poll_interval,
            max_attempts,
            metrics: Some(metrics),
        }
    }

    /// Run the processor loop until `shutdown` fires.
    pub async fn start(&self) -> Result<()> {
        self.run(None).await
    }

    /// Run the processor loop, exiting once `shutdown` receives a value.
    pub async fn run(&self, mut shutdown: Option<tokio::sync::broadcast::Receiver<()>>) -> Result<()> {
        info!(
            batch_size = self.batch_size,
            poll_interval_secs = self.poll_interval.as_secs(),
            max_attempts = self.max_attempts,
            "Outbox processor starting"
        );

        loop {
            match self.process_batch().await {
                Ok(count) => {
                    if count > 0 {
                        info!(published_count = count, "Published events from outbox");
                    } else {
                        debug!("No events to publish");
                    }
                }
                Err(e) => {
                    error!(error = ?e, "Outbox processor error");
                }
            }

            if let Some(metrics) = &self.metrics {
                if let Ok((pending, age)) = self.repository.pending_stats().await {
                    metrics.pending.set(pending);
                    metrics.oldest_pending_age_seconds.set(age);
                }
            }

            if let Some(rx) = shutdown.as_mut() {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = rx.recv() => {
                        info!("Outbox processor received shutdown signal");
                        return Ok(());
                    }
                }
            } else {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    /// Process a single batch of events. Returns the number published.
    async fn process_batch(&self) -> OutboxResult<i32> {
        let events = self.repository.claim_batch(self.batch_size).await?;
        let mut published_count = 0;

        for event in events {
            if event.attempts >= self.max_attempts {
                warn!(
                    event_id = %event.id,
                    task_id = %event.task_id,
                    attempts = event.attempts,
                    max_attempts = self.max_attempts,
                    last_error = ?event.last_error,
                    "Event exceeded max attempts, marking failed"
                );
                if let Err(e) = self
                    .repository
                    .mark_failed(event.id, "exceeded max publish attempts")
                    .await
                {
                    error!(event_id = %event.id, error = ?e, "Failed to mark event as failed");
                }
                if let Some(metrics) = &self.metrics {
                    metrics.failed.inc();
                }
                continue;
            }

            match self.publisher.publish(&event).await {
                Ok(_) => {
                    if let Err(e) = self.repository.mark_sent(event.id).await {
                        error!(
                            event_id = %event.id,
                            error = ?e,
                            "Failed to mark event as sent (event was delivered to the broker)"
                        );
                    } else {
                        published_count += 1;
                        if let Some(metrics) = &self.metrics {
                            metrics.published.inc();
                        }
                    }
                }
                Err(e) => {
                    error!(
                        event_id = %event.id,
                        task_id = %event.task_id,
                        attempts = event.attempts,
                        error = ?e,
                        "Failed to publish event"
                    );

                    let next_attempt_at = Utc::now()
                        + chrono::Duration::from_std(self.calculate_backoff(event.attempts + 1))
                            .unwrap_or_default();

                    if let Err(mark_err) = self
                        .repository
                        .mark_retry(event.id, next_attempt_at, &e.to_string())
                        .await
                    {
                        error!(event_id = %event.id, error = ?mark_err, "Failed to mark event for retry");
                    }
                }
            }
        }

        Ok(published_count)
    }

    /// `min(60s, 0.5s * 2^(attempts-1))`, where `attempts` is the attempt
    /// count after the failure being handled (1-indexed).
    fn calculate_backoff(&self, attempts: i32) -> Duration {
        const MAX_BACKOFF_SECS: f64 = 60.0;

        let backoff_secs = (0.5 * 2f64.powi((attempts - 1).max(0))).min(MAX_BACKOFF_SECS);
        Duration::from_secs_f64(backoff_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopPublisher;

    #[async_trait]
    impl OutboxPublisher for NoopPublisher {
        async fn publish(&self, _event: &OutboxEvent) -> OutboxResult<()> {
            Ok(())
        }
    }

    fn processor() -> OutboxProcessor<SqlxOutboxRepository, NoopPublisher> {
        let repo = Arc::new(SqlxOutboxRepository::new(
            PgPool::connect_lazy("postgresql://localhost/test").unwrap(),
        ));
        let publisher = Arc::new(NoopPublisher);
        OutboxProcessor::new(repo, publisher, 10, Duration::from_secs(1), 20)
    }

    #[test]
    fn test_backoff_calculation() {
        let processor = processor();

        assert_eq!(processor.calculate_backoff(1).as_secs_f64(), 0.5);
        assert_eq!(processor.calculate_backoff(2).as_secs_f64(), 1.0);
        assert_eq!(processor.calculate_backoff(3).as_secs_f64(), 2.0);
        assert_eq!(processor.calculate_backoff(4).as_secs_f64(), 4.0);
        assert_eq!(processor.calculate_backoff(5).as_secs_f64(), 8.0);
        assert_eq!(processor.calculate_backoff(6).as_secs_f64(), 16.0);
        assert_eq!(processor.calculate_backoff(7).as_secs_f64(), 32.0);
        assert_eq!(processor.calculate_backoff(8).as_secs_f64(), 60.0); // capped
        assert_eq!(processor.calculate_backoff(20).as_secs_f64(), 60.0);
    }

    #[test]
    fn test_outbox_event_new_defaults() {
        let task_id = Uuid::new_v4();
        let event = OutboxEvent::new(task_id, "tasks.high".to_string(), serde_json::json!({}));

        assert_eq!(event.task_id, task_id);
        assert_eq!(event.routing_key, "tasks.high");
        assert_eq!(event.status, OutboxStatus::New);
        assert_eq!(event.attempts, 0);
        assert!(event.sent_at.is_none());
    }

    #[test]
    fn test_status_db_roundtrip() {
        assert_eq!(OutboxStatus::from_db_str("sent"), OutboxStatus::Sent);
        assert_eq!(OutboxStatus::from_db_str("failed"), OutboxStatus::Failed);
        assert_eq!(OutboxStatus::from_db_str("new"), OutboxStatus::New);
        assert_eq!(OutboxStatus::New.as_db_str(), "new");
    }
}
