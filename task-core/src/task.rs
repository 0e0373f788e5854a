//! Task model, store trait and its SQLx-backed implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use error_types::ServiceError;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

/// Dispatch priority. Maps 1:1 onto a named broker queue (`tasks.{high,medium,low}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// The queue this priority routes to, matching `RETRY_DELAYS_SECONDS`-lane naming.
    pub fn queue_name(&self) -> &'static str {
        match self {
            Priority::High => "tasks.high",
            Priority::Medium => "tasks.medium",
            Priority::Low => "tasks.low",
        }
    }
}

/// Lifecycle state of a task. Transitions are enforced by conditional SQL
/// updates, never by reading then writing in application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    New,
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Fields required to create a task. `title`/`description` length bounds are
/// validated at the HTTP boundary, not here.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
}

#[derive(Debug, Clone, Default)]
pub struct TaskListFilter {
    pub limit: i64,
    pub offset: i64,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
}

/// Durable store for tasks. Every state transition is a single conditional
/// `UPDATE`; `rows_affected() == 0` means the precondition did not hold and
/// is not itself an error — callers decide what that means (no-op, 409, ...).
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        new_task: NewTask,
    ) -> Result<Task, ServiceError>;

    async fn get(&self, id: Uuid) -> Result<Task, ServiceError>;

    async fn list(&self, filter: TaskListFilter) -> Result<Vec<Task>, ServiceError>;

    /// `NEW -> PENDING`, performed in the same transaction as `create`.
    async fn transition_to_pending(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<u64, ServiceError>;

    /// `PENDING -> IN_PROGRESS`, called by the worker on delivery.
    async fn claim(&self, id: Uuid) -> Result<u64, ServiceError>;

    /// `IN_PROGRESS -> COMPLETED`.
    async fn complete(&self, id: Uuid, result: &str) -> Result<u64, ServiceError>;

    /// `IN_PROGRESS -> FAILED`.
    async fn fail(&self, id: Uuid, error: &str) -> Result<u64, ServiceError>;

    /// `{NEW, PENDING} -> CANCELLED`.
    async fn cancel(&self, id: Uuid) -> Result<u64, ServiceError>;
}

pub struct SqlxTaskStore {
    pool: PgPool,
}

impl SqlxTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for SqlxTaskStore {
    async fn create(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        new_task: NewTask,
    ) -> Result<Task, ServiceError> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            INSERT INTO tasks (id, title, description, priority, status, created_at)
            VALUES (gen_random_uuid(), $1, $2, $3, 'NEW', NOW())
            RETURNING id, title, description, priority, status, created_at,
                      started_at, finished_at, result, error
            "#,
        )
        .bind(&new_task.title)
        .bind(&new_task.description)
        .bind(new_task.priority)
        .fetch_one(&mut **tx)
        .await?;

        Ok(task)
    }

    async fn get(&self, id: Uuid) -> Result<Task, ServiceError> {
        sqlx::query_as::<_, Task>(
            r#"
            SELECT id, title, description, priority, status, created_at,
                   started_at, finished_at, result, error
            FROM tasks
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => {
                ServiceError::NotFound(format!("task {id} not found"))
            }
            other => other.into(),
        })
    }

    async fn list(&self, filter: TaskListFilter) -> Result<Vec<Task>, ServiceError> {
        let tasks = sqlx::query_as::<_, Task>(
            r#"
            SELECT id, title, description, priority, status, created_at,
                   started_at, finished_at, result, error
            FROM tasks
            WHERE ($3::varchar IS NULL OR status = $3)
              AND ($4::varchar IS NULL OR priority = $4)
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(filter.limit)
        .bind(filter.offset)
        .bind(filter.status)
        .bind(filter.priority)
        .fetch_all(&self.pool)
        .await?;

        Ok(tasks)
    }

    async fn transition_to_pending(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<u64, ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'PENDING'
            WHERE id = $1 AND status = 'NEW'
            "#,
        )
        .bind(id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }

    async fn claim(&self, id: Uuid) -> Result<u64, ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'IN_PROGRESS', started_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn complete(&self, id: Uuid, result: &str) -> Result<u64, ServiceError> {
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'COMPLETED', result = $2, error = NULL, finished_at = NOW()
            WHERE id = $1 AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<u64, ServiceError> {
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'FAILED', error = $2, finished_at = NOW()
            WHERE id = $1 AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn cancel(&self, id: Uuid) -> Result<u64, ServiceError> {
        let res = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'CANCELLED', finished_at = NOW()
            WHERE id = $1 AND status IN ('NEW', 'PENDING')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_queue_names() {
        assert_eq!(Priority::High.queue_name(), "tasks.high");
        assert_eq!(Priority::Medium.queue_name(), "tasks.medium");
        assert_eq!(Priority::Low.queue_name(), "tasks.low");
    }

    #[test]
    fn test_task_list_filter_default() {
        let filter = TaskListFilter::default();
        assert_eq!(filter.limit, 0);
        assert_eq!(filter.offset, 0);
        assert!(filter.status.is_none());
        assert!(filter.priority.is_none());
    }
}
