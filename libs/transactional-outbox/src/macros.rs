//! Convenience macros for working with the outbox.

/// Enqueue a task dispatch event within a transaction.
///
/// Simplifies the common pattern of building an `OutboxEvent` and inserting
/// it alongside the task row it reports on.
///
/// # Usage
///
/// ```rust,no_run
/// use transactional_outbox::{enqueue_task_event, SqlxOutboxRepository};
/// use sqlx::PgPool;
/// use uuid::Uuid;
/// use serde_json::json;
///
/// # async fn example(pool: PgPool, repo: SqlxOutboxRepository) -> Result<(), Box<dyn std::error::Error>> {
/// let mut tx = pool.begin().await?;
/// let task_id = Uuid::new_v4();
///
/// sqlx::query("UPDATE tasks SET status = 'pending' WHERE id = $1 AND status = 'new'")
///     .bind(task_id)
///     .execute(&mut *tx)
///     .await?;
///
/// enqueue_task_event!(&mut tx, &repo, task_id, "tasks.medium", json!({ "task_id": task_id }));
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! enqueue_task_event {
    ($tx:expr, $repo:expr, $task_id:expr, $routing_key:expr, $payload:expr) => {{
        use $crate::{OutboxEvent, OutboxRepository};

        let event = OutboxEvent::new($task_id, $routing_key.to_string(), $payload);
        $repo.enqueue($tx, &event).await
    }};
}

#[cfg(test)]
mod tests {
    // Macro tests are compile-time checks; if this file compiles, the macro is
    // syntactically correct.
}
