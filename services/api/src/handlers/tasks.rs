use actix_web::{web, HttpResponse, Result as ActixResult};
use error_types::ServiceError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use task_core::{NewTask, Priority, Task, TaskListFilter, TaskStatus, TaskStore};
use tracing::{error, warn};
use uuid::Uuid;
use validator::Validate;

use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateTaskPayload {
    #[validate(length(min = 1, max = 255))]
    pub title: String,
    #[validate(length(max = 10_000))]
    pub description: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: Priority,
}

fn default_priority() -> Priority {
    Priority::Medium
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

fn default_limit() -> i64 {
    20
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub items: Vec<Task>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Serialize)]
pub struct TaskStatusResponse {
    pub id: Uuid,
    pub status: TaskStatus,
}

fn validate_list_query(query: &ListTasksQuery) -> Result<(), ServiceError> {
    if query.limit < 1 || query.limit > 100 {
        return Err(ServiceError::Validation(
            "limit must be between 1 and 100".to_string(),
        ));
    }
    if query.offset < 0 {
        return Err(ServiceError::Validation("offset must be >= 0".to_string()));
    }
    Ok(())
}

/// POST /api/v1/tasks
///
/// Inserts the task as `NEW`, transitions it to `PENDING` and enqueues its
/// outbox event in one transaction, then attempts a best-effort synchronous
/// publish outside the transaction. The outbox processor is the durable
/// fallback if that publish fails or the broker is unreachable.
pub async fn create_task(
    state: web::Data<AppState>,
    payload: web::Json<CreateTaskPayload>,
) -> ActixResult<HttpResponse> {
    payload
        .validate()
        .map_err(|e| ServiceError::Validation(e.to_string()))?;

    let mut tx = state
        .pool
        .begin()
        .await
        .map_err(|e| ServiceError::Database(e.to_string()))?;

    let task = state
        .tasks
        .create(
            &mut tx,
            NewTask {
                title: payload.title.clone(),
                description: payload.description.clone(),
                priority: payload.priority,
            },
        )
        .await?;

    state.tasks.transition_to_pending(&mut tx, task.id).await?;

    let routing_key = task.priority.queue_name();
    let event_payload = json!({ "task_id": task.id, "priority": task.priority });

    transactional_outbox::enqueue_task_event!(
        &mut tx,
        &state.outbox,
        task.id,
        routing_key,
        event_payload.clone()
    )
    .map_err(|e| ServiceError::Database(e.to_string()))?;

    tx.commit()
        .await
        .map_err(|e| ServiceError::Database(e.to_string()))?;

    if let Some(broker) = &state.broker {
        let body = match serde_json::to_vec(&event_payload) {
            Ok(b) => b,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "failed to serialize task-created payload");
                Vec::new()
            }
        };
        if !body.is_empty() {
            if let Err(e) = broker.publish(routing_key, &body).await {
                warn!(task_id = %task.id, error = %e, "task dispatch deferred to outbox, synchronous publish failed");
            }
        }
    }

    let mut response_task = task;
    response_task.status = TaskStatus::Pending;

    Ok(HttpResponse::Created().json(response_task))
}

/// GET /api/v1/tasks/{id}
pub async fn get_task(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<HttpResponse> {
    let task = state.tasks.get(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(task))
}

/// GET /api/v1/tasks
pub async fn list_tasks(
    state: web::Data<AppState>,
    query: web::Query<ListTasksQuery>,
) -> ActixResult<HttpResponse> {
    let query = query.into_inner();
    validate_list_query(&query)?;

    let items = state
        .tasks
        .list(TaskListFilter {
            limit: query.limit,
            offset: query.offset,
            status: query.status,
            priority: query.priority,
        })
        .await?;

    Ok(HttpResponse::Ok().json(TaskListResponse {
        items,
        limit: query.limit,
        offset: query.offset,
    }))
}

/// GET /api/v1/tasks/{id}/status
pub async fn get_task_status(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<HttpResponse> {
    let task = state.tasks.get(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(TaskStatusResponse {
        id: task.id,
        status: task.status,
    }))
}

/// DELETE /api/v1/tasks/{id}
///
/// Cancels the task if it hasn't started yet. `cancel` is a single
/// conditional `UPDATE`, so a concurrent claim by a worker can never race
/// with this: whichever writer wins, the other observes zero rows affected.
pub async fn cancel_task(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<HttpResponse> {
    let task_id = path.into_inner();
    let task = state.tasks.get(task_id).await?;

    let rows = state.tasks.cancel(task_id).await?;
    if rows == 0 {
        return Err(ServiceError::Conflict(format!(
            "cannot cancel task {task_id} in status {:?}",
            task.status
        ))
        .into());
    }

    let cancelled = state.tasks.get(task_id).await?;
    Ok(HttpResponse::Ok().json(cancelled))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/tasks")
            .route("", web::post().to(create_task))
            .route("", web::get().to(list_tasks))
            .route("/{id}", web::get().to(get_task))
            .route("/{id}/status", web::get().to(get_task_status))
            .route("/{id}", web::delete().to(cancel_task)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_list_query_rejects_limit_out_of_range() {
        let query = ListTasksQuery {
            limit: 0,
            offset: 0,
            status: None,
            priority: None,
        };
        assert!(validate_list_query(&query).is_err());

        let query = ListTasksQuery {
            limit: 101,
            offset: 0,
            status: None,
            priority: None,
        };
        assert!(validate_list_query(&query).is_err());
    }

    #[test]
    fn test_validate_list_query_rejects_negative_offset() {
        let query = ListTasksQuery {
            limit: 20,
            offset: -1,
            status: None,
            priority: None,
        };
        assert!(validate_list_query(&query).is_err());
    }

    #[test]
    fn test_validate_list_query_accepts_defaults() {
        let query = ListTasksQuery {
            limit: default_limit(),
            offset: 0,
            status: None,
            priority: None,
        };
        assert!(validate_list_query(&query).is_ok());
    }

    #[test]
    fn test_create_task_payload_rejects_empty_title() {
        let payload = CreateTaskPayload {
            title: "".to_string(),
            description: None,
            priority: default_priority(),
        };
        assert!(payload.validate().is_err());
    }

    #[test]
    fn test_create_task_payload_rejects_oversized_description() {
        let payload = CreateTaskPayload {
            title: "valid".to_string(),
            description: Some("x".repeat(10_001)),
            priority: default_priority(),
        };
        assert!(payload.validate().is_err());
    }

    #[test]
    fn test_create_task_payload_accepts_minimal_input() {
        let payload = CreateTaskPayload {
            title: "send email".to_string(),
            description: None,
            priority: default_priority(),
        };
        assert!(payload.validate().is_ok());
    }

    #[test]
    fn test_query_missing_status_and_priority_deserializes_to_none() {
        let query: ListTasksQuery = serde_json::from_str(r#"{"limit":20,"offset":0}"#).unwrap();
        assert_eq!(query.limit, 20);
        assert_eq!(query.offset, 0);
        assert_eq!(query.status, None);
        assert_eq!(query.priority, None);
    }
}
