//! Task endpoints: list with filters, fetch by id, cancel pending, and
//! queue statistics.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::EngineError;
use crate::tasks::store::CancelOutcome;
use crate::tasks::types::{Task, TaskFilter, TaskStatus};

use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub target: Option<String>,
    pub operation: Option<String>,
    pub operation_ne: Option<String>,
    /// RFC 3339 timestamp; matches rows updated after it
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    /// Total matching count is computed only on request
    #[serde(default)]
    pub include_count: bool,
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<Task>,
    /// Live in-process execution count, not a durable metric
    pub running_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TaskStatsResponse {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub max_concurrent: usize,
    pub processor_running: bool,
}

/// `GET /tasks`
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<TaskListResponse>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()?;

    let filter = TaskFilter {
        status,
        target: query.target,
        operation: query.operation,
        operation_ne: query.operation_ne,
        since: query.since,
        limit: query.limit,
    };

    let default_limit = state.context.config().default_pagination_limit;
    let tasks = state.store.list(&filter, default_limit).await?;
    let total = if query.include_count {
        Some(state.store.count(&filter).await?)
    } else {
        None
    };

    Ok(Json(TaskListResponse {
        tasks,
        running_count: state.engine.running_count(),
        total,
    }))
}

/// `GET /tasks/{id}`
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    let task = state
        .store
        .get(id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("task {id}")))?;
    Ok(Json(task))
}

/// `DELETE /tasks/{id}`: cancels a pending task; anything else is refused
/// with its current status.
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    match state.store.cancel_pending(id).await? {
        CancelOutcome::Cancelled(task) => Ok(Json(task).into_response()),
        CancelOutcome::NotPending(status) => Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "only pending tasks can be cancelled",
                "current_status": status,
            })),
        )
            .into_response()),
        CancelOutcome::NotFound => Err(EngineError::NotFound(format!("task {id}")).into()),
    }
}

/// `GET /tasks/stats`
pub async fn task_stats(
    State(state): State<AppState>,
) -> Result<Json<TaskStatsResponse>, ApiError> {
    let counts = state.store.count_by_status().await?;
    Ok(Json(TaskStatsResponse {
        pending: counts.pending,
        running: counts.running,
        completed: counts.completed,
        failed: counts.failed,
        cancelled: counts.cancelled,
        max_concurrent: state.engine.max_concurrent(),
        processor_running: state.engine.is_processor_running(),
    }))
}
