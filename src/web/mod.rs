//! # HTTP Control Surface
//!
//! Read and cancel endpoints over the task store, plus live scheduler
//! metrics. The enqueue surface lives in the control plane's API tier, not
//! here. Durable state always comes from the database; only the running
//! count and processor flag are read from scheduler memory.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::context::SystemContext;
use crate::error::EngineError;
use crate::tasks::scheduler::EngineHandle;
use crate::tasks::store::TaskStore;

pub mod tasks_api;

/// Shared state for the API handlers
#[derive(Clone)]
pub struct AppState {
    pub context: SystemContext,
    pub store: TaskStore,
    pub engine: EngineHandle,
}

impl AppState {
    pub fn new(context: SystemContext, engine: EngineHandle) -> Self {
        let store = TaskStore::new(context.pool().clone());
        Self {
            context,
            store,
            engine,
        }
    }
}

/// Build the control-surface router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tasks", get(tasks_api::list_tasks))
        .route("/tasks/stats", get(tasks_api::task_stats))
        .route(
            "/tasks/{id}",
            get(tasks_api::get_task).delete(tasks_api::cancel_task),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    match sqlx::query("SELECT 1").execute(state.context.pool()).await {
        Ok(_) => (StatusCode::OK, Json(json!({"status": "ok", "database": true}))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded", "database": false, "error": e.to_string()})),
        ),
    }
}

/// Engine errors rendered as JSON responses
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) | EngineError::Precondition(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}
