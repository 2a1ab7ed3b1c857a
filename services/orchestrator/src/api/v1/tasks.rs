//! Task status endpoints.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::info;
use vmfleet_id::TaskId;

use crate::api::error::ApiError;
use crate::api::RequestContext;
use crate::state::AppState;
use crate::tasks::Task;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_tasks))
        .route("/{task_id}", get(get_task))
        .route("/{task_id}/cancel", post(cancel_task))
}

#[derive(Debug, Serialize)]
pub struct ListTasksResponse {
    pub items: Vec<Task>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct CancelTaskResponse {
    pub task_id: TaskId,
    /// False when the task had already finished.
    pub cancelled: bool,
}

fn parse_task_id(raw: &str, ctx: &RequestContext) -> Result<TaskId, ApiError> {
    raw.parse::<TaskId>().map_err(|_| {
        ApiError::bad_request("invalid_task_id", format!("'{raw}' is not a task id"))
            .with_request_id(ctx.request_id.clone())
    })
}

async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    let items = state.orchestrator().tasks().list().await;
    let total = items.len();
    Json(ListTasksResponse { items, total })
}

async fn get_task(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_task_id(&task_id, &ctx)?;
    let task = state
        .orchestrator()
        .tasks()
        .get(&id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(Json(task))
}

async fn cancel_task(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_task_id(&task_id, &ctx)?;
    let cancelled = state
        .orchestrator()
        .tasks()
        .cancel(&id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    info!(request_id = %ctx.request_id, task_id = %id, cancelled, "task cancel requested");
    Ok(Json(CancelTaskResponse {
        task_id: id,
        cancelled,
    }))
}
