//! API v1 routes.

mod fleet;
mod notifications;
mod servers;
mod tasks;

use axum::{http::StatusCode, response::IntoResponse, Json, Router};
use serde::Serialize;
use vmfleet_id::TaskId;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/servers", servers::routes())
        .nest("/tasks", tasks::routes())
        .nest("/notifications", notifications::routes())
        .nest("/fleet", fleet::routes())
}

/// Body of every 202 response.
#[derive(Debug, Serialize)]
pub struct TaskAccepted {
    pub task_id: TaskId,
    pub status: &'static str,
}

pub(crate) fn accepted(task_id: TaskId) -> impl IntoResponse {
    (
        StatusCode::ACCEPTED,
        Json(TaskAccepted {
            task_id,
            status: "pending",
        }),
    )
}
