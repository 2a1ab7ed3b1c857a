//! Whole-fleet operations.

use axum::{extract::State, response::IntoResponse, routing::post, Router};
use tracing::info;

use super::accepted;
use crate::api::error::ApiError;
use crate::api::RequestContext;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/reconcile", post(reconcile))
}

async fn reconcile(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    info!(request_id = %ctx.request_id, "fleet reconcile requested");
    let task_id = state
        .orchestrator()
        .reconcile()
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(accepted(task_id))
}
