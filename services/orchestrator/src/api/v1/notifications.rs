//! Notification feed.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::RequestContext;
use crate::notifications::Notification;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(list_notifications))
}

#[derive(Debug, Deserialize)]
pub struct ListNotificationsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListNotificationsResponse {
    pub items: Vec<Notification>,
}

async fn list_notifications(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<ListNotificationsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let items = state
        .orchestrator()
        .notifications()
        .recent(limit)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(Json(ListNotificationsResponse { items }))
}
