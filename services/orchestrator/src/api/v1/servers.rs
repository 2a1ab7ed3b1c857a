//! Server lifecycle endpoints.
//!
//! Mutations register a background task and answer 202 with its id.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::accepted;
use crate::api::error::ApiError;
use crate::api::RequestContext;
use crate::db::ServerRecord;
use crate::fleet_spec::ServerSpec;
use crate::lifecycle::{BulkAction, CreateServer};
use crate::state::AppState;

const REDACTED: &str = "********";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_server).get(list_servers))
        .route("/bulk", post(create_servers))
        .route("/bulk-delete", post(delete_servers))
        .route("/actions", post(bulk_action))
        .route("/roles", post(assign_roles))
        .route("/{name}", get(get_server))
        .route("/{name}", delete(delete_server))
        .route("/{name}/role", put(assign_role))
}

#[derive(Debug, Deserialize)]
pub struct BulkCreateRequest {
    pub servers: Vec<CreateServer>,
}

#[derive(Debug, Deserialize)]
pub struct NamesRequest {
    pub names: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkActionRequest {
    pub action: BulkAction,
    pub names: Vec<String>,
}

/// An empty or missing role removes the current one.
#[derive(Debug, Deserialize)]
pub struct AssignRoleRequest {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct AssignRolesRequest {
    pub names: Vec<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ListServersResponse {
    pub items: Vec<ServerRecord>,
    pub total: usize,
}

/// Cached record and declared spec; either side may be missing mid-workflow.
#[derive(Debug, Serialize)]
pub struct ServerDetailResponse {
    pub name: String,
    pub record: Option<ServerRecord>,
    pub spec: Option<ServerSpec>,
}

fn require_names(names: &[String], ctx: &RequestContext) -> Result<(), ApiError> {
    if names.is_empty() {
        return Err(ApiError::bad_request("invalid_request", "names must not be empty")
            .with_request_id(ctx.request_id.clone()));
    }
    Ok(())
}

async fn create_server(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<CreateServer>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("invalid_request", "name is required")
            .with_request_id(ctx.request_id.clone()));
    }
    info!(request_id = %ctx.request_id, server = %req.name, "create server requested");

    let task_id = state
        .orchestrator()
        .create_server(req)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(accepted(task_id))
}

async fn create_servers(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<BulkCreateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.servers.is_empty() {
        return Err(ApiError::bad_request("invalid_request", "servers must not be empty")
            .with_request_id(ctx.request_id.clone()));
    }
    info!(request_id = %ctx.request_id, count = req.servers.len(), "bulk create requested");

    let task_id = state
        .orchestrator()
        .create_servers(req.servers)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(accepted(task_id))
}

async fn delete_server(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    info!(request_id = %ctx.request_id, server = %name, "delete server requested");

    let task_id = state
        .orchestrator()
        .delete_server(name)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(accepted(task_id))
}

async fn delete_servers(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<NamesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_names(&req.names, &ctx)?;
    info!(request_id = %ctx.request_id, count = req.names.len(), "bulk delete requested");

    let task_id = state
        .orchestrator()
        .delete_servers(req.names)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(accepted(task_id))
}

async fn bulk_action(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<BulkActionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_names(&req.names, &ctx)?;
    info!(
        request_id = %ctx.request_id,
        action = req.action.as_str(),
        count = req.names.len(),
        "bulk action requested"
    );

    let task_id = state
        .orchestrator()
        .bulk_action(req.action, req.names)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(accepted(task_id))
}

async fn assign_role(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
    Json(req): Json<AssignRoleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task_id = state
        .orchestrator()
        .assign_role(vec![name], req.role, req.vars)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(accepted(task_id))
}

async fn assign_roles(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<AssignRolesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_names(&req.names, &ctx)?;

    let task_id = state
        .orchestrator()
        .assign_role(req.names, req.role, req.vars)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(accepted(task_id))
}

async fn list_servers(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let items = state
        .orchestrator()
        .metadata()
        .list()
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    let total = items.len();
    Ok(Json(ListServersResponse { items, total }))
}

async fn get_server(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let orchestrator = state.orchestrator();
    let request_id = ctx.request_id.clone();

    let record = orchestrator
        .metadata()
        .get(&name)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;
    let spec = orchestrator
        .specs()
        .get(&name)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(request_id.clone()))?;

    if record.is_none() && spec.is_none() {
        return Err(ApiError::not_found(
            "server_not_found",
            format!("server '{name}' is not in the fleet"),
        )
        .with_request_id(request_id));
    }

    let spec = spec.map(|mut spec| {
        if spec.vm_password.is_some() {
            spec.vm_password = Some(REDACTED.to_string());
        }
        spec
    });

    Ok(Json(ServerDetailResponse { name, record, spec }))
}
