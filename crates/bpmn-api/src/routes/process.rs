//! Process start/cancel/lookup and definition deployment (§6 "Process start").

use axum::extract::{Path, State};
use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::{Json, Router};
use bpmn_engine::auth::Permission;
use bpmn_engine::model::{InstanceState, ProcessDefinition};
use bpmn_engine::store::TokenStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::auth::require;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct StartProcessRequest {
    pub process_key: String,
    pub version: Option<u32>,
    #[schema(value_type = Object)]
    pub variables: Option<serde_json::Value>,
    pub tenant_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StartProcessResponse {
    pub instance_id: Uuid,
    pub version: u32,
    pub state: InstanceStateDto,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStateDto {
    Active,
    Completed,
    Cancelled,
}

impl From<InstanceState> for InstanceStateDto {
    fn from(s: InstanceState) -> Self {
        match s {
            InstanceState::Active => Self::Active,
            InstanceState::Completed => Self::Completed,
            InstanceState::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct InstanceView {
    pub instance_id: Uuid,
    pub process_key: String,
    pub version: u32,
    pub tenant_id: String,
    pub state: InstanceStateDto,
    #[schema(value_type = Object)]
    pub variables: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CancelInstanceRequest {
    pub reason: String,
}

pub fn routes(state: AppState) -> Router {
    let write = from_fn(require(state.auth.clone(), Permission::Process));
    let deploy = from_fn(require(state.auth.clone(), Permission::Bpmn));

    Router::new()
        .route("/v1/process-instances", post(start_instance))
        .route("/v1/process-instances/:instance_id", get(get_instance))
        .route("/v1/process-instances/:instance_id/cancel", post(cancel_instance))
        .route_layer(write)
        .route("/v1/process-definitions", post(deploy_definition))
        .route_layer(deploy)
        .with_state(state)
}

/// POST /v1/process-instances - start a process instance.
#[utoipa::path(
    post,
    path = "/v1/process-instances",
    request_body = StartProcessRequest,
    responses((status = 200, description = "Instance started", body = StartProcessResponse)),
    tag = "process"
)]
pub async fn start_instance(State(state): State<AppState>, Json(req): Json<StartProcessRequest>) -> Result<Json<StartProcessResponse>, ApiError> {
    let variables = match req.variables {
        Some(v) => serde_json::from_value(v).map_err(|e| ApiError::bad_request(format!("invalid variables: {e}")))?,
        None => Default::default(),
    };
    let tenant_id = req.tenant_id.unwrap_or_else(|| "default".to_string());
    let instance = state.runtime.engine.start_instance(&req.process_key, req.version, &tenant_id, variables).await?;
    Ok(Json(StartProcessResponse {
        instance_id: instance.instance_id,
        version: instance.version,
        state: instance.state.into(),
        started_at: instance.created_at,
    }))
}

/// GET /v1/process-instances/{instance_id} - fetch an instance snapshot.
#[utoipa::path(
    get,
    path = "/v1/process-instances/{instance_id}",
    params(("instance_id" = Uuid, Path, description = "Instance id")),
    responses((status = 200, body = InstanceView), (status = 404, description = "Instance not found")),
    tag = "process"
)]
pub async fn get_instance(State(state): State<AppState>, Path(instance_id): Path<Uuid>) -> Result<Json<InstanceView>, ApiError> {
    let instance = state
        .runtime
        .store
        .load_instance(instance_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("instance {instance_id} not found")))?;
    Ok(Json(InstanceView {
        instance_id: instance.instance_id,
        process_key: instance.process_key,
        version: instance.version,
        tenant_id: instance.tenant_id,
        state: instance.state.into(),
        variables: serde_json::to_value(instance.variables).unwrap_or_default(),
        created_at: instance.created_at,
        updated_at: instance.updated_at,
    }))
}

/// POST /v1/process-instances/{instance_id}/cancel
#[utoipa::path(
    post,
    path = "/v1/process-instances/{instance_id}/cancel",
    params(("instance_id" = Uuid, Path, description = "Instance id")),
    request_body = CancelInstanceRequest,
    responses((status = 204, description = "Instance cancelled")),
    tag = "process"
)]
pub async fn cancel_instance(State(state): State<AppState>, Path(instance_id): Path<Uuid>, Json(req): Json<CancelInstanceRequest>) -> Result<(), ApiError> {
    state.runtime.engine.cancel_instance(instance_id, &req.reason).await?;
    Ok(())
}

/// POST /v1/process-definitions - deploy a resolved process graph. Parsing
/// BPMN XML into this shape is an external concern (§1 Non-goals); this
/// endpoint accepts the already-resolved graph as JSON.
#[utoipa::path(
    post,
    path = "/v1/process-definitions",
    request_body(content = Object, description = "A resolved ProcessDefinition"),
    responses((status = 201, description = "Deployed"), (status = 400, description = "Malformed definition")),
    tag = "bpmn"
)]
pub async fn deploy_definition(State(state): State<AppState>, Json(body): Json<serde_json::Value>) -> Result<Json<serde_json::Value>, ApiError> {
    let def: ProcessDefinition = serde_json::from_value(body).map_err(|e| ApiError::bad_request(format!("{e}")))?;
    state.runtime.graph.deploy(&def)?;
    Ok(Json(serde_json::json!({ "process_key": def.process_key, "version": def.version })))
}
