//! Incident listing and resolution (§4.9, §7 "Non-fatal" errors).

use axum::extract::{Path, Query, State};
use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::{Json, Router};
use bpmn_engine::auth::Permission;
use bpmn_engine::model::{Incident, IncidentKind, IncidentState, ResolutionAction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::auth::require;
use crate::routes::common::{paginate, ListResponse, PageQuery};

const DEFAULT_PAGE_LIMIT: u32 = 50;
const MAX_PAGE_LIMIT: u32 = 500;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentKindDto {
    JobFailure,
    BpmnError,
    ExpressionError,
    TimerError,
    MessageError,
}

impl From<IncidentKind> for IncidentKindDto {
    fn from(k: IncidentKind) -> Self {
        match k {
            IncidentKind::JobFailure => Self::JobFailure,
            IncidentKind::BpmnError => Self::BpmnError,
            IncidentKind::ExpressionError => Self::ExpressionError,
            IncidentKind::TimerError => Self::TimerError,
            IncidentKind::MessageError => Self::MessageError,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IncidentView {
    pub incident_id: Uuid,
    pub kind: IncidentKindDto,
    pub instance_id: Uuid,
    pub element_id: String,
    pub message: String,
    pub open: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Incident> for IncidentView {
    fn from(i: Incident) -> Self {
        Self {
            incident_id: i.incident_id,
            kind: i.kind.into(),
            instance_id: i.instance_id,
            element_id: i.element_id,
            message: i.message,
            open: i.state == IncidentState::Open,
            created_at: i.created_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResolutionActionDto {
    Retry,
    Dismiss,
}

impl From<ResolutionActionDto> for ResolutionAction {
    fn from(a: ResolutionActionDto) -> Self {
        match a {
            ResolutionActionDto::Retry => Self::Retry,
            ResolutionActionDto::Dismiss => Self::Dismiss,
        }
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ResolveIncidentRequest {
    pub action: ResolutionActionDto,
    pub resolver: String,
    pub comment: Option<String>,
    pub new_retries: Option<u32>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/incidents", get(list_open_incidents))
        .route("/v1/process-instances/:instance_id/incidents", get(list_instance_incidents))
        .route("/v1/incidents/:incident_id/resolve", post(resolve_incident))
        .route_layer(from_fn(require(state.auth.clone(), Permission::Incident)))
        .with_state(state)
}

/// GET /v1/incidents - every open incident across all instances.
#[utoipa::path(
    get,
    path = "/v1/incidents",
    params(PageQuery),
    responses((status = 200, body = ListResponse<IncidentView>)),
    tag = "incident"
)]
pub async fn list_open_incidents(State(state): State<AppState>, Query(page): Query<PageQuery>) -> Result<Json<ListResponse<IncidentView>>, ApiError> {
    let incidents = state.runtime.incidents.list_open().await?;
    let views: Vec<IncidentView> = incidents.into_iter().map(IncidentView::from).collect();
    Ok(Json(paginate(views, &page, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT)))
}

/// GET /v1/process-instances/{instance_id}/incidents
#[utoipa::path(
    get,
    path = "/v1/process-instances/{instance_id}/incidents",
    params(("instance_id" = Uuid, Path, description = "Instance id"), PageQuery),
    responses((status = 200, body = ListResponse<IncidentView>)),
    tag = "incident"
)]
pub async fn list_instance_incidents(State(state): State<AppState>, Path(instance_id): Path<Uuid>, Query(page): Query<PageQuery>) -> Result<Json<ListResponse<IncidentView>>, ApiError> {
    let incidents = state.runtime.incidents.list_for_instance(instance_id).await?;
    let views: Vec<IncidentView> = incidents.into_iter().map(IncidentView::from).collect();
    Ok(Json(paginate(views, &page, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT)))
}

/// POST /v1/incidents/{incident_id}/resolve
#[utoipa::path(
    post,
    path = "/v1/incidents/{incident_id}/resolve",
    params(("incident_id" = Uuid, Path, description = "Incident id")),
    request_body = ResolveIncidentRequest,
    responses((status = 204, description = "Resolved")),
    tag = "incident"
)]
pub async fn resolve_incident(State(state): State<AppState>, Path(incident_id): Path<Uuid>, Json(req): Json<ResolveIncidentRequest>) -> Result<(), ApiError> {
    state
        .runtime
        .engine
        .resolve_incident(incident_id, req.action.into(), &req.resolver, req.comment, req.new_retries)
        .await?;
    Ok(())
}
