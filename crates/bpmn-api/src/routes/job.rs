//! Job activation/completion/failure (§6 "Activate/Complete/Fail job").

use axum::extract::{Path, State};
use axum::middleware::from_fn;
use axum::routing::post;
use axum::{Json, Router};
use bpmn_engine::auth::Permission;
use bpmn_engine::job::JobActivation;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::auth::require;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ActivateJobsRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    pub worker: String,
    pub max_jobs: u32,
    pub timeout_ms: u64,
    #[serde(default)]
    pub fetch_variables: Vec<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JobActivationDto {
    pub job_key: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub element_id: String,
    pub instance_id: Uuid,
    #[schema(value_type = Object)]
    pub variables: serde_json::Value,
    #[schema(value_type = Object)]
    pub custom_headers: serde_json::Value,
    pub retries: u32,
    pub deadline_ms: u64,
}

impl From<JobActivation> for JobActivationDto {
    fn from(a: JobActivation) -> Self {
        Self {
            job_key: a.job_key,
            job_type: a.job_type,
            element_id: a.element_id,
            instance_id: a.instance_id,
            variables: serde_json::to_value(a.variables).unwrap_or_default(),
            custom_headers: serde_json::to_value(a.custom_headers).unwrap_or_default(),
            retries: a.retries_remaining,
            deadline_ms: a.timeout_ms,
        }
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CompleteJobRequest {
    #[schema(value_type = Object)]
    pub variables: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JobOutcomeResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct FailJobRequest {
    /// Retries reported by the worker. The job manager owns authoritative
    /// retry bookkeeping (decremented server-side from the job's
    /// creation-time budget); this field is accepted for wire compatibility
    /// and used only to force an immediate incident when `0` is sent
    /// (resolved Open Question, see DESIGN.md).
    pub retries: u32,
    pub error_message: Option<String>,
    pub backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FailJobResponse {
    pub success: bool,
    pub incident_id: Option<Uuid>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/jobs/activate", post(activate_jobs))
        .route("/v1/jobs/:job_key/complete", post(complete_job))
        .route("/v1/jobs/:job_key/fail", post(fail_job))
        .route_layer(from_fn(require(state.auth.clone(), Permission::Job)))
        .with_state(state)
}

/// POST /v1/jobs/activate - long-poll activation, returned as a single
/// JSON array rather than a streamed sequence (§5's FIFO ordering still
/// applies within the returned batch).
#[utoipa::path(
    post,
    path = "/v1/jobs/activate",
    request_body = ActivateJobsRequest,
    responses((status = 200, description = "Activated jobs", body = [JobActivationDto])),
    tag = "job"
)]
pub async fn activate_jobs(State(state): State<AppState>, Json(req): Json<ActivateJobsRequest>) -> Result<Json<Vec<JobActivationDto>>, ApiError> {
    let activations = state
        .runtime
        .jobs
        .activate(&req.job_type, &req.worker, req.max_jobs, req.timeout_ms, &req.fetch_variables)
        .await?;
    Ok(Json(activations.into_iter().map(JobActivationDto::from).collect()))
}

/// POST /v1/jobs/{job_key}/complete
#[utoipa::path(
    post,
    path = "/v1/jobs/{job_key}/complete",
    params(("job_key" = String, Path, description = "Job key")),
    request_body = CompleteJobRequest,
    responses((status = 200, body = JobOutcomeResponse), (status = 404, description = "Job not found or expired")),
    tag = "job"
)]
pub async fn complete_job(State(state): State<AppState>, Path(job_key): Path<String>, Json(req): Json<CompleteJobRequest>) -> Result<Json<JobOutcomeResponse>, ApiError> {
    let variables = match req.variables {
        Some(v) => serde_json::from_value(v).map_err(|e| ApiError::bad_request(format!("invalid variables: {e}")))?,
        None => Default::default(),
    };
    state.runtime.engine.complete_job(&job_key, variables).await?;
    Ok(Json(JobOutcomeResponse { success: true }))
}

/// POST /v1/jobs/{job_key}/fail
#[utoipa::path(
    post,
    path = "/v1/jobs/{job_key}/fail",
    params(("job_key" = String, Path, description = "Job key")),
    request_body = FailJobRequest,
    responses((status = 200, body = FailJobResponse)),
    tag = "job"
)]
pub async fn fail_job(State(state): State<AppState>, Path(job_key): Path<String>, Json(req): Json<FailJobRequest>) -> Result<Json<FailJobResponse>, ApiError> {
    let backoff = req.backoff_ms.map(std::time::Duration::from_millis);
    let message = req.error_message.unwrap_or_else(|| "job reported failure".to_string());
    state.runtime.engine.fail_job(&job_key, &message, backoff).await?;

    let incident_id = state
        .runtime
        .incidents
        .list_open()
        .await?
        .into_iter()
        .filter(|i| i.context.get("job_key").and_then(|v| v.as_str()) == Some(job_key.as_str()))
        .map(|i| i.incident_id)
        .next();

    Ok(Json(FailJobResponse { success: true, incident_id }))
}
