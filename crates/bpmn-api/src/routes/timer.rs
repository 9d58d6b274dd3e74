//! User-level timer scheduling (§6 "Schedule timer"). These live in their
//! own namespace (`usertimer/<id>`), separate from element-bound timers the
//! engine schedules internally — see DESIGN.md.

use axum::extract::{Path, State};
use axum::middleware::from_fn;
use axum::routing::post;
use axum::{Json, Router};
use bpmn_engine::auth::Permission;
use bpmn_engine::model::{CycleSpec, Timer, TimerKind, TimerState};
use bpmn_engine::timing::{parse_cycle, parse_date, parse_duration};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::auth::require;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ScheduleTimerRequest {
    /// Caller-chosen id. If it does not parse as a UUID, the server mints
    /// one and returns it instead.
    pub timer_id: Option<Uuid>,
    /// An ISO-8601 duration (`PT30S`), date (`2026-01-01T00:00:00Z`), or
    /// cycle (`R5/PT30S`).
    pub duration: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScheduleTimerResponse {
    pub timer_id: Uuid,
    pub status: &'static str,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/timers", post(schedule_timer))
        .route("/v1/timers/:timer_id", axum::routing::delete(cancel_timer))
        .route_layer(from_fn(require(state.auth.clone(), Permission::Timer)))
        .with_state(state)
}

/// POST /v1/timers - schedule a user-level timer.
#[utoipa::path(
    post,
    path = "/v1/timers",
    request_body = ScheduleTimerRequest,
    responses((status = 200, body = ScheduleTimerResponse), (status = 400, description = "Invalid ISO-8601 expression")),
    tag = "timer"
)]
pub async fn schedule_timer(State(state): State<AppState>, Json(req): Json<ScheduleTimerRequest>) -> Result<Json<ScheduleTimerResponse>, ApiError> {
    let timer_id = req.timer_id.unwrap_or_else(Uuid::now_v7);
    let (kind, fire_at, cycle) = resolve_expression(&req.duration)?;

    let timer = Timer {
        timer_id,
        kind,
        fire_at,
        cycle,
        element_id: None,
        token_id: None,
        instance_id: None,
        state: TimerState::Scheduled,
        wheel_level: 0,
        wheel_slot: 0,
        user_namespace: true,
        created_at: Utc::now(),
    };
    state.runtime.wheel.schedule(timer).await?;
    Ok(Json(ScheduleTimerResponse { timer_id, status: "scheduled" }))
}

/// DELETE /v1/timers/{timer_id} - cancel a scheduled user-level timer.
#[utoipa::path(
    delete,
    path = "/v1/timers/{timer_id}",
    params(("timer_id" = Uuid, Path, description = "Timer id")),
    responses((status = 204, description = "Cancelled"), (status = 404, description = "Timer not found")),
    tag = "timer"
)]
pub async fn cancel_timer(State(state): State<AppState>, Path(timer_id): Path<Uuid>) -> Result<(), ApiError> {
    state.runtime.wheel.cancel(timer_id).await?;
    Ok(())
}

fn resolve_expression(expr: &str) -> Result<(TimerKind, chrono::DateTime<Utc>, Option<CycleSpec>), ApiError> {
    if let Some(stripped) = expr.strip_prefix('R') {
        let _ = stripped;
        let (remaining, interval) = parse_cycle(expr).map_err(|e| ApiError::bad_request(e.to_string()))?;
        let fire_at = Utc::now() + interval;
        return Ok((TimerKind::Cycle, fire_at, Some(CycleSpec { interval_seconds: interval.num_seconds(), remaining_iterations: remaining })));
    }
    if expr.starts_with('P') {
        let duration = parse_duration(expr).map_err(|e| ApiError::bad_request(e.to_string()))?;
        return Ok((TimerKind::Duration, Utc::now() + duration, None));
    }
    let fire_at = parse_date(expr).map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok((TimerKind::Date, fire_at, None))
}
