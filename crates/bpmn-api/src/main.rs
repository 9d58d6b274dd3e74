mod auth_config;
mod error;
mod middleware;
mod routes;
mod state;
mod telemetry;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::{Json, Router};
use bpmn_engine::auth::AuthGateway;
use bpmn_engine::{bootstrap, Config};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::routes::common::ListResponse;
use crate::routes::{incident, job, message, process, timer};
use crate::state::AppState;
use crate::telemetry::{init_telemetry, TelemetryConfig};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

#[derive(OpenApi)]
#[openapi(
    paths(
        process::start_instance,
        process::get_instance,
        process::cancel_instance,
        process::deploy_definition,
        message::publish_message,
        job::activate_jobs,
        job::complete_job,
        job::fail_job,
        timer::schedule_timer,
        timer::cancel_timer,
        incident::list_open_incidents,
        incident::list_instance_incidents,
        incident::resolve_incident,
    ),
    components(schemas(
        crate::error::ErrorResponse,
        process::StartProcessRequest,
        process::StartProcessResponse,
        process::InstanceView,
        process::InstanceStateDto,
        process::CancelInstanceRequest,
        message::PublishMessageRequest,
        message::PublishMessageResponse,
        job::ActivateJobsRequest,
        job::JobActivationDto,
        job::CompleteJobRequest,
        job::JobOutcomeResponse,
        job::FailJobRequest,
        job::FailJobResponse,
        timer::ScheduleTimerRequest,
        timer::ScheduleTimerResponse,
        incident::IncidentKindDto,
        incident::IncidentView,
        incident::ResolutionActionDto,
        incident::ResolveIncidentRequest,
        ListResponse<incident::IncidentView>,
    )),
    tags(
        (name = "process", description = "Process definition and instance lifecycle"),
        (name = "message", description = "Message correlation and start events"),
        (name = "job", description = "Service task job activation, completion, failure"),
        (name = "timer", description = "User-scheduled timers"),
        (name = "incident", description = "Incident listing and resolution"),
    ),
    info(
        title = "BPMN Workflow Engine API",
        version = env!("CARGO_PKG_VERSION"),
        description = "HTTP surface over the token-based BPMN execution engine.",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry_guard = init_telemetry(TelemetryConfig::from_env());
    tracing::info!("bpmn-api starting");

    let config = Config::from_env().context("loading configuration")?;
    let runtime = bootstrap(&config).await.context("bootstrapping engine runtime")?;
    let runtime = Arc::new(runtime);

    let (keys, global_allowlist) = auth_config::load_from_env();
    let auth = Arc::new(AuthGateway::new(runtime.store.clone(), keys, global_allowlist));

    let state = AppState { runtime: runtime.clone(), auth };

    // Timing wheel tick loop (§4.4) - fires elapsed timers and, on each tick
    // at the wheel's coarsest level, invokes the message sweeper.
    tokio::spawn(runtime.wheel.clone().run());

    // Buffered-message TTL sweep (§4.5), independent of the wheel's own
    // sweeper hook so expiry is bounded even if no timers are scheduled.
    {
        let messages = runtime.messages.clone();
        let interval = config.message_sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match messages.sweep_expired(chrono::Utc::now()).await {
                    Ok(n) if n > 0 => tracing::debug!(count = n, "swept expired buffered messages"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "message sweep failed"),
                }
            }
        });
    }

    // Reclaim ACTIVATED jobs whose worker never completed/failed them
    // before their lock expired (§4.6).
    {
        let jobs = runtime.jobs.clone();
        let interval = config.job_timeout_sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match jobs.reap_expired_locks().await {
                    Ok(n) if n > 0 => tracing::debug!(count = n, "reclaimed expired job locks"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "job lock reap failed"),
                }
            }
        });
    }

    let api_routes = Router::new()
        .merge(process::routes(state.clone()))
        .merge(message::routes(state.clone()))
        .merge(job::routes(state.clone()))
        .merge(timer::routes(state.clone()))
        .merge(incident::routes(state.clone()));

    let app = Router::new()
        .route("/health", get(health))
        .merge(api_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.http_bind_addr.parse().context("parsing BPMN_HTTP_BIND_ADDR")?;
    let listener = tokio::net::TcpListener::bind(addr).await.context("binding HTTP listener")?;
    tracing::info!(%addr, "HTTP server listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server error")?;

    Ok(())
}
