//! Message publication (§6 "Publish message").

use axum::extract::State;
use axum::middleware::from_fn;
use axum::routing::post;
use axum::{Json, Router};
use bpmn_engine::auth::Permission;
use bpmn_engine::messaging::PublishRequest;
use bpmn_engine::store::TokenStore;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::auth::require;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PublishMessageRequest {
    pub name: String,
    #[serde(default)]
    pub correlation_key: String,
    pub tenant_id: Option<String>,
    #[schema(value_type = Object)]
    pub variables: Option<serde_json::Value>,
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PublishMessageResponse {
    pub message_id: Uuid,
    pub matched: bool,
    pub correlated_instances: Vec<Uuid>,
    pub started_instances: Vec<Uuid>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(publish_message))
        .route_layer(from_fn(require(state.auth.clone(), Permission::Message)))
        .with_state(state)
}

/// POST /v1/messages - publish a message, correlating it against waiting
/// intermediate catches or triggering message-start events.
#[utoipa::path(
    post,
    path = "/v1/messages",
    request_body = PublishMessageRequest,
    responses((status = 200, description = "Published", body = PublishMessageResponse)),
    tag = "message"
)]
pub async fn publish_message(State(state): State<AppState>, Json(req): Json<PublishMessageRequest>) -> Result<Json<PublishMessageResponse>, ApiError> {
    let variables = match req.variables {
        Some(v) => serde_json::from_value(v).map_err(|e| ApiError::bad_request(format!("invalid variables: {e}")))?,
        None => Default::default(),
    };
    let outcome = state
        .runtime
        .engine
        .publish_message(PublishRequest {
            name: req.name,
            correlation_key: req.correlation_key,
            tenant_id: req.tenant_id.unwrap_or_else(|| "default".to_string()),
            variables,
            ttl_seconds: req.ttl_seconds,
        })
        .await?;

    // `PublishOutcome` carries token ids, not instance ids; resolve each
    // woken token's owning instance for the wire contract's `correlated_instances`.
    let mut correlated_instances = Vec::with_capacity(outcome.woken_tokens.len());
    for token_id in &outcome.woken_tokens {
        if let Some(token) = state.runtime.store.load_token(*token_id).await? {
            correlated_instances.push(token.instance_id);
        }
    }

    Ok(Json(PublishMessageResponse {
        message_id: Uuid::now_v7(),
        matched: !correlated_instances.is_empty() || !outcome.started_instances.is_empty() || outcome.buffered,
        correlated_instances,
        started_instances: outcome.started_instances,
    }))
}
