use std::sync::Arc;

use bpmn_engine::auth::AuthGateway;
use bpmn_engine::Runtime;

/// Shared across every route handler; cheap to clone (two `Arc`s).
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
    pub auth: Arc<AuthGateway>,
}
