//! Incident Manager (C8): raise, list, resolve, plus a per-job-type circuit
//! breaker that gates new activation (§4.7).

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::EngineError;
use crate::model::{Incident, IncidentKind, IncidentResolution, IncidentState, ResolutionAction, RuntimeEvent, VariableMap};
use crate::store::{StoreTransaction, TokenStore};

/// Well-known context key carrying the originating job's key for
/// `JOB_FAILURE` incidents, since `Incident` otherwise has no job reference.
pub const CONTEXT_JOB_KEY: &str = "job_key";

#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    /// Re-submit the job: the caller should set it CREATED with `new_retries`.
    RetryJob { job_key: String, new_retries: u32 },
    /// Re-execute the failing step (timer/expression/message errors).
    RetryStep { token_id: Uuid, element_id: String },
    /// No retry; the caller should cancel the token unless overridden.
    Dismissed { token_id: Option<Uuid> },
}

pub struct IncidentManager {
    store: Arc<dyn TokenStore>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    breaker_config: CircuitBreakerConfig,
}

impl IncidentManager {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store, breakers: DashMap::new(), breaker_config: CircuitBreakerConfig::default() }
    }

    pub fn with_breaker_config(store: Arc<dyn TokenStore>, config: CircuitBreakerConfig) -> Self {
        Self { store, breakers: DashMap::new(), breaker_config: config }
    }

    pub async fn raise(
        &self,
        kind: IncidentKind,
        token_id: Option<Uuid>,
        element_id: &str,
        instance_id: Uuid,
        message: &str,
        context: VariableMap,
    ) -> Result<Incident, EngineError> {
        if kind == IncidentKind::JobFailure {
            if let Some(job_type) = context.get("job_type").and_then(|v| v.as_str()) {
                self.record_job_outcome(job_type, false);
            }
        }

        let incident = Incident {
            incident_id: Uuid::now_v7(),
            kind,
            token_id,
            element_id: element_id.to_string(),
            instance_id,
            message: message.to_string(),
            context,
            created_at: Utc::now(),
            state: IncidentState::Open,
            resolution: None,
        };
        let tx = StoreTransaction::new()
            .put_incident(incident.clone())
            .append_event(instance_id, RuntimeEvent::IncidentCreated { incident_id: incident.incident_id, kind });
        self.store.commit(tx).await?;
        Ok(incident)
    }

    pub async fn list_for_instance(&self, instance_id: Uuid) -> Result<Vec<Incident>, EngineError> {
        Ok(self.store.list_incidents_by_instance(instance_id).await?)
    }

    pub async fn list_open(&self) -> Result<Vec<Incident>, EngineError> {
        Ok(self.store.list_open_incidents().await?)
    }

    pub async fn resolve(
        &self,
        incident_id: Uuid,
        action: ResolutionAction,
        resolver: &str,
        comment: Option<String>,
        new_retries: Option<u32>,
    ) -> Result<ResolveOutcome, EngineError> {
        let mut incident = self
            .store
            .load_incident(incident_id)
            .await?
            .ok_or_else(|| EngineError::Internal(format!("incident not found: {incident_id}")))?;
        if incident.state != IncidentState::Open {
            return Err(EngineError::Internal(format!("incident {incident_id} is already resolved")));
        }

        incident.resolution = Some(IncidentResolution { action, resolver: resolver.to_string(), comment, new_retries, resolved_at: Utc::now() });
        incident.state = IncidentState::Resolved;

        let tx = StoreTransaction::new()
            .put_incident(incident.clone())
            .append_event(incident.instance_id, RuntimeEvent::IncidentResolved { incident_id, action });
        self.store.commit(tx).await?;

        Ok(match action {
            ResolutionAction::Retry => match incident.kind {
                IncidentKind::JobFailure => {
                    let job_key = incident
                        .context
                        .get(CONTEXT_JOB_KEY)
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| EngineError::Internal("job failure incident missing job_key in context".into()))?
                        .to_string();
                    ResolveOutcome::RetryJob { job_key, new_retries: new_retries.unwrap_or(1) }
                }
                _ => {
                    let token_id = incident
                        .token_id
                        .ok_or_else(|| EngineError::Internal("incident missing token_id for retry".into()))?;
                    ResolveOutcome::RetryStep { token_id, element_id: incident.element_id.clone() }
                }
            },
            ResolutionAction::Dismiss => ResolveOutcome::Dismissed { token_id: incident.token_id },
        })
    }

    /// §4.7 "Failure-rate circuit breaking": feed job outcomes in, consult
    /// before activating new jobs of that type.
    pub fn record_job_outcome(&self, job_type: &str, success: bool) {
        let breaker = self.breaker_for(job_type);
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }

    pub fn should_admit_activation(&self, job_type: &str) -> bool {
        self.breaker_for(job_type).allow_request()
    }

    pub fn circuit_state(&self, job_type: &str) -> CircuitState {
        self.breaker_for(job_type).state()
    }

    fn breaker_for(&self, job_type: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(job_type.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.breaker_config.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    fn manager() -> (IncidentManager, Arc<dyn TokenStore>) {
        let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
        (IncidentManager::new(store.clone()), store)
    }

    #[tokio::test]
    async fn raise_persists_an_open_incident() {
        let (mgr, _store) = manager();
        let instance_id = Uuid::now_v7();
        let incident = mgr
            .raise(IncidentKind::JobFailure, Some(Uuid::now_v7()), "task1", instance_id, "boom", BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(incident.state, IncidentState::Open);

        let open = mgr.list_open().await.unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn resolve_retry_on_job_failure_returns_job_key_from_context() {
        let (mgr, _store) = manager();
        let instance_id = Uuid::now_v7();
        let context = BTreeMap::from([(CONTEXT_JOB_KEY.to_string(), serde_json::json!("job-123"))]);
        let incident = mgr.raise(IncidentKind::JobFailure, None, "task1", instance_id, "boom", context).await.unwrap();

        let outcome = mgr.resolve(incident.incident_id, ResolutionAction::Retry, "ops", None, Some(3)).await.unwrap();
        match outcome {
            ResolveOutcome::RetryJob { job_key, new_retries } => {
                assert_eq!(job_key, "job-123");
                assert_eq!(new_retries, 3);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_dismiss_returns_token_for_cancellation() {
        let (mgr, _store) = manager();
        let token_id = Uuid::now_v7();
        let incident = mgr
            .raise(IncidentKind::TimerError, Some(token_id), "timer1", Uuid::now_v7(), "bad expr", BTreeMap::new())
            .await
            .unwrap();

        let outcome = mgr.resolve(incident.incident_id, ResolutionAction::Dismiss, "ops", None, None).await.unwrap();
        assert!(matches!(outcome, ResolveOutcome::Dismissed { token_id: Some(t) } if t == token_id));
    }

    #[tokio::test]
    async fn circuit_breaker_gates_activation_after_repeated_job_failures() {
        let (mgr, _store) = manager();
        assert!(mgr.should_admit_activation("flaky_type"));
        for _ in 0..5 {
            mgr.record_job_outcome("flaky_type", false);
        }
        assert!(!mgr.should_admit_activation("flaky_type"));
    }
}
