//! Job Manager (C7): lifecycle, activation, completion, failure, business
//! errors, and stale-lock reclamation (§4.6).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::backoff::RetryPolicy;
use super::backpressure::BackpressureGate;
use crate::error::JobError;
use crate::model::{Job, JobState, RuntimeEvent, VariableMap};
use crate::store::{JobActivationFilter, StoreTransaction, TokenStore};

/// A job handed to a worker by [`JobManager::activate`], with variables
/// projected down to the fields the worker asked for.
#[derive(Debug, Clone)]
pub struct JobActivation {
    pub job_key: String,
    pub job_type: String,
    pub element_id: String,
    pub instance_id: Uuid,
    pub token_id: Uuid,
    pub variables: VariableMap,
    pub custom_headers: VariableMap,
    pub retries_remaining: u32,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub enum CompleteOutcome {
    Completed { token_id: Uuid, instance_id: Uuid, element_id: String },
}

#[derive(Debug, Clone)]
pub enum FailOutcome {
    Retrying { retries_remaining: u32, backoff_until: DateTime<Utc> },
    IncidentRequired { token_id: Uuid, instance_id: Uuid, element_id: String, message: String },
}

#[derive(Debug, Clone)]
pub struct ThrowErrorOutcome {
    pub token_id: Uuid,
    pub instance_id: Uuid,
    pub element_id: String,
    pub error_code: String,
    pub error_message: String,
    pub variables: VariableMap,
}

pub struct JobManager {
    store: Arc<dyn TokenStore>,
    backpressure: BackpressureGate,
    retry_policies: DashMap<String, RetryPolicy>,
    default_retry_policy: RetryPolicy,
}

impl JobManager {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self {
            store,
            backpressure: BackpressureGate::default(),
            retry_policies: DashMap::new(),
            default_retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_backpressure(store: Arc<dyn TokenStore>, low_watermark: u32, high_watermark: u32) -> Self {
        Self {
            store,
            backpressure: BackpressureGate::new(low_watermark, high_watermark),
            retry_policies: DashMap::new(),
            default_retry_policy: RetryPolicy::default(),
        }
    }

    pub fn set_retry_policy(&self, job_type: impl Into<String>, policy: RetryPolicy) {
        self.retry_policies.insert(job_type.into(), policy);
    }

    fn retry_policy_for(&self, job_type: &str) -> RetryPolicy {
        self.retry_policies
            .get(job_type)
            .map(|p| p.clone())
            .unwrap_or_else(|| self.default_retry_policy.clone())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_job(
        &self,
        job_type: impl Into<String>,
        element_id: impl Into<String>,
        instance_id: Uuid,
        token_id: Uuid,
        variables: VariableMap,
        custom_headers: VariableMap,
        retries: u32,
        timeout_ms: u64,
    ) -> Result<Job, JobError> {
        let job = Job {
            job_key: Uuid::now_v7().to_string(),
            job_type: job_type.into(),
            element_id: element_id.into(),
            instance_id,
            token_id,
            variables,
            custom_headers,
            retries_remaining: retries,
            state: JobState::Created,
            worker_id: None,
            lock_expires_at: None,
            timeout_ms,
            created_at: Utc::now(),
            backoff_until: None,
        };
        let tx = StoreTransaction::new().put_job(job.clone()).append_event(
            instance_id,
            RuntimeEvent::JobCreated { job_key: job.job_key.clone(), job_type: job.job_type.clone() },
        );
        self.store.commit(tx).await?;
        Ok(job)
    }

    /// §4.6 "Activation": FIFO selection by `created_at`, ties by `job_key`,
    /// rate-shaped by the backpressure gate.
    pub async fn activate(
        &self,
        job_type: &str,
        worker_id: &str,
        max_jobs: u32,
        timeout_ms: u64,
        fetch_variables: &[String],
    ) -> Result<Vec<JobActivation>, JobError> {
        let admitted = self.backpressure.admit(max_jobs);
        if admitted == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let candidates = self
            .store
            .list_jobs_for_activation(&JobActivationFilter { job_type: job_type.to_string(), now: Some(now) })
            .await?;
        let selected: Vec<Job> = candidates.into_iter().take(admitted as usize).collect();

        let unused = admitted - selected.len() as u32;
        if unused > 0 {
            self.backpressure.release(unused);
        }
        if selected.is_empty() {
            return Ok(Vec::new());
        }

        let lock_expires_at = now + chrono::Duration::milliseconds(timeout_ms as i64);
        let mut tx = StoreTransaction::new();
        let mut activations = Vec::with_capacity(selected.len());

        for mut job in selected {
            job.state = JobState::Activated;
            job.worker_id = Some(worker_id.to_string());
            job.lock_expires_at = Some(lock_expires_at);
            job.timeout_ms = timeout_ms;

            activations.push(JobActivation {
                job_key: job.job_key.clone(),
                job_type: job.job_type.clone(),
                element_id: job.element_id.clone(),
                instance_id: job.instance_id,
                token_id: job.token_id,
                variables: project_variables(&job.variables, fetch_variables),
                custom_headers: job.custom_headers.clone(),
                retries_remaining: job.retries_remaining,
                timeout_ms,
            });
            tx = tx.put_job(job);
        }

        self.store.commit(tx).await?;
        Ok(activations)
    }

    /// §4.6 "Completion".
    pub async fn complete(&self, job_key: &str, variables: VariableMap) -> Result<CompleteOutcome, JobError> {
        let job = self.load_active_job(job_key).await?;

        let mut instance = self
            .store
            .load_instance(job.instance_id)
            .await?
            .ok_or_else(|| JobError::NotFoundOrExpired(job_key.to_string()))?;
        for (k, v) in variables {
            instance.variables.insert(k, v);
        }
        instance.updated_at = Utc::now();

        let tx = StoreTransaction::new()
            .put_instance(instance)
            .delete_job(job_key)
            .append_event(job.instance_id, RuntimeEvent::JobCompleted { job_key: job_key.to_string() });
        self.store.commit(tx).await?;
        self.backpressure.release(1);

        Ok(CompleteOutcome::Completed { token_id: job.token_id, instance_id: job.instance_id, element_id: job.element_id })
    }

    /// §4.6 "Failure".
    pub async fn fail(&self, job_key: &str, error_message: &str, backoff: Option<StdDuration>) -> Result<FailOutcome, JobError> {
        let job = self.load_active_job(job_key).await?;
        let retries_remaining = job.retries_remaining.saturating_sub(1);

        if retries_remaining > 0 {
            let delay = backoff.unwrap_or_else(|| self.retry_policy_for(&job.job_type).delay_for_attempt(job.retries_remaining));
            let mut retried = job.clone();
            retried.state = JobState::Created;
            retried.retries_remaining = retries_remaining;
            retried.backoff_until = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
            retried.worker_id = None;
            retried.lock_expires_at = None;

            let backoff_until = retried.backoff_until.unwrap();
            let tx = StoreTransaction::new().put_job(retried).append_event(
                job.instance_id,
                RuntimeEvent::JobFailed { job_key: job_key.to_string(), retries_remaining },
            );
            self.store.commit(tx).await?;
            self.backpressure.release(1);
            Ok(FailOutcome::Retrying { retries_remaining, backoff_until })
        } else {
            let mut terminal = job.clone();
            terminal.state = JobState::Failed;
            terminal.retries_remaining = 0;
            let tx = StoreTransaction::new().put_job(terminal).append_event(
                job.instance_id,
                RuntimeEvent::JobFailed { job_key: job_key.to_string(), retries_remaining: 0 },
            );
            self.store.commit(tx).await?;
            self.backpressure.release(1);
            Ok(FailOutcome::IncidentRequired {
                token_id: job.token_id,
                instance_id: job.instance_id,
                element_id: job.element_id,
                message: error_message.to_string(),
            })
        }
    }

    /// §4.6 "Business error". Boundary-event resolution happens upstream in
    /// the execution engine, which has the process graph; the job manager
    /// only retires the job and hands back what's needed to search for one.
    pub async fn throw_error(
        &self,
        job_key: &str,
        error_code: &str,
        error_message: &str,
        variables: VariableMap,
    ) -> Result<ThrowErrorOutcome, JobError> {
        let job = self.load_active_job(job_key).await?;
        let mut terminal = job.clone();
        terminal.state = JobState::ErrorThrown;

        let tx = StoreTransaction::new().put_job(terminal);
        self.store.commit(tx).await?;
        self.backpressure.release(1);

        Ok(ThrowErrorOutcome {
            token_id: job.token_id,
            instance_id: job.instance_id,
            element_id: job.element_id,
            error_code: error_code.to_string(),
            error_message: error_message.to_string(),
            variables,
        })
    }

    /// §4.6 "Timeout reaper": reclaim ACTIVATED jobs whose lock expired.
    /// Activation is therefore at-least-once; workers must be idempotent.
    pub async fn reap_expired_locks(&self) -> Result<usize, JobError> {
        let now = Utc::now();
        let expired = self.store.list_activated_jobs_with_expired_lock(now).await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let mut tx = StoreTransaction::new();
        let reclaimed = expired.len();
        for mut job in expired {
            job.state = JobState::Created;
            job.worker_id = None;
            job.lock_expires_at = None;
            tx = tx.put_job(job);
        }
        self.store.commit(tx).await?;
        self.backpressure.release(reclaimed as u32);
        Ok(reclaimed)
    }

    async fn load_active_job(&self, job_key: &str) -> Result<Job, JobError> {
        let job = self
            .store
            .load_job(job_key)
            .await?
            .ok_or_else(|| JobError::NotFoundOrExpired(job_key.to_string()))?;
        if job.state != JobState::Activated || job.is_lock_expired(Utc::now()) {
            return Err(JobError::NotFoundOrExpired(job_key.to_string()));
        }
        Ok(job)
    }
}

fn project_variables(variables: &VariableMap, fetch: &[String]) -> VariableMap {
    if fetch.is_empty() {
        return variables.clone();
    }
    variables
        .iter()
        .filter(|(k, _)| fetch.iter().any(|f| f == *k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    async fn setup() -> (JobManager, Arc<dyn TokenStore>, Uuid, Uuid) {
        let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
        let manager = JobManager::new(store.clone());
        let instance = crate::model::ProcessInstance::new("p".into(), 1, "t1".into(), BTreeMap::new());
        store.save_instance(&instance).await.unwrap();
        let token_id = Uuid::now_v7();
        (manager, store, instance.instance_id, token_id)
    }

    #[tokio::test]
    async fn activate_respects_fifo_and_variable_projection() {
        let (manager, _store, instance_id, token_id) = setup().await;
        manager
            .create_job(
                "send_email",
                "task1",
                instance_id,
                token_id,
                BTreeMap::from([("to".to_string(), serde_json::json!("a@b.com")), ("cc".to_string(), serde_json::json!("x"))]),
                BTreeMap::new(),
                3,
                5000,
            )
            .await
            .unwrap();

        let activations = manager.activate("send_email", "worker-1", 10, 30_000, &["to".to_string()]).await.unwrap();
        assert_eq!(activations.len(), 1);
        assert_eq!(activations[0].variables.len(), 1);
        assert!(activations[0].variables.contains_key("to"));
    }

    #[tokio::test]
    async fn complete_merges_variables_and_deletes_the_job() {
        let (manager, store, instance_id, token_id) = setup().await;
        let job = manager.create_job("t", "task1", instance_id, token_id, BTreeMap::new(), BTreeMap::new(), 3, 5000).await.unwrap();
        manager.activate("t", "w1", 1, 30_000, &[]).await.unwrap();

        let outcome = manager
            .complete(&job.job_key, BTreeMap::from([("result".to_string(), serde_json::json!(42))]))
            .await
            .unwrap();
        match outcome {
            CompleteOutcome::Completed { token_id: t, .. } => assert_eq!(t, token_id),
        }
        assert!(store.load_job(&job.job_key).await.unwrap().is_none());
        let instance = store.load_instance(instance_id).await.unwrap().unwrap();
        assert_eq!(instance.variables.get("result"), Some(&serde_json::json!(42)));
    }

    #[tokio::test]
    async fn fail_with_remaining_retries_reschedules_with_backoff() {
        let (manager, store, instance_id, token_id) = setup().await;
        let job = manager.create_job("t", "task1", instance_id, token_id, BTreeMap::new(), BTreeMap::new(), 2, 5000).await.unwrap();
        manager.activate("t", "w1", 1, 30_000, &[]).await.unwrap();

        let outcome = manager.fail(&job.job_key, "boom", Some(StdDuration::from_secs(5))).await.unwrap();
        match outcome {
            FailOutcome::Retrying { retries_remaining, .. } => assert_eq!(retries_remaining, 1),
            FailOutcome::IncidentRequired { .. } => panic!("expected retry"),
        }
        let reloaded = store.load_job(&job.job_key).await.unwrap().unwrap();
        assert_eq!(reloaded.state, JobState::Created);
        assert!(reloaded.backoff_until.is_some());
    }

    #[tokio::test]
    async fn fail_with_no_retries_left_requires_an_incident() {
        let (manager, _store, instance_id, token_id) = setup().await;
        let job = manager.create_job("t", "task1", instance_id, token_id, BTreeMap::new(), BTreeMap::new(), 1, 5000).await.unwrap();
        manager.activate("t", "w1", 1, 30_000, &[]).await.unwrap();

        let outcome = manager.fail(&job.job_key, "boom", None).await.unwrap();
        assert!(matches!(outcome, FailOutcome::IncidentRequired { .. }));
    }

    #[tokio::test]
    async fn reaper_reclaims_jobs_with_expired_locks() {
        let (manager, store, instance_id, token_id) = setup().await;
        let job = manager.create_job("t", "task1", instance_id, token_id, BTreeMap::new(), BTreeMap::new(), 3, 1).await.unwrap();
        manager.activate("t", "w1", 1, 1, &[]).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        let reclaimed = manager.reap_expired_locks().await.unwrap();
        assert_eq!(reclaimed, 1);

        let reloaded = store.load_job(&job.job_key).await.unwrap().unwrap();
        assert_eq!(reloaded.state, JobState::Created);
        assert!(reloaded.worker_id.is_none());
    }

    #[tokio::test]
    async fn backpressure_limits_concurrent_activation_across_calls() {
        let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
        let manager = JobManager::with_backpressure(store.clone(), 1, 2);
        let instance = crate::model::ProcessInstance::new("p".into(), 1, "t1".into(), BTreeMap::new());
        store.save_instance(&instance).await.unwrap();

        for _ in 0..5 {
            manager.create_job("t", "task1", instance.instance_id, Uuid::now_v7(), BTreeMap::new(), BTreeMap::new(), 3, 5000).await.unwrap();
        }

        let first = manager.activate("t", "w1", 10, 30_000, &[]).await.unwrap();
        assert_eq!(first.len(), 2);
        let second = manager.activate("t", "w1", 10, 30_000, &[]).await.unwrap();
        assert!(second.is_empty());
    }
}
