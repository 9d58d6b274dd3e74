//! In-memory `TokenStore`, the default backend for tests and local runs.
//! Holds every entity in native collections behind a single lock so
//! `commit` is trivially atomic — mirrors the teacher's `Inner`-behind-one-
//! `RwLock` shape, generalized to this crate's entity set.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{EntityOp, JobActivationFilter, StoreTransaction, TokenStore};
use crate::error::StoreError;
use crate::model::{
    BufferedMessage, Incident, IncidentState, Job, JobState, MessageSubscription, ProcessInstance,
    RateCounter, RuntimeEvent, Timer, TimerState, Token, TokenState,
};

#[derive(Default)]
struct Inner {
    instances: HashMap<Uuid, ProcessInstance>,
    tokens: HashMap<Uuid, Token>,
    timers: HashMap<Uuid, Timer>,
    jobs: HashMap<String, Job>,
    subscriptions: HashMap<Uuid, MessageSubscription>,
    buffered: HashMap<Uuid, BufferedMessage>,
    incidents: HashMap<Uuid, Incident>,
    rate_counters: HashMap<String, RateCounter>,
    /// Per-instance append-only audit log, in arrival order.
    events: HashMap<Uuid, Vec<(u64, RuntimeEvent)>>,
}

pub struct MemoryStore {
    inner: parking_lot::RwLock<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: parking_lot::RwLock::new(Inner::default()),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn save_instance(&self, instance: &ProcessInstance) -> Result<(), StoreError> {
        self.inner.write().instances.insert(instance.instance_id, instance.clone());
        Ok(())
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>, StoreError> {
        Ok(self.inner.read().instances.get(&id).cloned())
    }

    async fn load_token(&self, id: Uuid) -> Result<Option<Token>, StoreError> {
        Ok(self.inner.read().tokens.get(&id).cloned())
    }

    async fn list_tokens_by_instance(&self, instance_id: Uuid) -> Result<Vec<Token>, StoreError> {
        Ok(self
            .inner
            .read()
            .tokens
            .values()
            .filter(|t| t.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn list_tokens_by_state(&self, instance_id: Uuid, state: TokenState) -> Result<Vec<Token>, StoreError> {
        Ok(self
            .inner
            .read()
            .tokens
            .values()
            .filter(|t| t.instance_id == instance_id && t.state == state)
            .cloned()
            .collect())
    }

    async fn find_token_by_waiting_tag(&self, tag: &str) -> Result<Option<Token>, StoreError> {
        Ok(self
            .inner
            .read()
            .tokens
            .values()
            .find(|t| t.waiting_for.as_ref().map(|w| w.tag()) == Some(tag.to_string()))
            .cloned())
    }

    async fn load_timer(&self, id: Uuid) -> Result<Option<Timer>, StoreError> {
        Ok(self.inner.read().timers.get(&id).cloned())
    }

    async fn list_scheduled_timers(&self) -> Result<Vec<Timer>, StoreError> {
        Ok(self
            .inner
            .read()
            .timers
            .values()
            .filter(|t| t.state == TimerState::Scheduled)
            .cloned()
            .collect())
    }

    async fn load_job(&self, job_key: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.inner.read().jobs.get(job_key).cloned())
    }

    async fn list_jobs_for_activation(&self, filter: &JobActivationFilter) -> Result<Vec<Job>, StoreError> {
        let now = filter.now.unwrap_or_else(Utc::now);
        let guard = self.inner.read();
        let mut candidates: Vec<&Job> = guard
            .jobs
            .values()
            .filter(|j| {
                j.job_type == filter.job_type
                    && j.state == JobState::Created
                    && j.backoff_until.map(|b| b <= now).unwrap_or(true)
            })
            .collect();
        // FIFO by created_at, ties broken by job_key (§4.6 activation ordering).
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.job_key.cmp(&b.job_key)));
        Ok(candidates.into_iter().cloned().collect())
    }

    async fn list_jobs_by_instance(&self, instance_id: Uuid) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .inner
            .read()
            .jobs
            .values()
            .filter(|j| j.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn list_activated_jobs_with_expired_lock(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .inner
            .read()
            .jobs
            .values()
            .filter(|j| j.state == JobState::Activated && j.is_lock_expired(now))
            .cloned()
            .collect())
    }

    async fn load_subscription(&self, id: Uuid) -> Result<Option<MessageSubscription>, StoreError> {
        Ok(self.inner.read().subscriptions.get(&id).cloned())
    }

    async fn find_subscriptions(&self, tenant_id: &str, message_name: &str) -> Result<Vec<MessageSubscription>, StoreError> {
        Ok(self
            .inner
            .read()
            .subscriptions
            .values()
            .filter(|s| s.active && s.tenant_id == tenant_id && s.message_name == message_name)
            .cloned()
            .collect())
    }

    async fn find_buffered_message(
        &self,
        tenant_id: &str,
        name: &str,
        correlation_key: &str,
    ) -> Result<Option<BufferedMessage>, StoreError> {
        let now = Utc::now();
        Ok(self
            .inner
            .read()
            .buffered
            .values()
            .find(|m| {
                m.tenant_id == tenant_id
                    && m.name == name
                    && m.correlation_key == correlation_key
                    && !m.is_expired(now)
            })
            .cloned())
    }

    async fn list_expired_buffered_messages(&self, now: DateTime<Utc>) -> Result<Vec<BufferedMessage>, StoreError> {
        Ok(self
            .inner
            .read()
            .buffered
            .values()
            .filter(|m| m.is_expired(now))
            .cloned()
            .collect())
    }

    async fn load_incident(&self, id: Uuid) -> Result<Option<Incident>, StoreError> {
        Ok(self.inner.read().incidents.get(&id).cloned())
    }

    async fn list_incidents_by_instance(&self, instance_id: Uuid) -> Result<Vec<Incident>, StoreError> {
        Ok(self
            .inner
            .read()
            .incidents
            .values()
            .filter(|i| i.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn list_open_incidents(&self) -> Result<Vec<Incident>, StoreError> {
        Ok(self
            .inner
            .read()
            .incidents
            .values()
            .filter(|i| i.state == IncidentState::Open)
            .cloned()
            .collect())
    }

    async fn load_rate_counter(&self, identifier: &str) -> Result<Option<RateCounter>, StoreError> {
        Ok(self.inner.read().rate_counters.get(identifier).cloned())
    }

    async fn read_events(&self, instance_id: Uuid, from_seq: u64) -> Result<Vec<(u64, RuntimeEvent)>, StoreError> {
        Ok(self
            .inner
            .read()
            .events
            .get(&instance_id)
            .map(|log| log.iter().filter(|(seq, _)| *seq >= from_seq).cloned().collect())
            .unwrap_or_default())
    }

    async fn commit(&self, tx: StoreTransaction) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        for op in tx.ops {
            match op {
                EntityOp::PutInstance(instance) => {
                    guard.instances.insert(instance.instance_id, instance);
                }
                EntityOp::PutToken(token) => {
                    guard.tokens.insert(token.token_id, token);
                }
                EntityOp::PutTimer(timer) => {
                    guard.timers.insert(timer.timer_id, timer);
                }
                EntityOp::DeleteTimer(id) => {
                    guard.timers.remove(&id);
                }
                EntityOp::PutJob(job) => {
                    guard.jobs.insert(job.job_key.clone(), job);
                }
                EntityOp::DeleteJob(key) => {
                    guard.jobs.remove(&key);
                }
                EntityOp::PutSubscription(sub) => {
                    guard.subscriptions.insert(sub.subscription_id, sub);
                }
                EntityOp::DeleteSubscription(id) => {
                    guard.subscriptions.remove(&id);
                }
                EntityOp::PutBufferedMessage(msg) => {
                    guard.buffered.insert(msg.message_id, msg);
                }
                EntityOp::DeleteBufferedMessage(id) => {
                    guard.buffered.remove(&id);
                }
                EntityOp::PutIncident(incident) => {
                    guard.incidents.insert(incident.incident_id, incident);
                }
                EntityOp::PutRateCounter(counter) => {
                    guard.rate_counters.insert(counter.identifier.clone(), counter);
                }
                EntityOp::AppendEvent { instance_id, event } => {
                    let log = guard.events.entry(instance_id).or_default();
                    let seq = log.last().map(|(s, _)| s + 1).unwrap_or(0);
                    log.push((seq, event));
                }
            }
        }
        Ok(())
    }

    async fn cancel_companions_for_instance(&self, instance_id: Uuid) -> Result<Vec<String>, StoreError> {
        let mut guard = self.inner.write();
        let mut cancelled_jobs = Vec::new();

        for job in guard.jobs.values_mut() {
            if job.instance_id == instance_id && !matches!(job.state, JobState::Completed | JobState::Cancelled) {
                job.state = JobState::Cancelled;
                cancelled_jobs.push(job.job_key.clone());
            }
        }

        let timer_ids: Vec<Uuid> = guard
            .timers
            .values()
            .filter(|t| t.instance_id == Some(instance_id) && t.state == TimerState::Scheduled)
            .map(|t| t.timer_id)
            .collect();
        for id in timer_ids {
            if let Some(timer) = guard.timers.get_mut(&id) {
                timer.state = TimerState::Cancelled;
            }
        }

        let sub_ids: Vec<Uuid> = guard
            .subscriptions
            .values()
            .filter(|s| {
                s.active
                    && s.token_id
                        .and_then(|tid| guard.tokens.get(&tid))
                        .map(|t| t.instance_id == instance_id)
                        .unwrap_or(false)
            })
            .map(|s| s.subscription_id)
            .collect();
        for id in sub_ids {
            if let Some(sub) = guard.subscriptions.get_mut(&id) {
                sub.active = false;
            }
        }

        Ok(cancelled_jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstanceState, WaitingFor};
    use std::collections::BTreeMap;

    fn sample_instance() -> ProcessInstance {
        ProcessInstance::new("order".into(), 1, "default".into(), BTreeMap::new())
    }

    #[tokio::test]
    async fn instance_round_trips() {
        let store = MemoryStore::new();
        let instance = sample_instance();
        store.save_instance(&instance).await.unwrap();

        let loaded = store.load_instance(instance.instance_id).await.unwrap().unwrap();
        assert_eq!(loaded.instance_id, instance.instance_id);
        assert_eq!(loaded.state, InstanceState::Active);
    }

    #[tokio::test]
    async fn commit_applies_every_op_atomically() {
        let store = MemoryStore::new();
        let instance = sample_instance();
        let mut token = Token::spawn(instance.instance_id, "start", None);
        token.waiting_for = Some(WaitingFor::Job("job-1".into()));

        let tx = StoreTransaction::new().put_instance(instance.clone()).put_token(token.clone());
        store.commit(tx).await.unwrap();

        assert!(store.load_instance(instance.instance_id).await.unwrap().is_some());
        let found = store.find_token_by_waiting_tag("job:job-1").await.unwrap().unwrap();
        assert_eq!(found.token_id, token.token_id);
    }

    #[tokio::test]
    async fn job_activation_is_fifo_by_created_at_then_job_key() {
        let store = MemoryStore::new();
        let instance = sample_instance();
        store.save_instance(&instance).await.unwrap();

        let mut jobs = Vec::new();
        let base = Utc::now() - chrono::Duration::seconds(10);
        for (i, key) in ["c", "a", "b"].iter().enumerate() {
            jobs.push(Job {
                job_key: key.to_string(),
                job_type: "send_email".into(),
                element_id: "task1".into(),
                instance_id: instance.instance_id,
                token_id: Uuid::now_v7(),
                variables: BTreeMap::new(),
                custom_headers: BTreeMap::new(),
                retries_remaining: 3,
                state: JobState::Created,
                worker_id: None,
                lock_expires_at: None,
                timeout_ms: 5000,
                created_at: base + chrono::Duration::seconds(i as i64),
                backoff_until: None,
            });
        }

        let mut tx = StoreTransaction::new();
        for job in jobs {
            tx = tx.put_job(job);
        }
        store.commit(tx).await.unwrap();

        let filter = JobActivationFilter { job_type: "send_email".into(), now: None };
        let activatable = store.list_jobs_for_activation(&filter).await.unwrap();
        let keys: Vec<_> = activatable.iter().map(|j| j.job_key.clone()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn cancel_companions_cancels_jobs_timers_and_subscriptions() {
        let store = MemoryStore::new();
        let instance = sample_instance();
        store.save_instance(&instance).await.unwrap();

        let job = Job {
            job_key: "j1".into(),
            job_type: "t".into(),
            element_id: "e".into(),
            instance_id: instance.instance_id,
            token_id: Uuid::now_v7(),
            variables: BTreeMap::new(),
            custom_headers: BTreeMap::new(),
            retries_remaining: 1,
            state: JobState::Created,
            worker_id: None,
            lock_expires_at: None,
            timeout_ms: 1000,
            created_at: Utc::now(),
            backoff_until: None,
        };
        store.commit(StoreTransaction::new().put_job(job)).await.unwrap();

        let cancelled = store.cancel_companions_for_instance(instance.instance_id).await.unwrap();
        assert_eq!(cancelled, vec!["j1".to_string()]);

        let job = store.load_job("j1").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Cancelled);
    }

    #[tokio::test]
    async fn events_append_with_monotonic_sequence() {
        let store = MemoryStore::new();
        let instance_id = Uuid::now_v7();
        let tx = StoreTransaction::new()
            .append_event(instance_id, RuntimeEvent::InstanceStarted { instance_id, process_key: "p".into(), version: 1 })
            .append_event(instance_id, RuntimeEvent::InstanceCompleted { instance_id });
        store.commit(tx).await.unwrap();

        let events = store.read_events(instance_id, 0).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, 0);
        assert_eq!(events[1].0, 1);
    }
}
