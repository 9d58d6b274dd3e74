//! Sled-backed `TokenStore` (§4.2's "single-node production deployment").
//! Entities are serialized to JSON and kept under the same prefix-namespaced
//! keyspaces [`crate::kv`] documents; queries with no direct key (`list_*`,
//! `find_*`) scan their prefix and filter in memory, which is adequate at the
//! per-instance cardinalities this engine targets and avoids hand-rolling
//! secondary indexes atop `sled`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{EntityOp, JobActivationFilter, StoreTransaction, TokenStore};
use crate::error::StoreError;
use crate::kv::{KvOp, KvStore, SledKv};
use crate::model::{
    BufferedMessage, Incident, IncidentState, Job, JobState, MessageSubscription, ProcessInstance,
    RateCounter, RuntimeEvent, Timer, TimerState, Token, TokenState,
};

fn instance_key(id: Uuid) -> Vec<u8> {
    format!("instance/{id}").into_bytes()
}

fn token_key(id: Uuid) -> Vec<u8> {
    format!("token/{id}").into_bytes()
}

fn timer_key(id: Uuid) -> Vec<u8> {
    format!("timer/{id}").into_bytes()
}

fn job_key(key: &str) -> Vec<u8> {
    format!("job/{key}").into_bytes()
}

fn subscription_key(id: Uuid) -> Vec<u8> {
    format!("sub/{id}").into_bytes()
}

fn buffered_key(id: Uuid) -> Vec<u8> {
    format!("buf/{id}").into_bytes()
}

fn incident_key(id: Uuid) -> Vec<u8> {
    format!("incident/{id}").into_bytes()
}

fn rate_counter_key(identifier: &str) -> Vec<u8> {
    format!("rl/{identifier}").into_bytes()
}

fn event_key(instance_id: Uuid, seq: u64) -> Vec<u8> {
    format!("event/{instance_id}/{seq:020}").into_bytes()
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// `TokenStore` atop [`SledKv`]. Single-process, single-writer: `commit`
/// serializes through sled's own batch application, so concurrent commits
/// from multiple engine tasks still observe an all-or-nothing write.
pub struct SledBackedStore {
    kv: Arc<SledKv>,
}

impl SledBackedStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        Ok(Self { kv: Arc::new(SledKv::open(path)?) })
    }

    fn scan_decoded<T: serde::de::DeserializeOwned>(&self, prefix: &[u8]) -> Result<Vec<T>, StoreError> {
        self.kv
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(_, v)| decode(&v))
            .collect()
    }
}

#[async_trait]
impl TokenStore for SledBackedStore {
    async fn save_instance(&self, instance: &ProcessInstance) -> Result<(), StoreError> {
        self.kv.commit(vec![KvOp::Put(instance_key(instance.instance_id), encode(instance)?)])
    }

    async fn load_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>, StoreError> {
        self.kv.get(&instance_key(id))?.map(|b| decode(&b)).transpose()
    }

    async fn load_token(&self, id: Uuid) -> Result<Option<Token>, StoreError> {
        self.kv.get(&token_key(id))?.map(|b| decode(&b)).transpose()
    }

    async fn list_tokens_by_instance(&self, instance_id: Uuid) -> Result<Vec<Token>, StoreError> {
        let all: Vec<Token> = self.scan_decoded(b"token/")?;
        Ok(all.into_iter().filter(|t| t.instance_id == instance_id).collect())
    }

    async fn list_tokens_by_state(&self, instance_id: Uuid, state: TokenState) -> Result<Vec<Token>, StoreError> {
        let all: Vec<Token> = self.scan_decoded(b"token/")?;
        Ok(all.into_iter().filter(|t| t.instance_id == instance_id && t.state == state).collect())
    }

    async fn find_token_by_waiting_tag(&self, tag: &str) -> Result<Option<Token>, StoreError> {
        let all: Vec<Token> = self.scan_decoded(b"token/")?;
        Ok(all.into_iter().find(|t| t.waiting_for.as_ref().map(|w| w.tag()) == Some(tag.to_string())))
    }

    async fn load_timer(&self, id: Uuid) -> Result<Option<Timer>, StoreError> {
        self.kv.get(&timer_key(id))?.map(|b| decode(&b)).transpose()
    }

    async fn list_scheduled_timers(&self) -> Result<Vec<Timer>, StoreError> {
        let all: Vec<Timer> = self.scan_decoded(b"timer/")?;
        Ok(all.into_iter().filter(|t| t.state == TimerState::Scheduled).collect())
    }

    async fn load_job(&self, key: &str) -> Result<Option<Job>, StoreError> {
        self.kv.get(&job_key(key))?.map(|b| decode(&b)).transpose()
    }

    async fn list_jobs_for_activation(&self, filter: &JobActivationFilter) -> Result<Vec<Job>, StoreError> {
        let now = filter.now.unwrap_or_else(Utc::now);
        let all: Vec<Job> = self.scan_decoded(b"job/")?;
        let mut candidates: Vec<Job> = all
            .into_iter()
            .filter(|j| {
                j.job_type == filter.job_type
                    && j.state == JobState::Created
                    && j.backoff_until.map(|b| b <= now).unwrap_or(true)
            })
            .collect();
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.job_key.cmp(&b.job_key)));
        Ok(candidates)
    }

    async fn list_jobs_by_instance(&self, instance_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let all: Vec<Job> = self.scan_decoded(b"job/")?;
        Ok(all.into_iter().filter(|j| j.instance_id == instance_id).collect())
    }

    async fn list_activated_jobs_with_expired_lock(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let all: Vec<Job> = self.scan_decoded(b"job/")?;
        Ok(all.into_iter().filter(|j| j.state == JobState::Activated && j.is_lock_expired(now)).collect())
    }

    async fn load_subscription(&self, id: Uuid) -> Result<Option<MessageSubscription>, StoreError> {
        self.kv.get(&subscription_key(id))?.map(|b| decode(&b)).transpose()
    }

    async fn find_subscriptions(&self, tenant_id: &str, message_name: &str) -> Result<Vec<MessageSubscription>, StoreError> {
        let all: Vec<MessageSubscription> = self.scan_decoded(b"sub/")?;
        Ok(all
            .into_iter()
            .filter(|s| s.active && s.tenant_id == tenant_id && s.message_name == message_name)
            .collect())
    }

    async fn find_buffered_message(
        &self,
        tenant_id: &str,
        name: &str,
        correlation_key: &str,
    ) -> Result<Option<BufferedMessage>, StoreError> {
        let now = Utc::now();
        let all: Vec<BufferedMessage> = self.scan_decoded(b"buf/")?;
        Ok(all.into_iter().find(|m| {
            m.tenant_id == tenant_id && m.name == name && m.correlation_key == correlation_key && !m.is_expired(now)
        }))
    }

    async fn list_expired_buffered_messages(&self, now: DateTime<Utc>) -> Result<Vec<BufferedMessage>, StoreError> {
        let all: Vec<BufferedMessage> = self.scan_decoded(b"buf/")?;
        Ok(all.into_iter().filter(|m| m.is_expired(now)).collect())
    }

    async fn load_incident(&self, id: Uuid) -> Result<Option<Incident>, StoreError> {
        self.kv.get(&incident_key(id))?.map(|b| decode(&b)).transpose()
    }

    async fn list_incidents_by_instance(&self, instance_id: Uuid) -> Result<Vec<Incident>, StoreError> {
        let all: Vec<Incident> = self.scan_decoded(b"incident/")?;
        Ok(all.into_iter().filter(|i| i.instance_id == instance_id).collect())
    }

    async fn list_open_incidents(&self) -> Result<Vec<Incident>, StoreError> {
        let all: Vec<Incident> = self.scan_decoded(b"incident/")?;
        Ok(all.into_iter().filter(|i| i.state == IncidentState::Open).collect())
    }

    async fn load_rate_counter(&self, identifier: &str) -> Result<Option<RateCounter>, StoreError> {
        self.kv.get(&rate_counter_key(identifier))?.map(|b| decode(&b)).transpose()
    }

    async fn read_events(&self, instance_id: Uuid, from_seq: u64) -> Result<Vec<(u64, RuntimeEvent)>, StoreError> {
        let prefix = format!("event/{instance_id}/").into_bytes();
        self.kv
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|(k, v)| {
                let seq = parse_event_seq(&k)?;
                let event: RuntimeEvent = decode(&v)?;
                Ok((seq, event))
            })
            .collect::<Result<Vec<_>, StoreError>>()
            .map(|mut rows| {
                rows.retain(|(seq, _)| *seq >= from_seq);
                rows
            })
    }

    async fn commit(&self, tx: StoreTransaction) -> Result<(), StoreError> {
        let mut ops = Vec::with_capacity(tx.ops.len());
        for op in tx.ops {
            match op {
                EntityOp::PutInstance(instance) => ops.push(KvOp::Put(instance_key(instance.instance_id), encode(&instance)?)),
                EntityOp::PutToken(token) => ops.push(KvOp::Put(token_key(token.token_id), encode(&token)?)),
                EntityOp::PutTimer(timer) => ops.push(KvOp::Put(timer_key(timer.timer_id), encode(&timer)?)),
                EntityOp::DeleteTimer(id) => ops.push(KvOp::Delete(timer_key(id))),
                EntityOp::PutJob(job) => ops.push(KvOp::Put(job_key(&job.job_key), encode(&job)?)),
                EntityOp::DeleteJob(key) => ops.push(KvOp::Delete(job_key(&key))),
                EntityOp::PutSubscription(sub) => ops.push(KvOp::Put(subscription_key(sub.subscription_id), encode(&sub)?)),
                EntityOp::DeleteSubscription(id) => ops.push(KvOp::Delete(subscription_key(id))),
                EntityOp::PutBufferedMessage(msg) => ops.push(KvOp::Put(buffered_key(msg.message_id), encode(&msg)?)),
                EntityOp::DeleteBufferedMessage(id) => ops.push(KvOp::Delete(buffered_key(id))),
                EntityOp::PutIncident(incident) => ops.push(KvOp::Put(incident_key(incident.incident_id), encode(&incident)?)),
                EntityOp::PutRateCounter(counter) => ops.push(KvOp::Put(rate_counter_key(&counter.identifier), encode(&counter)?)),
                EntityOp::AppendEvent { instance_id, event } => {
                    let seq = self.next_event_seq(instance_id)?;
                    ops.push(KvOp::Put(event_key(instance_id, seq), encode(&event)?));
                }
            }
        }
        self.kv.commit(ops)
    }

    async fn cancel_companions_for_instance(&self, instance_id: Uuid) -> Result<Vec<String>, StoreError> {
        let jobs: Vec<Job> = self.scan_decoded(b"job/")?;
        let mut ops = Vec::new();
        let mut cancelled = Vec::new();
        for mut job in jobs {
            if job.instance_id == instance_id && !matches!(job.state, JobState::Completed | JobState::Cancelled) {
                job.state = JobState::Cancelled;
                cancelled.push(job.job_key.clone());
                ops.push(KvOp::Put(job_key(&job.job_key), encode(&job)?));
            }
        }

        let timers: Vec<Timer> = self.scan_decoded(b"timer/")?;
        for mut timer in timers {
            if timer.instance_id == Some(instance_id) && timer.state == TimerState::Scheduled {
                timer.state = TimerState::Cancelled;
                ops.push(KvOp::Put(timer_key(timer.timer_id), encode(&timer)?));
            }
        }

        let tokens: Vec<Token> = self.scan_decoded(b"token/")?;
        let subs: Vec<MessageSubscription> = self.scan_decoded(b"sub/")?;
        for mut sub in subs {
            let belongs = sub
                .token_id
                .and_then(|tid| tokens.iter().find(|t| t.token_id == tid))
                .map(|t| t.instance_id == instance_id)
                .unwrap_or(false);
            if sub.active && belongs {
                sub.active = false;
                ops.push(KvOp::Put(subscription_key(sub.subscription_id), encode(&sub)?));
            }
        }

        self.kv.commit(ops)?;
        Ok(cancelled)
    }
}

impl SledBackedStore {
    fn next_event_seq(&self, instance_id: Uuid) -> Result<u64, StoreError> {
        let prefix = format!("event/{instance_id}/").into_bytes();
        let last = self
            .kv
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|(k, _)| parse_event_seq(&k))
            .collect::<Result<Vec<_>, StoreError>>()?
            .into_iter()
            .max();
        Ok(last.map(|s| s + 1).unwrap_or(0))
    }
}

fn parse_event_seq(key: &[u8]) -> Result<u64, StoreError> {
    let text = std::str::from_utf8(key).map_err(|e| StoreError::Serialization(e.to_string()))?;
    text.rsplit('/')
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| StoreError::Serialization(format!("malformed event key: {text}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn temp_store() -> SledBackedStore {
        let dir = tempdir();
        SledBackedStore::open(dir).unwrap()
    }

    fn tempdir() -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("bpmn-engine-sled-test-{}", Uuid::now_v7()));
        path
    }

    #[tokio::test]
    async fn instance_round_trips() {
        let store = temp_store();
        let instance = ProcessInstance::new("order".into(), 1, "default".into(), BTreeMap::new());
        store.save_instance(&instance).await.unwrap();

        let loaded = store.load_instance(instance.instance_id).await.unwrap().unwrap();
        assert_eq!(loaded.instance_id, instance.instance_id);
    }

    #[tokio::test]
    async fn commit_persists_token_and_waiting_tag_lookup_works() {
        let store = temp_store();
        let instance = ProcessInstance::new("order".into(), 1, "default".into(), BTreeMap::new());
        let mut token = Token::spawn(instance.instance_id, "start", None);
        token.waiting_for = Some(crate::model::WaitingFor::Job("job-1".into()));

        let tx = StoreTransaction::new().put_instance(instance.clone()).put_token(token.clone());
        store.commit(tx).await.unwrap();

        let found = store.find_token_by_waiting_tag("job:job-1").await.unwrap().unwrap();
        assert_eq!(found.token_id, token.token_id);
    }

    #[tokio::test]
    async fn events_append_with_monotonic_sequence_across_commits() {
        let store = temp_store();
        let instance_id = Uuid::now_v7();
        store
            .commit(StoreTransaction::new().append_event(
                instance_id,
                RuntimeEvent::InstanceStarted { instance_id, process_key: "p".into(), version: 1 },
            ))
            .await
            .unwrap();
        store
            .commit(StoreTransaction::new().append_event(instance_id, RuntimeEvent::InstanceCompleted { instance_id }))
            .await
            .unwrap();

        let events = store.read_events(instance_id, 0).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, 0);
        assert_eq!(events[1].0, 1);
    }
}
