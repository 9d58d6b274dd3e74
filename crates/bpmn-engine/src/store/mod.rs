//! Token Store (C3): a thin typed layer over [`crate::kv::KvStore`]. Every
//! mutation the engine makes flows through [`TokenStore::commit`] — the
//! engine never touches a store implementation's internals directly.

mod memory;
#[cfg(feature = "sled-store")]
mod sled_backed;

pub use memory::MemoryStore;
#[cfg(feature = "sled-store")]
pub use sled_backed::SledBackedStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    BufferedMessage, Incident, Job, JobState, MessageSubscription, ProcessInstance, RateCounter,
    RuntimeEvent, Timer, Token, TokenState,
};

/// One mutation against an entity collection. Accumulated into a
/// [`StoreTransaction`] and applied atomically by [`TokenStore::commit`].
#[derive(Debug, Clone)]
pub enum EntityOp {
    PutInstance(ProcessInstance),
    PutToken(Token),
    PutTimer(Timer),
    DeleteTimer(Uuid),
    PutJob(Job),
    DeleteJob(String),
    PutSubscription(MessageSubscription),
    DeleteSubscription(Uuid),
    PutBufferedMessage(BufferedMessage),
    DeleteBufferedMessage(Uuid),
    PutIncident(Incident),
    PutRateCounter(RateCounter),
    AppendEvent { instance_id: Uuid, event: RuntimeEvent },
}

/// A builder that accumulates every mutation a single logical engine
/// operation makes, so it can be flushed through [`TokenStore::commit`] in
/// one atomic batch (§4.2, §4.8 step 4).
#[derive(Debug, Clone, Default)]
pub struct StoreTransaction {
    pub ops: Vec<EntityOp>,
}

impl StoreTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_instance(mut self, instance: ProcessInstance) -> Self {
        self.ops.push(EntityOp::PutInstance(instance));
        self
    }

    pub fn put_token(mut self, token: Token) -> Self {
        self.ops.push(EntityOp::PutToken(token));
        self
    }

    pub fn put_timer(mut self, timer: Timer) -> Self {
        self.ops.push(EntityOp::PutTimer(timer));
        self
    }

    pub fn delete_timer(mut self, timer_id: Uuid) -> Self {
        self.ops.push(EntityOp::DeleteTimer(timer_id));
        self
    }

    pub fn put_job(mut self, job: Job) -> Self {
        self.ops.push(EntityOp::PutJob(job));
        self
    }

    pub fn delete_job(mut self, job_key: impl Into<String>) -> Self {
        self.ops.push(EntityOp::DeleteJob(job_key.into()));
        self
    }

    pub fn put_subscription(mut self, sub: MessageSubscription) -> Self {
        self.ops.push(EntityOp::PutSubscription(sub));
        self
    }

    pub fn delete_subscription(mut self, subscription_id: Uuid) -> Self {
        self.ops.push(EntityOp::DeleteSubscription(subscription_id));
        self
    }

    pub fn put_buffered_message(mut self, msg: BufferedMessage) -> Self {
        self.ops.push(EntityOp::PutBufferedMessage(msg));
        self
    }

    pub fn delete_buffered_message(mut self, message_id: Uuid) -> Self {
        self.ops.push(EntityOp::DeleteBufferedMessage(message_id));
        self
    }

    pub fn put_incident(mut self, incident: Incident) -> Self {
        self.ops.push(EntityOp::PutIncident(incident));
        self
    }

    pub fn put_rate_counter(mut self, counter: RateCounter) -> Self {
        self.ops.push(EntityOp::PutRateCounter(counter));
        self
    }

    pub fn append_event(mut self, instance_id: Uuid, event: RuntimeEvent) -> Self {
        self.ops.push(EntityOp::AppendEvent { instance_id, event });
        self
    }

    pub fn merge(mut self, other: StoreTransaction) -> Self {
        self.ops.extend(other.ops);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Optional filters for listing jobs eligible for activation (§4.6).
#[derive(Debug, Clone, Default)]
pub struct JobActivationFilter {
    pub job_type: String,
    pub now: Option<DateTime<Utc>>,
}

/// Persistence trait for all engine state. The engine operates exclusively
/// through this trait, so pluggable backends (in-memory for tests, sled for
/// a single-node production deployment) are interchangeable.
#[async_trait]
pub trait TokenStore: Send + Sync {
    // -- instances --
    async fn save_instance(&self, instance: &ProcessInstance) -> Result<(), StoreError>;
    async fn load_instance(&self, id: Uuid) -> Result<Option<ProcessInstance>, StoreError>;

    // -- tokens --
    async fn load_token(&self, id: Uuid) -> Result<Option<Token>, StoreError>;
    async fn list_tokens_by_instance(&self, instance_id: Uuid) -> Result<Vec<Token>, StoreError>;
    async fn list_tokens_by_state(&self, instance_id: Uuid, state: TokenState) -> Result<Vec<Token>, StoreError>;
    async fn find_token_by_waiting_tag(&self, tag: &str) -> Result<Option<Token>, StoreError>;

    // -- timers --
    async fn load_timer(&self, id: Uuid) -> Result<Option<Timer>, StoreError>;
    async fn list_scheduled_timers(&self) -> Result<Vec<Timer>, StoreError>;

    // -- jobs --
    async fn load_job(&self, job_key: &str) -> Result<Option<Job>, StoreError>;
    async fn list_jobs_for_activation(&self, filter: &JobActivationFilter) -> Result<Vec<Job>, StoreError>;
    async fn list_jobs_by_instance(&self, instance_id: Uuid) -> Result<Vec<Job>, StoreError>;
    /// Jobs stuck in ACTIVATED past their `lock_expires_at` (§4.6 timeout reaper).
    async fn list_activated_jobs_with_expired_lock(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    // -- subscriptions & buffered messages --
    async fn load_subscription(&self, id: Uuid) -> Result<Option<MessageSubscription>, StoreError>;
    async fn find_subscriptions(&self, tenant_id: &str, message_name: &str) -> Result<Vec<MessageSubscription>, StoreError>;
    async fn find_buffered_message(
        &self,
        tenant_id: &str,
        name: &str,
        correlation_key: &str,
    ) -> Result<Option<BufferedMessage>, StoreError>;
    async fn list_expired_buffered_messages(&self, now: DateTime<Utc>) -> Result<Vec<BufferedMessage>, StoreError>;

    // -- incidents --
    async fn load_incident(&self, id: Uuid) -> Result<Option<Incident>, StoreError>;
    async fn list_incidents_by_instance(&self, instance_id: Uuid) -> Result<Vec<Incident>, StoreError>;
    async fn list_open_incidents(&self) -> Result<Vec<Incident>, StoreError>;

    // -- rate counters --
    async fn load_rate_counter(&self, identifier: &str) -> Result<Option<RateCounter>, StoreError>;

    // -- event log --
    async fn read_events(&self, instance_id: Uuid, from_seq: u64) -> Result<Vec<(u64, RuntimeEvent)>, StoreError>;

    /// Apply every mutation in `tx` atomically. This is the only write path.
    async fn commit(&self, tx: StoreTransaction) -> Result<(), StoreError>;

    /// Cancel every job/timer/subscription still bound to `instance_id`,
    /// returning the job keys cancelled (§4.6, boundary/error cancellation).
    async fn cancel_companions_for_instance(&self, instance_id: Uuid) -> Result<Vec<String>, StoreError>;
}
