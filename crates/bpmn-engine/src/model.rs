//! Core data model (§3): process definitions, instances, tokens, timers, jobs,
//! message subscriptions, buffered messages, incidents.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A FEEL value. Kept intentionally small — booleans, numbers, strings, null,
/// and nested JSON for variable payloads that pass through unevaluated.
pub type Value = serde_json::Value;

/// A flat variable scope (instance scope or a single element/token scope).
pub type VariableMap = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Process definition (C2 payload)
// ---------------------------------------------------------------------------

/// Kind-specific attributes, tagged by element kind. Only the fields relevant
/// to a given kind are populated; the engine never downcasts, it matches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElementKind {
    StartEvent,
    EndEvent,
    IntermediateCatchMessage { message_name: String, correlation_key_expr: String },
    IntermediateCatchTimer { timer_def: TimerDefinition },
    IntermediateThrow,
    ServiceTask { task_type: String, retries: u32 },
    SendTask { task_type: String, retries: u32 },
    ReceiveTask { message_name: String, correlation_key_expr: String },
    UserTask { retries: u32 },
    ScriptTask { expression: String },
    BusinessRuleTask { expression: String },
    CallActivity { called_process_key: String },
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    EventBasedGateway,
    BoundaryEvent { attached_to_ref: String, cancel_activity: bool, trigger: BoundaryTrigger },
    SubProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum BoundaryTrigger {
    Timer { timer_def: TimerDefinition },
    Message { message_name: String, correlation_key_expr: String },
    Error { error_code: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    Duration,
    Date,
    Cycle,
}

/// The unevaluated timer specification attached to an element; resolved to a
/// concrete [`Timer`] by the execution engine when the element is entered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimerDefinition {
    pub kind: TimerKind,
    /// ISO-8601 duration (`PT30S`), date (`2026-01-01T00:00:00Z`), or cycle (`R5/PT30S`).
    pub expression: String,
}

/// A directed edge between two elements, with an optional FEEL guard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequenceFlow {
    pub id: String,
    pub source_ref: String,
    pub target_ref: String,
    pub condition_expr: Option<String>,
    pub is_default: bool,
}

/// One node in the process graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Element {
    pub id: String,
    pub kind: ElementKind,
    pub outgoing: Vec<String>,
    pub incoming: Vec<String>,
    /// Id of the enclosing subprocess/process scope, used for scoped cancellation and joins.
    pub scope_id: String,
    pub error_code: Option<String>,
}

/// Immutable directed graph of elements, keyed by `(process_key, version)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessDefinition {
    pub process_key: String,
    pub version: u32,
    pub elements: BTreeMap<String, Element>,
    pub flows: BTreeMap<String, SequenceFlow>,
    pub start_element_ids: Vec<String>,
    pub deployed_at: DateTime<Utc>,
}

impl ProcessDefinition {
    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    pub fn outgoing_flows(&self, element_id: &str) -> Vec<&SequenceFlow> {
        self.elements
            .get(element_id)
            .map(|e| e.outgoing.iter().filter_map(|fid| self.flows.get(fid)).collect())
            .unwrap_or_default()
    }

    pub fn incoming_count(&self, element_id: &str) -> usize {
        self.elements.get(element_id).map(|e| e.incoming.len()).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Process instance & token (C3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceState {
    Active,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessInstance {
    pub instance_id: Uuid,
    pub process_key: String,
    pub version: u32,
    pub tenant_id: String,
    pub state: InstanceState,
    pub variables: VariableMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessInstance {
    pub fn new(process_key: String, version: u32, tenant_id: String, variables: VariableMap) -> Self {
        let now = Utc::now();
        Self {
            instance_id: Uuid::now_v7(),
            process_key,
            version,
            tenant_id,
            state: InstanceState::Active,
            variables,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, InstanceState::Completed | InstanceState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenState {
    Active,
    Waiting,
    Completed,
    Cancelled,
}

impl TokenState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TokenState::Completed | TokenState::Cancelled)
    }
}

/// A typed `waiting_for` tag — the only pointer a token carries to its companion record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WaitingFor {
    Timer(String),
    Message(String),
    Job(String),
    Child(Uuid),
    Join(String),
    Incident(Uuid),
}

impl WaitingFor {
    pub fn tag(&self) -> String {
        match self {
            WaitingFor::Timer(id) => format!("timer:{id}"),
            WaitingFor::Message(name) => format!("message:{name}"),
            WaitingFor::Job(key) => format!("job:{key}"),
            WaitingFor::Child(id) => format!("child:{id}"),
            WaitingFor::Join(id) => format!("join:{id}"),
            WaitingFor::Incident(id) => format!("incident:{id}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Token {
    pub token_id: Uuid,
    pub instance_id: Uuid,
    pub current_element_id: String,
    pub state: TokenState,
    pub waiting_for: Option<WaitingFor>,
    pub scope_variables: VariableMap,
    pub parent_token_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Token {
    pub fn spawn(instance_id: Uuid, element_id: impl Into<String>, parent: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            token_id: Uuid::now_v7(),
            instance_id,
            current_element_id: element_id.into(),
            state: TokenState::Active,
            waiting_for: None,
            scope_variables: VariableMap::new(),
            parent_token_id: parent,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Timer (C5 persisted record)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimerState {
    Scheduled,
    Fired,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleSpec {
    pub interval_seconds: i64,
    pub remaining_iterations: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Timer {
    pub timer_id: Uuid,
    pub kind: TimerKind,
    pub fire_at: DateTime<Utc>,
    pub cycle: Option<CycleSpec>,
    pub element_id: Option<String>,
    pub token_id: Option<Uuid>,
    pub instance_id: Option<Uuid>,
    pub state: TimerState,
    pub wheel_level: u8,
    pub wheel_slot: u32,
    /// True for user-created timers addressed outside the element graph (§6 decision).
    pub user_namespace: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Job (C7)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Created,
    Activated,
    Completed,
    Failed,
    ErrorThrown,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_key: String,
    pub job_type: String,
    pub element_id: String,
    pub instance_id: Uuid,
    pub token_id: Uuid,
    pub variables: VariableMap,
    pub custom_headers: VariableMap,
    pub retries_remaining: u32,
    pub state: JobState,
    pub worker_id: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub backoff_until: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_lock_expired(&self, now: DateTime<Utc>) -> bool {
        self.lock_expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Message subscription & buffered message (C6)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageSubscription {
    pub subscription_id: Uuid,
    pub process_key: String,
    pub version: u32,
    pub start_element_id: Option<String>,
    pub message_name: String,
    pub correlation_key: String,
    pub token_id: Option<Uuid>,
    pub tenant_id: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl MessageSubscription {
    pub fn is_start(&self) -> bool {
        self.token_id.is_none() && self.start_element_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BufferedMessage {
    pub message_id: Uuid,
    pub name: String,
    pub correlation_key: String,
    pub tenant_id: String,
    pub variables: VariableMap,
    pub published_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub element_id: Option<String>,
}

impl BufferedMessage {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t < now).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Incident (C8)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentKind {
    JobFailure,
    BpmnError,
    ExpressionError,
    TimerError,
    MessageError,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum IncidentState {
    Open,
    Resolved,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResolutionAction {
    Retry,
    Dismiss,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncidentResolution {
    pub action: ResolutionAction,
    pub resolver: String,
    pub comment: Option<String>,
    pub new_retries: Option<u32>,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Incident {
    pub incident_id: Uuid,
    pub kind: IncidentKind,
    pub token_id: Option<Uuid>,
    pub element_id: String,
    pub instance_id: Uuid,
    pub message: String,
    pub context: VariableMap,
    pub created_at: DateTime<Utc>,
    pub state: IncidentState,
    pub resolution: Option<IncidentResolution>,
}

// ---------------------------------------------------------------------------
// Rate limit counter (C10 persistence, §9 design note)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateCounter {
    pub identifier: String,
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Runtime audit event (ambient addition, §4.8)
// ---------------------------------------------------------------------------

/// Append-only audit trail entry. Not the source of truth for engine state
/// (current rows in the store are authoritative) — purely observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    InstanceStarted { instance_id: Uuid, process_key: String, version: u32 },
    TokenSpawned { token_id: Uuid, element_id: String, parent: Option<Uuid> },
    TokenStepped { token_id: Uuid, from_element: String, to_element: String },
    TokenWaiting { token_id: Uuid, waiting_for: String },
    TokenCompleted { token_id: Uuid },
    TokenCancelled { token_id: Uuid, reason: String },
    GatewayTaken { element_id: String, branch: String },
    JoinArrived { join_id: String, token_id: Uuid, count: u16, expected: u16 },
    JobCreated { job_key: String, job_type: String },
    JobCompleted { job_key: String },
    JobFailed { job_key: String, retries_remaining: u32 },
    TimerScheduled { timer_id: Uuid, fire_at: DateTime<Utc> },
    TimerFired { timer_id: Uuid },
    MessagePublished { message_id: Uuid, name: String, matched: bool },
    MessageCorrelated { subscription_id: Uuid, message_id: Option<Uuid> },
    IncidentCreated { incident_id: Uuid, kind: IncidentKind },
    IncidentResolved { incident_id: Uuid, action: ResolutionAction },
    InstanceCompleted { instance_id: Uuid },
    InstanceCancelled { instance_id: Uuid, reason: String },
}
