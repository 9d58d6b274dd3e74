//! End-to-end scenarios driving the execution engine, timing wheel, message
//! bus, job manager, incident manager, and auth gateway together against an
//! in-memory store, the way a deployed engine composes them.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use bpmn_engine::auth::{generate_api_key, ApiKeyRecord, AuthGateway, Permission};
use bpmn_engine::engine::Engine;
use bpmn_engine::error::AuthError;
use bpmn_engine::graph::ProcessGraphRepository;
use bpmn_engine::incident::IncidentManager;
use bpmn_engine::job::JobManager;
use bpmn_engine::kv::MemoryKv;
use bpmn_engine::messaging::{MessageBus, PublishRequest};
use bpmn_engine::model::{
    CycleSpec, Element, ElementKind, InstanceState, JobState, ProcessDefinition, ResolutionAction,
    SequenceFlow, Timer, TimerDefinition, TimerKind, TimerState, TokenState, VariableMap,
};
use bpmn_engine::store::{MemoryStore, TokenStore};
use bpmn_engine::timing::{TimerSink, TimingWheel};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

const TENANT: &str = "default";

/// Wires the same components `bpmn_engine::bootstrap` would, without going
/// through `Config` so individual tests can drive the timing wheel by hand.
struct Harness {
    store: Arc<dyn TokenStore>,
    graph: Arc<ProcessGraphRepository>,
    jobs: Arc<JobManager>,
    incidents: Arc<IncidentManager>,
    engine: Arc<Engine>,
    wheel: Arc<TimingWheel>,
}

impl Harness {
    fn new() -> Self {
        let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
        let graph = Arc::new(ProcessGraphRepository::new(Arc::new(MemoryKv::new())));
        let jobs = Arc::new(JobManager::new(store.clone()));
        let messages = Arc::new(MessageBus::new(store.clone()));
        let incidents = Arc::new(IncidentManager::new(store.clone()));
        let engine = Engine::new(store.clone(), graph.clone(), jobs.clone(), messages.clone(), incidents.clone(), 64);
        let wheel = Arc::new(TimingWheel::new(store.clone(), engine.clone() as Arc<dyn TimerSink>));
        engine.attach_wheel(wheel.clone());
        Self { store, graph, jobs, incidents, engine, wheel }
    }
}

/// Lets a spawned `enqueue_step`/`fire_one` task finish before assertions run,
/// the same pattern the timing wheel's own tests use around `tick()`.
async fn settle() {
    tokio::time::sleep(StdDuration::from_millis(50)).await;
}

fn element(id: &str, kind: ElementKind, incoming: &[&str], outgoing: &[&str]) -> Element {
    Element {
        id: id.to_string(),
        kind,
        outgoing: outgoing.iter().map(|s| s.to_string()).collect(),
        incoming: incoming.iter().map(|s| s.to_string()).collect(),
        scope_id: "root".to_string(),
        error_code: None,
    }
}

fn flow(id: &str, from: &str, to: &str) -> SequenceFlow {
    SequenceFlow { id: id.to_string(), source_ref: from.to_string(), target_ref: to.to_string(), condition_expr: None, is_default: false }
}

fn definition(process_key: &str, elements: Vec<Element>, flows: Vec<SequenceFlow>, start: &str) -> ProcessDefinition {
    ProcessDefinition {
        process_key: process_key.to_string(),
        version: 1,
        elements: elements.into_iter().map(|e| (e.id.clone(), e)).collect(),
        flows: flows.into_iter().map(|f| (f.id.clone(), f)).collect(),
        start_element_ids: vec![start.to_string()],
        deployed_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Scenario 1: happy-path service task
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_service_task_completes_the_instance() {
    let h = Harness::new();
    let def = definition(
        "order",
        vec![
            element("start", ElementKind::StartEvent, &[], &["f1"]),
            element("svc", ElementKind::ServiceTask { task_type: "charge_card".into(), retries: 3 }, &["f1"], &["f2"]),
            element("end", ElementKind::EndEvent, &["f2"], &[]),
        ],
        vec![flow("f1", "start", "svc"), flow("f2", "svc", "end")],
        "start",
    );
    h.graph.deploy(&def).unwrap();

    let instance = h.engine.start_instance("order", None, TENANT, VariableMap::new()).await.unwrap();
    settle().await;

    let activations = h.jobs.activate("charge_card", "worker-1", 1, 5_000, &[]).await.unwrap();
    assert_eq!(activations.len(), 1);
    assert_eq!(activations[0].element_id, "svc");

    h.engine.complete_job(&activations[0].job_key, BTreeMap::from([("result".to_string(), json!(42))])).await.unwrap();
    settle().await;

    let loaded = h.store.load_instance(instance.instance_id).await.unwrap().unwrap();
    assert_eq!(loaded.state, InstanceState::Completed);
    assert_eq!(loaded.variables.get("result"), Some(&json!(42)));

    // The job record is retired by completion, not left around for a second complete().
    assert!(h.store.load_job(&activations[0].job_key).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Scenario 2: timer, then message, beats out real-time waiting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timer_then_message_scenario_advances_through_both_waits() {
    let h = Harness::new();
    let def = definition(
        "order",
        vec![
            element("start", ElementKind::StartEvent, &[], &["f1"]),
            element(
                "timer",
                ElementKind::IntermediateCatchTimer { timer_def: TimerDefinition { kind: TimerKind::Duration, expression: "PT2S".into() } },
                &["f1"],
                &["f2"],
            ),
            element(
                "receive",
                ElementKind::IntermediateCatchMessage { message_name: "OrderPaid".into(), correlation_key_expr: "orderId".into() },
                &["f2"],
                &["f3"],
            ),
            element("end", ElementKind::EndEvent, &["f3"], &[]),
        ],
        vec![flow("f1", "start", "timer"), flow("f2", "timer", "receive"), flow("f3", "receive", "end")],
        "start",
    );
    h.graph.deploy(&def).unwrap();

    let mut vars = VariableMap::new();
    vars.insert("orderId".to_string(), json!("order-42"));
    let instance = h.engine.start_instance("order", None, TENANT, vars).await.unwrap();
    settle().await;

    // A PT2S duration timer always lands past the wheel's level-zero cursor
    // by at least two slots; drive the clock by hand instead of sleeping
    // out the real two seconds.
    for _ in 0..3 {
        h.wheel.tick().await;
        settle().await;
    }

    let tokens = h.store.list_tokens_by_instance(instance.instance_id).await.unwrap();
    let at_receive = tokens.iter().find(|t| t.current_element_id == "receive").expect("token reached the receive element");
    assert_eq!(at_receive.state, TokenState::Waiting);

    h.engine
        .publish_message(PublishRequest {
            name: "OrderPaid".into(),
            correlation_key: "order-42".into(),
            tenant_id: TENANT.into(),
            variables: BTreeMap::from([("paid".to_string(), json!(true))]),
            ttl_seconds: None,
        })
        .await
        .unwrap();
    settle().await;

    let loaded = h.store.load_instance(instance.instance_id).await.unwrap().unwrap();
    assert_eq!(loaded.state, InstanceState::Completed);
}

// ---------------------------------------------------------------------------
// Scenario 3: a buffered message published before any subscription exists
// still satisfies the subscription the moment it's created.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn buffered_message_satisfies_a_subscription_created_after_it() {
    let h = Harness::new();
    let def = definition(
        "order",
        vec![
            element("start", ElementKind::StartEvent, &[], &["f1"]),
            element(
                "receive",
                ElementKind::IntermediateCatchMessage { message_name: "Late".into(), correlation_key_expr: "key".into() },
                &["f1"],
                &["f2"],
            ),
            element("end", ElementKind::EndEvent, &["f2"], &[]),
        ],
        vec![flow("f1", "start", "receive"), flow("f2", "receive", "end")],
        "start",
    );
    h.graph.deploy(&def).unwrap();

    h.engine
        .publish_message(PublishRequest {
            name: "Late".into(),
            correlation_key: "key-1".into(),
            tenant_id: TENANT.into(),
            variables: BTreeMap::from([("x".to_string(), json!(1))]),
            ttl_seconds: Some(3600),
        })
        .await
        .unwrap();
    assert!(h.store.find_buffered_message(TENANT, "Late", "key-1").await.unwrap().is_some());

    let mut vars = VariableMap::new();
    vars.insert("key".to_string(), json!("key-1"));
    let instance = h.engine.start_instance("order", None, TENANT, vars).await.unwrap();
    settle().await;

    let loaded = h.store.load_instance(instance.instance_id).await.unwrap().unwrap();
    assert_eq!(loaded.state, InstanceState::Completed);
    // The buffered entry is consumed on the immediate match, not left behind.
    assert!(h.store.find_buffered_message(TENANT, "Late", "key-1").await.unwrap().is_none());
}

#[tokio::test]
async fn ttl_exhausted_buffered_message_does_not_match_a_later_subscription() {
    let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
    let bus = MessageBus::new(store.clone());
    let now = Utc::now();
    store
        .commit(
            bpmn_engine::store::StoreTransaction::new().put_buffered_message(bpmn_engine::model::BufferedMessage {
                message_id: Uuid::now_v7(),
                name: "Stale".into(),
                correlation_key: "k".into(),
                tenant_id: TENANT.into(),
                variables: VariableMap::new(),
                published_at: now - chrono::Duration::hours(2),
                expires_at: Some(now - chrono::Duration::hours(1)),
                element_id: None,
            }),
        )
        .await
        .unwrap();

    // Already expired: the sweep should retire it before anyone subscribes.
    let swept = bus.sweep_expired(now).await.unwrap();
    assert_eq!(swept, 1);
    assert!(store.find_buffered_message(TENANT, "Stale", "k").await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Scenario 4: job failure exhausts its retries, raises an incident, and the
// incident's retry resolution lets the instance still complete.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn job_failure_exhausts_retries_then_resolves_via_incident() {
    let h = Harness::new();
    let def = definition(
        "order",
        vec![
            element("start", ElementKind::StartEvent, &[], &["f1"]),
            element("svc", ElementKind::ServiceTask { task_type: "flaky".into(), retries: 2 }, &["f1"], &["f2"]),
            element("end", ElementKind::EndEvent, &["f2"], &[]),
        ],
        vec![flow("f1", "start", "svc"), flow("f2", "svc", "end")],
        "start",
    );
    h.graph.deploy(&def).unwrap();

    let instance = h.engine.start_instance("order", None, TENANT, VariableMap::new()).await.unwrap();
    settle().await;

    let first = h.jobs.activate("flaky", "worker-1", 1, 5_000, &[]).await.unwrap();
    assert_eq!(first.len(), 1);
    let job_key = first[0].job_key.clone();

    // First failure still has one retry left; no incident yet.
    h.engine.fail_job(&job_key, "boom", Some(StdDuration::ZERO)).await.unwrap();
    let reloaded = h.store.load_job(&job_key).await.unwrap().unwrap();
    assert_eq!(reloaded.retries_remaining, 1);
    assert_eq!(reloaded.state, JobState::Created);
    assert!(h.incidents.list_open().await.unwrap().is_empty());

    let second = h.jobs.activate("flaky", "worker-1", 1, 5_000, &[]).await.unwrap();
    assert_eq!(second.len(), 1);

    // Second failure exhausts retries: an incident is raised and the token parks.
    h.engine.fail_job(&job_key, "boom again", Some(StdDuration::ZERO)).await.unwrap();
    let open = h.incidents.list_open().await.unwrap();
    assert_eq!(open.len(), 1);
    let incident = open[0].clone();

    let tokens = h.store.list_tokens_by_instance(instance.instance_id).await.unwrap();
    let at_svc = tokens.iter().find(|t| t.current_element_id == "svc").unwrap();
    assert_eq!(at_svc.state, TokenState::Waiting);

    h.engine.resolve_incident(incident.incident_id, ResolutionAction::Retry, "ops", None, Some(3)).await.unwrap();
    let retried_job = h.store.load_job(&job_key).await.unwrap().unwrap();
    assert_eq!(retried_job.state, JobState::Created);
    assert_eq!(retried_job.retries_remaining, 3);
    assert!(h.incidents.list_open().await.unwrap().is_empty());

    let third = h.jobs.activate("flaky", "worker-1", 1, 5_000, &[]).await.unwrap();
    assert_eq!(third.len(), 1);
    h.engine.complete_job(&job_key, VariableMap::new()).await.unwrap();
    settle().await;

    let loaded = h.store.load_instance(instance.instance_id).await.unwrap().unwrap();
    assert_eq!(loaded.state, InstanceState::Completed);
}

#[tokio::test]
async fn completing_an_already_completed_job_is_rejected() {
    let h = Harness::new();
    let def = definition(
        "order",
        vec![
            element("start", ElementKind::StartEvent, &[], &["f1"]),
            element("svc", ElementKind::ServiceTask { task_type: "t".into(), retries: 1 }, &["f1"], &["f2"]),
            element("end", ElementKind::EndEvent, &["f2"], &[]),
        ],
        vec![flow("f1", "start", "svc"), flow("f2", "svc", "end")],
        "start",
    );
    h.graph.deploy(&def).unwrap();

    h.engine.start_instance("order", None, TENANT, VariableMap::new()).await.unwrap();
    settle().await;
    let activations = h.jobs.activate("t", "w1", 1, 5_000, &[]).await.unwrap();
    let job_key = activations[0].job_key.clone();

    h.engine.complete_job(&job_key, VariableMap::new()).await.unwrap();
    settle().await;

    let err = h.engine.complete_job(&job_key, VariableMap::new()).await;
    assert!(err.is_err(), "completing a job twice must fail, not silently succeed");
}

// ---------------------------------------------------------------------------
// Scenario 5: a cycle timer fires exactly the configured number of times.
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingSink {
    fired: StdMutex<Vec<Uuid>>,
}

#[async_trait]
impl TimerSink for RecordingSink {
    async fn on_timer_fired(&self, timer: Timer) {
        self.fired.lock().unwrap().push(timer.timer_id);
    }
}

fn cycle_timer(remaining_iterations: u32, interval_seconds: i64) -> Timer {
    Timer {
        timer_id: Uuid::now_v7(),
        kind: TimerKind::Cycle,
        fire_at: Utc::now() + chrono::Duration::seconds(interval_seconds),
        cycle: Some(CycleSpec { interval_seconds, remaining_iterations: Some(remaining_iterations) }),
        element_id: Some("timer1".into()),
        token_id: None,
        instance_id: None,
        state: TimerState::Scheduled,
        wheel_level: 0,
        wheel_slot: 0,
        user_namespace: false,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn r3_pt1s_cycle_timer_fires_exactly_three_times() {
    let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink::default());
    let wheel = Arc::new(TimingWheel::new(store.clone(), sink.clone()));

    let timer = cycle_timer(3, 1);
    wheel.schedule(timer).await.unwrap();

    for _ in 0..3 {
        wheel.tick().await;
        settle().await;
    }
    assert_eq!(sink.fired.lock().unwrap().len(), 3, "three occurrences should have fired");

    let scheduled = store.list_scheduled_timers().await.unwrap();
    assert!(scheduled.is_empty(), "the third occurrence is the last; nothing remains scheduled");

    // A fourth tick has nothing due.
    wheel.tick().await;
    settle().await;
    assert_eq!(sink.fired.lock().unwrap().len(), 3, "no fourth occurrence should ever fire");
}

#[tokio::test]
async fn pt0s_timer_fires_on_the_next_tick_not_before() {
    let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink::default());
    let wheel = Arc::new(TimingWheel::new(store.clone(), sink.clone()));

    let mut timer = cycle_timer(1, 1);
    timer.kind = TimerKind::Duration;
    timer.cycle = None;
    timer.fire_at = Utc::now();
    let timer_id = timer.timer_id;
    wheel.schedule(timer).await.unwrap();

    // Not fired before the first tick, even though fire_at is already past.
    assert!(sink.fired.lock().unwrap().is_empty());

    wheel.tick().await;
    settle().await;
    assert_eq!(sink.fired.lock().unwrap().as_slice(), &[timer_id]);
}

// ---------------------------------------------------------------------------
// Scenario 6: the sliding-window rate limiter blocks a key once its budget
// is exhausted, independent of API permission checks.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limit_window_blocks_a_single_request_budget_key() {
    let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
    let generated = generate_api_key();
    let record = ApiKeyRecord {
        key_hash: generated.key_hash.clone(),
        label: "limited".into(),
        permissions: vec![Permission::Process],
        ip_allowlist: Vec::new(),
        requests_per_minute: 1,
    };
    let gateway = AuthGateway::new(store, vec![record], Vec::new());
    let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 50));

    gateway.authorize(&generated.key, ip, Permission::Process).await.unwrap();
    let err = gateway.authorize(&generated.key, ip, Permission::Process).await.unwrap_err();
    assert_eq!(err, AuthError::RateLimited);
}

#[tokio::test]
async fn distinct_keys_have_independent_rate_budgets() {
    let store: Arc<dyn TokenStore> = Arc::new(MemoryStore::new());
    let a = generate_api_key();
    let b = generate_api_key();
    let keys = vec![
        ApiKeyRecord { key_hash: a.key_hash.clone(), label: "a".into(), permissions: vec![Permission::Process], ip_allowlist: Vec::new(), requests_per_minute: 1 },
        ApiKeyRecord { key_hash: b.key_hash.clone(), label: "b".into(), permissions: vec![Permission::Process], ip_allowlist: Vec::new(), requests_per_minute: 1 },
    ];
    let gateway = AuthGateway::new(store, keys, Vec::new());
    let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 51));

    gateway.authorize(&a.key, ip, Permission::Process).await.unwrap();
    assert!(gateway.authorize(&a.key, ip, Permission::Process).await.is_err());
    // b's budget is untouched by a's exhaustion.
    gateway.authorize(&b.key, ip, Permission::Process).await.unwrap();
}

// ---------------------------------------------------------------------------
// Parallel-join invariant: a fork into three branches joins exactly once,
// regardless of the order in which the branches individually complete.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_join_waits_for_every_branch_regardless_of_arrival_order() {
    let h = Harness::new();
    let def = definition(
        "order",
        vec![
            element("start", ElementKind::StartEvent, &[], &["f1"]),
            element("split", ElementKind::ParallelGateway, &["f1"], &["f2", "f3", "f4"]),
            element("a", ElementKind::ServiceTask { task_type: "a".into(), retries: 1 }, &["f2"], &["fa"]),
            element("b", ElementKind::ServiceTask { task_type: "b".into(), retries: 1 }, &["f3"], &["fb"]),
            element("c", ElementKind::ServiceTask { task_type: "c".into(), retries: 1 }, &["f4"], &["fc"]),
            element("join", ElementKind::ParallelGateway, &["fa", "fb", "fc"], &["f5"]),
            element("end", ElementKind::EndEvent, &["f5"], &[]),
        ],
        vec![
            flow("f1", "start", "split"),
            flow("f2", "split", "a"),
            flow("f3", "split", "b"),
            flow("f4", "split", "c"),
            flow("fa", "a", "join"),
            flow("fb", "b", "join"),
            flow("fc", "c", "join"),
            flow("f5", "join", "end"),
        ],
        "start",
    );
    h.graph.deploy(&def).unwrap();

    let instance = h.engine.start_instance("order", None, TENANT, VariableMap::new()).await.unwrap();
    settle().await;

    // Complete the three branch jobs out of the order they were spawned in.
    for job_type in ["c", "a", "b"] {
        let activations = h.jobs.activate(job_type, "w1", 1, 5_000, &[]).await.unwrap();
        assert_eq!(activations.len(), 1, "exactly one {job_type} job should be pending");
        h.engine.complete_job(&activations[0].job_key, VariableMap::new()).await.unwrap();
        settle().await;
    }

    let loaded = h.store.load_instance(instance.instance_id).await.unwrap().unwrap();
    assert_eq!(loaded.state, InstanceState::Completed);

    // Exactly one survivor token reached "join" then completed past it; the
    // other two arrivals are retired, not left dangling as separate completions.
    let tokens = h.store.list_tokens_by_instance(instance.instance_id).await.unwrap();
    let completed_at_join_or_later = tokens.iter().filter(|t| t.state.is_terminal()).count();
    assert_eq!(completed_at_join_or_later, tokens.len());
}

// ---------------------------------------------------------------------------
// Cancellation invariant: cancelling an instance mid-flight marks every
// non-terminal token cancelled and the instance itself cancelled, not completed.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelling_an_instance_cancels_its_outstanding_tokens() {
    let h = Harness::new();
    let def = definition(
        "order",
        vec![
            element("start", ElementKind::StartEvent, &[], &["f1"]),
            element("svc", ElementKind::ServiceTask { task_type: "slow".into(), retries: 1 }, &["f1"], &["f2"]),
            element("end", ElementKind::EndEvent, &["f2"], &[]),
        ],
        vec![flow("f1", "start", "svc"), flow("f2", "svc", "end")],
        "start",
    );
    h.graph.deploy(&def).unwrap();

    let instance = h.engine.start_instance("order", None, TENANT, VariableMap::new()).await.unwrap();
    settle().await;

    h.engine.cancel_instance(instance.instance_id, "operator requested shutdown").await.unwrap();

    let loaded = h.store.load_instance(instance.instance_id).await.unwrap().unwrap();
    assert_eq!(loaded.state, InstanceState::Cancelled);

    let tokens = h.store.list_tokens_by_instance(instance.instance_id).await.unwrap();
    assert!(tokens.iter().all(|t| t.state == TokenState::Cancelled));

    // Cancelling twice is a no-op, not an error.
    h.engine.cancel_instance(instance.instance_id, "second call").await.unwrap();
}
