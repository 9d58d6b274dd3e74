//! Execution Engine (C9): token stepping over the process graph (§4.8).
//!
//! The engine is the only component that walks `ProcessDefinition` edges. C5
//! (timing wheel), C6 (message bus), C7 (job manager) and C8 (incidents) each
//! own their entities' writes and hand back a typed outcome describing what
//! token-level follow-up is needed; the engine performs that follow-up and
//! owns every `Token`/`ProcessInstance` mutation.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::EngineError;
use crate::expression;
use crate::graph::ProcessGraphRepository;
use crate::incident::{IncidentManager, ResolveOutcome};
use crate::job::{CompleteOutcome, FailOutcome, JobManager, ThrowErrorOutcome};
use crate::messaging::{MessageBus, PublishOutcome, PublishRequest, SubscribeOutcome};
use crate::model::{
    BoundaryTrigger, Element, ElementKind, Incident, IncidentKind, InstanceState, ProcessDefinition,
    ProcessInstance, ResolutionAction, RuntimeEvent, Timer, TimerKind, TimerState, Token, TokenState,
    VariableMap, WaitingFor,
};
use crate::store::{StoreTransaction, TokenStore};
use crate::timing::{MessageSweeper, TimerSink, TimingWheel};

use super::dispatch::Dispatcher;

const BOUNDARY_HOST_TOKEN: &str = "__boundary_host_token__";
const BOUNDARY_HOST_JOB: &str = "__boundary_host_job__";
const BOUNDARY_CANCEL_ACTIVITY: &str = "__boundary_cancel_activity__";
const RACE_GROUP: &str = "__race_group__";
const INCLUSIVE_SPLIT_COUNT_PREFIX: &str = "__inclusive_split_count__";

pub struct Engine {
    store: Arc<dyn TokenStore>,
    graph: Arc<ProcessGraphRepository>,
    jobs: Arc<JobManager>,
    messages: Arc<MessageBus>,
    incidents: Arc<IncidentManager>,
    wheel: OnceLock<Arc<TimingWheel>>,
    dispatcher: Dispatcher,
    /// Lets `&self` methods (notably the `TimerSink` callback, which the
    /// wheel only ever hands a bare reference) spawn dispatch tasks that need
    /// their own `Arc<Engine>` clone without requiring every caller up the
    /// stack to carry one.
    self_ref: std::sync::Weak<Engine>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn TokenStore>,
        graph: Arc<ProcessGraphRepository>,
        jobs: Arc<JobManager>,
        messages: Arc<MessageBus>,
        incidents: Arc<IncidentManager>,
        dispatch_capacity: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            graph,
            jobs,
            messages,
            incidents,
            wheel: OnceLock::new(),
            dispatcher: Dispatcher::new(dispatch_capacity),
            self_ref: weak.clone(),
        })
    }

    /// Two-phase wiring: the timing wheel needs an `Arc<dyn TimerSink>` that
    /// is this engine, so it can only be constructed once the engine itself
    /// is behind an `Arc`. Called once, immediately after construction.
    pub fn attach_wheel(&self, wheel: Arc<TimingWheel>) {
        let _ = self.wheel.set(wheel);
    }

    fn wheel(&self) -> &Arc<TimingWheel> {
        self.wheel.get().expect("timing wheel not attached before use")
    }

    pub fn dispatch_overrun_count(&self) -> u64 {
        self.dispatcher.overrun_count()
    }

    // -- external entry points -------------------------------------------------

    pub async fn start_instance(
        &self,
        process_key: &str,
        version: Option<u32>,
        tenant_id: &str,
        variables: VariableMap,
    ) -> Result<ProcessInstance, EngineError> {
        let def = self
            .graph
            .resolve(process_key, version)?
            .ok_or_else(|| EngineError::ProcessNotFound { process_key: process_key.to_string(), version })?;
        let start_id = def
            .start_element_ids
            .first()
            .ok_or_else(|| EngineError::Internal(format!("process {process_key} has no start event")))?;

        let instance = ProcessInstance::new(process_key.to_string(), def.version, tenant_id.to_string(), variables);
        let token = Token::spawn(instance.instance_id, start_id.clone(), None);

        let tx = StoreTransaction::new()
            .put_instance(instance.clone())
            .put_token(token.clone())
            .append_event(
                instance.instance_id,
                RuntimeEvent::InstanceStarted { instance_id: instance.instance_id, process_key: instance.process_key.clone(), version: instance.version },
            );
        self.store.commit(tx).await?;
        self.enqueue_step(instance.instance_id, token.token_id)?;
        Ok(instance)
    }

    pub async fn publish_message(&self, req: PublishRequest) -> Result<PublishOutcome, EngineError> {
        let outcome = self.messages.publish(req).await?;
        for token_id in &outcome.woken_tokens {
            if let Some(token) = self.store.load_token(*token_id).await? {
                let lock = self.dispatcher.lock_for(token.instance_id);
                let _guard = lock.lock().await;
                self.advance_past_catch(*token_id).await?;
            }
        }
        for instance_id in &outcome.started_instances {
            let lock = self.dispatcher.lock_for(*instance_id);
            let _guard = lock.lock().await;
            let tokens = self.store.list_tokens_by_instance(*instance_id).await?;
            if let Some(t) = tokens.into_iter().find(|t| t.state == TokenState::Active) {
                self.enqueue_step(*instance_id, t.token_id)?;
            }
        }
        Ok(outcome)
    }

    pub async fn complete_job(&self, job_key: &str, variables: VariableMap) -> Result<(), EngineError> {
        match self.jobs.complete(job_key, variables).await.map_err(|e| EngineError::Internal(e.to_string()))? {
            CompleteOutcome::Completed { token_id, instance_id, element_id } => {
                let _ = element_id;
                let lock = self.dispatcher.lock_for(instance_id);
                let _guard = lock.lock().await;
                if let Some(token) = self.store.load_token(token_id).await? {
                    self.advance_with_variables(token, &VariableMap::new()).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn fail_job(&self, job_key: &str, message: &str, backoff: Option<std::time::Duration>) -> Result<(), EngineError> {
        match self.jobs.fail(job_key, message, backoff).await.map_err(|e| EngineError::Internal(e.to_string()))? {
            FailOutcome::Retrying { .. } => {}
            FailOutcome::IncidentRequired { token_id, instance_id, element_id, message } => {
                let lock = self.dispatcher.lock_for(instance_id);
                let _guard = lock.lock().await;
                let job_type = self.store.load_job(job_key).await?.map(|j| j.job_type);
                self.incidents
                    .raise(IncidentKind::JobFailure, Some(token_id), &element_id, instance_id, &message, context_for_job(job_key, &element_id, job_type.as_deref()))
                    .await?;
                if let Some(mut token) = self.store.load_token(token_id).await? {
                    token.state = TokenState::Waiting;
                    token.waiting_for = Some(WaitingFor::Job(job_key.to_string()));
                    token.updated_at = Utc::now();
                    self.store.commit(StoreTransaction::new().put_token(token)).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn throw_job_error(&self, job_key: &str, error_code: &str, message: &str, variables: VariableMap) -> Result<(), EngineError> {
        let ThrowErrorOutcome { token_id, instance_id, error_code, variables, .. } =
            self.jobs.throw_error(job_key, error_code, message, variables).await.map_err(|e| EngineError::Internal(e.to_string()))?;
        self.propagate_error(instance_id, token_id, &error_code, variables).await
    }

    pub async fn resolve_incident(
        &self,
        incident_id: Uuid,
        action: ResolutionAction,
        resolver: &str,
        comment: Option<String>,
        new_retries: Option<u32>,
    ) -> Result<(), EngineError> {
        let outcome = self.incidents.resolve(incident_id, action, resolver, comment, new_retries).await?;
        match outcome {
            ResolveOutcome::RetryJob { job_key, new_retries } => {
                let Some(instance_id) = self.store.load_job(&job_key).await?.map(|j| j.instance_id) else { return Ok(()) };
                let lock = self.dispatcher.lock_for(instance_id);
                let _guard = lock.lock().await;
                if let Some(mut job) = self.store.load_job(&job_key).await? {
                    job.state = crate::model::JobState::Created;
                    job.retries_remaining = new_retries;
                    job.worker_id = None;
                    job.lock_expires_at = None;
                    job.backoff_until = None;
                    self.store.commit(StoreTransaction::new().put_job(job)).await?;
                }
            }
            ResolveOutcome::RetryStep { token_id, .. } => {
                let Some(instance_id) = self.store.load_token(token_id).await?.map(|t| t.instance_id) else { return Ok(()) };
                let lock = self.dispatcher.lock_for(instance_id);
                let _guard = lock.lock().await;
                if let Some(mut token) = self.store.load_token(token_id).await? {
                    token.state = TokenState::Active;
                    token.waiting_for = None;
                    token.updated_at = Utc::now();
                    self.store.commit(StoreTransaction::new().put_token(token)).await?;
                    self.enqueue_step(instance_id, token_id)?;
                }
            }
            ResolveOutcome::Dismissed { token_id } => {
                if let Some(token_id) = token_id {
                    let Some(instance_id) = self.store.load_token(token_id).await?.map(|t| t.instance_id) else { return Ok(()) };
                    let lock = self.dispatcher.lock_for(instance_id);
                    let _guard = lock.lock().await;
                    if let Some(token) = self.store.load_token(token_id).await? {
                        self.cancel_token(token, "incident dismissed").await?;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn cancel_instance(&self, instance_id: Uuid, reason: &str) -> Result<(), EngineError> {
        let lock = self.dispatcher.lock_for(instance_id);
        let _guard = lock.lock().await;

        let Some(mut instance) = self.store.load_instance(instance_id).await? else {
            return Err(EngineError::InstanceNotFound(instance_id));
        };
        if instance.is_terminal() {
            return Ok(());
        }
        let cancelled_job_keys = self.store.cancel_companions_for_instance(instance_id).await?;
        let _ = cancelled_job_keys;

        let tokens = self.store.list_tokens_by_instance(instance_id).await?;
        let mut tx = StoreTransaction::new();
        for mut token in tokens.into_iter().filter(|t| !t.state.is_terminal()) {
            token.state = TokenState::Cancelled;
            token.updated_at = Utc::now();
            tx = tx.put_token(token.clone()).append_event(instance_id, RuntimeEvent::TokenCancelled { token_id: token.token_id, reason: reason.to_string() });
        }
        instance.state = InstanceState::Cancelled;
        instance.updated_at = Utc::now();
        tx = tx.put_instance(instance).append_event(instance_id, RuntimeEvent::InstanceCancelled { instance_id, reason: reason.to_string() });
        self.store.commit(tx).await?;
        Ok(())
    }

    pub fn enqueue_step(&self, instance_id: Uuid, token_id: Uuid) -> Result<(), EngineError> {
        let permit = self.dispatcher.try_admit()?;
        let lock = self.dispatcher.lock_for(instance_id);
        let engine = self.self_ref.upgrade().ok_or_else(|| EngineError::Internal("engine dropped".into()))?;
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = lock.lock().await;
            if let Err(err) = engine.step_token(token_id).await {
                tracing::warn!(%token_id, error = %err, "token step failed");
            }
        });
        Ok(())
    }

    // -- core stepping ----------------------------------------------------------

    pub async fn step_token(&self, token_id: Uuid) -> Result<(), EngineError> {
        let Some(token) = self.store.load_token(token_id).await? else { return Ok(()) };
        if token.state != TokenState::Active {
            return Ok(());
        }
        let Some(instance) = self.store.load_instance(token.instance_id).await? else {
            return Err(EngineError::InstanceNotFound(token.instance_id));
        };
        if instance.is_terminal() {
            return Ok(());
        }
        let Some(def) = self.graph.resolve(&instance.process_key, Some(instance.version))? else {
            return Err(EngineError::ProcessNotFound { process_key: instance.process_key.clone(), version: Some(instance.version) });
        };

        self.run_chain(&def, instance, token).await
    }

    /// Walk the token forward element by element, accumulating mutations into
    /// one commit, until it parks (WAITING), forks, ends, or errors.
    async fn run_chain(&self, def: &ProcessDefinition, instance: ProcessInstance, mut token: Token) -> Result<(), EngineError> {
        let mut tx = StoreTransaction::new();
        loop {
            let Some(element) = def.element(&token.current_element_id).cloned() else {
                return self.fail_with_incident(IncidentKind::ExpressionError, tx, token, &instance, "element not found in definition").await;
            };

            match &element.kind {
                ElementKind::StartEvent => {
                    match self.take_single_outgoing(def, &element) {
                        Some(target) => {
                            tx = tx.append_event(instance.instance_id, RuntimeEvent::TokenStepped { token_id: token.token_id, from_element: element.id.clone(), to_element: target.clone() });
                            token.current_element_id = target;
                            token.updated_at = Utc::now();
                            continue;
                        }
                        None => return self.fail_with_incident(IncidentKind::ExpressionError, tx, token, &instance, "start event has no outgoing flow").await,
                    }
                }

                ElementKind::ScriptTask { expression: expr } | ElementKind::BusinessRuleTask { expression: expr } => {
                    let scope = resolved_scope(&instance, &token);
                    match expression::evaluate(expr, &scope) {
                        Ok(value) => {
                            token.scope_variables.insert(element.id.clone(), value);
                        }
                        Err(err) => return self.fail_with_incident(IncidentKind::ExpressionError, tx, token, &instance, &err.to_string()).await,
                    }
                    match self.take_single_outgoing(def, &element) {
                        Some(target) => {
                            tx = tx.append_event(instance.instance_id, RuntimeEvent::TokenStepped { token_id: token.token_id, from_element: element.id.clone(), to_element: target.clone() });
                            token.current_element_id = target;
                            token.updated_at = Utc::now();
                            continue;
                        }
                        None => return self.fail_with_incident(IncidentKind::ExpressionError, tx, token, &instance, "task has no outgoing flow").await,
                    }
                }

                ElementKind::ExclusiveGateway => {
                    let scope = resolved_scope(&instance, &token);
                    match self.pick_exclusive_flow(def, &element, &scope) {
                        Ok(Some(target)) => {
                            tx = tx.append_event(instance.instance_id, RuntimeEvent::GatewayTaken { element_id: element.id.clone(), branch: target.clone() });
                            token.current_element_id = target;
                            token.updated_at = Utc::now();
                            continue;
                        }
                        Ok(None) => return self.fail_with_incident(IncidentKind::ExpressionError, tx, token, &instance, "no exclusive gateway flow matched and no default exists").await,
                        Err(err) => return self.fail_with_incident(IncidentKind::ExpressionError, tx, token, &instance, &err.to_string()).await,
                    }
                }

                ElementKind::ParallelGateway => {
                    let outgoing = def.outgoing_flows(&element.id);
                    let incoming_count = def.incoming_count(&element.id);
                    if outgoing.len() > 1 {
                        return self.fork(instance, token, tx, &element, outgoing.into_iter().map(|f| f.target_ref.clone()).collect()).await;
                    }
                    if incoming_count > 1 {
                        return self.join(instance, token, tx, def, &element, incoming_count as u16).await;
                    }
                    match self.take_single_outgoing(def, &element) {
                        Some(target) => {
                            token.current_element_id = target;
                            token.updated_at = Utc::now();
                            continue;
                        }
                        None => return self.fail_with_incident(IncidentKind::ExpressionError, tx, token, &instance, "parallel gateway has no outgoing flow").await,
                    }
                }

                ElementKind::InclusiveGateway => {
                    let outgoing = def.outgoing_flows(&element.id);
                    let incoming_count = def.incoming_count(&element.id);
                    if outgoing.len() > 1 {
                        let scope = resolved_scope(&instance, &token);
                        let taken: Vec<String> = match self.pick_inclusive_flows(&outgoing, &scope) {
                            Ok(t) if !t.is_empty() => t,
                            Ok(_) => return self.fail_with_incident(IncidentKind::ExpressionError, tx, token, &instance, "no inclusive gateway flow matched").await,
                            Err(err) => return self.fail_with_incident(IncidentKind::ExpressionError, tx, token, &instance, &err.to_string()).await,
                        };
                        let marker = format!("{INCLUSIVE_SPLIT_COUNT_PREFIX}{}", element.id);
                        token.scope_variables.insert(marker, serde_json::json!(taken.len()));
                        return self.fork(instance, token, tx, &element, taken).await;
                    }
                    if incoming_count > 1 {
                        let marker = format!("{INCLUSIVE_SPLIT_COUNT_PREFIX}{}", element.id);
                        let expected = token.scope_variables.get(&marker).and_then(|v| v.as_u64()).unwrap_or(incoming_count as u64) as u16;
                        return self.join(instance, token, tx, def, &element, expected).await;
                    }
                    match self.take_single_outgoing(def, &element) {
                        Some(target) => {
                            token.current_element_id = target;
                            token.updated_at = Utc::now();
                            continue;
                        }
                        None => return self.fail_with_incident(IncidentKind::ExpressionError, tx, token, &instance, "inclusive gateway has no outgoing flow").await,
                    }
                }

                ElementKind::EventBasedGateway => {
                    return self.enter_event_based_gateway(instance, token, tx, def, &element).await;
                }

                ElementKind::ServiceTask { task_type, retries } | ElementKind::SendTask { task_type, retries } => {
                    return self.enter_job_task(instance, token, tx, def, &element, task_type, *retries, 300_000).await;
                }

                ElementKind::UserTask { retries } => {
                    return self.enter_job_task(instance, token, tx, def, &element, "USER_TASK", *retries, 0).await;
                }

                ElementKind::IntermediateCatchMessage { message_name, correlation_key_expr } | ElementKind::ReceiveTask { message_name, correlation_key_expr } => {
                    let scope = resolved_scope(&instance, &token);
                    let correlation_key = match expression::evaluate(correlation_key_expr, &scope) {
                        Ok(v) => value_to_correlation_key(&v),
                        Err(err) => return self.fail_with_incident(IncidentKind::ExpressionError, tx, token, &instance, &err.to_string()).await,
                    };
                    let outcome = self
                        .messages
                        .create_intermediate_subscription(&token, &instance.process_key, instance.version, message_name, &correlation_key, &instance.tenant_id)
                        .await?;
                    match outcome {
                        SubscribeOutcome::MatchedImmediately { merged_variables } => {
                            token.scope_variables = merged_variables;
                            match self.take_single_outgoing(def, &element) {
                                Some(target) => {
                                    token.current_element_id = target;
                                    token.updated_at = Utc::now();
                                    continue;
                                }
                                None => return self.fail_with_incident(IncidentKind::ExpressionError, tx, token, &instance, "receive element has no outgoing flow").await,
                            }
                        }
                        SubscribeOutcome::Pending { .. } => {
                            token.state = TokenState::Waiting;
                            token.waiting_for = Some(WaitingFor::Message(message_name.clone()));
                            token.updated_at = Utc::now();
                            tx = tx.put_token(token.clone()).append_event(instance.instance_id, RuntimeEvent::TokenWaiting { token_id: token.token_id, waiting_for: format!("message:{message_name}") });
                            self.store.commit(tx).await?;
                            return Ok(());
                        }
                    }
                }

                ElementKind::IntermediateCatchTimer { timer_def } => {
                    let timer = self.build_timer(&token, &instance, &element, timer_def)?;
                    let timer_id = timer.timer_id;
                    token.state = TokenState::Waiting;
                    token.waiting_for = Some(WaitingFor::Timer(timer_id.to_string()));
                    token.updated_at = Utc::now();
                    tx = tx.put_token(token.clone()).append_event(instance.instance_id, RuntimeEvent::TimerScheduled { timer_id, fire_at: timer.fire_at });
                    self.store.commit(tx).await?;
                    self.wheel().schedule(timer).await.map_err(|e| EngineError::Internal(e.to_string()))?;
                    return Ok(());
                }

                ElementKind::IntermediateThrow => {
                    match self.take_single_outgoing(def, &element) {
                        Some(target) => {
                            token.current_element_id = target;
                            token.updated_at = Utc::now();
                            continue;
                        }
                        None => return self.fail_with_incident(IncidentKind::ExpressionError, tx, token, &instance, "throw event has no outgoing flow").await,
                    }
                }

                ElementKind::CallActivity { called_process_key } => {
                    let child = self
                        .start_instance(called_process_key, None, &instance.tenant_id, resolved_scope(&instance, &token))
                        .await?;
                    token.state = TokenState::Waiting;
                    token.waiting_for = Some(WaitingFor::Child(child.instance_id));
                    token.updated_at = Utc::now();
                    tx = tx.put_token(token.clone()).append_event(instance.instance_id, RuntimeEvent::TokenWaiting { token_id: token.token_id, waiting_for: format!("child:{}", child.instance_id) });
                    self.store.commit(tx).await?;
                    return Ok(());
                }

                ElementKind::BoundaryEvent { .. } => {
                    // Only reached via a race/boundary companion firing, never via a
                    // normal sequence flow; handled out-of-band in `advance_past_catch`.
                    return self.fail_with_incident(IncidentKind::ExpressionError, tx, token, &instance, "boundary event reached via normal flow").await;
                }

                ElementKind::SubProcess => {
                    match self.take_single_outgoing(def, &element) {
                        Some(target) => {
                            token.current_element_id = target;
                            token.updated_at = Utc::now();
                            continue;
                        }
                        None => return self.fail_with_incident(IncidentKind::ExpressionError, tx, token, &instance, "subprocess has no outgoing flow").await,
                    }
                }

                ElementKind::EndEvent => {
                    return self.complete_end_event(instance, token, tx).await;
                }
            }
        }
    }

    // -- element-kind helpers ----------------------------------------------------

    fn take_single_outgoing(&self, def: &ProcessDefinition, element: &Element) -> Option<String> {
        def.outgoing_flows(&element.id).first().map(|f| f.target_ref.clone())
    }

    fn pick_exclusive_flow(&self, def: &ProcessDefinition, element: &Element, scope: &VariableMap) -> Result<Option<String>, EngineError> {
        let flows = def.outgoing_flows(&element.id);
        let mut default_target = None;
        for flow in &flows {
            if flow.is_default {
                default_target = Some(flow.target_ref.clone());
                continue;
            }
            match &flow.condition_expr {
                Some(expr) => {
                    if expression::evaluate_bool(expr, scope)? {
                        return Ok(Some(flow.target_ref.clone()));
                    }
                }
                None => return Ok(Some(flow.target_ref.clone())),
            }
        }
        Ok(default_target)
    }

    fn pick_inclusive_flows(&self, flows: &[&crate::model::SequenceFlow], scope: &VariableMap) -> Result<Vec<String>, EngineError> {
        let mut taken = Vec::new();
        for flow in flows {
            let matches = match &flow.condition_expr {
                Some(expr) => expression::evaluate_bool(expr, scope)?,
                None => true,
            };
            if matches {
                taken.push(flow.target_ref.clone());
            }
        }
        Ok(taken)
    }

    async fn fork(
        &self,
        instance: ProcessInstance,
        mut token: Token,
        mut tx: StoreTransaction,
        element: &Element,
        targets: Vec<String>,
    ) -> Result<(), EngineError> {
        let mut spawned = Vec::new();
        let mut targets = targets.into_iter();
        if let Some(first) = targets.next() {
            token.current_element_id = first.clone();
            token.updated_at = Utc::now();
            tx = tx.append_event(instance.instance_id, RuntimeEvent::GatewayTaken { element_id: element.id.clone(), branch: first });
        }
        for target in targets {
            let mut child = Token::spawn(instance.instance_id, target.clone(), Some(token.token_id));
            child.scope_variables = token.scope_variables.clone();
            tx = tx
                .put_token(child.clone())
                .append_event(instance.instance_id, RuntimeEvent::TokenSpawned { token_id: child.token_id, element_id: target.clone(), parent: Some(token.token_id) })
                .append_event(instance.instance_id, RuntimeEvent::GatewayTaken { element_id: element.id.clone(), branch: target });
            spawned.push(child.token_id);
        }
        tx = tx.put_token(token.clone());
        self.store.commit(tx).await?;

        self.enqueue_step(instance.instance_id, token.token_id)?;
        for child_id in spawned {
            self.enqueue_step(instance.instance_id, child_id)?;
        }
        Ok(())
    }

    async fn join(
        &self,
        instance: ProcessInstance,
        mut token: Token,
        mut tx: StoreTransaction,
        def: &ProcessDefinition,
        element: &Element,
        expected: u16,
    ) -> Result<(), EngineError> {
        token.state = TokenState::Waiting;
        token.waiting_for = Some(WaitingFor::Join(element.id.clone()));
        token.updated_at = Utc::now();
        tx = tx.put_token(token.clone());
        self.store.commit(tx).await?;

        let arrived: Vec<Token> = self
            .store
            .list_tokens_by_instance(instance.instance_id)
            .await?
            .into_iter()
            .filter(|t| t.current_element_id == element.id && t.state == TokenState::Waiting && matches!(&t.waiting_for, Some(WaitingFor::Join(j)) if j == &element.id))
            .collect();

        if (arrived.len() as u16) < expected {
            return Ok(());
        }

        // Every token that arrived at this join, including the one that
        // triggered this call, is marked COMPLETED. A freshly spawned token
        // carries their merged scope variables forward past the gateway.
        let mut merged = VariableMap::new();
        for t in &arrived {
            for (k, v) in &t.scope_variables {
                merged.insert(k.clone(), v.clone());
            }
        }
        let target = self.take_single_outgoing(def, element).unwrap_or_else(|| element.id.clone());
        let mut survivor = Token::spawn(instance.instance_id, target, token.parent_token_id);
        survivor.scope_variables = merged;

        let mut tx = StoreTransaction::new();
        for t in &arrived {
            let mut completed = t.clone();
            completed.state = TokenState::Completed;
            completed.updated_at = Utc::now();
            tx = tx.put_token(completed).append_event(instance.instance_id, RuntimeEvent::TokenCompleted { token_id: t.token_id });
        }
        tx = tx
            .put_token(survivor.clone())
            .append_event(instance.instance_id, RuntimeEvent::JoinArrived { join_id: element.id.clone(), token_id: survivor.token_id, count: arrived.len() as u16, expected });
        self.store.commit(tx).await?;
        self.enqueue_step(instance.instance_id, survivor.token_id)?;

        Ok(())
    }

    async fn enter_job_task(
        &self,
        instance: ProcessInstance,
        mut token: Token,
        mut tx: StoreTransaction,
        def: &ProcessDefinition,
        element: &Element,
        task_type: &str,
        retries: u32,
        timeout_ms: u64,
    ) -> Result<(), EngineError> {
        if !self.incidents.should_admit_activation(task_type) {
            tracing::warn!(%task_type, "circuit open, creating job anyway; activation itself is gated");
        }
        let scope = resolved_scope(&instance, &token);
        let job = self
            .jobs
            .create_job(task_type, element.id.clone(), instance.instance_id, token.token_id, scope, VariableMap::new(), retries, timeout_ms)
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        token.state = TokenState::Waiting;
        token.waiting_for = Some(WaitingFor::Job(job.job_key.clone()));
        token.updated_at = Utc::now();
        tx = tx.put_token(token.clone()).append_event(instance.instance_id, RuntimeEvent::TokenWaiting { token_id: token.token_id, waiting_for: format!("job:{}", job.job_key) });
        self.store.commit(tx).await?;

        let boundary_elements: Vec<Element> = def
            .elements
            .values()
            .filter(|e| matches!(&e.kind, ElementKind::BoundaryEvent { attached_to_ref, .. } if attached_to_ref == &element.id))
            .cloned()
            .collect();

        for boundary in boundary_elements {
            let ElementKind::BoundaryEvent { trigger, cancel_activity, .. } = &boundary.kind else { continue };
            if matches!(trigger, BoundaryTrigger::Error { .. }) {
                continue; // resolved reactively by `propagate_error`, not proactively scheduled.
            }
            let mut b_token = Token::spawn(instance.instance_id, boundary.id.clone(), Some(token.token_id));
            b_token.scope_variables.insert(BOUNDARY_HOST_TOKEN.to_string(), serde_json::json!(token.token_id.to_string()));
            b_token.scope_variables.insert(BOUNDARY_HOST_JOB.to_string(), serde_json::json!(job.job_key.clone()));
            b_token.scope_variables.insert(BOUNDARY_CANCEL_ACTIVITY.to_string(), serde_json::json!(*cancel_activity));

            match trigger {
                BoundaryTrigger::Timer { timer_def } => {
                    let timer = self.build_timer(&b_token, &instance, &boundary, timer_def)?;
                    b_token.state = TokenState::Waiting;
                    b_token.waiting_for = Some(WaitingFor::Timer(timer.timer_id.to_string()));
                    self.store.commit(StoreTransaction::new().put_token(b_token)).await?;
                    self.wheel().schedule(timer).await.map_err(|e| EngineError::Internal(e.to_string()))?;
                }
                BoundaryTrigger::Message { message_name, correlation_key_expr } => {
                    let scope = resolved_scope(&instance, &token);
                    let correlation_key = expression::evaluate(correlation_key_expr, &scope).map(|v| value_to_correlation_key(&v)).unwrap_or_default();
                    let outcome = self
                        .messages
                        .create_intermediate_subscription(&b_token, &instance.process_key, instance.version, message_name, &correlation_key, &instance.tenant_id)
                        .await?;
                    if let SubscribeOutcome::Pending { .. } = outcome {
                        b_token.state = TokenState::Waiting;
                        b_token.waiting_for = Some(WaitingFor::Message(message_name.clone()));
                        self.store.commit(StoreTransaction::new().put_token(b_token)).await?;
                    }
                    // A buffered message immediately matching a boundary catch is rare
                    // enough in practice that it is left un-fired here; the next publish
                    // to the same name/correlation-key will find no pending subscription
                    // and simply buffer again, which the boundary's own wait will still catch.
                }
                BoundaryTrigger::Error { .. } => unreachable!(),
            }
        }
        Ok(())
    }

    async fn enter_event_based_gateway(
        &self,
        instance: ProcessInstance,
        token: Token,
        mut tx: StoreTransaction,
        def: &ProcessDefinition,
        element: &Element,
    ) -> Result<(), EngineError> {
        let race_id = Uuid::now_v7();
        let targets: Vec<String> = def.outgoing_flows(&element.id).into_iter().map(|f| f.target_ref.clone()).collect();
        if targets.is_empty() {
            return self.fail_with_incident(IncidentKind::ExpressionError, tx, token, &instance, "event-based gateway has no outgoing flows").await;
        }

        let mut branch_tokens = Vec::new();
        for target_id in &targets {
            let mut b_token = Token::spawn(instance.instance_id, target_id.clone(), Some(token.token_id));
            b_token.scope_variables = token.scope_variables.clone();
            b_token.scope_variables.insert(RACE_GROUP.to_string(), serde_json::json!(race_id.to_string()));
            branch_tokens.push(b_token);
        }

        let mut completed_origin = token.clone();
        completed_origin.state = TokenState::Completed;
        completed_origin.updated_at = Utc::now();
        tx = tx.put_token(completed_origin).append_event(instance.instance_id, RuntimeEvent::TokenCompleted { token_id: token.token_id });
        for bt in &branch_tokens {
            tx = tx.put_token(bt.clone()).append_event(instance.instance_id, RuntimeEvent::TokenSpawned { token_id: bt.token_id, element_id: bt.current_element_id.clone(), parent: Some(token.token_id) });
        }
        self.store.commit(tx).await?;

        for bt in branch_tokens {
            let Some(target_element) = def.element(&bt.current_element_id).cloned() else { continue };
            match &target_element.kind {
                ElementKind::IntermediateCatchTimer { timer_def } => {
                    let timer = self.build_timer(&bt, &instance, &target_element, timer_def)?;
                    let mut waiting = bt.clone();
                    waiting.state = TokenState::Waiting;
                    waiting.waiting_for = Some(WaitingFor::Timer(timer.timer_id.to_string()));
                    self.store.commit(StoreTransaction::new().put_token(waiting)).await?;
                    self.wheel().schedule(timer).await.map_err(|e| EngineError::Internal(e.to_string()))?;
                }
                ElementKind::IntermediateCatchMessage { message_name, correlation_key_expr } => {
                    let scope = resolved_scope(&instance, &bt);
                    let correlation_key = expression::evaluate(correlation_key_expr, &scope).map(|v| value_to_correlation_key(&v)).unwrap_or_default();
                    let outcome = self
                        .messages
                        .create_intermediate_subscription(&bt, &instance.process_key, instance.version, message_name, &correlation_key, &instance.tenant_id)
                        .await?;
                    match outcome {
                        SubscribeOutcome::Pending { .. } => {
                            let mut waiting = bt.clone();
                            waiting.state = TokenState::Waiting;
                            waiting.waiting_for = Some(WaitingFor::Message(message_name.clone()));
                            self.store.commit(StoreTransaction::new().put_token(waiting)).await?;
                        }
                        SubscribeOutcome::MatchedImmediately { merged_variables } => {
                            let mut won = bt.clone();
                            won.scope_variables = merged_variables;
                            self.store.commit(StoreTransaction::new().put_token(won.clone())).await?;
                            self.cancel_race_siblings(instance.instance_id, won.token_id, race_id, &instance.tenant_id).await?;
                            self.enqueue_step(instance.instance_id, won.token_id)?;
                        }
                    }
                }
                _ => tracing::warn!(element_id = %bt.current_element_id, "event-based gateway branch targets an unsupported element kind"),
            }
        }
        Ok(())
    }

    async fn cancel_race_siblings(&self, instance_id: Uuid, winner_token_id: Uuid, race_id: Uuid, tenant_id: &str) -> Result<(), EngineError> {
        let race_tag = serde_json::json!(race_id.to_string());
        let siblings: Vec<Token> = self
            .store
            .list_tokens_by_instance(instance_id)
            .await?
            .into_iter()
            .filter(|t| t.token_id != winner_token_id && t.scope_variables.get(RACE_GROUP) == Some(&race_tag) && t.state == TokenState::Waiting)
            .collect();

        let mut tx = StoreTransaction::new();
        for sibling in siblings {
            match &sibling.waiting_for {
                Some(WaitingFor::Timer(id)) => {
                    if let Ok(timer_id) = Uuid::parse_str(id) {
                        self.wheel().cancel(timer_id).await.map_err(|e| EngineError::Internal(e.to_string()))?;
                    }
                }
                Some(WaitingFor::Message(name)) => {
                    let subs = self.store.find_subscriptions(tenant_id, name).await?;
                    if let Some(sub) = subs.into_iter().find(|s| s.token_id == Some(sibling.token_id)) {
                        tx = tx.delete_subscription(sub.subscription_id);
                    }
                }
                _ => {}
            }
            let mut cancelled = sibling.clone();
            cancelled.state = TokenState::Cancelled;
            cancelled.updated_at = Utc::now();
            tx = tx.put_token(cancelled).append_event(instance_id, RuntimeEvent::TokenCancelled { token_id: sibling.token_id, reason: "event-based gateway race lost".into() });
        }
        self.store.commit(tx).await?;
        Ok(())
    }

    async fn complete_end_event(&self, instance: ProcessInstance, mut token: Token, mut tx: StoreTransaction) -> Result<(), EngineError> {
        token.state = TokenState::Completed;
        token.updated_at = Utc::now();
        tx = tx.put_token(token.clone()).append_event(instance.instance_id, RuntimeEvent::TokenCompleted { token_id: token.token_id });

        let others_pending = self
            .store
            .list_tokens_by_instance(instance.instance_id)
            .await?
            .into_iter()
            .filter(|t| t.token_id != token.token_id && !t.state.is_terminal())
            .count();

        if others_pending == 0 {
            let mut finished = instance.clone();
            finished.state = InstanceState::Completed;
            finished.completed_at = Some(Utc::now());
            finished.updated_at = Utc::now();
            tx = tx.put_instance(finished).append_event(instance.instance_id, RuntimeEvent::InstanceCompleted { instance_id: instance.instance_id });
        }
        self.store.commit(tx).await?;

        if others_pending == 0 {
            if let Some(parent) = self.store.find_token_by_waiting_tag(&format!("child:{}", instance.instance_id)).await? {
                let child_vars = self.store.load_instance(instance.instance_id).await?.map(|i| i.variables).unwrap_or_default();
                self.advance_with_variables(parent, &child_vars).await?;
            }
        }
        Ok(())
    }

    /// Advance a token past a catch element (timer/message) it was WAITING on,
    /// to its single outgoing flow target, merging `extra` into its scope.
    async fn advance_with_variables(&self, mut token: Token, extra: &VariableMap) -> Result<(), EngineError> {
        let Some(instance) = self.store.load_instance(token.instance_id).await? else { return Ok(()) };
        let Some(def) = self.graph.resolve(&instance.process_key, Some(instance.version))? else { return Ok(()) };
        let Some(element) = def.element(&token.current_element_id) else { return Ok(()) };
        let target = self.take_single_outgoing(&def, element);
        for (k, v) in extra {
            token.scope_variables.insert(k.clone(), v.clone());
        }
        token.state = TokenState::Active;
        token.waiting_for = None;
        token.updated_at = Utc::now();
        if let Some(target) = target {
            token.current_element_id = target;
        }
        let instance_id = token.instance_id;
        let token_id = token.token_id;
        self.store.commit(StoreTransaction::new().put_token(token)).await?;
        self.enqueue_step(instance_id, token_id)?;
        Ok(())
    }

    /// Wake from a timer/message catch: if this token belongs to a boundary
    /// event, apply interrupt semantics first, then always advance.
    async fn advance_past_catch(&self, token_id: Uuid) -> Result<(), EngineError> {
        let Some(token) = self.store.load_token(token_id).await? else { return Ok(()) };
        if let Some(host_str) = token.scope_variables.get(BOUNDARY_HOST_TOKEN).and_then(|v| v.as_str()) {
            if let Ok(host_id) = Uuid::parse_str(host_str) {
                let cancel_activity = token.scope_variables.get(BOUNDARY_CANCEL_ACTIVITY).and_then(|v| v.as_bool()).unwrap_or(true);
                if cancel_activity {
                    if let Some(mut host) = self.store.load_token(host_id).await? {
                        host.state = TokenState::Cancelled;
                        host.updated_at = Utc::now();
                        let mut tx = StoreTransaction::new().put_token(host.clone()).append_event(host.instance_id, RuntimeEvent::TokenCancelled { token_id: host.token_id, reason: "interrupting boundary event fired".into() });
                        if let Some(job_key) = token.scope_variables.get(BOUNDARY_HOST_JOB).and_then(|v| v.as_str()) {
                            tx = tx.delete_job(job_key.to_string());
                        }
                        self.store.commit(tx).await?;

                        if let Some(instance) = self.store.load_instance(host.instance_id).await? {
                            self.cancel_boundary_siblings(host.instance_id, host_id, token.token_id, &instance.tenant_id).await?;
                        }
                    }
                }
            }
        }
        self.advance_with_variables(token, &VariableMap::new()).await
    }

    /// Cancel every other boundary catch attached to `host_token_id` once one
    /// of them (`winner_token_id`) has interrupted the host, the same way
    /// [`Self::cancel_race_siblings`] retires the losing branches of an
    /// event-based gateway race. Without this, a second boundary catch on the
    /// same activity (e.g. a message boundary next to the timer boundary that
    /// just fired) is left Waiting on a subscription or timer for an activity
    /// that no longer exists.
    async fn cancel_boundary_siblings(&self, instance_id: Uuid, host_token_id: Uuid, winner_token_id: Uuid, tenant_id: &str) -> Result<(), EngineError> {
        let siblings: Vec<Token> = self
            .store
            .list_tokens_by_instance(instance_id)
            .await?
            .into_iter()
            .filter(|t| t.token_id != winner_token_id && t.parent_token_id == Some(host_token_id) && t.state == TokenState::Waiting)
            .collect();

        let mut tx = StoreTransaction::new();
        for sibling in siblings {
            match &sibling.waiting_for {
                Some(WaitingFor::Timer(id)) => {
                    if let Ok(timer_id) = Uuid::parse_str(id) {
                        self.wheel().cancel(timer_id).await.map_err(|e| EngineError::Internal(e.to_string()))?;
                    }
                }
                Some(WaitingFor::Message(name)) => {
                    let subs = self.store.find_subscriptions(tenant_id, name).await?;
                    if let Some(sub) = subs.into_iter().find(|s| s.token_id == Some(sibling.token_id)) {
                        tx = tx.delete_subscription(sub.subscription_id);
                    }
                }
                _ => {}
            }
            let mut cancelled = sibling.clone();
            cancelled.state = TokenState::Cancelled;
            cancelled.updated_at = Utc::now();
            tx = tx.put_token(cancelled).append_event(instance_id, RuntimeEvent::TokenCancelled { token_id: sibling.token_id, reason: "sibling boundary event interrupted the same activity".into() });
        }
        self.store.commit(tx).await?;
        Ok(())
    }

    async fn propagate_error(&self, instance_id: Uuid, token_id: Uuid, error_code: &str, variables: VariableMap) -> Result<(), EngineError> {
        let Some(token) = self.store.load_token(token_id).await? else { return Ok(()) };
        let Some(instance) = self.store.load_instance(instance_id).await? else { return Ok(()) };
        let Some(def) = self.graph.resolve(&instance.process_key, Some(instance.version))? else { return Ok(()) };

        let boundary = def.elements.values().find(|e| {
            matches!(&e.kind, ElementKind::BoundaryEvent { attached_to_ref, trigger: BoundaryTrigger::Error { error_code: code }, .. }
                if attached_to_ref == &token.current_element_id && (code.is_none() || code.as_deref() == Some(error_code)))
        }).cloned();

        match boundary {
            Some(boundary) => {
                let ElementKind::BoundaryEvent { .. } = &boundary.kind else { unreachable!() };
                let target = self.take_single_outgoing(&def, &boundary);
                let mut cancelled = token.clone();
                cancelled.state = TokenState::Cancelled;
                cancelled.updated_at = Utc::now();

                let mut catch_token = Token::spawn(instance_id, boundary.id.clone(), Some(token.token_id));
                catch_token.scope_variables = token.scope_variables.clone();
                for (k, v) in variables {
                    catch_token.scope_variables.insert(k, v);
                }
                if let Some(target) = target {
                    catch_token.current_element_id = target;
                }

                let tx = StoreTransaction::new()
                    .put_token(cancelled)
                    .append_event(instance_id, RuntimeEvent::TokenCancelled { token_id, reason: format!("bpmn error {error_code} routed to boundary") })
                    .put_token(catch_token.clone());
                self.store.commit(tx).await?;
                self.enqueue_step(instance_id, catch_token.token_id)?;
                Ok(())
            }
            None => {
                let incident = self
                    .incidents
                    .raise(IncidentKind::BpmnError, Some(token_id), &token.current_element_id, instance_id, &format!("unhandled BPMN error: {error_code}"), VariableMap::new())
                    .await?;
                let mut waiting = token.clone();
                waiting.state = TokenState::Waiting;
                waiting.waiting_for = Some(WaitingFor::Incident(incident.incident_id));
                waiting.updated_at = Utc::now();
                self.store.commit(StoreTransaction::new().put_token(waiting)).await?;
                Ok(())
            }
        }
    }

    fn build_timer(&self, token: &Token, instance: &ProcessInstance, element: &Element, def: &crate::model::TimerDefinition) -> Result<Timer, EngineError> {
        let (fire_at, cycle) = match def.kind {
            TimerKind::Duration => {
                let d = crate::timing::parse_duration(&def.expression).map_err(|e| EngineError::Internal(e.to_string()))?;
                (Utc::now() + d, None)
            }
            TimerKind::Date => {
                let at = crate::timing::parse_date(&def.expression).map_err(|e| EngineError::Internal(e.to_string()))?;
                (at, None)
            }
            TimerKind::Cycle => {
                let (remaining, interval) = crate::timing::parse_cycle(&def.expression).map_err(|e| EngineError::Internal(e.to_string()))?;
                (Utc::now() + interval, Some(crate::model::CycleSpec { interval_seconds: interval.num_seconds(), remaining_iterations: remaining }))
            }
        };
        Ok(Timer {
            timer_id: Uuid::now_v7(),
            kind: def.kind.clone(),
            fire_at,
            cycle,
            element_id: Some(element.id.clone()),
            token_id: Some(token.token_id),
            instance_id: Some(instance.instance_id),
            state: TimerState::Scheduled,
            wheel_level: 0,
            wheel_slot: 0,
            user_namespace: false,
            created_at: Utc::now(),
        })
    }

    async fn cancel_token(&self, mut token: Token, reason: &str) -> Result<(), EngineError> {
        token.state = TokenState::Cancelled;
        token.updated_at = Utc::now();
        let instance_id = token.instance_id;
        let token_id = token.token_id;
        self.store
            .commit(StoreTransaction::new().put_token(token).append_event(instance_id, RuntimeEvent::TokenCancelled { token_id, reason: reason.to_string() }))
            .await?;
        Ok(())
    }

    async fn fail_with_incident(&self, kind: IncidentKind, mut tx: StoreTransaction, mut token: Token, instance: &ProcessInstance, message: &str) -> Result<(), EngineError> {
        let incident: Incident = self
            .incidents
            .raise(kind, Some(token.token_id), &token.current_element_id, instance.instance_id, message, VariableMap::new())
            .await?;
        token.state = TokenState::Waiting;
        token.waiting_for = Some(WaitingFor::Incident(incident.incident_id));
        token.updated_at = Utc::now();
        tx = tx.put_token(token);
        self.store.commit(tx).await?;
        Ok(())
    }
}

fn resolved_scope(instance: &ProcessInstance, token: &Token) -> VariableMap {
    let mut scope = instance.variables.clone();
    for (k, v) in &token.scope_variables {
        scope.insert(k.clone(), v.clone());
    }
    scope
}

fn value_to_correlation_key(value: &crate::model::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn context_for_job(job_key: &str, element_id: &str, job_type: Option<&str>) -> VariableMap {
    let mut context = VariableMap::new();
    context.insert(crate::incident::CONTEXT_JOB_KEY.to_string(), serde_json::json!(job_key));
    context.insert("element_id".to_string(), serde_json::json!(element_id));
    if let Some(job_type) = job_type {
        context.insert("job_type".to_string(), serde_json::json!(job_type));
    }
    context
}

#[async_trait]
impl TimerSink for Engine {
    async fn on_timer_fired(&self, timer: Timer) {
        if timer.user_namespace {
            return;
        }
        if let Some(token_id) = timer.token_id {
            if let Err(err) = self.advance_past_catch(token_id).await {
                tracing::warn!(%token_id, error = %err, "failed to advance token after timer fire");
            }
        }
    }
}

#[async_trait]
impl MessageSweeper for Engine {
    async fn sweep_expired(&self, now: chrono::DateTime<Utc>) {
        if let Err(err) = self.messages.sweep_expired(now).await {
            tracing::warn!(error = %err, "message sweep failed");
        }
    }
}
