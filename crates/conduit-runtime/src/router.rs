use conduit_config::RouterConfig;
use conduit_core::{
    Allocation, ConduitError, ConversationId, EventBus, HubEvent, Result, SchemaContract,
};
use conduit_learning::{
    AllocationState, Candidate, DecisionEngine, FailureKind, FailureSignature, Learner, Outcome, RecoveryAction,
    SizeClass, TaskFeatures, Urgency,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::adapter::{Invocation, ModuleAdapter};
use crate::conversation::ConversationManager;
use crate::negotiator::SchemaNegotiator;
use crate::registry::ModuleRegistry;

/// Upper bound on a single adapter health probe.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// Cap on the backoff exponent so the delay can't overflow.
const MAX_BACKOFF_EXPONENT: u32 = 10;

// ── Circuit Breaker ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    /// Normal operation: dispatches flow through.
    Closed,
    /// Module is failing: reject dispatches immediately.
    Open { since: Instant },
    /// Let one probe dispatch through to test whether the module recovered.
    HalfOpen { probing: bool },
}

#[derive(Debug)]
struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
        }
    }

    /// Check whether a dispatch should be allowed.
    fn allow_request(&mut self, open_for: Duration) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { since } => {
                if since.elapsed() >= open_for {
                    self.state = CircuitState::HalfOpen { probing: true };
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen { probing: false } => {
                self.state = CircuitState::HalfOpen { probing: true };
                true
            }
            // Already probing: block additional concurrent dispatches
            CircuitState::HalfOpen { probing: true } => false,
        }
    }

    /// Open -> half-open once the open window has passed. Returns `true` on
    /// that transition.
    fn expire(&mut self, open_for: Duration) -> bool {
        if let CircuitState::Open { since } = self.state
            && since.elapsed() >= open_for
        {
            self.state = CircuitState::HalfOpen { probing: false };
            return true;
        }
        false
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.total_successes += 1;
        self.state = CircuitState::Closed;
    }

    fn record_failure(&mut self, threshold: u32) {
        self.consecutive_failures += 1;
        self.total_failures += 1;

        let probe_failed = matches!(self.state, CircuitState::HalfOpen { .. });
        if probe_failed || self.consecutive_failures >= threshold {
            self.state = CircuitState::Open { since: Instant::now() };
        }
    }

    fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
    }

    fn is_open(&self) -> bool {
        matches!(self.state, CircuitState::Open { .. })
    }
}

/// Counts a dispatch as in flight for as long as it lives, including when
/// the dispatch future is dropped at its deadline.
struct InFlight<'a> {
    counts: &'a DashMap<String, u32>,
    module: String,
}

impl<'a> InFlight<'a> {
    fn enter(counts: &'a DashMap<String, u32>, module: &str) -> Self {
        *counts.entry(module.to_string()).or_insert(0) += 1;
        Self {
            counts,
            module: module.to_string(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(mut n) = self.counts.get_mut(&self.module) {
            *n = n.saturating_sub(1);
        }
    }
}

// ── Requests and outcomes ──────────────────────────────────────

/// An inbound message to route.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub source: String,
    /// Explicit target. When absent the bandit picks among `capability` providers.
    pub target: Option<String>,
    pub capability: Option<String>,
    /// Bandit context; defaults to the capability name.
    pub task_type: Option<String>,
    pub urgency: Urgency,
    /// 0-10; `None` uses the configured default.
    pub priority: Option<u8>,
    pub payload: Value,
    /// Continue an existing conversation instead of opening a new one.
    pub conversation_id: Option<ConversationId>,
    pub action: Option<String>,
    /// The recovery agent may skip this message instead of failing it.
    pub skippable: bool,
}

impl RouteRequest {
    /// Route to a named module.
    pub fn to(source: impl Into<String>, target: impl Into<String>, payload: Value) -> Self {
        Self::base(source.into(), Some(target.into()), None, payload)
    }

    /// Let the hub pick a provider of `capability`.
    pub fn by_capability(source: impl Into<String>, capability: impl Into<String>, payload: Value) -> Self {
        Self::base(source.into(), None, Some(capability.into()), payload)
    }

    fn base(source: String, target: Option<String>, capability: Option<String>, payload: Value) -> Self {
        Self {
            source,
            target,
            capability,
            task_type: None,
            urgency: Urgency::default(),
            priority: None,
            payload,
            conversation_id: None,
            action: None,
            skippable: false,
        }
    }

    /// Capability used for fallback candidates when routing to a named target.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority.min(10));
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn in_conversation(mut self, id: ConversationId) -> Self {
        self.conversation_id = Some(id);
        self
    }

    pub fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }
}

/// A successfully routed (or deliberately skipped) message.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub conversation_id: ConversationId,
    /// Module that served the request.
    pub module: String,
    /// The module's reply; `Null` when skipped.
    pub output: Value,
    /// Contract the payload was shaped with.
    pub contract: Arc<SchemaContract>,
    pub request_turn: Option<u64>,
    pub reply_turn: Option<u64>,
    pub retries: u32,
    pub skipped: bool,
    pub reward: f64,
    pub latency_ms: u64,
    pub allocation: Option<Allocation>,
}

/// A failed route, with enough context to diagnose it without replaying
/// the conversation.
#[derive(Debug, Error)]
#[error("{}{}", .error, trail(.conversation_id, .turn, .attempted, .retries))]
pub struct RouteError {
    #[source]
    pub error: ConduitError,
    pub conversation_id: Option<ConversationId>,
    /// Last turn recorded for this route.
    pub turn: Option<u64>,
    /// Every dispatch target tried, in order.
    pub attempted: Vec<String>,
    pub contract: Option<Arc<SchemaContract>>,
    pub retries: u32,
}

impl RouteError {
    /// An error raised outside any dispatch attempt.
    pub(crate) fn bare(error: ConduitError, conversation_id: Option<ConversationId>) -> Self {
        Self {
            error,
            conversation_id,
            turn: None,
            attempted: Vec::new(),
            contract: None,
            retries: 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }

    pub fn into_inner(self) -> ConduitError {
        self.error
    }
}

/// Context appended to a route failure's message.
fn trail(conversation_id: &Option<ConversationId>, turn: &Option<u64>, attempted: &[String], retries: &u32) -> String {
    let mut out = String::new();
    if let Some(id) = conversation_id {
        out.push_str(&format!(" [conversation {id}"));
        if let Some(turn) = turn {
            out.push_str(&format!(", turn {turn}"));
        }
        out.push(']');
    }
    if !attempted.is_empty() {
        out.push_str(&format!(" attempted [{}]", attempted.join(", ")));
    }
    if *retries > 0 {
        out.push_str(&format!(" after {retries} retries"));
    }
    out
}

#[derive(Debug, Default)]
struct Trace {
    conversation_id: Option<ConversationId>,
    turn: Option<u64>,
    attempted: Vec<String>,
    contract: Option<Arc<SchemaContract>>,
    retries: u32,
}

impl Trace {
    fn into_error(self, error: ConduitError) -> RouteError {
        RouteError {
            error,
            conversation_id: self.conversation_id,
            turn: self.turn,
            attempted: self.attempted,
            contract: self.contract,
            retries: self.retries,
        }
    }
}

struct Dispatched {
    output: Value,
    request_turn: u64,
    reply_turn: u64,
}

/// Decisions taken while routing one message, rewarded once it settles.
#[derive(Default)]
struct Ledger {
    selections: Vec<(TaskFeatures, String)>,
    allocations: Vec<(AllocationState, Allocation, f64)>,
    recoveries: Vec<(FailureSignature, RecoveryAction)>,
}

// ── Router ─────────────────────────────────────────────────────

/// Routes messages between modules: picks the target, negotiates the
/// contract, records the request and reply turns, dispatches under an
/// allocation and deadline, and recovers from transient failures within a
/// hard retry ceiling. Every decision's outcome is fed back to its learner.
pub struct MessageRouter {
    registry: Arc<ModuleRegistry>,
    negotiator: Arc<SchemaNegotiator>,
    conversations: Arc<ConversationManager>,
    engine: Arc<DecisionEngine>,
    adapters: DashMap<String, Arc<dyn ModuleAdapter>>,
    /// Circuit breakers keyed by module name.
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    in_flight: DashMap<String, u32>,
    config: RouterConfig,
    events: EventBus,
}

impl MessageRouter {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        negotiator: Arc<SchemaNegotiator>,
        conversations: Arc<ConversationManager>,
        engine: Arc<DecisionEngine>,
        config: RouterConfig,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            negotiator,
            conversations,
            engine,
            adapters: DashMap::new(),
            breakers: Mutex::new(HashMap::new()),
            in_flight: DashMap::new(),
            config,
            events,
        }
    }

    /// Attach the adapter that serves a registered module.
    pub fn attach(&self, adapter: Arc<dyn ModuleAdapter>) {
        let name = adapter.name().to_string();
        debug!(module = %name, "adapter attached");
        self.breakers.lock().entry(name.clone()).or_insert_with(CircuitBreaker::new);
        self.adapters.insert(name, adapter);
    }

    pub fn detach(&self, module: &str) -> Option<Arc<dyn ModuleAdapter>> {
        self.breakers.lock().remove(module);
        self.adapters.remove(module).map(|(_, adapter)| adapter)
    }

    pub fn in_flight(&self, module: &str) -> u32 {
        self.in_flight.get(module).map(|n| *n).unwrap_or(0)
    }

    /// Whether the module's circuit is currently open (tripped).
    pub fn circuit_open(&self, module: &str) -> bool {
        self.breakers.lock().get(module).is_some_and(CircuitBreaker::is_open)
    }

    pub(crate) fn conversations(&self) -> &Arc<ConversationManager> {
        &self.conversations
    }

    pub(crate) fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    /// Route one message end to end.
    pub async fn route(&self, request: RouteRequest) -> std::result::Result<RouteOutcome, RouteError> {
        let mut trace = Trace {
            conversation_id: request.conversation_id,
            ..Trace::default()
        };
        match self.route_inner(&request, &mut trace).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                warn!(
                    source = %request.source,
                    conversation = ?trace.conversation_id,
                    attempted = ?trace.attempted,
                    retries = trace.retries,
                    error = %error,
                    "route failed"
                );
                Err(trace.into_error(error))
            }
        }
    }

    /// Probe every attached adapter and update registry health to match.
    /// A healthy probe also closes the module's circuit.
    pub async fn refresh_health(&self) -> Vec<(String, bool)> {
        let adapters: Vec<Arc<dyn ModuleAdapter>> = self.adapters.iter().map(|e| Arc::clone(e.value())).collect();
        let mut results = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            let name = adapter.name().to_string();
            let healthy = matches!(
                tokio::time::timeout(HEALTH_CHECK_TIMEOUT, adapter.health_check()).await,
                Ok(Ok(()))
            );
            if healthy && let Some(cb) = self.breakers.lock().get_mut(&name) {
                cb.reset();
            }
            if self.registry.get(&name).is_some()
                && let Err(e) = self.registry.set_health(&name, healthy)
            {
                warn!(module = %name, error = %e, "failed to update module health");
            }
            results.push((name, healthy));
        }
        results.sort();
        results
    }

    async fn route_inner(&self, req: &RouteRequest, trace: &mut Trace) -> Result<RouteOutcome> {
        let started = Instant::now();
        self.registry.require(&req.source)?;
        let mut ledger = Ledger::default();

        let mut target = match (&req.target, &req.capability) {
            (Some(target), _) => self.registry.require(target)?.name.clone(),
            (None, Some(capability)) => {
                let (features, module) = self.select(req, capability, &[])?;
                ledger.selections.push((features, module.clone()));
                module
            }
            (None, None) => {
                return Err(ConduitError::RoutingFailure {
                    capability: "(none: request names neither a target nor a capability)".into(),
                });
            }
        };

        let mut contract = self.negotiator.negotiate(&req.source, &target, Some(&req.payload))?;
        trace.contract = Some(Arc::clone(&contract));

        let conversation_id = match req.conversation_id {
            Some(id) => {
                self.conversations.join(id, &req.source).await?;
                self.conversations.join(id, &target).await?;
                id
            }
            None => {
                self.conversations
                    .create_conversation(vec![req.source.clone(), target.clone()])
                    .await?
            }
        };
        trace.conversation_id = Some(conversation_id);

        let exchange = self.conversations.run_lock(conversation_id).await;
        let _exchange = exchange.lock().await;

        let reward_model = self.engine.experience.reward_model();
        let mut retries = 0u32;
        loop {
            trace.attempted.push(target.clone());
            let descriptor = self.registry.require(&target)?;
            let alloc_state = AllocationState {
                module: target.clone(),
                priority: req.priority.unwrap_or(self.config.default_priority),
                load: self.load(&target),
                limits: descriptor.limits,
            };
            let allocation = self.engine.allocator.select_action(&alloc_state)?.action;

            let attempt_started = Instant::now();
            let allowed = self.allow_request(&target);
            let result = if allowed {
                self.dispatch(conversation_id, req, &target, &contract, allocation, trace).await
            } else {
                Err(ConduitError::ModuleUnavailable {
                    module: target.clone(),
                    reason: "circuit open".into(),
                })
            };
            let attempt_ms = attempt_started.elapsed().as_millis() as u64;

            let error = match result {
                Ok(done) => {
                    self.record_success(&target);
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let mut outcome = Outcome::success(latency_ms)
                        .with_preserved_ratio(contract.preserved_ratio())
                        .with_hops(distinct(&trace.attempted), 1);
                    if !contract.unfilled.is_empty() {
                        outcome = outcome.with_data_loss();
                    }
                    let reward = reward_model.reward(&outcome);
                    ledger.allocations.push((alloc_state, allocation, reward));
                    self.settle(&ledger, Some(&target), reward, reward_model.reward(&Outcome::failure(latency_ms)))
                        .await;

                    info!(
                        conversation = %conversation_id,
                        module = %target,
                        turn = done.request_turn,
                        retries,
                        latency_ms,
                        reward,
                        "message routed"
                    );
                    return Ok(RouteOutcome {
                        conversation_id,
                        module: target,
                        output: done.output,
                        contract,
                        request_turn: Some(done.request_turn),
                        reply_turn: Some(done.reply_turn),
                        retries,
                        skipped: false,
                        reward,
                        latency_ms,
                        allocation: Some(allocation),
                    });
                }
                Err(error) => error,
            };

            // Structural failures are never retried.
            let Some(kind) = FailureKind::classify(&error) else {
                return Err(error);
            };
            if allowed {
                self.record_failure(&target);
            }
            let failure_reward = reward_model.reward(&Outcome::failure(attempt_ms).with_budget(allocation.timeout_ms));
            ledger.allocations.push((alloc_state, allocation, failure_reward));

            if retries >= self.config.max_retries {
                let latency_ms = started.elapsed().as_millis() as u64;
                let reward = reward_model.reward(&Outcome::failure(latency_ms));
                self.settle(&ledger, None, reward, reward).await;
                warn!(
                    conversation = %conversation_id,
                    module = %target,
                    attempts = retries + 1,
                    max = self.config.max_retries,
                    "retry budget exhausted"
                );
                return Err(ConduitError::RetryBudgetExhausted {
                    attempts: retries + 1,
                    last_error: error.to_string(),
                });
            }

            let alternates = self.alternates(req, &trace.attempted);
            let signature = FailureSignature {
                kind,
                attempt: retries,
                elapsed_ms: started.elapsed().as_millis() as u64,
                has_alternate: !alternates.is_empty(),
                skippable: req.skippable,
            };
            let action = self.engine.recovery.select_action(&signature)?.action;
            ledger.recoveries.push((signature, action));
            warn!(
                conversation = %conversation_id,
                module = %target,
                error = %error,
                action = %action,
                attempt = retries,
                "dispatch failed, recovering"
            );
            self.events.publish(HubEvent::RecoveryChosen {
                conversation_id,
                module: target.clone(),
                action: action.as_str().to_string(),
                attempt: retries,
            });

            match action {
                RecoveryAction::Retry => {}
                RecoveryAction::AdaptSchemaAndRetry => {
                    if self.config.renegotiate_on_retry {
                        self.negotiator.invalidate_pair(&req.source, &target);
                        contract = self.negotiator.negotiate(&req.source, &target, Some(&req.payload))?;
                        trace.contract = Some(Arc::clone(&contract));
                    }
                }
                RecoveryAction::Fallback => {
                    let Some(capability) = &req.capability else {
                        return Err(error);
                    };
                    let (features, module) = self.select(req, capability, &trace.attempted)?;
                    ledger.selections.push((features, module.clone()));
                    contract = self.negotiator.negotiate(&req.source, &module, Some(&req.payload))?;
                    trace.contract = Some(Arc::clone(&contract));
                    self.conversations.join(conversation_id, &module).await?;
                    info!(conversation = %conversation_id, from = %target, to = %module, "falling back to alternate module");
                    target = module;
                }
                RecoveryAction::Skip => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let reward = reward_model.reward(
                        &Outcome::success(latency_ms)
                            .with_preserved_ratio(0.0)
                            .with_data_loss(),
                    );
                    self.settle(&ledger, None, reward, failure_reward).await;
                    info!(conversation = %conversation_id, module = %target, "message skipped");
                    return Ok(RouteOutcome {
                        conversation_id,
                        module: target,
                        output: Value::Null,
                        contract,
                        request_turn: trace.turn,
                        reply_turn: None,
                        retries,
                        skipped: true,
                        reward,
                        latency_ms,
                        allocation: Some(allocation),
                    });
                }
                RecoveryAction::Escalate => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    let reward = reward_model.reward(&Outcome::failure(latency_ms));
                    self.settle(&ledger, None, reward, reward).await;
                    warn!(conversation = %conversation_id, module = %target, "escalating to operator");
                    self.events.publish(HubEvent::Escalated {
                        conversation_id,
                        module: target.clone(),
                        reason: error.to_string(),
                    });
                    return Err(ConduitError::Escalated {
                        module: target,
                        reason: error.to_string(),
                    });
                }
            }

            retries += 1;
            trace.retries = retries;
            let delay_ms = self
                .config
                .retry_backoff_ms
                .saturating_mul(2u64.pow((retries - 1).min(MAX_BACKOFF_EXPONENT)));
            if delay_ms > 0 {
                debug!(attempt = retries, max = self.config.max_retries, delay_ms, "backing off before retry");
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }

    /// Record the request turn, invoke the adapter under the allocation's
    /// deadline, then record the reply turn.
    async fn dispatch(
        &self,
        conversation_id: ConversationId,
        req: &RouteRequest,
        target: &str,
        contract: &SchemaContract,
        allocation: Allocation,
        trace: &mut Trace,
    ) -> Result<Dispatched> {
        let adapter = self
            .adapters
            .get(target)
            .map(|a| Arc::clone(a.value()))
            .ok_or_else(|| ConduitError::ModuleUnavailable {
                module: target.to_string(),
                reason: "no adapter attached".into(),
            })?;

        let payload = contract.apply(&req.payload);
        let (request, accepted) = self
            .conversations
            .send(conversation_id, &req.source, target, payload.clone(), None)
            .await?;
        trace.turn = Some(accepted.turn);
        self.conversations.set_waiting(conversation_id, true).await?;

        let invocation = Invocation {
            conversation_id,
            turn: accepted.turn,
            action: req.action.clone(),
            payload,
            allocation,
        };
        let budget = Duration::from_millis(allocation.timeout_ms);
        let result = {
            let _load = InFlight::enter(&self.in_flight, target);
            tokio::time::timeout(budget, adapter.invoke(invocation)).await
        };

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                self.resume(conversation_id).await;
                return Err(e.into_conduit(target, allocation.timeout_ms));
            }
            Err(_) => {
                self.resume(conversation_id).await;
                return Err(ConduitError::Timeout {
                    module: target.to_string(),
                    budget_ms: allocation.timeout_ms,
                });
            }
        };

        let (_, reply) = self
            .conversations
            .send(conversation_id, target, &req.source, output.clone(), Some(request.id))
            .await?;
        trace.turn = Some(reply.turn);
        Ok(Dispatched {
            output,
            request_turn: accepted.turn,
            reply_turn: reply.turn,
        })
    }

    /// Back to ACTIVE after a reply that never came.
    async fn resume(&self, conversation_id: ConversationId) {
        if let Err(e) = self.conversations.set_waiting(conversation_id, false).await {
            debug!(conversation = %conversation_id, error = %e, "could not resume conversation");
        }
    }

    /// Ask the bandit for a healthy provider of `capability`, excluding the
    /// source and anything in `exclude`.
    fn select(&self, req: &RouteRequest, capability: &str, exclude: &[String]) -> Result<(TaskFeatures, String)> {
        self.expire_breakers();
        let candidates: Vec<Candidate> = self
            .registry
            .available(capability)
            .into_iter()
            .filter(|d| d.name != req.source && !exclude.contains(&d.name))
            .map(|d| Candidate {
                module: d.name.clone(),
                in_flight: self.in_flight(&d.name),
            })
            .collect();
        let features = TaskFeatures {
            task_type: req.task_type.clone().unwrap_or_else(|| capability.to_string()),
            capability: capability.to_string(),
            size_class: SizeClass::of_payload(&req.payload),
            urgency: req.urgency,
            candidates,
        };
        let decision = self.engine.bandit.select_action(&features)?;
        debug!(
            capability,
            module = %decision.action,
            confidence = decision.confidence,
            "module selected"
        );
        Ok((features, decision.action))
    }

    fn alternates(&self, req: &RouteRequest, attempted: &[String]) -> Vec<String> {
        let Some(capability) = &req.capability else {
            return Vec::new();
        };
        self.expire_breakers();
        self.registry
            .available(capability)
            .into_iter()
            .filter(|d| d.name != req.source && !attempted.contains(&d.name))
            .map(|d| d.name.clone())
            .collect()
    }

    /// Feed the settled outcome back to every learner consulted on the way.
    /// A selection is credited `served_reward` if its module served the
    /// request, `failed_reward` otherwise.
    async fn settle(&self, ledger: &Ledger, served: Option<&str>, served_reward: f64, failed_reward: f64) {
        let engine = &self.engine;
        for (features, module) in &ledger.selections {
            let reward = if served == Some(module.as_str()) { served_reward } else { failed_reward };
            self.reinforce(&engine.bandit, features, module, reward).await;
        }
        for (state, allocation, reward) in &ledger.allocations {
            self.reinforce(&engine.allocator, state, allocation, *reward).await;
        }
        for (signature, action) in &ledger.recoveries {
            self.reinforce(&engine.recovery, signature, action, served_reward).await;
        }
    }

    async fn reinforce<L: Learner>(&self, learner: &L, state: &L::State, action: &L::Action, reward: f64) {
        learner.observe(state, action, reward, None);
        if let Err(e) = self
            .engine
            .experience
            .record_reward(L::DECISION_TYPE, state, action, reward, None)
            .await
        {
            warn!(decision_type = %L::DECISION_TYPE, error = %e, "failed to record episode");
        }
    }

    /// In-flight dispatches normalized into [0, 1).
    fn load(&self, module: &str) -> f64 {
        let n = f64::from(self.in_flight(module));
        n / (n + 4.0)
    }

    fn open_for(&self) -> Duration {
        Duration::from_secs(self.config.breaker_open_secs)
    }

    fn allow_request(&self, module: &str) -> bool {
        let open_for = self.open_for();
        self.breakers
            .lock()
            .entry(module.to_string())
            .or_insert_with(CircuitBreaker::new)
            .allow_request(open_for)
    }

    /// Put modules whose open window has passed back into rotation.
    fn expire_breakers(&self) {
        let open_for = self.open_for();
        let expired: Vec<String> = self
            .breakers
            .lock()
            .iter_mut()
            .filter_map(|(name, cb)| cb.expire(open_for).then(|| name.clone()))
            .collect();
        for name in expired {
            info!(module = %name, "circuit breaker half-open, module back in rotation");
            if let Err(e) = self.registry.set_health(&name, true) {
                debug!(module = %name, error = %e, "module vanished before re-enable");
            }
        }
    }

    fn record_success(&self, module: &str) {
        let recovered = {
            let mut breakers = self.breakers.lock();
            let cb = breakers.entry(module.to_string()).or_insert_with(CircuitBreaker::new);
            let was_closed = cb.state == CircuitState::Closed;
            cb.record_success();
            if !was_closed {
                info!(module, total_successes = cb.total_successes, "circuit breaker closed");
            }
            !was_closed
        };
        let unhealthy = self.registry.get(module).is_some_and(|d| !d.healthy);
        if (recovered || unhealthy)
            && let Err(e) = self.registry.set_health(module, true)
        {
            debug!(module, error = %e, "could not re-enable module");
        }
    }

    fn record_failure(&self, module: &str) {
        let tripped = {
            let mut breakers = self.breakers.lock();
            let cb = breakers.entry(module.to_string()).or_insert_with(CircuitBreaker::new);
            let was_open = cb.is_open();
            cb.record_failure(self.config.breaker_threshold);
            if !was_open && cb.is_open() {
                warn!(
                    module,
                    failures = cb.consecutive_failures,
                    total_failures = cb.total_failures,
                    "circuit breaker OPEN, module disabled for {}s",
                    self.config.breaker_open_secs
                );
                true
            } else {
                false
            }
        };
        if tripped && let Err(e) = self.registry.set_health(module, false) {
            debug!(module, error = %e, "could not disable module");
        }
    }
}

fn distinct(modules: &[String]) -> u32 {
    let mut seen: Vec<&String> = Vec::new();
    for m in modules {
        if !seen.contains(&m) {
            seen.push(m);
        }
    }
    seen.len() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_at_threshold_and_probes_once() {
        let mut cb = CircuitBreaker::new();
        for _ in 0..2 {
            cb.record_failure(3);
        }
        assert!(!cb.is_open());
        cb.record_failure(3);
        assert!(cb.is_open());
        assert!(!cb.allow_request(Duration::from_secs(60)));

        // Window already elapsed: exactly one probe goes through.
        assert!(cb.allow_request(Duration::ZERO));
        assert!(!cb.allow_request(Duration::ZERO));
        cb.record_success();
        assert!(cb.allow_request(Duration::ZERO));
    }

    #[test]
    fn test_failed_probe_reopens() {
        let mut cb = CircuitBreaker::new();
        cb.record_failure(1);
        assert!(cb.expire(Duration::ZERO));
        assert_eq!(cb.state, CircuitState::HalfOpen { probing: false });
        assert!(cb.allow_request(Duration::ZERO));
        cb.record_failure(10);
        assert!(cb.is_open());
    }

    #[test]
    fn test_distinct_hops() {
        let hops = distinct(&["a".into(), "a".into(), "b".into()]);
        assert_eq!(hops, 2);
    }
}
