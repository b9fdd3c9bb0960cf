use conduit_config::RecoveryConfig;
use conduit_core::{ConduitError, DecisionType, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::learner::{Committed, Decision, Learner};

/// Transient failure kinds the agent is consulted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Unavailable,
    InvalidPayload,
}

impl FailureKind {
    /// `None` for structural errors, which are never handed to the agent.
    pub fn classify(error: &ConduitError) -> Option<Self> {
        match error {
            ConduitError::Timeout { .. } => Some(FailureKind::Timeout),
            ConduitError::ModuleUnavailable { .. } => Some(FailureKind::Unavailable),
            ConduitError::InvalidPayload { .. } => Some(FailureKind::InvalidPayload),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSignature {
    pub kind: FailureKind,
    /// Retries already spent on this message.
    pub attempt: u32,
    /// Time since the message was first dispatched.
    pub elapsed_ms: u64,
    /// Another healthy module offers the same capability.
    pub has_alternate: bool,
    /// The failing step may be skipped (optional pipeline step).
    pub skippable: bool,
}

impl FailureSignature {
    fn elapsed_bucket(&self) -> u8 {
        match self.elapsed_ms {
            0..1_000 => 0,
            1_000..5_000 => 1,
            _ => 2,
        }
    }

    fn key(&self, ceiling: u32) -> StateKey {
        StateKey {
            kind: self.kind,
            attempt: self.attempt.min(ceiling),
            elapsed: self.elapsed_bucket(),
            has_alternate: self.has_alternate,
            skippable: self.skippable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct StateKey {
    kind: FailureKind,
    attempt: u32,
    elapsed: u8,
    has_alternate: bool,
    skippable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Fallback,
    Skip,
    Escalate,
    AdaptSchemaAndRetry,
}

impl RecoveryAction {
    pub const ALL: [RecoveryAction; 5] = [
        RecoveryAction::Retry,
        RecoveryAction::Fallback,
        RecoveryAction::Skip,
        RecoveryAction::Escalate,
        RecoveryAction::AdaptSchemaAndRetry,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryAction::Retry => "retry",
            RecoveryAction::Fallback => "fallback",
            RecoveryAction::Skip => "skip",
            RecoveryAction::Escalate => "escalate",
            RecoveryAction::AdaptSchemaAndRetry => "adapt_schema_and_retry",
        }
    }

    fn feasible(self, signature: &FailureSignature) -> bool {
        match self {
            RecoveryAction::Fallback => signature.has_alternate,
            RecoveryAction::Skip => signature.skippable,
            _ => true,
        }
    }

    /// Starting Q-value before any experience.
    fn prior(self, kind: FailureKind) -> f64 {
        use FailureKind::*;
        use RecoveryAction::*;
        match (kind, self) {
            (Timeout, Retry) => 0.5,
            (Timeout, Fallback) => 0.3,
            (Unavailable, Fallback) => 0.5,
            (Unavailable, Retry) => 0.2,
            (InvalidPayload, AdaptSchemaAndRetry) => 0.5,
            (InvalidPayload, Fallback) => 0.2,
            (_, Skip) => 0.1,
            (_, Escalate) => 0.0,
            _ => 0.05,
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error-recovery agent: tabular Q over failure signatures.
///
/// Infeasible actions are masked. Once `attempt` reaches the retry ceiling
/// the answer is `Escalate` no matter what has been learned.
pub struct ErrorRecoveryAgent {
    config: RecoveryConfig,
    max_retries: u32,
    q: Committed<HashMap<(StateKey, RecoveryAction), f64>>,
    rng: Mutex<StdRng>,
}

impl ErrorRecoveryAgent {
    pub fn new(config: RecoveryConfig, max_retries: u32, seed: u64) -> Self {
        Self {
            config,
            max_retries,
            q: Committed::default(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Learner for ErrorRecoveryAgent {
    type State = FailureSignature;
    type Action = RecoveryAction;

    const DECISION_TYPE: DecisionType = DecisionType::ErrorRecovery;

    fn select_action(&self, state: &FailureSignature) -> Result<Decision<RecoveryAction>> {
        if state.attempt >= self.max_retries {
            return Ok(Decision::new(RecoveryAction::Escalate, 1.0));
        }

        let feasible: Vec<RecoveryAction> = RecoveryAction::ALL
            .into_iter()
            .filter(|a| a.feasible(state))
            .collect();

        {
            let mut rng = self.rng.lock();
            if rng.random_bool(self.config.epsilon.clamp(0.0, 1.0)) {
                let pick = feasible[rng.random_range(0..feasible.len())];
                return Ok(Decision::new(pick, 0.0));
            }
        }

        let key = state.key(self.max_retries);
        let q = self.q.snapshot();
        let value = |a: RecoveryAction| q.get(&(key, a)).copied().unwrap_or_else(|| a.prior(state.kind));
        let mut best = feasible[0];
        for a in feasible.iter().copied().skip(1) {
            if value(a) > value(best) {
                best = a;
            }
        }
        let confidence = sigmoid_margin(value(best), feasible.iter().filter(|a| **a != best).map(|a| value(*a)));
        Ok(Decision::new(best, confidence))
    }

    fn observe(&self, state: &FailureSignature, action: &RecoveryAction, reward: f64, _next_state: Option<&FailureSignature>) {
        let key = state.key(self.max_retries);
        let alpha = self.config.alpha;
        let prior = action.prior(state.kind);
        self.q.update(|q| {
            let entry = q.entry((key, *action)).or_insert(prior);
            *entry += alpha * (reward - *entry);
        });
    }
}

/// Map the gap between the best value and the runner-up into [0, 1).
fn sigmoid_margin(best: f64, others: impl Iterator<Item = f64>) -> f64 {
    let runner_up = others.fold(f64::NEG_INFINITY, f64::max);
    if !runner_up.is_finite() {
        return 1.0;
    }
    let margin = (best - runner_up).max(0.0);
    margin / (margin + 0.25)
}
