use conduit_config::SequencingConfig;
use conduit_core::{DecisionType, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::learner::{Committed, Decision, Learner};

/// A pipeline step that has not run yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingStep {
    pub name: String,
    pub optional: bool,
    /// All of the step's inputs are available.
    pub ready: bool,
}

/// Where a pipeline run currently stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub pipeline: String,
    /// Most recently completed step, `None` before the first.
    pub last_completed: Option<String>,
    /// Remaining steps in declaration order.
    pub remaining: Vec<PendingStep>,
}

impl PipelineState {
    /// Terminate is only allowed once nothing mandatory is left.
    pub fn can_terminate(&self) -> bool {
        self.remaining.iter().all(|s| s.optional)
    }

    /// Feasible actions, steps in declaration order followed by `Terminate`.
    pub fn actions(&self) -> Vec<SequenceAction> {
        let mut actions: Vec<SequenceAction> = self
            .remaining
            .iter()
            .filter(|s| s.ready)
            .map(|s| SequenceAction::Run(s.name.clone()))
            .collect();
        if self.can_terminate() {
            actions.push(SequenceAction::Terminate);
        }
        actions
    }

    fn key(&self) -> String {
        let mut remaining: Vec<&str> = self.remaining.iter().map(|s| s.name.as_str()).collect();
        remaining.sort_unstable();
        format!(
            "{}|{}|{}",
            self.pipeline,
            self.last_completed.as_deref().unwrap_or("^"),
            remaining.join(",")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "step", rename_all = "snake_case")]
pub enum SequenceAction {
    Run(String),
    Terminate,
}

impl SequenceAction {
    fn key(&self) -> &str {
        match self {
            SequenceAction::Run(step) => step,
            SequenceAction::Terminate => "$terminate",
        }
    }
}

type QTable = HashMap<(String, String), f64>;

/// Pipeline-sequencing agent: tabular Q-learning over
/// (last completed step, remaining set) with epsilon-greedy exploration.
pub struct PipelineSequencer {
    config: SequencingConfig,
    q: Committed<QTable>,
    rng: Mutex<StdRng>,
}

impl PipelineSequencer {
    pub fn new(config: SequencingConfig, seed: u64) -> Self {
        Self {
            config,
            q: Committed::default(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

fn lookup(q: &QTable, state_key: &str, action: &SequenceAction) -> f64 {
    q.get(&(state_key.to_string(), action.key().to_string()))
        .copied()
        .unwrap_or(0.0)
}

impl Learner for PipelineSequencer {
    type State = PipelineState;
    type Action = SequenceAction;

    const DECISION_TYPE: DecisionType = DecisionType::PipelineSequencing;

    fn select_action(&self, state: &PipelineState) -> Result<Decision<SequenceAction>> {
        let actions = state.actions();
        if actions.is_empty() {
            // Mandatory steps left but none ready: the caller has a broken graph.
            return Err(conduit_core::ConduitError::RoutingFailure {
                capability: format!("pipeline '{}' has no ready step", state.pipeline),
            });
        }
        if actions.len() == 1 || state.remaining.is_empty() {
            return Ok(Decision::new(actions[0].clone(), 1.0));
        }

        {
            let mut rng = self.rng.lock();
            if rng.random_bool(self.config.epsilon.clamp(0.0, 1.0)) {
                let pick = actions[rng.random_range(0..actions.len())].clone();
                return Ok(Decision::new(pick, 0.0));
            }
        }

        let q = self.q.snapshot();
        let key = state.key();
        let values: Vec<f64> = actions.iter().map(|a| lookup(&q, &key, a)).collect();
        // First maximum wins: ties keep declaration order, Terminate last.
        let mut best = 0;
        for (i, v) in values.iter().enumerate() {
            if *v > values[best] + 1e-12 {
                best = i;
            }
        }
        let runner_up = values
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != best)
            .map(|(_, v)| *v)
            .fold(f64::NEG_INFINITY, f64::max);
        let margin = values[best] - runner_up;
        let confidence = margin / (margin.abs() + 1.0);
        Ok(Decision::new(actions[best].clone(), confidence))
    }

    fn observe(&self, state: &PipelineState, action: &SequenceAction, reward: f64, next_state: Option<&PipelineState>) {
        let key = state.key();
        let alpha = self.config.alpha;
        let gamma = self.config.gamma;
        self.q.update(|q| {
            let future = match next_state {
                Some(next) if *action != SequenceAction::Terminate => {
                    let next_key = next.key();
                    next.actions()
                        .iter()
                        .map(|a| lookup(q, &next_key, a))
                        .fold(f64::NEG_INFINITY, f64::max)
                }
                _ => 0.0,
            };
            let future = if future.is_finite() { future } else { 0.0 };
            let entry = q.entry((key, action.key().to_string())).or_insert(0.0);
            *entry += alpha * (reward + gamma * future - *entry);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, optional: bool, ready: bool) -> PendingStep {
        PendingStep {
            name: name.into(),
            optional,
            ready,
        }
    }

    #[test]
    fn test_terminate_only_when_all_optional() {
        let state = PipelineState {
            pipeline: "p".into(),
            last_completed: None,
            remaining: vec![step("a", false, true), step("b", true, true)],
        };
        assert!(!state.actions().contains(&SequenceAction::Terminate));

        let tail = PipelineState {
            remaining: vec![step("b", true, true)],
            ..state
        };
        assert_eq!(tail.actions(), vec![SequenceAction::Run("b".into()), SequenceAction::Terminate]);
    }

    #[test]
    fn test_empty_remaining_terminates() {
        let seq = PipelineSequencer::new(SequencingConfig::default(), 3);
        let done = PipelineState {
            pipeline: "p".into(),
            last_completed: Some("a".into()),
            remaining: vec![],
        };
        assert_eq!(seq.select_action(&done).unwrap().action, SequenceAction::Terminate);
    }

    #[test]
    fn test_learns_to_skip_costly_optional_step() {
        let config = SequencingConfig {
            epsilon: 0.0,
            ..SequencingConfig::default()
        };
        let seq = PipelineSequencer::new(config, 3);
        let state = PipelineState {
            pipeline: "p".into(),
            last_completed: Some("a".into()),
            remaining: vec![step("enrich", true, true)],
        };
        for _ in 0..20 {
            seq.observe(&state, &SequenceAction::Run("enrich".into()), -1.0, None);
            seq.observe(&state, &SequenceAction::Terminate, 0.5, None);
        }
        assert_eq!(seq.select_action(&state).unwrap().action, SequenceAction::Terminate);
    }
}
