use conduit_config::{BanditConfig, ExplorationPolicy};
use conduit_core::{ConduitError, DecisionType, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

use crate::learner::{Committed, Decision, Learner};

/// Coarse payload size bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    /// Under 4 KiB is small, under 256 KiB medium, anything bigger large.
    pub fn from_bytes(bytes: usize) -> Self {
        match bytes {
            0..4096 => SizeClass::Small,
            4096..262_144 => SizeClass::Medium,
            _ => SizeClass::Large,
        }
    }

    pub fn of_payload(payload: &serde_json::Value) -> Self {
        Self::from_bytes(serde_json::to_vec(payload).map(|b| b.len()).unwrap_or(0))
    }

    fn as_str(self) -> &'static str {
        match self {
            SizeClass::Small => "small",
            SizeClass::Medium => "medium",
            SizeClass::Large => "large",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
}

impl Urgency {
    fn as_str(self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Normal => "normal",
            Urgency::High => "high",
        }
    }
}

/// A module eligible for a task, with its current load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub module: String,
    pub in_flight: u32,
}

/// Task feature vector the bandit conditions on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFeatures {
    pub task_type: String,
    pub capability: String,
    pub size_class: SizeClass,
    #[serde(default)]
    pub urgency: Urgency,
    /// Healthy modules advertising `capability`.
    pub candidates: Vec<Candidate>,
}

impl TaskFeatures {
    /// Arms are shared by every task with the same context key.
    pub fn context_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.capability,
            self.task_type,
            self.size_class.as_str(),
            self.urgency.as_str()
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ArmStats {
    pub pulls: u64,
    pub mean_reward: f64,
}

#[derive(Debug, Clone, Default)]
struct BanditTable {
    arms: HashMap<(String, String), ArmStats>,
    context_pulls: HashMap<String, u64>,
}

/// Module-selection bandit.
///
/// Untried arms are always pulled first. After that exploration follows the
/// configured policy: epsilon-greedy with per-context decay, or UCB1. Exact
/// ties go to the candidate with the fewest in-flight requests, then by name.
pub struct ModuleSelectionBandit {
    config: BanditConfig,
    table: Committed<BanditTable>,
    rng: Mutex<StdRng>,
}

impl ModuleSelectionBandit {
    pub fn new(config: BanditConfig, seed: u64) -> Self {
        Self {
            config,
            table: Committed::default(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Current exploration rate for a context.
    pub fn epsilon(&self, context: &str) -> f64 {
        let pulls = self.table.snapshot().context_pulls.get(context).copied().unwrap_or(0);
        self.decayed_epsilon(pulls)
    }

    fn decayed_epsilon(&self, pulls: u64) -> f64 {
        let decayed = self.config.epsilon * self.config.epsilon_decay.powi(pulls.min(i32::MAX as u64) as i32);
        decayed.max(self.config.epsilon_min)
    }

    pub fn arm(&self, features: &TaskFeatures, module: &str) -> ArmStats {
        self.table
            .snapshot()
            .arms
            .get(&(features.context_key(), module.to_string()))
            .copied()
            .unwrap_or_default()
    }
}

/// Load-spreading tie-break: fewer in-flight first, then name.
fn by_load(a: &Candidate, b: &Candidate) -> Ordering {
    a.in_flight.cmp(&b.in_flight).then_with(|| a.module.cmp(&b.module))
}

fn arm_confidence(pulls: u64) -> f64 {
    pulls as f64 / (pulls as f64 + 1.0)
}

impl Learner for ModuleSelectionBandit {
    type State = TaskFeatures;
    type Action = String;

    const DECISION_TYPE: DecisionType = DecisionType::ModuleSelection;

    fn select_action(&self, state: &TaskFeatures) -> Result<Decision<String>> {
        if state.candidates.is_empty() {
            return Err(ConduitError::RoutingFailure {
                capability: state.capability.clone(),
            });
        }

        let context = state.context_key();
        let table = self.table.snapshot();
        let stats = |c: &Candidate| {
            table
                .arms
                .get(&(context.clone(), c.module.clone()))
                .copied()
                .unwrap_or_default()
        };

        if let Some(untried) = state
            .candidates
            .iter()
            .filter(|c| stats(c).pulls == 0)
            .min_by(|a, b| by_load(a, b))
        {
            debug!(module = %untried.module, context = %context, "pulling untried arm");
            return Ok(Decision::new(untried.module.clone(), 0.0));
        }

        let context_pulls = table.context_pulls.get(&context).copied().unwrap_or(0);
        let score = |c: &Candidate| -> f64 {
            let s = stats(c);
            match self.config.policy {
                ExplorationPolicy::EpsilonGreedy => s.mean_reward,
                ExplorationPolicy::Ucb => {
                    let total = (context_pulls.max(1) as f64).ln();
                    s.mean_reward + self.config.ucb_c * (total / s.pulls as f64).sqrt()
                }
            }
        };

        if self.config.policy == ExplorationPolicy::EpsilonGreedy {
            let epsilon = self.decayed_epsilon(context_pulls);
            let mut rng = self.rng.lock();
            if rng.random_bool(epsilon.clamp(0.0, 1.0)) {
                let pick = &state.candidates[rng.random_range(0..state.candidates.len())];
                debug!(module = %pick.module, epsilon, "exploring");
                return Ok(Decision::new(pick.module.clone(), arm_confidence(stats(pick).pulls) * (1.0 - epsilon)));
            }
        }

        let best = state
            .candidates
            .iter()
            .max_by(|a, b| {
                let (sa, sb) = (score(a), score(b));
                if (sa - sb).abs() < 1e-12 {
                    // Reverse: max_by keeps the greater, we want the lighter load.
                    by_load(b, a)
                } else {
                    sa.partial_cmp(&sb).unwrap_or(Ordering::Equal)
                }
            })
            .ok_or_else(|| ConduitError::RoutingFailure {
                capability: state.capability.clone(),
            })?;
        Ok(Decision::new(best.module.clone(), arm_confidence(stats(best).pulls)))
    }

    fn observe(&self, state: &TaskFeatures, action: &String, reward: f64, _next_state: Option<&TaskFeatures>) {
        let context = state.context_key();
        self.table.update(|table| {
            let arm = table.arms.entry((context.clone(), action.clone())).or_default();
            arm.pulls += 1;
            arm.mean_reward += (reward - arm.mean_reward) / arm.pulls as f64;
            *table.context_pulls.entry(context).or_default() += 1;
        });
    }
}
