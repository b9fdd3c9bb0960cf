use conduit_config::AllocationConfig;
use conduit_core::{Allocation, Bounds, DecisionType, ResourceLimits, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::learner::{Committed, Decision, Learner};

/// Inputs to the allocation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationState {
    pub module: String,
    /// Task priority, 0-10.
    pub priority: u8,
    /// Observed load on the module, normalized into [0, 1].
    pub load: f64,
    /// The module's declared envelope; every output is clipped into it.
    pub limits: ResourceLimits,
}

impl AllocationState {
    fn features(&self) -> [f64; FEATURES] {
        [1.0, f64::from(self.priority.min(10)) / 10.0, self.load.clamp(0.0, 1.0)]
    }
}

const FEATURES: usize = 3;
const DIMENSIONS: usize = 4;
const BASELINE_RATE: f64 = 0.1;
const EDGE: f64 = 1e-4;
/// `logit(1 - EDGE)`: the policy can't express anything beyond this.
const LOGIT_LIMIT: f64 = 9.21;

/// Per-module logistic policy: one weight row per allocation dimension
/// (cpu, memory, timeout, priority) over the features (bias, priority, load).
#[derive(Debug, Clone, PartialEq)]
struct PolicyWeights {
    rows: [[f64; FEATURES]; DIMENSIONS],
    baseline: f64,
    updates: u64,
}

impl Default for PolicyWeights {
    fn default() -> Self {
        Self {
            rows: [
                // cpu and memory: mid-range, a bit more for urgent work
                [0.0, 1.0, 0.0],
                [0.0, 1.0, 0.0],
                // timeout: longer deadlines on busy modules
                [0.0, 0.0, 1.0],
                // scheduling priority follows task priority
                [-2.5, 5.0, 0.0],
            ],
            baseline: 0.0,
            updates: 0,
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn logit(p: f64) -> f64 {
    let p = p.clamp(EDGE, 1.0 - EDGE);
    (p / (1.0 - p)).ln()
}

fn dot(w: &[f64; FEATURES], x: &[f64; FEATURES]) -> f64 {
    w.iter().zip(x).map(|(a, b)| a * b).sum()
}

fn bounds(limits: &ResourceLimits) -> [Bounds; DIMENSIONS] {
    [limits.cpu_share, limits.memory_share, limits.timeout_ms, limits.priority]
}

fn values(a: &Allocation) -> [f64; DIMENSIONS] {
    [a.cpu_share, a.memory_share, a.timeout_ms as f64, f64::from(a.priority)]
}

/// Resource-allocation agent.
///
/// Exploration perturbs each dimension's logit by a uniform offset; learning
/// moves the weights along the perturbation that was actually taken, scaled
/// by the reward's advantage over a running baseline.
pub struct ResourceAllocator {
    config: AllocationConfig,
    policies: Committed<HashMap<String, PolicyWeights>>,
    rng: Mutex<StdRng>,
}

impl ResourceAllocator {
    pub fn new(config: AllocationConfig, seed: u64) -> Self {
        Self {
            config,
            policies: Committed::default(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// The allocation the current policy would make without exploration.
    pub fn greedy(&self, state: &AllocationState) -> Allocation {
        let policies = self.policies.snapshot();
        let weights = policies.get(&state.module).cloned().unwrap_or_default();
        let x = state.features();
        let mut raw = [0.0; DIMENSIONS];
        for (d, b) in bounds(&state.limits).iter().enumerate() {
            raw[d] = b.lerp(sigmoid(dot(&weights.rows[d], &x)));
        }
        Allocation::clipped(raw[0], raw[1], raw[2], raw[3], &state.limits)
    }
}

impl Learner for ResourceAllocator {
    type State = AllocationState;
    type Action = Allocation;

    const DECISION_TYPE: DecisionType = DecisionType::ResourceAllocation;

    fn select_action(&self, state: &AllocationState) -> Result<Decision<Allocation>> {
        let policies = self.policies.snapshot();
        let weights = policies.get(&state.module).cloned().unwrap_or_default();
        let x = state.features();
        let width = self.config.exploration.max(0.0);

        let mut raw = [0.0; DIMENSIONS];
        {
            let mut rng = self.rng.lock();
            for (d, b) in bounds(&state.limits).iter().enumerate() {
                let noise = if width > 0.0 { rng.random_range(-width..=width) } else { 0.0 };
                raw[d] = b.lerp(sigmoid(dot(&weights.rows[d], &x) + noise));
            }
        }
        let allocation = Allocation::clipped(raw[0], raw[1], raw[2], raw[3], &state.limits);
        let n = weights.updates as f64;
        Ok(Decision::new(allocation, n / (n + 10.0)))
    }

    fn observe(&self, state: &AllocationState, action: &Allocation, reward: f64, _next_state: Option<&AllocationState>) {
        let x = state.features();
        let taken = values(action);
        let dims = bounds(&state.limits);
        let rate = self.config.learning_rate;
        self.policies.update(|policies| {
            let weights = policies.entry(state.module.clone()).or_default();
            let advantage = reward - weights.baseline;
            for d in 0..DIMENSIONS {
                let span = dims[d].span();
                if span <= 0.0 {
                    continue;
                }
                let fraction = (taken[d] - dims[d].min) / span;
                let mean = dot(&weights.rows[d], &x).clamp(-LOGIT_LIMIT, LOGIT_LIMIT);
                let delta = logit(fraction) - mean;
                for (w, xi) in weights.rows[d].iter_mut().zip(x) {
                    *w += rate * advantage * delta * xi;
                }
            }
            weights.baseline += BASELINE_RATE * (reward - weights.baseline);
            weights.updates += 1;
        });
    }
}
