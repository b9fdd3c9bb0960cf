use conduit_config::RewardConfig;
use serde::{Deserialize, Serialize};

/// What was observed once a decision's outcome became visible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    /// End-to-end latency of the routed task.
    pub latency_ms: u64,
    /// Per-task budget; `None` uses the configured default.
    #[serde(default)]
    pub latency_budget_ms: Option<u64>,
    /// Fraction of source fields that survived schema negotiation, in [0, 1].
    pub preserved_ratio: f64,
    /// Modules the task passed through.
    pub hops: u32,
    /// Shortest known path for this kind of task.
    pub shortest_hops: u32,
    pub data_lost: bool,
}

impl Outcome {
    pub fn success(latency_ms: u64) -> Self {
        Self {
            success: true,
            latency_ms,
            latency_budget_ms: None,
            preserved_ratio: 1.0,
            hops: 1,
            shortest_hops: 1,
            data_lost: false,
        }
    }

    pub fn failure(latency_ms: u64) -> Self {
        Self {
            success: false,
            ..Self::success(latency_ms)
        }
    }

    pub fn with_budget(mut self, budget_ms: u64) -> Self {
        self.latency_budget_ms = Some(budget_ms);
        self
    }

    pub fn with_preserved_ratio(mut self, ratio: f64) -> Self {
        self.preserved_ratio = ratio;
        self
    }

    pub fn with_hops(mut self, hops: u32, shortest: u32) -> Self {
        self.hops = hops;
        self.shortest_hops = shortest;
        self
    }

    pub fn with_data_loss(mut self) -> Self {
        self.data_lost = true;
        self
    }
}

/// Each tier's contribution, kept for logging and inspection.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub base: f64,
    /// Positive under budget, negative over it.
    pub latency: f64,
    pub compatibility: f64,
    pub hops: f64,
    pub data_loss: f64,
    /// Sum of the tiers, clipped below at the floor.
    pub total: f64,
}

/// Tiered reward shaping shared by all four learners. Pure: the same outcome
/// always yields the same reward.
#[derive(Debug, Clone)]
pub struct RewardModel {
    config: RewardConfig,
}

impl RewardModel {
    pub fn new(config: RewardConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RewardConfig {
        &self.config
    }

    pub fn reward(&self, outcome: &Outcome) -> f64 {
        self.breakdown(outcome).total
    }

    pub fn breakdown(&self, outcome: &Outcome) -> RewardBreakdown {
        let c = &self.config;
        let base = if outcome.success { c.completion } else { c.failure };

        let budget = outcome.latency_budget_ms.unwrap_or(c.latency_budget_ms).max(1) as f64;
        let ratio = outcome.latency_ms as f64 / budget;
        let latency = if ratio <= 1.0 {
            c.latency_weight * (1.0 - ratio)
        } else {
            -c.overtime_weight * (ratio - 1.0)
        };

        let compatibility = c.compat_weight * outcome.preserved_ratio.clamp(0.0, 1.0);
        let extra_hops = outcome.hops.saturating_sub(outcome.shortest_hops) as f64;
        let hops = -c.hop_penalty * extra_hops;
        let data_loss = if outcome.data_lost { -c.data_loss_penalty } else { 0.0 };

        let raw = base + latency + compatibility + hops + data_loss;
        RewardBreakdown {
            base,
            latency,
            compatibility,
            hops,
            data_loss,
            total: raw.max(c.floor),
        }
    }
}

impl Default for RewardModel {
    fn default() -> Self {
        Self::new(RewardConfig::default())
    }
}
