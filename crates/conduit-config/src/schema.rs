use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration, mapped from `conduit.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConduitConfig {
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    pub conversations: ConversationConfig,
    pub negotiation: NegotiationConfig,
    pub router: RouterConfig,
    pub learning: LearningConfig,
    pub logging: LoggingConfig,
}

// ── Store ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database holding conversations and episodes.
    pub db_path: PathBuf,
    /// Keep everything in memory (nothing survives a restart).
    pub in_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("conduit.db"),
            in_memory: false,
        }
    }
}

// ── Registry ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Closed capability vocabulary. Empty means any well-formed tag is accepted.
    pub allowed_capabilities: Vec<String>,
}

// ── Conversations ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Conversations idle longer than this are moved to TIMED_OUT.
    pub max_idle_secs: u64,
    /// How often the inactivity sweeper runs.
    pub sweep_interval_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_idle_secs: 1800,
            sweep_interval_secs: 60,
        }
    }
}

// ── Negotiation ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Fall back to typing the sample payload when declared schemas don't overlap.
    pub infer_from_sample: bool,
    /// Allow widening coercions (integer → number, scalar → string).
    pub allow_coercion: bool,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            infer_from_sample: true,
            allow_coercion: true,
        }
    }
}

// ── Router ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Hard ceiling on retries per routed message. Never learned.
    pub max_retries: u32,
    /// Base delay for exponential backoff between attempts (0 disables it).
    pub retry_backoff_ms: u64,
    /// After an adapt-schema decision, re-negotiate the contract instead of
    /// reusing the cached one.
    pub renegotiate_on_retry: bool,
    /// Consecutive failures before a module is marked unavailable.
    pub breaker_threshold: u32,
    /// How long a tripped module stays unavailable before it may be probed again.
    pub breaker_open_secs: u64,
    /// Priority used when a request does not carry one (0-10).
    pub default_priority: u8,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 50,
            renegotiate_on_retry: true,
            breaker_threshold: 5,
            breaker_open_secs: 60,
            default_priority: 5,
        }
    }
}

// ── Learning ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Seed for every learner's exploration and for experience sampling.
    pub seed: u64,
    pub bandit: BanditConfig,
    pub sequencing: SequencingConfig,
    pub allocation: AllocationConfig,
    pub recovery: RecoveryConfig,
    pub reward: RewardConfig,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            seed: 0x00C0_FFEE,
            bandit: BanditConfig::default(),
            sequencing: SequencingConfig::default(),
            allocation: AllocationConfig::default(),
            recovery: RecoveryConfig::default(),
            reward: RewardConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplorationPolicy {
    EpsilonGreedy,
    Ucb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BanditConfig {
    pub policy: ExplorationPolicy,
    /// Initial exploration rate (epsilon-greedy).
    pub epsilon: f64,
    /// Exploration never decays below this.
    pub epsilon_min: f64,
    /// Per-pull multiplicative decay of epsilon within a task context.
    pub epsilon_decay: f64,
    /// Exploration constant for UCB1.
    pub ucb_c: f64,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            policy: ExplorationPolicy::EpsilonGreedy,
            epsilon: 0.2,
            epsilon_min: 0.01,
            epsilon_decay: 0.95,
            ucb_c: 1.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencingConfig {
    /// Q-learning step size.
    pub alpha: f64,
    /// Discount factor.
    pub gamma: f64,
    /// Exploration rate.
    pub epsilon: f64,
}

impl Default for SequencingConfig {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            gamma: 0.9,
            epsilon: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    pub learning_rate: f64,
    /// Width of the exploration perturbation, in logit units.
    pub exploration: f64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            exploration: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub alpha: f64,
    pub epsilon: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            epsilon: 0.05,
        }
    }
}

/// Reward tiers. Every constant is configurable; the defaults are a starting
/// point, not a derivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Base reward for a completed task.
    pub completion: f64,
    /// Base reward for a failed task.
    pub failure: f64,
    /// Latency budget the latency bonus/penalty is measured against.
    pub latency_budget_ms: u64,
    /// Bonus at zero latency, shrinking linearly to 0 at the budget.
    pub latency_weight: f64,
    /// Penalty per budget-multiple beyond the budget.
    pub overtime_weight: f64,
    /// Bonus scaled by the fraction of fields preserved end-to-end.
    pub compat_weight: f64,
    /// Penalty per module beyond the shortest known path.
    pub hop_penalty: f64,
    pub data_loss_penalty: f64,
    /// Rewards are clipped below at this floor.
    pub floor: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            completion: 1.0,
            failure: -1.0,
            latency_budget_ms: 2000,
            latency_weight: 0.5,
            overtime_weight: 0.5,
            compat_weight: 0.3,
            hop_penalty: 0.1,
            data_loss_penalty: 0.5,
            floor: -2.0,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A non-fatal (or fatal) issue found while validating the config.
#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Warning,
    Error,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.severity {
            WarningSeverity::Warning => "warning",
            WarningSeverity::Error => "error",
        };
        write!(f, "{level}: {}: {}", self.field, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " ({hint})")?;
        }
        Ok(())
    }
}

fn unit_interval(v: f64) -> bool {
    (0.0..=1.0).contains(&v)
}

impl ConduitConfig {
    /// Validate the configuration. Returns all warnings, or `Err` with a
    /// summary if any of them is an error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Conversations ───
        if self.conversations.max_idle_secs == 0 {
            warnings.push(ConfigWarning {
                field: "conversations.max_idle_secs".into(),
                message: "max_idle_secs is 0; every conversation times out on the next sweep".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Set to e.g. 1800".into()),
            });
        }
        if self.conversations.sweep_interval_secs == 0 {
            warnings.push(ConfigWarning {
                field: "conversations.sweep_interval_secs".into(),
                message: "sweep interval must be positive".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 60".into()),
            });
        }

        // ── Router ───
        if self.router.max_retries > 10 {
            warnings.push(ConfigWarning {
                field: "router.max_retries".into(),
                message: format!("{} retries per message is unusually high", self.router.max_retries),
                severity: WarningSeverity::Warning,
                hint: Some("The default ceiling is 3".into()),
            });
        }
        if self.router.breaker_threshold == 0 {
            warnings.push(ConfigWarning {
                field: "router.breaker_threshold".into(),
                message: "breaker_threshold is 0; modules would be disabled immediately".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 5".into()),
            });
        }
        if self.router.default_priority > 10 {
            warnings.push(ConfigWarning {
                field: "router.default_priority".into(),
                message: format!("priority {} is out of range", self.router.default_priority),
                severity: WarningSeverity::Error,
                hint: Some("Priority must be between 0 and 10".into()),
            });
        }

        // ── Learning rates ───
        let bandit = &self.learning.bandit;
        for (field, value) in [
            ("learning.bandit.epsilon", bandit.epsilon),
            ("learning.bandit.epsilon_min", bandit.epsilon_min),
            ("learning.bandit.epsilon_decay", bandit.epsilon_decay),
            ("learning.sequencing.alpha", self.learning.sequencing.alpha),
            ("learning.sequencing.gamma", self.learning.sequencing.gamma),
            ("learning.sequencing.epsilon", self.learning.sequencing.epsilon),
            ("learning.recovery.alpha", self.learning.recovery.alpha),
            ("learning.recovery.epsilon", self.learning.recovery.epsilon),
        ] {
            if !unit_interval(value) {
                warnings.push(ConfigWarning {
                    field: field.into(),
                    message: format!("{value} is outside [0, 1]"),
                    severity: WarningSeverity::Error,
                    hint: None,
                });
            }
        }
        if bandit.epsilon_min > bandit.epsilon {
            warnings.push(ConfigWarning {
                field: "learning.bandit.epsilon_min".into(),
                message: "epsilon_min is larger than epsilon, so exploration never decays".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }
        if self.learning.allocation.learning_rate <= 0.0 {
            warnings.push(ConfigWarning {
                field: "learning.allocation.learning_rate".into(),
                message: "learning rate must be positive".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 0.05".into()),
            });
        }

        // ── Reward ───
        let reward = &self.learning.reward;
        if reward.latency_budget_ms == 0 {
            warnings.push(ConfigWarning {
                field: "learning.reward.latency_budget_ms".into(),
                message: "latency budget must be positive".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 2000".into()),
            });
        }
        if reward.floor > reward.failure {
            warnings.push(ConfigWarning {
                field: "learning.reward.floor".into(),
                message: format!(
                    "floor {} is above the failure reward {}; failures are indistinguishable",
                    reward.floor, reward.failure
                ),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }
        if reward.completion <= reward.failure {
            warnings.push(ConfigWarning {
                field: "learning.reward.completion".into(),
                message: "completion reward does not exceed the failure reward".into(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }

        // ── Logging ───
        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| w.to_string())
            .collect();
        if !errors.is_empty() {
            return Err(errors.join("; "));
        }
        Ok(warnings)
    }
}
