use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Which learner a decision (and its episode) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    ModuleSelection,
    PipelineSequencing,
    ResourceAllocation,
    ErrorRecovery,
}

impl DecisionType {
    pub const ALL: [DecisionType; 4] = [
        DecisionType::ModuleSelection,
        DecisionType::PipelineSequencing,
        DecisionType::ResourceAllocation,
        DecisionType::ErrorRecovery,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DecisionType::ModuleSelection => "module_selection",
            DecisionType::PipelineSequencing => "pipeline_sequencing",
            DecisionType::ResourceAllocation => "resource_allocation",
            DecisionType::ErrorRecovery => "error_recovery",
        }
    }
}

impl fmt::Display for DecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").to_lowercase().as_str() {
            "module_selection" => Ok(DecisionType::ModuleSelection),
            "pipeline_sequencing" => Ok(DecisionType::PipelineSequencing),
            "resource_allocation" => Ok(DecisionType::ResourceAllocation),
            "error_recovery" => Ok(DecisionType::ErrorRecovery),
            other => Err(format!("unknown decision type '{other}'")),
        }
    }
}

/// One recorded (state, action, reward, next-state) unit. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: Uuid,
    pub decision_type: DecisionType,
    /// Learner-specific state features, serialized.
    pub state: serde_json::Value,
    /// The chosen action, serialized.
    pub action: serde_json::Value,
    pub reward: f64,
    #[serde(default)]
    pub next_state: Option<serde_json::Value>,
    pub terminal: bool,
    pub recorded_at: DateTime<Utc>,
}

impl Episode {
    pub fn new(
        decision_type: DecisionType,
        state: serde_json::Value,
        action: serde_json::Value,
        reward: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            decision_type,
            state,
            action,
            reward,
            next_state: None,
            terminal: true,
            recorded_at: Utc::now(),
        }
    }

    /// Attach the follow-up state; the episode is then non-terminal.
    pub fn with_next_state(mut self, next_state: serde_json::Value) -> Self {
        self.next_state = Some(next_state);
        self.terminal = false;
        self
    }
}
