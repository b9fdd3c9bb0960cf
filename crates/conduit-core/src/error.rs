use thiserror::Error;

use crate::types::{ConversationId, ConversationStatus};

/// Unified error type for the entire Conduit hub.
#[derive(Error, Debug)]
pub enum ConduitError {
    // ── Conversation protocol errors ───────────────────────────
    #[error("invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("out-of-order turn in conversation {conversation_id}: expected turn {expected}, got {got}")]
    OutOfOrderTurn {
        conversation_id: ConversationId,
        expected: u64,
        got: u64,
    },

    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("conversation {conversation_id} is {status} at turn {turn}, no further messages accepted")]
    ConversationClosed {
        conversation_id: ConversationId,
        status: ConversationStatus,
        turn: u64,
    },

    // ── Schema errors ──────────────────────────────────────────
    #[error("schema incompatible: {from_module} -> {to_module}: {reason}")]
    SchemaIncompatible {
        from_module: String,
        to_module: String,
        reason: String,
    },

    // ── Module errors ──────────────────────────────────────────
    #[error("module unavailable: {module}: {reason}")]
    ModuleUnavailable { module: String, reason: String },

    #[error("module {module} timed out after {budget_ms}ms")]
    Timeout { module: String, budget_ms: u64 },

    #[error("module {module} rejected payload: {reason}")]
    InvalidPayload { module: String, reason: String },

    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("registration conflict: {module}: {reason}")]
    RegistrationConflict { module: String, reason: String },

    #[error("invalid registration: {module}: {reason}")]
    InvalidRegistration { module: String, reason: String },

    // ── Routing / recovery errors ──────────────────────────────
    #[error("routing failure: no available module provides capability '{capability}'")]
    RoutingFailure { capability: String },

    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryBudgetExhausted { attempts: u32, last_error: String },

    #[error("escalated to operator: {module}: {reason}")]
    Escalated { module: String, reason: String },

    // ── Storage / config errors ────────────────────────────────
    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ConduitError {
    /// Failures the error-recovery agent may act on. Everything else is
    /// structural and goes straight back to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConduitError::Timeout { .. }
                | ConduitError::ModuleUnavailable { .. }
                | ConduitError::InvalidPayload { .. }
        )
    }

    /// Short machine-readable kind name, used in logs and failure signatures.
    pub fn kind(&self) -> &'static str {
        match self {
            ConduitError::InvalidParticipants(_) => "invalid_participants",
            ConduitError::OutOfOrderTurn { .. } => "out_of_order_turn",
            ConduitError::ConversationNotFound(_) => "conversation_not_found",
            ConduitError::ConversationClosed { .. } => "conversation_closed",
            ConduitError::SchemaIncompatible { .. } => "schema_incompatible",
            ConduitError::ModuleUnavailable { .. } => "module_unavailable",
            ConduitError::Timeout { .. } => "timeout",
            ConduitError::InvalidPayload { .. } => "invalid_payload",
            ConduitError::UnknownModule(_) => "unknown_module",
            ConduitError::RegistrationConflict { .. } => "registration_conflict",
            ConduitError::InvalidRegistration { .. } => "invalid_registration",
            ConduitError::RoutingFailure { .. } => "routing_failure",
            ConduitError::RetryBudgetExhausted { .. } => "retry_budget_exhausted",
            ConduitError::Escalated { .. } => "escalated",
            ConduitError::Storage(_) => "storage",
            ConduitError::Config(_) => "config",
            ConduitError::Io(_) => "io",
            ConduitError::Serialization(_) => "serialization",
            ConduitError::Other(_) => "other",
        }
    }
}

/// Failure raised by a module adapter. The set is closed: adapters can time
/// out, be unavailable, or reject the payload they were given.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("timed out")]
    Timeout,

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl AdapterError {
    /// Attach the module name and convert into the hub-wide error type.
    pub fn into_conduit(self, module: &str, budget_ms: u64) -> ConduitError {
        match self {
            AdapterError::Timeout => ConduitError::Timeout {
                module: module.to_string(),
                budget_ms,
            },
            AdapterError::Unavailable(reason) => ConduitError::ModuleUnavailable {
                module: module.to_string(),
                reason,
            },
            AdapterError::InvalidPayload(reason) => ConduitError::InvalidPayload {
                module: module.to_string(),
                reason,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, ConduitError>;
