use async_trait::async_trait;
use conduit_core::{AdapterError, Allocation, ConversationId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One dispatch handed to a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub conversation_id: ConversationId,
    /// Turn number of the request message that carried this payload.
    pub turn: u64,
    /// Optional verb within the module, e.g. "extract" or "store".
    #[serde(default)]
    pub action: Option<String>,
    /// Payload already reshaped by the negotiated contract.
    pub payload: Value,
    /// Resources granted to this dispatch. The router enforces
    /// `allocation.timeout_ms` as a hard deadline.
    pub allocation: Allocation,
}

/// The hub's view of an attached module.
///
/// Adapters never see the conversation machinery: they get a contract-shaped
/// payload and answer with a value or one of the three closed failure kinds.
#[async_trait]
pub trait ModuleAdapter: Send + Sync {
    /// Registered module name this adapter serves.
    fn name(&self) -> &str;

    async fn invoke(&self, invocation: Invocation) -> Result<Value, AdapterError>;

    /// Liveness probe used by `MessageRouter::refresh_health`.
    async fn health_check(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}
