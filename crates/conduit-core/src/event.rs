use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::sync::Arc;
use tokio::sync::broadcast;

/// Events flowing through the hub. Operators and tooling subscribe to these;
/// escalations reach a human through this bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HubEvent {
    // ── Module lifecycle ───────────────────────────────────────
    ModuleRegistered {
        module: String,
        version: u64,
    },
    ModuleDeregistered {
        module: String,
    },
    ModuleHealthChanged {
        module: String,
        healthy: bool,
    },

    // ── Conversation lifecycle ─────────────────────────────────
    ConversationCreated {
        conversation_id: Uuid,
        participants: Vec<String>,
    },
    TurnAccepted {
        conversation_id: Uuid,
        turn: u64,
        source: String,
        target: String,
    },
    ConversationClosed {
        conversation_id: Uuid,
    },
    ConversationTimedOut {
        conversation_id: Uuid,
    },

    // ── Routing ────────────────────────────────────────────────
    ContractNegotiated {
        source: String,
        target: String,
        inferred: bool,
    },
    RecoveryChosen {
        conversation_id: Uuid,
        module: String,
        action: String,
        attempt: u32,
    },
    Escalated {
        conversation_id: Uuid,
        module: String,
        reason: String,
    },
}

/// A broadcast-based event bus for hub-wide pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<HubEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: HubEvent) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}
