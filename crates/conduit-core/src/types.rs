use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a conversation.
pub type ConversationId = Uuid;

/// Unique identifier for a message.
pub type MessageId = Uuid;

/// Registered module name (unique key in the registry).
pub type ModuleName = String;

/// Lifecycle of a conversation.
///
/// `Initiated → Active → {Active ⇄ Waiting} → {Closed | TimedOut}`.
/// `Closed` and `TimedOut` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    Initiated,
    Active,
    Waiting,
    Closed,
    TimedOut,
}

impl ConversationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConversationStatus::Closed | ConversationStatus::TimedOut)
    }

    /// Whether moving from `self` to `next` respects the state machine.
    /// Staying in the same state is always allowed.
    pub fn can_transition_to(self, next: ConversationStatus) -> bool {
        use ConversationStatus::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Initiated, Active) => true,
            (Active, Waiting) | (Waiting, Active) => true,
            (Active | Waiting, Closed | TimedOut) => true,
            // A conversation nobody ever spoke in can still be closed or reaped.
            (Initiated, Closed | TimedOut) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConversationStatus::Initiated => "INITIATED",
            ConversationStatus::Active => "ACTIVE",
            ConversationStatus::Waiting => "WAITING",
            ConversationStatus::Closed => "CLOSED",
            ConversationStatus::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INITIATED" => Ok(ConversationStatus::Initiated),
            "ACTIVE" => Ok(ConversationStatus::Active),
            "WAITING" => Ok(ConversationStatus::Waiting),
            "CLOSED" => Ok(ConversationStatus::Closed),
            "TIMED_OUT" | "TIMEDOUT" => Ok(ConversationStatus::TimedOut),
            other => Err(format!("unknown conversation status '{other}'")),
        }
    }
}

/// An ordered, stateful exchange of turns between two or more modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Participant module names, in the order they were given.
    pub participants: Vec<ModuleName>,
    pub status: ConversationStatus,
    /// Number of accepted turns; also the turn number the next message must carry.
    pub turn_counter: u64,
    /// Shared key/value state visible to every participant.
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Conversation {
    /// Create a conversation in `Initiated` status. Participant validation is
    /// the conversation manager's job.
    pub fn new(participants: Vec<ModuleName>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            participants,
            status: ConversationStatus::Initiated,
            turn_counter: 0,
            context: BTreeMap::new(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn is_participant(&self, module: &str) -> bool {
        self.participants.iter().any(|p| p == module)
    }

    /// How long the conversation has been idle as of `now`.
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_activity)
    }
}

/// One turn in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub source: ModuleName,
    pub target: ModuleName,
    /// Must equal the conversation's turn counter at acceptance time.
    pub turn: u64,
    pub payload: serde_json::Value,
    /// Weak back-reference to the message this one answers (identifier only).
    #[serde(default)]
    pub in_reply_to: Option<MessageId>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        conversation_id: ConversationId,
        source: impl Into<String>,
        target: impl Into<String>,
        turn: u64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            source: source.into(),
            target: target.into(),
            turn,
            payload,
            in_reply_to: None,
            timestamp: Utc::now(),
        }
    }

    pub fn in_reply_to(mut self, message_id: MessageId) -> Self {
        self.in_reply_to = Some(message_id);
        self
    }
}

/// Result of accepting a turn into a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingOutcome {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    /// Turn number the message was accepted as.
    pub turn: u64,
    pub status: ConversationStatus,
}
