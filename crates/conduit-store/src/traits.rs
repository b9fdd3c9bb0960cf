use async_trait::async_trait;
use conduit_core::{Conversation, ConversationId, ConversationStatus, DecisionType, Episode, Message, Result};

/// Durable storage for conversations and their turns.
///
/// Turn numbers are unique per conversation at the storage level: appending a
/// message whose `(conversation_id, turn)` already exists fails and leaves the
/// stored conversation row untouched.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Insert or update the conversation row.
    async fn save_conversation(&self, conversation: &Conversation) -> Result<()>;

    /// Atomically persist an accepted turn: the conversation row (already
    /// reflecting the new turn counter/status) and the message itself.
    async fn append_message(&self, conversation: &Conversation, message: &Message) -> Result<()>;

    async fn load_conversation(&self, id: ConversationId) -> Result<Option<Conversation>>;

    /// All messages of a conversation, ordered by turn.
    async fn load_messages(&self, id: ConversationId) -> Result<Vec<Message>>;

    /// Conversations, most recently active first, optionally filtered by status.
    async fn list_conversations(&self, status: Option<ConversationStatus>) -> Result<Vec<Conversation>>;

    async fn count_by_status(&self) -> Result<Vec<(ConversationStatus, u64)>>;
}

/// Append-only log of learning episodes.
#[async_trait]
pub trait EpisodeLog: Send + Sync {
    async fn append(&self, episode: &Episode) -> Result<()>;

    /// Episodes of one decision type, in append order.
    async fn load(&self, decision_type: DecisionType) -> Result<Vec<Episode>>;

    async fn counts(&self) -> Result<Vec<(DecisionType, u64)>>;
}
