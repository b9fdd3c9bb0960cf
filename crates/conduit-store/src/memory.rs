use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use conduit_core::{
    ConduitError, Conversation, ConversationId, ConversationStatus, DecisionType, Episode, Message, Result,
};

use crate::traits::{ConversationStore, EpisodeLog};

/// Non-durable store with the same semantics as [`crate::SqliteStore`].
#[derive(Default)]
pub struct MemoryStore {
    conversations: Mutex<HashMap<ConversationId, Conversation>>,
    messages: Mutex<HashMap<ConversationId, Vec<Message>>>,
    episodes: Mutex<Vec<Episode>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.conversations
            .lock()
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn append_message(&self, conversation: &Conversation, message: &Message) -> Result<()> {
        // Lock order: conversations, then messages.
        let mut conversations = self.conversations.lock();
        let mut messages = self.messages.lock();
        let turns = messages.entry(message.conversation_id).or_default();
        if turns.iter().any(|m| m.turn == message.turn) {
            return Err(ConduitError::Storage(format!(
                "turn {} already stored for conversation {}",
                message.turn, message.conversation_id
            )));
        }
        conversations.insert(conversation.id, conversation.clone());
        turns.push(message.clone());
        Ok(())
    }

    async fn load_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        Ok(self.conversations.lock().get(&id).cloned())
    }

    async fn load_messages(&self, id: ConversationId) -> Result<Vec<Message>> {
        let mut turns = self.messages.lock().get(&id).cloned().unwrap_or_default();
        turns.sort_by_key(|m| m.turn);
        Ok(turns)
    }

    async fn list_conversations(&self, status: Option<ConversationStatus>) -> Result<Vec<Conversation>> {
        let mut list: Vec<Conversation> = self
            .conversations
            .lock()
            .values()
            .filter(|c| status.is_none_or(|s| c.status == s))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(list)
    }

    async fn count_by_status(&self) -> Result<Vec<(ConversationStatus, u64)>> {
        let mut counts: Vec<(ConversationStatus, u64)> = Vec::new();
        for conversation in self.conversations.lock().values() {
            match counts.iter_mut().find(|(s, _)| *s == conversation.status) {
                Some((_, n)) => *n += 1,
                None => counts.push((conversation.status, 1)),
            }
        }
        counts.sort_by_key(|(s, _)| s.as_str());
        Ok(counts)
    }
}

#[async_trait]
impl EpisodeLog for MemoryStore {
    async fn append(&self, episode: &Episode) -> Result<()> {
        self.episodes.lock().push(episode.clone());
        Ok(())
    }

    async fn load(&self, decision_type: DecisionType) -> Result<Vec<Episode>> {
        Ok(self
            .episodes
            .lock()
            .iter()
            .filter(|e| e.decision_type == decision_type)
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<Vec<(DecisionType, u64)>> {
        let episodes = self.episodes.lock();
        let mut counts: Vec<(DecisionType, u64)> = DecisionType::ALL
            .iter()
            .map(|dt| (*dt, episodes.iter().filter(|e| e.decision_type == *dt).count() as u64))
            .filter(|(_, n)| *n > 0)
            .collect();
        counts.sort_by_key(|(dt, _)| dt.as_str());
        Ok(counts)
    }
}
