use chrono::{TimeDelta, Utc};
use conduit_core::{
    ConduitError, Conversation, ConversationId, ConversationStatus, EventBus, HubEvent, Message, MessageId, Result,
    RoutingOutcome,
};
use conduit_store::ConversationStore;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as TokioMutex, RwLock};
use tracing::{debug, info, warn};

use crate::registry::ModuleRegistry;

type Slot = Arc<TokioMutex<Conversation>>;

/// Owns the lifecycle of every live conversation.
///
/// Each conversation sits behind its own async mutex: turns on one
/// conversation are strictly serialized while different conversations
/// proceed in parallel. A turn is persisted before the in-memory state
/// moves, so a storage failure leaves the conversation exactly as it was.
pub struct ConversationManager {
    active: DashMap<ConversationId, Slot>,
    /// Per-conversation exchange locks, held by callers that need several
    /// consecutive turns (request, then reply) without interleaving.
    run_locks: RwLock<HashMap<ConversationId, Arc<TokioMutex<()>>>>,
    store: Arc<dyn ConversationStore>,
    registry: Arc<ModuleRegistry>,
    events: EventBus,
}

impl ConversationManager {
    pub fn new(store: Arc<dyn ConversationStore>, registry: Arc<ModuleRegistry>, events: EventBus) -> Self {
        Self {
            active: DashMap::new(),
            run_locks: RwLock::new(HashMap::new()),
            store,
            registry,
            events,
        }
    }

    /// Start a conversation between at least two distinct registered modules.
    /// Duplicate names are collapsed, keeping first-seen order.
    pub async fn create_conversation(&self, participants: Vec<String>) -> Result<ConversationId> {
        let mut seen = HashSet::new();
        let participants: Vec<String> = participants.into_iter().filter(|p| seen.insert(p.clone())).collect();
        if participants.len() < 2 {
            return Err(ConduitError::InvalidParticipants(format!(
                "a conversation needs at least two distinct participants, got {}",
                participants.len()
            )));
        }
        for p in &participants {
            self.registry.require(p)?;
        }

        let conversation = Conversation::new(participants.clone());
        let id = conversation.id;
        self.store.save_conversation(&conversation).await?;
        self.active.insert(id, Arc::new(TokioMutex::new(conversation)));

        info!(conversation = %id, participants = ?participants, "conversation created");
        self.events.publish(HubEvent::ConversationCreated {
            conversation_id: id,
            participants,
        });
        Ok(id)
    }

    /// Accept `message` as the next turn of conversation `id`.
    ///
    /// The message's turn must equal the conversation's turn counter. On
    /// success the counter advances by one and the status becomes `ACTIVE`.
    pub async fn route_message(&self, id: ConversationId, message: Message) -> Result<RoutingOutcome> {
        let slot = self.slot(id).await?;
        let mut conversation = slot.lock().await;
        self.accept(&mut conversation, &message).await
    }

    /// Build and accept the next turn in one step, numbering it from the
    /// current counter under the conversation lock.
    pub async fn send(
        &self,
        id: ConversationId,
        source: &str,
        target: &str,
        payload: Value,
        in_reply_to: Option<MessageId>,
    ) -> Result<(Message, RoutingOutcome)> {
        let slot = self.slot(id).await?;
        let mut conversation = slot.lock().await;
        let mut message = Message::new(id, source, target, conversation.turn_counter, payload);
        message.in_reply_to = in_reply_to;
        let outcome = self.accept(&mut conversation, &message).await?;
        Ok((message, outcome))
    }

    pub async fn get_conversation_state(&self, id: ConversationId) -> Result<Conversation> {
        if let Some(slot) = self.active.get(&id).map(|e| Arc::clone(e.value())) {
            return Ok(slot.lock().await.clone());
        }
        self.store
            .load_conversation(id)
            .await?
            .ok_or(ConduitError::ConversationNotFound(id))
    }

    /// Close a conversation. Closing an already-terminal conversation is a no-op.
    ///
    /// A conversation that is only in the store is rehydrated into its slot
    /// first, so the close serializes with any turn racing for the same id.
    pub async fn close_conversation(&self, id: ConversationId) -> Result<()> {
        let slot = match self.slot(id).await {
            Ok(slot) => slot,
            Err(ConduitError::ConversationClosed { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut conversation = slot.lock().await;
        if !conversation.status.is_terminal() {
            let mut next = conversation.clone();
            next.status = ConversationStatus::Closed;
            next.last_activity = Utc::now();
            self.store.save_conversation(&next).await?;
            *conversation = next;
            self.announce_closed(id);
        }
        drop(conversation);
        self.evict(id, &slot).await;
        Ok(())
    }

    /// Time out every live conversation idle for longer than `max_idle`.
    ///
    /// Conversations are locked one at a time and only if free; one that is
    /// mid-turn or mid-exchange is by definition not idle and is skipped.
    /// Returns the ids that were timed out.
    pub async fn cleanup_inactive(&self, max_idle: Duration) -> Result<Vec<ConversationId>> {
        let max_idle = TimeDelta::from_std(max_idle).unwrap_or(TimeDelta::MAX);
        let busy: HashSet<ConversationId> = {
            let locks = self.run_locks.read().await;
            locks
                .iter()
                .filter(|(_, lock)| lock.try_lock().is_err())
                .map(|(id, _)| *id)
                .collect()
        };
        let slots: Vec<(ConversationId, Slot)> = self
            .active
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect();

        let mut timed_out = Vec::new();
        for (id, slot) in slots {
            if busy.contains(&id) {
                continue;
            }
            let Ok(mut conversation) = slot.try_lock() else {
                continue;
            };
            let now = Utc::now();
            if conversation.status.is_terminal() || conversation.idle_for(now) <= max_idle {
                continue;
            }

            let mut next = conversation.clone();
            next.status = ConversationStatus::TimedOut;
            next.last_activity = now;
            if let Err(e) = self.store.save_conversation(&next).await {
                warn!(conversation = %id, error = %e, "failed to persist timeout, will retry next sweep");
                continue;
            }
            *conversation = next;
            drop(conversation);
            self.evict(id, &slot).await;

            info!(conversation = %id, "conversation timed out");
            self.events.publish(HubEvent::ConversationTimedOut { conversation_id: id });
            timed_out.push(id);
        }
        Ok(timed_out)
    }

    /// Add `module` to the participant list if it isn't already there.
    pub async fn join(&self, id: ConversationId, module: &str) -> Result<()> {
        self.registry.require(module)?;
        self.mutate(id, |c| {
            if !c.is_participant(module) {
                c.participants.push(module.to_string());
            }
        })
        .await
    }

    /// Mark the conversation as waiting on a reply (or back to active).
    /// Only `ACTIVE ⇄ WAITING` moves; any other status is left alone.
    pub async fn set_waiting(&self, id: ConversationId, waiting: bool) -> Result<()> {
        self.mutate(id, |c| {
            c.status = match (c.status, waiting) {
                (ConversationStatus::Active, true) => ConversationStatus::Waiting,
                (ConversationStatus::Waiting, false) => ConversationStatus::Active,
                (other, _) => other,
            };
        })
        .await
    }

    /// Set one key of the conversation's shared context.
    pub async fn update_context(&self, id: ConversationId, key: &str, value: Value) -> Result<()> {
        self.mutate(id, |c| {
            c.context.insert(key.to_string(), value);
        })
        .await
    }

    /// Every stored turn, ordered by turn number.
    pub async fn history(&self, id: ConversationId) -> Result<Vec<Message>> {
        if !self.active.contains_key(&id) && self.store.load_conversation(id).await?.is_none() {
            return Err(ConduitError::ConversationNotFound(id));
        }
        self.store.load_messages(id).await
    }

    pub async fn list(&self, status: Option<ConversationStatus>) -> Result<Vec<Conversation>> {
        self.store.list_conversations(status).await
    }

    /// Load every non-terminal conversation from the store into memory.
    /// Returns how many were restored.
    pub async fn restore_active(&self) -> Result<usize> {
        let mut restored = 0;
        for conversation in self.store.list_conversations(None).await? {
            if conversation.status.is_terminal() {
                continue;
            }
            let id = conversation.id;
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.active.entry(id) {
                slot.insert(Arc::new(TokioMutex::new(conversation)));
                restored += 1;
            }
        }
        if restored > 0 {
            info!(restored, "restored live conversations from store");
        }
        Ok(restored)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_ids(&self) -> Vec<ConversationId> {
        self.active.iter().map(|e| *e.key()).collect()
    }

    /// Get the per-conversation exchange lock. Hold the guard across every
    /// turn of one request/reply exchange.
    pub async fn run_lock(&self, id: ConversationId) -> Arc<TokioMutex<()>> {
        // Fast path: lock already exists
        {
            let locks = self.run_locks.read().await;
            if let Some(lock) = locks.get(&id) {
                return Arc::clone(lock);
            }
        }
        // Slow path: create a new lock
        let mut locks = self.run_locks.write().await;
        Arc::clone(locks.entry(id).or_insert_with(|| Arc::new(TokioMutex::new(()))))
    }

    async fn accept(&self, conversation: &mut Conversation, message: &Message) -> Result<RoutingOutcome> {
        if conversation.status.is_terminal() {
            return Err(ConduitError::ConversationClosed {
                conversation_id: conversation.id,
                status: conversation.status,
                turn: conversation.turn_counter,
            });
        }
        if message.conversation_id != conversation.id {
            return Err(ConduitError::InvalidParticipants(format!(
                "message addressed to conversation {} routed into {}",
                message.conversation_id, conversation.id
            )));
        }
        for module in [&message.source, &message.target] {
            if !conversation.is_participant(module) {
                return Err(ConduitError::InvalidParticipants(format!(
                    "{module} is not a participant of conversation {}",
                    conversation.id
                )));
            }
        }
        if message.turn != conversation.turn_counter {
            return Err(ConduitError::OutOfOrderTurn {
                conversation_id: conversation.id,
                expected: conversation.turn_counter,
                got: message.turn,
            });
        }

        let mut next = conversation.clone();
        next.turn_counter += 1;
        next.status = ConversationStatus::Active;
        next.last_activity = Utc::now();
        self.store.append_message(&next, message).await?;
        *conversation = next;

        debug!(
            conversation = %conversation.id,
            turn = message.turn,
            source = %message.source,
            target = %message.target,
            "turn accepted"
        );
        self.events.publish(HubEvent::TurnAccepted {
            conversation_id: conversation.id,
            turn: message.turn,
            source: message.source.clone(),
            target: message.target.clone(),
        });
        Ok(RoutingOutcome {
            conversation_id: conversation.id,
            message_id: message.id,
            turn: message.turn,
            status: conversation.status,
        })
    }

    /// Apply `f` to a live conversation, persist, then commit in memory.
    async fn mutate(&self, id: ConversationId, f: impl FnOnce(&mut Conversation)) -> Result<()> {
        let slot = self.slot(id).await?;
        let mut conversation = slot.lock().await;
        if conversation.status.is_terminal() {
            return Err(ConduitError::ConversationClosed {
                conversation_id: id,
                status: conversation.status,
                turn: conversation.turn_counter,
            });
        }
        let mut next = conversation.clone();
        f(&mut next);
        if next == *conversation {
            return Ok(());
        }
        next.last_activity = Utc::now();
        self.store.save_conversation(&next).await?;
        *conversation = next;
        Ok(())
    }

    /// The live slot for `id`, rehydrating it from the store if needed.
    async fn slot(&self, id: ConversationId) -> Result<Slot> {
        if let Some(slot) = self.active.get(&id) {
            return Ok(Arc::clone(slot.value()));
        }
        let stored = self
            .store
            .load_conversation(id)
            .await?
            .ok_or(ConduitError::ConversationNotFound(id))?;
        if stored.status.is_terminal() {
            return Err(ConduitError::ConversationClosed {
                conversation_id: id,
                status: stored.status,
                turn: stored.turn_counter,
            });
        }
        let slot = self
            .active
            .entry(id)
            .or_insert_with(|| Arc::new(TokioMutex::new(stored)));
        Ok(Arc::clone(slot.value()))
    }

    async fn evict(&self, id: ConversationId, slot: &Slot) {
        self.active.remove_if(&id, |_, current| Arc::ptr_eq(current, slot));
        self.run_locks.write().await.remove(&id);
    }

    fn announce_closed(&self, id: ConversationId) {
        info!(conversation = %id, "conversation closed");
        self.events.publish(HubEvent::ConversationClosed { conversation_id: id });
    }
}
