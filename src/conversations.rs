use std::sync::Arc;

use log::debug;
use tokio::sync::RwLock;

use crate::models::{ChatMessage, Conversation, ConversationKind, LastMessage};

/// The ordered conversation list shown next to the chat, most recent first.
///
/// The UI layer owns it; sessions hold a clone and reorder it as messages land.
#[derive(Clone, Default)]
pub struct ConversationList {
    inner: Arc<RwLock<Vec<Conversation>>>,
}

impl ConversationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn replace_all(&self, mut conversations: Vec<Conversation>) {
        conversations.sort_by_key(|c| std::cmp::Reverse(c.last_activity()));
        *self.inner.write().await = conversations;
    }

    /// Moves the message's conversation to the front with a fresh summary.
    ///
    /// Returns `false` and leaves the list untouched when no conversation has
    /// the message's room id.
    pub async fn record_message(&self, message: &ChatMessage) -> bool {
        let mut conversations = self.inner.write().await;
        let Some(index) = conversations.iter().position(|c| c.id == message.room_id) else {
            return false;
        };

        let mut conversation = conversations.remove(index);
        conversation.last_message = Some(LastMessage::from(message));
        conversation.updated_at = message.timestamp;
        conversations.insert(0, conversation);
        debug!("Conversation {} moved to the top", message.room_id);
        true
    }

    pub async fn insert_front(&self, conversation: Conversation) {
        let mut conversations = self.inner.write().await;
        conversations.retain(|c| c.id != conversation.id);
        conversations.insert(0, conversation);
    }

    /// Swaps in a fresh copy of an existing conversation without moving it.
    pub async fn replace(&self, conversation: Conversation) -> bool {
        let mut conversations = self.inner.write().await;
        match conversations.iter_mut().find(|c| c.id == conversation.id) {
            Some(slot) => {
                *slot = conversation;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: &str) -> Option<Conversation> {
        let mut conversations = self.inner.write().await;
        let index = conversations.iter().position(|c| c.id == id)?;
        Some(conversations.remove(index))
    }

    pub async fn find(&self, id: &str) -> Option<Conversation> {
        self.inner.read().await.iter().find(|c| c.id == id).cloned()
    }

    /// The direct (non-group) conversation that includes `participant_id`.
    pub async fn find_direct_with(&self, participant_id: &str) -> Option<Conversation> {
        self.inner
            .read()
            .await
            .iter()
            .find(|c| {
                c.kind == ConversationKind::Direct
                    && c.participant_ids.iter().any(|id| id == participant_id)
            })
            .cloned()
    }

    pub async fn snapshot(&self) -> Vec<Conversation> {
        self.inner.read().await.clone()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.inner.read().await.iter().map(|c| c.id.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
