use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use tokio::sync::{watch, RwLock};

use crate::config::Config;
use crate::conversations::ConversationList;
use crate::directory::{search_entities, ChatDirectory};
use crate::error::Result;
use crate::models::{
    Conversation, CreateConversationPayload, CreateGroupPayload, Entity, EntityKind,
    GroupUpdateAction, ParticipantInput, UpdateGroupPayload, UserType,
};
use crate::session::{ChatSession, SessionOptions};
use crate::socket::SocketService;
use crate::state::{ConnectionState, SessionSnapshot};
use crate::transport::Transport;

/// Where the controller gets its (possibly shared) transport from.
#[async_trait]
pub trait TransportSource: Send + Sync {
    async fn acquire(&self) -> Arc<dyn Transport>;
}

#[async_trait]
impl TransportSource for SocketService {
    async fn acquire(&self) -> Arc<dyn Transport> {
        self.connect().await
    }
}

/// The signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUser {
    pub id: String,
    pub name: String,
    pub user_type: UserType,
}

impl ChatUser {
    pub fn options_for(&self, room_id: &str) -> Result<SessionOptions> {
        SessionOptions::new(room_id, self.id.as_str(), self.name.as_str(), self.user_type)
    }

    fn as_participant(&self) -> ParticipantInput {
        ParticipantInput::new(self.id.as_str(), self.name.as_str(), self.user_type)
    }
}

/// Owns the conversation list and at most one live [`ChatSession`].
pub struct ChatController {
    config: Config,
    source: Arc<dyn TransportSource>,
    directory: Arc<dyn ChatDirectory>,
    conversations: ConversationList,
    entities: RwLock<Vec<Entity>>,
    active: RwLock<Option<ChatSession>>,
}

impl ChatController {
    pub fn new(
        config: Config,
        source: Arc<dyn TransportSource>,
        directory: Arc<dyn ChatDirectory>,
    ) -> Self {
        ChatController {
            config,
            source,
            directory,
            conversations: ConversationList::new(),
            entities: RwLock::new(Vec::new()),
            active: RwLock::new(None),
        }
    }

    pub fn conversations(&self) -> ConversationList {
        self.conversations.clone()
    }

    /// Switches rooms. `None` closes the current session and stays idle.
    ///
    /// Selecting the identity that is already active is a no-op.
    pub async fn select(&self, options: Option<SessionOptions>) -> Result<()> {
        let mut active = self.active.write().await;
        if let (Some(current), Some(next)) = (active.as_ref(), options.as_ref()) {
            if current.options() == next {
                return Ok(());
            }
        }

        if let Some(previous) = active.take() {
            previous.close().await;
        }

        if let Some(options) = options {
            let transport = self.source.acquire().await;
            let session =
                ChatSession::open(transport, options, self.conversations.clone(), &self.config)
                    .await?;
            *active = Some(session);
        }
        Ok(())
    }

    pub async fn active_room(&self) -> Option<String> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|session| session.room_id().to_string())
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.active
            .read()
            .await
            .as_ref()
            .map_or_else(SessionSnapshot::idle, ChatSession::snapshot)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.snapshot().await.connection_state
    }

    /// Input is only enabled while the room is reachable.
    pub async fn can_send(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    pub async fn watch(&self) -> Option<watch::Receiver<SessionSnapshot>> {
        self.active.read().await.as_ref().map(ChatSession::watch)
    }

    pub async fn send_message(&self, text: &str) -> Result<()> {
        match self.active.read().await.as_ref() {
            Some(session) => session.send_message(text).await,
            None => Ok(()),
        }
    }

    pub async fn send_typing_status(&self, is_typing: bool) -> Result<()> {
        match self.active.read().await.as_ref() {
            Some(session) => session.send_typing_status(is_typing).await,
            None => Ok(()),
        }
    }

    pub async fn load_conversations(&self) -> Result<usize> {
        let conversations = self.directory.fetch_conversations().await?;
        let count = conversations.len();
        self.conversations.replace_all(conversations).await;
        info!("Loaded {} conversations", count);
        Ok(count)
    }

    pub async fn load_entities(&self) -> Result<usize> {
        let entities = self.directory.fetch_entities().await?;
        let count = entities.len();
        *self.entities.write().await = entities;
        Ok(count)
    }

    pub async fn search(&self, query: &str) -> Vec<Entity> {
        let entities = self.entities.read().await;
        search_entities(&entities, query)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Opens the conversation with `entity`, creating it on the backend if needed.
    pub async fn start_chat(&self, me: &ChatUser, entity: &Entity) -> Result<Conversation> {
        let existing = match entity.kind {
            EntityKind::Object => self.conversations.find_direct_with(&entity.id).await,
            EntityKind::Group => self.conversations.find(&entity.id).await,
        };

        let conversation = match existing {
            Some(conversation) => conversation,
            None => {
                let payload = CreateConversationPayload {
                    name: Some(entity.name.clone()),
                    participants: vec![
                        me.as_participant(),
                        ParticipantInput::new(
                            entity.id.as_str(),
                            entity.name.as_str(),
                            entity.user_type().unwrap_or(UserType::Student),
                        ),
                    ],
                };
                let created = self.directory.create_conversation(&payload).await?;
                if created.is_new {
                    self.conversations
                        .insert_front(created.conversation.clone())
                        .await;
                }
                created.conversation
            }
        };

        self.select(Some(me.options_for(&conversation.id)?)).await?;
        Ok(conversation)
    }

    pub async fn create_group(
        &self,
        me: &ChatUser,
        name: &str,
        member_ids: &[String],
    ) -> Result<Conversation> {
        let mut participants = vec![me.as_participant()];
        {
            let entities = self.entities.read().await;
            for id in member_ids {
                let entity = entities.iter().find(|e| &e.id == id);
                participants.push(ParticipantInput::new(
                    id.as_str(),
                    entity.map_or("Unknown", |e| e.name.as_str()),
                    entity
                        .and_then(Entity::user_type)
                        .unwrap_or(UserType::Student),
                ));
            }
        }

        let group = self
            .directory
            .create_group(&CreateGroupPayload {
                name: name.to_string(),
                participants,
            })
            .await?;
        self.conversations.insert_front(group.clone()).await;
        self.select(Some(me.options_for(&group.id)?)).await?;
        Ok(group)
    }

    pub async fn rename_group(&self, group_id: &str, name: &str) -> Result<Conversation> {
        let group = self
            .directory
            .update_group(&UpdateGroupPayload {
                group_id: group_id.to_string(),
                action: GroupUpdateAction::Rename,
                name: Some(name.to_string()),
                participants: None,
            })
            .await?;
        self.conversations.replace(group.clone()).await;
        Ok(group)
    }

    pub async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.directory.delete_group(group_id).await?;
        self.conversations.remove(group_id).await;
        if self.active_room().await.as_deref() == Some(group_id) {
            self.select(None).await?;
        }
        Ok(())
    }

    /// Closes the active session, if any.
    pub async fn shutdown(&self) -> Result<()> {
        self.select(None).await
    }
}
