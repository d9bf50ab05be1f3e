use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::models::{
    Conversation, CreateConversationPayload, CreateGroupPayload, Entity, UpdateGroupPayload,
};

const DEFAULT_API_ERROR: &str = "Failed system server";
const SEARCH_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedConversation {
    pub conversation: Conversation,
    /// `false` when the backend handed back an existing conversation.
    pub is_new: bool,
}

/// REST source of conversations and of the people/groups one can chat with.
#[async_trait]
pub trait ChatDirectory: Send + Sync {
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>>;

    async fn fetch_entities(&self) -> Result<Vec<Entity>>;

    async fn create_conversation(
        &self,
        payload: &CreateConversationPayload,
    ) -> Result<CreatedConversation>;

    async fn create_group(&self, payload: &CreateGroupPayload) -> Result<Conversation>;

    async fn update_group(&self, payload: &UpdateGroupPayload) -> Result<Conversation>;

    async fn delete_group(&self, group_id: &str) -> Result<()>;
}

#[derive(Deserialize)]
struct ConversationsResponse {
    #[serde(default)]
    conversations: Vec<Conversation>,
}

#[derive(Deserialize)]
struct EntitiesResponse {
    #[serde(default)]
    entities: Vec<Entity>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationResponse {
    conversation: Conversation,
    #[serde(default)]
    is_new: bool,
}

#[derive(Deserialize)]
struct GroupResponse {
    group: Conversation,
}

#[derive(Deserialize)]
struct DeleteResponse {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize, Default)]
struct ApiErrorBody {
    error: Option<String>,
    details: Option<String>,
}

pub struct HttpDirectory {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpDirectory {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder().timeout(config.api_timeout).build()?;
        Ok(HttpDirectory {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body: ApiErrorBody = response.json().await.unwrap_or_default();
            return Err(ChatError::Api {
                status: Some(status.as_u16()),
                message: body.error.unwrap_or_else(|| DEFAULT_API_ERROR.to_string()),
                details: body.details,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ChatDirectory for HttpDirectory {
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>> {
        let response: ConversationsResponse =
            self.send(self.client.get(self.url("/conversations"))).await?;
        debug!("Fetched {} conversations", response.conversations.len());
        Ok(response.conversations)
    }

    async fn fetch_entities(&self) -> Result<Vec<Entity>> {
        let response: EntitiesResponse = self
            .send(self.client.get(self.url("/entitiesConversations")))
            .await?;
        Ok(response.entities)
    }

    async fn create_conversation(
        &self,
        payload: &CreateConversationPayload,
    ) -> Result<CreatedConversation> {
        let response: CreateConversationResponse = self
            .send(self.client.post(self.url("/conversation")).json(payload))
            .await?;
        Ok(CreatedConversation {
            conversation: response.conversation,
            is_new: response.is_new,
        })
    }

    async fn create_group(&self, payload: &CreateGroupPayload) -> Result<Conversation> {
        let response: GroupResponse = self
            .send(self.client.post(self.url("/group")).json(payload))
            .await?;
        Ok(response.group)
    }

    async fn update_group(&self, payload: &UpdateGroupPayload) -> Result<Conversation> {
        let path = format!("/group/{}", payload.group_id);
        let response: GroupResponse = self
            .send(self.client.put(self.url(&path)).json(payload))
            .await?;
        Ok(response.group)
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        let path = format!("/group/{group_id}");
        let response: DeleteResponse = self.send(self.client.delete(self.url(&path))).await?;
        if let Some(message) = response.message {
            debug!("Deleted group {}: {}", group_id, message);
        }
        Ok(())
    }
}

/// Up to ten entities whose name contains `query`, ignoring case.
pub fn search_entities<'a>(entities: &'a [Entity], query: &str) -> Vec<&'a Entity> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return Vec::new();
    }
    entities
        .iter()
        .filter(|entity| entity.name.to_lowercase().contains(&query))
        .take(SEARCH_LIMIT)
        .collect()
}
