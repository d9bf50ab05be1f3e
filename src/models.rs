use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Student,
    Instructor,
}

impl fmt::Display for UserType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UserType::Student => write!(f, "Student"),
            UserType::Instructor => write!(f, "Instructor"),
        }
    }
}

impl std::str::FromStr for UserType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Ok(UserType::Student),
            "instructor" => Ok(UserType::Instructor),
            other => Err(format!("unknown user type '{other}'")),
        }
    }
}

/// A chat line as delivered by the server. Never mutated after receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub room_id: String,
    pub user_id: String,
    pub user_name: String,
    pub user_type: UserType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// What makes two deliveries "the same message" when no id is available.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageIdentity {
    Id(String),
    Content {
        user_id: String,
        timestamp: DateTime<Utc>,
        message: String,
    },
}

impl ChatMessage {
    pub fn identity(&self) -> MessageIdentity {
        match &self.id {
            Some(id) => MessageIdentity::Id(id.clone()),
            None => MessageIdentity::Content {
                user_id: self.user_id.clone(),
                timestamp: self.timestamp,
                message: self.message.clone(),
            },
        }
    }

    /// Stable key for list rendering; falls back to the position in the list.
    pub fn render_key(&self, index: usize) -> String {
        self.id.clone().unwrap_or_else(|| index.to_string())
    }

    pub fn is_own(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Admin,
    Member,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub user_type: UserType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ParticipantRole>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub text: String,
    pub sender_id: String,
    pub sender_name: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&ChatMessage> for LastMessage {
    fn from(message: &ChatMessage) -> Self {
        LastMessage {
            text: message.message.clone(),
            sender_id: message.user_id.clone(),
            sender_name: message.user_name.clone(),
            timestamp: message.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub participant_ids: Vec<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<HashMap<String, DateTime<Utc>>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_group(&self) -> bool {
        self.kind == ConversationKind::Group
    }

    /// Time used for "most recent activity" ordering.
    pub fn last_activity(&self) -> DateTime<Utc> {
        match &self.last_message {
            Some(last) => last.timestamp.max(self.updated_at),
            None => self.updated_at,
        }
    }

    fn other_participant(&self, current_user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id != current_user_id)
    }

    pub fn title(&self, current_user_id: &str) -> String {
        if self.is_group() {
            return self
                .name
                .clone()
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "Group Chat".to_string());
        }
        self.other_participant(current_user_id)
            .map_or_else(|| "Unknown User".to_string(), |p| p.name.clone())
    }

    pub fn subtitle(&self, current_user_id: &str) -> String {
        if self.is_group() {
            return format!("{} members", self.participants.len());
        }
        self.other_participant(current_user_id)
            .map_or(UserType::Instructor, |p| p.user_type)
            .to_string()
    }

    pub fn preview(&self) -> String {
        match &self.last_message {
            Some(last) => format!("{}: {}", last.sender_name, last.text),
            None => "No messages yet".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// A single addressable person.
    Object,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityRole {
    Student,
    Instructor,
    Group,
    #[serde(other)]
    Unknown,
}

/// Something a conversation can be started with: a person or an existing group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    #[serde(rename = "entitiesType")]
    pub kind: EntityKind,
    pub name: String,
    #[serde(rename = "type")]
    pub role: EntityRole,
}

impl Entity {
    pub fn user_type(&self) -> Option<UserType> {
        match self.role {
            EntityRole::Student => Some(UserType::Student),
            EntityRole::Instructor => Some(UserType::Instructor),
            EntityRole::Group | EntityRole::Unknown => None,
        }
    }

    pub fn label(&self) -> String {
        match self.kind {
            EntityKind::Group => format!("{} - Group Chat", self.name),
            EntityKind::Object if self.name.is_empty() => "Unknown User".to_string(),
            EntityKind::Object => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInput {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub user_type: UserType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ParticipantRole>,
}

impl ParticipantInput {
    pub fn new(id: impl Into<String>, name: impl Into<String>, user_type: UserType) -> Self {
        ParticipantInput {
            id: id.into(),
            name: name.into(),
            user_type,
            role: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateConversationPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub participants: Vec<ParticipantInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateGroupPayload {
    pub name: String,
    pub participants: Vec<ParticipantInput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupUpdateAction {
    Rename,
    UpdateMembers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateGroupPayload {
    #[serde(skip)]
    pub group_id: String,
    pub action: GroupUpdateAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participants: Option<Vec<ParticipantInput>>,
}
