use std::collections::HashSet;

use log::{debug, info};

use crate::config::HistoryMode;
use crate::messages::{ClientEvent, GetHistoryPayload, JoinRoomPayload, ServerEvent};
use crate::models::ChatMessage;
use crate::transport::TransportEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Inbound events a session reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Joined,
    History(Vec<ChatMessage>),
    Message(ChatMessage),
    Typing { user_name: String, is_typing: bool },
    Presence { user_name: String, joined: bool },
    Connected,
    Disconnected,
}

impl From<TransportEvent> for SessionEvent {
    fn from(event: TransportEvent) -> Self {
        match event {
            TransportEvent::Connected => SessionEvent::Connected,
            TransportEvent::Disconnected { .. } => SessionEvent::Disconnected,
            TransportEvent::Server(event) => match event {
                ServerEvent::RoomJoined => SessionEvent::Joined,
                ServerEvent::ChatHistory(payload) => SessionEvent::History(payload.messages),
                ServerEvent::ReceiveMessage(message) => SessionEvent::Message(message),
                ServerEvent::UserJoined(payload) => SessionEvent::Presence {
                    user_name: payload.user_name,
                    joined: true,
                },
                ServerEvent::UserLeft(payload) => SessionEvent::Presence {
                    user_name: payload.user_name,
                    joined: false,
                },
                ServerEvent::UserTyping(payload) => SessionEvent::Typing {
                    user_name: payload.user_name,
                    is_typing: payload.is_typing,
                },
            },
        }
    }
}

/// Side effects the caller must carry out after an event is applied.
#[derive(Debug, Default, PartialEq)]
pub struct Reaction {
    pub outbound: Vec<ClientEvent>,
    /// A live message to fold into the conversation list.
    pub delivered: Option<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    pub messages: Vec<ChatMessage>,
    pub typing_users: Vec<String>,
}

impl SessionSnapshot {
    /// What an observer sees while no conversation is selected.
    pub fn idle() -> Self {
        SessionSnapshot {
            connection_state: ConnectionState::Disconnected,
            messages: Vec::new(),
            typing_users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateOptions {
    pub room_id: String,
    pub user_id: String,
    pub user_name: String,
    pub history_limit: u32,
    pub history_mode: HistoryMode,
    pub rejoin_on_reconnect: bool,
}

/// Per-room state, advanced one event at a time by [`SessionState::apply`].
#[derive(Debug)]
pub struct SessionState {
    options: StateOptions,
    connection_state: ConnectionState,
    messages: Vec<ChatMessage>,
    typing_users: Vec<String>,
    /// Live messages seen while a history request is outstanding.
    unconfirmed_live: Vec<ChatMessage>,
    awaiting_history: bool,
    /// Set once the server has been reached, so early connect failures do not
    /// count as a dropped connection.
    reached_server: bool,
    lost_connection: bool,
    closed: bool,
}

impl SessionState {
    pub fn new(options: StateOptions) -> Self {
        SessionState {
            options,
            connection_state: ConnectionState::Connecting,
            messages: Vec::new(),
            typing_users: Vec::new(),
            unconfirmed_live: Vec::new(),
            awaiting_history: false,
            reached_server: false,
            lost_connection: false,
            closed: false,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.options.room_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn typing_users(&self) -> &[String] {
        &self.typing_users
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// After this, every event is ignored.
    pub fn close(&mut self) {
        self.closed = true;
        self.connection_state = ConnectionState::Disconnected;
        self.typing_users.clear();
        self.unconfirmed_live.clear();
        self.awaiting_history = false;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_state: self.connection_state,
            messages: self.messages.clone(),
            typing_users: self.typing_users.clone(),
        }
    }

    pub fn join_event(&self) -> ClientEvent {
        ClientEvent::JoinRoom(JoinRoomPayload {
            room_id: self.options.room_id.clone(),
            user_id: self.options.user_id.clone(),
            user_name: self.options.user_name.clone(),
        })
    }

    fn history_request(&self) -> ClientEvent {
        ClientEvent::GetHistory(GetHistoryPayload {
            room_id: self.options.room_id.clone(),
            limit: self.options.history_limit,
        })
    }

    pub fn apply(&mut self, event: SessionEvent) -> Reaction {
        let mut reaction = Reaction::default();
        if self.closed {
            return reaction;
        }

        match event {
            SessionEvent::Joined => {
                info!("Joined room {}", self.options.room_id);
                self.connection_state = ConnectionState::Connected;
                self.reached_server = true;
                self.unconfirmed_live.clear();
                self.awaiting_history = true;
                reaction.outbound.push(self.history_request());
            }
            SessionEvent::History(history) => self.apply_history(history),
            SessionEvent::Message(message) => {
                self.messages.push(message.clone());
                if self.awaiting_history {
                    self.unconfirmed_live.push(message.clone());
                }
                reaction.delivered = Some(message);
            }
            SessionEvent::Typing {
                user_name,
                is_typing,
            } => self.apply_typing(user_name, is_typing),
            SessionEvent::Presence { user_name, joined } => {
                let verb = if joined { "joined" } else { "left" };
                debug!("{} {} room {}", user_name, verb, self.options.room_id);
            }
            SessionEvent::Connected => {
                self.connection_state = ConnectionState::Connected;
                if self.lost_connection && self.options.rejoin_on_reconnect {
                    info!("Rejoining room {} after reconnect", self.options.room_id);
                    reaction.outbound.push(self.join_event());
                }
                self.lost_connection = false;
                self.reached_server = true;
            }
            SessionEvent::Disconnected => {
                self.connection_state = ConnectionState::Disconnected;
                self.lost_connection = self.reached_server;
            }
        }

        reaction
    }

    fn apply_history(&mut self, history: Vec<ChatMessage>) {
        let raced = std::mem::take(&mut self.unconfirmed_live);
        self.awaiting_history = false;
        self.messages = history;

        if self.options.history_mode == HistoryMode::Merge {
            let known: HashSet<_> = self.messages.iter().map(ChatMessage::identity).collect();
            let missing: Vec<ChatMessage> = raced
                .into_iter()
                .filter(|message| !known.contains(&message.identity()))
                .collect();
            if !missing.is_empty() {
                debug!(
                    "Keeping {} live message(s) that raced history in {}",
                    missing.len(),
                    self.options.room_id
                );
            }
            self.messages.extend(missing);
        }
    }

    fn apply_typing(&mut self, user_name: String, is_typing: bool) {
        if user_name == self.options.user_name {
            return;
        }
        let present = self.typing_users.contains(&user_name);
        if is_typing && !present {
            self.typing_users.push(user_name);
        } else if !is_typing && present {
            self.typing_users.retain(|name| *name != user_name);
        }
    }
}
