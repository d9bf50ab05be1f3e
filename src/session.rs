use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::conversations::ConversationList;
use crate::error::{ChatError, Result};
use crate::messages::{ClientEvent, LeaveRoomPayload, SendMessagePayload, TypingPayload};
use crate::models::{ChatMessage, UserType};
use crate::state::{ConnectionState, SessionEvent, SessionSnapshot, SessionState, StateOptions};
use crate::transport::{Subscription, SubscriptionId, Transport, TransportEvent};
use crate::typing::TypingTimer;

/// Identity a session presents to its room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub room_id: String,
    pub user_id: String,
    pub user_name: String,
    pub user_type: UserType,
}

impl SessionOptions {
    pub fn new(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        user_type: UserType,
    ) -> Result<Self> {
        let options = SessionOptions {
            room_id: room_id.into(),
            user_id: user_id.into(),
            user_name: user_name.into(),
            user_type,
        };
        for (field, value) in [
            ("roomId", &options.room_id),
            ("userId", &options.user_id),
            ("userName", &options.user_name),
        ] {
            if value.trim().is_empty() {
                return Err(ChatError::MissingField(field));
            }
        }
        Ok(options)
    }
}

/// One joined room bound to one transport subscription.
///
/// State is only ever changed by the pump task, one transport event at a time,
/// and by [`ChatSession::close`]. Both go through the same lock, so nothing an
/// old room sends after `close` can reach the state.
pub struct ChatSession {
    options: SessionOptions,
    transport: Arc<dyn Transport>,
    state: Arc<RwLock<SessionState>>,
    snapshots: Arc<watch::Sender<SessionSnapshot>>,
    subscription: SubscriptionId,
    pump: JoinHandle<()>,
    typing: TypingTimer,
}

impl ChatSession {
    pub async fn open(
        transport: Arc<dyn Transport>,
        options: SessionOptions,
        conversations: ConversationList,
        config: &Config,
    ) -> Result<Self> {
        let state = SessionState::new(StateOptions {
            room_id: options.room_id.clone(),
            user_id: options.user_id.clone(),
            user_name: options.user_name.clone(),
            history_limit: config.history_limit,
            history_mode: config.history_mode,
            rejoin_on_reconnect: config.rejoin_on_reconnect,
        });
        let join = state.join_event();
        let (snapshots, _) = watch::channel(state.snapshot());
        let snapshots = Arc::new(snapshots);
        let state = Arc::new(RwLock::new(state));

        let Subscription { id, events } = transport.subscribe().await;
        if let Err(e) = transport.emit(join).await {
            transport.unsubscribe(id).await;
            return Err(e.into());
        }

        let pump = tokio::spawn(pump(
            events,
            Arc::clone(&state),
            Arc::clone(&snapshots),
            conversations,
            Arc::clone(&transport),
        ));

        info!(
            "Opened chat session for {} in room {}",
            options.user_name, options.room_id
        );

        Ok(ChatSession {
            options,
            transport,
            state,
            snapshots,
            subscription: id,
            pump,
            typing: TypingTimer::new(config.typing_timeout),
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn room_id(&self) -> &str {
        &self.options.room_id
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.snapshots.borrow().connection_state
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.snapshots.borrow().messages.clone()
    }

    pub fn typing_users(&self) -> Vec<String> {
        self.snapshots.borrow().typing_users.clone()
    }

    /// Receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.is_closed()
    }

    /// Sends trimmed text. The message shows up once the server echoes it back.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        // Held until the emit is queued so `close` cannot interleave.
        let state = self.state.read().await;
        if state.is_closed() {
            return Ok(());
        }

        self.typing.cancel();
        self.transport
            .emit(ClientEvent::SendMessage(SendMessagePayload {
                room_id: self.options.room_id.clone(),
                user_id: self.options.user_id.clone(),
                user_name: self.options.user_name.clone(),
                user_type: self.options.user_type,
                message: text.to_string(),
            }))
            .await?;
        Ok(())
    }

    /// Announces typing; `true` also arms the automatic "stopped typing" signal.
    pub async fn send_typing_status(&self, is_typing: bool) -> Result<()> {
        let state = self.state.read().await;
        if state.is_closed() {
            return Ok(());
        }

        self.transport.emit(self.typing_event(is_typing)).await?;

        if is_typing {
            let transport = Arc::clone(&self.transport);
            let stop = self.typing_event(false);
            debug!(
                "Typing in {} clears itself in {} ms",
                self.options.room_id,
                self.typing.timeout().as_millis()
            );
            self.typing.restart(async move {
                debug!("Typing timeout elapsed");
                if let Err(e) = transport.emit(stop).await {
                    warn!("Failed to clear typing status: {}", e);
                }
            });
        } else {
            self.typing.cancel();
        }
        Ok(())
    }

    fn typing_event(&self, is_typing: bool) -> ClientEvent {
        ClientEvent::Typing(TypingPayload {
            room_id: self.options.room_id.clone(),
            user_name: self.options.user_name.clone(),
            is_typing,
        })
    }

    /// Leaves the room and detaches from the transport. Safe to call twice.
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        if state.is_closed() {
            return;
        }
        state.close();
        self.snapshots.send_replace(state.snapshot());

        self.typing.cancel();
        let leave = ClientEvent::LeaveRoom(LeaveRoomPayload {
            room_id: self.options.room_id.clone(),
            user_name: self.options.user_name.clone(),
        });
        if let Err(e) = self.transport.emit(leave).await {
            warn!("Failed to leave room {}: {}", self.options.room_id, e);
        }
        self.transport.unsubscribe(self.subscription).await;
        self.pump.abort();

        info!("Closed chat session for room {}", self.options.room_id);
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump(
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    state: Arc<RwLock<SessionState>>,
    snapshots: Arc<watch::Sender<SessionSnapshot>>,
    conversations: ConversationList,
    transport: Arc<dyn Transport>,
) {
    while let Some(event) = events.recv().await {
        let mut state = state.write().await;
        if state.is_closed() {
            break;
        }

        let reaction = state.apply(SessionEvent::from(event));
        if let Some(message) = &reaction.delivered {
            conversations.record_message(message).await;
        }
        for outbound in reaction.outbound {
            let name = outbound.name();
            if let Err(e) = transport.emit(outbound).await {
                warn!("Failed to emit {} for room {}: {}", name, state.room_id(), e);
            }
        }
        snapshots.send_replace(state.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::messages::{
        ChatHistoryPayload, GetHistoryPayload, JoinRoomPayload, ServerEvent, UserTypingPayload,
    };
    use crate::models::{Conversation, ConversationKind};
    use crate::transport::fake::FakeTransport;

    fn options() -> SessionOptions {
        SessionOptions::new("R1", "me", "Teacher", UserType::Instructor).unwrap()
    }

    fn message(room_id: &str, text: &str, second: u32) -> ChatMessage {
        ChatMessage {
            id: None,
            room_id: room_id.to_string(),
            user_id: "u1".to_string(),
            user_name: "Alice".to_string(),
            user_type: UserType::Student,
            message: text.to_string(),
            timestamp: format!("2024-05-01T08:00:{second:02}Z").parse().unwrap(),
        }
    }

    fn conversation(id: &str, second: u32) -> Conversation {
        let at = format!("2024-05-01T08:00:{second:02}Z").parse().unwrap();
        Conversation {
            id: id.to_string(),
            kind: ConversationKind::Direct,
            name: None,
            participant_ids: Vec::new(),
            participants: Vec::new(),
            creator_id: None,
            last_message: None,
            last_seen: None,
            created_at: at,
            updated_at: at,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn open(fake: &FakeTransport, conversations: ConversationList) -> ChatSession {
        let transport: Arc<dyn Transport> = Arc::new(fake.clone());
        ChatSession::open(transport, options(), conversations, &Config::default())
            .await
            .unwrap()
    }

    fn typing_offs(sent: &[ClientEvent]) -> usize {
        sent.iter()
            .filter(|e| matches!(e, ClientEvent::Typing(p) if !p.is_typing))
            .count()
    }

    #[test]
    fn options_require_identity() {
        let err = SessionOptions::new("R1", "me", "  ", UserType::Student).unwrap_err();
        assert!(matches!(err, ChatError::MissingField("userName")));
        let err = SessionOptions::new("", "me", "Teacher", UserType::Student).unwrap_err();
        assert!(matches!(err, ChatError::MissingField("roomId")));
    }

    #[tokio::test]
    async fn open_joins_and_join_ack_requests_history() {
        let fake = FakeTransport::new();
        let session = open(&fake, ConversationList::new()).await;

        assert_eq!(session.connection_state(), ConnectionState::Connecting);
        assert_eq!(
            fake.sent().await,
            vec![ClientEvent::JoinRoom(JoinRoomPayload {
                room_id: "R1".to_string(),
                user_id: "me".to_string(),
                user_name: "Teacher".to_string(),
            })]
        );

        fake.push_server(ServerEvent::RoomJoined).await;
        settle().await;

        assert_eq!(session.connection_state(), ConnectionState::Connected);
        assert_eq!(
            fake.sent().await.last(),
            Some(&ClientEvent::GetHistory(GetHistoryPayload {
                room_id: "R1".to_string(),
                limit: 50,
            }))
        );
    }

    #[tokio::test]
    async fn history_then_live_message() {
        let fake = FakeTransport::new();
        let session = open(&fake, ConversationList::new()).await;

        fake.push_server(ServerEvent::RoomJoined).await;
        fake.push_server(ServerEvent::ChatHistory(ChatHistoryPayload {
            messages: vec![message("R1", "a", 1), message("R1", "b", 2), message("R1", "c", 3)],
        }))
        .await;
        let live = message("R1", "d", 4);
        fake.push_server(ServerEvent::ReceiveMessage(live.clone())).await;
        settle().await;

        let messages = session.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages.last(), Some(&live));
    }

    #[tokio::test]
    async fn live_message_reorders_conversations() {
        let fake = FakeTransport::new();
        let conversations = ConversationList::new();
        conversations
            .replace_all(vec![conversation("B", 5), conversation("R1", 1)])
            .await;
        let _session = open(&fake, conversations.clone()).await;

        fake.push_server(ServerEvent::ReceiveMessage(message("R1", "hi", 10)))
            .await;
        settle().await;

        assert_eq!(conversations.ids().await, vec!["R1", "B"]);
        let top = conversations.find("R1").await.unwrap();
        assert_eq!(top.updated_at, message("R1", "hi", 10).timestamp);
    }

    #[tokio::test]
    async fn blank_messages_are_dropped_and_nothing_is_inserted_optimistically() {
        let fake = FakeTransport::new();
        let session = open(&fake, ConversationList::new()).await;
        fake.clear_sent().await;

        session.send_message("  ").await.unwrap();
        assert!(fake.sent().await.is_empty());

        session.send_message("  hello \n").await.unwrap();
        assert_eq!(
            fake.sent().await,
            vec![ClientEvent::SendMessage(SendMessagePayload {
                room_id: "R1".to_string(),
                user_id: "me".to_string(),
                user_name: "Teacher".to_string(),
                user_type: UserType::Instructor,
                message: "hello".to_string(),
            })]
        );
        settle().await;
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn own_typing_echo_is_ignored() {
        let fake = FakeTransport::new();
        let session = open(&fake, ConversationList::new()).await;

        for (name, on) in [("Teacher", true), ("Alice", true), ("Bob", true), ("Bob", false)] {
            fake.push_server(ServerEvent::UserTyping(UserTypingPayload {
                user_name: name.to_string(),
                is_typing: on,
            }))
            .await;
        }
        settle().await;

        assert_eq!(session.typing_users(), vec!["Alice".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_typing_yields_one_deferred_stop() {
        let fake = FakeTransport::new();
        let session = open(&fake, ConversationList::new()).await;

        for _ in 0..4 {
            session.send_typing_status(true).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2500)).await;
        }
        assert_eq!(typing_offs(&fake.sent().await), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(typing_offs(&fake.sent().await), 1);

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(typing_offs(&fake.sent().await), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_message_cancels_the_deferred_stop() {
        let fake = FakeTransport::new();
        let session = open(&fake, ConversationList::new()).await;

        session.send_typing_status(true).await.unwrap();
        session.send_message("done").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5000)).await;

        assert_eq!(typing_offs(&fake.sent().await), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_cancels_the_deferred_stop() {
        let fake = FakeTransport::new();
        let session = open(&fake, ConversationList::new()).await;

        session.send_typing_status(true).await.unwrap();
        session.send_typing_status(false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5000)).await;

        assert_eq!(typing_offs(&fake.sent().await), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_leaves_detaches_and_freezes_state() {
        let fake = FakeTransport::new();
        let conversations = ConversationList::new();
        conversations
            .replace_all(vec![conversation("B", 5), conversation("R1", 1)])
            .await;
        let session = open(&fake, conversations.clone()).await;

        fake.push_server(ServerEvent::RoomJoined).await;
        fake.push_server(ServerEvent::ReceiveMessage(message("R1", "a", 6)))
            .await;
        settle().await;
        session.send_typing_status(true).await.unwrap();

        session.close().await;
        session.close().await;
        let frozen = session.snapshot();
        let order = conversations.ids().await;

        let sent = fake.sent().await;
        let leaves = sent
            .iter()
            .filter(|e| matches!(e, ClientEvent::LeaveRoom(p) if p.room_id == "R1" && p.user_name == "Teacher"))
            .count();
        assert_eq!(leaves, 1);
        assert_eq!(fake.subscriber_count().await, 0);
        assert_eq!(frozen.connection_state, ConnectionState::Disconnected);

        fake.push_server(ServerEvent::ReceiveMessage(message("R1", "late", 7)))
            .await;
        fake.push_server(ServerEvent::UserTyping(UserTypingPayload {
            user_name: "Alice".to_string(),
            is_typing: true,
        }))
        .await;
        fake.push(TransportEvent::Connected).await;
        tokio::time::sleep(Duration::from_millis(5000)).await;

        assert_eq!(session.snapshot(), frozen);
        assert_eq!(conversations.ids().await, order);
        assert_eq!(typing_offs(&fake.sent().await), 0);

        session.send_message("after close").await.unwrap();
        assert_eq!(fake.sent().await.len(), sent.len());
    }

    #[tokio::test]
    async fn transport_lifecycle_drives_connection_state() {
        let fake = FakeTransport::new();
        let session = open(&fake, ConversationList::new()).await;
        let mut watcher = session.watch();

        fake.push(TransportEvent::Connected).await;
        watcher.changed().await.unwrap();
        assert_eq!(watcher.borrow().connection_state, ConnectionState::Connected);

        fake.push(TransportEvent::Disconnected {
            reason: "network".to_string(),
        })
        .await;
        watcher.changed().await.unwrap();
        assert_eq!(watcher.borrow().connection_state, ConnectionState::Disconnected);

        fake.clear_sent().await;
        fake.push(TransportEvent::Connected).await;
        watcher.changed().await.unwrap();
        assert_eq!(session.connection_state(), ConnectionState::Connected);
        assert!(matches!(
            fake.sent().await.as_slice(),
            [ClientEvent::JoinRoom(_)]
        ));
    }
}
