pub mod config;
pub mod controller;
pub mod conversations;
pub mod directory;
pub mod error;
pub mod messages;
pub mod models;
pub mod reconnect;
pub mod session;
pub mod socket;
pub mod state;
pub mod transport;
pub mod typing;

pub use config::{Config, HistoryMode};
pub use controller::{ChatController, ChatUser, TransportSource};
pub use conversations::ConversationList;
pub use directory::{ChatDirectory, HttpDirectory};
pub use error::{ChatError, Result};
pub use models::{ChatMessage, Conversation, Entity, UserType};
pub use session::{ChatSession, SessionOptions};
pub use socket::{SocketService, SocketTransport};
pub use state::{ConnectionState, SessionSnapshot};
pub use transport::{Transport, TransportEvent};
