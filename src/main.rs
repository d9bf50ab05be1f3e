use std::collections::HashSet;
use std::sync::Arc;

use classroom_chat::models::MessageIdentity;
use classroom_chat::typing::typing_label;
use classroom_chat::{
    ChatController, ChatDirectory, ChatError, ChatUser, Config, HttpDirectory, SessionSnapshot,
    SocketService, TransportSource, UserType,
};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

fn identity_from_env() -> Result<(ChatUser, String), ChatError> {
    let var = |name: &str| std::env::var(name).unwrap_or_default();
    let user_type = match std::env::var("CHAT_USER_TYPE") {
        Ok(value) => value.parse::<UserType>().map_err(ChatError::Config)?,
        Err(_) => UserType::Student,
    };
    let user = ChatUser {
        id: var("CHAT_USER_ID"),
        name: var("CHAT_USER_NAME"),
        user_type,
    };
    Ok((user, var("CHAT_ROOM_ID")))
}

/// Prints whatever changed between two snapshots.
struct Printer {
    user_id: String,
    seen: HashSet<MessageIdentity>,
    last: SessionSnapshot,
}

impl Printer {
    fn new(user_id: String) -> Self {
        Printer {
            user_id,
            seen: HashSet::new(),
            last: SessionSnapshot::idle(),
        }
    }

    fn show(&mut self, snapshot: SessionSnapshot) {
        if snapshot.connection_state != self.last.connection_state {
            println!("-- {:?}", snapshot.connection_state);
        }
        for message in &snapshot.messages {
            if !self.seen.insert(message.identity()) {
                continue;
            }
            let who = if message.is_own(&self.user_id) {
                "you".to_string()
            } else {
                format!("{} ({})", message.user_name, message.user_type)
            };
            println!(
                "[{}] {}: {}",
                message.timestamp.format("%H:%M"),
                who,
                message.message
            );
        }
        if snapshot.typing_users != self.last.typing_users {
            if let Some(label) = typing_label(&snapshot.typing_users) {
                println!("-- {label}");
            }
        }
        self.last = snapshot;
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ChatError> {
    let config = Config::from_env()?;
    let (me, room_id) = identity_from_env()?;
    let options = me.options_for(&room_id)?;

    let service = Arc::new(SocketService::new(config.clone()));
    let directory = Arc::new(HttpDirectory::new(&config)?);
    let controller = ChatController::new(
        config.clone(),
        Arc::clone(&service) as Arc<dyn TransportSource>,
        directory as Arc<dyn ChatDirectory>,
    );

    if config.api_token.is_some() {
        match controller.load_conversations().await {
            Ok(count) => info!("{} conversations available", count),
            Err(e) => warn!("Could not load conversations: {}", e),
        }
    }

    controller.select(Some(options)).await?;
    let Some(mut snapshots) = controller.watch().await else {
        return Ok(());
    };
    let mut printer = Printer::new(me.id.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                printer.show(snapshot);
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read input: {}", e);
                        break;
                    }
                };
                match line.trim() {
                    "/quit" => break,
                    "/typing" => controller.send_typing_status(true).await?,
                    "/stop" => controller.send_typing_status(false).await?,
                    text => {
                        if !controller.can_send().await {
                            println!("-- not connected, message not sent");
                            continue;
                        }
                        controller.send_message(text).await?;
                    }
                }
            }
        }
    }

    controller.shutdown().await?;
    service.disconnect().await;
    info!("Bye");
    Ok(())
}
