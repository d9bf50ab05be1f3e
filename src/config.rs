use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ChatError, Result};

const DEFAULT_SOCKET_URL: &str = "ws://localhost:3000";
const DEFAULT_API_URL: &str = "http://localhost:3001";
const DEFAULT_HISTORY_LIMIT: u32 = 50;
const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_millis(3000);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);
const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(10);

/// How a `chat_history` batch combines with messages already on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryMode {
    /// History first, then live messages that raced it and are not part of it.
    #[default]
    Merge,
    /// History wins; anything received before it is discarded.
    Replace,
}

impl FromStr for HistoryMode {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(HistoryMode::Merge),
            "replace" => Ok(HistoryMode::Replace),
            other => Err(ChatError::Config(format!("unknown history mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub attempts: u32,
    pub delay: Duration,
    pub delay_max: Duration,
    /// Fraction of the computed delay used as +/- jitter.
    pub randomization: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            enabled: true,
            attempts: 5,
            delay: Duration::from_millis(1000),
            delay_max: Duration::from_millis(5000),
            randomization: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub socket_url: String,
    pub api_url: String,
    pub api_token: Option<String>,
    pub api_timeout: Duration,
    pub connect_timeout: Duration,
    pub history_limit: u32,
    pub typing_timeout: Duration,
    pub history_mode: HistoryMode,
    pub rejoin_on_reconnect: bool,
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            api_token: None,
            api_timeout: DEFAULT_API_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            history_limit: DEFAULT_HISTORY_LIMIT,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            history_mode: HistoryMode::default(),
            rejoin_on_reconnect: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Config {
    /// Defaults overridden by `CHAT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(url) = lookup("CHAT_SOCKET_URL") {
            config.socket_url = url;
        }
        if let Some(url) = lookup("CHAT_API_URL") {
            config.api_url = url;
        }
        config.api_token = lookup("CHAT_API_TOKEN").filter(|t| !t.is_empty());

        if let Some(limit) = lookup("CHAT_HISTORY_LIMIT") {
            config.history_limit = parse("CHAT_HISTORY_LIMIT", &limit)?;
        }
        if let Some(ms) = lookup("CHAT_TYPING_TIMEOUT_MS") {
            config.typing_timeout = Duration::from_millis(parse("CHAT_TYPING_TIMEOUT_MS", &ms)?);
        }
        if let Some(mode) = lookup("CHAT_HISTORY_MODE") {
            config.history_mode = mode.parse()?;
        }
        if let Some(flag) = lookup("CHAT_REJOIN_ON_RECONNECT") {
            config.rejoin_on_reconnect = parse("CHAT_REJOIN_ON_RECONNECT", &flag)?;
        }
        if let Some(attempts) = lookup("CHAT_RECONNECT_ATTEMPTS") {
            config.reconnect.attempts = parse("CHAT_RECONNECT_ATTEMPTS", &attempts)?;
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ChatError::Config(format!("invalid value '{value}' for {key}")))
}
