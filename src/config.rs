use std::{fmt::Display, str::FromStr, time::Duration};

use tracing::{info, warn};

pub const DEFAULT_API_URL: &str = "http://localhost:5000/api";
pub const DEFAULT_SOCKET_URL: &str = "ws://localhost:5000/ws";

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt` (0-based), doubling up to `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.min_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub api_url: String,
    pub socket_url: String,
    pub typing_debounce: Duration,
    pub typing_expiry: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_owned(),
            socket_url: DEFAULT_SOCKET_URL.to_owned(),
            typing_debounce: Duration::from_millis(1000),
            typing_expiry: Duration::from_millis(4000),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ChatConfig {
    /// Reads the environment, honouring a `.env` file if one is present.
    pub fn load() -> Self {
        let defaults = Self::default();
        Self {
            api_url: try_load("CHAT_API_URL", defaults.api_url),
            socket_url: try_load("CHAT_SOCKET_URL", defaults.socket_url),
            typing_debounce: Duration::from_millis(try_load("CHAT_TYPING_DEBOUNCE_MS", 1000u64)),
            typing_expiry: Duration::from_millis(try_load("CHAT_TYPING_EXPIRY_MS", 4000u64)),
            reconnect: ReconnectPolicy {
                enabled: try_load("CHAT_RECONNECT", true),
                ..defaults.reconnect
            },
        }
    }
}

fn try_load<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Ok(raw) = dotenv::var(key) else {
        info!("{key} not set, using default: {default}");
        return default;
    };

    raw.trim().parse().unwrap_or_else(|e| {
        warn!("Invalid {key} value {raw:?}: {e}, using default: {default}");
        default
    })
}
