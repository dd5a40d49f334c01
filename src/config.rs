//! Runtime configuration
//!
//! Server tuning comes from compiled defaults, optionally overridden by
//! environment variables. Client configuration is built by the embedding
//! application.

use std::env;
use std::time::Duration;

use tracing::warn;

use crate::types::Identity;
use crate::typing::TYPING_TTL;

/// Interval at which typing changes are coalesced into one broadcast
pub const TYPING_FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// Command mailbox capacity of each room actor
pub const ROOM_CHANNEL_BUFFER_SIZE: usize = 256;

/// Outbox capacity of each connection (server → client events)
pub const OUTBOX_BUFFER_SIZE: usize = 64;

/// Overrides `typing_ttl` (milliseconds)
pub const ENV_TYPING_TTL_MS: &str = "CHAT_TYPING_TTL_MS";

/// Overrides `typing_flush_interval` (milliseconds)
pub const ENV_TYPING_FLUSH_MS: &str = "CHAT_TYPING_FLUSH_MS";

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub typing_ttl: Duration,
    pub typing_flush_interval: Duration,
    pub room_buffer: usize,
    pub outbox_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            typing_ttl: TYPING_TTL,
            typing_flush_interval: TYPING_FLUSH_INTERVAL,
            room_buffer: ROOM_CHANNEL_BUFFER_SIZE,
            outbox_buffer: OUTBOX_BUFFER_SIZE,
        }
    }
}

impl ServerConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ttl) = millis_from_env(ENV_TYPING_TTL_MS) {
            config.typing_ttl = ttl;
        }
        if let Some(flush) = millis_from_env(ENV_TYPING_FLUSH_MS) {
            config.typing_flush_interval = flush;
        }
        config
    }
}

fn millis_from_env(key: &str) -> Option<Duration> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(0) => {
            warn!("Ignoring {}=0", key);
            None
        }
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            warn!("Ignoring invalid {}='{}': {}", key, raw, e);
            None
        }
    }
}

/// Reconnect backoff of the client session adapter
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// None retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Delay with up to 25% random jitter added
    pub fn delay(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let base = self.base_delay(attempt);
        let jitter_ms = (base.as_millis() as u64) / 4;
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        base + Duration::from_millis(jitter)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt > max)
    }
}

/// Client session adapter configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL, e.g. `ws://127.0.0.1:8080`
    pub url: String,
    /// Room to join; None joins the default room
    pub room: Option<String>,
    pub identity: Identity,
    pub reconnect: ReconnectPolicy,
    /// While typing continues, the signal is re-sent this often. None
    /// follows the TTL the server announces in `joined` (half of it).
    pub typing_refresh: Option<Duration>,
    pub outbound_buffer: usize,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, identity: Identity) -> Self {
        Self {
            url: url.into(),
            room: None,
            identity,
            reconnect: ReconnectPolicy::default(),
            typing_refresh: None,
            outbound_buffer: OUTBOX_BUFFER_SIZE,
        }
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Refresh period to use against a server with the given typing TTL
    pub fn typing_refresh_for(&self, server_ttl: Duration) -> Duration {
        self.typing_refresh.unwrap_or(server_ttl / 2)
    }
}
