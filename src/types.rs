//! Basic type definitions for the chat core
//!
//! Provides newtype wrappers and plain data records:
//! - `SessionHandle`: UUID-based handle issued on join
//! - `RoomCode`: normalized room name
//! - `MessageId`: per-room monotonic message id
//! - `Identity`, `Message`: data shared by server and client

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the room used when a client does not ask for one
pub const DEFAULT_ROOM: &str = "LOBBY";

/// Handle for one live session in a room (newtype pattern)
///
/// Wraps a UUID v4. Issued by the session registry on join and
/// required for every later action of that session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub Uuid);

impl SessionHandle {
    /// Create a new random session handle
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Room code (uppercase room name)
///
/// Room names are case-insensitive; the stored form is uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomCode(pub String);

impl RoomCode {
    /// Create a RoomCode from a string (trims and converts to uppercase)
    pub fn from_string(code: String) -> Self {
        Self(code.trim().to_uppercase())
    }

    /// The default room
    pub fn lobby() -> Self {
        Self(DEFAULT_ROOM.to_string())
    }

    /// Resolve an optional, possibly blank, room name
    pub fn from_optional(code: Option<String>) -> Self {
        match code {
            Some(code) if !code.trim().is_empty() => Self::from_string(code),
            _ => Self::lobby(),
        }
    }
}

impl std::fmt::Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-room message identifier, assigned in append order starting at 1
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A chat participant. Unique by `id`; usernames may collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub username: String,
}

impl Identity {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// An accepted chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub author: Identity,
    pub text: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl Message {
    /// Total-order key: timestamp first, id breaks ties
    pub fn order_key(&self) -> (u64, MessageId) {
        (self.timestamp, self.id)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
