//! Message protocol definitions
//!
//! JSON-based bidirectional event protocol using Serde's internally tagged
//! enums. Event names follow the `noun:verb` convention on the wire
//! (`message:send`, `typing:update`, ...).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::types::{Identity, Message, MessageId};

/// Client → Server event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Register presence in a room (default room when `room` is absent).
    /// `since` asks only for messages after the given id; it is honored only
    /// when `epoch` names the room instance those ids came from.
    #[serde(rename = "join")]
    Join {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
        identity: Identity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<MessageId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        epoch: Option<String>,
    },
    /// Leave the current room
    #[serde(rename = "leave")]
    Leave,
    /// Send a chat message
    #[serde(rename = "message:send")]
    SendMessage { text: String },
    /// Typing started or stopped
    #[serde(rename = "typing:set")]
    SetTyping { is_typing: bool },
}

/// Server → Client event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Join accepted; carries the initial room state
    #[serde(rename = "joined")]
    Joined {
        room: String,
        /// Identifies this instance of the room; message ids restart with it
        epoch: String,
        /// Server typing TTL, clients refresh well inside it
        typing_ttl_ms: u64,
        messages: Vec<Message>,
        users: Vec<Identity>,
        typing: BTreeMap<String, bool>,
    },
    /// A message was appended to the room
    #[serde(rename = "message:new")]
    MessageNew { message: Message },
    /// Replaces the typing view (identity id → typing)
    #[serde(rename = "typing:update")]
    TypingUpdate { typing: BTreeMap<String, bool> },
    /// Replaces the users view
    #[serde(rename = "presence:update")]
    PresenceUpdate { users: Vec<Identity> },
    /// Error occurred
    #[serde(rename = "error")]
    Error { code: ErrorCode, message: String },
}

/// Error codes for ServerMessage::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Identity already connected from another session
    DuplicateSession,
    /// Blank message text
    EmptyMessage,
    /// Action after leave/disconnect
    SessionClosed,
    /// Room action before join
    NotJoined,
    /// Join while already in a room
    AlreadyJoined,
    /// Invalid message format
    InvalidMessage,
}

/// Convert AppError to ServerMessage for client notification
impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        let (code, message) = match &err {
            AppError::DuplicateSession(id) => (
                ErrorCode::DuplicateSession,
                format!("Identity '{}' is already connected", id),
            ),
            AppError::EmptyMessage => (ErrorCode::EmptyMessage, "Message is empty".to_string()),
            AppError::SessionClosed => {
                (ErrorCode::SessionClosed, "Session is closed".to_string())
            }
            AppError::NotJoined => (ErrorCode::NotJoined, "You have not joined a room".to_string()),
            AppError::AlreadyJoined => {
                (ErrorCode::AlreadyJoined, "You are already in a room".to_string())
            }
            AppError::Json(e) => {
                (ErrorCode::InvalidMessage, format!("Invalid message format: {}", e))
            }
            // Fatal errors are not typically converted (connection closes)
            _ => (ErrorCode::InvalidMessage, "Internal error".to_string()),
        };
        ServerMessage::Error { code, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_deserialize() {
        let json = r#"{"type": "message:send", "text": "hi"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg, ClientMessage::SendMessage { text: "hi".into() });
    }

    #[test]
    fn test_join_without_room_or_since() {
        let json = r#"{"type": "join", "identity": {"id": "u1", "username": "alice"}}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Join {
                room,
                identity,
                since,
                epoch,
            } => {
                assert!(room.is_none());
                assert!(since.is_none());
                assert!(epoch.is_none());
                assert_eq!(identity.username, "alice");
            }
            _ => panic!("Wrong variant"),
        }
    }

    #[test]
    fn test_joined_carries_epoch_and_ttl() {
        let msg = ServerMessage::Joined {
            room: "LOBBY".into(),
            epoch: "e1".into(),
            typing_ttl_ms: 5000,
            messages: vec![],
            users: vec![],
            typing: BTreeMap::new(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"epoch\":\"e1\""));
        assert!(json.contains("\"typing_ttl_ms\":5000"));
        assert_eq!(serde_json::from_str::<ServerMessage>(&json).unwrap(), msg);
    }

    #[test]
    fn test_leave_is_unit_event() {
        let json = serde_json::to_string(&ClientMessage::Leave).unwrap();
        assert_eq!(json, r#"{"type":"leave"}"#);
    }

    #[test]
    fn test_typing_update_serialize() {
        let mut typing = BTreeMap::new();
        typing.insert("bob".to_string(), true);
        let json = serde_json::to_string(&ServerMessage::TypingUpdate { typing }).unwrap();
        assert!(json.contains("\"type\":\"typing:update\""));
        assert!(json.contains("\"bob\":true"));
    }

    #[test]
    fn test_error_code_serialize() {
        let msg: ServerMessage = AppError::DuplicateSession("u1".into()).into();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"code\":\"duplicate_session\""));
    }
}
