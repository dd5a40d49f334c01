//! Error types for the chat core
//!
//! Defines application-level errors and member outbox send errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::message::ErrorCode;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// business errors (reported to the client, session keeps going).
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal for the connection)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error (internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// The identity id is already registered by another session
    #[error("Duplicate session for identity '{0}'")]
    DuplicateSession(String),

    /// Message text is empty after trimming
    #[error("Message is empty")]
    EmptyMessage,

    /// Action attempted after logout or disconnect
    #[error("Session closed")]
    SessionClosed,

    /// Connectivity to the server lost or never established
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Room action attempted before joining
    #[error("Not joined")]
    NotJoined,

    /// Join attempted while already in a room
    #[error("Already joined")]
    AlreadyJoined,
}

impl AppError {
    /// Rebuild an error from a wire error code (client side)
    pub fn from_code(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::DuplicateSession => AppError::DuplicateSession(message),
            ErrorCode::EmptyMessage => AppError::EmptyMessage,
            ErrorCode::SessionClosed => AppError::SessionClosed,
            ErrorCode::NotJoined => AppError::NotJoined,
            ErrorCode::AlreadyJoined => AppError::AlreadyJoined,
            ErrorCode::InvalidMessage => AppError::TransportFailure(message),
        }
    }
}

/// Message send errors
///
/// Occurs when attempting to send messages through closed channels.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The receiver is not keeping up and the channel is at capacity
    #[error("Channel full")]
    Full,
}
