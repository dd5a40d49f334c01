//! Real-time Chat State Synchronization Core
//!
//! Keeps a consistent, ordered view of a multi-user conversation (message
//! history, live presence, typing indicators) across concurrently connected
//! clients, over WebSocket with tokio-tungstenite.
//!
//! # Components
//! - `registry`: who is present in a room
//! - `typing`: who is typing, from short-lived signals
//! - `ledger`: append-only, totally ordered message history
//! - `room`: one actor per room serializing all mutations and fanning out events
//! - `server` / `handler`: room directory and WebSocket server side
//! - `client` / `view`: session adapter and read model for a rendering layer
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - Each room is a `RoomCoordinator` actor that owns that room's state
//! - `ChatServer` maps room codes to room actors
//! - Each connection has a handler task talking to its room
//! - Reads are served from `watch` snapshots, never from the mailbox
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use chat_sync::{serve, ChatServer, ClientConfig, ClientSession, Identity, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::default();
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     tokio::spawn(serve(listener, ChatServer::spawn(config), config));
//!
//!     let alice = ClientSession::connect(ClientConfig::new(
//!         "ws://127.0.0.1:8080",
//!         Identity::new("u-alice", "alice"),
//!     ))
//!     .await
//!     .unwrap();
//!     alice.send_message("hi").await.unwrap();
//!     alice.logout();
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod ledger;
pub mod member;
pub mod message;
pub mod registry;
pub mod room;
pub mod server;
pub mod types;
pub mod typing;
pub mod view;

// Re-export main types for convenience
pub use client::{ClientSession, Subscription};
pub use config::{ClientConfig, ReconnectPolicy, ServerConfig};
pub use error::{AppError, SendError};
pub use handler::{handle_connection, serve};
pub use ledger::MessageLedger;
pub use member::Outbox;
pub use message::{ClientMessage, ErrorCode, ServerMessage};
pub use registry::SessionRegistry;
pub use room::{RoomCoordinator, RoomHandle, RoomPhase, RoomSnapshot};
pub use server::{ChatServer, ServerCommand, ServerHandle};
pub use types::{Identity, Message, MessageId, RoomCode, SessionHandle};
pub use typing::TypingAggregator;
pub use view::{ChatView, ConnectionStatus, ViewChange};
