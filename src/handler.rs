//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake, event
//! parsing, and routing of client events to the client's room actor.
//! A dropped connection counts as leaving the room.

use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::member::Outbox;
use crate::message::{ClientMessage, ServerMessage};
use crate::room::RoomHandle;
use crate::server::ServerHandle;
use crate::types::{Identity, MessageId, RoomCode, SessionHandle};

/// How long a closing connection may take to flush its outbox
const WRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Times a join is retried when the room retires underneath it
const ROOM_OPEN_ATTEMPTS: usize = 3;

/// Accept connections forever, one handler task per connection
pub async fn serve(listener: TcpListener, server: ServerHandle, config: ServerConfig) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let server = server.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, server, config).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Room membership of a connection
struct Membership {
    room: RoomHandle,
    handle: SessionHandle,
    identity: Identity,
}

enum ConnectionState {
    /// Connected, never joined
    Connected,
    Joined(Membership),
    /// Joined once, then left
    Left,
}

/// Per-connection state owned by the read side
struct Connection {
    peer: String,
    server: ServerHandle,
    outbox: Outbox,
    state: ConnectionState,
}

impl Connection {
    /// Apply one client event. Business errors are returned for the caller
    /// to report to the client.
    async fn handle_client_message(&mut self, msg: ClientMessage) -> Result<(), AppError> {
        match msg {
            ClientMessage::Join {
                room,
                identity,
                since,
                epoch,
            } => self.join(room, identity, since, epoch).await,
            ClientMessage::Leave => self.leave().await,
            ClientMessage::SendMessage { text } => {
                let membership = self.membership()?;
                membership
                    .room
                    .send_message(membership.handle, text)
                    .await
                    .map(|_| ())
            }
            ClientMessage::SetTyping { is_typing } => {
                let membership = self.membership()?;
                membership.room.set_typing(membership.handle, is_typing).await
            }
        }
    }

    async fn join(
        &mut self,
        room: Option<String>,
        identity: Identity,
        since: Option<MessageId>,
        epoch: Option<String>,
    ) -> Result<(), AppError> {
        if matches!(self.state, ConnectionState::Joined(_)) {
            return Err(AppError::AlreadyJoined);
        }

        let code = RoomCode::from_optional(room);
        let mut attempt = 1;
        let (room, ack) = loop {
            let room = self.server.open_room(code.clone()).await?;
            // Ids from another instance of the room mean nothing here
            let since = since.filter(|_| epoch.as_deref() == Some(room.epoch()));
            match room.join(identity.clone(), since, self.outbox.clone()).await {
                Ok(ack) => break (room, ack),
                Err(AppError::ChannelSend) if attempt < ROOM_OPEN_ATTEMPTS => {
                    debug!("Room {} retired during join, reopening", code);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        info!(
            "{} joined room {} as '{}' ({})",
            self.peer,
            room.code(),
            identity.username,
            ack.handle
        );
        self.state = ConnectionState::Joined(Membership {
            room,
            handle: ack.handle,
            identity,
        });
        Ok(())
    }

    /// Leave the current room; no-op when not in one
    async fn leave(&mut self) -> Result<(), AppError> {
        let Some(membership) = self.take_membership() else {
            return Ok(());
        };

        info!(
            "{} ('{}') left room {}",
            self.peer,
            membership.identity.username,
            membership.room.code()
        );
        membership.room.leave(membership.handle).await
    }

    /// Joined moves to Left; any other state is kept
    fn take_membership(&mut self) -> Option<Membership> {
        match std::mem::replace(&mut self.state, ConnectionState::Left) {
            ConnectionState::Joined(membership) => Some(membership),
            other => {
                self.state = other;
                None
            }
        }
    }

    fn membership(&self) -> Result<&Membership, AppError> {
        match &self.state {
            ConnectionState::Joined(membership) => Ok(membership),
            ConnectionState::Left => Err(AppError::SessionClosed),
            ConnectionState::Connected => Err(AppError::NotJoined),
        }
    }

    /// Report a business error to the client. Returns false if the
    /// connection should be closed.
    async fn report(&self, err: AppError) -> bool {
        match err {
            AppError::ChannelSend | AppError::Io(_) | AppError::WebSocket(_) => {
                error!("Fatal error for {}: {}", self.peer, err);
                false
            }
            err => {
                debug!("Rejected event from {}: {}", self.peer, err);
                self.outbox.send(err.into()).await.is_ok()
            }
        }
    }
}

/// Handle a new TCP connection
///
/// Performs WebSocket handshake, sets up bidirectional communication,
/// and manages the connection lifecycle.
pub async fn handle_connection(
    stream: TcpStream,
    server: ServerHandle,
    config: ServerConfig,
) -> Result<(), AppError> {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer);

    // WebSocket handshake
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    info!("WebSocket established with {}", peer);

    // Channel for room -> client events
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(config.outbox_buffer);

    // Spawn write task (ServerMessage -> WebSocket)
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        debug!("WebSocket send failed, ending write task");
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    // Continue - don't break on serialization errors
                }
            }
        }
        debug!("Write task ended for client");

        // Send close frame when done
        let _ = ws_sender.close().await;
    });

    let outbox = Outbox::new(msg_tx);
    let evicted = outbox.evicted();
    let mut conn = Connection {
        peer: peer.clone(),
        server,
        outbox,
        state: ConnectionState::Connected,
    };

    // Read until the client goes away, the write side fails, or the room
    // drops this session for not draining its outbox
    let write_finished = tokio::select! {
        _ = read_loop(&mut ws_receiver, &mut conn) => false,
        _ = &mut write_task => true,
        _ = evicted.notified() => {
            warn!("{} evicted from its room, closing", peer);
            false
        }
    };

    // A dropped connection leaves the room
    if let Err(e) = conn.leave().await {
        warn!("Failed to leave room for {}: {}", peer, e);
    }
    drop(conn);

    if !write_finished && timeout(WRITE_DRAIN_TIMEOUT, &mut write_task).await.is_err() {
        debug!("Write task for {} did not drain in time", peer);
        write_task.abort();
    }

    info!("Client {} disconnected", peer);

    Ok(())
}

/// Read loop (WebSocket -> room)
async fn read_loop(
    ws_receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
    conn: &mut Connection,
) {
    while let Some(msg_result) = ws_receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let result = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => conn.handle_client_message(client_msg).await,
                    Err(e) => {
                        warn!("Invalid JSON from {}: {}", conn.peer, e);
                        Err(AppError::Json(e))
                    }
                };
                if let Err(e) = result {
                    if !conn.report(e).await {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => {
                debug!("Client {} sent close frame", conn.peer);
                break;
            }
            Ok(Message::Ping(_)) => {
                // Pong is handled automatically by tungstenite
                debug!("Ping from {}", conn.peer);
            }
            Ok(Message::Pong(_)) => {
                debug!("Pong from {}", conn.peer);
            }
            Ok(_) => {
                // Binary or other message types - ignore
            }
            Err(e) => {
                error!("WebSocket error for {}: {}", conn.peer, e);
                break;
            }
        }
    }
    debug!("Read loop ended for {}", conn.peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ChatServer;

    fn connection(server: &ServerHandle) -> (Connection, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let conn = Connection {
            peer: "test".into(),
            server: server.clone(),
            outbox: Outbox::new(tx),
            state: ConnectionState::Connected,
        };
        (conn, rx)
    }

    fn join(id: &str, since: Option<MessageId>, epoch: Option<String>) -> ClientMessage {
        ClientMessage::Join {
            room: None,
            identity: Identity::new(id, id),
            since,
            epoch,
        }
    }

    fn send(text: &str) -> ClientMessage {
        ClientMessage::SendMessage { text: text.into() }
    }

    /// Epoch and message texts of the next `joined` event
    async fn joined(rx: &mut mpsc::Receiver<ServerMessage>) -> (String, Vec<String>) {
        loop {
            match rx.recv().await {
                Some(ServerMessage::Joined {
                    epoch, messages, ..
                }) => return (epoch, messages.into_iter().map(|m| m.text).collect()),
                Some(_) => continue,
                None => panic!("outbox closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_leave_before_join_stays_connected() {
        let server = ChatServer::spawn(ServerConfig::default());
        let (mut conn, _rx) = connection(&server);

        conn.handle_client_message(ClientMessage::Leave).await.unwrap();
        assert!(matches!(conn.state, ConnectionState::Connected));

        let result = conn.handle_client_message(send("hi")).await;
        assert!(matches!(result, Err(AppError::NotJoined)));
    }

    #[tokio::test]
    async fn test_leave_after_join_closes_session() {
        let server = ChatServer::spawn(ServerConfig::default());
        let (mut conn, _rx) = connection(&server);

        conn.handle_client_message(join("u-alice", None, None)).await.unwrap();
        let again = conn.handle_client_message(join("u-alice", None, None)).await;
        assert!(matches!(again, Err(AppError::AlreadyJoined)));

        conn.handle_client_message(ClientMessage::Leave).await.unwrap();
        assert!(matches!(conn.state, ConnectionState::Left));
        let result = conn.handle_client_message(send("hi")).await;
        assert!(matches!(result, Err(AppError::SessionClosed)));

        // The room retired when it emptied; joining again opens a new one
        conn.handle_client_message(join("u-alice", None, None)).await.unwrap();
        conn.handle_client_message(send("back")).await.unwrap();
    }

    #[tokio::test]
    async fn test_since_needs_matching_epoch() {
        let server = ChatServer::spawn(ServerConfig::default());
        let (mut alice, mut alice_rx) = connection(&server);
        alice.handle_client_message(join("u-alice", None, None)).await.unwrap();
        let (epoch, _) = joined(&mut alice_rx).await;
        for text in ["one", "two"] {
            alice.handle_client_message(send(text)).await.unwrap();
        }

        let (mut bob, mut bob_rx) = connection(&server);
        let stale = join("u-bob", Some(MessageId(1)), Some("old-epoch".into()));
        bob.handle_client_message(stale).await.unwrap();
        assert_eq!(joined(&mut bob_rx).await, (epoch.clone(), vec!["one".into(), "two".into()]));

        let (mut carol, mut carol_rx) = connection(&server);
        let current = join("u-carol", Some(MessageId(1)), Some(epoch.clone()));
        carol.handle_client_message(current).await.unwrap();
        assert_eq!(joined(&mut carol_rx).await, (epoch, vec!["two".into()]));
    }
}
