//! Client session adapter
//!
//! The boundary between a rendering layer and the chat server. A
//! `ClientSession` owns one WebSocket connection for one identity, keeps the
//! `ChatView` read model current, and turns intents into client events.
//!
//! A background driver task pumps the connection. When the transport is
//! lost it reconnects with backoff and rejoins with the room epoch and the
//! id of the last seen message, so only missed messages are appended;
//! meanwhile the view is left as it was. If the room came back as a new
//! epoch the server sends its whole history and the view starts over.
//! After `logout()` returns no update reaches any observer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::AppError;
use crate::message::{ClientMessage, ErrorCode, ServerMessage};
use crate::types::{Identity, Message, MessageId};
use crate::typing::TYPING_TTL;
use crate::view::{ChatView, ConnectionStatus, ViewChange};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the incremental change channel
const CHANGES_BUFFER_SIZE: usize = 256;

/// Observer handle: latest snapshot plus incremental changes
///
/// Both channels close when the session logs out.
pub struct Subscription {
    pub snapshot: watch::Receiver<ChatView>,
    pub changes: broadcast::Receiver<ViewChange>,
}

struct Publisher {
    view: watch::Sender<ChatView>,
    changes: broadcast::Sender<ViewChange>,
}

/// State shared by the session and its driver task
struct Shared {
    /// None once logged out
    publisher: Mutex<Option<Publisher>>,
    shutdown: Notify,
    /// Typing refresh period, set from each `joined`
    typing_refresh: Mutex<Duration>,
}

/// Where a rejoin picks up: the room epoch and the last message seen in it
struct Resume {
    epoch: String,
    since: Option<MessageId>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    /// Mutate the view and notify observers, unless logged out
    ///
    /// The publisher lock is held for the whole update, so an update racing
    /// `close` either lands before it or not at all.
    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut ChatView) -> Vec<ViewChange>,
    {
        let guard = lock(&self.publisher);
        let Some(publisher) = guard.as_ref() else {
            return;
        };

        let mut changes = Vec::new();
        publisher.view.send_if_modified(|view| {
            changes = f(view);
            !changes.is_empty()
        });
        for change in changes {
            let _ = publisher.changes.send(change);
        }
    }

    fn subscribe(&self) -> Option<Subscription> {
        let guard = lock(&self.publisher);
        guard.as_ref().map(|publisher| Subscription {
            snapshot: publisher.view.subscribe(),
            changes: publisher.changes.subscribe(),
        })
    }

    fn resume_point(&self) -> Option<Resume> {
        let guard = lock(&self.publisher);
        let publisher = guard.as_ref()?;
        let view = publisher.view.borrow();
        view.epoch().map(|epoch| Resume {
            epoch: epoch.to_string(),
            since: view.last_message_id(),
        })
    }

    /// Drop the publisher. Returns true the first time.
    fn close(&self) -> bool {
        lock(&self.publisher).take().is_some()
    }

    fn is_closed(&self) -> bool {
        lock(&self.publisher).is_none()
    }
}

/// Last typing signal sent, for coalescing keystrokes
#[derive(Debug, Default)]
struct TypingState {
    is_typing: bool,
    sent_at: Option<Instant>,
}

impl TypingState {
    /// Whether a signal must go out; records it if so
    fn should_send(&mut self, is_typing: bool, now: Instant, refresh: Duration) -> bool {
        let due = if is_typing != self.is_typing {
            true
        } else {
            is_typing && self.sent_at.map_or(true, |at| now.duration_since(at) >= refresh)
        };
        if due {
            self.is_typing = is_typing;
            self.sent_at = Some(now);
        }
        due
    }
}

/// A connected chat session for one identity
pub struct ClientSession {
    identity: Identity,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<ClientMessage>,
    view: watch::Receiver<ChatView>,
    typing: Mutex<TypingState>,
}

impl ClientSession {
    /// Connect, join the configured room and start the driver task
    ///
    /// Fails with `DuplicateSession` if the identity is already connected and
    /// with `TransportFailure` if the server cannot be reached.
    pub async fn connect(config: ClientConfig) -> Result<Self, AppError> {
        let (ws, joined) = open(&config, None).await?;
        let typing_refresh = refresh_for_joined(&config, &joined);

        let mut view = ChatView::new(&config.identity);
        view.apply(joined);
        info!(
            "{} connected to {} ({} messages, {} users)",
            config.identity.username,
            config.url,
            view.messages.len(),
            view.users.len()
        );

        let (view_tx, view_rx) = watch::channel(view);
        let (changes_tx, _) = broadcast::channel(CHANGES_BUFFER_SIZE);
        let shared = Arc::new(Shared {
            publisher: Mutex::new(Some(Publisher {
                view: view_tx,
                changes: changes_tx,
            })),
            shutdown: Notify::new(),
            typing_refresh: Mutex::new(typing_refresh),
        });

        let (out_tx, out_rx) = mpsc::channel(config.outbound_buffer);
        let identity = config.identity.clone();

        let driver = Driver {
            config,
            shared: shared.clone(),
            outbound: out_rx,
            pending: None,
        };
        tokio::spawn(driver.run(ws));

        Ok(Self {
            identity,
            shared,
            outbound: out_tx,
            view: view_rx,
            typing: Mutex::new(TypingState::default()),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn username(&self) -> &str {
        &self.identity.username
    }

    /// Current read model (the last one published before logout)
    pub fn view(&self) -> ChatView {
        self.view.borrow().clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.view.borrow().messages.clone()
    }

    pub fn users(&self) -> Vec<Identity> {
        self.view.borrow().users.clone()
    }

    pub fn typing_users(&self) -> BTreeMap<String, bool> {
        self.view.borrow().typing_users.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.view.borrow().status
    }

    /// How often a continuing typing signal is re-sent
    pub fn typing_refresh(&self) -> Duration {
        *lock(&self.shared.typing_refresh)
    }

    /// Observe the view; None after logout
    pub fn subscribe(&self) -> Option<Subscription> {
        self.shared.subscribe()
    }

    /// Send a chat message. Blank text is ignored.
    pub async fn send_message(&self, text: &str) -> Result<(), AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        self.dispatch(ClientMessage::SendMessage {
            text: text.to_string(),
        })
        .await?;

        // The server ends our typing signal when a message lands
        *lock(&self.typing) = TypingState::default();
        Ok(())
    }

    /// Report typing state. Repeated calls are coalesced; while typing
    /// continues the signal is refreshed before it can expire.
    pub async fn set_typing(&self, is_typing: bool) -> Result<(), AppError> {
        let refresh = self.typing_refresh();
        let due = lock(&self.typing).should_send(is_typing, Instant::now(), refresh);
        if !due {
            return Ok(());
        }
        self.dispatch(ClientMessage::SetTyping { is_typing }).await
    }

    /// Leave the room and tear down the connection
    ///
    /// Returns immediately; the network teardown finishes in the background.
    pub fn logout(&self) {
        if self.shared.close() {
            info!("{} logged out", self.identity.username);
        }
        self.shared.shutdown.notify_one();
    }

    async fn dispatch(&self, msg: ClientMessage) -> Result<(), AppError> {
        if self.shared.is_closed() {
            return Err(AppError::SessionClosed);
        }
        self.outbound
            .send(msg)
            .await
            .map_err(|_| AppError::SessionClosed)
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.logout();
    }
}

/// Typing refresh period for the TTL a `joined` event announces
fn refresh_for_joined(config: &ClientConfig, joined: &ServerMessage) -> Duration {
    let ttl = match joined {
        ServerMessage::Joined { typing_ttl_ms, .. } => Duration::from_millis(*typing_ttl_ms),
        _ => TYPING_TTL,
    };
    config.typing_refresh_for(ttl)
}

/// Open a connection and join; returns the stream and the `joined` event
async fn open(
    config: &ClientConfig,
    resume: Option<Resume>,
) -> Result<(WsStream, ServerMessage), AppError> {
    let (mut ws, _) = connect_async(config.url.as_str())
        .await
        .map_err(|e| AppError::TransportFailure(e.to_string()))?;

    let (epoch, since) = match resume {
        Some(resume) => (Some(resume.epoch), resume.since),
        None => (None, None),
    };
    let join = ClientMessage::Join {
        room: config.room.clone(),
        identity: config.identity.clone(),
        since,
        epoch,
    };
    send_json(&mut ws, &join).await?;

    while let Some(frame) = ws.next().await {
        let frame = frame.map_err(|e| AppError::TransportFailure(e.to_string()))?;
        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ServerMessage>(&text)? {
            joined @ ServerMessage::Joined { .. } => return Ok((ws, joined)),
            ServerMessage::Error {
                code: ErrorCode::DuplicateSession,
                ..
            } => {
                let _ = ws.close(None).await;
                return Err(AppError::DuplicateSession(config.identity.id.clone()));
            }
            ServerMessage::Error { code, message } => {
                let _ = ws.close(None).await;
                return Err(AppError::from_code(code, message));
            }
            other => debug!("Ignoring {:?} before join", other),
        }
    }

    Err(AppError::TransportFailure("connection closed during join".to_string()))
}

async fn send_json(ws: &mut WsStream, msg: &ClientMessage) -> Result<(), AppError> {
    let json = serde_json::to_string(msg)?;
    ws.send(WsMessage::Text(json))
        .await
        .map_err(|e| AppError::TransportFailure(e.to_string()))
}

enum SessionEnd {
    Logout,
    TransportLost,
}

/// Background task pumping one session's connection
struct Driver {
    config: ClientConfig,
    shared: Arc<Shared>,
    outbound: mpsc::Receiver<ClientMessage>,
    /// Event whose send failed; retried after reconnect
    pending: Option<ClientMessage>,
}

impl Driver {
    async fn run(mut self, ws: WsStream) {
        let mut ws = ws;
        loop {
            match self.pump(&mut ws).await {
                SessionEnd::Logout => {
                    self.teardown(ws).await;
                    break;
                }
                SessionEnd::TransportLost => {
                    if self.shared.is_closed() {
                        break;
                    }
                    warn!("{}: connection lost", self.config.identity.username);
                    match self.reconnect().await {
                        Some(new_ws) => ws = new_ws,
                        None => break,
                    }
                }
            }
        }
        debug!("Driver for {} stopped", self.config.identity.username);
    }

    async fn pump(&mut self, ws: &mut WsStream) -> SessionEnd {
        if let Some(msg) = self.pending.take() {
            if send_json(ws, &msg).await.is_err() {
                self.pending = Some(msg);
                return SessionEnd::TransportLost;
            }
        }

        loop {
            tokio::select! {
                _ = self.shared.shutdown.notified() => return SessionEnd::Logout,
                out = self.outbound.recv() => match out {
                    Some(msg) => {
                        if let Err(e) = send_json(ws, &msg).await {
                            debug!("Send failed: {}", e);
                            self.pending = Some(msg);
                            return SessionEnd::TransportLost;
                        }
                    }
                    None => return SessionEnd::Logout,
                },
                frame = ws.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.on_text(&text),
                    Some(Ok(WsMessage::Close(_))) | None => return SessionEnd::TransportLost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        return SessionEnd::TransportLost;
                    }
                },
            }
        }
    }

    fn on_text(&self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(event) => self.shared.update(|view| view.apply(event)),
            Err(e) => warn!("Invalid event from server: {}", e),
        }
    }

    /// Flush queued intents, leave, and close the socket
    async fn teardown(&mut self, mut ws: WsStream) {
        while let Ok(msg) = self.outbound.try_recv() {
            if send_json(&mut ws, &msg).await.is_err() {
                break;
            }
        }
        let _ = send_json(&mut ws, &ClientMessage::Leave).await;
        let _ = ws.close(None).await;
        debug!("{}: connection closed", self.config.identity.username);
    }

    /// Reconnect with backoff. None on logout or when attempts run out.
    async fn reconnect(&mut self) -> Option<WsStream> {
        let policy = self.config.reconnect.clone();
        let mut attempt = 0;

        loop {
            attempt += 1;
            if policy.exhausted(attempt) {
                error!(
                    "{}: giving up after {} reconnect attempts",
                    self.config.identity.username,
                    attempt - 1
                );
                self.shared.update(|view| {
                    view.set_status(ConnectionStatus::Disconnected)
                        .into_iter()
                        .collect()
                });
                return None;
            }

            self.shared.update(|view| {
                view.set_status(ConnectionStatus::Reconnecting { attempt })
                    .into_iter()
                    .collect()
            });

            let delay = policy.delay(attempt);
            let resume = self.shared.resume_point();
            debug!("Reconnect attempt {} in {:?}", attempt, delay);

            let result = tokio::select! {
                _ = self.shared.shutdown.notified() => return None,
                result = async {
                    tokio::time::sleep(delay).await;
                    open(&self.config, resume).await
                } => result,
            };

            match result {
                Ok((ws, joined)) => {
                    info!(
                        "{}: reconnected after {} attempts",
                        self.config.identity.username, attempt
                    );
                    *lock(&self.shared.typing_refresh) = refresh_for_joined(&self.config, &joined);
                    self.shared.update(|view| {
                        let mut changes = view.apply(joined);
                        changes.extend(view.set_status(ConnectionStatus::Connected));
                        changes
                    });
                    return Some(ws);
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }
}
