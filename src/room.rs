//! Room Coordinator actor
//!
//! One actor task per room owns the session registry, typing aggregator and
//! message ledger of that room. All mutations go through its mailbox, so they
//! are applied one at a time, while different rooms run in parallel.
//! After every mutation the actor publishes an immutable `RoomSnapshot`
//! through a watch channel; readers use it without touching the mailbox.
//!
//! The actor never waits on a member: events are queued with `try_send`, and
//! a member whose outbox is full is evicted as if it had left.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{AppError, SendError};
use crate::ledger::MessageLedger;
use crate::member::{Member, Outbox};
use crate::message::ServerMessage;
use crate::registry::SessionRegistry;
use crate::types::{now_millis, Identity, Message, MessageId, RoomCode, SessionHandle};
use crate::typing::TypingAggregator;

/// Room lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    /// No members
    Idle,
    /// At least one member
    Active,
}

/// Point-in-time view of a room
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub room: RoomCode,
    /// Instance id; message ids are only comparable within one epoch
    pub epoch: String,
    pub phase: RoomPhase,
    /// Shared with the ledger until the next append
    pub messages: Arc<Vec<Message>>,
    pub users: Vec<Identity>,
    /// Raw typing set, every present typing identity included
    pub typing: Vec<Identity>,
}

impl RoomSnapshot {
    fn empty(room: RoomCode, epoch: String) -> Self {
        Self {
            room,
            epoch,
            phase: RoomPhase::Idle,
            messages: Arc::default(),
            users: Vec::new(),
            typing: Vec::new(),
        }
    }

    /// Typing set as the wire mapping id → true
    pub fn typing_map(&self) -> BTreeMap<String, bool> {
        self.typing.iter().map(|i| (i.id.clone(), true)).collect()
    }
}

/// Result of a successful join
#[derive(Debug, Clone)]
pub struct JoinAck {
    pub handle: SessionHandle,
    pub snapshot: Arc<RoomSnapshot>,
}

/// Commands sent to a RoomCoordinator actor
#[derive(Debug)]
pub enum RoomCommand {
    /// Register a session; the joiner receives `joined` on `outbox`
    Join {
        identity: Identity,
        since: Option<MessageId>,
        outbox: Outbox,
        reply: oneshot::Sender<Result<JoinAck, AppError>>,
    },
    /// Remove a session (no-op if already gone)
    Leave {
        handle: SessionHandle,
        reply: oneshot::Sender<()>,
    },
    /// Append a message
    SendMessage {
        handle: SessionHandle,
        text: String,
        reply: oneshot::Sender<Result<Message, AppError>>,
    },
    /// Update a typing signal
    SetTyping {
        handle: SessionHandle,
        is_typing: bool,
    },
}

/// Cloneable handle to a running room actor
#[derive(Debug, Clone)]
pub struct RoomHandle {
    code: RoomCode,
    epoch: String,
    commands: mpsc::Sender<RoomCommand>,
    snapshot: watch::Receiver<Arc<RoomSnapshot>>,
}

impl RoomHandle {
    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    /// Whether the room actor has retired
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Resolves once the room actor has retired
    pub async fn closed(&self) {
        self.commands.closed().await
    }

    /// Join the room; events for this session are delivered on `outbox`
    pub async fn join(
        &self,
        identity: Identity,
        since: Option<MessageId>,
        outbox: impl Into<Outbox>,
    ) -> Result<JoinAck, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Join {
            identity,
            since,
            outbox: outbox.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| AppError::ChannelSend)?
    }

    /// Leave the room. Resolves once the room has processed the departure.
    pub async fn leave(&self, handle: SessionHandle) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Leave { handle, reply }).await?;
        rx.await.map_err(|_| AppError::ChannelSend)
    }

    pub async fn send_message(
        &self,
        handle: SessionHandle,
        text: String,
    ) -> Result<Message, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::SendMessage {
            handle,
            text,
            reply,
        })
        .await?;
        rx.await.map_err(|_| AppError::ChannelSend)?
    }

    pub async fn set_typing(&self, handle: SessionHandle, is_typing: bool) -> Result<(), AppError> {
        self.send(RoomCommand::SetTyping { handle, is_typing }).await
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<RoomSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Ordered messages, all or only those after `since`
    pub fn history(&self, since: Option<MessageId>) -> Vec<Message> {
        let snapshot = self.snapshot();
        let start = match since {
            Some(since) => snapshot.messages.partition_point(|m| m.id <= since),
            None => 0,
        };
        snapshot.messages[start..].to_vec()
    }

    pub fn users(&self) -> Vec<Identity> {
        self.snapshot().users.clone()
    }

    pub fn typing(&self) -> Vec<Identity> {
        self.snapshot().typing.clone()
    }

    /// Receiver notified on every published snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<RoomSnapshot>> {
        self.snapshot.clone()
    }

    async fn send(&self, cmd: RoomCommand) -> Result<(), AppError> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| AppError::ChannelSend)
    }
}

/// The per-room actor
pub struct RoomCoordinator {
    code: RoomCode,
    epoch: String,
    config: ServerConfig,
    phase: RoomPhase,
    registry: SessionRegistry,
    typing: TypingAggregator,
    ledger: MessageLedger,
    /// Live members: SessionHandle -> Member
    members: HashMap<SessionHandle, Member>,
    /// Typing changed since the last typing broadcast
    typing_dirty: bool,
    receiver: mpsc::Receiver<RoomCommand>,
    snapshot: watch::Sender<Arc<RoomSnapshot>>,
}

impl RoomCoordinator {
    /// Start a room actor and return its handle
    pub fn spawn(code: RoomCode, config: ServerConfig) -> RoomHandle {
        let epoch = Uuid::new_v4().to_string();
        let (cmd_tx, cmd_rx) = mpsc::channel(config.room_buffer);
        let (snapshot_tx, snapshot_rx) =
            watch::channel(Arc::new(RoomSnapshot::empty(code.clone(), epoch.clone())));

        let coordinator = Self {
            code: code.clone(),
            epoch: epoch.clone(),
            config,
            phase: RoomPhase::Idle,
            registry: SessionRegistry::new(),
            typing: TypingAggregator::new(config.typing_ttl),
            ledger: MessageLedger::new(),
            members: HashMap::new(),
            typing_dirty: false,
            receiver: cmd_rx,
            snapshot: snapshot_tx,
        };
        tokio::spawn(coordinator.run());

        RoomHandle {
            code,
            epoch,
            commands: cmd_tx,
            snapshot: snapshot_rx,
        }
    }

    /// Run the room event loop
    ///
    /// Processes commands until every handle is dropped, or until the room
    /// is left with no members and no history. While the room is active a
    /// ticker coalesces typing broadcasts and sweeps expired typing signals.
    pub async fn run(mut self) {
        info!("Room {} started (epoch {})", self.code, self.epoch);

        let mut ticker = tokio::time::interval(self.config.typing_flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = ticker.tick(), if self.phase == RoomPhase::Active => self.flush_typing(),
            }

            if self.is_unused() {
                info!("Room {} retired", self.code);
                break;
            }
        }

        info!("Room {} shutting down", self.code);
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join {
                identity,
                since,
                outbox,
                reply,
            } => {
                let result = self.handle_join(identity, since, outbox);
                let _ = reply.send(result);
            }
            RoomCommand::Leave { handle, reply } => {
                self.handle_leave(handle);
                let _ = reply.send(());
            }
            RoomCommand::SendMessage {
                handle,
                text,
                reply,
            } => {
                let result = self.handle_send_message(handle, text);
                let _ = reply.send(result);
            }
            RoomCommand::SetTyping { handle, is_typing } => {
                self.handle_set_typing(handle, is_typing);
            }
        }
    }

    fn handle_join(
        &mut self,
        identity: Identity,
        since: Option<MessageId>,
        outbox: Outbox,
    ) -> Result<JoinAck, AppError> {
        let handle = match self.registry.join(identity.clone(), now_millis()) {
            Ok(handle) => handle,
            Err(e) => {
                info!("Room {}: rejected join of '{}': {}", self.code, identity.id, e);
                return Err(e);
            }
        };

        // The joiner sees its initial state before any broadcast
        let member = Member::new(handle, identity, outbox);
        let joined = ServerMessage::Joined {
            room: self.code.to_string(),
            epoch: self.epoch.clone(),
            typing_ttl_ms: self.config.typing_ttl.as_millis() as u64,
            messages: self.ledger.history(since),
            users: self.registry.list(),
            typing: self.typing.typing_map(Instant::now(), &self.registry),
        };
        if let Err(e) = member.send(joined) {
            debug!("Room {}: joiner {} unreachable: {}", self.code, handle, e);
            self.registry.leave(handle);
            return Err(AppError::SessionClosed);
        }

        info!(
            "Room {}: {} ({}) joined as {}",
            self.code,
            member.display_name(),
            member.identity.id,
            handle
        );
        if self.phase == RoomPhase::Idle {
            self.phase = RoomPhase::Active;
            debug!("Room {} is active", self.code);
        }
        self.members.insert(handle, member);

        self.broadcast_presence();
        let snapshot = self.publish();

        debug!("Room {}: {} members", self.code, self.members.len());
        Ok(JoinAck { handle, snapshot })
    }

    fn handle_leave(&mut self, handle: SessionHandle) {
        let Some(identity) = self.registry.leave(handle) else {
            debug!("Room {}: leave for unknown session {}", self.code, handle);
            return;
        };
        self.members.remove(&handle);
        info!("Room {}: {} ({}) left", self.code, identity.username, identity.id);

        let was_typing = self.typing.clear(&identity.id);

        if self.registry.is_empty() {
            self.enter_idle();
        }

        self.broadcast_presence();
        if was_typing {
            self.broadcast_typing();
        }
        self.publish();
    }

    fn handle_send_message(
        &mut self,
        handle: SessionHandle,
        text: String,
    ) -> Result<Message, AppError> {
        let Some(author) = self.registry.identity(handle).cloned() else {
            return Err(AppError::SessionClosed);
        };

        let message = self.ledger.append(&author, &text, now_millis())?;
        debug!("Room {}: message {} from {}", self.code, message.id, author.id);

        // Sending ends typing; peers see the stop before the message
        if self.typing.clear(&author.id) {
            self.broadcast_typing();
        }

        self.broadcast(ServerMessage::MessageNew {
            message: message.clone(),
        });
        self.publish();

        Ok(message)
    }

    fn handle_set_typing(&mut self, handle: SessionHandle, is_typing: bool) {
        let Some(identity) = self.registry.identity(handle).cloned() else {
            debug!("Room {}: typing from unknown session {}", self.code, handle);
            return;
        };

        if self.typing.set_typing(&identity, is_typing, Instant::now()) {
            self.typing_dirty = true;
            self.publish();
        }
    }

    /// Ticker: sweep expired signals and send one coalesced typing update
    fn flush_typing(&mut self) {
        if self.typing.sweep(Instant::now()) {
            debug!("Room {}: typing signals expired", self.code);
            self.typing_dirty = true;
            self.publish();
        }

        if self.typing_dirty {
            self.broadcast_typing();
        }
    }

    /// Last member left: typing state is discarded, history is kept
    fn enter_idle(&mut self) {
        self.phase = RoomPhase::Idle;
        self.typing.clear_all();
        self.typing_dirty = false;
        info!("Room {} is idle ({} messages kept)", self.code, self.ledger.len());
    }

    /// Idle with nothing worth keeping
    fn is_unused(&self) -> bool {
        self.phase == RoomPhase::Idle && self.members.is_empty() && self.ledger.is_empty()
    }

    fn broadcast_presence(&mut self) {
        let users = self.registry.list();
        self.broadcast(ServerMessage::PresenceUpdate { users });
    }

    fn broadcast_typing(&mut self) {
        self.typing_dirty = false;
        let typing = self.typing.typing_map(Instant::now(), &self.registry);
        self.broadcast(ServerMessage::TypingUpdate { typing });
    }

    /// Send an event to every member, in the same order for all members.
    /// Members that cannot take it are evicted.
    fn broadcast(&mut self, msg: ServerMessage) {
        let stale = self.fan_out(&msg);
        self.evict(stale);
    }

    /// Queue an event on every outbox; returns the members that refused it
    fn fan_out(&self, msg: &ServerMessage) -> Vec<SessionHandle> {
        self.members
            .values()
            .filter_map(|member| match member.send(msg.clone()) {
                Ok(()) => None,
                Err(SendError::Full) => {
                    warn!(
                        "Room {}: {} is not draining its outbox, evicting",
                        self.code, member.handle
                    );
                    Some(member.handle)
                }
                Err(SendError::ChannelClosed) => {
                    debug!("Room {}: member {} outbox closed", self.code, member.handle);
                    Some(member.handle)
                }
            })
            .collect()
    }

    /// Drop members as if they had left, then tell the rest
    fn evict(&mut self, mut stale: Vec<SessionHandle>) {
        if stale.is_empty() {
            return;
        }
        while !stale.is_empty() {
            let mut typing_changed = false;
            for handle in stale.drain(..) {
                let Some(member) = self.members.remove(&handle) else {
                    continue;
                };
                member.evict();
                if let Some(identity) = self.registry.leave(handle) {
                    info!("Room {}: {} ({}) evicted", self.code, identity.username, identity.id);
                    typing_changed |= self.typing.clear(&identity.id);
                }
            }

            if self.registry.is_empty() {
                self.enter_idle();
            }

            let users = self.registry.list();
            stale = self.fan_out(&ServerMessage::PresenceUpdate { users });
            if typing_changed {
                self.typing_dirty = false;
                let typing = self.typing.typing_map(Instant::now(), &self.registry);
                stale.extend(self.fan_out(&ServerMessage::TypingUpdate { typing }));
            }
        }
        self.publish();
    }

    fn publish(&self) -> Arc<RoomSnapshot> {
        let snapshot = Arc::new(RoomSnapshot {
            room: self.code.clone(),
            epoch: self.epoch.clone(),
            phase: self.phase,
            messages: self.ledger.shared(),
            users: self.registry.list(),
            typing: self.typing.currently_typing(Instant::now(), &self.registry),
        });
        self.snapshot.send_replace(snapshot.clone());
        snapshot
    }
}
