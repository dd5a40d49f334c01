//! Room member definition
//!
//! A live session in a room together with its outbound event channel.

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

use crate::error::SendError;
use crate::message::ServerMessage;
use crate::types::{Identity, SessionHandle};

/// Room → connection event channel
///
/// Carries an eviction signal next to the sender: a room that drops a
/// member for not keeping up notifies it, so the connection can close.
#[derive(Debug, Clone)]
pub struct Outbox {
    sender: mpsc::Sender<ServerMessage>,
    evicted: Arc<Notify>,
}

impl Outbox {
    pub fn new(sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            sender,
            evicted: Arc::new(Notify::new()),
        }
    }

    /// Signal fired when a room evicts this outbox's session
    pub fn evicted(&self) -> Arc<Notify> {
        self.evicted.clone()
    }

    /// Queue an event, waiting for capacity
    pub async fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Queue an event without waiting
    pub fn try_send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }
}

impl From<mpsc::Sender<ServerMessage>> for Outbox {
    fn from(sender: mpsc::Sender<ServerMessage>) -> Self {
        Self::new(sender)
    }
}

/// Connected room member
///
/// Holds the session handle, the identity it joined with, and the
/// Room → connection outbox.
#[derive(Debug)]
pub struct Member {
    pub handle: SessionHandle,
    pub identity: Identity,
    pub outbox: Outbox,
}

impl Member {
    pub fn new(handle: SessionHandle, identity: Identity, outbox: Outbox) -> Self {
        Self {
            handle,
            identity,
            outbox,
        }
    }

    /// Send an event to this member without blocking the room
    ///
    /// Fails with `Full` when the connection is not draining its outbox
    /// and with `ChannelClosed` when the connection is gone.
    pub fn send(&self, msg: ServerMessage) -> Result<(), SendError> {
        self.outbox.try_send(msg)
    }

    /// Tell the connection it was dropped from the room
    pub fn evict(&self) {
        self.outbox.evicted.notify_one();
    }

    pub fn display_name(&self) -> &str {
        &self.identity.username
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn presence() -> ServerMessage {
        ServerMessage::PresenceUpdate { users: vec![] }
    }

    #[tokio::test]
    async fn test_member_send() {
        let (tx, mut rx) = mpsc::channel(4);
        let member = Member::new(SessionHandle::new(), Identity::new("u1", "alice"), tx.into());

        assert_eq!(member.display_name(), "alice");
        member.send(presence()).unwrap();
        assert!(matches!(rx.recv().await, Some(ServerMessage::PresenceUpdate { .. })));
    }

    #[tokio::test]
    async fn test_member_send_closed() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let member = Member::new(SessionHandle::new(), Identity::new("u1", "alice"), tx.into());
        assert!(matches!(member.send(presence()), Err(SendError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_member_send_full_does_not_wait() {
        let (tx, _rx) = mpsc::channel(2);
        let member = Member::new(SessionHandle::new(), Identity::new("u1", "alice"), tx.into());

        member.send(presence()).unwrap();
        member.send(presence()).unwrap();
        assert!(matches!(member.send(presence()), Err(SendError::Full)));
    }

    #[tokio::test]
    async fn test_evict_notifies_connection() {
        let (tx, _rx) = mpsc::channel(2);
        let outbox = Outbox::new(tx);
        let evicted = outbox.evicted();
        let member = Member::new(SessionHandle::new(), Identity::new("u1", "alice"), outbox);

        member.evict();
        tokio::time::timeout(Duration::from_secs(1), evicted.notified())
            .await
            .unwrap();
    }
}
