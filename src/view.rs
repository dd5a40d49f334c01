//! Client read model
//!
//! `ChatView` is what a rendering layer consumes. It is rebuilt purely from
//! server events; `apply` reports each effective change so observers can
//! diff incrementally instead of comparing whole snapshots.
//!
//! Message ids only order messages within one room epoch. A `joined` from a
//! different epoch (the server restarted) replaces the message log.

use std::collections::BTreeMap;

use crate::message::{ErrorCode, ServerMessage};
use crate::types::{Identity, Message, MessageId};

/// Link state of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    /// Transport lost; the rest of the view is frozen until rejoin
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted
    Disconnected,
}

/// Incremental change of a `ChatView`
#[derive(Debug, Clone, PartialEq)]
pub enum ViewChange {
    MessageAppended(Message),
    UsersReplaced(Vec<Identity>),
    TypingReplaced(BTreeMap<String, bool>),
    StatusChanged(ConnectionStatus),
    Error(ErrorCode),
    /// The room restarted; the message log was cleared and refilled
    HistoryReset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatView {
    pub messages: Vec<Message>,
    pub users: Vec<Identity>,
    /// Local username
    pub username: String,
    /// Other identities currently typing, by identity id
    pub typing_users: BTreeMap<String, bool>,
    pub status: ConnectionStatus,
    /// Last non-fatal error reported by the server
    pub last_error: Option<ErrorCode>,
    self_id: String,
    /// Room epoch the messages belong to
    epoch: Option<String>,
}

impl ChatView {
    pub fn new(identity: &Identity) -> Self {
        Self {
            messages: Vec::new(),
            users: Vec::new(),
            username: identity.username.clone(),
            typing_users: BTreeMap::new(),
            status: ConnectionStatus::Connected,
            last_error: None,
            self_id: identity.id.clone(),
            epoch: None,
        }
    }

    pub fn epoch(&self) -> Option<&str> {
        self.epoch.as_deref()
    }

    pub fn last_message_id(&self) -> Option<MessageId> {
        self.messages.last().map(|m| m.id)
    }

    /// Whether a message was written by the local identity
    pub fn is_own(&self, message: &Message) -> bool {
        message.author.id == self.self_id
    }

    /// Usernames of the other identities currently typing
    pub fn typing_names(&self) -> Vec<&str> {
        self.typing_users
            .iter()
            .filter(|(_, typing)| **typing)
            .filter_map(|(id, _)| self.users.iter().find(|u| &u.id == id))
            .map(|u| u.username.as_str())
            .collect()
    }

    /// Apply one server event, returning the changes it caused
    pub fn apply(&mut self, event: ServerMessage) -> Vec<ViewChange> {
        let mut changes = Vec::new();
        match event {
            ServerMessage::Joined {
                epoch,
                messages,
                users,
                typing,
                ..
            } => {
                if self.epoch.as_deref().is_some_and(|known| known != epoch) {
                    self.messages.clear();
                    changes.push(ViewChange::HistoryReset);
                }
                self.epoch = Some(epoch);
                for message in messages {
                    changes.extend(self.append(message));
                }
                changes.extend(self.replace_users(users));
                changes.extend(self.replace_typing(typing));
            }
            ServerMessage::MessageNew { message } => changes.extend(self.append(message)),
            ServerMessage::PresenceUpdate { users } => changes.extend(self.replace_users(users)),
            ServerMessage::TypingUpdate { typing } => changes.extend(self.replace_typing(typing)),
            ServerMessage::Error { code, .. } => {
                self.last_error = Some(code);
                changes.push(ViewChange::Error(code));
            }
        }
        changes
    }

    pub fn set_status(&mut self, status: ConnectionStatus) -> Option<ViewChange> {
        if self.status == status {
            return None;
        }
        self.status = status;
        Some(ViewChange::StatusChanged(status))
    }

    /// Append unless already seen; rejoin catch-up within an epoch may overlap
    fn append(&mut self, message: Message) -> Option<ViewChange> {
        if self.last_message_id().is_some_and(|last| message.id <= last) {
            return None;
        }
        self.messages.push(message.clone());
        Some(ViewChange::MessageAppended(message))
    }

    fn replace_users(&mut self, users: Vec<Identity>) -> Option<ViewChange> {
        if self.users == users {
            return None;
        }
        self.users = users.clone();
        Some(ViewChange::UsersReplaced(users))
    }

    /// Self-exclusion is by identity id; a peer sharing the local
    /// username still shows up.
    fn replace_typing(&mut self, raw: BTreeMap<String, bool>) -> Option<ViewChange> {
        let typing: BTreeMap<String, bool> = raw
            .into_iter()
            .filter(|(id, typing)| *typing && *id != self.self_id)
            .collect();
        if self.typing_users == typing {
            return None;
        }
        self.typing_users = typing.clone();
        Some(ViewChange::TypingReplaced(typing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn me() -> Identity {
        Identity::new("u-me", "sam")
    }

    fn message(id: u64, author: &Identity, text: &str) -> Message {
        Message {
            id: MessageId(id),
            author: author.clone(),
            text: text.to_string(),
            timestamp: id * 10,
        }
    }

    #[test]
    fn test_joined_populates_view() {
        let bob = Identity::new("u-bob", "bob");
        let mut view = ChatView::new(&me());
        let changes = view.apply(ServerMessage::Joined {
            room: "LOBBY".into(),
            epoch: "e1".into(),
            typing_ttl_ms: 5000,
            messages: vec![message(1, &bob, "hi")],
            users: vec![me(), bob.clone()],
            typing: BTreeMap::from([("u-bob".to_string(), true)]),
        });

        assert_eq!(changes.len(), 3);
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.users.len(), 2);
        assert_eq!(view.typing_names(), vec!["bob"]);
        assert!(!view.is_own(&view.messages[0]));
    }

    #[test]
    fn test_duplicate_messages_ignored() {
        let mut view = ChatView::new(&me());
        let first = message(1, &me(), "one");

        let again = ServerMessage::MessageNew {
            message: first.clone(),
        };
        assert_eq!(view.apply(again.clone()).len(), 1);
        assert!(view.apply(again).is_empty());

        // Rejoin catch-up overlapping what we already have
        view.apply(ServerMessage::Joined {
            room: "LOBBY".into(),
            epoch: "e1".into(),
            typing_ttl_ms: 5000,
            messages: vec![first, message(2, &me(), "two")],
            users: vec![me()],
            typing: BTreeMap::new(),
        });
        let texts: Vec<&str> = view.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert_eq!(view.last_message_id(), Some(MessageId(2)));
    }

    #[test]
    fn test_self_excluded_by_id_not_username() {
        let namesake = Identity::new("u-other", "sam");
        let mut view = ChatView::new(&me());
        view.apply(ServerMessage::PresenceUpdate {
            users: vec![me(), namesake.clone()],
        });

        view.apply(ServerMessage::TypingUpdate {
            typing: BTreeMap::from([
                ("u-me".to_string(), true),
                ("u-other".to_string(), true),
            ]),
        });

        assert_eq!(view.typing_users, BTreeMap::from([("u-other".to_string(), true)]));
        assert_eq!(view.typing_names(), vec!["sam"]);
    }

    #[test]
    fn test_typing_update_replaces() {
        let mut view = ChatView::new(&me());
        view.apply(ServerMessage::TypingUpdate {
            typing: BTreeMap::from([("u-bob".to_string(), true)]),
        });
        let changes = view.apply(ServerMessage::TypingUpdate {
            typing: BTreeMap::new(),
        });
        assert_eq!(changes, vec![ViewChange::TypingReplaced(BTreeMap::new())]);
        assert!(view.typing_users.is_empty());
    }

    #[test]
    fn test_error_and_status() {
        let mut view = ChatView::new(&me());
        view.apply(ServerMessage::Error {
            code: ErrorCode::EmptyMessage,
            message: "Message is empty".into(),
        });
        assert_eq!(view.last_error, Some(ErrorCode::EmptyMessage));

        assert!(view.set_status(ConnectionStatus::Connected).is_none());
        assert_eq!(
            view.set_status(ConnectionStatus::Reconnecting { attempt: 1 }),
            Some(ViewChange::StatusChanged(ConnectionStatus::Reconnecting { attempt: 1 }))
        );
    }

    fn joined(epoch: &str, messages: Vec<Message>) -> ServerMessage {
        ServerMessage::Joined {
            room: "LOBBY".into(),
            epoch: epoch.into(),
            typing_ttl_ms: 5000,
            messages,
            users: vec![me()],
            typing: BTreeMap::new(),
        }
    }

    #[test]
    fn test_new_epoch_replaces_history() {
        let bob = Identity::new("u-bob", "bob");
        let mut view = ChatView::new(&me());
        let old = (1..=5).map(|n| message(n, &bob, &format!("old{}", n))).collect();
        view.apply(joined("before-restart", old));
        assert_eq!(view.last_message_id(), Some(MessageId(5)));

        // Restarted server: empty room, ids start over
        let changes = view.apply(joined("after-restart", vec![]));
        assert_eq!(changes, vec![ViewChange::HistoryReset]);
        assert!(view.messages.is_empty());
        assert_eq!(view.epoch(), Some("after-restart"));

        let fresh = message(1, &bob, "new after restart");
        let changes = view.apply(ServerMessage::MessageNew {
            message: fresh.clone(),
        });
        assert_eq!(changes, vec![ViewChange::MessageAppended(fresh)]);
        assert_eq!(view.messages.len(), 1);
    }

    #[test]
    fn test_same_epoch_keeps_history() {
        let mut view = ChatView::new(&me());
        view.apply(joined("e1", vec![message(1, &me(), "one")]));
        let changes = view.apply(joined("e1", vec![message(2, &me(), "two")]));

        assert!(!changes.contains(&ViewChange::HistoryReset));
        let texts: Vec<&str> = view.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }
}
