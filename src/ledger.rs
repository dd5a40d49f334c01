//! Message ledger
//!
//! Append-only message store for one room. Ids are assigned sequentially
//! and timestamps never decrease, so `(timestamp, id)` order is append order.
//!
//! The log is kept behind an `Arc` so published room snapshots share it;
//! only an append copies it, and only while an older snapshot still holds it.

use std::sync::Arc;

use crate::error::AppError;
use crate::types::{Identity, Message, MessageId};

#[derive(Debug, Default)]
pub struct MessageLedger {
    messages: Arc<Vec<Message>>,
}

impl MessageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message
    ///
    /// The text is trimmed; blank text fails with `EmptyMessage` and leaves
    /// the ledger unchanged.
    pub fn append(
        &mut self,
        author: &Identity,
        text: &str,
        now_ms: u64,
    ) -> Result<Message, AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::EmptyMessage);
        }

        let (id, timestamp) = match self.messages.last() {
            Some(last) => (MessageId(last.id.0 + 1), now_ms.max(last.timestamp)),
            None => (MessageId(1), now_ms),
        };

        let message = Message {
            id,
            author: author.clone(),
            text: text.to_string(),
            timestamp,
        };
        Arc::make_mut(&mut self.messages).push(message.clone());
        Ok(message)
    }

    /// Messages in order; all of them, or only those after `since`
    pub fn history(&self, since: Option<MessageId>) -> Vec<Message> {
        let start = match since {
            Some(since) => self.messages.partition_point(|m| m.id <= since),
            None => 0,
        };
        self.messages[start..].to_vec()
    }

    /// The whole log, shared
    pub fn shared(&self) -> Arc<Vec<Message>> {
        self.messages.clone()
    }

    pub fn last_id(&self) -> Option<MessageId> {
        self.messages.last().map(|m| m.id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.text.as_str()).collect()
    }

    #[test]
    fn test_append_assigns_ids_in_order() {
        let mut ledger = MessageLedger::new();
        let alice = Identity::new("u-alice", "alice");
        let bob = Identity::new("u-bob", "bob");

        let first = ledger.append(&alice, "hi", 100).unwrap();
        let second = ledger.append(&bob, "hello", 100).unwrap();

        assert_eq!(first.id, MessageId(1));
        assert_eq!(second.id, MessageId(2));
        assert!(first.order_key() < second.order_key());
        assert_eq!(texts(&ledger.history(None)), vec!["hi", "hello"]);
    }

    #[test]
    fn test_blank_text_rejected() {
        let mut ledger = MessageLedger::new();
        let alice = Identity::new("u-alice", "alice");

        assert!(matches!(ledger.append(&alice, "", 1), Err(AppError::EmptyMessage)));
        assert!(matches!(ledger.append(&alice, "   ", 1), Err(AppError::EmptyMessage)));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_text_is_trimmed() {
        let mut ledger = MessageLedger::new();
        let alice = Identity::new("u-alice", "alice");
        let message = ledger.append(&alice, "  hi there \n", 1).unwrap();
        assert_eq!(message.text, "hi there");
    }

    #[test]
    fn test_timestamp_never_goes_backwards() {
        let mut ledger = MessageLedger::new();
        let alice = Identity::new("u-alice", "alice");

        ledger.append(&alice, "one", 500).unwrap();
        let skewed = ledger.append(&alice, "two", 400).unwrap();
        assert_eq!(skewed.timestamp, 500);
    }

    #[test]
    fn test_shared_log_is_stable_across_appends() {
        let mut ledger = MessageLedger::new();
        let alice = Identity::new("u-alice", "alice");
        ledger.append(&alice, "one", 1).unwrap();

        let before = ledger.shared();
        assert!(Arc::ptr_eq(&before, &ledger.shared()));

        ledger.append(&alice, "two", 2).unwrap();
        assert_eq!(texts(&before), vec!["one"]);
        assert_eq!(texts(&ledger.shared()), vec!["one", "two"]);
    }

    #[test]
    fn test_history_since() {
        let mut ledger = MessageLedger::new();
        let alice = Identity::new("u-alice", "alice");
        for text in ["a", "b", "c"] {
            ledger.append(&alice, text, 1).unwrap();
        }

        assert_eq!(texts(&ledger.history(Some(MessageId(1)))), vec!["b", "c"]);
        assert!(ledger.history(Some(MessageId(3))).is_empty());
        assert!(ledger.history(Some(MessageId(99))).is_empty());
        assert_eq!(ledger.last_id(), Some(MessageId(3)));
    }
}
