//! Session registry
//!
//! Tracks which identities are live in a room. A second login with an
//! identity id that is already registered is rejected; the first session
//! is left untouched.

use std::collections::HashMap;

use crate::error::AppError;
use crate::types::{Identity, SessionHandle};

/// A live session of one identity
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub identity: Identity,
    pub handle: SessionHandle,
    /// Join time, milliseconds since the Unix epoch
    pub connected_at: u64,
}

/// Presence entries keyed by identity id, with a handle index
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: HashMap<String, PresenceEntry>,
    handles: HashMap<SessionHandle, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identity and issue a handle for its session
    ///
    /// Fails with `DuplicateSession` if the id is already registered.
    pub fn join(
        &mut self,
        identity: Identity,
        connected_at: u64,
    ) -> Result<SessionHandle, AppError> {
        if self.entries.contains_key(&identity.id) {
            return Err(AppError::DuplicateSession(identity.id));
        }

        let handle = SessionHandle::new();
        self.handles.insert(handle, identity.id.clone());
        self.entries.insert(
            identity.id.clone(),
            PresenceEntry {
                identity,
                handle,
                connected_at,
            },
        );
        Ok(handle)
    }

    /// Remove the session behind `handle`
    ///
    /// Returns the departed identity, or None if the handle was unknown
    /// (already left).
    pub fn leave(&mut self, handle: SessionHandle) -> Option<Identity> {
        let id = self.handles.remove(&handle)?;
        self.entries.remove(&id).map(|entry| entry.identity)
    }

    /// Present identities ordered by join time, then id
    pub fn list(&self) -> Vec<Identity> {
        let mut entries: Vec<&PresenceEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| {
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| a.identity.id.cmp(&b.identity.id))
        });
        entries.into_iter().map(|e| e.identity.clone()).collect()
    }

    /// Identity behind a live handle
    pub fn identity(&self, handle: SessionHandle) -> Option<&Identity> {
        let id = self.handles.get(&handle)?;
        self.entries.get(id).map(|e| &e.identity)
    }

    /// Whether an identity id is present
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity::new("u-alice", "alice")
    }

    #[test]
    fn test_join_and_list() {
        let mut registry = SessionRegistry::new();
        let handle = registry.join(alice(), 10).unwrap();
        registry.join(Identity::new("u-bob", "bob"), 20).unwrap();

        let users = registry.list();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].username, "alice");
        assert_eq!(users[1].username, "bob");
        assert_eq!(registry.identity(handle), Some(&alice()));
    }

    #[test]
    fn test_duplicate_join_rejected() {
        let mut registry = SessionRegistry::new();
        let first = registry.join(alice(), 10).unwrap();

        let second = registry.join(alice(), 11);
        assert!(matches!(second, Err(AppError::DuplicateSession(id)) if id == "u-alice"));

        // First session untouched, id listed exactly once
        assert_eq!(registry.list(), vec![alice()]);
        assert_eq!(registry.identity(first), Some(&alice()));
    }

    #[test]
    fn test_leave_is_idempotent() {
        let mut registry = SessionRegistry::new();
        let handle = registry.join(alice(), 10).unwrap();

        assert_eq!(registry.leave(handle), Some(alice()));
        assert_eq!(registry.leave(handle), None);
        assert!(registry.is_empty());
        assert!(!registry.contains("u-alice"));
    }

    #[test]
    fn test_rejoin_after_leave() {
        let mut registry = SessionRegistry::new();
        let old = registry.join(alice(), 10).unwrap();
        registry.leave(old);

        let new = registry.join(alice(), 30).unwrap();
        assert_ne!(old, new);
        // Stale handle does not remove the new session
        assert_eq!(registry.leave(old), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_same_username_different_ids() {
        let mut registry = SessionRegistry::new();
        registry.join(Identity::new("u1", "sam"), 10).unwrap();
        registry.join(Identity::new("u2", "sam"), 10).unwrap();
        assert_eq!(registry.len(), 2);
    }
}
