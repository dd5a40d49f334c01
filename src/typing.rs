//! Typing aggregator
//!
//! Derives the set of identities currently composing a message from
//! short-lived signals. A signal lives for `ttl` after its last refresh,
//! so a dropped stop-typing event clears itself.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use crate::registry::SessionRegistry;
use crate::types::Identity;

/// Default lifetime of a typing signal
pub const TYPING_TTL: Duration = Duration::from_secs(5);

/// Latest typing claim of one identity
#[derive(Debug, Clone)]
pub struct TypingSignal {
    pub identity: Identity,
    pub expires_at: Instant,
}

impl TypingSignal {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug)]
pub struct TypingAggregator {
    ttl: Duration,
    signals: HashMap<String, TypingSignal>,
}

impl TypingAggregator {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            signals: HashMap::new(),
        }
    }

    /// Apply a typing signal
    ///
    /// `true` installs or refreshes the signal, `false` removes it.
    /// Returns true if the observable typing set changed.
    pub fn set_typing(&mut self, identity: &Identity, is_typing: bool, now: Instant) -> bool {
        if !is_typing {
            return self.clear(&identity.id);
        }

        let expires_at = now + self.ttl;
        match self.signals.get_mut(&identity.id) {
            Some(signal) if signal.is_live(now) => {
                signal.expires_at = expires_at;
                signal.identity = identity.clone();
                false
            }
            _ => {
                self.signals.insert(
                    identity.id.clone(),
                    TypingSignal {
                        identity: identity.clone(),
                        expires_at,
                    },
                );
                true
            }
        }
    }

    /// Drop expired signals. Returns true if anything was removed.
    pub fn sweep(&mut self, now: Instant) -> bool {
        let before = self.signals.len();
        self.signals.retain(|_, signal| signal.is_live(now));
        self.signals.len() != before
    }

    /// Remove one identity's signal. Returns true if it was typing.
    pub fn clear(&mut self, id: &str) -> bool {
        self.signals.remove(id).is_some()
    }

    pub fn clear_all(&mut self) {
        self.signals.clear();
    }

    /// Live typing identities that are present in `registry`, ordered by id
    ///
    /// The caller's own identity is included; self-exclusion is a read-side
    /// concern of each client view.
    pub fn currently_typing(&self, now: Instant, registry: &SessionRegistry) -> Vec<Identity> {
        let mut typing: Vec<Identity> = self
            .signals
            .values()
            .filter(|signal| signal.is_live(now) && registry.contains(&signal.identity.id))
            .map(|signal| signal.identity.clone())
            .collect();
        typing.sort_by(|a, b| a.id.cmp(&b.id));
        typing
    }

    /// Same set as `currently_typing`, as the wire mapping id → true
    pub fn typing_map(&self, now: Instant, registry: &SessionRegistry) -> BTreeMap<String, bool> {
        self.currently_typing(now, registry)
            .into_iter()
            .map(|identity| (identity.id, true))
            .collect()
    }
}

impl Default for TypingAggregator {
    fn default() -> Self {
        Self::new(TYPING_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (SessionRegistry, Identity, Identity) {
        let mut registry = SessionRegistry::new();
        let alice = Identity::new("u-alice", "alice");
        let bob = Identity::new("u-bob", "bob");
        registry.join(alice.clone(), 1).unwrap();
        registry.join(bob.clone(), 2).unwrap();
        (registry, alice, bob)
    }

    #[test]
    fn test_set_and_stop_typing() {
        let (registry, _alice, bob) = setup();
        let mut typing = TypingAggregator::default();
        let now = Instant::now();

        assert!(typing.set_typing(&bob, true, now));
        assert_eq!(typing.currently_typing(now, &registry), vec![bob.clone()]);

        assert!(typing.set_typing(&bob, false, now));
        assert!(typing.currently_typing(now, &registry).is_empty());

        // Stopping again changes nothing
        assert!(!typing.set_typing(&bob, false, now));
    }

    #[test]
    fn test_signal_expires_without_stop() {
        let (registry, _alice, bob) = setup();
        let mut typing = TypingAggregator::new(Duration::from_secs(5));
        let start = Instant::now();

        typing.set_typing(&bob, true, start);
        let within = start + Duration::from_secs(4);
        assert_eq!(typing.currently_typing(within, &registry).len(), 1);

        // Lazy check on read, before any sweep
        let after = start + Duration::from_secs(5);
        assert!(typing.currently_typing(after, &registry).is_empty());

        assert!(typing.sweep(after));
        assert!(!typing.sweep(after));
    }

    #[test]
    fn test_refresh_extends_expiry() {
        let (registry, _alice, bob) = setup();
        let mut typing = TypingAggregator::new(Duration::from_secs(5));
        let start = Instant::now();

        typing.set_typing(&bob, true, start);
        let refresh = start + Duration::from_secs(3);
        assert!(!typing.set_typing(&bob, true, refresh));

        let later = start + Duration::from_secs(7);
        assert_eq!(typing.currently_typing(later, &registry), vec![bob]);
    }

    #[test]
    fn test_includes_caller_and_excludes_absent() {
        let (mut registry, alice, bob) = setup();
        let mut typing = TypingAggregator::default();
        let now = Instant::now();

        typing.set_typing(&alice, true, now);
        typing.set_typing(&bob, true, now);
        assert_eq!(typing.currently_typing(now, &registry).len(), 2);

        let ghost = Identity::new("u-ghost", "ghost");
        typing.set_typing(&ghost, true, now);
        assert_eq!(typing.currently_typing(now, &registry).len(), 2);

        let carol = Identity::new("u-carol", "carol");
        let carol_handle = registry.join(carol.clone(), 3).unwrap();
        typing.set_typing(&carol, true, now);
        registry.leave(carol_handle);

        let map = typing.typing_map(now, &registry);
        assert_eq!(map.get("u-alice"), Some(&true));
        assert_eq!(map.get("u-bob"), Some(&true));
        assert!(!map.contains_key("u-ghost"));
        assert!(!map.contains_key("u-carol"));
    }
}
