// Prefix subscription table with TTL and match lookup.
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use spire_wire::{BitPrefix, Route};

/// Subscription owner, derived from the client's router identity frame.
///
/// ```
/// use spire_notify::AddressKey;
///
/// let a = AddressKey::from_dest(b"client-1");
/// let b = AddressKey::from_dest(b"client-1");
/// assert_eq!(a, b);
/// assert_ne!(a, AddressKey::from_dest(b"client-2"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressKey([u8; 20]);

impl AddressKey {
    // Deterministic, collision-resistant mapping from identity bytes.
    pub fn from_dest(dest: &[u8]) -> Self {
        let digest = Sha256::digest(dest);
        let mut key = [0u8; 20];
        key.copy_from_slice(&digest[..20]);
        Self(key)
    }
}

/// Two subscriptions from the same client with the same prefix collapse
/// into one; the pair is the table key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub key: AddressKey,
    pub prefix: BitPrefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Created,
    Refreshed,
    /// The table was full; the entry closest to expiry was evicted to make
    /// room. The ack carries `subscription_limit`.
    Evicted,
}

/// A non-expired entry whose prefix matched a candidate field.
#[derive(Debug, Clone)]
pub struct Matched {
    pub key: SubscriptionKey,
    pub route: Route,
}

struct Entry {
    route: Route,
    expires_at: Instant,
    sequence: u8,
}

/// Concurrent subscription table.
///
/// The sharded map serializes writers per entry while leaving lookups free
/// to run concurrently; no lock is held across an await point because the
/// table is only touched from synchronous sections.
pub struct SubscriberIndex {
    entries: DashMap<SubscriptionKey, Entry>,
    limit: usize,
}

impl SubscriberIndex {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: DashMap::new(),
            limit: limit.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Upsert a subscription. A refresh renews the TTL and the reply route
    /// but preserves the notification sequence.
    pub fn subscribe(
        &self,
        key: AddressKey,
        prefix: BitPrefix,
        route: Route,
        ttl: Duration,
    ) -> SubscribeOutcome {
        let expires_at = Instant::now() + ttl;
        let subscription = SubscriptionKey { key, prefix };
        if let Some(mut entry) = self.entries.get_mut(&subscription) {
            entry.route = route;
            entry.expires_at = expires_at;
            return SubscribeOutcome::Refreshed;
        }

        let evicted = if self.entries.len() >= self.limit {
            self.evict_soonest()
        } else {
            false
        };
        self.entries.insert(
            subscription,
            Entry {
                route,
                expires_at,
                sequence: 0,
            },
        );
        if evicted {
            SubscribeOutcome::Evicted
        } else {
            SubscribeOutcome::Created
        }
    }

    /// Explicit unsubscribe; absent entries are not an error.
    pub fn unsubscribe(&self, key: &AddressKey, prefix: &BitPrefix) -> bool {
        self.entries
            .remove(&SubscriptionKey {
                key: *key,
                prefix: prefix.clone(),
            })
            .is_some()
    }

    /// All live entries whose prefix matches the candidate field.
    pub fn matches(&self, field: &[u8]) -> Vec<Matched> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.value().expires_at > now && entry.key().prefix.matches(field))
            .map(|entry| Matched {
                key: entry.key().clone(),
                route: entry.value().route.clone(),
            })
            .collect()
    }

    /// Post-increment the entry's notification sequence, wrapping mod 256.
    /// Returns `None` when the entry disappeared since the match.
    pub fn take_sequence(&self, key: &SubscriptionKey) -> Option<u8> {
        let mut entry = self.entries.get_mut(key)?;
        let sequence = entry.sequence;
        entry.sequence = sequence.wrapping_add(1);
        Some(sequence)
    }

    /// Drop every subscription owned by a client; used after a send failure.
    pub fn remove_peer(&self, key: &AddressKey) -> usize {
        let before = self.entries.len();
        self.entries.retain(|subscription, _| subscription.key != *key);
        before - self.entries.len()
    }

    /// Remove entries expiring at or before `now`; untouched entries keep
    /// their sequence.
    pub fn purge(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    fn evict_soonest(&self) -> bool {
        let soonest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().expires_at)
            .map(|entry| entry.key().clone());
        match soonest {
            Some(key) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }
}
