//! Stream Registry
//!
//! Process-local set of streams the orchestrator claims for. Entries carry
//! the payer's signing credentials and are never persisted; after a restart
//! the owning layer re-registers whatever is still active.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;

use crate::core_types::{Amount, StreamKey};
use crate::ledger::{Address, Credentials};

/// One stream under active management
#[derive(Debug, Clone, Serialize)]
pub struct ActiveStreamRegistration {
    pub key: StreamKey,
    pub payee: Address,
    pub rate_per_second: Amount,
    #[serde(skip)]
    pub credentials: Arc<Credentials>,
    /// Last successful claim by this process
    pub last_processed_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl ActiveStreamRegistration {
    pub fn new(
        key: StreamKey,
        payee: Address,
        rate_per_second: Amount,
        credentials: Credentials,
    ) -> Self {
        Self {
            key,
            payee,
            rate_per_second,
            credentials: Arc::new(credentials),
            last_processed_at: None,
            registered_at: Utc::now(),
        }
    }
}

/// Concurrent map keyed by [`StreamKey`].
///
/// Register/unregister may run while a tick iterates a snapshot; the tick
/// never holds a shard lock across an await.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: DashMap<StreamKey, ActiveStreamRegistration>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite. Returns `true` if the key was not registered.
    ///
    /// Overwriting keeps the previous `last_processed_at`. The read and the
    /// write happen under one shard lock.
    pub fn register(&self, mut registration: ActiveStreamRegistration) -> bool {
        match self.streams.entry(registration.key.clone()) {
            Entry::Occupied(mut existing) => {
                registration.last_processed_at = existing.get().last_processed_at;
                existing.insert(registration);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(registration);
                true
            }
        }
    }

    /// Returns `true` if an entry was removed
    pub fn unregister(&self, key: &StreamKey) -> bool {
        self.streams.remove(key).is_some()
    }

    /// Remove only the registration made at `registered_at`
    pub fn unregister_if_same(&self, key: &StreamKey, registered_at: DateTime<Utc>) -> bool {
        self.streams
            .remove_if(key, |_, current| current.registered_at == registered_at)
            .is_some()
    }

    pub fn contains(&self, key: &StreamKey) -> bool {
        self.streams.contains_key(key)
    }

    pub fn get(&self, key: &StreamKey) -> Option<ActiveStreamRegistration> {
        self.streams.get(key).map(|entry| entry.value().clone())
    }

    /// Point-in-time copy, ordered by key
    pub fn snapshot(&self) -> Vec<ActiveStreamRegistration> {
        let mut entries: Vec<_> = self
            .streams
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn keys(&self) -> Vec<StreamKey> {
        let mut keys: Vec<_> = self.streams.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Record a successful claim. No-op if the stream was unregistered meanwhile.
    pub fn mark_processed(&self, key: &StreamKey, at: DateTime<Utc>) -> bool {
        match self.streams.get_mut(key) {
            Some(mut entry) => {
                entry.last_processed_at = Some(at);
                true
            }
            None => false,
        }
    }
}
