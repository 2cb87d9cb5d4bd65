//! In-memory [`ClusterStore`] backend.
//!
//! Reference implementation used by tests and single-node deployments.
//! Entries expire lazily: an entry past its TTL is collected by the next
//! read, scan, or conditional write that touches it, and an
//! [`StoreEventType::Expire`] event is published when that happens. This
//! mirrors how lease-based records are reaped in the replicated backends:
//! nothing runs a timer per key.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use crate::clock::{add_duration, Clock, SystemClock};

use super::{ClusterStore, StoreEvent, StoreEventType, StoreResult};

const WATCH_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Bytes,
    expires_at: DateTime<Utc>,
}

impl StoredValue {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// DashMap-backed store with clock-driven TTLs and prefix watch channels.
pub struct InMemoryStore {
    entries: DashMap<String, StoredValue>,
    watchers: Mutex<Vec<(String, broadcast::Sender<StoreEvent>)>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    /// Create a store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store with an injected clock (manual clocks in tests).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            watchers: Mutex::new(Vec::new()),
            clock,
        }
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .count()
    }

    /// Whether the store holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, event: StoreEvent) {
        let watchers = self.watchers.lock().expect("watcher registry poisoned");
        for (prefix, sender) in watchers.iter() {
            if event.key.starts_with(prefix.as_str()) {
                // A send error only means no subscriber is currently listening.
                let _ = sender.send(event.clone());
            }
        }
    }

    fn collect_expired(&self, key: &str, now: DateTime<Utc>) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, stored| stored.is_expired(now))
            .is_some();
        if removed {
            trace!(key, "Collected expired entry");
            self.publish(StoreEvent {
                event_type: StoreEventType::Expire,
                key: key.to_string(),
                value: None,
            });
        }
        removed
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl ClusterStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let now = self.clock.now();
        let snapshot = self
            .entries
            .get(key)
            .map(|entry| (entry.value.clone(), entry.expires_at));

        match snapshot {
            None => Ok(None),
            Some((_, expires_at)) if expires_at <= now => {
                self.collect_expired(key, now);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
        }
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> StoreResult<()> {
        let now = self.clock.now();
        let stored = StoredValue {
            value: value.clone(),
            expires_at: add_duration(now, ttl, "ttl")?,
        };
        self.entries.insert(key.to_string(), stored);
        self.publish(StoreEvent {
            event_type: StoreEventType::Put,
            key: key.to_string(),
            value: Some(value),
        });
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> StoreResult<bool> {
        let now = self.clock.now();
        let expires_at = add_duration(now, ttl, "ttl")?;

        let inserted = match self.entries.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue {
                    value: value.clone(),
                    expires_at,
                });
                true
            }
            Entry::Occupied(mut occupied) => {
                // An expired occupant counts as absent.
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredValue {
                        value: value.clone(),
                        expires_at,
                    });
                    true
                } else {
                    false
                }
            }
        };

        if inserted {
            self.publish(StoreEvent {
                event_type: StoreEventType::Put,
                key: key.to_string(),
                value: Some(value),
            });
        }
        Ok(inserted)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &[u8],
        new_value: Bytes,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = self.clock.now();
        let expires_at = add_duration(now, ttl, "ttl")?;

        let swapped = match self.entries.entry(key.to_string()) {
            // An absent key never matches a non-absent expected value.
            Entry::Vacant(_) => false,
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.remove();
                    false
                } else if occupied.get().value.as_ref() == expected {
                    occupied.insert(StoredValue {
                        value: new_value.clone(),
                        expires_at,
                    });
                    true
                } else {
                    false
                }
            }
        };

        if swapped {
            self.publish(StoreEvent {
                event_type: StoreEventType::Put,
                key: key.to_string(),
                value: Some(new_value),
            });
        }
        Ok(swapped)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        match self.entries.remove(key) {
            None => Ok(false),
            Some((_, stored)) if stored.is_expired(now) => {
                self.publish(StoreEvent {
                    event_type: StoreEventType::Expire,
                    key: key.to_string(),
                    value: None,
                });
                Ok(false)
            }
            Some(_) => {
                self.publish(StoreEvent {
                    event_type: StoreEventType::Delete,
                    key: key.to_string(),
                    value: None,
                });
                Ok(true)
            }
        }
    }

    async fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, Bytes)>> {
        let now = self.clock.now();
        let mut live = Vec::new();
        let mut expired = Vec::new();

        for entry in self.entries.iter() {
            if !entry.key().starts_with(prefix) {
                continue;
            }
            if entry.value().is_expired(now) {
                expired.push(entry.key().clone());
            } else {
                live.push((entry.key().clone(), entry.value().value.clone()));
            }
        }

        for key in expired {
            self.collect_expired(&key, now);
        }

        live.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(live)
    }

    fn watch(&self, prefix: &str) -> broadcast::Receiver<StoreEvent> {
        let mut watchers = self.watchers.lock().expect("watcher registry poisoned");
        watchers.retain(|(_, sender)| sender.receiver_count() > 0);

        if let Some((_, sender)) = watchers.iter().find(|(p, _)| p == prefix) {
            return sender.subscribe();
        }
        let (sender, receiver) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        watchers.push((prefix.to_string(), sender));
        receiver
    }
}
