//! Lease-based distributed locks.
//!
//! Same optimistic CAS pattern as leader election, minus the term counter
//! and plus caller-supplied metadata. A lock is held by exactly one owner
//! at a time, is re-entrant for that owner, and exists only while its
//! lease is live or until explicitly released. An expired lock is
//! free-for-all: the next caller to win the CAS becomes the new owner with
//! a fresh lease window — no grace period is modeled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::{add_duration, Clock, SystemClock};
use crate::metrics;
use crate::store::{self, ClusterStore, StoreResult};

use super::{keys, require_id};

/// Snapshot of a named lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Lock name.
    pub name: String,
    /// Node currently holding the lock.
    pub owner_node_id: String,
    /// When the lease lapses unless refreshed.
    pub lease_expires_at: DateTime<Utc>,
    /// Caller-supplied metadata carried with the record.
    pub metadata: HashMap<String, String>,
}

impl LockRecord {
    /// A lock is expired once its lease deadline has been reached.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at <= now
    }
}

/// Distributed lock service over a [`ClusterStore`].
pub struct DistributedLock {
    store: Arc<dyn ClusterStore>,
    clock: Arc<dyn Clock>,
}

impl DistributedLock {
    /// Create a service using the system clock.
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create a service with an injected clock.
    pub fn with_clock(store: Arc<dyn ClusterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Attempt to acquire `name` for `owner_node_id`.
    ///
    /// Succeeds when the lock is absent, expired, or already held by the
    /// caller (re-entrant, which also resets the lease window). Returns
    /// `Ok(None)` when another live owner holds it or a concurrent caller
    /// won the CAS race.
    pub async fn try_acquire(
        &self,
        name: &str,
        owner_node_id: &str,
        lease: Duration,
        metadata: HashMap<String, String>,
    ) -> StoreResult<Option<LockRecord>> {
        require_id(name, "name")?;
        require_id(owner_node_id, "owner_node_id")?;

        let now = self.clock.now();
        let key = keys::lock_key(name);
        let desired = LockRecord {
            name: name.to_string(),
            owner_node_id: owner_node_id.to_string(),
            lease_expires_at: add_duration(now, lease, "lease")?,
            metadata,
        };

        let acquired = match self.store.get(&key).await? {
            None => {
                let encoded = store::encode(&desired)?;
                self.store.put_if_absent(&key, encoded, lease).await?
            }
            Some(bytes) => {
                let current: LockRecord = store::decode(&bytes)?;
                if current.is_expired(now) || current.owner_node_id == owner_node_id {
                    let encoded = store::encode(&desired)?;
                    self.store
                        .compare_and_set(&key, &bytes, encoded, lease)
                        .await?
                } else {
                    false
                }
            }
        };

        if acquired {
            metrics::LOCK_OUTCOMES.with_label_values(&["acquired"]).inc();
            info!(
                lock = name,
                owner = owner_node_id,
                lease_ms = lease.as_millis() as u64,
                "Acquired lock"
            );
            Ok(Some(desired))
        } else {
            metrics::LOCK_OUTCOMES
                .with_label_values(&["contended"])
                .inc();
            debug!(lock = name, owner = owner_node_id, "Lock not acquired");
            Ok(None)
        }
    }

    /// Extend the lease of a lock the caller currently owns.
    ///
    /// Only succeeds when the record exists, is not expired, and is owned
    /// by the caller. The CAS against the exact read snapshot protects
    /// against a concurrent takeover between read and write.
    pub async fn refresh(
        &self,
        name: &str,
        owner_node_id: &str,
        lease: Duration,
    ) -> StoreResult<Option<LockRecord>> {
        require_id(name, "name")?;
        require_id(owner_node_id, "owner_node_id")?;

        let now = self.clock.now();
        let key = keys::lock_key(name);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let current: LockRecord = store::decode(&bytes)?;
        if current.owner_node_id != owner_node_id || current.is_expired(now) {
            return Ok(None);
        }

        let refreshed = LockRecord {
            name: name.to_string(),
            owner_node_id: owner_node_id.to_string(),
            lease_expires_at: add_duration(now, lease, "lease")?,
            metadata: current.metadata,
        };
        let encoded = store::encode(&refreshed)?;
        if self
            .store
            .compare_and_set(&key, &bytes, encoded, lease)
            .await?
        {
            metrics::LOCK_OUTCOMES
                .with_label_values(&["refreshed"])
                .inc();
            debug!(lock = name, owner = owner_node_id, "Refreshed lock lease");
            Ok(Some(refreshed))
        } else {
            Ok(None)
        }
    }

    /// Release a lock the caller currently owns.
    ///
    /// An expired lock is implicitly "not owned": release returns `false`
    /// without deleting, so a successor that re-acquired after expiry
    /// never loses its record to a stale owner.
    pub async fn release(&self, name: &str, owner_node_id: &str) -> StoreResult<bool> {
        require_id(name, "name")?;
        require_id(owner_node_id, "owner_node_id")?;

        let now = self.clock.now();
        let key = keys::lock_key(name);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(false);
        };
        let current: LockRecord = store::decode(&bytes)?;
        if current.owner_node_id != owner_node_id || current.is_expired(now) {
            debug!(
                lock = name,
                caller = owner_node_id,
                owner = %current.owner_node_id,
                "Refusing release"
            );
            return Ok(false);
        }

        let deleted = self.store.delete(&key).await?;
        if deleted {
            metrics::LOCK_OUTCOMES.with_label_values(&["released"]).inc();
            info!(lock = name, owner = owner_node_id, "Released lock");
        }
        Ok(deleted)
    }

    /// Read-only snapshot of a single lock record, expired or not.
    pub async fn get_lock(&self, name: &str) -> StoreResult<Option<LockRecord>> {
        require_id(name, "name")?;
        match self.store.get(&keys::lock_key(name)).await? {
            None => Ok(None),
            Some(bytes) => Ok(Some(store::decode(&bytes)?)),
        }
    }

    /// Snapshot of all live lock records, keyed by lock name.
    pub async fn snapshot(&self) -> StoreResult<HashMap<String, LockRecord>> {
        let now = self.clock.now();
        let mut locks = HashMap::new();
        for (_, bytes) in self.store.scan(keys::LOCK_PREFIX).await? {
            let record: LockRecord = store::decode(&bytes)?;
            if !record.is_expired(now) {
                locks.insert(record.name.clone(), record);
            }
        }
        Ok(locks)
    }
}
