//! CAS-based leader election.
//!
//! One leader per logical group, recorded under
//! `cluster:leader/<group_id>`. Acquisition is a single optimistic cycle:
//! read the current record, then either `put_if_absent` (no record) or
//! `compare_and_set` against the exact bytes just read (expired record, or
//! the caller already leads). Whoever wins the atomic write leads; every
//! loser simply observes "not acquired".
//!
//! Each successful acquisition increments the group's **term**, giving
//! downstream consumers a total order over leadership grants: any message
//! stamped with a lower term than the latest observed one is from a stale
//! leader and can be fenced out.
//!
//! Leases are not auto-released on crash. A crashed leader's record
//! simply expires, after which the next `try_acquire` wins with a higher
//! term, so the configured lease duration bounds worst-case
//! unavailability.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::clock::{add_duration, Clock, SystemClock};
use crate::metrics;
use crate::store::{self, ClusterStore, StoreEventType, StoreResult};

use super::{keys, require_id};

/// How a leader participates in its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElectionMode {
    /// The leader is the only node allowed to act for the group.
    Exclusive,
    /// The leader coordinates but followers keep warm state.
    Observer,
}

/// Snapshot of a group's current leadership grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderInfo {
    /// Logical group this grant applies to.
    pub group_id: String,
    /// Node currently holding leadership.
    pub leader_node_id: String,
    /// Participation mode requested at acquisition.
    pub mode: ElectionMode,
    /// Monotonically increasing grant counter for the group.
    pub term: u64,
    /// When this grant was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When this grant lapses unless re-acquired.
    pub lease_expires_at: DateTime<Utc>,
}

impl LeaderInfo {
    /// A grant is expired once its lease deadline has been reached.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at <= now
    }
}

/// Leader election service over a [`ClusterStore`].
pub struct LeaderElection {
    store: Arc<dyn ClusterStore>,
    clock: Arc<dyn Clock>,
}

impl LeaderElection {
    /// Create a service using the system clock.
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create a service with an injected clock.
    pub fn with_clock(store: Arc<dyn ClusterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Attempt to acquire (or extend) leadership of `group_id` for `node_id`.
    ///
    /// Returns the new grant on success, `Ok(None)` when another live
    /// leader holds the group or a concurrent caller won the race. The
    /// caller that already leads re-acquires with an incremented term,
    /// which is how leases are extended.
    pub async fn try_acquire(
        &self,
        group_id: &str,
        node_id: &str,
        mode: ElectionMode,
        lease: Duration,
    ) -> StoreResult<Option<LeaderInfo>> {
        require_id(group_id, "group_id")?;
        require_id(node_id, "node_id")?;

        let now = self.clock.now();
        let key = keys::leader_key(group_id);
        let current_bytes = self.store.get(&key).await?;

        let acquired = match current_bytes {
            None => {
                let desired = self.grant(group_id, node_id, mode, 1, now, lease)?;
                let encoded = store::encode(&desired)?;
                if self.store.put_if_absent(&key, encoded, lease).await? {
                    Some(desired)
                } else {
                    None
                }
            }
            Some(bytes) => {
                let current: LeaderInfo = store::decode(&bytes)?;
                if current.is_expired(now) || current.leader_node_id == node_id {
                    let desired =
                        self.grant(group_id, node_id, mode, current.term + 1, now, lease)?;
                    let encoded = store::encode(&desired)?;
                    if self
                        .store
                        .compare_and_set(&key, &bytes, encoded, lease)
                        .await?
                    {
                        Some(desired)
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
        };

        match &acquired {
            Some(grant) => {
                metrics::ELECTION_OUTCOMES
                    .with_label_values(&["acquired"])
                    .inc();
                info!(
                    group_id,
                    node_id,
                    term = grant.term,
                    lease_ms = lease.as_millis() as u64,
                    "Acquired leadership"
                );
            }
            None => {
                metrics::ELECTION_OUTCOMES
                    .with_label_values(&["contended"])
                    .inc();
                debug!(group_id, node_id, "Leadership not acquired");
            }
        }
        Ok(acquired)
    }

    /// Release leadership of `group_id` if `node_id` is the recorded leader.
    ///
    /// Returns `false` when no record exists or another node leads; the
    /// record is left untouched in that case.
    pub async fn release(&self, group_id: &str, node_id: &str) -> StoreResult<bool> {
        require_id(group_id, "group_id")?;
        require_id(node_id, "node_id")?;

        let key = keys::leader_key(group_id);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(false);
        };
        let current: LeaderInfo = store::decode(&bytes)?;
        if current.leader_node_id != node_id {
            debug!(
                group_id,
                node_id,
                leader = %current.leader_node_id,
                "Refusing release by non-leader"
            );
            return Ok(false);
        }

        let deleted = self.store.delete(&key).await?;
        if deleted {
            metrics::ELECTION_OUTCOMES
                .with_label_values(&["released"])
                .inc();
            info!(group_id, node_id, "Released leadership");
        }
        Ok(deleted)
    }

    /// Current leader of `group_id`, lazily deleting an expired record.
    pub async fn get_leader(&self, group_id: &str) -> StoreResult<Option<LeaderInfo>> {
        require_id(group_id, "group_id")?;

        let now = self.clock.now();
        let key = keys::leader_key(group_id);
        let Some(bytes) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let current: LeaderInfo = store::decode(&bytes)?;
        if current.is_expired(now) {
            self.store.delete(&key).await?;
            return Ok(None);
        }
        Ok(Some(current))
    }

    /// Subscribe to leadership changes for `group_id`.
    ///
    /// Spawns a forwarder that decodes every `Put` on the leader key and
    /// delivers the resulting [`LeaderInfo`]. The channel closes when the
    /// store's watch stream ends or the receiver is dropped.
    pub fn watch(&self, group_id: &str) -> mpsc::Receiver<LeaderInfo> {
        let mut events = self.store.watch(&keys::leader_key(group_id));
        let (tx, rx) = mpsc::channel(16);
        let group = group_id.to_string();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if event.event_type != StoreEventType::Put {
                            continue;
                        }
                        let Some(value) = event.value else { continue };
                        match store::decode::<LeaderInfo>(&value) {
                            Ok(info) => {
                                if tx.send(info).await.is_err() {
                                    break;
                                }
                            }
                            Err(error) => {
                                warn!(group = %group, %error, "Undecodable leader record in watch stream");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(group = %group, skipped, "Leader watch lagged; continuing");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }

    fn grant(
        &self,
        group_id: &str,
        node_id: &str,
        mode: ElectionMode,
        term: u64,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> StoreResult<LeaderInfo> {
        Ok(LeaderInfo {
            group_id: group_id.to_string(),
            leader_node_id: node_id.to_string(),
            mode,
            term,
            acquired_at: now,
            lease_expires_at: add_duration(now, lease, "lease")?,
        })
    }
}
