//! Heartbeat-driven cluster membership and failure detection.
//!
//! Each node registers itself under `cluster:nodes/<node_id>` and keeps
//! its record fresh with heartbeats. Liveness is evaluated by a single
//! periodic sweep ([`Membership::detect_timeouts`]) as a pure function of
//! `now - last_heartbeat_at` against two configured thresholds:
//!
//! 1. **Active** — heartbeats arriving on time
//! 2. **Suspect** — `heartbeat_timeout` elapsed (potential network blip)
//! 3. **Down** — `suspect_timeout` elapsed since the last heartbeat
//!
//! A sweep moves a node through at most one transition, so consumers
//! always observe `Suspected` before `Down`, even when both thresholds
//! have long elapsed. The suspect state exists to absorb transient
//! network issues: a heartbeat received while Suspect resets the node to
//! Active without ever reporting it Down.
//!
//! There are no per-node timers; an external scheduler (see
//! [`HeartbeatMonitor`](super::HeartbeatMonitor)) invokes the sweep
//! periodically, and tests drive it with a manual clock.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::metrics;
use crate::store::{self, ClusterStore, StoreError, StoreResult};

use super::{keys, require_id};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Liveness state of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    /// Heartbeats received on time.
    Active,
    /// Heartbeat timeout elapsed; the node may be gone or just slow.
    Suspect,
    /// Suspect timeout elapsed; the node is considered failed.
    Down,
    /// The node deregistered gracefully.
    Left,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Active => write!(f, "active"),
            NodeStatus::Suspect => write!(f, "suspect"),
            NodeStatus::Down => write!(f, "down"),
            NodeStatus::Left => write!(f, "left"),
        }
    }
}

/// Static identity and placement of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Unique node identifier.
    pub node_id: String,
    /// Reachable host name or address.
    pub host: String,
    /// Service port.
    pub port: u16,
    /// Roles this node volunteers for.
    pub roles: BTreeSet<String>,
    /// Failure domain, if placement-aware scheduling is used.
    pub zone: Option<String>,
    /// Free-form node metadata.
    pub metadata: HashMap<String, String>,
    /// Software version advertised by the node.
    pub version: Option<String>,
}

impl ClusterNode {
    /// Create a node identity with empty roles and metadata.
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            roles: BTreeSet::new(),
            zone: None,
            metadata: HashMap::new(),
            version: None,
        }
    }

    /// Add a role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Set the failure zone.
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    /// Set the advertised version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A node identity plus its tracked liveness state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNodeRecord {
    /// Static node identity.
    pub node: ClusterNode,
    /// Current liveness state.
    pub status: NodeStatus,
    /// When the node first joined (or last rejoined).
    pub joined_at: DateTime<Utc>,
    /// When the last heartbeat was observed.
    pub last_heartbeat_at: DateTime<Utc>,
}

impl ClusterNodeRecord {
    fn with_status(&self, status: NodeStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

/// Kind of membership observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEventType {
    /// A node joined (or implicitly rejoined after Down).
    Joined,
    /// A heartbeat was recorded.
    Heartbeat,
    /// A node crossed the heartbeat timeout.
    Suspected,
    /// A node crossed the suspect timeout.
    Down,
    /// A node deregistered gracefully.
    Left,
    /// A node record was removed from the registry.
    Removed,
}

impl MembershipEventType {
    fn as_label(&self) -> &'static str {
        match self {
            MembershipEventType::Joined => "joined",
            MembershipEventType::Heartbeat => "heartbeat",
            MembershipEventType::Suspected => "suspected",
            MembershipEventType::Down => "down",
            MembershipEventType::Left => "left",
            MembershipEventType::Removed => "removed",
        }
    }
}

/// Membership observation delivered to subscribers.
///
/// Events form an append-only observation stream; they are not persisted.
#[derive(Debug, Clone)]
pub struct MembershipEvent {
    /// What was observed.
    pub event_type: MembershipEventType,
    /// Node record snapshot at observation time.
    pub record: ClusterNodeRecord,
    /// When the observation was made.
    pub timestamp: DateTime<Utc>,
}

/// Timing configuration for the failure detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipConfig {
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    suspect_timeout: Duration,
}

impl MembershipConfig {
    /// Validate and build a configuration.
    ///
    /// `heartbeat_timeout` is the Active → Suspect threshold;
    /// `suspect_timeout` is the Suspect → Down threshold, measured from
    /// the last heartbeat (not from suspicion time), so it must exceed
    /// `heartbeat_timeout`.
    pub fn new(
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
        suspect_timeout: Duration,
    ) -> StoreResult<Self> {
        if heartbeat_interval.is_zero() {
            return Err(StoreError::InvalidArgument(
                "heartbeat_interval must be > 0".into(),
            ));
        }
        if heartbeat_timeout.is_zero() {
            return Err(StoreError::InvalidArgument(
                "heartbeat_timeout must be > 0".into(),
            ));
        }
        if suspect_timeout <= heartbeat_timeout {
            return Err(StoreError::InvalidArgument(
                "suspect_timeout must exceed heartbeat_timeout".into(),
            ));
        }
        Ok(Self {
            heartbeat_interval,
            heartbeat_timeout,
            suspect_timeout,
        })
    }

    /// Defaults: 5s interval, 15s suspect threshold, 30s down threshold.
    pub fn defaults() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            suspect_timeout: Duration::from_secs(30),
        }
    }

    /// How often nodes should heartbeat.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Active → Suspect threshold.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Suspect → Down threshold, from the last heartbeat.
    pub fn suspect_timeout(&self) -> Duration {
        self.suspect_timeout
    }

    /// TTL applied to node records, comfortably past the Down threshold so
    /// the store eventually collects nodes nobody sweeps anymore.
    fn record_ttl(&self) -> Duration {
        self.suspect_timeout + self.heartbeat_interval
    }
}

/// Membership service over a [`ClusterStore`].
pub struct Membership {
    store: Arc<dyn ClusterStore>,
    config: MembershipConfig,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<MembershipEvent>,
}

impl Membership {
    /// Create a service using the system clock.
    pub fn new(store: Arc<dyn ClusterStore>, config: MembershipConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create a service with an injected clock.
    pub fn with_clock(
        store: Arc<dyn ClusterStore>,
        config: MembershipConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            config,
            clock,
            events,
        }
    }

    /// Timing configuration in effect.
    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// Register (or overwrite) a node as Active and emit `Joined`.
    pub async fn join(&self, node: ClusterNode) -> StoreResult<ClusterNodeRecord> {
        require_id(&node.node_id, "node_id")?;

        let now = self.clock.now();
        let record = ClusterNodeRecord {
            node,
            status: NodeStatus::Active,
            joined_at: now,
            last_heartbeat_at: now,
        };
        self.put_record(&record).await?;
        info!(node_id = %record.node.node_id, "Node joined cluster");
        self.emit(MembershipEventType::Joined, record.clone(), now);
        Ok(record)
    }

    /// Record a heartbeat for a known node.
    ///
    /// Resets a Suspect node to Active. A heartbeat from a Down node is
    /// treated as an implicit rejoin: the record returns to Active and a
    /// `Joined` event is emitted, so observers see the same signal as for
    /// an explicit join. A Left node stays Left. Unknown nodes are a
    /// precondition violation.
    pub async fn heartbeat(&self, node_id: &str) -> StoreResult<ClusterNodeRecord> {
        require_id(node_id, "node_id")?;

        let now = self.clock.now();
        let Some(bytes) = self.store.get(&keys::node_key(node_id)).await? else {
            return Err(StoreError::NotFound(format!("node not registered: {node_id}")));
        };
        let current: ClusterNodeRecord = store::decode(&bytes)?;

        let (status, event_type, joined_at) = match current.status {
            NodeStatus::Left => (NodeStatus::Left, MembershipEventType::Heartbeat, current.joined_at),
            NodeStatus::Down => (NodeStatus::Active, MembershipEventType::Joined, now),
            NodeStatus::Suspect => {
                debug!(node_id, "Node recovered from suspect state");
                (NodeStatus::Active, MembershipEventType::Heartbeat, current.joined_at)
            }
            NodeStatus::Active => {
                (NodeStatus::Active, MembershipEventType::Heartbeat, current.joined_at)
            }
        };

        let updated = ClusterNodeRecord {
            node: current.node,
            status,
            joined_at,
            last_heartbeat_at: now,
        };
        self.put_record(&updated).await?;
        self.emit(event_type, updated.clone(), now);
        Ok(updated)
    }

    /// Mark a node as gracefully departed and emit `Left`.
    ///
    /// Left nodes are exempt from timeout transitions and their record is
    /// kept only briefly for observers to notice the departure.
    pub async fn leave(&self, node_id: &str) -> StoreResult<()> {
        require_id(node_id, "node_id")?;

        let now = self.clock.now();
        let Some(bytes) = self.store.get(&keys::node_key(node_id)).await? else {
            return Ok(());
        };
        let current: ClusterNodeRecord = store::decode(&bytes)?;
        let updated = current.with_status(NodeStatus::Left);
        let encoded = store::encode(&updated)?;
        self.store
            .put(
                &keys::node_key(node_id),
                encoded,
                self.config.heartbeat_timeout,
            )
            .await?;
        info!(node_id, "Node left cluster");
        self.emit(MembershipEventType::Left, updated, now);
        Ok(())
    }

    /// Remove a node record entirely and emit `Removed` if it existed.
    pub async fn remove(&self, node_id: &str) -> StoreResult<bool> {
        require_id(node_id, "node_id")?;

        let existing = match self.store.get(&keys::node_key(node_id)).await? {
            Some(bytes) => Some(store::decode::<ClusterNodeRecord>(&bytes)?),
            None => None,
        };
        let deleted = self.store.delete(&keys::node_key(node_id)).await?;
        if deleted {
            if let Some(record) = existing {
                self.emit(MembershipEventType::Removed, record, self.clock.now());
            }
        }
        Ok(deleted)
    }

    /// Look up a single node record.
    pub async fn find_node(&self, node_id: &str) -> StoreResult<Option<ClusterNodeRecord>> {
        require_id(node_id, "node_id")?;
        match self.store.get(&keys::node_key(node_id)).await? {
            None => Ok(None),
            Some(bytes) => Ok(Some(store::decode(&bytes)?)),
        }
    }

    /// Snapshot of all tracked nodes, keyed by node id.
    pub async fn view(&self) -> StoreResult<HashMap<String, ClusterNodeRecord>> {
        let mut view = HashMap::new();
        for (_, bytes) in self.store.scan(keys::NODES_PREFIX).await? {
            let record: ClusterNodeRecord = store::decode(&bytes)?;
            view.insert(record.node.node_id.clone(), record);
        }
        Ok(view)
    }

    /// Sweep all tracked nodes and apply timeout transitions.
    ///
    /// Idempotent; intended to be invoked periodically. Each call moves a
    /// node through at most one transition: an Active node whose heartbeat
    /// is older than `heartbeat_timeout` becomes Suspect, a Suspect node
    /// whose heartbeat is older than `suspect_timeout` becomes Down. Never
    /// Active → Down in a single sweep, so `Suspected` is always observed
    /// before `Down`.
    pub async fn detect_timeouts(&self) -> StoreResult<Vec<MembershipEvent>> {
        let now = self.clock.now();
        let suspect_after = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .map_err(|_| StoreError::InvalidArgument("heartbeat_timeout out of range".into()))?;
        let down_after = chrono::Duration::from_std(self.config.suspect_timeout)
            .map_err(|_| StoreError::InvalidArgument("suspect_timeout out of range".into()))?;

        let mut transitions = Vec::new();
        for (_, bytes) in self.store.scan(keys::NODES_PREFIX).await? {
            let record: ClusterNodeRecord = store::decode(&bytes)?;
            let elapsed = now.signed_duration_since(record.last_heartbeat_at);

            let next = match record.status {
                NodeStatus::Active if elapsed >= suspect_after => Some((
                    NodeStatus::Suspect,
                    MembershipEventType::Suspected,
                )),
                NodeStatus::Suspect if elapsed >= down_after => {
                    Some((NodeStatus::Down, MembershipEventType::Down))
                }
                _ => None,
            };

            let Some((status, event_type)) = next else {
                continue;
            };

            let updated = record.with_status(status);
            self.put_record(&updated).await?;

            match status {
                NodeStatus::Down => warn!(
                    node_id = %updated.node.node_id,
                    elapsed_ms = elapsed.num_milliseconds(),
                    "Node declared DOWN"
                ),
                _ => info!(
                    node_id = %updated.node.node_id,
                    elapsed_ms = elapsed.num_milliseconds(),
                    "Node suspected of failure"
                ),
            }

            let event = MembershipEvent {
                event_type,
                record: updated,
                timestamp: now,
            };
            self.broadcast(event.clone());
            transitions.push(event);
        }
        Ok(transitions)
    }

    /// Subscribe to the membership event stream.
    pub fn events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    async fn put_record(&self, record: &ClusterNodeRecord) -> StoreResult<()> {
        let encoded = store::encode(record)?;
        self.store
            .put(
                &keys::node_key(&record.node.node_id),
                encoded,
                self.config.record_ttl(),
            )
            .await
    }

    fn emit(&self, event_type: MembershipEventType, record: ClusterNodeRecord, now: DateTime<Utc>) {
        self.broadcast(MembershipEvent {
            event_type,
            record,
            timestamp: now,
        });
    }

    fn broadcast(&self, event: MembershipEvent) {
        metrics::MEMBERSHIP_EVENTS
            .with_label_values(&[event.event_type.as_label()])
            .inc();
        // A send error only means no subscriber is currently listening.
        let _ = self.events.send(event);
    }
}
