//! Work assignments and affinity-kind change notification.
//!
//! An external assignment authority (rebalancer, operator tooling, a
//! leader-driven planner) distributes partitions of work across nodes and
//! publishes [`TopologyEvent`]s when the distribution changes. The
//! workflow engine does not consume assignments directly; it only cares
//! about the **affinity kind** the cluster is currently routing by.
//! [`AffinityKindMonitor`] bridges the two: it observes topology events,
//! deduplicates the kind they imply, and invokes a callback exactly once
//! per change so the surrounding runtime can re-bind its workflows.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const TOPOLOGY_CHANNEL_CAPACITY: usize = 64;

/// Assignment of one partition of work to an owner node.
///
/// `key_bindings` maps each routing kind to the key values the owner is
/// responsible for; the map is ordered so the primary kind is stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    /// Assignment group this entry belongs to.
    pub group_id: String,
    /// Partition number within the group.
    pub partition: i32,
    /// Node that owns the partition.
    pub owner_node_id: String,
    /// Routing kind → key values bound to this partition.
    pub key_bindings: BTreeMap<String, Vec<String>>,
    /// Monotonic generation of the assignment plan.
    pub generation: u64,
    /// When the assignment was produced.
    pub updated_at: DateTime<Utc>,
}

impl Assignment {
    /// Key values bound for a given routing kind (empty when unbound).
    pub fn binding_values(&self, kind: &str) -> &[String] {
        self.key_bindings
            .get(kind)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The first (primary) routing kind of this assignment, if any.
    pub fn primary_kind(&self) -> Option<&str> {
        self.key_bindings.keys().next().map(String::as_str)
    }
}

/// Change notification emitted when the work distribution changes.
#[derive(Debug, Clone)]
pub enum TopologyEvent {
    /// A partition assignment was created or replaced.
    Assigned(Assignment),
    /// A standalone key binding changed outside a full assignment.
    KeysBound {
        /// Routing kind the binding applies to.
        kind: String,
        /// Key values now bound.
        values: Vec<String>,
    },
}

impl TopologyEvent {
    fn implied_kind(&self) -> Option<&str> {
        match self {
            TopologyEvent::Assigned(assignment) => assignment.primary_kind(),
            TopologyEvent::KeysBound { kind, .. } => Some(kind.as_str()),
        }
    }
}

/// Source of assignments and topology change events.
///
/// Implementations are external collaborators; this crate ships an
/// in-memory variant for wiring and tests.
pub trait AssignmentService: Send + Sync {
    /// Subscribe to topology change events.
    fn topology_events(&self) -> broadcast::Receiver<TopologyEvent>;

    /// Current assignments, in no particular order.
    fn assignments(&self) -> Vec<Assignment>;
}

/// In-memory [`AssignmentService`] for tests and single-node setups.
pub struct InMemoryAssignmentService {
    assignments: DashMap<(String, i32), Assignment>,
    events: broadcast::Sender<TopologyEvent>,
}

impl InMemoryAssignmentService {
    /// Create an empty service.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(TOPOLOGY_CHANNEL_CAPACITY);
        Self {
            assignments: DashMap::new(),
            events,
        }
    }

    /// Store an assignment and broadcast the change.
    pub fn publish(&self, assignment: Assignment) {
        debug!(
            group_id = %assignment.group_id,
            partition = assignment.partition,
            owner = %assignment.owner_node_id,
            generation = assignment.generation,
            "Publishing assignment"
        );
        self.assignments.insert(
            (assignment.group_id.clone(), assignment.partition),
            assignment.clone(),
        );
        let _ = self.events.send(TopologyEvent::Assigned(assignment));
    }

    /// Broadcast a standalone key binding change.
    pub fn bind_keys(&self, kind: impl Into<String>, values: Vec<String>) {
        let kind = kind.into();
        let _ = self.events.send(TopologyEvent::KeysBound { kind, values });
    }
}

impl Default for InMemoryAssignmentService {
    fn default() -> Self {
        Self::new()
    }
}

impl AssignmentService for InMemoryAssignmentService {
    fn topology_events(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    fn assignments(&self) -> Vec<Assignment> {
        self.assignments
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// Watches topology events and reports affinity-kind changes exactly once.
///
/// The callback receives the new kind whenever the kind implied by a
/// topology event differs from the last one observed. Consumers typically
/// wire it to `WorkflowEngine::update_affinity_kind` followed by
/// `WorkflowRuntime::rebind_all`.
pub struct AffinityKindMonitor {
    last_kind: Arc<Mutex<Option<String>>>,
    task: JoinHandle<()>,
}

impl AffinityKindMonitor {
    /// Start watching `service`, invoking `callback` on each kind change.
    pub fn new<F>(service: &dyn AssignmentService, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut events = service.topology_events();
        let last_kind = Arc::new(Mutex::new(None::<String>));
        let observed = Arc::clone(&last_kind);

        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(kind) = event.implied_kind() else {
                            continue;
                        };
                        let changed = {
                            let mut last = observed.lock().expect("kind mutex poisoned");
                            if last.as_deref() == Some(kind) {
                                false
                            } else {
                                *last = Some(kind.to_string());
                                true
                            }
                        };
                        if changed {
                            info!(kind, "Affinity kind changed");
                            callback(kind);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self { last_kind, task }
    }

    /// The last affinity kind observed, if any.
    pub fn last_kind(&self) -> Option<String> {
        self.last_kind.lock().expect("kind mutex poisoned").clone()
    }

    /// Stop watching.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for AffinityKindMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
