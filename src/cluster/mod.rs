//! Cluster coordination built on the [`ClusterStore`](crate::store::ClusterStore) CAS contract.
//!
//! This module provides everything a cohort of workflow nodes needs to
//! agree on who owns what:
//! - **Leader election** ([`LeaderElection`]): one leader per logical
//!   group, fenced by a monotonically increasing term.
//! - **Distributed locks** ([`DistributedLock`]): named, lease-based
//!   mutual exclusion with caller-supplied metadata.
//! - **Membership** ([`Membership`]): heartbeat-driven failure detection
//!   with an Active → Suspect → Down state machine and an event stream.
//! - **Assignments** ([`AssignmentService`], [`AffinityKindMonitor`]):
//!   topology change notifications that drive the workflow engine's
//!   affinity re-binding.
//!
//! # Architecture
//!
//! ```text
//!        node A                node B                node C
//!   ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//!   │ election     │     │ election     │     │ election     │
//!   │ locks        │     │ locks        │     │ locks        │
//!   │ membership   │     │ membership   │     │ membership   │
//!   └──────┬───────┘     └──────┬───────┘     └──────┬───────┘
//!          │    read / putIfAbsent / compareAndSet   │
//!          └──────────────────┬──────────────────────┘
//!                             ▼
//!                     ┌───────────────┐
//!                     │ ClusterStore  │  (linearizable CAS)
//!                     └───────────────┘
//! ```
//!
//! Every mutation follows the same optimistic pattern: read the current
//! record, decide locally, and write back with the read snapshot as the
//! CAS expected value. A lost race surfaces as "not acquired", never as an
//! error. Nothing here caches authoritative state beyond a single
//! read-modify-CAS cycle, and nothing auto-releases on crash: leases
//! expire, and expiry is the sole healing mechanism.

pub mod assignment;
pub mod election;
pub mod heartbeat;
pub mod keys;
pub mod lock;
pub mod membership;
pub mod retry;

pub use assignment::{
    AffinityKindMonitor, Assignment, AssignmentService, InMemoryAssignmentService, TopologyEvent,
};
pub use election::{ElectionMode, LeaderElection, LeaderInfo};
pub use heartbeat::HeartbeatMonitor;
pub use lock::{DistributedLock, LockRecord};
pub use membership::{
    ClusterNode, ClusterNodeRecord, Membership, MembershipConfig, MembershipEvent,
    MembershipEventType, NodeStatus,
};

use crate::store::{StoreError, StoreResult};

/// Reject blank identifiers before any store round-trip.
pub(crate) fn require_id(value: &str, name: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::InvalidArgument(format!(
            "{name} must not be empty"
        )));
    }
    Ok(())
}
