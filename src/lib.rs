//! # Keyflow
//! Framework for building clustered, stream-processing workflow nodes.
//!
//! A keyflow node ingests records, runs them through handler/pipeline
//! stages, and writes results, while a cohort of such nodes coordinates
//! ownership of work through a shared compare-and-swap key/value store.
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/)
//! - Coordination without a bundled consensus engine: any store that can
//!   do an atomic compare-and-swap works as a backend
//! - Per-key ordered, globally concurrent workflow execution
//!
//! # Architecture
//!
//! ```text
//!   ┌────────┐   ┌─────────────────────────────────┐   ┌──────┐
//!   │ Source │──▶│ handlers ▶ steps ▶ sink handlers │──▶│ Sink │
//!   └────────┘   └─────────────────────────────────┘   └──────┘
//!                     per-affinity-key workers
//!                              │
//!                ┌─────────────┴─────────────┐
//!                │    cluster coordination    │
//!                │ election · locks · members │
//!                └─────────────┬─────────────┘
//!                              ▼
//!                    ┌──────────────────┐
//!                    │  ClusterStore    │ ← CAS key/value contract
//!                    └──────────────────┘
//! ```
//!
//! The coordination layer ([`cluster`]) provides lease-based leader
//! election, distributed locks, and a heartbeat-driven membership service,
//! all built on the [`store::ClusterStore`] contract. The execution layer
//! ([`workflow`]) schedules immutable [`workflow::Context`] values through
//! pipeline stages with strict FIFO ordering per affinity key and a
//! configurable backpressure policy.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use keyflow::cluster::{ElectionMode, LeaderElection};
//! use keyflow::store::InMemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryStore::new());
//!     let election = LeaderElection::new(store);
//!
//!     let lease = Duration::from_secs(30);
//!     if let Some(leader) = election
//!         .try_acquire("ingest", "node-1", ElectionMode::Exclusive, lease)
//!         .await?
//!     {
//!         println!("acquired leadership at term {}", leader.term);
//!     }
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod clock;
pub mod cluster;
pub mod metrics;
pub mod store;
pub mod telemetry;
pub mod workflow;

pub mod prelude {
    //! Commonly used types, re-exported for convenience.
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::cluster::{
        Assignment, ClusterNode, DistributedLock, ElectionMode, LeaderElection, LeaderInfo,
        LockRecord, Membership, MembershipConfig, MembershipEvent, MembershipEventType, NodeStatus,
    };
    pub use crate::store::{ClusterStore, InMemoryStore, StoreError, StoreResult};
    pub use crate::workflow::{
        Affinity, BackpressurePolicy, BatchingOptions, Context, EngineError, PipelineStep, Sink,
        Source, Workflow, WorkflowEngine, WorkflowGraph, WorkflowRuntime,
    };
}
