//! Per-key ordered, backpressure-aware workflow execution.
//!
//! A workflow is a linear chain `Source → handlers → steps → sink
//! handlers → Sink` described by a [`WorkflowGraph`] and executed by the
//! [`WorkflowEngine`]. The engine routes every [`Context`] by its affinity
//! key and runs one logical worker per distinct `(kind, value)` pair:
//!
//! - contexts sharing a key are processed strictly in arrival order,
//! - contexts with different keys run concurrently,
//! - contexts whose affinity resolves without a value carry no ordering
//!   key and run on an unordered, bounded lane.
//!
//! Each per-key queue is bounded by `queue_capacity`; what happens when it
//! fills is the [`BackpressurePolicy`]: block the producer, surface an
//! error, or (opt-in) drop the new context. Batches are assembled by
//! waiting up to `batch_timeout` for the first item, then draining up to
//! `batch_size` more.
//!
//! Contexts are immutable: every stage consumes one and returns a new
//! one. A failing stage does not halt the batch — the engine attaches an
//! error attribute, bumps the retry counter, and lets downstream stages
//! and the sink decide what to do with the annotated context.

pub mod affinity;
pub mod builtin;
pub mod context;
pub mod engine;
pub mod graph;
pub mod runtime;
pub mod stage;

pub use affinity::{AffinityResolver, AFFINITY_KIND_HEADER, AFFINITY_VALUE_HEADER};
pub use context::{Affinity, Command, Context, Headers, Message, Meta, ERROR_ATTRIBUTE};
pub use engine::{BackpressurePolicy, BatchingOptions, Workflow, WorkflowEngine};
pub use graph::{NodeKind, WorkflowDefinition, WorkflowEdge, WorkflowGraph, WorkflowNode};
pub use runtime::WorkflowRuntime;
pub use stage::{
    MapResolver, NodeResolver, PipelineStep, Sink, SinkHandler, Source, SourceHandler,
    StageComponent, StageError, StageResult,
};

use thiserror::Error;

/// Errors surfaced by workflow construction and execution.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A batching or engine option failed eager validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A workflow graph failed structural validation.
    #[error("invalid workflow graph '{workflow}': {reason}")]
    InvalidGraph {
        /// Workflow name.
        workflow: String,
        /// What was wrong.
        reason: String,
    },

    /// A graph node could not be resolved to a stage component.
    #[error("node '{node}' could not be resolved for workflow '{workflow}'")]
    UnresolvedNode {
        /// Workflow name.
        workflow: String,
        /// Node id that failed to resolve.
        node: String,
    },

    /// An enqueue was rejected under the Error backpressure policy.
    #[error("queue full for affinity {kind}:{value} (capacity {capacity})")]
    QueueFull {
        /// Affinity kind of the rejected context.
        kind: String,
        /// Affinity value of the rejected context.
        value: String,
        /// Configured per-key queue capacity.
        capacity: usize,
    },

    /// An operation required a running workflow.
    #[error("workflow '{0}' is not running")]
    NotRunning(String),

    /// A workflow with the same name is already registered.
    #[error("workflow '{0}' is already registered")]
    DuplicateWorkflow(String),
}
