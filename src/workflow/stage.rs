//! Stage traits: the pieces a workflow is assembled from.
//!
//! All stages are async trait objects over a payload type `T`. Handlers
//! and steps are conditional (`supports`) and pure: they consume a
//! [`Context`] and return a new one. A stage that returns an error does
//! not halt the batch — the engine annotates the context and keeps going.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::workflow::context::Context;
use crate::workflow::graph::{NodeKind, WorkflowNode};

/// Error type produced by stages.
pub type StageError = Box<dyn std::error::Error + Send + Sync>;

/// Result type produced by stages.
pub type StageResult<T> = Result<T, StageError>;

/// Produces batches of contexts to process.
///
/// An empty batch means the source is (currently) exhausted; in
/// continuous mode the engine polls again after `batch_timeout`.
#[async_trait]
pub trait Source<T>: Send + Sync {
    /// Pull the next batch of contexts.
    async fn read(&self) -> Vec<Context<T>>;
}

/// Adapts raw contexts right after the source.
#[async_trait]
pub trait SourceHandler<T>: Send + Sync {
    /// Whether this handler applies to the context.
    fn supports(&self, context: &Context<T>) -> bool {
        let _ = context;
        true
    }

    /// Transform the context.
    async fn handle(&self, context: Context<T>) -> StageResult<Context<T>>;
}

/// A processing step in the middle of the pipeline.
#[async_trait]
pub trait PipelineStep<T>: Send + Sync {
    /// Whether this step applies to the context.
    fn supports(&self, context: &Context<T>) -> bool {
        let _ = context;
        true
    }

    /// Transform the context.
    async fn apply(&self, context: Context<T>) -> StageResult<Context<T>>;
}

/// Adapts contexts right before the sink.
#[async_trait]
pub trait SinkHandler<T>: Send + Sync {
    /// Whether this handler applies to the context.
    fn supports(&self, context: &Context<T>) -> bool {
        let _ = context;
        true
    }

    /// Transform the context.
    async fn handle(&self, context: Context<T>) -> StageResult<Context<T>>;
}

/// Terminal stage writing results out.
#[async_trait]
pub trait Sink<T>: Send + Sync {
    /// Write a fully processed context.
    async fn write(&self, context: Context<T>) -> StageResult<()>;
}

/// A resolved stage implementation for a graph node.
pub enum StageComponent<T> {
    /// A source.
    Source(Arc<dyn Source<T>>),
    /// A source-side handler.
    SourceHandler(Arc<dyn SourceHandler<T>>),
    /// A pipeline step.
    PipelineStep(Arc<dyn PipelineStep<T>>),
    /// A sink-side handler.
    SinkHandler(Arc<dyn SinkHandler<T>>),
    /// A sink.
    Sink(Arc<dyn Sink<T>>),
}

impl<T> Clone for StageComponent<T> {
    fn clone(&self) -> Self {
        match self {
            StageComponent::Source(s) => StageComponent::Source(Arc::clone(s)),
            StageComponent::SourceHandler(h) => StageComponent::SourceHandler(Arc::clone(h)),
            StageComponent::PipelineStep(p) => StageComponent::PipelineStep(Arc::clone(p)),
            StageComponent::SinkHandler(h) => StageComponent::SinkHandler(Arc::clone(h)),
            StageComponent::Sink(s) => StageComponent::Sink(Arc::clone(s)),
        }
    }
}

impl<T> StageComponent<T> {
    /// The node kind this component satisfies.
    pub fn kind(&self) -> NodeKind {
        match self {
            StageComponent::Source(_) => NodeKind::Source,
            StageComponent::SourceHandler(_) => NodeKind::SourceHandler,
            StageComponent::PipelineStep(_) => NodeKind::PipelineStep,
            StageComponent::SinkHandler(_) => NodeKind::SinkHandler,
            StageComponent::Sink(_) => NodeKind::Sink,
        }
    }
}

/// Maps graph nodes to stage implementations.
pub trait NodeResolver<T>: Send + Sync {
    /// Resolve `node` to its implementation, or `None` if unknown.
    fn resolve(&self, node: &WorkflowNode) -> Option<StageComponent<T>>;
}

/// Registry-backed [`NodeResolver`] keyed by a node's `ref_name`.
pub struct MapResolver<T> {
    components: HashMap<String, StageComponent<T>>,
}

impl<T> MapResolver<T> {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            components: HashMap::new(),
        }
    }

    /// Register a source under `ref_name`.
    pub fn with_source(mut self, ref_name: impl Into<String>, source: Arc<dyn Source<T>>) -> Self {
        self.components
            .insert(ref_name.into(), StageComponent::Source(source));
        self
    }

    /// Register a source handler under `ref_name`.
    pub fn with_source_handler(
        mut self,
        ref_name: impl Into<String>,
        handler: Arc<dyn SourceHandler<T>>,
    ) -> Self {
        self.components
            .insert(ref_name.into(), StageComponent::SourceHandler(handler));
        self
    }

    /// Register a pipeline step under `ref_name`.
    pub fn with_step(
        mut self,
        ref_name: impl Into<String>,
        step: Arc<dyn PipelineStep<T>>,
    ) -> Self {
        self.components
            .insert(ref_name.into(), StageComponent::PipelineStep(step));
        self
    }

    /// Register a sink handler under `ref_name`.
    pub fn with_sink_handler(
        mut self,
        ref_name: impl Into<String>,
        handler: Arc<dyn SinkHandler<T>>,
    ) -> Self {
        self.components
            .insert(ref_name.into(), StageComponent::SinkHandler(handler));
        self
    }

    /// Register a sink under `ref_name`.
    pub fn with_sink(mut self, ref_name: impl Into<String>, sink: Arc<dyn Sink<T>>) -> Self {
        self.components
            .insert(ref_name.into(), StageComponent::Sink(sink));
        self
    }
}

impl<T> Default for MapResolver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync> NodeResolver<T> for MapResolver<T> {
    fn resolve(&self, node: &WorkflowNode) -> Option<StageComponent<T>> {
        self.components.get(&node.ref_name).cloned()
    }
}
