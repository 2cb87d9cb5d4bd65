//! Registration and lifecycle for a set of workflows.
//!
//! The runtime owns the definitions, builds [`Workflow`] instances
//! through one shared [`WorkflowEngine`], and drives start/stop across
//! all of them. It is also the re-route orchestrator for affinity
//! re-binding: the engine only owns the kind value, while
//! [`rebind_all`](WorkflowRuntime::rebind_all) quiesces every workflow
//! (stop fully drains the per-key queues), rebuilds them from their
//! definitions, and restarts them — so no queue ever interleaves
//! contexts keyed under two different schemes.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::workflow::engine::{Workflow, WorkflowEngine};
use crate::workflow::graph::{WorkflowDefinition, WorkflowGraph};
use crate::workflow::stage::NodeResolver;
use crate::workflow::EngineError;

/// Registry and lifecycle manager for workflows sharing one engine.
pub struct WorkflowRuntime<T> {
    engine: WorkflowEngine,
    resolver: Arc<dyn NodeResolver<T>>,
    graphs: Mutex<Vec<WorkflowGraph>>,
    workflows: Mutex<Vec<Workflow<T>>>,
}

impl<T: Clone + Send + Sync + 'static> WorkflowRuntime<T> {
    /// Create a runtime over `engine`, resolving nodes with `resolver`.
    pub fn new(engine: WorkflowEngine, resolver: Arc<dyn NodeResolver<T>>) -> Self {
        Self {
            engine,
            resolver,
            graphs: Mutex::new(Vec::new()),
            workflows: Mutex::new(Vec::new()),
        }
    }

    /// Register a workflow graph.
    ///
    /// Validates the graph, resolves every node, and rejects duplicate
    /// names. The workflow is built but not started.
    pub async fn register(&self, graph: WorkflowGraph) -> Result<(), EngineError> {
        let mut graphs = self.graphs.lock().await;
        let mut workflows = self.workflows.lock().await;

        if graphs.iter().any(|existing| existing.name == graph.name) {
            return Err(EngineError::DuplicateWorkflow(graph.name));
        }

        let workflow = self
            .engine
            .create_workflow(graph.clone(), Arc::clone(&self.resolver))?;
        debug!(workflow = %graph.name, "Registered workflow");
        graphs.push(graph);
        workflows.push(workflow);
        Ok(())
    }

    /// Register a linear workflow definition.
    pub async fn register_linear(&self, definition: WorkflowDefinition) -> Result<(), EngineError> {
        self.register(definition.into_graph()).await
    }

    /// Start every registered workflow.
    pub async fn start_all(&self) {
        let workflows = self.workflows.lock().await;
        for workflow in workflows.iter() {
            workflow.start().await;
        }
    }

    /// Stop every registered workflow, draining accepted contexts.
    pub async fn stop_all(&self) {
        let workflows = self.workflows.lock().await;
        for workflow in workflows.iter() {
            workflow.stop().await;
        }
    }

    /// Look up a registered workflow by name.
    pub async fn workflow(&self, name: &str) -> Option<Workflow<T>> {
        self.workflows
            .lock()
            .await
            .iter()
            .find(|workflow| workflow.name() == name)
            .cloned()
    }

    /// Names of all registered workflows, in registration order.
    pub async fn workflow_names(&self) -> Vec<String> {
        self.graphs
            .lock()
            .await
            .iter()
            .map(|graph| graph.name.clone())
            .collect()
    }

    /// Swap the engine's default affinity kind.
    ///
    /// Takes effect for newly resolved contexts immediately; call
    /// [`rebind_all`](WorkflowRuntime::rebind_all) to rebuild the running
    /// workflows under the new kind.
    pub fn update_affinity_kind(&self, kind: &str) {
        self.engine.update_affinity_kind(kind);
    }

    /// Stop, rebuild, and restart every workflow under the current engine
    /// settings (e.g. after an affinity kind change).
    ///
    /// Stop fully drains each workflow's per-key queues before the
    /// rebuild, so in-flight contexts finish under the old keying and new
    /// arrivals start under the new one.
    pub async fn rebind_all(&self) -> Result<(), EngineError> {
        let graphs = self.graphs.lock().await;
        let mut workflows = self.workflows.lock().await;

        info!(count = graphs.len(), "Rebinding all workflows");
        for workflow in workflows.iter() {
            workflow.stop().await;
        }
        workflows.clear();

        for graph in graphs.iter() {
            let workflow = self
                .engine
                .create_workflow(graph.clone(), Arc::clone(&self.resolver))?;
            workflow.start().await;
            workflows.push(workflow);
        }
        Ok(())
    }
}
