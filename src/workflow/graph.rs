//! Workflow definitions: linear chains and their graph form.
//!
//! The engine executes a [`WorkflowGraph`]: nodes of a [`NodeKind`] wired
//! by directed edges, starting at a source and ending at a sink. Most
//! callers describe workflows with the linear [`WorkflowDefinition`] and
//! convert it; the graph form exists so externally produced definitions
//! can be validated and executed through the same path.
//!
//! Validation is eager and structural: it runs before any stage is
//! resolved, so a malformed definition never reaches a running engine.
//! Branching graphs are not supported; the chain must be linear.

use crate::workflow::engine::BatchingOptions;
use crate::workflow::EngineError;

/// Role a node plays in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Produces contexts.
    Source,
    /// Adapts contexts right after the source.
    SourceHandler,
    /// Transforms contexts mid-pipeline.
    PipelineStep,
    /// Adapts contexts right before the sink.
    SinkHandler,
    /// Terminal writer.
    Sink,
}

/// One node of a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowNode {
    /// Unique node id within the graph.
    pub id: String,
    /// Role of the node.
    pub kind: NodeKind,
    /// Name under which the implementation is registered.
    pub ref_name: String,
}

impl WorkflowNode {
    /// Convenience constructor.
    pub fn new(id: impl Into<String>, kind: NodeKind, ref_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            ref_name: ref_name.into(),
        }
    }
}

/// Directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowEdge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
}

impl WorkflowEdge {
    /// Convenience constructor.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Graph form of a workflow.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    /// Workflow name, unique within a runtime.
    pub name: String,
    /// Id of the starting node (must be a source).
    pub start_node: String,
    /// All nodes.
    pub nodes: Vec<WorkflowNode>,
    /// All edges.
    pub edges: Vec<WorkflowEdge>,
    /// Per-workflow batching override; engine defaults apply when absent.
    pub batching: Option<BatchingOptions>,
}

impl WorkflowGraph {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Successors of a node, in edge order.
    pub fn successors(&self, id: &str) -> Vec<&WorkflowNode> {
        self.edges
            .iter()
            .filter(|edge| edge.from == id)
            .filter_map(|edge| self.node(&edge.to))
            .collect()
    }

    /// Structurally validate the graph.
    ///
    /// Checks: the start node exists and is a source, every edge endpoint
    /// resolves, the chain is linear (no branching), it terminates at a
    /// sink, no second source appears mid-chain, and walking it visits no
    /// node twice (no cycles).
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |reason: String| EngineError::InvalidGraph {
            workflow: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("workflow name must not be empty".into()));
        }

        for edge in &self.edges {
            if self.node(&edge.from).is_none() {
                return Err(invalid(format!("edge references unknown node '{}'", edge.from)));
            }
            if self.node(&edge.to).is_none() {
                return Err(invalid(format!("edge references unknown node '{}'", edge.to)));
            }
        }

        let start = self
            .node(&self.start_node)
            .ok_or_else(|| invalid(format!("start node '{}' not found", self.start_node)))?;
        if start.kind != NodeKind::Source {
            return Err(invalid(format!("start node '{}' must be a source", start.id)));
        }

        let mut visited = vec![start.id.clone()];
        let mut current = start;
        loop {
            let next = self.successors(&current.id);
            match next.len() {
                0 => {
                    if current.kind != NodeKind::Sink {
                        return Err(invalid(format!(
                            "chain ends at '{}' which is not a sink",
                            current.id
                        )));
                    }
                    break;
                }
                1 => {
                    let next = next[0];
                    if next.kind == NodeKind::Source {
                        return Err(invalid(format!(
                            "unexpected source '{}' after start",
                            next.id
                        )));
                    }
                    if visited.iter().any(|id| id == &next.id) {
                        return Err(invalid(format!("cycle detected at '{}'", next.id)));
                    }
                    if current.kind == NodeKind::Sink {
                        return Err(invalid(format!(
                            "sink '{}' must be terminal",
                            current.id
                        )));
                    }
                    visited.push(next.id.clone());
                    current = next;
                }
                _ => {
                    return Err(invalid(format!(
                        "branching is not supported at node '{}'",
                        current.id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Linear workflow description: source, optional handlers and steps, sink.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    /// Workflow name.
    pub name: String,
    /// Registered name of the source.
    pub source: String,
    /// Registered names of source handlers, in order.
    pub source_handlers: Vec<String>,
    /// Registered names of pipeline steps, in order.
    pub steps: Vec<String>,
    /// Registered names of sink handlers, in order.
    pub sink_handlers: Vec<String>,
    /// Registered name of the sink.
    pub sink: String,
    /// Per-workflow batching override.
    pub batching: Option<BatchingOptions>,
}

impl WorkflowDefinition {
    /// A minimal source-to-sink definition.
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        sink: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            source_handlers: Vec::new(),
            steps: Vec::new(),
            sink_handlers: Vec::new(),
            sink: sink.into(),
            batching: None,
        }
    }

    /// Append a source handler.
    pub fn with_source_handler(mut self, ref_name: impl Into<String>) -> Self {
        self.source_handlers.push(ref_name.into());
        self
    }

    /// Append a pipeline step.
    pub fn with_step(mut self, ref_name: impl Into<String>) -> Self {
        self.steps.push(ref_name.into());
        self
    }

    /// Append a sink handler.
    pub fn with_sink_handler(mut self, ref_name: impl Into<String>) -> Self {
        self.sink_handlers.push(ref_name.into());
        self
    }

    /// Override batching options for this workflow.
    pub fn with_batching(mut self, batching: BatchingOptions) -> Self {
        self.batching = Some(batching);
        self
    }

    /// Convert into the graph form the engine executes.
    pub fn into_graph(self) -> WorkflowGraph {
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut previous: Option<String> = None;
        let mut index = 0usize;

        let mut push = |nodes: &mut Vec<WorkflowNode>,
                        edges: &mut Vec<WorkflowEdge>,
                        previous: &mut Option<String>,
                        index: &mut usize,
                        kind: NodeKind,
                        ref_name: String| {
            let id = format!("n{}-{}", *index, ref_name);
            *index += 1;
            nodes.push(WorkflowNode::new(id.clone(), kind, ref_name));
            if let Some(prev) = previous.take() {
                edges.push(WorkflowEdge::new(prev, id.clone()));
            }
            *previous = Some(id);
        };

        push(
            &mut nodes,
            &mut edges,
            &mut previous,
            &mut index,
            NodeKind::Source,
            self.source,
        );
        for handler in self.source_handlers {
            push(
                &mut nodes,
                &mut edges,
                &mut previous,
                &mut index,
                NodeKind::SourceHandler,
                handler,
            );
        }
        for step in self.steps {
            push(
                &mut nodes,
                &mut edges,
                &mut previous,
                &mut index,
                NodeKind::PipelineStep,
                step,
            );
        }
        for handler in self.sink_handlers {
            push(
                &mut nodes,
                &mut edges,
                &mut previous,
                &mut index,
                NodeKind::SinkHandler,
                handler,
            );
        }
        push(
            &mut nodes,
            &mut edges,
            &mut previous,
            &mut index,
            NodeKind::Sink,
            self.sink,
        );

        let start_node = nodes[0].id.clone();
        WorkflowGraph {
            name: self.name,
            start_node,
            nodes,
            edges,
            batching: self.batching,
        }
    }
}
