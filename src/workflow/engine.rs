//! The workflow engine: per-key ordered, batched, backpressured execution.
//!
//! # Scheduling model
//!
//! Each running workflow owns a registry of per-key workers. A worker is
//! a bounded tokio mpsc queue plus a task draining it; the queue is the
//! only way contexts reach the worker, so per-key FIFO falls out of the
//! channel contract rather than any locking discipline. Workers are
//! created on first use, reclaim themselves after `cleanup_idle_after`
//! without traffic, and are transparently recreated when a producer hits
//! a reclaimed queue.
//!
//! Contexts whose affinity resolves without a value carry no ordering key
//! and run on an unordered lane: one task per context, bounded by a
//! semaphore with `queue_capacity` permits under the same backpressure
//! policy as the keyed queues.
//!
//! # Stop semantics
//!
//! Stopping halts intake, closes every per-key queue, and drains what was
//! already accepted to the sink before workers exit. After
//! [`Workflow::stop`] returns, no queue holds data.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::workflow::affinity::AffinityResolver;
use crate::workflow::context::Context;
use crate::workflow::graph::{NodeKind, WorkflowGraph};
use crate::workflow::stage::{
    NodeResolver, PipelineStep, Sink, SinkHandler, Source, SourceHandler, StageComponent,
};
use crate::workflow::EngineError;

/// Behavior when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Suspend the producer until space frees up.
    Block,
    /// Fail the enqueue, surfacing [`EngineError::QueueFull`] to the caller.
    Error,
    /// Silently discard the new context. Opt-in data loss.
    Drop,
}

/// Batching and backpressure configuration.
///
/// Validated eagerly: invalid values never reach a running engine.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchingOptions {
    queue_capacity: usize,
    batch_size: usize,
    batch_timeout: Duration,
    cleanup_idle_after: Duration,
    backpressure_policy: BackpressurePolicy,
    continuous: bool,
}

impl BatchingOptions {
    /// Validate and build options.
    pub fn new(
        queue_capacity: usize,
        batch_size: usize,
        batch_timeout: Duration,
        cleanup_idle_after: Duration,
        backpressure_policy: BackpressurePolicy,
        continuous: bool,
    ) -> Result<Self, EngineError> {
        if queue_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "queue_capacity must be > 0".into(),
            ));
        }
        if batch_size == 0 {
            return Err(EngineError::InvalidConfig("batch_size must be > 0".into()));
        }
        if batch_timeout.is_zero() {
            return Err(EngineError::InvalidConfig(
                "batch_timeout must be > 0".into(),
            ));
        }
        if cleanup_idle_after.is_zero() {
            return Err(EngineError::InvalidConfig(
                "cleanup_idle_after must be > 0".into(),
            ));
        }
        Ok(Self {
            queue_capacity,
            batch_size,
            batch_timeout,
            cleanup_idle_after,
            backpressure_policy,
            continuous,
        })
    }

    /// Defaults: capacity 256, batches of 32, 200ms flush, 30s idle
    /// reclaim, Block backpressure, one-shot source.
    pub fn defaults() -> Self {
        Self {
            queue_capacity: 256,
            batch_size: 32,
            batch_timeout: Duration::from_millis(200),
            cleanup_idle_after: Duration::from_secs(30),
            backpressure_policy: BackpressurePolicy::Block,
            continuous: false,
        }
    }

    /// Per-key queue capacity.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Maximum contexts per processed batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Longest wait for the first item of a batch before re-polling.
    pub fn batch_timeout(&self) -> Duration {
        self.batch_timeout
    }

    /// Idle duration after which a per-key worker is reclaimed.
    pub fn cleanup_idle_after(&self) -> Duration {
        self.cleanup_idle_after
    }

    /// Policy applied when a queue is full.
    pub fn backpressure_policy(&self) -> BackpressurePolicy {
        self.backpressure_policy
    }

    /// Whether the engine keeps polling an exhausted source.
    pub fn continuous(&self) -> bool {
        self.continuous
    }
}

impl Default for BatchingOptions {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Builds runnable [`Workflow`]s and owns the affinity resolver they share.
pub struct WorkflowEngine {
    batching: BatchingOptions,
    resolver: Arc<AffinityResolver>,
}

impl WorkflowEngine {
    /// Engine with default options and resolver.
    pub fn new() -> Self {
        Self::with_options(BatchingOptions::defaults())
    }

    /// Engine with the given batching options.
    pub fn with_options(batching: BatchingOptions) -> Self {
        Self::with_resolver(batching, Arc::new(AffinityResolver::default()))
    }

    /// Engine with explicit options and affinity resolver.
    pub fn with_resolver(batching: BatchingOptions, resolver: Arc<AffinityResolver>) -> Self {
        info!(?batching, "Initialized workflow engine");
        Self { batching, resolver }
    }

    /// The shared affinity resolver.
    pub fn affinity_resolver(&self) -> Arc<AffinityResolver> {
        Arc::clone(&self.resolver)
    }

    /// Swap the default affinity kind at runtime.
    ///
    /// Only the kind value changes here; re-routing in-flight work is the
    /// caller's concern (see `WorkflowRuntime::rebind_all`).
    pub fn update_affinity_kind(&self, kind: &str) {
        self.resolver.set_default_kind(kind);
        info!(kind, "Updated workflow affinity kind");
    }

    /// Assemble a runnable workflow from a validated graph.
    ///
    /// Resolves every node up front; an unknown node or a component of
    /// the wrong kind fails here, before anything starts.
    pub fn create_workflow<T>(
        &self,
        graph: WorkflowGraph,
        resolver: Arc<dyn NodeResolver<T>>,
    ) -> Result<Workflow<T>, EngineError>
    where
        T: Clone + Send + Sync + 'static,
    {
        graph.validate()?;
        let batching = graph.batching.clone().unwrap_or_else(|| self.batching.clone());

        let start = graph
            .node(&graph.start_node)
            .expect("validated graph has start node");
        let source = match resolver.resolve(start) {
            Some(StageComponent::Source(source)) => source,
            _ => {
                return Err(EngineError::UnresolvedNode {
                    workflow: graph.name.clone(),
                    node: start.id.clone(),
                })
            }
        };

        let mut processors = Vec::new();
        let mut sink: Option<Arc<dyn Sink<T>>> = None;
        let mut current = start;
        loop {
            let next_nodes = graph.successors(&current.id);
            let Some(next) = next_nodes.first().copied() else {
                break;
            };
            let component = resolver
                .resolve(next)
                .ok_or_else(|| EngineError::UnresolvedNode {
                    workflow: graph.name.clone(),
                    node: next.id.clone(),
                })?;
            if component.kind() != next.kind {
                return Err(EngineError::InvalidGraph {
                    workflow: graph.name.clone(),
                    reason: format!(
                        "node '{}' resolved to a {:?} component but is declared {:?}",
                        next.id,
                        component.kind(),
                        next.kind
                    ),
                });
            }
            match component {
                StageComponent::SourceHandler(handler) => {
                    processors.push(Processor::SourceHandler(handler))
                }
                StageComponent::PipelineStep(step) => processors.push(Processor::Step(step)),
                StageComponent::SinkHandler(handler) => {
                    processors.push(Processor::SinkHandler(handler))
                }
                StageComponent::Sink(resolved) => sink = Some(resolved),
                StageComponent::Source(_) => unreachable!("validated graph has one source"),
            }
            if next.kind == NodeKind::Sink {
                break;
            }
            current = next;
        }
        let sink = sink.ok_or_else(|| EngineError::InvalidGraph {
            workflow: graph.name.clone(),
            reason: "sink node is required".into(),
        })?;

        debug!(
            workflow = %graph.name,
            processors = processors.len(),
            "Assembled workflow pipeline"
        );

        let unkeyed_permits = Arc::new(Semaphore::new(batching.queue_capacity()));
        Ok(Workflow {
            inner: Arc::new(WorkflowInner {
                name: graph.name,
                source,
                chain: PipelineChain { processors, sink },
                batching,
                resolver: Arc::clone(&self.resolver),
                running: AtomicBool::new(false),
                workers: DashMap::new(),
                tasks: Mutex::new(Vec::new()),
                unkeyed_permits,
                next_worker_id: AtomicU64::new(0),
                run_task: tokio::sync::Mutex::new(None),
            }),
        })
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}

enum Processor<T> {
    SourceHandler(Arc<dyn SourceHandler<T>>),
    Step(Arc<dyn PipelineStep<T>>),
    SinkHandler(Arc<dyn SinkHandler<T>>),
}

struct PipelineChain<T> {
    processors: Vec<Processor<T>>,
    sink: Arc<dyn Sink<T>>,
}

#[derive(Clone)]
struct WorkerHandle<T> {
    id: u64,
    tx: mpsc::Sender<Context<T>>,
}

struct WorkflowInner<T> {
    name: String,
    source: Arc<dyn Source<T>>,
    chain: PipelineChain<T>,
    batching: BatchingOptions,
    resolver: Arc<AffinityResolver>,
    running: AtomicBool,
    workers: DashMap<(String, String), WorkerHandle<T>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    unkeyed_permits: Arc<Semaphore>,
    next_worker_id: AtomicU64,
    run_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// A runnable workflow instance.
///
/// Cheap to clone; clones share the same running instance.
pub struct Workflow<T> {
    inner: Arc<WorkflowInner<T>>,
}

impl<T> Clone for Workflow<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Workflow<T> {
    /// Workflow name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the dispatch loop is currently running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start the dispatch loop in the background.
    ///
    /// A no-op (with a warning) when already running.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!(workflow = %self.inner.name, "Workflow is already running");
            return;
        }
        info!(workflow = %self.inner.name, "Starting workflow");

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { WorkflowInner::run_loop(inner).await });
        *self.inner.run_task.lock().await = Some(handle);
    }

    /// Wait for the dispatch loop to finish naturally.
    ///
    /// Returns once a non-continuous source is exhausted and all accepted
    /// contexts are drained. For continuous workflows this waits until
    /// [`stop`](Workflow::stop) is called from elsewhere.
    pub async fn join(&self) {
        let handle = self.inner.run_task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Stop the workflow: halt intake, then drain accepted contexts.
    pub async fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            info!(workflow = %self.inner.name, "Stopping workflow");
        }
        self.join().await;
    }

    /// Inject a context directly, bypassing the source.
    ///
    /// Subject to the same affinity routing and backpressure policy as
    /// source-fed contexts.
    pub async fn submit(&self, context: Context<T>) -> Result<(), EngineError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(EngineError::NotRunning(self.inner.name.clone()));
        }
        self.inner.dispatch(context).await
    }
}

impl<T: Clone + Send + Sync + 'static> WorkflowInner<T> {
    async fn run_loop(inner: Arc<Self>) {
        let continuous = inner.batching.continuous();
        loop {
            let batch = inner.source.read().await;
            let mut dispatched = 0usize;
            for context in batch {
                if !inner.running.load(Ordering::SeqCst) {
                    break;
                }
                match inner.dispatch(context).await {
                    Ok(()) => dispatched += 1,
                    Err(error) => {
                        warn!(workflow = %inner.name, %error, "Context rejected at dispatch")
                    }
                }
            }
            if !inner.running.load(Ordering::SeqCst) {
                break;
            }
            if !continuous {
                break;
            }
            if dispatched == 0 {
                tokio::time::sleep(inner.batching.batch_timeout()).await;
            }
        }

        inner.running.store(false, Ordering::SeqCst);
        inner.drain().await;
        info!(workflow = %inner.name, "Workflow finished");
    }

    async fn dispatch(self: &Arc<Self>, context: Context<T>) -> Result<(), EngineError> {
        let affinity = self.resolver.resolve(&context);
        let context = context.with_affinity(affinity.clone());

        match (affinity.kind, affinity.value) {
            (Some(kind), Some(value)) => self.enqueue_keyed((kind, value), context).await,
            (kind, _) => self.spawn_unkeyed(kind, context).await,
        }
    }

    async fn enqueue_keyed(
        self: &Arc<Self>,
        key: (String, String),
        context: Context<T>,
    ) -> Result<(), EngineError> {
        let mut pending = context;
        loop {
            let handle = self
                .workers
                .entry(key.clone())
                .or_insert_with(|| self.spawn_worker(key.clone()))
                .value()
                .clone();

            match self.batching.backpressure_policy() {
                BackpressurePolicy::Block => match handle.tx.send(pending).await {
                    Ok(()) => return Ok(()),
                    Err(SendError(returned)) => {
                        // The worker reclaimed itself between lookup and
                        // send; drop the stale entry and retry.
                        self.workers.remove_if(&key, |_, h| h.id == handle.id);
                        pending = returned;
                    }
                },
                BackpressurePolicy::Error => match handle.tx.try_send(pending) {
                    Ok(()) => return Ok(()),
                    Err(TrySendError::Full(_)) => {
                        return Err(EngineError::QueueFull {
                            kind: key.0,
                            value: key.1,
                            capacity: self.batching.queue_capacity(),
                        });
                    }
                    Err(TrySendError::Closed(returned)) => {
                        self.workers.remove_if(&key, |_, h| h.id == handle.id);
                        pending = returned;
                    }
                },
                BackpressurePolicy::Drop => match handle.tx.try_send(pending) {
                    Ok(()) => return Ok(()),
                    Err(TrySendError::Full(_)) => {
                        metrics::BACKPRESSURE_DROPS
                            .with_label_values(&[self.name.as_str()])
                            .inc();
                        debug!(
                            workflow = %self.name,
                            kind = %key.0,
                            value = %key.1,
                            "Dropped context on full queue"
                        );
                        return Ok(());
                    }
                    Err(TrySendError::Closed(returned)) => {
                        self.workers.remove_if(&key, |_, h| h.id == handle.id);
                        pending = returned;
                    }
                },
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, key: (String, String)) -> WorkerHandle<T> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.batching.queue_capacity());

        debug!(
            workflow = %self.name,
            kind = %key.0,
            value = %key.1,
            worker = id,
            "Starting per-key worker"
        );

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.worker_loop(key, id, rx).await });
        self.tasks
            .lock()
            .expect("task registry poisoned")
            .push(handle);

        WorkerHandle { id, tx }
    }

    async fn worker_loop(
        self: Arc<Self>,
        key: (String, String),
        id: u64,
        mut rx: mpsc::Receiver<Context<T>>,
    ) {
        let batch_timeout = self.batching.batch_timeout();
        let cleanup_after = self.batching.cleanup_idle_after();
        let batch_size = self.batching.batch_size();
        let mut batch = Vec::with_capacity(batch_size);
        let mut idle_since = tokio::time::Instant::now();

        loop {
            match tokio::time::timeout(batch_timeout, rx.recv()).await {
                Ok(Some(first)) => {
                    batch.push(first);
                    while batch.len() < batch_size {
                        match rx.try_recv() {
                            Ok(context) => batch.push(context),
                            Err(_) => break,
                        }
                    }
                    self.process_batch(&mut batch).await;
                    idle_since = tokio::time::Instant::now();
                }
                // All senders dropped: queue is fully drained, exit.
                Ok(None) => break,
                Err(_) => {
                    if idle_since.elapsed() >= cleanup_after {
                        // Deregister first so producers re-create rather
                        // than enqueue into a dying worker, then drain any
                        // context that raced in before the close.
                        self.workers.remove_if(&key, |_, h| h.id == id);
                        rx.close();
                        while let Some(context) = rx.recv().await {
                            batch.push(context);
                        }
                        if !batch.is_empty() {
                            self.process_batch(&mut batch).await;
                        }
                        debug!(
                            workflow = %self.name,
                            kind = %key.0,
                            value = %key.1,
                            worker = id,
                            "Reclaimed idle per-key worker"
                        );
                        break;
                    }
                }
            }
        }
    }

    async fn spawn_unkeyed(
        self: &Arc<Self>,
        kind: Option<String>,
        context: Context<T>,
    ) -> Result<(), EngineError> {
        let permit = match self.batching.backpressure_policy() {
            BackpressurePolicy::Block => {
                match Arc::clone(&self.unkeyed_permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Err(EngineError::NotRunning(self.name.clone())),
                }
            }
            BackpressurePolicy::Error => {
                match Arc::clone(&self.unkeyed_permits).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Err(EngineError::QueueFull {
                            kind: kind.unwrap_or_else(|| "-".into()),
                            value: "-".into(),
                            capacity: self.batching.queue_capacity(),
                        });
                    }
                }
            }
            BackpressurePolicy::Drop => {
                match Arc::clone(&self.unkeyed_permits).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        metrics::BACKPRESSURE_DROPS
                            .with_label_values(&[self.name.as_str()])
                            .inc();
                        debug!(workflow = %self.name, "Dropped unkeyed context on full lane");
                        return Ok(());
                    }
                }
            }
        };

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            inner.process_one(context).await;
        });
        self.tasks
            .lock()
            .expect("task registry poisoned")
            .push(handle);
        Ok(())
    }

    async fn process_batch(&self, batch: &mut Vec<Context<T>>) {
        for context in batch.drain(..) {
            self.process_one(context).await;
        }
    }

    async fn process_one(&self, context: Context<T>) {
        let mut current = context;
        for processor in &self.chain.processors {
            current = self.apply_processor(processor, current).await;
        }
        if let Err(error) = self.chain.sink.write(current).await {
            metrics::STAGE_FAILURES
                .with_label_values(&[self.name.as_str()])
                .inc();
            warn!(workflow = %self.name, %error, "Sink write failed");
        }
        metrics::CONTEXTS_PROCESSED
            .with_label_values(&[self.name.as_str()])
            .inc();
    }

    async fn apply_processor(&self, processor: &Processor<T>, context: Context<T>) -> Context<T> {
        let outcome = match processor {
            Processor::SourceHandler(handler) => {
                if !handler.supports(&context) {
                    return context;
                }
                handler.handle(context.clone()).await
            }
            Processor::Step(step) => {
                if !step.supports(&context) {
                    return context;
                }
                step.apply(context.clone()).await
            }
            Processor::SinkHandler(handler) => {
                if !handler.supports(&context) {
                    return context;
                }
                handler.handle(context.clone()).await
            }
        };

        match outcome {
            Ok(next) => next,
            Err(error) => {
                metrics::STAGE_FAILURES
                    .with_label_values(&[self.name.as_str()])
                    .inc();
                warn!(
                    workflow = %self.name,
                    %error,
                    retries = context.meta.retries + 1,
                    "Stage failed; annotating context and continuing"
                );
                context.with_error(&error.to_string())
            }
        }
    }

    async fn drain(&self) {
        // Dropping every sender closes the per-key queues; workers drain
        // what they already accepted, then exit.
        self.workers.clear();
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().expect("task registry poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
