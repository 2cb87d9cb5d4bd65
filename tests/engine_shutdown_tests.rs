//! Stop semantics and worker lifecycle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keyflow::workflow::builtin::{CollectingSink, StaticSource};
use keyflow::workflow::{
    Affinity, BackpressurePolicy, BatchingOptions, Command, Context, MapResolver, Message, Sink,
    StageResult, WorkflowDefinition, WorkflowEngine,
};
use tokio::sync::{mpsc, Semaphore};

fn ctx(key: &str, payload: &str) -> Context<String> {
    Context::new(
        Message::now("test", payload.to_string()),
        Command::named("process"),
    )
    .with_affinity(Affinity::keyed("equipment-id", key))
}

struct GatedSink {
    gate: Semaphore,
    entered: mpsc::UnboundedSender<String>,
    written: Mutex<Vec<String>>,
}

#[async_trait]
impl Sink<String> for GatedSink {
    async fn write(&self, context: Context<String>) -> StageResult<()> {
        let payload = context.message.payload.clone();
        let _ = self.entered.send(payload.clone());
        let permit = self.gate.acquire().await?;
        permit.forget();
        self.written.lock().unwrap().push(payload);
        Ok(())
    }
}

/// Everything accepted before stop() is delivered before stop() returns.
#[tokio::test]
async fn stop_drains_accepted_contexts() {
    let (entered_tx, mut entered) = mpsc::unbounded_channel();
    let sink = Arc::new(GatedSink {
        gate: Semaphore::new(0),
        entered: entered_tx,
        written: Mutex::new(Vec::new()),
    });
    let resolver = Arc::new(
        MapResolver::new()
            .with_source("src", Arc::new(StaticSource::empty()))
            .with_sink("out", Arc::clone(&sink) as Arc<dyn Sink<String>>),
    );
    let options = BatchingOptions::new(
        16,
        4,
        Duration::from_millis(25),
        Duration::from_secs(5),
        BackpressurePolicy::Block,
        true,
    )
    .unwrap();

    let engine = WorkflowEngine::with_options(options);
    let workflow = engine
        .create_workflow(
            WorkflowDefinition::new("drain", "src", "out").into_graph(),
            resolver,
        )
        .unwrap();
    workflow.start().await;

    for n in 1..=5 {
        workflow.submit(ctx("eq-1", &format!("m{n}"))).await.unwrap();
    }
    // First context parked in the sink, the rest queued.
    let first = tokio::time::timeout(Duration::from_secs(2), entered.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, "m1");

    sink.gate.add_permits(64);
    workflow.stop().await;

    // Per-key FIFO held through the drain.
    assert_eq!(
        sink.written.lock().unwrap().as_slice(),
        &["m1", "m2", "m3", "m4", "m5"]
    );
}

/// An idle worker reclaims itself; the next context for the same key is
/// served by a transparently recreated worker.
#[tokio::test]
async fn idle_workers_are_reclaimed_and_recreated() {
    let sink = Arc::new(CollectingSink::<String>::new());
    let resolver = Arc::new(
        MapResolver::new()
            .with_source("src", Arc::new(StaticSource::empty()))
            .with_sink("out", Arc::clone(&sink) as Arc<dyn Sink<String>>),
    );
    let options = BatchingOptions::new(
        16,
        4,
        Duration::from_millis(10),
        Duration::from_millis(40),
        BackpressurePolicy::Block,
        true,
    )
    .unwrap();

    let engine = WorkflowEngine::with_options(options);
    let workflow = engine
        .create_workflow(
            WorkflowDefinition::new("reclaim", "src", "out").into_graph(),
            resolver,
        )
        .unwrap();
    workflow.start().await;

    workflow.submit(ctx("eq-1", "before")).await.unwrap();
    // Wait well past cleanup_idle_after so the worker reclaims itself.
    tokio::time::sleep(Duration::from_millis(200)).await;

    workflow.submit(ctx("eq-1", "after")).await.unwrap();
    workflow.stop().await;

    let written = sink.written();
    let payloads: Vec<_> = written.iter().map(|c| c.message.payload.clone()).collect();
    assert_eq!(payloads, vec!["before", "after"]);
}

/// A non-continuous workflow finishes on its own once the source is
/// exhausted, and stop() afterwards is a clean no-op.
#[tokio::test]
async fn non_continuous_workflow_finishes_naturally() {
    let sink = Arc::new(CollectingSink::new());
    let resolver = Arc::new(
        MapResolver::new()
            .with_source(
                "src",
                Arc::new(StaticSource::single(vec![
                    ctx("eq-1", "only-1"),
                    ctx("eq-2", "only-2"),
                ])),
            )
            .with_sink("out", Arc::clone(&sink) as Arc<dyn Sink<String>>),
    );

    let engine = WorkflowEngine::with_options(
        BatchingOptions::new(
            16,
            4,
            Duration::from_millis(10),
            Duration::from_millis(100),
            BackpressurePolicy::Block,
            false,
        )
        .unwrap(),
    );
    let workflow = engine
        .create_workflow(
            WorkflowDefinition::new("oneshot", "src", "out").into_graph(),
            resolver,
        )
        .unwrap();

    workflow.start().await;
    workflow.join().await;
    assert!(!workflow.is_running());
    assert_eq!(sink.len(), 2);

    workflow.stop().await;
    assert_eq!(sink.len(), 2);
}
