//! Per-key ordering and cross-key concurrency in the workflow engine.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use keyflow::workflow::builtin::{CollectingSink, StaticSource};
use keyflow::workflow::{
    Affinity, BackpressurePolicy, BatchingOptions, Command, Context, MapResolver, Message,
    PipelineStep, Sink, StageResult, WorkflowDefinition, WorkflowEngine, ERROR_ATTRIBUTE,
};

fn keyed(key: &str, payload: &str) -> Context<String> {
    Context::new(
        Message::now("test", payload.to_string()),
        Command::named("process"),
    )
    .with_affinity(Affinity::keyed("equipment-id", key))
}

fn unkeyed(payload: &str) -> Context<String> {
    Context::new(
        Message::now("test", payload.to_string()),
        Command::named("process"),
    )
}

fn options() -> BatchingOptions {
    BatchingOptions::new(
        64,
        8,
        Duration::from_millis(25),
        Duration::from_millis(250),
        BackpressurePolicy::Block,
        false,
    )
    .unwrap()
}

#[tokio::test]
async fn same_key_contexts_arrive_in_order() {
    let contexts = vec![
        keyed("eq-1", "a1"),
        keyed("eq-1", "a2"),
        keyed("eq-2", "b1"),
        keyed("eq-1", "a3"),
        keyed("eq-2", "b2"),
        keyed("eq-2", "b3"),
    ];
    let sink = Arc::new(CollectingSink::<String>::new());
    let resolver = Arc::new(
        MapResolver::new()
            .with_source("src", Arc::new(StaticSource::single(contexts)))
            .with_sink("out", Arc::clone(&sink) as Arc<dyn Sink<String>>),
    );

    let engine = WorkflowEngine::with_options(options());
    let workflow = engine
        .create_workflow(
            WorkflowDefinition::new("ordered", "src", "out").into_graph(),
            resolver,
        )
        .unwrap();

    workflow.start().await;
    workflow.join().await;

    let written = sink.written();
    assert_eq!(written.len(), 6);

    let per_key = |key: &str| -> Vec<String> {
        written
            .iter()
            .filter(|ctx| ctx.affinity.value.as_deref() == Some(key))
            .map(|ctx| ctx.message.payload.clone())
            .collect()
    };
    assert_eq!(per_key("eq-1"), vec!["a1", "a2", "a3"]);
    assert_eq!(per_key("eq-2"), vec!["b1", "b2", "b3"]);
}

/// A sink that parks on a semaphore for one chosen payload.
struct SlowForOne {
    written: Mutex<Vec<String>>,
    gate: tokio::sync::Semaphore,
    slow: String,
}

#[async_trait]
impl Sink<String> for SlowForOne {
    async fn write(&self, context: Context<String>) -> StageResult<()> {
        if context.message.payload == self.slow {
            let permit = self.gate.acquire().await?;
            permit.forget();
        }
        self.written
            .lock()
            .unwrap()
            .push(context.message.payload.clone());
        Ok(())
    }
}

#[tokio::test]
async fn distinct_keys_are_processed_concurrently() {
    let sink = Arc::new(SlowForOne {
        written: Mutex::new(Vec::new()),
        gate: tokio::sync::Semaphore::new(0),
        slow: "slow".to_string(),
    });
    let contexts = vec![keyed("eq-slow", "slow"), keyed("eq-fast", "fast")];
    let resolver = Arc::new(
        MapResolver::new()
            .with_source("src", Arc::new(StaticSource::single(contexts)))
            .with_sink("out", Arc::clone(&sink) as Arc<dyn Sink<String>>),
    );

    let engine = WorkflowEngine::with_options(options());
    let workflow = engine
        .create_workflow(
            WorkflowDefinition::new("parallel", "src", "out").into_graph(),
            resolver,
        )
        .unwrap();
    workflow.start().await;

    // The fast key must reach the sink while the slow key is parked.
    let fast_written = async {
        loop {
            if sink.written.lock().unwrap().contains(&"fast".to_string()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), fast_written)
        .await
        .expect("fast key should not be blocked behind the slow key");
    assert!(!sink.written.lock().unwrap().contains(&"slow".to_string()));

    sink.gate.add_permits(1);
    workflow.join().await;
    assert_eq!(sink.written.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn unkeyed_contexts_all_reach_the_sink() {
    let contexts = vec![unkeyed("u1"), unkeyed("u2"), unkeyed("u3"), unkeyed("u4")];
    let sink = Arc::new(CollectingSink::new());
    let resolver = Arc::new(
        MapResolver::new()
            .with_source("src", Arc::new(StaticSource::single(contexts)))
            .with_sink("out", Arc::clone(&sink) as Arc<dyn Sink<String>>),
    );

    let engine = WorkflowEngine::with_options(options());
    let workflow = engine
        .create_workflow(
            WorkflowDefinition::new("unkeyed", "src", "out").into_graph(),
            resolver,
        )
        .unwrap();
    workflow.start().await;
    workflow.join().await;

    let written = sink.written();
    assert_eq!(written.len(), 4);
    // Affinity resolution kept the default kind and no value.
    for ctx in &written {
        assert!(ctx.affinity.kind.is_some());
        assert!(ctx.affinity.value.is_none());
    }
}

/// A step that fails for one chosen payload.
struct FailFor {
    bad: String,
}

#[async_trait]
impl PipelineStep<String> for FailFor {
    async fn apply(&self, context: Context<String>) -> StageResult<Context<String>> {
        if context.message.payload == self.bad {
            return Err(format!("cannot process '{}'", self.bad).into());
        }
        Ok(context)
    }
}

#[tokio::test]
async fn stage_failure_annotates_and_continues() {
    let contexts = vec![keyed("eq-1", "ok-1"), keyed("eq-1", "bad"), keyed("eq-1", "ok-2")];
    let sink = Arc::new(CollectingSink::new());
    let resolver = Arc::new(
        MapResolver::new()
            .with_source("src", Arc::new(StaticSource::single(contexts)))
            .with_step("check", Arc::new(FailFor { bad: "bad".into() }))
            .with_sink("out", Arc::clone(&sink) as Arc<dyn Sink<String>>),
    );

    let engine = WorkflowEngine::with_options(options());
    let workflow = engine
        .create_workflow(
            WorkflowDefinition::new("failing", "src", "out")
                .with_step("check")
                .into_graph(),
            resolver,
        )
        .unwrap();
    workflow.start().await;
    workflow.join().await;

    let written = sink.written();
    assert_eq!(written.len(), 3, "a bad record must not halt the batch");

    let bad = written
        .iter()
        .find(|ctx| ctx.message.payload == "bad")
        .unwrap();
    assert_eq!(bad.meta.retries, 1);
    assert_eq!(
        bad.meta.attribute(ERROR_ATTRIBUTE).unwrap().as_str(),
        Some("cannot process 'bad'")
    );

    for ctx in written.iter().filter(|c| c.message.payload != "bad") {
        assert_eq!(ctx.meta.retries, 0);
        assert!(ctx.meta.attribute(ERROR_ATTRIBUTE).is_none());
    }
}
