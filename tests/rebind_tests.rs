//! Affinity-kind changes flowing from assignments into the engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keyflow::cluster::{AffinityKindMonitor, Assignment, InMemoryAssignmentService};
use keyflow::workflow::builtin::{CollectingSink, StaticSource};
use keyflow::workflow::{
    BackpressurePolicy, BatchingOptions, Command, Context, Headers, MapResolver, Message, Sink,
    WorkflowDefinition, WorkflowEngine, WorkflowRuntime, AFFINITY_VALUE_HEADER,
};
use tokio::sync::mpsc;

fn value_only_ctx(value: &str) -> Context<String> {
    // No explicit kind anywhere: the resolver's default kind applies.
    Context::new(
        Message::now("test", value.to_string()),
        Command::named("process"),
    )
    .with_headers(Headers::empty().with(AFFINITY_VALUE_HEADER, value))
}

fn assignment(kind: &str, generation: u64) -> Assignment {
    let mut key_bindings = BTreeMap::new();
    key_bindings.insert(kind.to_string(), vec!["v-1".to_string()]);
    Assignment {
        group_id: "flow".into(),
        partition: 0,
        owner_node_id: "node-1".into(),
        key_bindings,
        generation,
        updated_at: Utc::now(),
    }
}

fn continuous_options() -> BatchingOptions {
    BatchingOptions::new(
        16,
        4,
        Duration::from_millis(20),
        Duration::from_millis(500),
        BackpressurePolicy::Block,
        true,
    )
    .unwrap()
}

#[tokio::test]
async fn assignment_kind_change_rebinds_running_workflows() {
    let sink = Arc::new(CollectingSink::new());
    let resolver = Arc::new(
        MapResolver::new()
            .with_source("src", Arc::new(StaticSource::empty()))
            .with_sink("out", Arc::clone(&sink) as Arc<dyn Sink<String>>),
    );

    let engine = WorkflowEngine::with_options(continuous_options());
    let affinity = engine.affinity_resolver();
    let runtime = Arc::new(WorkflowRuntime::new(engine, resolver));
    runtime
        .register_linear(WorkflowDefinition::new("flow", "src", "out"))
        .await
        .unwrap();
    runtime.start_all().await;

    // Before any assignment: contexts resolve under the initial kind.
    let initial_kind = affinity.default_kind();
    let workflow = runtime.workflow("flow").await.unwrap();
    workflow.submit(value_only_ctx("v-0")).await.unwrap();

    // Wire the monitor the way a node runtime does: callback feeds a
    // channel, the runtime applies the change and rebinds.
    let service = InMemoryAssignmentService::new();
    let (kind_tx, mut kind_rx) = mpsc::unbounded_channel();
    let monitor = AffinityKindMonitor::new(&service, move |kind| {
        let _ = kind_tx.send(kind.to_string());
    });

    service.publish(assignment("site-id", 1));
    let new_kind = tokio::time::timeout(Duration::from_secs(2), kind_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(new_kind, "site-id");

    runtime.update_affinity_kind(&new_kind);
    runtime.rebind_all().await.unwrap();

    // The rebuilt workflow routes new arrivals under the new kind.
    let workflow = runtime.workflow("flow").await.unwrap();
    workflow.submit(value_only_ctx("v-1")).await.unwrap();
    runtime.stop_all().await;

    let written = sink.written();
    assert_eq!(written.len(), 2);

    let kind_of = |payload: &str| -> String {
        written
            .iter()
            .find(|ctx| ctx.message.payload == payload)
            .unwrap()
            .affinity
            .kind
            .clone()
            .unwrap()
    };
    assert_eq!(kind_of("v-0"), initial_kind);
    assert_eq!(kind_of("v-1"), "site-id");

    monitor.shutdown();
}

#[tokio::test]
async fn duplicate_assignments_do_not_retrigger_rebinding() {
    let service = InMemoryAssignmentService::new();
    let (kind_tx, mut kind_rx) = mpsc::unbounded_channel();
    let monitor = AffinityKindMonitor::new(&service, move |kind| {
        let _ = kind_tx.send(kind.to_string());
    });

    service.publish(assignment("site-id", 1));
    service.publish(assignment("site-id", 2));
    service.publish(assignment("site-id", 3));

    let first = tokio::time::timeout(Duration::from_secs(2), kind_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, "site-id");

    // No further change arrives for same-kind generations.
    let extra = tokio::time::timeout(Duration::from_millis(100), kind_rx.recv()).await;
    assert!(extra.is_err(), "same kind must not re-notify");
    assert_eq!(monitor.last_kind().as_deref(), Some("site-id"));
}
