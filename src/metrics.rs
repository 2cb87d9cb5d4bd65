//! Prometheus metrics for coordination and workflow execution.
//!
//! All metrics are registered against a crate-private registry exposed via
//! [`registry`]. Embedders that already run a metrics endpoint can merge the
//! gathered families into their own exposition output.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec_with_registry, IntCounterVec, Registry,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Leader election outcomes, labeled by `outcome` (acquired | contended | released).
pub static ELECTION_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "keyflow_election_outcomes_total",
        "Leader election attempts by outcome",
        &["outcome"],
        REGISTRY.clone()
    )
    .expect("election metric registration")
});

/// Distributed lock outcomes, labeled by `outcome` (acquired | contended | refreshed | released).
pub static LOCK_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "keyflow_lock_outcomes_total",
        "Distributed lock operations by outcome",
        &["outcome"],
        REGISTRY.clone()
    )
    .expect("lock metric registration")
});

/// Membership events, labeled by `event` (joined | heartbeat | suspected | down | left | removed).
pub static MEMBERSHIP_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "keyflow_membership_events_total",
        "Membership events emitted by the failure detector",
        &["event"],
        REGISTRY.clone()
    )
    .expect("membership metric registration")
});

/// Contexts fully processed (reached the sink), labeled by workflow name.
pub static CONTEXTS_PROCESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "keyflow_contexts_processed_total",
        "Contexts delivered to the sink",
        &["workflow"],
        REGISTRY.clone()
    )
    .expect("contexts metric registration")
});

/// Contexts discarded by the Drop backpressure policy, labeled by workflow name.
pub static BACKPRESSURE_DROPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "keyflow_backpressure_drops_total",
        "Contexts discarded because a full queue used the Drop policy",
        &["workflow"],
        REGISTRY.clone()
    )
    .expect("backpressure metric registration")
});

/// Stage failures survived by the batch loop, labeled by workflow name.
pub static STAGE_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        "keyflow_stage_failures_total",
        "Pipeline stage or sink errors absorbed during batch processing",
        &["workflow"],
        REGISTRY.clone()
    )
    .expect("stage failure metric registration")
});

/// The registry holding all keyflow metrics.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

/// Gather all keyflow metric families.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}
