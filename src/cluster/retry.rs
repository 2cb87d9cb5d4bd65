//! Retry policies for store round-trips.
//!
//! Coordination calls are short CAS cycles against a remote store, so
//! transient faults are worth retrying with jittered backoff while
//! contention outcomes (`Ok(None)` / `Ok(false)`) are not errors and never
//! pass through here.
//!
//! # Available Policies
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `store_policy` | 10ms | 500ms | 3 | Individual store operations |
//! | `election_policy` | 50ms | 5s | 10 | Acquire/heartbeat cycles |
//!
//! # Example
//!
//! ```rust,no_run
//! use backon::Retryable;
//! use keyflow::cluster::retry;
//!
//! async fn example() -> Result<(), std::io::Error> {
//!     (|| async {
//!         // your fallible store call
//!         Ok::<_, std::io::Error>(())
//!     })
//!     .retry(retry::store_policy())
//!     .when(|e| e.kind() == std::io::ErrorKind::TimedOut)
//!     .await
//! }
//! ```

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::store::StoreError;

/// Policy for individual store operations.
///
/// Short delays, few attempts: store faults are either momentary or
/// persistent, and coordination callers prefer to fail fast and let the
/// next lease cycle retry naturally.
pub fn store_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
        .with_jitter()
}

/// Policy for full acquire/heartbeat cycles.
///
/// Longer tail to ride out a backend leader change without giving up a
/// lease renewal.
pub fn election_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

/// Run `operation` under [`store_policy`], retrying retriable store errors.
pub async fn with_store_policy<F, Fut, T>(operation: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    operation
        .retry(store_policy())
        .when(StoreError::is_retriable)
        .await
}
