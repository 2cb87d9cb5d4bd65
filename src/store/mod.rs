//! Cluster state store contract.
//!
//! Everything the coordination layer persists — leader records, lock
//! records, membership entries — lives behind the [`ClusterStore`] trait:
//! a key/value capability with TTLs, prefix scans, change notification,
//! and, crucially, an atomic compare-and-swap. Leader election and locking
//! are plain optimistic-concurrency loops over that CAS primitive; the
//! store, not this crate, is responsible for linearizability.
//!
//! # Backends
//!
//! - [`InMemoryStore`]: reference implementation for tests and single-node
//!   deployments.
//! - Production deployments plug in a replicated backend (a Raft-applied
//!   table, a compacted-topic view, etc.) by implementing the same trait.
//!
//! # Value encoding
//!
//! Values are opaque [`Bytes`]. The services in [`crate::cluster`] encode
//! their records as JSON documents via [`encode`]/[`decode`], and pass the
//! exact bytes they read back as the `expected` CAS argument, so equality
//! is structural equality of the serialized record.
//!
//! # Error Handling Patterns
//!
//! Contention is not an error: a lost CAS race surfaces as `Ok(false)` and
//! callers translate it into "not acquired". [`StoreError`] is reserved
//! for real faults — the backend being unreachable, undecodable payloads,
//! invalid arguments. Callers that see [`StoreError::Unavailable`] must
//! treat their coordination state as unknown, never as "not leader".

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::InMemoryStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by a [`ClusterStore`] backend or by record codecs.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or failed internally.
    ///
    /// Callers must treat coordination state as undetermined: an
    /// unavailable store never implies "not leader" or "lock free".
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A persisted record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A caller-supplied argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error from the backend.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether retrying the operation may succeed.
    ///
    /// Argument and codec failures are permanent; infrastructure failures
    /// are transient and safe to retry with backoff.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}

/// Kind of change observed on a watched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventType {
    /// A value was written (insert or overwrite).
    Put,
    /// A value was explicitly deleted.
    Delete,
    /// A value lapsed past its TTL and was collected.
    Expire,
}

/// Change notification delivered to watchers.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    /// What happened.
    pub event_type: StoreEventType,
    /// Full key the event applies to.
    pub key: String,
    /// New value for [`StoreEventType::Put`], `None` otherwise.
    pub value: Option<Bytes>,
}

/// Key/value store with TTLs, compare-and-swap, and change notification.
///
/// All operations are safe to call concurrently from any node. The
/// `compare_and_set` contract: the swap succeeds iff the stored bytes are
/// equal to `expected` at the moment of the atomic check; an absent key
/// never matches a non-absent `expected` (use [`put_if_absent`] for
/// creation).
///
/// [`put_if_absent`]: ClusterStore::put_if_absent
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Read the value at `key`, if present and unexpired.
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;

    /// Write `value` at `key` unconditionally with the given TTL.
    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> StoreResult<()>;

    /// Write `value` only if `key` is absent (or expired). Returns whether
    /// the write happened.
    async fn put_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> StoreResult<bool>;

    /// Atomically replace the value at `key` with `new_value` iff the
    /// current value equals `expected`. Returns whether the swap happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &[u8],
        new_value: Bytes,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Delete the value at `key`. Returns whether a value was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// List all live `(key, value)` pairs whose key starts with `prefix`.
    async fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, Bytes)>>;

    /// Subscribe to change events for keys starting with `prefix`.
    ///
    /// Slow subscribers may observe [`broadcast::error::RecvError::Lagged`]
    /// and should resynchronize with [`get`](ClusterStore::get) or
    /// [`scan`](ClusterStore::scan).
    fn watch(&self, prefix: &str) -> broadcast::Receiver<StoreEvent>;
}

/// Serialize a record into store bytes.
pub fn encode<T: Serialize>(value: &T) -> StoreResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Deserialize a record from store bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn encode_decode_round_trip() {
        let sample = Sample {
            name: "a".into(),
            count: 3,
        };
        let bytes = encode(&sample).unwrap();
        let back: Sample = decode(&bytes).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode::<Sample>(b"not json").unwrap_err();
        assert!(matches!(err, StoreError::Serde(_)));
        assert!(!err.is_retriable());
    }

    #[test]
    fn retriable_classification() {
        assert!(StoreError::Unavailable("down".into()).is_retriable());
        assert!(StoreError::Io(std::io::Error::other("net")).is_retriable());
        assert!(!StoreError::InvalidArgument("bad".into()).is_retriable());
        assert!(!StoreError::NotFound("x".into()).is_retriable());
    }
}
