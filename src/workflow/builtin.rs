//! Built-in stages: small sources, steps, and sinks used for wiring
//! workflows together in tests and simple deployments.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use crate::workflow::context::{Context, Headers};
use crate::workflow::stage::{PipelineStep, Sink, Source, StageResult};

/// Source that serves a fixed sequence of batches, then reports empty.
pub struct StaticSource<T> {
    batches: Mutex<VecDeque<Vec<Context<T>>>>,
}

impl<T> StaticSource<T> {
    /// A source with no batches at all.
    pub fn empty() -> Self {
        Self {
            batches: Mutex::new(VecDeque::new()),
        }
    }

    /// A source serving exactly one batch.
    pub fn single(batch: Vec<Context<T>>) -> Self {
        Self::batches(vec![batch])
    }

    /// A source serving the given batches in order.
    pub fn batches(batches: Vec<Vec<Context<T>>>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
        }
    }
}

#[async_trait]
impl<T: Send + Sync> Source<T> for StaticSource<T> {
    async fn read(&self) -> Vec<Context<T>> {
        self.batches
            .lock()
            .expect("source batches poisoned")
            .pop_front()
            .unwrap_or_default()
    }
}

/// Step that returns the context unchanged.
pub struct PassThroughStep;

#[async_trait]
impl<T: Send + Sync + 'static> PipelineStep<T> for PassThroughStep {
    async fn apply(&self, context: Context<T>) -> StageResult<Context<T>> {
        Ok(context)
    }
}

/// Step that logs the command name and affinity of every context.
pub struct LoggingStep;

#[async_trait]
impl<T: Send + Sync + 'static> PipelineStep<T> for LoggingStep {
    async fn apply(&self, context: Context<T>) -> StageResult<Context<T>> {
        info!(
            command = %context.command.name,
            affinity_kind = context.affinity.kind.as_deref().unwrap_or("-"),
            affinity_value = context.affinity.value.as_deref().unwrap_or("-"),
            retries = context.meta.retries,
            "Processing context"
        );
        Ok(context)
    }
}

/// Step that stamps a fixed header onto every context.
pub struct HeaderEnrichmentStep {
    key: String,
    value: String,
}

impl HeaderEnrichmentStep {
    /// A step setting `key` to `value` on every context.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> PipelineStep<T> for HeaderEnrichmentStep {
    async fn apply(&self, context: Context<T>) -> StageResult<Context<T>> {
        let headers: Headers = context.headers.with(self.key.clone(), self.value.clone());
        Ok(context.with_headers(headers))
    }
}

/// Sink that discards everything.
pub struct NoopSink;

#[async_trait]
impl<T: Send + Sync + 'static> Sink<T> for NoopSink {
    async fn write(&self, _context: Context<T>) -> StageResult<()> {
        Ok(())
    }
}

/// Sink that collects every written context, in arrival order.
pub struct CollectingSink<T> {
    written: Mutex<Vec<Context<T>>>,
}

impl<T: Clone> CollectingSink<T> {
    /// An empty collector.
    pub fn new() -> Self {
        Self {
            written: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of everything written so far.
    pub fn written(&self) -> Vec<Context<T>> {
        self.written.lock().expect("sink collection poisoned").clone()
    }

    /// Number of contexts written so far.
    pub fn len(&self) -> usize {
        self.written.lock().expect("sink collection poisoned").len()
    }

    /// Whether nothing was written yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Default for CollectingSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> Sink<T> for CollectingSink<T> {
    async fn write(&self, context: Context<T>) -> StageResult<()> {
        self.written
            .lock()
            .expect("sink collection poisoned")
            .push(context);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::context::{Command, Message};

    fn ctx(payload: &str) -> Context<String> {
        Context::new(
            Message::now("test", payload.to_string()),
            Command::named("process"),
        )
    }

    #[tokio::test]
    async fn static_source_serves_batches_in_order() {
        let source = StaticSource::batches(vec![vec![ctx("a")], vec![ctx("b"), ctx("c")]]);
        assert_eq!(source.read().await.len(), 1);
        assert_eq!(source.read().await.len(), 2);
        assert!(source.read().await.is_empty());
        assert!(source.read().await.is_empty());
    }

    #[tokio::test]
    async fn header_enrichment_adds_header() {
        let step = HeaderEnrichmentStep::new("env", "test");
        let result = step.apply(ctx("a")).await.unwrap();
        assert_eq!(result.headers.get("env"), Some("test"));
    }

    #[tokio::test]
    async fn collecting_sink_preserves_order() {
        let sink = CollectingSink::new();
        sink.write(ctx("a")).await.unwrap();
        sink.write(ctx("b")).await.unwrap();

        let written = sink.written();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].message.payload, "a");
        assert_eq!(written[1].message.payload, "b");
    }
}
