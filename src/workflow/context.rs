//! Immutable processing context.
//!
//! A [`Context`] is the unit of work flowing through `Source → handlers →
//! steps → Sink`. It is never mutated in place: every `with_*` method
//! consumes the context and returns a new one with copied-on-write
//! headers/metadata, so a context logically shared between retry and
//! audit paths can never alias.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Meta attribute key under which stage failures are recorded.
pub const ERROR_ATTRIBUTE: &str = "error";

/// Command information propagated through processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Command name.
    pub name: String,
    /// Optional command schema version.
    pub version: Option<String>,
    /// Optional correlation id for tracing a request across nodes.
    pub correlation_id: Option<String>,
}

impl Command {
    /// A command with only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            correlation_id: None,
        }
    }
}

/// Immutable message headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    values: HashMap<String, String>,
}

impl Headers {
    /// Empty headers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up a header value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Return new headers with `key` set to `value`.
    pub fn with(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut values = self.values.clone();
        values.insert(key.into(), value.into());
        Self { values }
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no headers.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Payload plus basic information delivered by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<T> {
    /// Kind of source that produced the message.
    pub source_type: String,
    /// The payload itself.
    pub payload: T,
    /// When the message was produced.
    pub timestamp: DateTime<Utc>,
    /// Optional partitioning key carried from the transport.
    pub key: Option<String>,
}

impl<T> Message<T> {
    /// A message stamped with the current time and no key.
    pub fn now(source_type: impl Into<String>, payload: T) -> Self {
        Self {
            source_type: source_type.into(),
            payload,
            timestamp: Utc::now(),
            key: None,
        }
    }

    /// Set the partitioning key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Processing metadata accumulated while a context moves through stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Source instance that produced the context.
    pub source_id: Option<String>,
    /// Name of the current (or last) pipeline step.
    pub pipeline_step: Option<String>,
    /// How many times processing of this context has failed.
    pub retries: u32,
    attributes: HashMap<String, serde_json::Value>,
}

impl Meta {
    /// Empty metadata.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Look up a custom attribute.
    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    /// All custom attributes.
    pub fn attributes(&self) -> &HashMap<String, serde_json::Value> {
        &self.attributes
    }

    /// Return new metadata with `key` set to `value`.
    pub fn with_attribute(&self, key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut attributes = self.attributes.clone();
        attributes.insert(key.into(), value);
        Self {
            attributes,
            ..self.clone()
        }
    }

    /// Return new metadata recording the named pipeline step.
    pub fn with_pipeline_step(&self, step: impl Into<String>) -> Self {
        Self {
            pipeline_step: Some(step.into()),
            ..self.clone()
        }
    }
}

/// Affinity key: a `(kind, value)` pair used to route and serially order
/// related contexts.
///
/// A populated value means "order me against everything sharing this
/// key". A kind without a value signals that no ordering key exists for
/// this context; such contexts are scheduled without serialization
/// guarantees against same-kind traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Affinity {
    /// Routing kind (e.g. which id namespace the value belongs to).
    pub kind: Option<String>,
    /// Routing value within the kind.
    pub value: Option<String>,
}

impl Affinity {
    /// The absent affinity.
    pub fn none() -> Self {
        Self::default()
    }

    /// A fully keyed affinity.
    pub fn keyed(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            value: Some(value.into()),
        }
    }

    /// Whether this affinity is missing its kind or value.
    pub fn is_empty(&self) -> bool {
        self.kind.is_none() || self.value.is_none()
    }
}

/// The immutable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context<T> {
    /// Command information.
    pub command: Command,
    /// Message headers.
    pub headers: Headers,
    /// The message being processed.
    pub message: Message<T>,
    /// Processing metadata.
    pub meta: Meta,
    /// Routing affinity.
    pub affinity: Affinity,
}

impl<T> Context<T> {
    /// A fresh context with empty headers, metadata, and affinity.
    pub fn new(message: Message<T>, command: Command) -> Self {
        Self {
            command,
            headers: Headers::empty(),
            message,
            meta: Meta::empty(),
            affinity: Affinity::none(),
        }
    }

    /// Replace the metadata.
    pub fn with_meta(self, meta: Meta) -> Self {
        Self { meta, ..self }
    }

    /// Replace the headers.
    pub fn with_headers(self, headers: Headers) -> Self {
        Self { headers, ..self }
    }

    /// Replace the affinity.
    pub fn with_affinity(self, affinity: Affinity) -> Self {
        Self { affinity, ..self }
    }

    /// Annotate a stage failure: records the error message under
    /// [`ERROR_ATTRIBUTE`] and increments the retry counter. Downstream
    /// stages and sinks decide whether to retry or drop based on it.
    pub fn with_error(self, error: &str) -> Self {
        let meta = Meta {
            retries: self.meta.retries + 1,
            ..self
                .meta
                .with_attribute(ERROR_ATTRIBUTE, serde_json::Value::String(error.to_string()))
        };
        Self { meta, ..self }
    }
}
