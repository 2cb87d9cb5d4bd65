//! Affinity key resolution.
//!
//! Resolution order for a context without an explicit affinity:
//! headers first, then meta attributes, for [`AFFINITY_KIND_HEADER`] and
//! [`AFFINITY_VALUE_HEADER`]; finally the resolver's default kind.
//!
//! Resolution never fabricates a value: when no value can be found the
//! result carries the default kind and `value: None`, which tells the
//! engine "no ordering key" — the context is scheduled without
//! serialization guarantees against same-kind traffic.
//!
//! The default kind is swappable at runtime
//! ([`set_default_kind`](AffinityResolver::set_default_kind)); the
//! clustering layer drives that through
//! `WorkflowEngine::update_affinity_kind` when the topology re-keys.

use std::sync::RwLock;

use crate::workflow::context::{Affinity, Context};

/// Header / meta attribute carrying an explicit affinity kind.
pub const AFFINITY_KIND_HEADER: &str = "affinity-kind";

/// Header / meta attribute carrying an explicit affinity value.
pub const AFFINITY_VALUE_HEADER: &str = "affinity-value";

/// Default affinity kind when none is configured.
pub const DEFAULT_AFFINITY_KIND: &str = "message-key";

/// Resolves the `(kind, value)` affinity of a context.
#[derive(Debug)]
pub struct AffinityResolver {
    default_kind: RwLock<String>,
}

impl AffinityResolver {
    /// A resolver with the given default kind.
    pub fn new(default_kind: impl Into<String>) -> Self {
        Self {
            default_kind: RwLock::new(default_kind.into()),
        }
    }

    /// Resolve the affinity for `context`.
    ///
    /// 1. An explicit, fully keyed context affinity wins.
    /// 2. Otherwise headers, then meta attributes, supply kind/value.
    /// 3. A found value without a kind falls back to the default kind.
    /// 4. No value at all yields the default kind with `value: None`.
    pub fn resolve<T>(&self, context: &Context<T>) -> Affinity {
        if !context.affinity.is_empty() {
            return context.affinity.clone();
        }

        let kind = header_or_attribute(context, AFFINITY_KIND_HEADER);
        let value = header_or_attribute(context, AFFINITY_VALUE_HEADER);

        match value {
            Some(value) => Affinity::keyed(kind.unwrap_or_else(|| self.default_kind()), value),
            None => Affinity {
                kind: Some(self.default_kind()),
                value: None,
            },
        }
    }

    /// The current default kind.
    pub fn default_kind(&self) -> String {
        self.default_kind
            .read()
            .expect("default kind lock poisoned")
            .clone()
    }

    /// Replace the default kind used for contexts without an explicit one.
    pub fn set_default_kind(&self, kind: impl Into<String>) {
        *self
            .default_kind
            .write()
            .expect("default kind lock poisoned") = kind.into();
    }
}

impl Default for AffinityResolver {
    fn default() -> Self {
        Self::new(DEFAULT_AFFINITY_KIND)
    }
}

fn header_or_attribute<T>(context: &Context<T>, key: &str) -> Option<String> {
    if let Some(value) = context.headers.get(key) {
        return Some(value.to_string());
    }
    context.meta.attribute(key).map(|value| match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::context::{Command, Headers, Message, Meta};

    fn ctx() -> Context<String> {
        Context::new(
            Message::now("test", "payload".to_string()),
            Command::named("process"),
        )
    }

    #[test]
    fn explicit_affinity_wins() {
        let resolver = AffinityResolver::default();
        let context = ctx()
            .with_affinity(Affinity::keyed("device", "d-1"))
            .with_headers(
                Headers::empty()
                    .with(AFFINITY_KIND_HEADER, "other")
                    .with(AFFINITY_VALUE_HEADER, "x"),
            );
        let resolved = resolver.resolve(&context);
        assert_eq!(resolved, Affinity::keyed("device", "d-1"));
    }

    #[test]
    fn headers_supply_kind_and_value() {
        let resolver = AffinityResolver::default();
        let context = ctx().with_headers(
            Headers::empty()
                .with(AFFINITY_KIND_HEADER, "device")
                .with(AFFINITY_VALUE_HEADER, "d-9"),
        );
        assert_eq!(resolver.resolve(&context), Affinity::keyed("device", "d-9"));
    }

    #[test]
    fn meta_attributes_are_consulted_after_headers() {
        let resolver = AffinityResolver::default();
        let meta = Meta::empty()
            .with_attribute(AFFINITY_VALUE_HEADER, serde_json::json!("m-3"));
        let context = ctx().with_meta(meta);

        // Value from meta, kind defaulted.
        assert_eq!(
            resolver.resolve(&context),
            Affinity::keyed(DEFAULT_AFFINITY_KIND, "m-3")
        );
    }

    #[test]
    fn numeric_attribute_values_are_stringified() {
        let resolver = AffinityResolver::default();
        let meta = Meta::empty().with_attribute(AFFINITY_VALUE_HEADER, serde_json::json!(42));
        let context = ctx().with_meta(meta);
        assert_eq!(
            resolver.resolve(&context),
            Affinity::keyed(DEFAULT_AFFINITY_KIND, "42")
        );
    }

    #[test]
    fn missing_value_yields_none_not_a_fabricated_key() {
        let resolver = AffinityResolver::new("site");
        let context = ctx().with_headers(Headers::empty().with(AFFINITY_KIND_HEADER, "device"));

        let resolved = resolver.resolve(&context);
        assert_eq!(resolved.kind.as_deref(), Some("site"));
        assert!(resolved.value.is_none());
    }

    #[test]
    fn default_kind_is_swappable() {
        let resolver = AffinityResolver::new("equipment-id");
        assert_eq!(resolver.default_kind(), "equipment-id");

        resolver.set_default_kind("site-id");
        assert_eq!(resolver.default_kind(), "site-id");

        let context = ctx().with_headers(Headers::empty().with(AFFINITY_VALUE_HEADER, "v"));
        assert_eq!(resolver.resolve(&context), Affinity::keyed("site-id", "v"));
    }
}
