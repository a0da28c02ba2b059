//! Encode context carried alongside a transaction.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Cross-cutting metadata passed to a codec when events are encoded.
///
/// Carries audit trail and correlation information without polluting the
/// domain event types. Codecs that derive metadata from the context merge
/// these fields into the event's `meta` object.
///
/// # Examples
///
/// ```
/// use eventfold_decider::Context;
/// use serde_json::json;
///
/// let ctx = Context::default()
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_metadata(json!({"source": "api"}));
///
/// assert_eq!(ctx.actor.as_deref(), Some("user-42"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// assert!(ctx.metadata.is_some());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    /// Identity of whoever caused the transaction (e.g. a user ID).
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across streams.
    pub correlation_id: Option<String>,
    /// Id of the message that caused this transaction.
    pub causation_id: Option<String>,
    /// Arbitrary metadata merged into encoded event metadata.
    pub metadata: Option<Value>,
}

impl Context {
    /// Set the actor identity.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the causation ID.
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    /// Set arbitrary metadata.
    ///
    /// Only JSON objects are merged into event metadata; other values are
    /// ignored by [`to_meta`](Context::to_meta).
    pub fn with_metadata(mut self, meta: Value) -> Self {
        self.metadata = Some(meta);
        self
    }

    /// Build the metadata object codecs attach to encoded events.
    ///
    /// Starts from `metadata` (if it is an object), then adds `actor`,
    /// `correlation_id`, and `causation_id`. Returns `None` when the result
    /// would be empty.
    pub fn to_meta(&self) -> Option<Value> {
        let mut meta_map = match self.metadata {
            Some(Value::Object(ref map)) => map.clone(),
            _ => Map::new(),
        };

        let fields = [
            ("actor", &self.actor),
            ("correlation_id", &self.correlation_id),
            ("causation_id", &self.causation_id),
        ];
        for (key, value) in fields {
            if let Some(v) = value {
                meta_map.insert(key.to_string(), Value::String(v.clone()));
            }
        }

        if meta_map.is_empty() {
            None
        } else {
            Some(Value::Object(meta_map))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_context_has_no_fields_set() {
        let ctx = Context::default();
        assert_eq!(ctx.actor, None);
        assert_eq!(ctx.correlation_id, None);
        assert_eq!(ctx.causation_id, None);
        assert_eq!(ctx.metadata, None);
    }

    #[test]
    fn builder_chains_all_fields() {
        let ctx = Context::default()
            .with_actor("admin")
            .with_correlation_id("req-abc")
            .with_causation_id("msg-1")
            .with_metadata(json!({"source": "test"}));

        assert_eq!(ctx.actor.as_deref(), Some("admin"));
        assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc"));
        assert_eq!(ctx.causation_id.as_deref(), Some("msg-1"));
        assert_eq!(ctx.metadata, Some(json!({"source": "test"})));
    }

    #[test]
    fn builder_accepts_string_owned() {
        let ctx = Context::default()
            .with_actor(String::from("svc-payments"))
            .with_correlation_id(String::from("id-007"));

        assert_eq!(ctx.actor.as_deref(), Some("svc-payments"));
        assert_eq!(ctx.correlation_id.as_deref(), Some("id-007"));
    }

    #[test]
    fn empty_context_produces_no_meta() {
        assert_eq!(Context::default().to_meta(), None);
    }

    #[test]
    fn to_meta_merges_fields_into_metadata_object() {
        let ctx = Context::default()
            .with_actor("user-1")
            .with_correlation_id("corr-1")
            .with_metadata(json!({"source": "api"}));

        let meta = ctx.to_meta().expect("meta should be present");
        assert_eq!(meta["source"], "api");
        assert_eq!(meta["actor"], "user-1");
        assert_eq!(meta["correlation_id"], "corr-1");
        assert!(meta.get("causation_id").is_none());
    }

    #[test]
    fn non_object_metadata_is_ignored() {
        let ctx = Context::default().with_metadata(json!("just a string"));
        assert_eq!(ctx.to_meta(), None);
    }

    #[test]
    fn context_serde_roundtrip() {
        let ctx = Context::default()
            .with_actor("user-1")
            .with_correlation_id("corr-1")
            .with_metadata(json!({"key": "value"}));

        let json = serde_json::to_string(&ctx).expect("serialization should succeed");
        let deserialized: Context =
            serde_json::from_str(&json).expect("deserialization should succeed");

        assert_eq!(deserialized, ctx);
    }
}
