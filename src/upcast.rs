//! Upcasting: turning loosely typed JSON events into validated domain events.
//!
//! An [`UpcastCodec`] wraps a codec producing [`JsonEvent`]s and a registry
//! of per-type validators. The registry draws the line between "don't know
//! this type" (skip) and "know this type but the payload is invalid" (hard
//! error).

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::codec::{Codec, JsonEvent, to_tagged};
use crate::context::Context;
use crate::error::{BoxError, CodecError};
use crate::event::{EventData, TimelineEvent};

type Validator<E> = Box<dyn Fn(Option<Value>) -> Result<E, BoxError> + Send + Sync>;

/// Registry mapping event types to payload validators.
///
/// # Examples
///
/// ```
/// use eventfold_decider::Upcast;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct EmailSent {
///     email: String,
/// }
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// #[serde(tag = "type", content = "data")]
/// enum Event {
///     EmailSent(EmailSent),
/// }
///
/// let upcast = Upcast::new().body("EmailSent", Event::EmailSent);
/// assert!(upcast.handles("EmailSent"));
/// assert!(!upcast.handles("EmailBounced"));
/// ```
pub struct Upcast<E> {
    validators: HashMap<String, Validator<E>>,
}

impl<E> Upcast<E> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            validators: HashMap::new(),
        }
    }

    /// Register a type whose payload deserializes into `T`.
    ///
    /// Deserialization failure is a validation failure. `make` wraps the
    /// parsed body into the domain event.
    pub fn body<T, F>(self, event_type: impl Into<String>, make: F) -> Self
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> E + Send + Sync + 'static,
    {
        self.validate(event_type, move |data| {
            let body = serde_json::from_value::<T>(data.unwrap_or(Value::Null))?;
            Ok(make(body))
        })
    }

    /// Register a type with a custom validator over the raw payload.
    pub fn validate<F>(mut self, event_type: impl Into<String>, validator: F) -> Self
    where
        F: Fn(Option<Value>) -> Result<E, BoxError> + Send + Sync + 'static,
    {
        self.validators
            .insert(event_type.into(), Box::new(validator));
        self
    }

    /// Returns `true` if `event_type` is registered.
    pub fn handles(&self, event_type: &str) -> bool {
        self.validators.contains_key(event_type)
    }

    /// Validate a decoded JSON event.
    ///
    /// Returns `Ok(None)` for unregistered types.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Upcast`] if the registered validator rejects
    /// the payload.
    pub fn upcast(&self, event: JsonEvent) -> Result<Option<E>, CodecError> {
        let Some(validator) = self.validators.get(&event.event_type) else {
            return Ok(None);
        };
        validator(event.data)
            .map(Some)
            .map_err(|source| CodecError::Upcast {
                event_type: event.event_type,
                source,
            })
    }
}

impl<E> Default for Upcast<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Codec that validates the output of a JSON codec into domain events.
///
/// Encoding splits an adjacently tagged `E` into type and payload and hands
/// it to the base codec, so `E` must use
/// `#[serde(tag = "type", content = "data")]`.
///
/// A registered type that the base codec cannot decode (payload or metadata
/// that is not JSON) fails with [`CodecError::Upcast`]. Only unregistered
/// types decode as `None`.
pub struct UpcastCodec<E, B> {
    base: B,
    upcast: Upcast<E>,
}

impl<E, B> UpcastCodec<E, B>
where
    B: Codec<JsonEvent>,
{
    /// Wrap `base` with the validators in `upcast`.
    pub fn new(base: B, upcast: Upcast<E>) -> Self {
        Self { base, upcast }
    }
}

impl<E, B> Codec<E> for UpcastCodec<E, B>
where
    E: Serialize + Send + Sync,
    B: Codec<JsonEvent>,
{
    fn try_decode(&self, event: &TimelineEvent) -> Result<Option<E>, CodecError> {
        match self.base.try_decode(event)? {
            Some(json) => self.upcast.upcast(json),
            None if self.upcast.handles(&event.event_type) => Err(CodecError::Upcast {
                event_type: event.event_type.clone(),
                source: "payload or metadata is not valid JSON".into(),
            }),
            None => Ok(None),
        }
    }

    fn encode(&self, event: &E, ctx: &Context) -> Result<EventData, CodecError> {
        let (event_type, data) = to_tagged(event)?;
        let json = JsonEvent {
            id: None,
            event_type,
            data,
            meta: None,
        };
        self.base.encode(&json, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::codec::test_support::record;
    use proptest::prelude::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Hello {
        hello: String,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tick {
        at: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    enum Event {
        Hello(Hello),
        Tick(Tick),
    }

    /// Accepts `at` as a number or a numeric string, rejecting anything else.
    fn tick(data: Option<Value>) -> Result<Event, BoxError> {
        let at = data
            .as_ref()
            .and_then(|d| d.get("at"))
            .ok_or("missing 'at'")?;
        let at = match at {
            Value::Number(n) => n.as_u64().ok_or("'at' is not a positive integer")?,
            Value::String(s) => s.parse::<u64>()?,
            _ => return Err("unable to decode 'at'".into()),
        };
        Ok(Event::Tick(Tick { at }))
    }

    fn codec() -> UpcastCodec<Event, JsonCodec> {
        UpcastCodec::new(
            JsonCodec,
            Upcast::new()
                .body("Hello", Event::Hello)
                .validate("Tick", tick),
        )
    }

    #[test]
    fn roundtrips_registered_body() {
        let codec = codec();
        let event = Event::Hello(Hello {
            hello: "world".to_string(),
        });
        let encoded = codec.encode(&event, &Context::default()).unwrap();
        let decoded = codec.try_decode(&record(encoded)).unwrap();
        assert_eq!(decoded, Some(event));
    }

    #[test]
    fn roundtrips_custom_validator() {
        let codec = codec();
        let event = Event::Tick(Tick { at: 1_700_000_000 });
        let encoded = codec.encode(&event, &Context::default()).unwrap();
        let decoded = codec.try_decode(&record(encoded)).unwrap();
        assert_eq!(decoded, Some(event));
    }

    #[test]
    fn custom_validator_upcasts_legacy_shape() {
        let legacy = EventData::new("Tick").with_data(br#"{"at":"42"}"#.to_vec());
        let decoded = codec().try_decode(&record(legacy)).unwrap();
        assert_eq!(decoded, Some(Event::Tick(Tick { at: 42 })));
    }

    #[test]
    fn fails_if_body_does_not_validate() {
        let invalid = EventData::new("Hello").with_data(br#"{"hello":5}"#.to_vec());
        let err = codec().try_decode(&record(invalid)).unwrap_err();
        assert!(
            matches!(err, CodecError::Upcast { ref event_type, .. } if event_type == "Hello"),
            "expected Upcast error, got: {err}"
        );
    }

    #[test]
    fn fails_if_custom_validator_rejects() {
        let invalid = JsonCodec
            .encode(
                &JsonEvent::new("Tick", json!({"at": "hello"})),
                &Context::default(),
            )
            .unwrap();
        let result = codec().try_decode(&record(invalid));
        assert!(matches!(result, Err(CodecError::Upcast { .. })));
    }

    #[test]
    fn fails_if_registered_payload_is_not_json() {
        let truncated = EventData::new("Hello").with_data(br#"{"hello":"#.to_vec());
        let err = codec().try_decode(&record(truncated)).unwrap_err();
        assert!(
            matches!(err, CodecError::Upcast { ref event_type, .. } if event_type == "Hello"),
            "expected Upcast error, got: {err}"
        );
    }

    #[test]
    fn fails_if_registered_metadata_is_not_json() {
        let mut event = JsonCodec
            .encode(
                &JsonEvent::new("Tick", json!({"at": 7})),
                &Context::default(),
            )
            .unwrap();
        event.meta = Some(b"{not json".to_vec());
        let result = codec().try_decode(&record(event));
        assert!(matches!(
            result,
            Err(CodecError::Upcast { ref event_type, .. }) if event_type == "Tick"
        ));
    }

    #[test]
    fn unknown_type_with_garbage_payload_is_absent() {
        let unknown = EventData::new("Goodbye").with_data(b"\x00garbage".to_vec());
        assert_eq!(codec().try_decode(&record(unknown)).unwrap(), None);
    }

    #[test]
    fn unknown_type_is_absent_not_an_error() {
        let unknown = EventData::new("Goodbye").with_data(b"{}".to_vec());
        assert_eq!(codec().try_decode(&record(unknown)).unwrap(), None);
    }

    #[test]
    fn registry_reports_handled_types() {
        let upcast: Upcast<Event> = Upcast::new().body("Hello", Event::Hello);
        assert!(upcast.handles("Hello"));
        assert!(!upcast.handles("Tick"));
    }

    proptest! {
        #[test]
        fn roundtrips_any_hello(hello in ".{0,64}") {
            let codec = codec();
            let event = Event::Hello(Hello { hello });
            let encoded = codec.encode(&event, &Context::default()).unwrap();
            prop_assert_eq!(codec.try_decode(&record(encoded)).unwrap(), Some(event));
        }

        #[test]
        fn roundtrips_any_tick(at in any::<u64>()) {
            let codec = codec();
            let event = Event::Tick(Tick { at });
            let encoded = codec.encode(&event, &Context::default()).unwrap();
            prop_assert_eq!(codec.try_decode(&record(encoded)).unwrap(), Some(event));
        }

        #[test]
        fn legacy_string_tick_upcasts(at in any::<u64>()) {
            let legacy = EventData::new("Tick").with_data(format!(r#"{{"at":"{at}"}}"#));
            let decoded = codec().try_decode(&record(legacy)).unwrap();
            prop_assert_eq!(decoded, Some(Event::Tick(Tick { at })));
        }
    }
}
