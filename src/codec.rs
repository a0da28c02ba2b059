//! Codecs: the mapping between typed domain events and wire [`EventData`].
//!
//! Decoding never fails for events a codec does not recognise; it returns
//! `Ok(None)` and the event is skipped. Errors are reserved for data the
//! codec is responsible for but cannot process.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::Context;
use crate::error::CodecError;
use crate::event::{EventData, TimelineEvent};

/// Bidirectional mapping between domain events `E` and wire events.
pub trait Codec<E>: Send + Sync {
    /// Decode a recorded event.
    ///
    /// Returns `Ok(None)` for event types this codec does not handle.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the codec recognises the event but its
    /// payload is invalid.
    fn try_decode(&self, event: &TimelineEvent) -> Result<Option<E>, CodecError>;

    /// Encode a domain event for appending.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the event cannot be serialized.
    fn encode(&self, event: &E, ctx: &Context) -> Result<EventData, CodecError>;
}

/// A loosely typed JSON event: the typed form of [`JsonCodec`].
#[derive(Debug, Clone, PartialEq)]
pub struct JsonEvent {
    /// Event id, passed through unchanged.
    pub id: Option<String>,
    /// Event type tag.
    pub event_type: String,
    /// Payload.
    pub data: Option<Value>,
    /// Metadata, passed through unchanged.
    pub meta: Option<Value>,
}

impl JsonEvent {
    /// Create an event with a type and payload.
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            data: Some(data),
            meta: None,
        }
    }

    /// Set the event id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the metadata.
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Codec that stores payload and metadata as JSON text.
///
/// `id` and `meta` are passed through unchanged when present. An event
/// without `meta` gets metadata derived from the encode [`Context`], if any.
/// Payloads that are not valid JSON decode as `None`: they were not written
/// by this codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec<JsonEvent> for JsonCodec {
    fn try_decode(&self, event: &TimelineEvent) -> Result<Option<JsonEvent>, CodecError> {
        let Some(data) = parse_json(event.data.as_deref()) else {
            return Ok(None);
        };
        let Some(meta) = parse_json(event.meta.as_deref()) else {
            return Ok(None);
        };
        Ok(Some(JsonEvent {
            id: Some(event.id.clone()),
            event_type: event.event_type.clone(),
            data,
            meta,
        }))
    }

    fn encode(&self, event: &JsonEvent, ctx: &Context) -> Result<EventData, CodecError> {
        let meta = match event.meta {
            Some(ref meta) => Some(meta.clone()),
            None => ctx.to_meta(),
        };
        Ok(EventData {
            id: event.id.clone(),
            event_type: event.event_type.clone(),
            data: event.data.as_ref().map(serde_json::to_vec).transpose()?,
            meta: meta.as_ref().map(serde_json::to_vec).transpose()?,
        })
    }
}

/// Parse optional JSON bytes. The outer `Option` is `None` on malformed input.
fn parse_json(bytes: Option<&[u8]>) -> Option<Option<Value>> {
    match bytes {
        None => Some(None),
        Some([]) => Some(None),
        Some(b) => serde_json::from_slice(b).ok().map(Some),
    }
}

/// Codec for serde enums using the adjacently tagged convention.
///
/// The domain event must use `#[serde(tag = "type", content = "data")]`.
/// The `"type"` field becomes the event type and the `"data"` field the
/// payload. Unknown or malformed events decode as `None` for forward
/// compatibility.
pub struct TypedCodec<E> {
    _marker: PhantomData<fn() -> E>,
}

impl<E> TypedCodec<E> {
    /// Create a typed codec.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<E> Default for TypedCodec<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Codec<E> for TypedCodec<E>
where
    E: Serialize + DeserializeOwned,
{
    fn try_decode(&self, event: &TimelineEvent) -> Result<Option<E>, CodecError> {
        let Some(data) = parse_json(event.data.as_deref()) else {
            return Ok(None);
        };
        Ok(from_tagged(&event.event_type, data))
    }

    fn encode(&self, event: &E, ctx: &Context) -> Result<EventData, CodecError> {
        let (event_type, data) = to_tagged(event)?;
        Ok(EventData {
            id: None,
            event_type,
            data: data.as_ref().map(serde_json::to_vec).transpose()?,
            meta: ctx.to_meta().as_ref().map(serde_json::to_vec).transpose()?,
        })
    }
}

/// Split an adjacently tagged event into its type and payload.
///
/// Fieldless variants serialize as `{"type": "Name"}` and yield no payload.
pub(crate) fn to_tagged<E: Serialize>(event: &E) -> Result<(String, Option<Value>), CodecError> {
    let value = serde_json::to_value(event)?;
    let Value::Object(mut obj) = value else {
        return Err(CodecError::NotTagged);
    };
    let event_type = match obj.remove("type") {
        Some(Value::String(s)) => s,
        _ => return Err(CodecError::NotTagged),
    };
    Ok((event_type, obj.remove("data")))
}

/// Reassemble an adjacently tagged event from its type and payload.
pub(crate) fn from_tagged<E: DeserializeOwned>(event_type: &str, data: Option<Value>) -> Option<E> {
    let tagged = match data {
        None | Some(Value::Null) => serde_json::json!({ "type": event_type }),
        Some(data) => serde_json::json!({ "type": event_type, "data": data }),
    };
    serde_json::from_value(tagged).ok()
}
