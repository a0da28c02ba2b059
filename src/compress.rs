//! Payload compression wrapper for any codec.
//!
//! Each payload and metadata blob is stored with a one-byte marker: `0` for
//! the raw bytes, `1` for raw deflate. On encode the smaller form wins, so
//! small payloads that deflate would only grow stay raw.

use std::io::Write;

use flate2::write::DeflateEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};

use crate::codec::Codec;
use crate::context::Context;
use crate::error::CodecError;
use crate::event::{EventData, TimelineEvent};

/// Marker for bytes stored as-is.
const RAW: u8 = 0;
/// Marker for raw-deflate bytes.
const DEFLATE: u8 = 1;

/// Wraps a codec, compressing its encoded payload and metadata.
///
/// # Examples
///
/// ```
/// use eventfold_decider::{Codec, Context, DeflateCodec, JsonCodec, JsonEvent};
/// use serde_json::json;
///
/// let codec = DeflateCodec::new(JsonCodec);
/// let encoded = codec
///     .encode(&JsonEvent::new("Noted", json!({"text": "a".repeat(500)})), &Context::default())
///     .unwrap();
/// assert!(encoded.data.unwrap().len() < 500);
/// ```
#[derive(Debug, Clone, Default)]
pub struct DeflateCodec<B> {
    base: B,
    level: Compression,
}

impl<B> DeflateCodec<B> {
    /// Wrap `base` using the default compression level.
    pub fn new(base: B) -> Self {
        Self {
            base,
            level: Compression::default(),
        }
    }

    /// Set the deflate level, `0` (none) to `9` (best). Higher values are
    /// clamped to `9`.
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = Compression::new(level.min(9));
        self
    }
}

impl<E, B> Codec<E> for DeflateCodec<B>
where
    B: Codec<E>,
{
    fn try_decode(&self, event: &TimelineEvent) -> Result<Option<E>, CodecError> {
        let mut inflated = event.clone();
        inflated.data = match event.data {
            Some(ref bytes) => unpack(bytes)?,
            None => None,
        };
        inflated.meta = match event.meta {
            Some(ref bytes) => unpack(bytes)?,
            None => None,
        };
        self.base.try_decode(&inflated)
    }

    fn encode(&self, event: &E, ctx: &Context) -> Result<EventData, CodecError> {
        let mut encoded = self.base.encode(event, ctx)?;
        encoded.data = encoded
            .data
            .map(|d| pack(&d, self.level))
            .transpose()?;
        encoded.meta = encoded
            .meta
            .map(|m| pack(&m, self.level))
            .transpose()?;
        Ok(encoded)
    }
}

/// Compress `raw` if that makes it smaller, and prefix the marker byte.
fn pack(raw: &[u8], level: Compression) -> Result<Vec<u8>, CodecError> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(raw.len()), level);
    encoder
        .write_all(raw)
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    let deflated = encoder
        .finish()
        .map_err(|e| CodecError::Compression(e.to_string()))?;

    let (marker, body) = if deflated.len() < raw.len() {
        (DEFLATE, deflated.as_slice())
    } else {
        (RAW, raw)
    };
    let mut packed = Vec::with_capacity(body.len() + 1);
    packed.push(marker);
    packed.extend_from_slice(body);
    Ok(packed)
}

/// Strip the marker byte and inflate if needed. Empty input is absent.
fn unpack(packed: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
    let Some((&marker, body)) = packed.split_first() else {
        return Ok(None);
    };
    match marker {
        RAW => Ok(Some(body.to_vec())),
        DEFLATE => inflate(body).map(Some),
        other => Err(CodecError::Compression(format!(
            "unknown encoding marker {other}"
        ))),
    }
}

/// Inflate a raw-deflate stream.
///
/// The stream need not carry a final block: writers that end with a sync
/// flush leave the inflater mid-stream once all input is consumed, and that
/// is accepted as the end of the data.
fn inflate(input: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut inflater = Decompress::new(false);
    let mut out = Vec::with_capacity(input.len().saturating_mul(4).max(64));

    loop {
        if out.len() == out.capacity() {
            out.reserve(out.capacity());
        }
        let consumed = inflater.total_in() as usize;
        let produced = inflater.total_out();
        let status = inflater
            .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
            .map_err(|e| CodecError::Compression(e.to_string()))?;

        if status == Status::StreamEnd {
            return Ok(out);
        }
        let has_room = out.len() < out.capacity();
        if inflater.total_in() as usize == input.len() && has_room {
            return Ok(out);
        }
        let progressed = inflater.total_in() as usize > consumed || inflater.total_out() > produced;
        if !progressed && has_room {
            return Err(CodecError::Compression(
                "deflate stream made no progress".to_string(),
            ));
        }
    }
}
