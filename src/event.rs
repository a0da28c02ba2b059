//! Stream identity and the wire-level event records shared by every module.
//!
//! Nothing here performs I/O. [`EventData`] is what codecs produce and
//! stores append; [`TimelineEvent`] is what stores hand back, carrying the
//! positions the store assigned.

use std::fmt;

use md5::{Digest, Md5};

/// Error returned when a stream name or one of its parts is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamNameError {
    /// Category was empty.
    #[error("category must not be empty")]
    EmptyCategory,
    /// Category contained the `-` separator.
    #[error("category '{0}' must not contain '-'")]
    InvalidCategory(String),
    /// Stream id was empty.
    #[error("stream id must not be empty")]
    EmptyStreamId,
    /// A full stream name had no `-` separator.
    #[error("stream name '{0}' has no category separator")]
    MissingSeparator(String),
}

/// The per-category identifier of one stream.
///
/// How an application identifier maps onto a `StreamId` (verbatim, hashed,
/// composed) is the caller's policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(String);

impl StreamId {
    /// Wrap an identifier as a stream id.
    ///
    /// # Errors
    ///
    /// Returns [`StreamNameError::EmptyStreamId`] if `id` is empty.
    pub fn new(id: impl Into<String>) -> Result<Self, StreamNameError> {
        let id = id.into();
        if id.is_empty() {
            return Err(StreamNameError::EmptyStreamId);
        }
        Ok(Self(id))
    }

    /// Join several identifier elements with `_` into a single stream id.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventfold_decider::StreamId;
    ///
    /// let id = StreamId::compose(&["tenant-1", "42"]).unwrap();
    /// assert_eq!(id.as_str(), "tenant-1_42");
    /// ```
    pub fn compose(elements: &[&str]) -> Result<Self, StreamNameError> {
        Self::new(elements.join("_"))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part of the id before the first `+`.
    ///
    /// Compound ids such as `"order1+audit"` share the cardinal id
    /// `"order1"`, which is what consumer-group partitioning hashes.
    pub fn cardinal_id(&self) -> &str {
        self.0.split('+').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Full identity of a stream: `(category, stream_id)`.
///
/// Rendered on the wire as `"{category}-{stream_id}"`, the MessageDB
/// convention. Used as the addressing key for stores and caches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamName {
    category: String,
    stream_id: StreamId,
}

impl StreamName {
    /// Build a stream name from a category and a stream id.
    ///
    /// # Errors
    ///
    /// Returns [`StreamNameError`] if the category is empty or contains `-`.
    pub fn new(category: impl Into<String>, stream_id: StreamId) -> Result<Self, StreamNameError> {
        let category = category.into();
        validate_category(&category)?;
        Ok(Self {
            category,
            stream_id,
        })
    }

    /// Parse a wire stream name, splitting at the first `-`.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventfold_decider::StreamName;
    ///
    /// let name = StreamName::parse("Invoice-abc-123").unwrap();
    /// assert_eq!(name.category(), "Invoice");
    /// assert_eq!(name.stream_id().as_str(), "abc-123");
    /// ```
    pub fn parse(raw: &str) -> Result<Self, StreamNameError> {
        let (category, id) = raw
            .split_once('-')
            .ok_or_else(|| StreamNameError::MissingSeparator(raw.to_owned()))?;
        Self::new(category, StreamId::new(id)?)
    }

    /// The category portion.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// The stream id portion.
    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.category, self.stream_id)
    }
}

/// Check that a category name is usable as a stream name prefix.
pub(crate) fn validate_category(category: &str) -> Result<(), StreamNameError> {
    if category.is_empty() {
        return Err(StreamNameError::EmptyCategory);
    }
    if category.contains('-') {
        return Err(StreamNameError::InvalidCategory(category.to_owned()));
    }
    Ok(())
}

/// 64-bit hash of a cardinal id, matching MessageDB's `hash_64`.
///
/// MessageDB takes the first 16 hex digits of the MD5 digest and reads them
/// as a signed big-endian `bigint`.
pub(crate) fn hash_64(value: &str) -> i64 {
    let digest = Md5::digest(value.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(head)
}

/// An event ready to be appended: the codec's output.
///
/// `data` and `meta` are opaque at this boundary; only a codec gives them
/// meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    /// Client-assigned id. Stores generate a UUID v4 when absent.
    pub id: Option<String>,
    /// Event type tag.
    pub event_type: String,
    /// Encoded payload.
    pub data: Option<Vec<u8>>,
    /// Encoded metadata.
    pub meta: Option<Vec<u8>>,
}

impl EventData {
    /// Create an event with a type and no payload.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            data: None,
            meta: None,
        }
    }

    /// Attach an encoded payload.
    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Attach encoded metadata.
    pub fn with_meta(mut self, meta: impl Into<Vec<u8>>) -> Self {
        self.meta = Some(meta.into());
        self
    }

    /// Set the event id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// An event as recorded by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEvent {
    /// Event id (always present once recorded).
    pub id: String,
    /// Stream the event belongs to.
    pub stream_name: StreamName,
    /// Event type tag.
    pub event_type: String,
    /// Zero-based position within the stream.
    pub position: i64,
    /// Position in the store's global log. Starts at 1.
    pub global_position: i64,
    /// Encoded payload.
    pub data: Option<Vec<u8>>,
    /// Encoded metadata.
    pub meta: Option<Vec<u8>>,
    /// Store-assigned timestamp (Unix epoch milliseconds).
    pub recorded_at: u64,
}
