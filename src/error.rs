//! Crate-level error types for codecs, store access, and transactions.

use crate::event::StreamNameError;

/// Boxed error used for validator and handler failures supplied by callers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned when encoding or decoding an event fails.
///
/// Decoding an event type a codec does not know is *not* an error; codecs
/// return `Ok(None)` for that case. These variants are reserved for data
/// the codec is responsible for but cannot process.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A registered event type carried a payload its validator rejected.
    #[error("upcast of event type '{event_type}' failed: {source}")]
    Upcast {
        /// The event type whose validator failed.
        event_type: String,
        /// The validator's error.
        #[source]
        source: BoxError,
    },

    /// JSON (de)serialization failed while encoding.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A domain event did not serialize to an adjacently tagged object.
    #[error("event did not serialize to an object with a string 'type' field")]
    NotTagged,

    /// A compressed payload could not be decoded.
    #[error("compression error: {0}")]
    Compression(String),
}

/// Error returned by message stores, categories, and readers.
///
/// Version conflicts are deliberately absent: they are an expected outcome
/// of an append and surface as [`WriteResult::Conflict`](crate::WriteResult::Conflict).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A category read asked for a server-side condition but the store does
    /// not have condition retrieval enabled.
    #[error(
        "condition not supported: retrieval with a server-side condition is not enabled \
         for this store (category '{category}')"
    )]
    ConditionNotSupported {
        /// Category the read targeted.
        category: String,
    },

    /// The store cannot evaluate this kind of condition at all.
    #[error("unsupported condition: {0}")]
    UnsupportedCondition(String),

    /// Consumer group member/size pair is out of range.
    #[error("invalid consumer group: member {member} of size {size}")]
    InvalidConsumerGroup {
        /// Requested member index.
        member: u64,
        /// Requested group size.
        size: u64,
    },

    /// A stream name read back from the store could not be parsed.
    #[error(transparent)]
    InvalidStreamName(#[from] StreamNameError),

    /// Encoding or decoding an event failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The database rejected or failed a query.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Local I/O failure (file checkpoints).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serializing a checkpoint failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error returned when a decider transaction fails.
///
/// Generic over `E`, the error type of the decision function itself.
#[derive(Debug, thiserror::Error)]
pub enum TransactError<E: std::error::Error + Send + Sync + 'static> {
    /// The decision function failed. Never retried.
    #[error(transparent)]
    Decide(E),

    /// Every attempt hit a version conflict.
    #[error(
        "optimistic concurrency conflict on '{stream}': {attempts} attempts exhausted \
         (last observed version {version})"
    )]
    RetryBudgetExceeded {
        /// Stream the transaction targeted.
        stream: String,
        /// Number of attempts made.
        attempts: u32,
        /// Version the final attempt expected.
        version: i64,
    },

    /// Loading or appending failed for a reason other than a conflict.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl<E: std::error::Error + Send + Sync + 'static> TransactError<E> {
    /// Returns `true` if the transaction gave up after repeated conflicts.
    pub fn is_retry_budget_exceeded(&self) -> bool {
        matches!(self, Self::RetryBudgetExceeded { .. })
    }
}

/// Error that stops a [`CategorySource`](crate::CategorySource).
///
/// The batch being handled when the error occurred has not been
/// checkpointed, so it is delivered again when the source restarts.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Reading the category failed.
    #[error("category read failed: {0}")]
    Store(#[source] StoreError),

    /// Reading or writing the checkpoint failed.
    #[error("checkpoint store failed: {0}")]
    Checkpoint(#[source] StoreError),

    /// The handler rejected a stream's events.
    #[error("handler failed for stream '{stream}': {source}")]
    Handler {
        /// Stream whose events were being handled.
        stream: String,
        /// The handler's error.
        #[source]
        source: BoxError,
    },

    /// The background task panicked or was cancelled.
    #[error("source task failed: {0}")]
    Task(String),
}
