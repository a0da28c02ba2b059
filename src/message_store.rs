//! The storage surface the engine is written against.
//!
//! [`MessageStore`] is the narrow set of operations the category, decider,
//! and reader need from an append-only log: compare-and-append on one stream,
//! forward reads of one stream, and filtered forward reads across a
//! category. [`MessageDbStore`](crate::MessageDbStore) and
//! [`MemoryMessageStore`](crate::MemoryMessageStore) implement it.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::event::{EventData, StreamName, TimelineEvent, hash_64};

/// The stream version an append expects to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Append regardless of the current version.
    Any,
    /// The stream must be empty. Equivalent to `Exact(-1)`.
    NoStream,
    /// The stream's last event must be at exactly this position.
    Exact(i64),
}

impl ExpectedVersion {
    /// Map a loaded version to the expectation for the next append.
    ///
    /// ```
    /// use eventfold_decider::ExpectedVersion;
    ///
    /// assert_eq!(ExpectedVersion::from_version(-1), ExpectedVersion::NoStream);
    /// assert_eq!(ExpectedVersion::from_version(4), ExpectedVersion::Exact(4));
    /// ```
    pub fn from_version(version: i64) -> Self {
        if version < 0 {
            Self::NoStream
        } else {
            Self::Exact(version)
        }
    }

    /// The concrete version this expectation pins, if any.
    pub fn as_version(self) -> Option<i64> {
        match self {
            Self::Any => None,
            Self::NoStream => Some(-1),
            Self::Exact(v) => Some(v),
        }
    }

    /// Returns `true` if a stream currently at `current` satisfies this
    /// expectation.
    pub fn matches(self, current: i64) -> bool {
        self.as_version().is_none_or(|expected| expected == current)
    }
}

/// Outcome of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// All events were written; carries the stream's new version.
    Written(i64),
    /// The stream was not at the expected version. Nothing was written.
    Conflict,
}

/// Server-side filter applied to a category read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Only events whose type is one of these.
    EventTypes(Vec<String>),
    /// A raw SQL predicate over MessageDB's `messages` table columns.
    Sql(String),
}

impl Condition {
    /// Filter to the given event types.
    pub fn event_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::EventTypes(types.into_iter().map(Into::into).collect())
    }

    /// Render as a SQL predicate for MessageDB's `condition` parameter.
    pub(crate) fn to_sql(&self) -> String {
        match self {
            Self::EventTypes(types) if types.is_empty() => "false".to_string(),
            Self::EventTypes(types) => {
                let quoted: Vec<String> = types
                    .iter()
                    .map(|t| format!("'{}'", t.replace('\'', "''")))
                    .collect();
                format!("type IN ({})", quoted.join(", "))
            }
            Self::Sql(sql) => sql.clone(),
        }
    }
}

/// A member of a fixed-size consumer group.
///
/// Every stream in a category belongs to exactly one member, chosen by
/// hashing the stream's cardinal id. Members `0..size` together see every
/// event exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerGroup {
    /// This consumer's index, `0 <= member < size`.
    pub member: u64,
    /// Number of consumers in the group.
    pub size: u64,
}

impl ConsumerGroup {
    /// Create a validated group member.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConsumerGroup`] unless `size > 0` and
    /// `member < size`.
    pub fn new(member: u64, size: u64) -> Result<Self, StoreError> {
        let group = Self { member, size };
        group.validate()?;
        Ok(group)
    }

    /// Check the member/size pair.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConsumerGroup`] unless `size > 0` and
    /// `member < size`.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.size == 0 || self.member >= self.size {
            return Err(StoreError::InvalidConsumerGroup {
                member: self.member,
                size: self.size,
            });
        }
        Ok(())
    }

    /// The member that owns `stream`, computed the way MessageDB does:
    /// `abs(hash_64(cardinal_id)) mod size`.
    pub fn shard_of(size: u64, stream: &StreamName) -> u64 {
        hash_64(stream.stream_id().cardinal_id()).unsigned_abs() % size.max(1)
    }

    /// Returns `true` if this member owns `stream`.
    pub fn owns(&self, stream: &StreamName) -> bool {
        Self::shard_of(self.size, stream) == self.member
    }
}

/// Parameters of one category read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRead {
    /// Category to read.
    pub category: String,
    /// Smallest global position to return (inclusive).
    pub from_position: i64,
    /// Maximum number of events to return.
    pub batch_size: usize,
    /// Optional server-side filter.
    pub condition: Option<Condition>,
    /// Optional partitioning.
    pub consumer_group: Option<ConsumerGroup>,
}

/// An append-only log of named streams.
///
/// Appends to one stream are atomic and compare-and-swap on the stream's
/// version. Reads never block writers.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append `messages` to `stream` if it is at `expected`.
    ///
    /// Either every message is written, or none is.
    async fn write_messages(
        &self,
        stream: &StreamName,
        messages: Vec<EventData>,
        expected: ExpectedVersion,
    ) -> Result<WriteResult, StoreError>;

    /// Read up to `batch_size` events of `stream` starting at position
    /// `from_version` (inclusive).
    ///
    /// `require_leader` routes the read to the primary when the store has
    /// read replicas.
    async fn read_stream(
        &self,
        stream: &StreamName,
        from_version: i64,
        batch_size: usize,
        require_leader: bool,
    ) -> Result<Vec<TimelineEvent>, StoreError>;

    /// Read only the last event of `stream`.
    async fn read_last_event(
        &self,
        stream: &StreamName,
        require_leader: bool,
    ) -> Result<Option<TimelineEvent>, StoreError>;

    /// Read events across a category in global order.
    async fn read_category(&self, read: &CategoryRead) -> Result<Vec<TimelineEvent>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_version_matches() {
        assert!(ExpectedVersion::Any.matches(-1));
        assert!(ExpectedVersion::Any.matches(12));
        assert!(ExpectedVersion::NoStream.matches(-1));
        assert!(!ExpectedVersion::NoStream.matches(0));
        assert!(ExpectedVersion::Exact(3).matches(3));
        assert!(!ExpectedVersion::Exact(3).matches(4));
    }

    #[test]
    fn no_stream_is_exact_minus_one() {
        assert_eq!(ExpectedVersion::NoStream.as_version(), Some(-1));
        assert_eq!(ExpectedVersion::from_version(-1), ExpectedVersion::NoStream);
        assert_eq!(ExpectedVersion::Any.as_version(), None);
    }

    #[test]
    fn event_types_render_as_in_clause() {
        let condition = Condition::event_types(["EmailSent", "It's"]);
        assert_eq!(condition.to_sql(), "type IN ('EmailSent', 'It''s')");
    }

    #[test]
    fn empty_event_types_match_nothing() {
        assert_eq!(Condition::EventTypes(Vec::new()).to_sql(), "false");
    }

    #[test]
    fn sql_condition_passes_through() {
        let condition = Condition::Sql("messages.time > now()".to_string());
        assert_eq!(condition.to_sql(), "messages.time > now()");
    }

    #[test]
    fn consumer_group_validation() {
        assert!(ConsumerGroup::new(0, 1).is_ok());
        assert!(ConsumerGroup::new(2, 3).is_ok());
        assert!(matches!(
            ConsumerGroup::new(3, 3),
            Err(StoreError::InvalidConsumerGroup { member: 3, size: 3 })
        ));
        assert!(matches!(
            ConsumerGroup::new(0, 0),
            Err(StoreError::InvalidConsumerGroup { .. })
        ));
    }

    #[test]
    fn compound_ids_share_a_shard() {
        let base = StreamName::parse("Order-abc").unwrap();
        let compound = StreamName::parse("Order-abc+audit").unwrap();
        for size in 1..8 {
            assert_eq!(
                ConsumerGroup::shard_of(size, &base),
                ConsumerGroup::shard_of(size, &compound)
            );
        }
    }

    #[test]
    fn exactly_one_member_owns_each_stream() {
        for i in 0..50 {
            let stream = StreamName::parse(&format!("Order-{i}")).unwrap();
            let owners = (0..4)
                .filter(|&m| ConsumerGroup { member: m, size: 4 }.owns(&stream))
                .count();
            assert_eq!(owners, 1);
        }
    }
}
