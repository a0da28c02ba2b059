//! In-process message store.
//!
//! Behaves like MessageDB from the engine's point of view: global positions
//! start at 1, stream positions at 0, appends compare-and-swap on the stream
//! version, consumer groups hash cardinal ids identically, and condition
//! retrieval is off unless enabled. Intended for tests and demos.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{EventData, StreamName, TimelineEvent};
use crate::message_store::{CategoryRead, Condition, ExpectedVersion, MessageStore, WriteResult};

#[derive(Debug, Default)]
struct Log {
    /// Every event in global order; index `i` holds global position `i + 1`.
    events: Vec<TimelineEvent>,
    /// Indices into `events` per stream, in stream order.
    streams: HashMap<StreamName, Vec<usize>>,
}

impl Log {
    fn version(&self, stream: &StreamName) -> i64 {
        self.streams
            .get(stream)
            .map_or(-1, |indices| indices.len() as i64 - 1)
    }
}

/// A [`MessageStore`] held entirely in memory.
///
/// # Examples
///
/// ```
/// use eventfold_decider::MemoryMessageStore;
///
/// let store = MemoryMessageStore::new().with_conditions(true);
/// assert_eq!(store.len(), 0);
/// ```
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    log: RwLock<Log>,
    conditions_enabled: bool,
}

impl MemoryMessageStore {
    /// Create an empty store with condition retrieval disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable condition retrieval on category reads.
    pub fn with_conditions(mut self, enabled: bool) -> Self {
        self.conditions_enabled = enabled;
        self
    }

    /// Total number of events in the store.
    pub fn len(&self) -> usize {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .len()
    }

    /// Returns `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current version of `stream` (`-1` if it has no events).
    pub fn stream_version(&self, stream: &StreamName) -> i64 {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .version(stream)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

fn matches_condition(condition: &Condition, event: &TimelineEvent) -> Result<bool, StoreError> {
    match condition {
        Condition::EventTypes(types) => Ok(types.iter().any(|t| *t == event.event_type)),
        Condition::Sql(sql) => Err(StoreError::UnsupportedCondition(format!(
            "the in-memory store cannot evaluate SQL conditions: {sql}"
        ))),
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn write_messages(
        &self,
        stream: &StreamName,
        messages: Vec<EventData>,
        expected: ExpectedVersion,
    ) -> Result<WriteResult, StoreError> {
        let mut log = self.log.write().unwrap_or_else(PoisonError::into_inner);
        let current = log.version(stream);
        if !expected.matches(current) {
            return Ok(WriteResult::Conflict);
        }

        let recorded_at = now_millis();
        let mut version = current;
        for message in messages {
            version += 1;
            let index = log.events.len();
            log.events.push(TimelineEvent {
                id: message.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                stream_name: stream.clone(),
                event_type: message.event_type,
                position: version,
                global_position: index as i64 + 1,
                data: message.data,
                meta: message.meta,
                recorded_at,
            });
            log.streams.entry(stream.clone()).or_default().push(index);
        }
        Ok(WriteResult::Written(version))
    }

    async fn read_stream(
        &self,
        stream: &StreamName,
        from_version: i64,
        batch_size: usize,
        _require_leader: bool,
    ) -> Result<Vec<TimelineEvent>, StoreError> {
        let log = self.log.read().unwrap_or_else(PoisonError::into_inner);
        let Some(indices) = log.streams.get(stream) else {
            return Ok(Vec::new());
        };
        let skip = usize::try_from(from_version.max(0)).unwrap_or(usize::MAX);
        Ok(indices
            .iter()
            .skip(skip)
            .take(batch_size)
            .map(|&i| log.events[i].clone())
            .collect())
    }

    async fn read_last_event(
        &self,
        stream: &StreamName,
        _require_leader: bool,
    ) -> Result<Option<TimelineEvent>, StoreError> {
        let log = self.log.read().unwrap_or_else(PoisonError::into_inner);
        Ok(log
            .streams
            .get(stream)
            .and_then(|indices| indices.last())
            .map(|&i| log.events[i].clone()))
    }

    async fn read_category(&self, read: &CategoryRead) -> Result<Vec<TimelineEvent>, StoreError> {
        if let Some(group) = read.consumer_group {
            group.validate()?;
        }
        if read.condition.is_some() && !self.conditions_enabled {
            return Err(StoreError::ConditionNotSupported {
                category: read.category.clone(),
            });
        }

        let log = self.log.read().unwrap_or_else(PoisonError::into_inner);
        let skip = usize::try_from(read.from_position.max(1) - 1).unwrap_or(usize::MAX);
        let mut batch = Vec::new();
        for event in log.events.iter().skip(skip) {
            if batch.len() >= read.batch_size {
                break;
            }
            if event.stream_name.category() != read.category {
                continue;
            }
            if let Some(group) = read.consumer_group
                && !group.owns(&event.stream_name)
            {
                continue;
            }
            if let Some(ref condition) = read.condition
                && !matches_condition(condition, event)?
            {
                continue;
            }
            batch.push(event.clone());
        }
        Ok(batch)
    }
}
