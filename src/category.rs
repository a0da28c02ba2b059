//! Category store: loading and appending the streams of one aggregate type.
//!
//! A [`Category`] binds an [`Aggregate`] to a [`MessageStore`], a [`Codec`]
//! for its events, and a [`Cache`] of folded state. It knows nothing about
//! decisions or retries; that is the [`Decider`](crate::Decider)'s job.

use std::sync::Arc;

use crate::aggregate::Aggregate;
use crate::cache::{Cache, NoCache};
use crate::codec::Codec;
use crate::context::Context;
use crate::decider::Decider;
use crate::error::StoreError;
use crate::event::{StreamId, StreamName, TimelineEvent};
use crate::message_store::{ExpectedVersion, MessageStore, WriteResult};

/// How fresh a load must be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadOption {
    /// Read every event after the cached version (or the whole stream).
    #[default]
    RequireLoad,
    /// As `RequireLoad`, with reads routed to the leader.
    RequireLeader,
    /// Use a cached entry as-is if there is one; otherwise load.
    AllowStale,
    /// Skip the read and start from the initial state at version `-1`.
    ///
    /// For streams known to be new. A wrong assumption surfaces as a
    /// conflict on append.
    AssumeEmpty,
}

/// How a stream's state is derived from its events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AccessStrategy {
    /// Fold every event in the stream.
    #[default]
    Unoptimized,
    /// Fold only the stream's last event onto the initial state.
    ///
    /// Suits models whose state is fully described by the latest event.
    LatestKnownEvent,
}

/// Tuning for a [`Category`] and the deciders it creates.
///
/// # Examples
///
/// ```
/// use eventfold_decider::{CategoryConfig, LoadOption};
///
/// let config = CategoryConfig {
///     load_option: LoadOption::AllowStale,
///     ..CategoryConfig::default()
/// };
/// assert_eq!(config.batch_size, 500);
/// assert_eq!(config.max_attempts, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryConfig {
    /// Page size for stream reads.
    ///
    /// Default: 500.
    pub batch_size: usize,

    /// Attempts a transaction makes before giving up on conflicts.
    ///
    /// Default: 3.
    pub max_attempts: u32,

    /// Load option deciders use for their first attempt.
    ///
    /// Default: [`LoadOption::RequireLoad`].
    pub load_option: LoadOption,

    /// How state is derived from a stream.
    ///
    /// Default: [`AccessStrategy::Unoptimized`].
    pub access_strategy: AccessStrategy,
}

impl Default for CategoryConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_attempts: 3,
            load_option: LoadOption::default(),
            access_strategy: AccessStrategy::default(),
        }
    }
}

/// Outcome of [`Category::append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResult<S> {
    /// Events were written; carries the new version and folded state.
    Written {
        /// Version after the append.
        version: i64,
        /// State with the appended events folded in.
        state: S,
    },
    /// The stream moved on since it was loaded. Nothing was written.
    Conflict,
}

/// The streams of one aggregate type.
///
/// `Clone` is cheap: the store, codec, and cache are shared.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use eventfold_decider::{Aggregate, Category, MemoryCache, MemoryMessageStore, TypedCodec};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Default)]
/// struct Counter(u64);
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// #[serde(tag = "type", content = "data")]
/// enum CounterEvent {
///     Incremented,
/// }
///
/// impl Aggregate for Counter {
///     const CATEGORY: &'static str = "Counter";
///     type Event = CounterEvent;
///
///     fn apply(self, _event: &CounterEvent) -> Self {
///         Counter(self.0 + 1)
///     }
/// }
///
/// let category = Category::<Counter, _>::new(
///     Arc::new(MemoryMessageStore::new()),
///     TypedCodec::<CounterEvent>::new(),
/// )
/// .with_cache(Arc::new(MemoryCache::<Counter>::new()));
/// ```
pub struct Category<A: Aggregate, C> {
    store: Arc<dyn MessageStore>,
    codec: Arc<C>,
    cache: Arc<dyn Cache<A>>,
    config: CategoryConfig,
}

impl<A: Aggregate, C> Clone for Category<A, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            codec: Arc::clone(&self.codec),
            cache: Arc::clone(&self.cache),
            config: self.config.clone(),
        }
    }
}

impl<A: Aggregate, C> std::fmt::Debug for Category<A, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Category")
            .field("category", &A::CATEGORY)
            .field("config", &self.config)
            .finish()
    }
}

impl<A, C> Category<A, C>
where
    A: Aggregate,
    C: Codec<A::Event>,
{
    /// Create a category with no cache and default configuration.
    pub fn new(store: Arc<dyn MessageStore>, codec: C) -> Self {
        Self {
            store,
            codec: Arc::new(codec),
            cache: Arc::new(NoCache),
            config: CategoryConfig::default(),
        }
    }

    /// Use `cache` for folded state.
    pub fn with_cache(mut self, cache: Arc<dyn Cache<A>>) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: CategoryConfig) -> Self {
        self.config = config;
        self
    }

    /// The category's configuration.
    pub fn config(&self) -> &CategoryConfig {
        &self.config
    }

    /// The full stream name for `id` in this category.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidStreamName`] if the aggregate's category
    /// is not a valid stream name prefix.
    pub fn stream_name(&self, id: StreamId) -> Result<StreamName, StoreError> {
        Ok(StreamName::new(A::CATEGORY, id)?)
    }

    /// A decider for the stream `id`, configured from this category.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidStreamName`] if the aggregate's category
    /// is not a valid stream name prefix.
    pub fn decider(&self, id: StreamId) -> Result<Decider<A, C>, StoreError> {
        let stream = self.stream_name(id)?;
        Ok(Decider::new(self.clone(), stream))
    }

    /// Load the current `(version, state)` of `stream`.
    ///
    /// Version is `-1` for an empty stream. The result is written back to
    /// the cache unless it came from the cache.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails or an event the codec is
    /// responsible for cannot be decoded.
    pub async fn load(&self, stream: &StreamName, option: LoadOption) -> Result<(i64, A), StoreError> {
        match option {
            LoadOption::AssumeEmpty => return Ok((-1, A::default())),
            LoadOption::AllowStale => {
                if let Some(entry) = self.cache.get(stream) {
                    tracing::debug!(stream = %stream, version = entry.version, "using cached state");
                    return Ok((entry.version, entry.state.clone()));
                }
            }
            LoadOption::RequireLoad | LoadOption::RequireLeader => {}
        }

        let require_leader = option == LoadOption::RequireLeader;
        let (version, state) = match self.config.access_strategy {
            AccessStrategy::Unoptimized => {
                let (version, state) = match self.cache.get(stream) {
                    Some(entry) => (entry.version, entry.state.clone()),
                    None => (-1, A::default()),
                };
                self.read_forward(stream, version, state, require_leader)
                    .await?
            }
            AccessStrategy::LatestKnownEvent => self.read_latest(stream, require_leader).await?,
        };

        self.cache.put(stream, version, state.clone());
        Ok((version, state))
    }

    /// Append `events` to `stream` if it is still at `expected_version`.
    ///
    /// `state` must be the state loaded at `expected_version`; on success the
    /// events are folded onto it and the cache is updated.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if encoding or the write fails. A version
    /// conflict is not an error: it is [`SyncResult::Conflict`].
    pub async fn append(
        &self,
        stream: &StreamName,
        expected_version: i64,
        state: A,
        events: Vec<A::Event>,
        ctx: &Context,
    ) -> Result<SyncResult<A>, StoreError> {
        let encoded = events
            .iter()
            .map(|event| self.codec.encode(event, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        let count = encoded.len();

        let expected = ExpectedVersion::from_version(expected_version);
        match self.store.write_messages(stream, encoded, expected).await? {
            WriteResult::Written(version) => {
                let state = state.fold(&events);
                self.cache.put(stream, version, state.clone());
                tracing::info!(stream = %stream, version, count, "appended events");
                Ok(SyncResult::Written { version, state })
            }
            WriteResult::Conflict => {
                tracing::debug!(stream = %stream, expected_version, "append conflicted");
                Ok(SyncResult::Conflict)
            }
        }
    }

    async fn read_forward(
        &self,
        stream: &StreamName,
        mut version: i64,
        mut state: A,
        require_leader: bool,
    ) -> Result<(i64, A), StoreError> {
        let batch_size = self.config.batch_size.max(1);
        let mut read = 0usize;
        loop {
            let page = self
                .store
                .read_stream(stream, version + 1, batch_size, require_leader)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            version = last.position;
            read += page.len();
            let events = self.decode_all(&page)?;
            state = state.fold(&events);
            if page.len() < batch_size {
                break;
            }
        }
        tracing::debug!(stream = %stream, version, count = read, "loaded stream");
        Ok((version, state))
    }

    async fn read_latest(&self, stream: &StreamName, require_leader: bool) -> Result<(i64, A), StoreError> {
        let Some(last) = self.store.read_last_event(stream, require_leader).await? else {
            return Ok((-1, A::default()));
        };
        let events = self.decode_all(std::slice::from_ref(&last))?;
        tracing::debug!(stream = %stream, version = last.position, "loaded latest event");
        Ok((last.position, A::default().fold(&events)))
    }

    fn decode_all(&self, page: &[TimelineEvent]) -> Result<Vec<A::Event>, StoreError> {
        let mut events = Vec::with_capacity(page.len());
        for recorded in page {
            if let Some(event) = self.codec.try_decode(recorded)? {
                events.push(event);
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Counter, CounterEvent, Latest};
    use crate::cache::MemoryCache;
    use crate::codec::TypedCodec;
    use crate::event::EventData;
    use crate::memory::MemoryMessageStore;

    type CounterCategory = Category<Counter, TypedCodec<CounterEvent>>;

    fn setup() -> (Arc<MemoryMessageStore>, CounterCategory) {
        let store = Arc::new(MemoryMessageStore::new());
        let category = Category::new(store.clone(), TypedCodec::new())
            .with_cache(Arc::new(MemoryCache::<Counter>::new()));
        (store, category)
    }

    fn stream(id: &str) -> StreamName {
        StreamName::new("Counter", StreamId::new(id).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn empty_stream_loads_initial_state() {
        let (_, category) = setup();
        let (version, state) = category
            .load(&stream("c1"), LoadOption::RequireLoad)
            .await
            .unwrap();
        assert_eq!(version, -1);
        assert_eq!(state, Counter::default());
    }

    #[tokio::test]
    async fn append_then_load_folds_events() {
        let (_, category) = setup();
        let s = stream("c1");
        let result = category
            .append(
                &s,
                -1,
                Counter::default(),
                vec![CounterEvent::Incremented, CounterEvent::Added { amount: 4 }],
                &Context::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            result,
            SyncResult::Written {
                version: 1,
                state: Counter { value: 5 }
            }
        );

        let (version, state) = category.load(&s, LoadOption::RequireLoad).await.unwrap();
        assert_eq!((version, state.value), (1, 5));
    }

    #[tokio::test]
    async fn stale_append_conflicts() {
        let (_, category) = setup();
        let s = stream("c1");
        category
            .append(&s, -1, Counter::default(), vec![CounterEvent::Incremented], &Context::default())
            .await
            .unwrap();
        let result = category
            .append(&s, -1, Counter::default(), vec![CounterEvent::Incremented], &Context::default())
            .await
            .unwrap();
        assert_eq!(result, SyncResult::Conflict);
    }

    #[tokio::test]
    async fn load_pages_through_long_streams() {
        let (_, category) = setup();
        let category = category.with_config(CategoryConfig {
            batch_size: 3,
            ..CategoryConfig::default()
        });
        let s = stream("c1");
        let events = vec![CounterEvent::Incremented; 10];
        category
            .append(&s, -1, Counter::default(), events, &Context::default())
            .await
            .unwrap();

        let (version, state) = category.load(&s, LoadOption::RequireLoad).await.unwrap();
        assert_eq!((version, state.value), (9, 10));
    }

    #[tokio::test]
    async fn allow_stale_serves_cache_while_require_load_reads_store() {
        let (store, category) = setup();
        let s = stream("c1");
        category
            .append(&s, -1, Counter::default(), vec![CounterEvent::Incremented], &Context::default())
            .await
            .unwrap();

        // Another writer appends behind the cache's back.
        store
            .write_messages(
                &s,
                vec![EventData::new("Incremented")],
                ExpectedVersion::Exact(0),
            )
            .await
            .unwrap();

        let (stale_version, stale) = category.load(&s, LoadOption::AllowStale).await.unwrap();
        assert_eq!((stale_version, stale.value), (0, 1));

        let (version, fresh) = category.load(&s, LoadOption::RequireLoad).await.unwrap();
        assert_eq!((version, fresh.value), (1, 2));
    }

    #[tokio::test]
    async fn require_load_extends_cached_state() {
        let (store, category) = setup();
        let s = stream("c1");
        category
            .append(&s, -1, Counter::default(), vec![CounterEvent::Added { amount: 2 }], &Context::default())
            .await
            .unwrap();
        store
            .write_messages(
                &s,
                vec![EventData::new("Added").with_data(br#"{"amount":3}"#.to_vec())],
                ExpectedVersion::Any,
            )
            .await
            .unwrap();

        let (version, state) = category.load(&s, LoadOption::RequireLeader).await.unwrap();
        assert_eq!((version, state.value), (1, 5));
    }

    #[tokio::test]
    async fn assume_empty_skips_the_read() {
        let (_, category) = setup();
        let s = stream("c1");
        category
            .append(&s, -1, Counter::default(), vec![CounterEvent::Incremented], &Context::default())
            .await
            .unwrap();
        let (version, state) = category.load(&s, LoadOption::AssumeEmpty).await.unwrap();
        assert_eq!((version, state.value), (-1, 0));
    }

    #[tokio::test]
    async fn unknown_events_advance_version_without_changing_state() {
        let (store, category) = setup();
        let s = stream("c1");
        store
            .write_messages(
                &s,
                vec![EventData::new("Renamed"), EventData::new("Incremented")],
                ExpectedVersion::Any,
            )
            .await
            .unwrap();
        let (version, state) = category.load(&s, LoadOption::RequireLoad).await.unwrap();
        assert_eq!((version, state.value), (1, 1));
    }

    #[tokio::test]
    async fn latest_known_event_reads_only_the_last_event() {
        let store = Arc::new(MemoryMessageStore::new());
        let category = Category::<Latest, _>::new(store.clone(), TypedCodec::<CounterEvent>::new())
            .with_config(CategoryConfig {
                access_strategy: AccessStrategy::LatestKnownEvent,
                ..CategoryConfig::default()
            });
        let s = StreamName::new("Latest", StreamId::new("1").unwrap()).unwrap();
        category
            .append(
                &s,
                -1,
                Latest::default(),
                vec![CounterEvent::Incremented, CounterEvent::Added { amount: 7 }],
                &Context::default(),
            )
            .await
            .unwrap();

        let (version, state) = category.load(&s, LoadOption::RequireLoad).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(state.last, Some(CounterEvent::Added { amount: 7 }));
    }

    #[tokio::test]
    async fn decider_uses_aggregate_category() {
        let (_, category) = setup();
        let decider = category.decider(StreamId::new("abc").unwrap()).unwrap();
        assert_eq!(decider.stream_name().to_string(), "Counter-abc");
    }
}
