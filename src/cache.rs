//! Process-local state cache keyed by stream.
//!
//! A [`Category`](crate::Category) consults its cache before reading a stream
//! and writes back the `(version, state)` pair after every load and
//! successful append. Entries are immutable and replaced wholesale, so a
//! reader holding an `Arc<CacheEntry<S>>` never observes a torn update.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::event::StreamName;

/// A cached `(version, state)` pair for one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<S> {
    /// Stream the entry belongs to.
    pub stream_name: StreamName,
    /// Version of the last event folded into `state` (`-1` if empty).
    pub version: i64,
    /// The folded state.
    pub state: S,
    /// When the entry was written.
    pub observed_at: Instant,
}

/// Storage for folded stream state.
///
/// Implementations must be safe to share between tasks. Only the owning
/// category writes to its cache.
pub trait Cache<S>: Send + Sync {
    /// Look up the entry for `stream`, if one is held and still fresh.
    fn get(&self, stream: &StreamName) -> Option<Arc<CacheEntry<S>>>;

    /// Store `(version, state)` for `stream`, replacing any existing entry.
    fn put(&self, stream: &StreamName, version: i64, state: S);
}

/// A cache that holds nothing. Every load reads from the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl<S> Cache<S> for NoCache {
    fn get(&self, _stream: &StreamName) -> Option<Arc<CacheEntry<S>>> {
        None
    }

    fn put(&self, _stream: &StreamName, _version: i64, _state: S) {}
}

/// In-memory cache with optional capacity and age limits.
///
/// With a capacity set, inserting a new stream into a full cache evicts the
/// entry observed longest ago. With a `max_age` set, older entries are
/// treated as absent (and dropped when next looked up).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_decider::{Cache, MemoryCache, StreamName};
///
/// let cache: MemoryCache<u64> = MemoryCache::new()
///     .with_capacity(10_000)
///     .with_max_age(Duration::from_secs(60));
///
/// let stream = StreamName::parse("Counter-1").unwrap();
/// cache.put(&stream, 4, 5);
/// assert_eq!(cache.get(&stream).map(|e| e.version), Some(4));
/// ```
#[derive(Debug)]
pub struct MemoryCache<S> {
    entries: RwLock<HashMap<StreamName, Arc<CacheEntry<S>>>>,
    capacity: Option<usize>,
    max_age: Option<Duration>,
}

impl<S> MemoryCache<S> {
    /// Create an unbounded cache.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: None,
            max_age: None,
        }
    }

    /// Bound the number of streams held. A capacity of zero holds nothing.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Treat entries older than `max_age` as absent.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Number of entries currently held, fresh or not.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &CacheEntry<S>) -> bool {
        self.max_age
            .is_some_and(|max_age| entry.observed_at.elapsed() > max_age)
    }
}

impl<S> Default for MemoryCache<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Send + Sync> Cache<S> for MemoryCache<S> {
    fn get(&self, stream: &StreamName) -> Option<Arc<CacheEntry<S>>> {
        let entry = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries.get(stream).cloned()?
        };
        if !self.is_expired(&entry) {
            return Some(entry);
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        // Only drop it if nobody replaced it in the meantime.
        if entries
            .get(stream)
            .is_some_and(|current| Arc::ptr_eq(current, &entry))
        {
            entries.remove(stream);
        }
        None
    }

    fn put(&self, stream: &StreamName, version: i64, state: S) {
        if self.capacity == Some(0) {
            return;
        }
        let entry = Arc::new(CacheEntry {
            stream_name: stream.clone(),
            version,
            state,
            observed_at: Instant::now(),
        });

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(capacity) = self.capacity
            && !entries.contains_key(stream)
            && entries.len() >= capacity
        {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.observed_at)
                .map(|(name, _)| name.clone());
            if let Some(oldest) = oldest {
                tracing::debug!(stream = %oldest, "evicting cache entry");
                entries.remove(&oldest);
            }
        }
        entries.insert(stream.clone(), entry);
    }
}
