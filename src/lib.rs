//! Event-sourced deciders and category consumers on top of MessageDB.
//!
//! A [`Decider`] loads a stream's state through a [`Category`], runs a
//! decision against it, and appends the resulting events with optimistic
//! concurrency, retrying on conflict. A [`CategorySource`] consumes a whole
//! category in batches, optionally split across a consumer group, and
//! checkpoints its progress in a [`CheckpointStore`].

mod aggregate;
mod cache;
mod category;
mod checkpoint;
mod codec;
mod compress;
mod context;
mod decider;
mod error;
mod event;
mod memory;
mod message_db;
mod message_store;
mod reader;
mod source;
mod upcast;

pub use aggregate::Aggregate;
pub use cache::{Cache, CacheEntry, MemoryCache, NoCache};
pub use category::{AccessStrategy, Category, CategoryConfig, LoadOption, SyncResult};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, PgCheckpointStore};
pub use codec::{Codec, JsonCodec, JsonEvent, TypedCodec};
pub use compress::DeflateCodec;
pub use context::Context;
pub use decider::Decider;
pub use error::{BoxError, CodecError, SourceError, StoreError, TransactError};
pub use event::{EventData, StreamId, StreamName, StreamNameError, TimelineEvent};
pub use memory::MemoryMessageStore;
pub use message_db::{DEFAULT_CONNECTION_STRING, MessageDbConfig, MessageDbStore};
pub use message_store::{
    CategoryRead, Condition, ConsumerGroup, ExpectedVersion, MessageStore, WriteResult,
};
pub use reader::{Batch, CategoryReader};
pub use source::{CategorySource, Handler, Progress, SourceConfig, SourceHandle};
pub use upcast::{Upcast, UpcastCodec};
