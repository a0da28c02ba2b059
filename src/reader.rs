//! Paginated reads across every stream of a category.

use std::sync::Arc;

use crate::error::StoreError;
use crate::event::{TimelineEvent, validate_category};
use crate::message_store::{CategoryRead, Condition, ConsumerGroup, MessageStore};

/// One page of a category read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Events in ascending global position.
    pub messages: Vec<TimelineEvent>,
    /// Highest global position in `messages`, or the requested start
    /// position if the batch is empty.
    pub checkpoint: i64,
    /// `true` if fewer than `batch_size` events came back: the reader has
    /// reached the end of the category for now.
    pub is_tail: bool,
}

/// Reads a category in global order, optionally filtered and partitioned.
///
/// `Clone` is cheap: the store is shared.
#[derive(Clone)]
pub struct CategoryReader {
    store: Arc<dyn MessageStore>,
}

impl std::fmt::Debug for CategoryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CategoryReader").finish_non_exhaustive()
    }
}

impl CategoryReader {
    /// Create a reader over `store`.
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Read up to `batch_size` events of `category` with global position at
    /// least `from_position`. A `batch_size` of 0 is read as 1.
    ///
    /// With a `consumer_group`, only streams owned by that member are
    /// returned. With a `condition`, the store filters server-side, which
    /// fails with [`StoreError::ConditionNotSupported`] if the store has
    /// condition retrieval disabled.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConsumerGroup`] for an out-of-range
    /// group, [`StoreError::InvalidStreamName`] for an invalid category, or
    /// the store's read error.
    pub async fn read_category_messages(
        &self,
        category: &str,
        from_position: i64,
        batch_size: usize,
        condition: Option<&Condition>,
        consumer_group: Option<ConsumerGroup>,
    ) -> Result<Batch, StoreError> {
        validate_category(category)?;
        if let Some(group) = consumer_group {
            group.validate()?;
        }
        let batch_size = batch_size.max(1);

        let read = CategoryRead {
            category: category.to_string(),
            from_position,
            batch_size,
            condition: condition.cloned(),
            consumer_group,
        };
        let messages = self.store.read_category(&read).await?;

        let checkpoint = messages
            .last()
            .map_or(from_position, |last| last.global_position);
        let is_tail = messages.len() < batch_size;
        tracing::debug!(
            category,
            from = from_position,
            count = messages.len(),
            checkpoint,
            is_tail,
            "read category batch"
        );
        Ok(Batch {
            messages,
            checkpoint,
            is_tail,
        })
    }
}
