//! Category consumption loop with checkpointing.
//!
//! A [`CategorySource`] repeatedly reads a batch from a category, hands the
//! events to a [`Handler`] one stream at a time, and records the batch's
//! checkpoint once every stream in it has been handled. Delivery is
//! at-least-once: a batch interrupted by an error or a crash is read again
//! from the last checkpoint.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::Instrument;

use crate::checkpoint::CheckpointStore;
use crate::error::{BoxError, SourceError};
use crate::event::{StreamName, TimelineEvent};
use crate::message_store::{Condition, ConsumerGroup};
use crate::reader::CategoryReader;

/// Consumes the events of one stream within a batch.
///
/// Implemented for any
/// `Fn(StreamName, Vec<TimelineEvent>) -> impl Future<Output = Result<(), BoxError>>`.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle `events`, all from `stream`, in stream order.
    ///
    /// Returning an error stops the source without checkpointing the batch.
    async fn handle(&self, stream: &StreamName, events: &[TimelineEvent]) -> Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(StreamName, Vec<TimelineEvent>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn handle(&self, stream: &StreamName, events: &[TimelineEvent]) -> Result<(), BoxError> {
        self(stream.clone(), events.to_vec()).await
    }
}

/// Configuration for a [`CategorySource`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_decider::{ConsumerGroup, SourceConfig};
///
/// let config = SourceConfig {
///     consumer_group: Some(ConsumerGroup::new(0, 2).unwrap()),
///     tail_sleep: Duration::from_millis(250),
///     ..SourceConfig::new("Invoice", "emailer")
/// };
/// assert_eq!(config.batch_size, 500);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    /// Category to consume.
    pub category: String,

    /// Name of the consuming group, used as the checkpoint key.
    pub group_name: String,

    /// Maximum events per batch.
    ///
    /// Default: 500.
    pub batch_size: usize,

    /// How long to wait before polling again once caught up.
    ///
    /// Default: 1 second.
    pub tail_sleep: Duration,

    /// Consume only this member's share of the category.
    ///
    /// Default: `None` (the whole category).
    pub consumer_group: Option<ConsumerGroup>,

    /// Server-side filter for category reads.
    ///
    /// Default: `None`.
    pub condition: Option<Condition>,
}

impl SourceConfig {
    /// Default configuration for `group_name` consuming `category`.
    pub fn new(category: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            group_name: group_name.into(),
            ..Self::default()
        }
    }

    /// The key this configuration's checkpoint is stored under.
    ///
    /// Each consumer group member checkpoints independently, as
    /// `"{group_name}:{member}/{size}"`.
    pub fn checkpoint_group(&self) -> String {
        match self.consumer_group {
            Some(group) => format!("{}:{}/{}", self.group_name, group.member, group.size),
            None => self.group_name.clone(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            category: String::new(),
            group_name: String::new(),
            batch_size: 500,
            tail_sleep: Duration::from_secs(1),
            consumer_group: None,
            condition: None,
        }
    }
}

/// What one [`pump`](CategorySource::pump) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Events handed to the handler.
    pub handled: usize,
    /// Checkpoint after the batch (unchanged if it was empty).
    pub checkpoint: Option<i64>,
    /// `true` if the batch reached the end of the category.
    pub is_tail: bool,
}

/// Reads a category batch by batch and feeds a [`Handler`].
pub struct CategorySource<H> {
    reader: CategoryReader,
    checkpoints: Arc<dyn CheckpointStore>,
    handler: H,
    config: SourceConfig,
    group: String,
    next_position: Option<i64>,
    committed: Option<i64>,
    position: Arc<AtomicI64>,
    caught_up: Arc<AtomicBool>,
}

impl<H> std::fmt::Debug for CategorySource<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CategorySource")
            .field("category", &self.config.category)
            .field("group", &self.group)
            .field("committed", &self.committed)
            .finish_non_exhaustive()
    }
}

impl<H: Handler> CategorySource<H> {
    /// Create a source. Nothing is read until the first pump.
    pub fn new(
        reader: CategoryReader,
        checkpoints: Arc<dyn CheckpointStore>,
        handler: H,
        config: SourceConfig,
    ) -> Self {
        let group = config.checkpoint_group();
        Self {
            reader,
            checkpoints,
            handler,
            config,
            group,
            next_position: None,
            committed: None,
            position: Arc::new(AtomicI64::new(0)),
            caught_up: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The last checkpoint written or loaded, if any.
    pub fn checkpoint(&self) -> Option<i64> {
        self.committed
    }

    /// Read and handle one batch.
    ///
    /// On the first call the stored checkpoint is loaded and reading
    /// resumes just after it. Events are grouped by stream, keeping each
    /// stream's order and the order in which streams first appear. The
    /// checkpoint is written only after every group was handled, and only
    /// for non-empty batches.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the read, a handler, or the checkpoint
    /// write fails. The batch is not checkpointed in that case.
    pub async fn pump(&mut self) -> Result<Progress, SourceError> {
        let from = self.start_position().await?;
        let batch = self
            .reader
            .read_category_messages(
                &self.config.category,
                from,
                self.config.batch_size,
                self.config.condition.as_ref(),
                self.config.consumer_group,
            )
            .await
            .map_err(SourceError::Store)?;

        let is_tail = batch.is_tail;
        let checkpoint = batch.checkpoint;
        let handled = batch.messages.len();
        if handled == 0 {
            self.mark_tail(is_tail);
            return Ok(Progress {
                handled,
                checkpoint: self.committed,
                is_tail,
            });
        }

        for (stream, events) in group_by_stream(batch.messages) {
            self.handler
                .handle(&stream, &events)
                .await
                .map_err(|source| SourceError::Handler {
                    stream: stream.to_string(),
                    source,
                })?;
        }

        if self.committed.is_none_or(|committed| checkpoint > committed) {
            self.checkpoints
                .write(&self.config.category, &self.group, checkpoint)
                .await
                .map_err(SourceError::Checkpoint)?;
            self.committed = Some(checkpoint);
            self.position.store(checkpoint, Ordering::Release);
            tracing::debug!(checkpoint, count = handled, "committed checkpoint");
        }
        self.next_position = Some(checkpoint + 1);
        self.mark_tail(is_tail);

        Ok(Progress {
            handled,
            checkpoint: self.committed,
            is_tail,
        })
    }

    /// Pump until `shutdown` is signalled or an error occurs.
    ///
    /// Sleeps for `tail_sleep` whenever the end of the category is reached.
    /// Shutdown is honoured between batches, never in the middle of one.
    /// Dropping every sender of `shutdown` also stops the loop.
    ///
    /// # Errors
    ///
    /// Returns the first [`SourceError`] encountered.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SourceError> {
        tracing::info!("source starting");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let progress = self.pump().await?;
            if progress.is_tail {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.tail_sleep) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
        tracing::info!(checkpoint = ?self.committed, "source stopped");
        Ok(())
    }

    /// Spawn [`run`](CategorySource::run) on the current runtime.
    pub fn start(self) -> SourceHandle
    where
        H: 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let caught_up = Arc::clone(&self.caught_up);
        let position = Arc::clone(&self.position);
        let span = tracing::info_span!(
            "source",
            category = %self.config.category,
            group = %self.group,
        );
        let task = tokio::spawn(self.run(shutdown_rx).instrument(span));
        SourceHandle {
            shutdown_tx,
            caught_up,
            position,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    async fn start_position(&mut self) -> Result<i64, SourceError> {
        if let Some(next) = self.next_position {
            return Ok(next);
        }
        let stored = self
            .checkpoints
            .read(&self.config.category, &self.group)
            .await
            .map_err(SourceError::Checkpoint)?;
        if let Some(checkpoint) = stored {
            self.position.store(checkpoint, Ordering::Release);
        }
        self.committed = stored;
        let next = stored.map_or(0, |checkpoint| checkpoint + 1);
        tracing::info!(checkpoint = ?stored, from = next, "resuming category");
        self.next_position = Some(next);
        Ok(next)
    }

    fn mark_tail(&self, is_tail: bool) {
        if is_tail && !self.caught_up.swap(true, Ordering::AcqRel) {
            tracing::info!("caught up");
        }
    }
}

/// Split a batch into per-stream runs, in order of first appearance.
fn group_by_stream(messages: Vec<TimelineEvent>) -> Vec<(StreamName, Vec<TimelineEvent>)> {
    let mut groups: Vec<(StreamName, Vec<TimelineEvent>)> = Vec::new();
    let mut index: HashMap<StreamName, usize> = HashMap::new();
    for message in messages {
        match index.get(&message.stream_name) {
            Some(&i) => groups[i].1.push(message),
            None => {
                index.insert(message.stream_name.clone(), groups.len());
                groups.push((message.stream_name.clone(), vec![message]));
            }
        }
    }
    groups
}

/// Handle to a running [`CategorySource`].
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct SourceHandle {
    shutdown_tx: watch::Sender<bool>,
    caught_up: Arc<AtomicBool>,
    position: Arc<AtomicI64>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<Result<(), SourceError>>>>>,
}

impl std::fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHandle")
            .field("caught_up", &self.is_caught_up())
            .field("position", &self.position())
            .finish()
    }
}

impl SourceHandle {
    /// Returns `true` once the source has reached the end of the category
    /// at least once.
    pub fn is_caught_up(&self) -> bool {
        self.caught_up.load(Ordering::Acquire)
    }

    /// The last committed checkpoint (`0` if none yet).
    pub fn position(&self) -> i64 {
        self.position.load(Ordering::Acquire)
    }

    /// Returns `true` once the source task has exited, whether it was shut
    /// down or stopped on an error. [`shutdown`](Self::shutdown) reports
    /// which.
    pub fn is_finished(&self) -> bool {
        self.task
            .try_lock()
            .is_ok_and(|task| task.as_ref().is_none_or(|t| t.is_finished()))
    }

    /// Signal the source to stop and wait for it.
    ///
    /// Calling `shutdown` more than once is safe: later calls return
    /// `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the source, if it stopped on its own
    /// because of one, or [`SourceError::Task`] if the task panicked.
    pub async fn shutdown(&self) -> Result<(), SourceError> {
        // The receiver is gone if the task already exited.
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle
                .await
                .map_err(|e| SourceError::Task(e.to_string()))?,
            None => Ok(()),
        }
    }
}
