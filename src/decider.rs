//! Transactional load/decide/append against a single stream.
//!
//! A [`Decider`] is the entry point application services use. Each
//! transaction loads the stream's state, hands it to a decision function,
//! and appends the resulting events with the loaded version as the
//! expected version. When another writer got there first, the stream is
//! reloaded and the decision re-run, up to the configured attempt budget.
//!
//! No in-process lock is held: concurrent transactions on the same stream
//! are serialized by the store's compare-and-append alone.

use std::convert::Infallible;
use std::future::{Future, ready};

use tracing::Instrument;

use crate::aggregate::Aggregate;
use crate::category::{Category, LoadOption, SyncResult};
use crate::codec::Codec;
use crate::context::Context;
use crate::error::{StoreError, TransactError};
use crate::event::StreamName;

/// Decision engine bound to one stream of a [`Category`].
///
/// Cheap to create; typically built per request via
/// [`Category::decider`].
///
/// # Examples
///
/// ```
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// use std::sync::Arc;
/// use eventfold_decider::{Aggregate, Category, MemoryMessageStore, StreamId, TypedCodec};
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
/// );
/// let decider = category.decider(StreamId::new("c-1")?)?;
///
/// decider.transact(|_| vec![CounterEvent::Incremented]).await?;
/// assert_eq!(decider.query(|state| state.0).await?, 1);
/// # Ok(())
/// # }
/// ```
pub struct Decider<A: Aggregate, C> {
    category: Category<A, C>,
    stream: StreamName,
    load_option: LoadOption,
    max_attempts: u32,
    context: Context,
}

impl<A, C> Decider<A, C>
where
    A: Aggregate,
    C: Codec<A::Event>,
{
    pub(crate) fn new(category: Category<A, C>, stream: StreamName) -> Self {
        let config = category.config();
        let load_option = config.load_option;
        let max_attempts = config.max_attempts;
        Self {
            category,
            stream,
            load_option,
            max_attempts,
            context: Context::default(),
        }
    }

    /// Override the load option used for the first attempt.
    pub fn with_load_option(mut self, option: LoadOption) -> Self {
        self.load_option = option;
        self
    }

    /// Override the attempt budget. Values below 1 are treated as 1.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Context handed to the codec when events are encoded.
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// The stream this decider targets.
    pub fn stream_name(&self) -> &StreamName {
        &self.stream
    }

    /// Run `decide` against the current state and append what it returns.
    ///
    /// `decide` may be invoked more than once if the stream changes
    /// underneath it, and must not have side effects.
    ///
    /// # Errors
    ///
    /// Returns [`TransactError::RetryBudgetExceeded`] when every attempt
    /// conflicts, or [`TransactError::Store`] on store or codec failure.
    pub async fn transact<F>(&self, mut decide: F) -> Result<(), TransactError<Infallible>>
    where
        F: FnMut(&A) -> Vec<A::Event>,
    {
        self.run(|state| ready(Ok(((), decide(&state))))).await
    }

    /// As [`transact`](Decider::transact), also returning a value computed
    /// alongside the events.
    ///
    /// # Errors
    ///
    /// As [`transact`](Decider::transact).
    pub async fn transact_result<F, R>(&self, mut decide: F) -> Result<R, TransactError<Infallible>>
    where
        F: FnMut(&A) -> (R, Vec<A::Event>),
    {
        self.run(|state| ready(Ok(decide(&state)))).await
    }

    /// As [`transact_result`](Decider::transact_result) with an async,
    /// fallible decision.
    ///
    /// A decision error aborts the transaction immediately; it is never
    /// retried.
    ///
    /// # Errors
    ///
    /// Returns [`TransactError::Decide`] with the decision's error, plus the
    /// errors of [`transact`](Decider::transact).
    pub async fn transact_async<F, Fut, R, E>(&self, decide: F) -> Result<R, TransactError<E>>
    where
        F: FnMut(A) -> Fut,
        Fut: Future<Output = Result<(R, Vec<A::Event>), E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.run(decide).await
    }

    /// Load the state with the decider's load option and render it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the load fails.
    pub async fn query<F, R>(&self, render: F) -> Result<R, StoreError>
    where
        F: FnOnce(&A) -> R,
    {
        self.query_with(self.load_option, render).await
    }

    /// Load the state with `option` and render it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the load fails.
    pub async fn query_with<F, R>(&self, option: LoadOption, render: F) -> Result<R, StoreError>
    where
        F: FnOnce(&A) -> R,
    {
        let (_, state) = self.category.load(&self.stream, option).await?;
        Ok(render(&state))
    }

    async fn run<F, Fut, R, E>(&self, decide: F) -> Result<R, TransactError<E>>
    where
        F: FnMut(A) -> Fut,
        Fut: Future<Output = Result<(R, Vec<A::Event>), E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let span = tracing::info_span!(
            "transact",
            category = A::CATEGORY,
            stream = %self.stream,
        );
        self.attempt(decide).instrument(span).await
    }

    async fn attempt<F, Fut, R, E>(&self, mut decide: F) -> Result<R, TransactError<E>>
    where
        F: FnMut(A) -> Fut,
        Fut: Future<Output = Result<(R, Vec<A::Event>), E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let max_attempts = self.max_attempts.max(1);
        let (mut version, mut state) = self.category.load(&self.stream, self.load_option).await?;
        let mut attempt = 1;
        loop {
            let (result, events) = decide(state.clone())
                .await
                .map_err(TransactError::Decide)?;
            if events.is_empty() {
                return Ok(result);
            }

            let outcome = self
                .category
                .append(&self.stream, version, state, events, &self.context)
                .await?;
            match outcome {
                SyncResult::Written { .. } => return Ok(result),
                SyncResult::Conflict if attempt >= max_attempts => {
                    tracing::warn!(attempt, version, "giving up after repeated conflicts");
                    return Err(TransactError::RetryBudgetExceeded {
                        stream: self.stream.to_string(),
                        attempts: attempt,
                        version,
                    });
                }
                SyncResult::Conflict => {
                    tracing::warn!(attempt, version, "version conflict, reloading");
                    (version, state) = self
                        .category
                        .load(&self.stream, LoadOption::RequireLoad)
                        .await?;
                    attempt += 1;
                }
            }
        }
    }
}
