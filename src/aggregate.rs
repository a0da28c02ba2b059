//! The fold contract: how a stream's events become state.

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state, and its
/// [`Default`] value is the initial state of an empty stream. State is built
/// by folding events through [`apply`](Aggregate::apply).
///
/// # Contract
///
/// - [`apply`](Aggregate::apply) must be a pure, total function. It takes
///   ownership of the current state and a reference to an event, returning
///   the next state.
/// - [`fold`](Aggregate::fold) must be incrementally composable: folding
///   `E1` then `E2` must equal folding `E1 ++ E2` in one call. The provided
///   implementation satisfies this by construction; overrides must too,
///   because cached state is extended with only the events read since it
///   was cached.
pub trait Aggregate: Default + Clone + Send + Sync + 'static {
    /// Category this aggregate's streams live in (e.g. `"Invoice"`).
    /// Must not contain `-`.
    const CATEGORY: &'static str;

    /// The events this aggregate produces and folds.
    type Event: Send + Sync + 'static;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::Event) -> Self;

    /// Fold a contiguous run of events onto the current state.
    fn fold(self, events: &[Self::Event]) -> Self {
        events.iter().fold(self, |state, event| state.apply(event))
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::Aggregate;
    use serde::{Deserialize, Serialize};

    /// A simple counter aggregate used as a test fixture.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Counter {
        pub value: u64,
    }

    /// Events folded by the `Counter` aggregate.
    ///
    /// Uses adjacently tagged serialization (`"type"` + `"data"`), the
    /// convention for domain events in this crate.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum CounterEvent {
        Incremented,
        Decremented,
        Added { amount: u64 },
    }

    impl Aggregate for Counter {
        const CATEGORY: &'static str = "Counter";

        type Event = CounterEvent;

        fn apply(mut self, event: &Self::Event) -> Self {
            match event {
                CounterEvent::Incremented => self.value += 1,
                CounterEvent::Decremented => self.value = self.value.saturating_sub(1),
                CounterEvent::Added { amount } => self.value += amount,
            }
            self
        }
    }

    /// State that only remembers the latest event, with an overridden fold.
    #[derive(Debug, Clone, Default, PartialEq)]
    pub(crate) struct Latest {
        pub last: Option<CounterEvent>,
    }

    impl Aggregate for Latest {
        const CATEGORY: &'static str = "Latest";

        type Event = CounterEvent;

        fn apply(mut self, event: &Self::Event) -> Self {
            self.last = Some(event.clone());
            self
        }

        fn fold(self, events: &[Self::Event]) -> Self {
            match events.last() {
                Some(event) => self.apply(event),
                None => self,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Aggregate;
    use super::test_fixtures::{Counter, CounterEvent, Latest};
    use proptest::prelude::*;

    #[test]
    fn apply_incremented() {
        let counter = Counter::default().apply(&CounterEvent::Incremented);
        assert_eq!(counter.value, 1);
    }

    #[test]
    fn apply_decremented() {
        let counter = Counter { value: 3 }.apply(&CounterEvent::Decremented);
        assert_eq!(counter.value, 2);
    }

    #[test]
    fn apply_added() {
        let counter = Counter::default().apply(&CounterEvent::Added { amount: 5 });
        assert_eq!(counter.value, 5);
    }

    #[test]
    fn fold_of_empty_slice_is_identity() {
        let counter = Counter { value: 9 };
        assert_eq!(counter.clone().fold(&[]), counter);
    }

    #[test]
    fn overridden_fold_keeps_last_event() {
        let state = Latest::default().fold(&[
            CounterEvent::Incremented,
            CounterEvent::Added { amount: 2 },
        ]);
        assert_eq!(state.last, Some(CounterEvent::Added { amount: 2 }));
    }

    fn counter_event() -> impl Strategy<Value = CounterEvent> {
        prop_oneof![
            Just(CounterEvent::Incremented),
            Just(CounterEvent::Decremented),
            (0u64..100).prop_map(|amount| CounterEvent::Added { amount }),
        ]
    }

    proptest! {
        #[test]
        fn counter_fold_is_composable(
            events in prop::collection::vec(counter_event(), 0..40),
            split in 0usize..40,
        ) {
            let split = split.min(events.len());
            let (head, tail) = events.split_at(split);
            let whole = Counter::default().fold(&events);
            let incremental = Counter::default().fold(head).fold(tail);
            prop_assert_eq!(whole, incremental);
        }

        #[test]
        fn latest_fold_is_composable(
            events in prop::collection::vec(counter_event(), 0..40),
            split in 0usize..40,
        ) {
            let split = split.min(events.len());
            let (head, tail) = events.split_at(split);
            let whole = Latest::default().fold(&events);
            let incremental = Latest::default().fold(head).fold(tail);
            prop_assert_eq!(whole, incremental);
        }
    }
}
