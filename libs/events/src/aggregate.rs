//! Aggregate root contract and reconstruction from history.

use crate::{AggregateType, DomainEvent, EventEnvelope, EventError};

/// A consistency boundary whose state is derived entirely from its events.
///
/// # Contract
///
/// - Domain operations append exactly one event with `version = version() + 1`,
///   apply it, and keep it in the uncommitted list until the store accepts it.
/// - [`apply`](AggregateRoot::apply) folds one event into state and sets the
///   aggregate version to the event's version. It must not record the event
///   as uncommitted.
pub trait AggregateRoot: Sized {
    /// The events this aggregate emits and folds.
    type Event: DomainEvent;

    /// Aggregate type stamped on every event.
    const AGGREGATE_TYPE: AggregateType;

    /// A fresh aggregate at version 0.
    fn empty(id: &str) -> Self;

    fn id(&self) -> &str;

    /// Number of applied events.
    fn version(&self) -> i32;

    /// Events produced since the last successful append.
    fn uncommitted_changes(&self) -> &[EventEnvelope<Self::Event>];

    /// Drains the uncommitted list.
    fn take_uncommitted_changes(&mut self) -> Vec<EventEnvelope<Self::Event>>;

    /// Fold one event into state.
    fn apply(&mut self, event: &EventEnvelope<Self::Event>);
}

/// Rebuild an aggregate from its persisted events.
///
/// Events are sorted by version first, so callers need not guarantee order.
/// The rebuilt aggregate has no uncommitted changes.
///
/// # Errors
///
/// - `EmptyHistory` if `events` is empty
/// - `VersionGap` if versions are not contiguous from 1
/// - `AggregateMismatch` if events of another aggregate are mixed in
pub fn reconstruct<A: AggregateRoot>(
    events: impl IntoIterator<Item = EventEnvelope<A::Event>>,
) -> Result<A, EventError> {
    let mut sorted: Vec<_> = events.into_iter().collect();
    sorted.sort_by_key(|event| event.version);

    let Some(first) = sorted.first() else {
        return Err(EventError::EmptyHistory);
    };

    let mut aggregate = A::empty(&first.aggregate_id);

    for event in &sorted {
        if event.aggregate_id != aggregate.id() {
            return Err(EventError::AggregateMismatch {
                expected: aggregate.id().to_string(),
                actual: event.aggregate_id.clone(),
            });
        }

        let expected = aggregate.version() + 1;
        if event.version != expected {
            return Err(EventError::VersionGap {
                expected,
                actual: event.version,
            });
        }

        aggregate.apply(event);
    }

    Ok(aggregate)
}
