//! In-memory event store.
//!
//! A stream's version equals its event count. Failures can be injected for the
//! next read or append to exercise adapter error paths.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use twophase_core::event::PendingEvent;
use twophase_core::event_store::{EventStore, EventStoreError, EventStoreFuture};
use twophase_core::stream::{StreamId, Version};

#[derive(Debug, Default)]
struct StoreState {
    streams: HashMap<StreamId, Vec<PendingEvent>>,
    next_read_failure: Option<EventStoreError>,
    next_append_failure: Option<EventStoreError>,
    appends: usize,
}

/// Event store backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    state: Mutex<StoreState>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append without any version check, as a writer outside the unit of work.
    pub fn seed(&self, stream_id: &StreamId, events: Vec<PendingEvent>) {
        self.lock()
            .streams
            .entry(stream_id.clone())
            .or_default()
            .extend(events);
    }

    /// Fail the next `current_version` call with `error`.
    pub fn fail_next_read(&self, error: EventStoreError) {
        self.lock().next_read_failure = Some(error);
    }

    /// Fail the next `append_events` call with `error`.
    pub fn fail_next_append(&self, error: EventStoreError) {
        self.lock().next_append_failure = Some(error);
    }

    /// Events stored in `stream_id`.
    #[must_use]
    pub fn events(&self, stream_id: &StreamId) -> Vec<PendingEvent> {
        self.lock()
            .streams
            .get(stream_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of events in `stream_id`.
    #[must_use]
    pub fn event_count(&self, stream_id: &StreamId) -> usize {
        self.lock().streams.get(stream_id).map_or(0, Vec::len)
    }

    /// Number of successful `append_events` calls.
    #[must_use]
    pub fn append_calls(&self) -> usize {
        self.lock().appends
    }
}

fn version_of(events: Option<&Vec<PendingEvent>>) -> Version {
    Version::new(events.map_or(0, |events| events.len() as u64))
}

impl EventStore for InMemoryEventStore {
    fn current_version(&self, stream_id: StreamId) -> EventStoreFuture<'_, Version> {
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(error) = state.next_read_failure.take() {
                return Err(error);
            }
            Ok(version_of(state.streams.get(&stream_id)))
        })
    }

    fn append_events(
        &self,
        stream_id: StreamId,
        expected_version: Option<Version>,
        events: Vec<PendingEvent>,
    ) -> EventStoreFuture<'_, Version> {
        Box::pin(async move {
            let mut state = self.lock();
            if let Some(error) = state.next_append_failure.take() {
                return Err(error);
            }

            let actual = version_of(state.streams.get(&stream_id));
            if let Some(expected) = expected_version.filter(|expected| *expected != actual) {
                return Err(EventStoreError::ConcurrencyConflict {
                    stream_id,
                    expected,
                    actual,
                });
            }

            let count = events.len() as u64;
            state.streams.entry(stream_id).or_default().extend(events);
            state.appends += 1;
            Ok(actual.advanced_by(count))
        })
    }
}
