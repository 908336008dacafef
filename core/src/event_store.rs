//! Event store abstraction wrapped by the event-store participant.
//!
//! The participant only needs two capabilities from a backend: read a stream's
//! current version (to validate staged appends during prepare) and append a
//! batch with optimistic concurrency (to flush during commit).
//!
//! # Implementations
//!
//! - `InMemoryEventStore` (in `twophase-testing`): deterministic tests and demos
//!
//! Production backends live outside this workspace and implement the trait.

use crate::event::PendingEvent;
use crate::stream::{StreamId, Version};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by event store operations.
pub type EventStoreFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, EventStoreError>> + Send + 'a>>;

/// Errors that can occur during event store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    /// The stream is not at the version the append expected.
    #[error("Concurrency conflict on {stream_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// Stream where the conflict occurred
        stream_id: StreamId,
        /// Version the caller expected
        expected: Version,
        /// Version the stream is actually at
        actual: Version,
    },

    /// Backend connection or query failure.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Backend is unavailable (I/O, network).
    #[error("I/O error: {0}")]
    IoError(String),
}

/// Append-only event stream storage.
///
/// # Dyn Compatibility
///
/// Methods return [`EventStoreFuture`] so participants can hold
/// `Arc<dyn EventStore>`.
pub trait EventStore: Send + Sync {
    /// Current version of `stream_id` ([`Version::INITIAL`] for an empty stream).
    fn current_version(&self, stream_id: StreamId) -> EventStoreFuture<'_, Version>;

    /// Append `events` to `stream_id`, returning the new version.
    ///
    /// With `Some(expected)`, the append fails with
    /// [`EventStoreError::ConcurrencyConflict`] unless the stream is at exactly
    /// that version. With `None`, no version check is made.
    fn append_events(
        &self,
        stream_id: StreamId,
        expected_version: Option<Version>,
        events: Vec<PendingEvent>,
    ) -> EventStoreFuture<'_, Version>;
}
