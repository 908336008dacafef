//! Events staged by application code for the event-store participant.
//!
//! Domain events implement [`Event`] and are converted to [`PendingEvent`]
//! (type name + bincode payload + optional JSON metadata) before they are
//! staged. Nothing reaches the store until the transaction commits.

use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Error types for event encoding.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// A domain event that can be appended to an event stream.
///
/// `event_type()` returns a stable, versioned identifier such as
/// `"FundsReserved.v1"`.
///
/// # Examples
///
/// ```
/// use twophase_core::event::Event;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
/// enum LedgerEvent {
///     Debited { account: String, cents: i64 },
/// }
///
/// impl Event for LedgerEvent {
///     fn event_type(&self) -> &'static str {
///         "Debited.v1"
///     }
/// }
///
/// let event = LedgerEvent::Debited { account: "acc-1".into(), cents: 500 };
/// let bytes = event.to_bytes().unwrap();
/// assert_eq!(LedgerEvent::from_bytes(&bytes).unwrap(), event);
/// ```
pub trait Event: Send + Sync + 'static {
    /// Stable versioned type name.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if bincode cannot encode the event.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes do not decode
    /// into this type.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// An encoded event waiting to be appended.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingEvent {
    /// Versioned type name, e.g. `"FundsReserved.v1"`
    pub event_type: String,
    /// Bincode payload
    pub data: Vec<u8>,
    /// Optional metadata (`correlation_id`, `transaction_id`, ...)
    pub metadata: Option<serde_json::Value>,
}

impl PendingEvent {
    /// Create a pending event from already-encoded parts.
    #[must_use]
    pub const fn new(
        event_type: String,
        data: Vec<u8>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            data,
            metadata,
        }
    }

    /// Encode a domain event.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be encoded.
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        metadata: Option<serde_json::Value>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            data: event.to_bytes()?,
            metadata,
        })
    }
}

impl fmt::Display for PendingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.event_type, self.data.len())
    }
}
