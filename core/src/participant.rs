//! The participant capability trait.
//!
//! Every resource taking part in a distributed unit of work implements
//! [`TransactionParticipant`]. The coordinator compiles against this one
//! contract regardless of the resource behind it.
//!
//! # Example
//!
//! ```
//! use twophase_core::{
//!     ParticipantFuture, RollbackOutcome, TransactionId, TransactionParticipant,
//! };
//!
//! struct NoopParticipant;
//!
//! impl TransactionParticipant for NoopParticipant {
//!     fn prepare(&self, _tx_id: TransactionId) -> ParticipantFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn commit(&self, _tx_id: TransactionId) -> ParticipantFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn rollback(&self, _tx_id: TransactionId) -> ParticipantFuture<'_, RollbackOutcome> {
//!         Box::pin(async { Ok(RollbackOutcome::NothingToUndo) })
//!     }
//! }
//! ```

use crate::error::ParticipantResult;
use crate::transaction::TransactionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by participant operations.
pub type ParticipantFuture<'a, T> =
    Pin<Box<dyn Future<Output = ParticipantResult<T>> + Send + 'a>>;

/// Registry key identifying a participant within one coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantKey(String);

impl ParticipantKey {
    /// Create a participant key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What a rollback call actually did.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackOutcome {
    /// Staged or prepared work was discarded
    RolledBack,
    /// The participant held nothing for this transaction
    NothingToUndo,
}

/// Capability set every resource adapter provides to the coordinator.
///
/// # Contract
///
/// - `prepare` readies the participant so that a later `commit` cannot fail for
///   participant-internal reasons. It is idempotent: repeating it for the same
///   transaction id returns the same outcome without repeating side effects.
/// - `commit` finalizes a prepared transaction and fails with
///   [`codes::TX_NOT_PREPARED`](crate::codes::TX_NOT_PREPARED) when there is no
///   prepare record for the id.
/// - `rollback` discards staged effects and succeeds even if `prepare` was
///   never called, reporting [`RollbackOutcome::NothingToUndo`].
///
/// A participant only reads and writes its own per-transaction bookkeeping.
/// Calls to one participant for one transaction id are never concurrent.
///
/// # Dyn Compatibility
///
/// Methods return [`ParticipantFuture`] rather than using `async fn` so the
/// coordinator can hold participants as `Arc<dyn TransactionParticipant>`.
pub trait TransactionParticipant: Send + Sync {
    /// Phase one: vote on whether this participant can commit.
    fn prepare(&self, tx_id: TransactionId) -> ParticipantFuture<'_, ()>;

    /// Phase two: make prepared effects permanent.
    fn commit(&self, tx_id: TransactionId) -> ParticipantFuture<'_, ()>;

    /// Abort: discard whatever was staged or prepared.
    fn rollback(&self, tx_id: TransactionId) -> ParticipantFuture<'_, RollbackOutcome>;
}

impl<T: TransactionParticipant + ?Sized> TransactionParticipant for Arc<T> {
    fn prepare(&self, tx_id: TransactionId) -> ParticipantFuture<'_, ()> {
        (**self).prepare(tx_id)
    }

    fn commit(&self, tx_id: TransactionId) -> ParticipantFuture<'_, ()> {
        (**self).commit(tx_id)
    }

    fn rollback(&self, tx_id: TransactionId) -> ParticipantFuture<'_, RollbackOutcome> {
        (**self).rollback(tx_id)
    }
}
