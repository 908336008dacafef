//! # Twophase Core
//!
//! Core traits and types for coordinating a single atomic unit of work across
//! independent resources that have no shared transaction manager.
//!
//! ## Core Concepts
//!
//! - **Participant**: a resource adapter implementing [`TransactionParticipant`]
//!   (`prepare`, `commit`, `rollback`)
//! - **Transaction**: the coordinator-owned value tracking id, state and the
//!   ordered set of participants in one round
//! - **Prepare ledger**: per-participant bookkeeping keyed by transaction id
//! - **Failures**: every expected failure path is a value ([`ParticipantFailure`],
//!   [`TransactionError`]), never a panic
//!
//! ## Protocol
//!
//! ```text
//! PENDING ─► PREPARING ─► PREPARED ─► COMMITTING ─► COMMITTED
//!               │                          │
//!               ▼                          ▼
//!          ROLLING_BACK ─► ROLLED_BACK   FAILED (partial commit)
//!               │
//!               ▼
//!             FAILED (rollback incomplete)
//! ```
//!
//! The coordinator that drives this state machine lives in `twophase-runtime`.

pub use chrono::{DateTime, Utc};

/// Failure values, coordinator errors and stable failure codes
pub mod error;

/// Event types staged by the event-store participant
pub mod event;

/// Event store abstraction used by the event-store participant
pub mod event_store;

/// Per-participant prepare bookkeeping keyed by transaction id
pub mod ledger;

/// The participant capability trait
pub mod participant;

/// Stream identification and versioning
pub mod stream;

/// Transaction value object and state machine
pub mod transaction;

pub use error::{
    CoordinatorStateError, FailureKind, ParticipantFailure, ParticipantResult,
    PartialCommitFailure, TransactionError, codes,
};
pub use ledger::{PrepareLedger, PrepareStep, Settlement};
pub use participant::{
    ParticipantFuture, ParticipantKey, RollbackOutcome, TransactionParticipant,
};
pub use transaction::{Transaction, TransactionId, TransactionState};

/// Environment module - Dependency injection traits
///
/// External dependencies of the coordinator are abstracted behind traits and
/// injected at construction time.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// The coordinator stamps `Transaction::created_at` through this trait so
    /// tests can pin the time with a fixed clock.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
