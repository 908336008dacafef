//! Failure values and coordinator errors.
//!
//! Participants report expected failures as [`ParticipantFailure`] values. The
//! coordinator aggregates them into a [`TransactionError`], which always says
//! which of the three outcomes a caller observed: full rollback with a cause,
//! a [`PartialCommitFailure`] that needs escalation, or a coordinator misuse
//! ([`CoordinatorStateError`]).

use crate::participant::ParticipantKey;
use crate::transaction::{Transaction, TransactionId, TransactionState};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable failure codes.
///
/// Resource adapters derive their own codes from a resource name, e.g.
/// `ORDER_DB` produces `ORDER_DB_PREPARE_FAILED`.
pub mod codes {
    /// Commit was requested for a transaction this participant never prepared.
    pub const TX_NOT_PREPARED: &str = "TX_NOT_PREPARED";
    /// A call arrived for a transaction this participant already settled.
    pub const TX_ALREADY_FINISHED: &str = "TX_ALREADY_FINISHED";
    /// Work was staged after the participant sealed it during prepare.
    pub const TX_SEALED: &str = "TX_SEALED";
    /// The participant did not answer within the configured timeout.
    pub const PARTICIPANT_TIMEOUT: &str = "PARTICIPANT_TIMEOUT";
    /// The participant panicked while handling the call.
    pub const PARTICIPANT_PANICKED: &str = "PARTICIPANT_PANICKED";
    /// A caller-requested rollback left participants unresolved.
    pub const ROLLBACK_INCOMPLETE: &str = "ROLLBACK_INCOMPLETE";

    /// `<RESOURCE>_PREPARE_FAILED`
    #[must_use]
    pub fn prepare_failed(resource: &str) -> String {
        format!("{resource}_PREPARE_FAILED")
    }

    /// `<RESOURCE>_COMMIT_FAILED`
    #[must_use]
    pub fn commit_failed(resource: &str) -> String {
        format!("{resource}_COMMIT_FAILED")
    }

    /// `<RESOURCE>_ROLLBACK_FAILED`
    #[must_use]
    pub fn rollback_failed(resource: &str) -> String {
        format!("{resource}_ROLLBACK_FAILED")
    }
}

/// Which protocol step a [`ParticipantFailure`] came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// `prepare` failed; recoverable through rollback
    Prepare,
    /// `commit` failed after a successful prepare
    Commit,
    /// `rollback` could not cleanly discard staged work
    Rollback,
    /// A call arrived out of protocol order (e.g. commit without prepare)
    ProtocolViolation,
}

impl FailureKind {
    /// Lower-case label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::ProtocolViolation => "protocol_violation",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform failure shape for every participant call.
///
/// Adapters fill in kind, code, message and transaction id. The coordinator
/// stamps the participant key when the failure crosses its boundary, so a
/// failure read by the caller always names where it came from.
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} failure [{code}]{} on {transaction_id}: {message}", participant_suffix(.participant.as_ref()))]
pub struct ParticipantFailure {
    /// Protocol step that failed
    pub kind: FailureKind,
    /// Stable machine-readable code
    pub code: String,
    /// Human-readable detail, usually the native error text
    pub message: String,
    /// Participant that produced the failure, once known
    pub participant: Option<ParticipantKey>,
    /// Transaction the call belonged to
    pub transaction_id: TransactionId,
}

fn participant_suffix(participant: Option<&ParticipantKey>) -> String {
    participant.map_or_else(String::new, |key| format!(" in {key}"))
}

impl ParticipantFailure {
    /// Create a failure of any kind.
    #[must_use]
    pub fn new(
        kind: FailureKind,
        code: impl Into<String>,
        message: impl Into<String>,
        transaction_id: TransactionId,
    ) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            participant: None,
            transaction_id,
        }
    }

    /// Prepare-phase failure.
    #[must_use]
    pub fn prepare(
        code: impl Into<String>,
        message: impl Into<String>,
        transaction_id: TransactionId,
    ) -> Self {
        Self::new(FailureKind::Prepare, code, message, transaction_id)
    }

    /// Commit-phase failure.
    #[must_use]
    pub fn commit(
        code: impl Into<String>,
        message: impl Into<String>,
        transaction_id: TransactionId,
    ) -> Self {
        Self::new(FailureKind::Commit, code, message, transaction_id)
    }

    /// Rollback failure.
    #[must_use]
    pub fn rollback(
        code: impl Into<String>,
        message: impl Into<String>,
        transaction_id: TransactionId,
    ) -> Self {
        Self::new(FailureKind::Rollback, code, message, transaction_id)
    }

    /// `TX_NOT_PREPARED` protocol violation.
    #[must_use]
    pub fn not_prepared(transaction_id: TransactionId) -> Self {
        Self::new(
            FailureKind::ProtocolViolation,
            codes::TX_NOT_PREPARED,
            "commit requested without a prepare record",
            transaction_id,
        )
    }

    /// `TX_ALREADY_FINISHED` protocol violation for stale calls.
    #[must_use]
    pub fn already_finished(transaction_id: TransactionId, settlement: &str) -> Self {
        Self::new(
            FailureKind::ProtocolViolation,
            codes::TX_ALREADY_FINISHED,
            format!("transaction already settled as {settlement}"),
            transaction_id,
        )
    }

    /// Attach the participant key.
    #[must_use]
    pub fn with_participant(mut self, key: ParticipantKey) -> Self {
        self.participant = Some(key);
        self
    }

    /// Whether this failure is a protocol violation rather than a resource error.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        matches!(self.kind, FailureKind::ProtocolViolation)
    }

    /// Whether the participant's real outcome is unknown (it timed out).
    ///
    /// Ambiguous prepare failures may be retried, since prepare is idempotent.
    #[must_use]
    pub fn is_ambiguous(&self) -> bool {
        self.code == codes::PARTICIPANT_TIMEOUT
    }
}

/// Result type for participant operations.
pub type ParticipantResult<T> = Result<T, ParticipantFailure>;

/// Misuse of the coordinator: wrong lifecycle order or a bad registry change.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum CoordinatorStateError {
    /// `begin()` while a transaction from an earlier scope is still open.
    #[error("transaction {open} is still open on this coordinator")]
    TransactionInProgress {
        /// The transaction still open
        open: TransactionId,
    },

    /// `commit()` or `rollback()` with nothing open.
    #[error("no transaction is open")]
    NoOpenTransaction,

    /// A participant with this key is already registered.
    #[error("participant {0} is already registered")]
    DuplicateParticipant(ParticipantKey),

    /// Registration attempted while a transaction is open.
    #[error("cannot register participant {key} while transaction {open} is open")]
    RegistryLocked {
        /// Key that was being registered
        key: ParticipantKey,
        /// The open transaction
        open: TransactionId,
    },

    /// The coordinator attempted an illegal state transition.
    #[error("transaction {transaction_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Transaction being moved
        transaction_id: TransactionId,
        /// Current state
        from: TransactionState,
        /// Requested state
        to: TransactionState,
    },
}

impl CoordinatorStateError {
    /// Stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::TransactionInProgress { .. } => "COORDINATOR_BUSY",
            Self::NoOpenTransaction => "NO_OPEN_TRANSACTION",
            Self::DuplicateParticipant(_) => "DUPLICATE_PARTICIPANT",
            Self::RegistryLocked { .. } => "REGISTRY_LOCKED",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
        }
    }
}

/// Some participants committed and at least one did not.
///
/// Atomicity is broken. The coordinator never retries or compensates on its
/// own; this must be escalated to an operator or a compensating workflow.
#[derive(Error, Clone, Debug)]
#[error(
    "partial commit of {}: {} participant(s) committed before {failed} failed [{}]",
    .transaction.id(),
    .committed.len(),
    .failure.code
)]
pub struct PartialCommitFailure {
    /// Final transaction snapshot (state `FAILED`)
    pub transaction: Transaction,
    /// Participants that committed, in commit order
    pub committed: Vec<ParticipantKey>,
    /// Participant whose commit failed
    pub failed: ParticipantKey,
    /// The commit failure itself
    pub failure: ParticipantFailure,
    /// Participants never asked to commit
    pub not_attempted: Vec<ParticipantKey>,
}

/// Error returned by coordinator `commit()` / `rollback()`.
#[derive(Error, Debug)]
pub enum TransactionError {
    /// Lifecycle misuse; no participant was contacted.
    #[error(transparent)]
    State(#[from] CoordinatorStateError),

    /// A participant failed during prepare; every participant holding prepared
    /// work was asked to roll back.
    #[error("transaction {} aborted: {cause}", .transaction.id())]
    Aborted {
        /// Final snapshot (`ROLLED_BACK`, or `FAILED` if a rollback failed)
        transaction: Transaction,
        /// The originating failure
        cause: ParticipantFailure,
        /// Rollback calls that themselves failed
        rollback_failures: Vec<ParticipantFailure>,
    },

    /// Commit phase broke atomicity.
    #[error(transparent)]
    PartialCommit(#[from] PartialCommitFailure),

    /// A caller-requested rollback could not unwind every participant.
    #[error(
        "rollback of transaction {} left {} participant(s) unresolved",
        .transaction.id(),
        .failures.len()
    )]
    RollbackIncomplete {
        /// Final snapshot (state `FAILED`)
        transaction: Transaction,
        /// Rollback calls that failed
        failures: Vec<ParticipantFailure>,
    },
}

impl TransactionError {
    /// Stable code of the originating cause.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::State(err) => err.code(),
            Self::Aborted { cause, .. } => &cause.code,
            Self::PartialCommit(partial) => &partial.failure.code,
            Self::RollbackIncomplete { failures, .. } => failures
                .first()
                .map_or(codes::ROLLBACK_INCOMPLETE, |failure| failure.code.as_str()),
        }
    }

    /// Final snapshot of the concluded transaction, if one was concluded.
    #[must_use]
    pub const fn transaction(&self) -> Option<&Transaction> {
        match self {
            Self::State(_) => None,
            Self::Aborted { transaction, .. }
            | Self::RollbackIncomplete { transaction, .. } => Some(transaction),
            Self::PartialCommit(partial) => Some(&partial.transaction),
        }
    }

    /// Terminal state the transaction ended in, if one was concluded.
    #[must_use]
    pub fn final_state(&self) -> Option<TransactionState> {
        self.transaction().map(Transaction::state)
    }

    /// Participant the originating cause is attributed to.
    #[must_use]
    pub fn participant(&self) -> Option<&ParticipantKey> {
        match self {
            Self::State(_) => None,
            Self::Aborted { cause, .. } => cause.participant.as_ref(),
            Self::PartialCommit(partial) => Some(&partial.failed),
            Self::RollbackIncomplete { failures, .. } => {
                failures.first().and_then(|failure| failure.participant.as_ref())
            }
        }
    }

    /// Whether this is the unrecoverable partial-commit case.
    #[must_use]
    pub const fn is_partial_commit(&self) -> bool {
        matches!(self, Self::PartialCommit(_))
    }
}
