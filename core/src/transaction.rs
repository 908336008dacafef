//! Transaction value object and its state machine.
//!
//! A [`Transaction`] is created by the coordinator on `begin()`, mutated only by
//! the coordinator, and handed to callers as an immutable snapshot once it
//! reaches a terminal state.

use crate::error::CoordinatorStateError;
use crate::participant::ParticipantKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of one coordination round.
///
/// # Examples
///
/// ```
/// use twophase_core::TransactionId;
///
/// let a = TransactionId::generate();
/// let b = TransactionId::generate();
/// assert_ne!(a, b);
/// assert!(a.as_str().starts_with("tx-"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    /// Create a transaction id from trusted input.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a fresh, globally unique transaction id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("tx-{}", Uuid::new_v4()))
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TransactionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for TransactionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a [`Transaction`].
///
/// Transitions only move forward:
///
/// ```text
/// Pending     -> Preparing | RollingBack
/// Preparing   -> Prepared  | RollingBack
/// Prepared    -> Committing
/// Committing  -> Committed | Failed
/// RollingBack -> RolledBack | Failed
/// ```
///
/// `Committed`, `RolledBack` and `Failed` are terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    /// Opened by `begin()`, application writes in progress
    Pending,
    /// Prepare calls are being issued
    Preparing,
    /// Every participant reported a successful prepare
    Prepared,
    /// Commit calls are being issued
    Committing,
    /// Every participant committed
    Committed,
    /// Rollback calls are being issued
    RollingBack,
    /// Every participant rolled back (or had nothing to undo)
    RolledBack,
    /// Atomicity could not be guaranteed; requires operator attention
    Failed,
}

impl TransactionState {
    /// Stable upper-case name used in logs and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Preparing => "PREPARING",
            Self::Prepared => "PREPARED",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::RollingBack => "ROLLING_BACK",
            Self::RolledBack => "ROLLED_BACK",
            Self::Failed => "FAILED",
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Preparing | Self::RollingBack)
                | (Self::Preparing, Self::Prepared | Self::RollingBack)
                | (Self::Prepared, Self::Committing)
                | (Self::Committing, Self::Committed | Self::Failed)
                | (Self::RollingBack, Self::RolledBack | Self::Failed)
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One coordination round across the registered participants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    participant_ids: Vec<ParticipantKey>,
    created_at: DateTime<Utc>,
}

impl Transaction {
    /// Open a new transaction in `Pending` state.
    ///
    /// `participant_ids` is the registry snapshot, in registration order.
    #[must_use]
    pub const fn new(
        id: TransactionId,
        participant_ids: Vec<ParticipantKey>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            state: TransactionState::Pending,
            participant_ids,
            created_at,
        }
    }

    /// Transaction id.
    #[must_use]
    pub const fn id(&self) -> &TransactionId {
        &self.id
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> TransactionState {
        self.state
    }

    /// Participants taking part, in registration order.
    #[must_use]
    pub fn participant_ids(&self) -> &[ParticipantKey] {
        &self.participant_ids
    }

    /// When `begin()` opened this transaction.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the transaction reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `next`, returning the previous state.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorStateError::InvalidTransition`] when `next` is not a
    /// forward transition from the current state. The state is left unchanged.
    pub fn transition(
        &mut self,
        next: TransactionState,
    ) -> Result<TransactionState, CoordinatorStateError> {
        if !self.state.can_transition_to(next) {
            return Err(CoordinatorStateError::InvalidTransition {
                transaction_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [TransactionState; 8] = [
        TransactionState::Pending,
        TransactionState::Preparing,
        TransactionState::Prepared,
        TransactionState::Committing,
        TransactionState::Committed,
        TransactionState::RollingBack,
        TransactionState::RolledBack,
        TransactionState::Failed,
    ];

    fn rank(state: TransactionState) -> u8 {
        match state {
            TransactionState::Pending => 0,
            TransactionState::Preparing => 1,
            TransactionState::Prepared | TransactionState::RollingBack => 2,
            TransactionState::Committing | TransactionState::RolledBack => 3,
            TransactionState::Committed | TransactionState::Failed => 4,
        }
    }

    fn sample() -> Transaction {
        Transaction::new(
            TransactionId::new("tx-1"),
            vec![ParticipantKey::new("orders"), ParticipantKey::new("events")],
            Utc::now(),
        )
    }

    #[test]
    fn new_transaction_is_pending() {
        let tx = sample();
        assert_eq!(tx.state(), TransactionState::Pending);
        assert_eq!(tx.participant_ids().len(), 2);
        assert!(!tx.is_terminal());
    }

    #[test]
    fn happy_path_transitions() {
        let mut tx = sample();
        for next in [
            TransactionState::Preparing,
            TransactionState::Prepared,
            TransactionState::Committing,
            TransactionState::Committed,
        ] {
            assert!(tx.transition(next).is_ok());
        }
        assert!(tx.is_terminal());
    }

    #[test]
    fn illegal_transition_leaves_state_untouched() {
        let mut tx = sample();
        let result = tx.transition(TransactionState::Committing);
        assert!(matches!(
            result,
            Err(CoordinatorStateError::InvalidTransition { .. })
        ));
        assert_eq!(tx.state(), TransactionState::Pending);
    }

    #[test]
    fn terminal_states_have_no_successors() {
        for from in ALL.iter().copied().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn prepared_cannot_roll_back() {
        assert!(!TransactionState::Prepared.can_transition_to(TransactionState::RollingBack));
    }

    #[test]
    fn generated_ids_are_unique() {
        let ids: std::collections::HashSet<_> =
            (0..100).map(|_| TransactionId::generate()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn state_serializes_as_upper_snake_case() {
        let json = serde_json::to_string(&TransactionState::RollingBack).unwrap_or_default();
        assert_eq!(json, "\"ROLLING_BACK\"");
    }

    proptest! {
        #[test]
        fn legal_transitions_are_monotonic(from in 0usize..8, to in 0usize..8) {
            let (from, to) = (ALL[from], ALL[to]);
            if from.can_transition_to(to) {
                prop_assert!(rank(to) > rank(from));
            }
        }
    }
}
