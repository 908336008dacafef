//! Per-participant prepare bookkeeping.
//!
//! Each participant owns one [`PrepareLedger`]. It records which transaction
//! ids are durably prepared, and remembers a bounded window of recently settled
//! ids so that:
//!
//! - a repeated `prepare` returns the first outcome without redoing work
//! - `commit` without a prepare record is rejected (`TX_NOT_PREPARED`)
//! - native work that finishes after its transaction was abandoned is detected
//!   and discarded instead of silently succeeding
//!
//! Prepare records are removed as soon as the participant settles the
//! transaction, so the ledger does not grow with the number of transactions.

use crate::error::{ParticipantFailure, ParticipantResult};
use crate::transaction::TransactionId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Number of settled transaction ids remembered by default.
pub const DEFAULT_SETTLED_RETENTION: usize = 1024;

/// How a participant finished with a transaction id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// Prepared work was made permanent
    Committed,
    /// Staged or prepared work was discarded
    RolledBack,
    /// Prepare failed; the failure is replayed to repeated prepare calls
    Refused(ParticipantFailure),
    /// Commit was attempted and failed; outcome needs operator attention
    CommitFailed(ParticipantFailure),
}

impl Settlement {
    /// Lower-case label used in messages.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
            Self::Refused(_) => "refused",
            Self::CommitFailed(_) => "failed during commit",
        }
    }
}

/// Result of [`PrepareLedger::begin_prepare`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrepareStep {
    /// First prepare for this id; do the native work
    Proceed,
    /// Already prepared; report success without side effects
    AlreadyPrepared,
}

#[derive(Debug, Default)]
struct LedgerState {
    prepared: HashSet<TransactionId>,
    settled: HashMap<TransactionId, Settlement>,
    settled_order: VecDeque<TransactionId>,
}

/// Transaction-id keyed prepare records for one participant.
#[derive(Debug)]
pub struct PrepareLedger {
    state: Mutex<LedgerState>,
    retention: usize,
}

impl Default for PrepareLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl PrepareLedger {
    /// Create a ledger remembering [`DEFAULT_SETTLED_RETENTION`] settled ids.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_SETTLED_RETENTION)
    }

    /// Create a ledger remembering at most `retention` settled ids.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            retention: retention.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide what a `prepare` call for `tx_id` should do.
    ///
    /// # Errors
    ///
    /// - the original failure when an earlier prepare for `tx_id` was refused
    /// - `TX_ALREADY_FINISHED` when `tx_id` was already committed or rolled back
    pub fn begin_prepare(&self, tx_id: &TransactionId) -> ParticipantResult<PrepareStep> {
        let state = self.lock();
        if state.prepared.contains(tx_id) {
            return Ok(PrepareStep::AlreadyPrepared);
        }
        match state.settled.get(tx_id) {
            None => Ok(PrepareStep::Proceed),
            Some(Settlement::Refused(failure)) => Err(failure.clone()),
            Some(settlement) => Err(ParticipantFailure::already_finished(
                tx_id.clone(),
                settlement.label(),
            )),
        }
    }

    /// Record that native prepare work for `tx_id` completed.
    ///
    /// # Errors
    ///
    /// Returns `TX_ALREADY_FINISHED` when the transaction was settled while the
    /// native work was in flight; the caller must discard that work.
    pub fn mark_prepared(&self, tx_id: &TransactionId) -> ParticipantResult<()> {
        let mut state = self.lock();
        if let Some(settlement) = state.settled.get(tx_id) {
            return Err(ParticipantFailure::already_finished(
                tx_id.clone(),
                settlement.label(),
            ));
        }
        state.prepared.insert(tx_id.clone());
        Ok(())
    }

    /// Record a failed prepare so repeated calls replay the same failure.
    pub fn refuse(&self, failure: ParticipantFailure) {
        let tx_id = failure.transaction_id.clone();
        self.settle(&tx_id, Settlement::Refused(failure));
    }

    /// Check that `tx_id` may be committed.
    ///
    /// # Errors
    ///
    /// Returns `TX_NOT_PREPARED` when no prepare record exists.
    pub fn check_commit(&self, tx_id: &TransactionId) -> ParticipantResult<()> {
        if self.lock().prepared.contains(tx_id) {
            Ok(())
        } else {
            Err(ParticipantFailure::not_prepared(tx_id.clone()))
        }
    }

    /// Settle `tx_id`, dropping its prepare record.
    ///
    /// Returns whether the transaction had been prepared.
    pub fn settle(&self, tx_id: &TransactionId, settlement: Settlement) -> bool {
        let mut state = self.lock();
        let was_prepared = state.prepared.remove(tx_id);
        if state.settled.insert(tx_id.clone(), settlement).is_none() {
            state.settled_order.push_back(tx_id.clone());
        }
        while state.settled_order.len() > self.retention {
            if let Some(evicted) = state.settled_order.pop_front() {
                state.settled.remove(&evicted);
            }
        }
        was_prepared
    }

    /// Whether `tx_id` currently holds a prepare record.
    #[must_use]
    pub fn is_prepared(&self, tx_id: &TransactionId) -> bool {
        self.lock().prepared.contains(tx_id)
    }

    /// How `tx_id` was settled, if it is still remembered.
    #[must_use]
    pub fn settlement(&self, tx_id: &TransactionId) -> Option<Settlement> {
        self.lock().settled.get(tx_id).cloned()
    }

    /// Number of open prepare records.
    #[must_use]
    pub fn prepared_count(&self) -> usize {
        self.lock().prepared.len()
    }

    /// Number of remembered settled ids.
    #[must_use]
    pub fn settled_count(&self) -> usize {
        self.lock().settled.len()
    }
}
