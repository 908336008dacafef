//! The distributed unit of work.
//!
//! [`DistributedUnitOfWork`] owns the participant registry and at most one open
//! [`Transaction`]. It is the single writer of that transaction's state.
//!
//! # Commit
//!
//! 1. `PENDING -> PREPARING`, then `prepare` every participant (registration
//!    order, or all at once in [`PrepareMode::Concurrent`]).
//! 2. Any prepare failure: `ROLLING_BACK`, roll back every participant that
//!    prepared (or whose outcome is unknown), end in `ROLLED_BACK`, or `FAILED`
//!    when a rollback call failed. The caller gets [`TransactionError::Aborted`].
//! 3. All prepared: `PREPARED -> COMMITTING`, `commit` every participant in
//!    registration order. The first commit failure stops the phase and ends in
//!    `FAILED` with a [`PartialCommitFailure`]; nothing is undone or retried.
//!
//! Participants never reached are never called.
//!
//! # Cancellation
//!
//! Dropping a `commit()` or `rollback()` future while it waits on a participant
//! never wedges the coordinator. Cancelled in `COMMITTING` or `ROLLING_BACK`,
//! the transaction is forced to `FAILED` and released. Cancelled in
//! `PREPARING`, it stays open and `rollback()` unwinds it.

use crate::boundary::guarded;
use crate::config::{CoordinatorConfig, PrepareMode};
use crate::metrics::CoordinatorMetrics;
use crate::retry::retry_with_predicate;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use twophase_core::environment::{Clock, SystemClock};
use twophase_core::{
    CoordinatorStateError, FailureKind, ParticipantFailure, ParticipantKey, ParticipantResult,
    PartialCommitFailure, Transaction, TransactionError, TransactionId, TransactionParticipant,
    TransactionState, codes,
};

struct Registered {
    key: ParticipantKey,
    participant: Arc<dyn TransactionParticipant>,
}

/// Two-phase commit coordinator.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use twophase_core::{ParticipantFuture, RollbackOutcome, TransactionId, TransactionParticipant, TransactionState};
/// use twophase_runtime::DistributedUnitOfWork;
///
/// struct Noop;
///
/// impl TransactionParticipant for Noop {
///     fn prepare(&self, _: TransactionId) -> ParticipantFuture<'_, ()> {
///         Box::pin(async { Ok(()) })
///     }
///     fn commit(&self, _: TransactionId) -> ParticipantFuture<'_, ()> {
///         Box::pin(async { Ok(()) })
///     }
///     fn rollback(&self, _: TransactionId) -> ParticipantFuture<'_, RollbackOutcome> {
///         Box::pin(async { Ok(RollbackOutcome::NothingToUndo) })
///     }
/// }
///
/// # tokio_test::block_on(async {
/// let mut uow = DistributedUnitOfWork::new();
/// uow.register_participant("orders", Arc::new(Noop)).unwrap();
/// uow.register_participant("events", Arc::new(Noop)).unwrap();
///
/// uow.begin().unwrap();
/// let tx = uow.commit().await.unwrap();
/// assert_eq!(tx.state(), TransactionState::Committed);
/// assert!(uow.is_idle());
/// # });
/// ```
pub struct DistributedUnitOfWork {
    participants: Vec<Registered>,
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    current: Option<Transaction>,
}

impl Default for DistributedUnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DistributedUnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedUnitOfWork")
            .field("participants", &self.participants().collect::<Vec<_>>())
            .field("config", &self.config)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl DistributedUnitOfWork {
    /// Coordinator with default configuration and the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(CoordinatorConfig::default())
    }

    /// Coordinator with explicit configuration.
    #[must_use]
    pub fn with_config(config: CoordinatorConfig) -> Self {
        Self {
            participants: Vec::new(),
            config,
            clock: Arc::new(SystemClock),
            current: None,
        }
    }

    /// Replace the clock used for `Transaction::created_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Registered participant keys in registration order.
    pub fn participants(&self) -> impl ExactSizeIterator<Item = &ParticipantKey> + '_ {
        self.participants.iter().map(|registered| &registered.key)
    }

    /// Snapshot of the open transaction, if any.
    #[must_use]
    pub const fn current(&self) -> Option<&Transaction> {
        self.current.as_ref()
    }

    /// Whether no transaction is open.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// Add a participant under `key`.
    ///
    /// Participants are prepared, committed and rolled back in the order they
    /// were registered.
    ///
    /// # Errors
    ///
    /// - [`CoordinatorStateError::RegistryLocked`] while a transaction is open
    /// - [`CoordinatorStateError::DuplicateParticipant`] if `key` is taken
    pub fn register_participant(
        &mut self,
        key: impl Into<ParticipantKey>,
        participant: Arc<dyn TransactionParticipant>,
    ) -> Result<ParticipantKey, CoordinatorStateError> {
        let key = key.into();
        if let Some(open) = &self.current {
            return Err(CoordinatorStateError::RegistryLocked {
                key,
                open: open.id().clone(),
            });
        }
        if self.participants.iter().any(|registered| registered.key == key) {
            return Err(CoordinatorStateError::DuplicateParticipant(key));
        }

        tracing::debug!(component = "coordinator", participant = %key, "Participant registered");
        self.participants.push(Registered {
            key: key.clone(),
            participant,
        });
        Ok(key)
    }

    /// Open a new transaction in `PENDING` state.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorStateError::TransactionInProgress`] when a
    /// transaction is already open.
    pub fn begin(&mut self) -> Result<TransactionId, CoordinatorStateError> {
        if let Some(open) = &self.current {
            return Err(CoordinatorStateError::TransactionInProgress {
                open: open.id().clone(),
            });
        }

        let id = TransactionId::generate();
        let participant_ids = self.participants().cloned().collect();
        self.current = Some(Transaction::new(id.clone(), participant_ids, self.clock.now()));

        CoordinatorMetrics::record_begin();
        tracing::info!(
            component = "coordinator",
            transaction_id = %id,
            participants = self.participants.len(),
            outcome = TransactionState::Pending.as_str(),
            "Transaction begun"
        );
        Ok(id)
    }

    /// Run both phases on the open transaction.
    ///
    /// Returns the `COMMITTED` snapshot. Once a terminal state is reached the
    /// coordinator is idle again, whatever the outcome.
    ///
    /// # Errors
    ///
    /// - [`TransactionError::State`] with nothing open, or when the open
    ///   transaction is not `PENDING`
    /// - [`TransactionError::Aborted`] when a prepare failed (state
    ///   `ROLLED_BACK`, or `FAILED` if a rollback failed too)
    /// - [`TransactionError::PartialCommit`] when a commit failed (state
    ///   `FAILED`)
    #[tracing::instrument(
        skip(self),
        name = "two_phase_commit",
        fields(component = "coordinator", transaction_id = tracing::field::Empty)
    )]
    pub async fn commit(&mut self) -> Result<Transaction, TransactionError> {
        let started = Instant::now();
        let mut open = self.open()?;
        let outcome = open.round()?.commit().await;
        CoordinatorMetrics::record_commit_duration(started.elapsed());
        open.conclude();
        outcome
    }

    /// Abort the open transaction, rolling back every registered participant.
    ///
    /// Participants with nothing staged report "nothing to undo", which counts
    /// as success.
    ///
    /// # Errors
    ///
    /// - [`TransactionError::State`] with nothing open, or when the open
    ///   transaction is already past the point of no return
    /// - [`TransactionError::RollbackIncomplete`] when at least one rollback
    ///   call failed (state `FAILED`)
    #[tracing::instrument(
        skip(self),
        name = "two_phase_rollback",
        fields(component = "coordinator", transaction_id = tracing::field::Empty)
    )]
    pub async fn rollback(&mut self) -> Result<Transaction, TransactionError> {
        let mut open = self.open()?;
        let outcome = open.round()?.abort().await;
        open.conclude();
        outcome
    }

    fn open(&mut self) -> Result<OpenTransaction<'_>, CoordinatorStateError> {
        let tx = self
            .current
            .as_ref()
            .ok_or(CoordinatorStateError::NoOpenTransaction)?;
        tracing::Span::current().record("transaction_id", tracing::field::display(tx.id()));
        Ok(OpenTransaction {
            participants: &self.participants,
            config: &self.config,
            current: &mut self.current,
            concluded: false,
        })
    }
}

/// Release the transaction once it is terminal.
fn release(current: &mut Option<Transaction>) {
    if !current.as_ref().is_some_and(Transaction::is_terminal) {
        return;
    }
    if let Some(tx) = current.take() {
        CoordinatorMetrics::record_outcome(tx.state());
        tracing::info!(
            component = "coordinator",
            transaction_id = %tx.id(),
            outcome = tx.state().as_str(),
            "Transaction concluded"
        );
    }
}

/// The coordinator's open transaction for the duration of one `commit()` or
/// `rollback()` call.
///
/// Dropped without [`conclude`](Self::conclude) means the caller's future was
/// cancelled at an await point. A transaction caught in `COMMITTING` or
/// `ROLLING_BACK` then ends in `FAILED` and the coordinator is idle again. One
/// caught in `PREPARING` stays open so `rollback()` can unwind it.
struct OpenTransaction<'a> {
    participants: &'a [Registered],
    config: &'a CoordinatorConfig,
    current: &'a mut Option<Transaction>,
    concluded: bool,
}

impl OpenTransaction<'_> {
    fn round(&mut self) -> Result<Round<'_>, CoordinatorStateError> {
        let tx = self
            .current
            .as_mut()
            .ok_or(CoordinatorStateError::NoOpenTransaction)?;
        Ok(Round {
            participants: self.participants,
            config: self.config,
            tx,
        })
    }

    fn conclude(&mut self) {
        self.concluded = true;
        release(self.current);
    }
}

impl Drop for OpenTransaction<'_> {
    fn drop(&mut self) {
        if self.concluded {
            return;
        }
        let Some(tx) = self.current.as_mut() else {
            return;
        };

        let interrupted = tx.state();
        match interrupted {
            TransactionState::Committing | TransactionState::RollingBack => {
                if tx.transition(TransactionState::Failed).is_ok() {
                    tracing::error!(
                        component = "coordinator",
                        transaction_id = %tx.id(),
                        from = interrupted.as_str(),
                        outcome = TransactionState::Failed.as_str(),
                        participants = ?tx.participant_ids(),
                        "Transaction abandoned mid-flight, participant outcomes unknown: manual recovery required"
                    );
                }
            }
            TransactionState::Preparing => tracing::warn!(
                component = "coordinator",
                transaction_id = %tx.id(),
                outcome = interrupted.as_str(),
                "Commit abandoned during prepare, transaction left open for rollback"
            ),
            _ => {}
        }
        release(self.current);
    }
}

/// Prepare phase stopped; what to undo.
struct PrepareAbort {
    cause: ParticipantFailure,
    /// Registry indices to roll back, ascending
    undo: Vec<usize>,
}

/// Commit phase stopped at `failed_at`.
struct CommitBreak {
    committed: Vec<ParticipantKey>,
    failed_at: usize,
    failure: ParticipantFailure,
}

/// One pass of the protocol over the open transaction.
struct Round<'a> {
    participants: &'a [Registered],
    config: &'a CoordinatorConfig,
    tx: &'a mut Transaction,
}

impl Round<'_> {
    async fn commit(mut self) -> Result<Transaction, TransactionError> {
        self.advance(TransactionState::Preparing)?;

        let prepared = match self.config.prepare_mode {
            PrepareMode::Sequential => self.prepare_in_order().await,
            PrepareMode::Concurrent => self.prepare_concurrently().await,
        };

        if let Err(abort) = prepared {
            self.advance(TransactionState::RollingBack)?;
            let rollback_failures = self.roll_back(&abort.undo).await;
            self.finish_rollback(&rollback_failures)?;
            return Err(TransactionError::Aborted {
                transaction: self.tx.clone(),
                cause: abort.cause,
                rollback_failures,
            });
        }

        self.advance(TransactionState::Prepared)?;
        self.advance(TransactionState::Committing)?;

        if let Err(stop) = self.commit_in_order().await {
            self.advance(TransactionState::Failed)?;
            let partial = PartialCommitFailure {
                transaction: self.tx.clone(),
                committed: stop.committed,
                failed: self.participants[stop.failed_at].key.clone(),
                failure: stop.failure,
                not_attempted: self.participants[stop.failed_at + 1..]
                    .iter()
                    .map(|registered| registered.key.clone())
                    .collect(),
            };
            tracing::error!(
                component = "coordinator",
                transaction_id = %self.tx.id(),
                participant = %partial.failed,
                outcome = "partial_commit",
                committed = ?partial.committed,
                not_attempted = ?partial.not_attempted,
                error = %partial.failure,
                "Partial commit: atomicity lost, manual recovery required"
            );
            return Err(partial.into());
        }

        self.advance(TransactionState::Committed)?;
        Ok(self.tx.clone())
    }

    async fn abort(mut self) -> Result<Transaction, TransactionError> {
        self.advance(TransactionState::RollingBack)?;
        let everyone: Vec<usize> = (0..self.participants.len()).collect();
        let failures = self.roll_back(&everyone).await;
        self.finish_rollback(&failures)?;

        if failures.is_empty() {
            Ok(self.tx.clone())
        } else {
            Err(TransactionError::RollbackIncomplete {
                transaction: self.tx.clone(),
                failures,
            })
        }
    }

    fn advance(&mut self, next: TransactionState) -> Result<(), CoordinatorStateError> {
        let previous = self.tx.transition(next)?;
        tracing::info!(
            component = "coordinator",
            transaction_id = %self.tx.id(),
            from = previous.as_str(),
            outcome = next.as_str(),
            "Transaction state changed"
        );
        Ok(())
    }

    fn finish_rollback(
        &mut self,
        failures: &[ParticipantFailure],
    ) -> Result<(), CoordinatorStateError> {
        if failures.is_empty() {
            self.advance(TransactionState::RolledBack)
        } else {
            self.advance(TransactionState::Failed)
        }
    }

    async fn prepare_in_order(&self) -> Result<(), PrepareAbort> {
        let mut undo = Vec::new();
        for (index, registered) in self.participants.iter().enumerate() {
            if let Err(cause) = self.prepare_one(registered).await {
                if outcome_unknown(&cause) {
                    undo.push(index);
                }
                return Err(PrepareAbort { cause, undo });
            }
            undo.push(index);
        }
        Ok(())
    }

    async fn prepare_concurrently(&self) -> Result<(), PrepareAbort> {
        let results = join_all(
            self.participants
                .iter()
                .map(|registered| self.prepare_one(registered)),
        )
        .await;

        let mut undo = Vec::new();
        let mut first_failure = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(()) => undo.push(index),
                Err(failure) => {
                    if outcome_unknown(&failure) {
                        undo.push(index);
                    }
                    if first_failure.is_none() {
                        first_failure = Some(failure);
                    }
                }
            }
        }

        match first_failure {
            None => Ok(()),
            Some(cause) => Err(PrepareAbort { cause, undo }),
        }
    }

    async fn prepare_one(&self, registered: &Registered) -> ParticipantResult<()> {
        let tx_id = self.tx.id();
        let key = &registered.key;
        let participant = &registered.participant;
        let timeout = self.config.prepare_timeout;
        let mut attempt = 0_usize;

        let result = retry_with_predicate(
            &self.config.prepare_retry,
            move || {
                attempt += 1;
                if attempt > 1 {
                    CoordinatorMetrics::record_prepare_retry();
                }
                guarded(
                    FailureKind::Prepare,
                    key,
                    tx_id,
                    timeout,
                    participant.prepare(tx_id.clone()),
                )
            },
            ParticipantFailure::is_ambiguous,
        )
        .await;

        self.report(key, "prepared", result.as_ref().err());
        result
    }

    async fn commit_in_order(&self) -> Result<(), CommitBreak> {
        let tx_id = self.tx.id();
        let mut committed = Vec::with_capacity(self.participants.len());
        for (index, registered) in self.participants.iter().enumerate() {
            let result = guarded(
                FailureKind::Commit,
                &registered.key,
                tx_id,
                self.config.commit_timeout,
                registered.participant.commit(tx_id.clone()),
            )
            .await;
            self.report(&registered.key, "committed", result.as_ref().err());

            if let Err(failure) = result {
                return Err(CommitBreak {
                    committed,
                    failed_at: index,
                    failure,
                });
            }
            committed.push(registered.key.clone());
        }
        Ok(())
    }

    /// Roll back the given participants in registration order, collecting
    /// failures instead of stopping at them.
    async fn roll_back(&self, indices: &[usize]) -> Vec<ParticipantFailure> {
        let tx_id = self.tx.id();
        let mut failures = Vec::new();
        for registered in indices.iter().filter_map(|&index| self.participants.get(index)) {
            let result = guarded(
                FailureKind::Rollback,
                &registered.key,
                tx_id,
                self.config.rollback_timeout,
                registered.participant.rollback(tx_id.clone()),
            )
            .await;

            self.report(&registered.key, "rolled_back", result.as_ref().err());
            if let Err(failure) = result {
                failures.push(failure);
            }
        }
        failures
    }

    fn report(&self, key: &ParticipantKey, success: &'static str, failure: Option<&ParticipantFailure>) {
        match failure {
            None => tracing::debug!(
                component = "coordinator",
                transaction_id = %self.tx.id(),
                participant = %key,
                outcome = success,
                "Participant call succeeded"
            ),
            Some(failure) => {
                CoordinatorMetrics::record_participant_failure(failure.kind);
                tracing::warn!(
                    component = "coordinator",
                    transaction_id = %self.tx.id(),
                    participant = %key,
                    outcome = "failed",
                    phase = failure.kind.as_str(),
                    code = %failure.code,
                    error = %failure.message,
                    "Participant call failed"
                );
            }
        }
    }
}

/// Whether the participant may hold prepared work despite the failure.
fn outcome_unknown(failure: &ParticipantFailure) -> bool {
    failure.is_ambiguous() || failure.code == codes::PARTICIPANT_PANICKED
}
