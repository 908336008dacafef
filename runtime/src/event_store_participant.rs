//! Event-store participant.
//!
//! Application code stages event batches against a transaction id. Nothing is
//! written until commit:
//!
//! - `prepare` seals the buffer and checks every expected version against the
//!   store's current versions, without appending
//! - `commit` appends the sealed batches in staging order
//! - `rollback` drops the buffer
//!
//! The store has no reservation mechanism, so a writer outside the unit of work
//! that appends between prepare and commit still surfaces as a commit-time
//! concurrency conflict. Batches appended before the conflict stay in the
//! store; the commit failure lists them as `stream@version`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use twophase_core::event::PendingEvent;
use twophase_core::event_store::{EventStore, EventStoreError};
use twophase_core::stream::{StreamId, Version};
use twophase_core::{
    FailureKind, ParticipantFailure, ParticipantFuture, ParticipantResult, PrepareLedger,
    PrepareStep, RollbackOutcome, Settlement, TransactionId, TransactionParticipant, codes,
};

#[derive(Debug)]
struct StagedBatch {
    stream_id: StreamId,
    expected_version: Option<Version>,
    events: Vec<PendingEvent>,
}

#[derive(Debug, Default)]
struct StagedAppends {
    batches: Vec<StagedBatch>,
    sealed: bool,
}

/// Buffers appends per transaction and flushes them on commit.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use twophase_core::event::PendingEvent;
/// use twophase_core::stream::{StreamId, Version};
/// use twophase_core::{TransactionId, TransactionParticipant};
/// use twophase_runtime::EventStoreParticipant;
/// use twophase_testing::InMemoryEventStore;
///
/// # tokio_test::block_on(async {
/// let store = Arc::new(InMemoryEventStore::new());
/// let events = EventStoreParticipant::new("LEDGER_EVENTS", store.clone());
/// let tx = TransactionId::new("tx-1");
///
/// events
///     .stage(&tx, StreamId::new("account-1"), Some(Version::INITIAL), vec![
///         PendingEvent::new("Debited.v1".into(), vec![1], None),
///     ])
///     .unwrap();
///
/// events.prepare(tx.clone()).await.unwrap();
/// assert_eq!(store.event_count(&StreamId::new("account-1")), 0);
///
/// events.commit(tx).await.unwrap();
/// assert_eq!(store.event_count(&StreamId::new("account-1")), 1);
/// # });
/// ```
pub struct EventStoreParticipant {
    resource: String,
    store: Arc<dyn EventStore>,
    ledger: PrepareLedger,
    staged: Mutex<HashMap<TransactionId, StagedAppends>>,
}

impl std::fmt::Debug for EventStoreParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStoreParticipant")
            .field("resource", &self.resource)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl EventStoreParticipant {
    /// Wrap `store`; `resource` prefixes failure codes (`<RESOURCE>_PREPARE_FAILED`).
    #[must_use]
    pub fn new(resource: impl Into<String>, store: Arc<dyn EventStore>) -> Self {
        Self {
            resource: resource.into(),
            store,
            ledger: PrepareLedger::new(),
            staged: Mutex::new(HashMap::new()),
        }
    }

    /// Resource name used in failure codes.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Prepare bookkeeping for this participant.
    #[must_use]
    pub const fn ledger(&self) -> &PrepareLedger {
        &self.ledger
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TransactionId, StagedAppends>> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stage `events` for `stream_id` under `tx_id`.
    ///
    /// With `Some(expected)`, prepare fails unless the stream will be at that
    /// version when this batch is flushed (earlier batches staged for the same
    /// stream in this transaction count).
    ///
    /// # Errors
    ///
    /// - `TX_SEALED` once `prepare` has been called for `tx_id`
    /// - `TX_ALREADY_FINISHED` when `tx_id` was already settled
    pub fn stage(
        &self,
        tx_id: &TransactionId,
        stream_id: StreamId,
        expected_version: Option<Version>,
        events: Vec<PendingEvent>,
    ) -> ParticipantResult<()> {
        if let Some(settlement) = self.ledger.settlement(tx_id) {
            return Err(ParticipantFailure::already_finished(
                tx_id.clone(),
                settlement.label(),
            ));
        }

        let mut staged = self.lock();
        let appends = staged.entry(tx_id.clone()).or_default();
        if appends.sealed || self.ledger.is_prepared(tx_id) {
            return Err(ParticipantFailure::new(
                FailureKind::ProtocolViolation,
                codes::TX_SEALED,
                format!("{} no longer accepts events for this transaction", self.resource),
                tx_id.clone(),
            ));
        }

        tracing::debug!(
            resource = %self.resource,
            transaction_id = %tx_id,
            stream_id = %stream_id,
            count = events.len(),
            "Staged events"
        );
        appends.batches.push(StagedBatch {
            stream_id,
            expected_version,
            events,
        });
        Ok(())
    }

    /// Number of batches staged for `tx_id`.
    #[must_use]
    pub fn staged_batches(&self, tx_id: &TransactionId) -> usize {
        self.lock().get(tx_id).map_or(0, |appends| appends.batches.len())
    }

    fn discard(&self, tx_id: &TransactionId) -> bool {
        self.lock().remove(tx_id).is_some()
    }

    fn failure(
        &self,
        kind: FailureKind,
        tx_id: &TransactionId,
        err: &EventStoreError,
    ) -> ParticipantFailure {
        let code = match kind {
            FailureKind::Commit => codes::commit_failed(&self.resource),
            FailureKind::Rollback => codes::rollback_failed(&self.resource),
            FailureKind::Prepare | FailureKind::ProtocolViolation => {
                codes::prepare_failed(&self.resource)
            }
        };
        ParticipantFailure::new(kind, code, err.to_string(), tx_id.clone())
    }

    /// Commit failure naming the streams already appended before `failed_on`.
    ///
    /// Appends are per stream, so those events stay durable.
    fn flush_failure(
        &self,
        tx_id: &TransactionId,
        err: &EventStoreError,
        failed_on: &StreamId,
        flushed: &[(StreamId, Version)],
    ) -> ParticipantFailure {
        let mut failure = self.failure(FailureKind::Commit, tx_id, err);
        if flushed.is_empty() {
            return failure;
        }

        let streams = flushed
            .iter()
            .map(|(stream_id, version)| format!("{stream_id}@{version}"))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::error!(
            resource = %self.resource,
            transaction_id = %tx_id,
            stream_id = %failed_on,
            flushed = %streams,
            error = %err,
            "Commit stopped after flushing part of the staged events"
        );
        failure.message = format!("{}; already flushed: {streams}", failure.message);
        failure
    }

    /// Seal the buffer and return what must be validated.
    fn seal(&self, tx_id: &TransactionId) -> Vec<(StreamId, Option<Version>, u64)> {
        let mut staged = self.lock();
        let appends = staged.entry(tx_id.clone()).or_default();
        appends.sealed = true;
        appends
            .batches
            .iter()
            .map(|batch| {
                (
                    batch.stream_id.clone(),
                    batch.expected_version,
                    batch.events.len() as u64,
                )
            })
            .collect()
    }

    async fn validate(
        &self,
        tx_id: &TransactionId,
        plan: Vec<(StreamId, Option<Version>, u64)>,
    ) -> ParticipantResult<()> {
        let mut projected: HashMap<StreamId, Version> = HashMap::new();
        for (stream_id, expected, count) in plan {
            let current = match projected.get(&stream_id) {
                Some(version) => *version,
                None => self
                    .store
                    .current_version(stream_id.clone())
                    .await
                    .map_err(|err| self.failure(FailureKind::Prepare, tx_id, &err))?,
            };

            if let Some(expected) = expected.filter(|expected| *expected != current) {
                let conflict = EventStoreError::ConcurrencyConflict {
                    stream_id,
                    expected,
                    actual: current,
                };
                return Err(self.failure(FailureKind::Prepare, tx_id, &conflict));
            }
            projected.insert(stream_id, current.advanced_by(count));
        }
        Ok(())
    }

    async fn prepare_inner(&self, tx_id: TransactionId) -> ParticipantResult<()> {
        if self.ledger.begin_prepare(&tx_id)? == PrepareStep::AlreadyPrepared {
            return Ok(());
        }

        let plan = self.seal(&tx_id);
        let batches = plan.len();
        if let Err(failure) = self.validate(&tx_id, plan).await {
            self.discard(&tx_id);
            self.ledger.refuse(failure.clone());
            return Err(failure);
        }

        if let Err(stale) = self.ledger.mark_prepared(&tx_id) {
            self.discard(&tx_id);
            tracing::warn!(
                resource = %self.resource,
                transaction_id = %tx_id,
                "Discarding prepare for a transaction settled meanwhile"
            );
            return Err(stale);
        }

        tracing::debug!(
            resource = %self.resource,
            transaction_id = %tx_id,
            batches,
            "Prepared staged events"
        );
        Ok(())
    }

    async fn commit_inner(&self, tx_id: TransactionId) -> ParticipantResult<()> {
        self.ledger.check_commit(&tx_id)?;

        let batches = self
            .lock()
            .remove(&tx_id)
            .map(|appends| appends.batches)
            .unwrap_or_default();

        let mut appended = 0_usize;
        let mut flushed: Vec<(StreamId, Version)> = Vec::new();
        for batch in batches {
            let count = batch.events.len();
            let stream_id = batch.stream_id.clone();
            match self
                .store
                .append_events(batch.stream_id, batch.expected_version, batch.events)
                .await
            {
                Ok(version) => flushed.push((stream_id, version)),
                Err(err) => {
                    let failure = self.flush_failure(&tx_id, &err, &stream_id, &flushed);
                    self.ledger
                        .settle(&tx_id, Settlement::CommitFailed(failure.clone()));
                    return Err(failure);
                }
            }
            appended += count;
        }

        self.ledger.settle(&tx_id, Settlement::Committed);
        tracing::debug!(
            resource = %self.resource,
            transaction_id = %tx_id,
            appended,
            "Flushed staged events"
        );
        Ok(())
    }

    fn rollback_inner(&self, tx_id: &TransactionId) -> RollbackOutcome {
        if self.ledger.settlement(tx_id) == Some(Settlement::Committed) {
            tracing::warn!(
                resource = %self.resource,
                transaction_id = %tx_id,
                "Rollback requested for committed events; nothing to undo"
            );
            return RollbackOutcome::NothingToUndo;
        }

        let had_buffer = self.discard(tx_id);
        let was_prepared = self.ledger.settle(tx_id, Settlement::RolledBack);
        if had_buffer || was_prepared {
            RollbackOutcome::RolledBack
        } else {
            RollbackOutcome::NothingToUndo
        }
    }
}

impl TransactionParticipant for EventStoreParticipant {
    fn prepare(&self, tx_id: TransactionId) -> ParticipantFuture<'_, ()> {
        Box::pin(self.prepare_inner(tx_id))
    }

    fn commit(&self, tx_id: TransactionId) -> ParticipantFuture<'_, ()> {
        Box::pin(self.commit_inner(tx_id))
    }

    fn rollback(&self, tx_id: TransactionId) -> ParticipantFuture<'_, RollbackOutcome> {
        Box::pin(async move { Ok(self.rollback_inner(&tx_id)) })
    }
}
