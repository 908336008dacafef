//! A scriptable participant that records what the coordinator asks of it.
//!
//! Every spy created with the same [`CallLog`] appends to it, so tests can
//! assert on the global order of calls across participants.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use twophase_core::{
    ParticipantFailure, ParticipantFuture, ParticipantResult, PrepareLedger, PrepareStep,
    RollbackOutcome, Settlement, TransactionId, TransactionParticipant,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Participant operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    /// `prepare`
    Prepare,
    /// `commit`
    Commit,
    /// `rollback`
    Rollback,
}

/// One recorded participant call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    /// Spy name
    pub participant: String,
    /// Operation called
    pub op: Op,
    /// Transaction id passed
    pub tx_id: TransactionId,
}

/// Shared, ordered record of calls across spies.
#[derive(Clone, Debug, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, participant: &str, op: Op, tx_id: &TransactionId) {
        lock(&self.0).push(Call {
            participant: participant.to_string(),
            op,
            tx_id: tx_id.clone(),
        });
    }

    /// Every call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        lock(&self.0).clone()
    }

    /// `(participant, op)` pairs in call order.
    #[must_use]
    pub fn sequence(&self) -> Vec<(String, Op)> {
        lock(&self.0)
            .iter()
            .map(|call| (call.participant.clone(), call.op))
            .collect()
    }

    /// Participants that received `op`, in call order.
    #[must_use]
    pub fn participants_for(&self, op: Op) -> Vec<String> {
        lock(&self.0)
            .iter()
            .filter(|call| call.op == op)
            .map(|call| call.participant.clone())
            .collect()
    }

    /// How many times `participant` received `op`.
    #[must_use]
    pub fn count(&self, participant: &str, op: Op) -> usize {
        lock(&self.0)
            .iter()
            .filter(|call| call.participant == participant && call.op == op)
            .count()
    }

    /// Forget everything recorded.
    pub fn clear(&self) {
        lock(&self.0).clear();
    }
}

#[derive(Clone, Debug, Default)]
enum Behavior {
    #[default]
    Succeed,
    Fail(String),
    Panic(String),
}

#[derive(Debug, Default)]
struct Script {
    prepare: Behavior,
    commit: Behavior,
    rollback: Behavior,
    prepare_delay: Option<Duration>,
    commit_delay: Option<Duration>,
    /// Only the first this-many prepare calls are delayed
    delayed_prepares: Option<usize>,
}

/// A participant double with scriptable outcomes.
///
/// Application "writes" are plain strings staged per transaction id. They
/// become durable on commit and are dropped on rollback, which lets tests check
/// atomicity directly.
#[derive(Debug)]
pub struct SpyParticipant {
    name: String,
    log: CallLog,
    script: Script,
    ledger: PrepareLedger,
    staged: Mutex<HashMap<TransactionId, Vec<String>>>,
    durable: Mutex<Vec<(TransactionId, String)>>,
    committed: Mutex<HashSet<TransactionId>>,
    prepare_calls: AtomicUsize,
    prepare_side_effects: AtomicUsize,
}

impl SpyParticipant {
    /// Spy that succeeds at everything.
    #[must_use]
    pub fn new(name: impl Into<String>, log: CallLog) -> Self {
        Self {
            name: name.into(),
            log,
            script: Script::default(),
            ledger: PrepareLedger::new(),
            staged: Mutex::new(HashMap::new()),
            durable: Mutex::new(Vec::new()),
            committed: Mutex::new(HashSet::new()),
            prepare_calls: AtomicUsize::new(0),
            prepare_side_effects: AtomicUsize::new(0),
        }
    }

    /// Refuse every prepare with `code`.
    #[must_use]
    pub fn failing_prepare(mut self, code: impl Into<String>) -> Self {
        self.script.prepare = Behavior::Fail(code.into());
        self
    }

    /// Fail every commit with `code`.
    #[must_use]
    pub fn failing_commit(mut self, code: impl Into<String>) -> Self {
        self.script.commit = Behavior::Fail(code.into());
        self
    }

    /// Fail every rollback with `code`.
    #[must_use]
    pub fn failing_rollback(mut self, code: impl Into<String>) -> Self {
        self.script.rollback = Behavior::Fail(code.into());
        self
    }

    /// Panic inside every prepare.
    #[must_use]
    pub fn panicking_prepare(mut self, message: impl Into<String>) -> Self {
        self.script.prepare = Behavior::Panic(message.into());
        self
    }

    /// Panic inside every commit.
    #[must_use]
    pub fn panicking_commit(mut self, message: impl Into<String>) -> Self {
        self.script.commit = Behavior::Panic(message.into());
        self
    }

    /// Delay every prepare by `delay`.
    #[must_use]
    pub const fn slow_prepare(mut self, delay: Duration) -> Self {
        self.script.prepare_delay = Some(delay);
        self.script.delayed_prepares = None;
        self
    }

    /// Delay only the first `times` prepare calls by `delay`.
    #[must_use]
    pub const fn slow_first_prepares(mut self, times: usize, delay: Duration) -> Self {
        self.script.prepare_delay = Some(delay);
        self.script.delayed_prepares = Some(times);
        self
    }

    /// Delay every commit by `delay`.
    #[must_use]
    pub const fn slow_commit(mut self, delay: Duration) -> Self {
        self.script.commit_delay = Some(delay);
        self
    }

    /// Spy name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prepare bookkeeping.
    #[must_use]
    pub const fn ledger(&self) -> &PrepareLedger {
        &self.ledger
    }

    /// Stage an application write under `tx_id`.
    pub fn write(&self, tx_id: &TransactionId, value: impl Into<String>) {
        lock(&self.staged)
            .entry(tx_id.clone())
            .or_default()
            .push(value.into());
    }

    /// Writes made durable by commit, in commit order.
    #[must_use]
    pub fn durable_writes(&self) -> Vec<String> {
        lock(&self.durable)
            .iter()
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Whether anything durable exists for `tx_id`.
    #[must_use]
    pub fn has_durable_effects(&self, tx_id: &TransactionId) -> bool {
        lock(&self.committed).contains(tx_id)
    }

    /// Whether writes are still staged for `tx_id`.
    #[must_use]
    pub fn has_staged(&self, tx_id: &TransactionId) -> bool {
        lock(&self.staged).contains_key(tx_id)
    }

    /// Native prepare work actually performed (idempotent repeats excluded).
    #[must_use]
    pub fn prepare_side_effects(&self) -> usize {
        self.prepare_side_effects.load(Ordering::SeqCst)
    }

    fn prepare_delay(&self) -> Option<Duration> {
        let call = self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        match self.script.delayed_prepares {
            Some(times) if call >= times => None,
            _ => self.script.prepare_delay,
        }
    }

    fn scripted_failure(
        &self,
        behavior: &Behavior,
        build: fn(String, String, TransactionId) -> ParticipantFailure,
        tx_id: &TransactionId,
    ) -> Option<ParticipantFailure> {
        match behavior {
            Behavior::Succeed => None,
            Behavior::Fail(code) => Some(build(
                code.clone(),
                format!("{} was scripted to fail", self.name),
                tx_id.clone(),
            )),
            #[allow(clippy::panic)]
            Behavior::Panic(message) => panic!("{message}"),
        }
    }

    async fn do_prepare(&self, tx_id: TransactionId) -> ParticipantResult<()> {
        self.log.record(&self.name, Op::Prepare, &tx_id);
        if let Some(delay) = self.prepare_delay() {
            tokio::time::sleep(delay).await;
        }

        if self.ledger.begin_prepare(&tx_id)? == PrepareStep::AlreadyPrepared {
            return Ok(());
        }
        if let Some(failure) =
            self.scripted_failure(&self.script.prepare, ParticipantFailure::prepare, &tx_id)
        {
            self.ledger.refuse(failure.clone());
            return Err(failure);
        }

        self.prepare_side_effects.fetch_add(1, Ordering::SeqCst);
        self.ledger.mark_prepared(&tx_id)
    }

    async fn do_commit(&self, tx_id: TransactionId) -> ParticipantResult<()> {
        self.log.record(&self.name, Op::Commit, &tx_id);
        if let Some(delay) = self.script.commit_delay {
            tokio::time::sleep(delay).await;
        }

        self.ledger.check_commit(&tx_id)?;
        if let Some(failure) =
            self.scripted_failure(&self.script.commit, ParticipantFailure::commit, &tx_id)
        {
            self.ledger
                .settle(&tx_id, Settlement::CommitFailed(failure.clone()));
            return Err(failure);
        }

        let writes = lock(&self.staged).remove(&tx_id).unwrap_or_default();
        lock(&self.durable).extend(writes.into_iter().map(|value| (tx_id.clone(), value)));
        lock(&self.committed).insert(tx_id.clone());
        self.ledger.settle(&tx_id, Settlement::Committed);
        Ok(())
    }

    fn do_rollback(&self, tx_id: &TransactionId) -> ParticipantResult<RollbackOutcome> {
        self.log.record(&self.name, Op::Rollback, tx_id);
        if let Some(failure) =
            self.scripted_failure(&self.script.rollback, ParticipantFailure::rollback, tx_id)
        {
            return Err(failure);
        }

        let had_writes = lock(&self.staged).remove(tx_id).is_some();
        let was_prepared = self.ledger.settle(tx_id, Settlement::RolledBack);
        Ok(if had_writes || was_prepared {
            RollbackOutcome::RolledBack
        } else {
            RollbackOutcome::NothingToUndo
        })
    }
}

impl TransactionParticipant for SpyParticipant {
    fn prepare(&self, tx_id: TransactionId) -> ParticipantFuture<'_, ()> {
        Box::pin(self.do_prepare(tx_id))
    }

    fn commit(&self, tx_id: TransactionId) -> ParticipantFuture<'_, ()> {
        Box::pin(self.do_commit(tx_id))
    }

    fn rollback(&self, tx_id: TransactionId) -> ParticipantFuture<'_, RollbackOutcome> {
        Box::pin(async move { self.do_rollback(&tx_id) })
    }
}
