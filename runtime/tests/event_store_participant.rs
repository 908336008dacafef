//! Event-store participant against the in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use twophase_core::event::{Event, PendingEvent};
use twophase_core::event_store::EventStoreError;
use twophase_core::stream::{StreamId, Version};
use twophase_core::{
    FailureKind, RollbackOutcome, Settlement, TransactionError, TransactionId,
    TransactionParticipant, TransactionState, codes,
};
use twophase_runtime::{DistributedUnitOfWork, EventStoreParticipant};
use twophase_testing::{CallLog, InMemoryEventStore, SpyParticipant, init_test_tracing};

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum AccountEvent {
    Debited { cents: i64 },
    Credited { cents: i64 },
}

impl Event for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Debited { .. } => "Debited.v1",
            Self::Credited { .. } => "Credited.v1",
        }
    }
}

fn pending(event: &AccountEvent) -> PendingEvent {
    PendingEvent::from_event(event, None).unwrap()
}

fn setup() -> (Arc<InMemoryEventStore>, EventStoreParticipant) {
    init_test_tracing();
    let store = Arc::new(InMemoryEventStore::new());
    let participant = EventStoreParticipant::new("LEDGER_EVENTS", store.clone());
    (store, participant)
}

fn tx(n: u8) -> TransactionId {
    TransactionId::new(format!("tx-{n}"))
}

fn account(n: u8) -> StreamId {
    StreamId::new(format!("account-{n}"))
}

// ============================================================================
// Participant contract
// ============================================================================

#[tokio::test]
async fn nothing_is_written_before_commit() {
    let (store, events) = setup();
    events
        .stage(&tx(1), account(1), Some(Version::INITIAL), vec![pending(&AccountEvent::Debited { cents: 500 })])
        .unwrap();

    events.prepare(tx(1)).await.unwrap();
    assert_eq!(store.event_count(&account(1)), 0);

    events.commit(tx(1)).await.unwrap();
    let stored = store.events(&account(1));
    assert_eq!(stored.len(), 1);
    assert_eq!(
        AccountEvent::from_bytes(&stored[0].data).unwrap(),
        AccountEvent::Debited { cents: 500 }
    );
}

#[tokio::test]
async fn batches_flush_in_staging_order() {
    let (store, events) = setup();
    events
        .stage(&tx(1), account(1), Some(Version::INITIAL), vec![pending(&AccountEvent::Debited { cents: 1 })])
        .unwrap();
    events
        .stage(&tx(1), account(1), Some(Version::new(1)), vec![pending(&AccountEvent::Credited { cents: 2 })])
        .unwrap();

    events.prepare(tx(1)).await.unwrap();
    events.commit(tx(1)).await.unwrap();

    let types: Vec<String> = store
        .events(&account(1))
        .into_iter()
        .map(|event| event.event_type)
        .collect();
    assert_eq!(types, vec!["Debited.v1", "Credited.v1"]);
}

#[tokio::test]
async fn stale_expected_version_refuses_prepare() {
    let (store, events) = setup();
    store.seed(&account(1), vec![pending(&AccountEvent::Credited { cents: 9 })]);
    events
        .stage(&tx(1), account(1), Some(Version::INITIAL), vec![pending(&AccountEvent::Debited { cents: 1 })])
        .unwrap();

    let failure = events.prepare(tx(1)).await.unwrap_err();
    assert_eq!(failure.code, "LEDGER_EVENTS_PREPARE_FAILED");
    assert_eq!(failure.kind, FailureKind::Prepare);
    assert!(failure.message.contains("expected version 0"));
    assert_eq!(events.staged_batches(&tx(1)), 0);

    // idempotent: the same refusal, no new store reads
    store.fail_next_read(EventStoreError::IoError("must not be called".into()));
    assert_eq!(events.prepare(tx(1)).await.unwrap_err(), failure);
}

#[tokio::test]
async fn store_read_error_refuses_prepare() {
    let (store, events) = setup();
    events.stage(&tx(1), account(1), None, vec![pending(&AccountEvent::Debited { cents: 1 })]).unwrap();
    store.fail_next_read(EventStoreError::DatabaseError("connection refused".into()));

    let failure = events.prepare(tx(1)).await.unwrap_err();
    assert_eq!(failure.code, "LEDGER_EVENTS_PREPARE_FAILED");
    assert!(failure.message.contains("connection refused"));
}

#[tokio::test]
async fn staging_is_sealed_by_prepare() {
    let (_store, events) = setup();
    events.prepare(tx(1)).await.unwrap();

    let failure = events
        .stage(&tx(1), account(1), None, vec![pending(&AccountEvent::Debited { cents: 1 })])
        .unwrap_err();
    assert_eq!(failure.code, codes::TX_SEALED);
    assert!(failure.is_protocol_violation());
}

#[tokio::test]
async fn commit_requires_prepare() {
    let (store, events) = setup();
    events.stage(&tx(1), account(1), None, vec![pending(&AccountEvent::Debited { cents: 1 })]).unwrap();

    let failure = events.commit(tx(1)).await.unwrap_err();
    assert_eq!(failure.code, codes::TX_NOT_PREPARED);
    assert_eq!(store.event_count(&account(1)), 0);
}

#[tokio::test]
async fn repeated_prepare_has_no_extra_side_effects() {
    let (store, events) = setup();
    events.stage(&tx(1), account(1), Some(Version::INITIAL), vec![pending(&AccountEvent::Debited { cents: 1 })]).unwrap();

    events.prepare(tx(1)).await.unwrap();
    store.fail_next_read(EventStoreError::IoError("must not be called".into()));
    events.prepare(tx(1)).await.unwrap();
    assert!(events.ledger().is_prepared(&tx(1)));
}

#[tokio::test]
async fn rollback_discards_buffer() {
    let (store, events) = setup();
    events.stage(&tx(1), account(1), None, vec![pending(&AccountEvent::Debited { cents: 1 })]).unwrap();
    events.prepare(tx(1)).await.unwrap();

    assert_eq!(events.rollback(tx(1)).await, Ok(RollbackOutcome::RolledBack));
    assert_eq!(events.staged_batches(&tx(1)), 0);
    assert!(events.commit(tx(1)).await.is_err());
    assert_eq!(store.event_count(&account(1)), 0);
}

#[tokio::test]
async fn rollback_of_unknown_transaction_has_nothing_to_undo() {
    let (_store, events) = setup();
    assert_eq!(events.rollback(tx(9)).await, Ok(RollbackOutcome::NothingToUndo));
}

#[tokio::test]
async fn staging_after_rollback_is_rejected() {
    let (_store, events) = setup();
    events.rollback(tx(1)).await.unwrap();
    let failure = events.stage(&tx(1), account(1), None, Vec::new()).unwrap_err();
    assert_eq!(failure.code, codes::TX_ALREADY_FINISHED);
}

#[tokio::test]
async fn append_failure_is_a_commit_failure() {
    let (store, events) = setup();
    events.stage(&tx(1), account(1), None, vec![pending(&AccountEvent::Debited { cents: 1 })]).unwrap();
    events.prepare(tx(1)).await.unwrap();
    store.fail_next_append(EventStoreError::IoError("disk full".into()));

    let failure = events.commit(tx(1)).await.unwrap_err();
    assert_eq!(failure.code, "LEDGER_EVENTS_COMMIT_FAILED");
    assert_eq!(failure.kind, FailureKind::Commit);
}

#[tokio::test]
async fn conflict_on_a_later_stream_reports_the_flushed_ones() {
    let (store, events) = setup();
    events
        .stage(&tx(1), account(1), Some(Version::INITIAL), vec![pending(&AccountEvent::Debited { cents: 5 })])
        .unwrap();
    events
        .stage(&tx(1), account(2), Some(Version::INITIAL), vec![pending(&AccountEvent::Credited { cents: 5 })])
        .unwrap();
    events.prepare(tx(1)).await.unwrap();

    // another writer lands on the second stream between prepare and commit
    store.seed(&account(2), vec![pending(&AccountEvent::Credited { cents: 1 })]);

    let failure = events.commit(tx(1)).await.unwrap_err();
    assert_eq!(failure.code, "LEDGER_EVENTS_COMMIT_FAILED");
    assert!(failure.message.contains("already flushed: account-1@1"), "{}", failure.message);
    assert!(!failure.message.contains("account-2@"), "{}", failure.message);
    assert_eq!(store.event_count(&account(1)), 1);
    assert_eq!(store.event_count(&account(2)), 1);
    assert_eq!(
        events.ledger().settlement(&tx(1)),
        Some(Settlement::CommitFailed(failure))
    );
}

// ============================================================================
// Under the coordinator
// ============================================================================

#[tokio::test]
async fn sql_refusal_leaves_event_stream_untouched() {
    init_test_tracing();
    let store = Arc::new(InMemoryEventStore::new());
    let events = Arc::new(EventStoreParticipant::new("LEDGER_EVENTS", store.clone()));
    let orders = Arc::new(SpyParticipant::new("orders", CallLog::new()).failing_prepare("ORDER_DB_PREPARE_FAILED"));

    let mut uow = DistributedUnitOfWork::new();
    let participant: Arc<EventStoreParticipant> = Arc::clone(&events);
    uow.register_participant("events", participant).unwrap();
    uow.register_participant("orders", orders).unwrap();

    let tx_id = uow.begin().unwrap();
    events
        .stage(&tx_id, account(1), Some(Version::INITIAL), vec![pending(&AccountEvent::Debited { cents: 100 })])
        .unwrap();

    let err = uow.commit().await.unwrap_err();
    assert!(matches!(err, TransactionError::Aborted { .. }));
    assert_eq!(err.final_state(), Some(TransactionState::RolledBack));
    assert_eq!(store.event_count(&account(1)), 0);
    assert_eq!(events.staged_batches(&tx_id), 0);
}

#[tokio::test]
async fn commit_flushes_events_with_other_participants() {
    init_test_tracing();
    let store = Arc::new(InMemoryEventStore::new());
    let events = Arc::new(EventStoreParticipant::new("LEDGER_EVENTS", store.clone()));
    let orders = Arc::new(SpyParticipant::new("orders", CallLog::new()));

    let mut uow = DistributedUnitOfWork::new();
    let participant: Arc<SpyParticipant> = Arc::clone(&orders);
    uow.register_participant("orders", participant).unwrap();
    let participant: Arc<EventStoreParticipant> = Arc::clone(&events);
    uow.register_participant("events", participant).unwrap();

    let tx_id = uow.begin().unwrap();
    orders.write(&tx_id, "order-1");
    events
        .stage(&tx_id, account(1), None, vec![pending(&AccountEvent::Debited { cents: 100 })])
        .unwrap();

    let tx = uow.commit().await.unwrap();
    assert_eq!(tx.state(), TransactionState::Committed);
    assert!(orders.has_durable_effects(&tx_id));
    assert_eq!(store.event_count(&account(1)), 1);
}
