//! Timeouts, retries, panics and concurrent prepare.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use std::sync::Arc;
use std::time::Duration;
use twophase_core::{FailureKind, ParticipantKey, TransactionError, TransactionState, codes};
use twophase_runtime::{CoordinatorConfig, DistributedUnitOfWork, PrepareMode, RetryPolicy};
use twophase_testing::{CallLog, Op, SpyParticipant, init_test_tracing};

// ============================================================================
// Test Fixtures
// ============================================================================

const SHORT: Duration = Duration::from_millis(20);
const SLOW: Duration = Duration::from_millis(500);

fn coordinator(config: CoordinatorConfig, spies: &[&Arc<SpyParticipant>]) -> DistributedUnitOfWork {
    init_test_tracing();
    let mut uow = DistributedUnitOfWork::with_config(config);
    for spy in spies {
        let participant: Arc<SpyParticipant> = Arc::clone(spy);
        uow.register_participant(spy.name().to_string(), participant)
            .unwrap();
    }
    uow
}

fn aborted_cause(err: TransactionError) -> twophase_core::ParticipantFailure {
    match err {
        TransactionError::Aborted { cause, .. } => cause,
        other => panic!("expected Aborted, got {other:?}"),
    }
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test]
async fn prepare_timeout_drives_rollback() {
    let log = CallLog::new();
    let a = Arc::new(SpyParticipant::new("a", log.clone()));
    let b = Arc::new(SpyParticipant::new("b", log.clone()).slow_prepare(SLOW));
    let mut uow = coordinator(
        CoordinatorConfig::default().with_prepare_timeout(SHORT),
        &[&a, &b],
    );

    let tx_id = uow.begin().unwrap();
    let err = uow.commit().await.unwrap_err();

    assert_eq!(err.final_state(), Some(TransactionState::RolledBack));
    let cause = aborted_cause(err);
    assert_eq!(cause.code, codes::PARTICIPANT_TIMEOUT);
    assert_eq!(cause.kind, FailureKind::Prepare);
    assert_eq!(cause.participant, Some(ParticipantKey::new("b")));

    // the timed-out participant may hold prepared work, so it is unwound too
    assert_eq!(log.count("a", Op::Rollback), 1);
    assert_eq!(log.count("b", Op::Rollback), 1);
    assert!(!b.ledger().is_prepared(&tx_id));
}

#[tokio::test]
async fn late_prepare_after_rollback_is_rejected() {
    let log = CallLog::new();
    let a = Arc::new(SpyParticipant::new("a", log.clone()).slow_prepare(SLOW));
    let mut uow = coordinator(
        CoordinatorConfig::default().with_prepare_timeout(SHORT),
        &[&a],
    );

    let tx_id = uow.begin().unwrap();
    let _ = uow.commit().await.unwrap_err();

    // a straggling prepare for the abandoned transaction must not succeed
    let late = twophase_core::TransactionParticipant::prepare(&*a, tx_id.clone()).await;
    assert_eq!(
        late.map_err(|failure| failure.code),
        Err(codes::TX_ALREADY_FINISHED.to_string())
    );
    assert_eq!(a.prepare_side_effects(), 0);
}

#[tokio::test]
async fn commit_timeout_is_a_partial_commit() {
    let log = CallLog::new();
    let a = Arc::new(SpyParticipant::new("a", log.clone()));
    let b = Arc::new(SpyParticipant::new("b", log.clone()).slow_commit(SLOW));
    let mut uow = coordinator(
        CoordinatorConfig::default().with_commit_timeout(SHORT),
        &[&a, &b],
    );

    uow.begin().unwrap();
    let err = uow.commit().await.unwrap_err();

    match err {
        TransactionError::PartialCommit(partial) => {
            assert_eq!(partial.failed, ParticipantKey::new("b"));
            assert_eq!(partial.failure.code, codes::PARTICIPANT_TIMEOUT);
            assert!(partial.failure.is_ambiguous());
        }
        other => panic!("expected PartialCommit, got {other:?}"),
    }
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test]
async fn timed_out_prepare_is_retried() {
    let log = CallLog::new();
    let a = Arc::new(SpyParticipant::new("a", log.clone()).slow_first_prepares(1, SLOW));
    let mut uow = coordinator(
        CoordinatorConfig::default()
            .with_prepare_timeout(SHORT)
            .with_prepare_retry(RetryPolicy::new(2, Duration::from_millis(1))),
        &[&a],
    );

    let tx_id = uow.begin().unwrap();
    let tx = uow.commit().await.unwrap();

    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(log.count("a", Op::Prepare), 2);
    assert_eq!(a.prepare_side_effects(), 1);
    assert!(a.has_durable_effects(&tx_id));
}

#[tokio::test]
async fn refused_prepare_is_not_retried() {
    let log = CallLog::new();
    let a = Arc::new(SpyParticipant::new("a", log.clone()).failing_prepare("A_PREPARE_FAILED"));
    let mut uow = coordinator(
        CoordinatorConfig::default().with_prepare_retry(RetryPolicy::new(3, Duration::from_millis(1))),
        &[&a],
    );

    uow.begin().unwrap();
    let err = uow.commit().await.unwrap_err();

    assert_eq!(err.code(), "A_PREPARE_FAILED");
    assert_eq!(log.count("a", Op::Prepare), 1);
}

#[tokio::test]
async fn retries_are_bounded() {
    let log = CallLog::new();
    let a = Arc::new(SpyParticipant::new("a", log.clone()).slow_prepare(SLOW));
    let mut uow = coordinator(
        CoordinatorConfig::default()
            .with_prepare_timeout(SHORT)
            .with_prepare_retry(RetryPolicy::new(2, Duration::from_millis(1))),
        &[&a],
    );

    uow.begin().unwrap();
    let err = uow.commit().await.unwrap_err();

    assert_eq!(err.code(), codes::PARTICIPANT_TIMEOUT);
    assert_eq!(log.count("a", Op::Prepare), 3);
}

// ============================================================================
// Panics
// ============================================================================

#[tokio::test]
async fn panicking_prepare_becomes_a_failure_value() {
    let log = CallLog::new();
    let a = Arc::new(SpyParticipant::new("a", log.clone()));
    let b = Arc::new(SpyParticipant::new("b", log.clone()).panicking_prepare("driver bug"));
    let c = Arc::new(SpyParticipant::new("c", log.clone()));
    let mut uow = coordinator(CoordinatorConfig::default(), &[&a, &b, &c]);

    uow.begin().unwrap();
    let err = uow.commit().await.unwrap_err();

    assert_eq!(err.final_state(), Some(TransactionState::RolledBack));
    let cause = aborted_cause(err);
    assert_eq!(cause.code, codes::PARTICIPANT_PANICKED);
    assert_eq!(cause.message, "driver bug");
    assert_eq!(cause.participant, Some(ParticipantKey::new("b")));
    assert_eq!(log.count("a", Op::Rollback), 1);
    assert_eq!(log.count("c", Op::Prepare), 0);
    assert!(uow.is_idle());
}

// ============================================================================
// Concurrent prepare
// ============================================================================

#[tokio::test]
async fn concurrent_prepare_commits_in_registration_order() {
    let log = CallLog::new();
    let a = Arc::new(SpyParticipant::new("a", log.clone()).slow_prepare(Duration::from_millis(30)));
    let b = Arc::new(SpyParticipant::new("b", log.clone()));
    let c = Arc::new(SpyParticipant::new("c", log.clone()));
    let mut uow = coordinator(
        CoordinatorConfig::default().with_prepare_mode(PrepareMode::Concurrent),
        &[&a, &b, &c],
    );

    uow.begin().unwrap();
    let tx = uow.commit().await.unwrap();

    assert_eq!(tx.state(), TransactionState::Committed);
    assert_eq!(log.participants_for(Op::Commit), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn concurrent_prepare_waits_for_every_result() {
    let log = CallLog::new();
    let a = Arc::new(SpyParticipant::new("a", log.clone()).slow_prepare(Duration::from_millis(30)));
    let b = Arc::new(SpyParticipant::new("b", log.clone()).failing_prepare("B_PREPARE_FAILED"));
    let c = Arc::new(SpyParticipant::new("c", log.clone()));
    let mut uow = coordinator(
        CoordinatorConfig::default().with_prepare_mode(PrepareMode::Concurrent),
        &[&a, &b, &c],
    );

    let tx_id = uow.begin().unwrap();
    let err = uow.commit().await.unwrap_err();

    assert_eq!(err.code(), "B_PREPARE_FAILED");
    assert_eq!(err.final_state(), Some(TransactionState::RolledBack));
    // every participant that reported success is unwound; the refuser is not
    assert_eq!(log.participants_for(Op::Rollback), vec!["a", "c"]);
    assert!(!a.ledger().is_prepared(&tx_id));
    assert!(!c.ledger().is_prepared(&tx_id));
    assert_eq!(log.participants_for(Op::Commit), Vec::<String>::new());
}

#[tokio::test]
async fn concurrent_failures_are_attributed_in_registration_order() {
    let log = CallLog::new();
    let a = Arc::new(
        SpyParticipant::new("a", log.clone())
            .slow_prepare(Duration::from_millis(30))
            .failing_prepare("A_PREPARE_FAILED"),
    );
    let b = Arc::new(SpyParticipant::new("b", log.clone()).failing_prepare("B_PREPARE_FAILED"));
    let mut uow = coordinator(
        CoordinatorConfig::default().with_prepare_mode(PrepareMode::Concurrent),
        &[&a, &b],
    );

    uow.begin().unwrap();
    let err = uow.commit().await.unwrap_err();

    // b fails first in time, but a comes first in registration order
    assert_eq!(err.code(), "A_PREPARE_FAILED");
    assert_eq!(err.participant(), Some(&ParticipantKey::new("a")));
}

// ============================================================================
// Cancelled calls
// ============================================================================

#[tokio::test]
async fn cancelled_commit_fails_the_transaction_and_frees_the_coordinator() {
    let log = CallLog::new();
    let a = Arc::new(SpyParticipant::new("a", log.clone()));
    let b = Arc::new(SpyParticipant::new("b", log.clone()).slow_commit(SLOW));
    let mut uow = coordinator(CoordinatorConfig::default(), &[&a, &b]);

    let tx_id = uow.begin().unwrap();
    a.write(&tx_id, "row-1");
    let cancelled = tokio::time::timeout(SHORT, uow.commit()).await;

    assert!(cancelled.is_err());
    assert!(uow.is_idle());
    // a committed before the caller gave up; b's outcome is unknown
    assert!(a.has_durable_effects(&tx_id));
    assert_eq!(log.count("b", Op::Commit), 1);

    let next = uow.begin().unwrap();
    assert_ne!(next, tx_id);
    let tx = uow.rollback().await.unwrap();
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert!(uow.is_idle());
}

#[tokio::test]
async fn cancelled_prepare_leaves_the_transaction_for_rollback() {
    let log = CallLog::new();
    let a = Arc::new(SpyParticipant::new("a", log.clone()));
    let b = Arc::new(SpyParticipant::new("b", log.clone()).slow_prepare(SLOW));
    let mut uow = coordinator(CoordinatorConfig::default(), &[&a, &b]);

    let tx_id = uow.begin().unwrap();
    let cancelled = tokio::time::timeout(SHORT, uow.commit()).await;

    assert!(cancelled.is_err());
    assert_eq!(
        uow.current().map(twophase_core::Transaction::state),
        Some(TransactionState::Preparing)
    );
    assert!(a.ledger().is_prepared(&tx_id));
    assert!(uow.begin().is_err());

    let tx = uow.rollback().await.unwrap();
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert!(!a.ledger().is_prepared(&tx_id));
    assert_eq!(log.participants_for(Op::Rollback), vec!["a", "b"]);
    assert!(uow.is_idle());
}

#[tokio::test]
async fn cancelled_scope_during_commit_frees_the_coordinator() {
    let log = CallLog::new();
    let a = Arc::new(SpyParticipant::new("a", log.clone()).slow_commit(SLOW));
    let mut uow = coordinator(CoordinatorConfig::default(), &[&a]);

    let cancelled = tokio::time::timeout(
        SHORT,
        uow.run(|_| async { Ok::<_, String>(()) }),
    )
    .await;

    assert!(cancelled.is_err());
    assert!(uow.is_idle());
    assert!(uow.begin().is_ok());
}
