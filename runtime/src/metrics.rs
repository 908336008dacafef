//! Coordinator metrics.
//!
//! Recorded through the `metrics` facade. No exporter is installed here; the
//! host application picks its own recorder (Prometheus, statsd, ...) and calls
//! [`register_metrics`] once to publish descriptions.
//!
//! # Example
//!
//! ```rust
//! use twophase_runtime::metrics::register_metrics;
//!
//! // After installing a recorder of your choice:
//! register_metrics();
//! ```

use metrics::{describe_counter, describe_histogram};
use std::time::Duration;
use twophase_core::{FailureKind, TransactionState};

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Transactions opened by `begin()`.
pub const TRANSACTIONS_BEGUN: &str = "twophase_transactions_begun_total";
/// Transactions that reached `COMMITTED`.
pub const TRANSACTIONS_COMMITTED: &str = "twophase_transactions_committed_total";
/// Transactions that reached `ROLLED_BACK`.
pub const TRANSACTIONS_ROLLED_BACK: &str = "twophase_transactions_rolled_back_total";
/// Transactions that reached `FAILED`.
pub const TRANSACTIONS_FAILED: &str = "twophase_transactions_failed_total";
/// Participant calls that failed, labelled by `phase`.
pub const PARTICIPANT_FAILURES: &str = "twophase_participant_failures_total";
/// Prepare calls retried after an ambiguous failure.
pub const PREPARE_RETRIES: &str = "twophase_prepare_retries_total";
/// Wall time of `commit()` from first prepare to terminal state.
pub const COMMIT_DURATION: &str = "twophase_commit_duration_seconds";

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(TRANSACTIONS_BEGUN, "Total number of transactions opened");
    describe_counter!(
        TRANSACTIONS_COMMITTED,
        "Total number of transactions committed on every participant"
    );
    describe_counter!(
        TRANSACTIONS_ROLLED_BACK,
        "Total number of transactions fully rolled back"
    );
    describe_counter!(
        TRANSACTIONS_FAILED,
        "Total number of transactions that ended FAILED (partial commit or incomplete rollback)"
    );
    describe_counter!(
        PARTICIPANT_FAILURES,
        "Total number of failed participant calls, by phase"
    );
    describe_counter!(
        PREPARE_RETRIES,
        "Total number of prepare calls retried after a timeout"
    );
    describe_histogram!(
        COMMIT_DURATION,
        "Time taken by commit() to reach a terminal state"
    );
}

/// Coordinator metrics recorder.
pub struct CoordinatorMetrics;

impl CoordinatorMetrics {
    /// Record a transaction opened.
    pub fn record_begin() {
        counter!(TRANSACTIONS_BEGUN).increment(1);
    }

    /// Record a transaction reaching a terminal state.
    pub fn record_outcome(state: TransactionState) {
        match state {
            TransactionState::Committed => counter!(TRANSACTIONS_COMMITTED).increment(1),
            TransactionState::RolledBack => counter!(TRANSACTIONS_ROLLED_BACK).increment(1),
            TransactionState::Failed => counter!(TRANSACTIONS_FAILED).increment(1),
            _ => {}
        }
    }

    /// Record how long a `commit()` call took.
    pub fn record_commit_duration(duration: Duration) {
        histogram!(COMMIT_DURATION).record(duration.as_secs_f64());
    }

    /// Record a failed participant call.
    pub fn record_participant_failure(phase: FailureKind) {
        counter!(PARTICIPANT_FAILURES, "phase" => phase.as_str()).increment(1);
    }

    /// Record a prepare retry.
    pub fn record_prepare_retry() {
        counter!(PREPARE_RETRIES).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_noop() {
        register_metrics();
        CoordinatorMetrics::record_begin();
        CoordinatorMetrics::record_outcome(TransactionState::Committed);
        CoordinatorMetrics::record_outcome(TransactionState::Pending);
        CoordinatorMetrics::record_participant_failure(FailureKind::Prepare);
        CoordinatorMetrics::record_commit_duration(Duration::from_millis(3));
    }

    #[test]
    fn metric_names_share_prefix() {
        for name in [
            TRANSACTIONS_BEGUN,
            TRANSACTIONS_COMMITTED,
            TRANSACTIONS_ROLLED_BACK,
            TRANSACTIONS_FAILED,
            PARTICIPANT_FAILURES,
            PREPARE_RETRIES,
            COMMIT_DURATION,
        ] {
            assert!(name.starts_with("twophase_"), "{name}");
        }
    }
}
