//! Scoped transaction lifecycle.
//!
//! [`DistributedUnitOfWork::run`] opens a transaction, hands its id to the
//! caller's async work, then commits on success or rolls back on error or
//! panic. Every exit path leaves the coordinator idle.

use crate::coordinator::DistributedUnitOfWork;
use futures::FutureExt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, resume_unwind};
use thiserror::Error;
use twophase_core::{Transaction, TransactionError, TransactionId};

/// Why a scoped unit of work did not commit.
#[derive(Error, Debug)]
pub enum ScopeError<E> {
    /// The work itself failed; the transaction was rolled back.
    #[error("unit of work failed: {error}")]
    Work {
        /// The error returned by the work
        error: E,
        /// Set when the rollback did not complete cleanly
        rollback: Option<TransactionError>,
    },

    /// The work succeeded but the transaction could not be opened or committed.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl<E> ScopeError<E> {
    /// The work's own error, if that is what ended the scope.
    #[must_use]
    pub const fn work_error(&self) -> Option<&E> {
        match self {
            Self::Work { error, .. } => Some(error),
            Self::Transaction(_) => None,
        }
    }

    /// The coordinator error, if the protocol itself failed.
    #[must_use]
    pub const fn transaction_error(&self) -> Option<&TransactionError> {
        match self {
            Self::Work { rollback, .. } => rollback.as_ref(),
            Self::Transaction(err) => Some(err),
        }
    }
}

impl DistributedUnitOfWork {
    /// Run `work` inside a fresh transaction.
    ///
    /// - `Ok(value)`: commit, returning the value and the `COMMITTED` snapshot
    /// - `Err(error)`: rollback, then return the error unchanged inside
    ///   [`ScopeError::Work`]
    /// - panic: rollback, then resume the panic
    ///
    /// # Errors
    ///
    /// See [`ScopeError`].
    ///
    /// # Panics
    ///
    /// Resumes a panic raised by `work`, after the rollback has run.
    ///
    /// # Example
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use twophase_core::{ParticipantFuture, RollbackOutcome, TransactionId, TransactionParticipant};
    /// # use twophase_runtime::{DistributedUnitOfWork, ScopeError};
    /// # struct Noop;
    /// # impl TransactionParticipant for Noop {
    /// #     fn prepare(&self, _: TransactionId) -> ParticipantFuture<'_, ()> { Box::pin(async { Ok(()) }) }
    /// #     fn commit(&self, _: TransactionId) -> ParticipantFuture<'_, ()> { Box::pin(async { Ok(()) }) }
    /// #     fn rollback(&self, _: TransactionId) -> ParticipantFuture<'_, RollbackOutcome> {
    /// #         Box::pin(async { Ok(RollbackOutcome::NothingToUndo) })
    /// #     }
    /// # }
    /// # tokio_test::block_on(async {
    /// let mut uow = DistributedUnitOfWork::new();
    /// uow.register_participant("orders", Arc::new(Noop)).unwrap();
    ///
    /// let result: Result<((), _), ScopeError<String>> = uow
    ///     .run(|tx_id| async move { Err(format!("validation failed in {tx_id}")) })
    ///     .await;
    ///
    /// assert!(result.unwrap_err().work_error().is_some());
    /// assert!(uow.is_idle());
    /// # });
    /// ```
    pub async fn run<F, Fut, T, E>(&mut self, work: F) -> Result<(T, Transaction), ScopeError<E>>
    where
        F: FnOnce(TransactionId) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let tx_id = self.begin().map_err(TransactionError::from)?;

        let outcome = AssertUnwindSafe(async move { work(tx_id).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(value)) => {
                let transaction = self.commit().await?;
                Ok((value, transaction))
            }
            Ok(Err(error)) => {
                let rollback = self.rollback().await.err();
                if let Some(err) = &rollback {
                    tracing::warn!(
                        component = "coordinator",
                        error = %err,
                        "Rollback after failed unit of work did not complete"
                    );
                }
                Err(ScopeError::Work { error, rollback })
            }
            Err(payload) => {
                if let Err(err) = self.rollback().await {
                    tracing::warn!(
                        component = "coordinator",
                        error = %err,
                        "Rollback after panicking unit of work did not complete"
                    );
                }
                resume_unwind(payload)
            }
        }
    }
}
