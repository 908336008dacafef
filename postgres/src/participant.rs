//! `PostgreSQL` participant.
//!
//! Each distributed transaction id maps to at most one native sqlx transaction.
//! Application code obtains it with [`PostgresParticipant::writer`] and runs its
//! statements there; the coordinator then drives `prepare`, `commit` and
//! `rollback` on the same native transaction.

use crate::config::{PostgresConfig, PostgresError};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Postgres;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use twophase_core::{
    FailureKind, ParticipantFailure, ParticipantFuture, ParticipantResult, PrepareLedger,
    PrepareStep, RollbackOutcome, Settlement, TransactionId, TransactionParticipant, codes,
};

type NativeTransaction = sqlx::Transaction<'static, Postgres>;
type Slot = Arc<AsyncMutex<Option<NativeTransaction>>>;

/// Exclusive access to the connection behind a distributed transaction.
///
/// Dereferences to [`PgConnection`], so `&mut *writer` is an sqlx executor.
/// Drop it before the coordinator commits: `prepare` waits for the writer.
pub type SqlWriter = OwnedMappedMutexGuard<Option<NativeTransaction>, PgConnection>;

/// Transaction participant wrapping a `PostgreSQL` pool.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use twophase_postgres::{PostgresConfig, PostgresParticipant};
/// use twophase_runtime::DistributedUnitOfWork;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let orders = Arc::new(
///     PostgresParticipant::connect("ORDER_DB", &PostgresConfig::from_env()?).await?,
/// );
///
/// let mut uow = DistributedUnitOfWork::new();
/// uow.register_participant("orders", orders.clone())?;
///
/// let tx_id = uow.begin()?;
/// {
///     let mut writer = orders.writer(&tx_id).await?;
///     sqlx::query("INSERT INTO orders (id) VALUES ($1)")
///         .bind("order-1")
///         .execute(&mut *writer)
///         .await?;
/// }
/// uow.commit().await?;
/// # Ok(())
/// # }
/// ```
pub struct PostgresParticipant {
    resource: String,
    pool: PgPool,
    ledger: PrepareLedger,
    open: Mutex<HashMap<TransactionId, Slot>>,
}

impl std::fmt::Debug for PostgresParticipant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresParticipant")
            .field("resource", &self.resource)
            .field("open_transactions", &self.lock().len())
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl PostgresParticipant {
    /// Create a pool from `config` and wrap it.
    ///
    /// `resource` prefixes failure codes, e.g. `ORDER_DB_PREPARE_FAILED`.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::Connect`] if the pool cannot be established.
    pub async fn connect(
        resource: impl Into<String>,
        config: &PostgresConfig,
    ) -> Result<Self, PostgresError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect(&config.url)
            .await?;
        Ok(Self::from_pool(resource, pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(resource: impl Into<String>, pool: PgPool) -> Self {
        Self {
            resource: resource.into(),
            pool,
            ledger: PrepareLedger::new(),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Resource name used in failure codes.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The underlying pool, for work outside any distributed transaction.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Prepare bookkeeping.
    #[must_use]
    pub const fn ledger(&self) -> &PrepareLedger {
        &self.ledger
    }

    /// Number of native transactions currently open.
    #[must_use]
    pub fn open_transactions(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TransactionId, Slot>> {
        self.open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, tx_id: &TransactionId) -> Slot {
        Arc::clone(self.lock().entry(tx_id.clone()).or_default())
    }

    fn take_slot(&self, tx_id: &TransactionId) -> Option<Slot> {
        self.lock().remove(tx_id)
    }

    fn sealed(&self, tx_id: &TransactionId) -> ParticipantFailure {
        ParticipantFailure::new(
            FailureKind::ProtocolViolation,
            codes::TX_SEALED,
            format!("{} no longer accepts writes for this transaction", self.resource),
            tx_id.clone(),
        )
    }

    /// Exclusive writer for `tx_id`, opening the native transaction on first use.
    ///
    /// # Errors
    ///
    /// - `TX_SEALED` once `tx_id` has been prepared
    /// - `TX_ALREADY_FINISHED` when `tx_id` was already settled
    /// - `<RESOURCE>_PREPARE_FAILED` when the native transaction cannot be opened
    pub async fn writer(&self, tx_id: &TransactionId) -> ParticipantResult<SqlWriter> {
        if let Some(settlement) = self.ledger.settlement(tx_id) {
            return Err(ParticipantFailure::already_finished(
                tx_id.clone(),
                settlement.label(),
            ));
        }
        if self.ledger.is_prepared(tx_id) {
            return Err(self.sealed(tx_id));
        }

        let mut guard = self.slot(tx_id).lock_owned().await;

        // prepare or rollback may have run while we waited
        if let Some(settlement) = self.ledger.settlement(tx_id) {
            if guard.is_none() {
                self.take_slot(tx_id);
            }
            return Err(ParticipantFailure::already_finished(
                tx_id.clone(),
                settlement.label(),
            ));
        }
        if self.ledger.is_prepared(tx_id) {
            return Err(self.sealed(tx_id));
        }

        if guard.is_none() {
            match self.pool.begin().await {
                Ok(native) => *guard = Some(native),
                Err(err) => {
                    return Err(ParticipantFailure::prepare(
                        codes::prepare_failed(&self.resource),
                        err.to_string(),
                        tx_id.clone(),
                    ));
                }
            }
            tracing::debug!(
                resource = %self.resource,
                transaction_id = %tx_id,
                "Opened native transaction"
            );
        }

        OwnedMutexGuard::try_map(guard, |slot| slot.as_mut().map(|native| &mut **native)).map_err(
            |_| {
                ParticipantFailure::prepare(
                    codes::prepare_failed(&self.resource),
                    "native transaction is not open",
                    tx_id.clone(),
                )
            },
        )
    }

    async fn open_and_probe(&self, slot: &mut Option<NativeTransaction>) -> Result<(), sqlx::Error> {
        if slot.is_none() {
            *slot = Some(self.pool.begin().await?);
        }
        if let Some(native) = slot.as_mut() {
            sqlx::query("SELECT 1").execute(&mut **native).await?;
        }
        Ok(())
    }

    async fn abandon(&self, tx_id: &TransactionId, native: Option<NativeTransaction>) {
        self.take_slot(tx_id);
        if let Some(native) = native {
            if let Err(err) = native.rollback().await {
                tracing::warn!(
                    resource = %self.resource,
                    transaction_id = %tx_id,
                    error = %err,
                    "Failed to roll back abandoned native transaction"
                );
            }
        }
    }

    async fn prepare_inner(&self, tx_id: TransactionId) -> ParticipantResult<()> {
        if self.ledger.begin_prepare(&tx_id)? == PrepareStep::AlreadyPrepared {
            return Ok(());
        }

        let mut guard = self.slot(&tx_id).lock_owned().await;

        if let Err(err) = self.open_and_probe(&mut guard).await {
            let failure = ParticipantFailure::prepare(
                codes::prepare_failed(&self.resource),
                err.to_string(),
                tx_id.clone(),
            );
            self.abandon(&tx_id, guard.take()).await;
            self.ledger.refuse(failure.clone());
            return Err(failure);
        }

        if let Err(stale) = self.ledger.mark_prepared(&tx_id) {
            self.abandon(&tx_id, guard.take()).await;
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
            "Prepared native transaction"
        );
        Ok(())
    }

    async fn commit_inner(&self, tx_id: TransactionId) -> ParticipantResult<()> {
        self.ledger.check_commit(&tx_id)?;

        let native = match self.take_slot(&tx_id) {
            Some(slot) => slot.lock_owned().await.take(),
            None => None,
        };

        let result = match native {
            Some(native) => native.commit().await.map_err(|err| err.to_string()),
            None => Err("no native transaction is open".to_string()),
        };

        if let Err(message) = result {
            let failure =
                ParticipantFailure::commit(codes::commit_failed(&self.resource), message, tx_id.clone());
            self.ledger
                .settle(&tx_id, Settlement::CommitFailed(failure.clone()));
            return Err(failure);
        }

        self.ledger.settle(&tx_id, Settlement::Committed);
        tracing::debug!(
            resource = %self.resource,
            transaction_id = %tx_id,
            "Committed native transaction"
        );
        Ok(())
    }

    async fn rollback_inner(&self, tx_id: TransactionId) -> ParticipantResult<RollbackOutcome> {
        if self.ledger.settlement(&tx_id) == Some(Settlement::Committed) {
            tracing::warn!(
                resource = %self.resource,
                transaction_id = %tx_id,
                "Rollback requested for a committed transaction; nothing to undo"
            );
            return Ok(RollbackOutcome::NothingToUndo);
        }

        let native = match self.take_slot(&tx_id) {
            Some(slot) => slot.lock_owned().await.take(),
            None => None,
        };
        let was_prepared = self.ledger.settle(&tx_id, Settlement::RolledBack);

        match native {
            Some(native) => {
                native.rollback().await.map_err(|err| {
                    ParticipantFailure::rollback(
                        codes::rollback_failed(&self.resource),
                        err.to_string(),
                        tx_id.clone(),
                    )
                })?;
                tracing::debug!(
                    resource = %self.resource,
                    transaction_id = %tx_id,
                    "Rolled back native transaction"
                );
                Ok(RollbackOutcome::RolledBack)
            }
            None if was_prepared => Ok(RollbackOutcome::RolledBack),
            None => Ok(RollbackOutcome::NothingToUndo),
        }
    }
}

impl TransactionParticipant for PostgresParticipant {
    fn prepare(&self, tx_id: TransactionId) -> ParticipantFuture<'_, ()> {
        Box::pin(self.prepare_inner(tx_id))
    }

    fn commit(&self, tx_id: TransactionId) -> ParticipantFuture<'_, ()> {
        Box::pin(self.commit_inner(tx_id))
    }

    fn rollback(&self, tx_id: TransactionId) -> ParticipantFuture<'_, RollbackOutcome> {
        Box::pin(self.rollback_inner(tx_id))
    }
}
