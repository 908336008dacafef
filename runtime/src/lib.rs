//! # Twophase Runtime
//!
//! The two-phase commit coordinator and the event-store participant.
//!
//! ## Core Components
//!
//! - **`DistributedUnitOfWork`**: registers participants, opens one transaction
//!   at a time and drives prepare, commit and rollback across them
//! - **Scoped lifecycle**: [`DistributedUnitOfWork::run`] commits on success and
//!   rolls back on error or panic
//! - **`EventStoreParticipant`**: buffers event appends until commit
//! - **Configuration**: per-call timeouts, prepare retries and prepare mode
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use twophase_runtime::{DistributedUnitOfWork, EventStoreParticipant};
//!
//! let events = Arc::new(EventStoreParticipant::new("LEDGER_EVENTS", store));
//!
//! let mut uow = DistributedUnitOfWork::new();
//! uow.register_participant("orders", orders_db)?;
//! uow.register_participant("events", events.clone())?;
//!
//! let (receipt, tx) = uow
//!     .run(|tx_id| async move {
//!         let mut writer = orders_db.writer(&tx_id).await?;
//!         sqlx::query("INSERT INTO orders ...").execute(&mut *writer).await?;
//!         events.stage(&tx_id, stream_id, Some(version), pending)?;
//!         Ok::<_, AppError>(receipt)
//!     })
//!     .await?;
//! ```

/// Coordinator-side participant call boundary (timeouts and panics)
mod boundary;

/// Coordinator configuration
pub mod config;

/// The `DistributedUnitOfWork` coordinator
pub mod coordinator;

/// Event-store participant adapter
pub mod event_store_participant;

/// Coordinator metrics
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// Scoped transaction lifecycle
pub mod scope;

pub use config::{ConfigError, CoordinatorConfig, PrepareMode};
pub use coordinator::DistributedUnitOfWork;
pub use event_store_participant::EventStoreParticipant;
pub use retry::RetryPolicy;
pub use scope::ScopeError;
