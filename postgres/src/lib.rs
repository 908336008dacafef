//! `PostgreSQL` transaction participant for Twophase.
//!
//! Wraps a sqlx pool so a native database transaction can take part in a
//! `DistributedUnitOfWork`:
//!
//! - Lazy native transaction per distributed transaction id
//! - Connection probe at prepare
//! - Stable failure codes derived from a resource name
//!
//! # Example
//!
//! ```ignore
//! use twophase_postgres::{PostgresConfig, PostgresParticipant};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PostgresConfig::new("postgres://localhost/orders");
//!     let participant = PostgresParticipant::connect("ORDER_DB", &config).await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Pool settings and environment loading
pub mod config;

/// The participant itself
pub mod participant;

pub use config::{PostgresConfig, PostgresError};
pub use participant::{PostgresParticipant, SqlWriter};
