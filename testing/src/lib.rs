//! # Twophase Testing
//!
//! Test doubles and helpers for the twophase coordinator.
//!
//! This crate provides:
//! - [`SpyParticipant`]: a scriptable participant recording every call into a
//!   shared [`CallLog`]
//! - [`InMemoryEventStore`]: an event store with fault injection
//! - [`FixedClock`]: deterministic time
//! - [`init_test_tracing`]: log capture for tests
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use twophase_testing::{CallLog, SpyParticipant};
//!
//! let log = CallLog::new();
//! let a = Arc::new(SpyParticipant::new("a", log.clone()));
//! let b = Arc::new(SpyParticipant::new("b", log.clone()).failing_prepare("ORDER_DB_PREPARE_FAILED"));
//! # let _ = (a, b);
//! assert!(log.calls().is_empty());
//! ```

use chrono::{DateTime, Utc};
use twophase_core::environment::Clock;

/// In-memory event store with fault injection
pub mod event_store;

/// Scriptable participant double and shared call log
pub mod spy;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use twophase_testing::mocks::FixedClock;
    /// use twophase_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Fixed clock at 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_089))
    }
}

/// Test helpers.
pub mod helpers {
    use tracing_subscriber::EnvFilter;

    /// Route `tracing` output to the test harness.
    ///
    /// Honors `RUST_LOG`, defaulting to `debug`. Safe to call from every test;
    /// only the first call installs a subscriber.
    pub fn init_test_tracing() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    }
}

// Re-export commonly used items
pub use event_store::InMemoryEventStore;
pub use helpers::init_test_tracing;
pub use mocks::{FixedClock, test_clock};
pub use spy::{Call, CallLog, Op, SpyParticipant};
