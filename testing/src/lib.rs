//! # Courier Testing
//!
//! Testing utilities and in-memory collaborators for the Courier dispatcher.
//!
//! This crate provides:
//! - [`InMemoryOutbox`] with staged [`InMemoryTransaction`]s
//! - [`InMemoryProducer`] with scripted failures and recorded sends
//! - [`RecordingHandlerFactory`] logging every handler create and release
//! - [`RecordingObserver`] keeping every dispatch event
//! - [`FixedClock`] / [`test_clock`] for deterministic timestamps
//!
//! ## Example
//!
//! ```
//! use courier_testing::{InMemoryOutbox, InMemoryProducer, test_clock};
//! use courier_core::publication::Publication;
//! use courier_core::environment::Clock;
//!
//! let outbox = InMemoryOutbox::new();
//! let producer = InMemoryProducer::new(Publication::new("orders"));
//! producer.fail_next(1);
//!
//! assert!(outbox.is_empty());
//! assert_eq!(test_clock().now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
//! ```

use chrono::{DateTime, Utc};
use courier_core::environment::Clock;

mod outbox;
mod producer;
mod recording;

pub use outbox::{InMemoryOutbox, InMemoryTransaction};
pub use producer::InMemoryProducer;
pub use recording::{FactoryEvent, FactoryLog, RecordingHandlerFactory, RecordingObserver};

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Returns the same time until [`FixedClock::advance`] moves it. Clones share the
    /// current time.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_testing::mocks::FixedClock;
    /// use courier_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward by `by`.
        pub fn advance(&self, by: chrono::TimeDelta) {
            let mut time = self.time.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            *time += by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers and utilities.
pub mod helpers {
    /// Install a `RUST_LOG`-filtered fmt subscriber writing to the test output.
    ///
    /// Safe to call from every test; only the first call installs anything.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use helpers::init_tracing;
pub use mocks::{FixedClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn advancing_is_shared_between_clones() {
        let clock = test_clock();
        let shared = clock.clone();
        let start = clock.now();

        shared.advance(chrono::TimeDelta::seconds(30));

        assert_eq!(clock.now() - start, chrono::TimeDelta::seconds(30));
    }
}
