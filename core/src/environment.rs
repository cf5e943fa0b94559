//! Injected dependencies.

use chrono::{DateTime, Utc};

/// Clock trait - abstracts time operations for testability
///
/// Deposit timestamps, dispatch timestamps and sweep age cut-offs all read the time
/// through this trait, so tests can pin it.
///
/// # Examples
///
/// ```
/// use chrono::{DateTime, Utc};
/// use courier_core::environment::Clock;
///
/// struct FixedClock {
///     time: DateTime<Utc>,
/// }
///
/// impl Clock for FixedClock {
///     fn now(&self) -> DateTime<Utc> {
///         self.time
///     }
/// }
///
/// let clock = FixedClock { time: DateTime::<Utc>::UNIX_EPOCH };
/// assert_eq!(clock.now(), DateTime::<Utc>::UNIX_EPOCH);
/// ```
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> DateTime<Utc>;
}
