//! Circuit breaker pattern for preventing cascading failures.
//!
//! A circuit breaker monitors operations and "opens" (stops allowing requests) when
//! failures exceed a threshold, so a failing handler or broker is not hammered by retries.
//!
//! # States
//!
//! - **Closed**: Normal operation. Requests pass through. Failures are counted.
//! - **Open**: Too many failures detected. Requests fail immediately for a timeout period.
//! - **HalfOpen**: After timeout, requests are let through to test recovery.
//!
//! # State Transitions
//!
//! - `Closed` → `Open`: after `failure_threshold` consecutive failures
//! - `Open` → `HalfOpen`: on the first check after `timeout` has elapsed
//! - `HalfOpen` → `Closed`: after `success_threshold` consecutive successes
//! - `HalfOpen` → `Open`: on any failure
//!
//! The state lives in atomics, so checks never take a lock and the breaker can be shared
//! between blocking and async callers.
//!
//! # Example
//!
//! ```rust
//! use courier_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(2)
//!     .timeout(Duration::from_secs(60))
//!     .build();
//! let breaker = CircuitBreaker::new(config);
//!
//! breaker.record_failure();
//! breaker.record_failure();
//! assert_eq!(breaker.state(), CircuitState::Open);
//! assert!(breaker.check().is_err());
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: usize,
    /// Duration to wait before transitioning from Open to `HalfOpen`
    pub timeout: Duration,
    /// Number of successes in `HalfOpen` state before closing the circuit
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            timeout: None,
            success_threshold: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    timeout: Option<Duration>,
    success_threshold: Option<usize>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    ///
    /// Circuit opens after this many consecutive failures.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set the timeout duration.
    ///
    /// How long to wait in Open state before trying `HalfOpen`.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set the success threshold.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(5).max(1),
            timeout: self.timeout.unwrap_or(Duration::from_secs(60)),
            success_threshold: self.success_threshold.unwrap_or(1).max(1),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - normal operation, requests pass through
    Closed,
    /// Circuit is open - failing fast, rejecting requests immediately
    Open,
    /// Circuit is half-open - testing if the downstream recovered
    HalfOpen,
}

impl CircuitState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CircuitBreakerError {
    /// Circuit is open, rejecting requests
    #[error("Circuit breaker is open")]
    Open,
}

/// Lock-free circuit breaker.
///
/// Clones share state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
    config: CircuitBreakerConfig,
}

#[derive(Debug)]
struct Inner {
    state: AtomicU8,
    failure_count: AtomicUsize,
    success_count: AtomicUsize,
    /// Nanoseconds since `epoch` at which the circuit last opened.
    opened_at: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    /// Create a circuit breaker in the closed state.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(CircuitState::Closed.as_u8()),
                failure_count: AtomicUsize::new(0),
                success_count: AtomicUsize::new(0),
                opened_at: AtomicU64::new(0),
                epoch: Instant::now(),
            }),
            config,
        }
    }

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get current circuit state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Check whether a request may go through.
    ///
    /// An open circuit whose timeout has elapsed moves to `HalfOpen` and lets the request
    /// through.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitBreakerError::Open`] while the circuit is open.
    pub fn check(&self) -> Result<(), CircuitBreakerError> {
        match self.state() {
            CircuitState::Open => {
                let opened_at = self.inner.opened_at.load(Ordering::Acquire);
                let elapsed = Duration::from_nanos(self.now_nanos().saturating_sub(opened_at));

                if elapsed < self.config.timeout {
                    return Err(CircuitBreakerError::Open);
                }

                if self.transition(CircuitState::Open, CircuitState::HalfOpen) {
                    self.inner.success_count.store(0, Ordering::Release);
                }
                Ok(())
            }
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
        }
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => {
                self.inner.failure_count.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                let successes = self.inner.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self.transition(CircuitState::HalfOpen, CircuitState::Closed)
                {
                    self.inner.failure_count.store(0, Ordering::Release);
                    self.inner.success_count.store(0, Ordering::Release);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let failures = self.inner.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.open_from(CircuitState::Closed);
                }
            }
            CircuitState::HalfOpen => {
                self.open_from(CircuitState::HalfOpen);
            }
            CircuitState::Open => {}
        }
    }

    /// Force the circuit closed and clear all counters.
    pub fn reset(&self) {
        let previous = CircuitState::from_u8(
            self.inner
                .state
                .swap(CircuitState::Closed.as_u8(), Ordering::AcqRel),
        );
        self.inner.failure_count.store(0, Ordering::Release);
        self.inner.success_count.store(0, Ordering::Release);
        if previous != CircuitState::Closed {
            record_transition(previous, CircuitState::Closed);
        }
    }

    fn open_from(&self, from: CircuitState) {
        self.inner.opened_at.store(self.now_nanos(), Ordering::Release);
        if self.transition(from, CircuitState::Open) {
            self.inner.success_count.store(0, Ordering::Release);
            tracing::warn!(
                failures = self.inner.failure_count.load(Ordering::Acquire),
                threshold = self.config.failure_threshold,
                "Circuit breaker opening"
            );
        }
    }

    /// Compare-and-swap the state; only the winning caller records the transition.
    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        let swapped = self
            .inner
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            record_transition(from, to);
        }
        swapped
    }

    fn now_nanos(&self) -> u64 {
        u64::try_from(self.inner.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

fn record_transition(from: CircuitState, to: CircuitState) {
    metrics::counter!(
        "circuit_breaker_state_change_total",
        "from" => from.label(),
        "to" => to.label()
    )
    .increment(1);
    tracing::info!(from = from.label(), to = to.label(), "Circuit breaker state change");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: usize, timeout: Duration, successes: usize) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::builder()
                .failure_threshold(failures)
                .timeout(timeout)
                .success_threshold(successes)
                .build(),
        )
    }

    #[test]
    fn test_circuit_opens_after_threshold() {
        let cb = breaker(3, Duration::from_secs(60), 1);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.check(), Err(CircuitBreakerError::Open));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breaker(2, Duration::from_secs(60), 1);

        cb.record_failure();
        cb.record_success();
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_timeout_then_closes() {
        let cb = breaker(1, Duration::ZERO, 2);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(1, Duration::ZERO, 1);

        cb.record_failure();
        assert!(cb.check().is_ok());
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_clones_share_state() {
        let cb = breaker(1, Duration::from_secs(60), 1);
        let other = cb.clone();

        cb.record_failure();

        assert_eq!(other.state(), CircuitState::Open);
        other.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
