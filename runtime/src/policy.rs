//! Named resilience policies.
//!
//! A [`ResiliencePolicy`] combines an optional retry schedule, an optional circuit breaker
//! and an optional per-attempt timeout. Policies are looked up by name in a
//! [`PolicyRegistry`]; an unknown name is a configuration error, raised before anything runs.
//!
//! Per attempt the policy:
//!
//! 1. asks the breaker whether the call may go through (an open breaker ends the whole
//!    execution with [`PolicyFailure::BrokenCircuit`], without retrying);
//! 2. runs the operation, bounded by the timeout when running async;
//! 3. records the result with the breaker, then retries retryable failures while
//!    attempts remain.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::retry::{self, RetryPolicy};
use courier_core::error::PolicyError;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Policy applied around handler pipelines unless configured otherwise.
pub const DEFAULT_HANDLER_POLICY: &str = "courier.handler";

/// Policy applied around outbox clears unless configured otherwise.
pub const DEFAULT_OUTBOX_POLICY: &str = "courier.outbox";

/// Why a policy-wrapped execution failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyFailure<E> {
    /// The operation's own error, after retries were exhausted or for a non-retryable error.
    #[error("{0}")]
    Inner(E),

    /// The circuit breaker is open.
    #[error("circuit breaker is open")]
    BrokenCircuit,

    /// The last attempt exceeded the policy timeout.
    #[error("timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
}

/// Retry, circuit breaker and timeout settings applied together.
#[derive(Debug, Clone, Default)]
pub struct ResiliencePolicy {
    retry: Option<RetryPolicy>,
    breaker: Option<CircuitBreaker>,
    timeout: Option<Duration>,
}

impl ResiliencePolicy {
    /// A policy that runs the operation once with no breaker and no timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry with `policy`.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Guard executions with a circuit breaker built from `config`.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Some(CircuitBreaker::new(config));
        self
    }

    /// Bound each async attempt. Blocking executions cannot be pre-empted and ignore it.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry settings.
    #[must_use]
    pub const fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Circuit breaker, shared by every execution of this policy.
    #[must_use]
    pub const fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    /// Per-attempt async timeout.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run a blocking operation under this policy.
    ///
    /// Only errors accepted by `is_retryable` are retried and counted by the breaker.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyFailure::BrokenCircuit`] when the breaker rejects an attempt, or
    /// [`PolicyFailure::Inner`] with the final error.
    pub fn execute<F, T, E, P>(
        &self,
        mut operation: F,
        is_retryable: P,
    ) -> Result<T, PolicyFailure<E>>
    where
        F: FnMut() -> Result<T, E>,
        E: fmt::Display,
        P: Fn(&E) -> bool,
    {
        let schedule = self.schedule();
        let breaker = self.breaker.as_ref();

        retry::retry_blocking(
            &schedule,
            || {
                admit::<E>(breaker)?;
                let result = operation().map_err(PolicyFailure::Inner);
                record(breaker, &result, &is_retryable);
                result
            },
            |failure| retryable(failure, &is_retryable),
        )
    }

    /// Run an async operation under this policy.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyFailure::BrokenCircuit`] when the breaker rejects an attempt,
    /// [`PolicyFailure::TimedOut`] when the final attempt exceeded the timeout, or
    /// [`PolicyFailure::Inner`] with the final error.
    pub async fn execute_async<F, Fut, T, E, P>(
        &self,
        mut operation: F,
        is_retryable: P,
    ) -> Result<T, PolicyFailure<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        P: Fn(&E) -> bool,
    {
        let schedule = self.schedule();
        let breaker = self.breaker.as_ref();
        let timeout = self.timeout;
        let is_retryable = &is_retryable;

        retry::retry_with_predicate(
            &schedule,
            move || {
                let attempt = admit::<E>(breaker).map(|()| operation());
                async move {
                    let attempt = attempt?;
                    let result = match timeout {
                        Some(limit) => match tokio::time::timeout(limit, attempt).await {
                            Ok(result) => result.map_err(PolicyFailure::Inner),
                            Err(_) => Err(PolicyFailure::TimedOut(limit)),
                        },
                        None => attempt.await.map_err(PolicyFailure::Inner),
                    };
                    record(breaker, &result, is_retryable);
                    result
                }
            },
            |failure| retryable(failure, is_retryable),
        )
        .await
    }

    fn schedule(&self) -> RetryPolicy {
        self.retry.clone().unwrap_or_else(RetryPolicy::no_retry)
    }
}

fn admit<E>(breaker: Option<&CircuitBreaker>) -> Result<(), PolicyFailure<E>> {
    match breaker {
        Some(breaker) => breaker.check().map_err(|_| PolicyFailure::BrokenCircuit),
        None => Ok(()),
    }
}

fn record<T, E, P>(
    breaker: Option<&CircuitBreaker>,
    result: &Result<T, PolicyFailure<E>>,
    is_retryable: &P,
)
where
    P: Fn(&E) -> bool,
{
    let Some(breaker) = breaker else {
        return;
    };
    match result {
        Ok(_) => breaker.record_success(),
        Err(failure) if retryable(failure, is_retryable) => breaker.record_failure(),
        Err(_) => {}
    }
}

fn retryable<E, P>(failure: &PolicyFailure<E>, is_retryable: &P) -> bool
where
    P: Fn(&E) -> bool,
{
    match failure {
        PolicyFailure::Inner(err) => is_retryable(err),
        PolicyFailure::TimedOut(_) => true,
        PolicyFailure::BrokenCircuit => false,
    }
}

/// Resilience policies by name.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<ResiliencePolicy>>,
}

impl PolicyRegistry {
    /// Empty registry. Dispatching with it fails until the configured names are registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding [`DEFAULT_HANDLER_POLICY`] and [`DEFAULT_OUTBOX_POLICY`], each a
    /// three-attempt retry with exponential backoff.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new()
            .with_policy(
                DEFAULT_HANDLER_POLICY,
                ResiliencePolicy::new().with_retry(RetryPolicy::default()),
            )
            .with_policy(
                DEFAULT_OUTBOX_POLICY,
                ResiliencePolicy::new().with_retry(RetryPolicy::default()),
            )
    }

    /// Register `policy` under `name`, replacing any previous policy.
    pub fn register(&mut self, name: impl Into<String>, policy: ResiliencePolicy) -> &mut Self {
        self.policies.insert(name.into(), Arc::new(policy));
        self
    }

    /// Builder form of [`PolicyRegistry::register`].
    #[must_use]
    pub fn with_policy(mut self, name: impl Into<String>, policy: ResiliencePolicy) -> Self {
        self.register(name, policy);
        self
    }

    /// Policy registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NotFound`] for unknown names.
    pub fn get(&self, name: &str) -> Result<Arc<ResiliencePolicy>, PolicyError> {
        self.policies
            .get(name)
            .cloned()
            .ok_or_else(|| PolicyError::NotFound(name.to_string()))
    }

    /// Whether a policy is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.policies.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(attempts)
            .initial_delay(Duration::from_millis(1))
            .build()
    }

    #[test]
    fn blocking_execution_retries_until_success() {
        let policy = ResiliencePolicy::new().with_retry(fast_retry(3));
        let mut calls = 0;

        let result = policy.execute(
            || {
                calls += 1;
                if calls < 3 { Err("flaky") } else { Ok(calls) }
            },
            |_| true,
        );

        assert_eq!(result, Ok(3));
    }

    #[test]
    fn non_retryable_errors_fail_immediately() {
        let policy = ResiliencePolicy::new().with_retry(fast_retry(5));
        let mut calls = 0;

        let result: Result<(), _> = policy.execute(
            || {
                calls += 1;
                Err("fatal")
            },
            |_| false,
        );

        assert_eq!(result, Err(PolicyFailure::Inner("fatal")));
        assert_eq!(calls, 1);
    }

    #[test]
    fn open_breaker_is_not_retried() {
        let policy = ResiliencePolicy::new()
            .with_retry(fast_retry(5))
            .with_circuit_breaker(
                CircuitBreakerConfig::builder()
                    .failure_threshold(2)
                    .timeout(Duration::from_secs(60))
                    .build(),
            );
        let mut calls = 0;

        let result: Result<(), _> = policy.execute(
            || {
                calls += 1;
                Err("down")
            },
            |_| true,
        );

        assert_eq!(result, Err(PolicyFailure::BrokenCircuit));
        assert_eq!(calls, 2);
        assert_eq!(
            policy.circuit_breaker().map(CircuitBreaker::state),
            Some(CircuitState::Open)
        );
    }

    #[tokio::test]
    async fn async_timeout_is_retried_like_a_failure() {
        let policy = ResiliencePolicy::new()
            .with_retry(fast_retry(2))
            .with_timeout(Duration::from_millis(10));
        let calls = AtomicUsize::new(0);

        let result: Result<(), PolicyFailure<String>> = policy
            .execute_async(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(())
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Err(PolicyFailure::TimedOut(Duration::from_millis(10))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn async_execution_without_timeout_retries_until_success() {
        let policy = ResiliencePolicy::new().with_retry(fast_retry(3));
        let calls = AtomicUsize::new(0);

        let result: Result<usize, PolicyFailure<&str>> = tokio_test::block_on(policy.execute_async(
            || {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { if call < 2 { Err("flaky") } else { Ok(call) } }
            },
            |_| true,
        ));

        assert_eq!(result, Ok(2));
    }

    #[test]
    fn registry_lookup() {
        let registry = PolicyRegistry::with_defaults();
        assert!(registry.get(DEFAULT_HANDLER_POLICY).is_ok());
        assert!(registry.contains(DEFAULT_OUTBOX_POLICY));
        assert_eq!(
            registry.get("missing").err(),
            Some(PolicyError::NotFound("missing".to_string()))
        );
    }
}
