//! Bounded retry with exponential backoff.
//!
//! A [`RetryPolicy`] retries exactly the error kinds its paired
//! [`CircuitBreaker`] counts as failures. Once the breaker opens, further
//! attempts would only be rejected, so the policy stops early and surfaces
//! the breaker's `CircuitOpen` instead of sleeping.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{FailureKinds, FetchError};

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Scale each delay by a random factor in [0.5, 1.5).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay to wait after the given failed attempt (1-indexed), before jitter.
    ///
    /// - Attempt 1: `base_delay`
    /// - Attempt n: `base_delay × multiplier^(n-1)`
    /// - Always capped by `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Delay after `attempt`, with jitter applied when enabled.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor: f64 = rand::random_range(0.5..1.5);
        delay.mul_f64(factor).min(self.max_delay)
    }
}

/// Retry wrapper around a single fallible fetch attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    retry_on: FailureKinds,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig, retry_on: FailureKinds) -> Self {
        Self { config, retry_on }
    }

    /// A policy that retries the same kinds the breaker trips on.
    pub fn for_breaker(config: RetryConfig, breaker: &CircuitBreaker) -> Self {
        Self::new(config, breaker.failure_kinds().clone())
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts. The operation receives the attempt number.
    pub async fn execute<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        self.run(None, false, cancel, operation).await
    }

    /// Like [`execute`](Self::execute), but every attempt goes through
    /// `breaker`, and retrying stops as soon as the breaker opens.
    pub async fn execute_through<F, Fut, T>(
        &self,
        breaker: &CircuitBreaker,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        self.run(Some(breaker), true, cancel, operation).await
    }

    /// For operations that call `breaker` themselves: the breaker is only
    /// consulted between attempts, to stop retrying once it has opened.
    pub async fn execute_gated<F, Fut, T>(
        &self,
        breaker: &CircuitBreaker,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        self.run(Some(breaker), false, cancel, operation).await
    }

    async fn run<F, Fut, T>(
        &self,
        breaker: Option<&CircuitBreaker>,
        wrap: bool,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let result = match breaker {
                Some(breaker) if wrap => breaker.call(|| operation(attempt)).await,
                _ => operation(attempt).await,
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !self.retry_on.matches(&error) {
                return Err(error);
            }

            if attempt >= max_attempts {
                tracing::warn!(attempts = attempt, error = %error, "Retries exhausted");
                return Err(FetchError::ExhaustedRetries {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            if let Some(breaker) = breaker {
                breaker.check()?;
            }

            let mut delay = self.config.backoff(attempt);
            if let FetchError::RateLimited {
                retry_after: Some(retry_after),
            } = &error
            {
                delay = delay.max(*retry_after).min(self.config.max_delay);
            }

            tracing::debug!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after backoff"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(FetchError::Cancelled),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(10),
            jitter: false,
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(fast_config(max_attempts), FailureKinds::transient())
    }

    #[test]
    fn test_delay_schedule_grows_and_caps() {
        let config = RetryConfig::default().without_jitter();
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(7), Duration::from_secs(60));
        assert_eq!(config.delay_for_attempt(500), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        for _ in 0..200 {
            let delay = config.backoff(1);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay < Duration::from_secs(3));
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let config = RetryConfig {
            base_delay: Duration::from_secs(50),
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        for _ in 0..200 {
            assert!(config.backoff(1) <= Duration::from_secs(60));
        }
    }

    #[tokio::test]
    async fn test_invokes_exactly_max_attempts_on_retryable_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(3)
            .execute(&CancellationToken::new(), |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::Network("refused".into()))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(FetchError::ExhaustedRetries { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(*last, FetchError::Network("refused".into()));
            }
            other => panic!("expected ExhaustedRetries, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let result = policy(3)
            .execute(&CancellationToken::new(), |attempt| async move {
                if attempt < 3 {
                    Err(FetchError::Timeout(Duration::from_secs(1)))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_propagates_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(5)
            .execute(&CancellationToken::new(), |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::Http {
                    status: 404,
                    url: "https://example.com/missing".into(),
                })
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(FetchError::Http { status: 404, .. })));
    }

    #[tokio::test]
    async fn test_circuit_open_is_never_retried() {
        let breaker = CircuitBreaker::new("http", CircuitBreakerConfig::http());
        for _ in 0..5 {
            breaker.record_failure(&FetchError::Network("down".into()));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(3)
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                breaker.call(|| async { Ok(()) })
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(FetchError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_execute_through_stops_once_breaker_opens() {
        let breaker = CircuitBreaker::new(
            "http",
            CircuitBreakerConfig {
                failure_threshold: 2,
                open_duration: Duration::from_secs(60),
                ..Default::default()
            },
        );
        let invocations = AtomicU32::new(0);

        let result: Result<(), _> = policy(5)
            .execute_through(&breaker, &CancellationToken::new(), |_| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::Network("reset".into()))
            })
            .await;

        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert!(matches!(result, Err(FetchError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_execute_gated_fails_fast_after_breaker_opens() {
        let breaker = CircuitBreaker::new(
            "http",
            CircuitBreakerConfig {
                failure_threshold: 2,
                open_duration: Duration::from_secs(60),
                ..Default::default()
            },
        );
        let invocations = AtomicU32::new(0);

        let result: Result<(), _> = policy(5)
            .execute_gated(&breaker, &CancellationToken::new(), |_| {
                breaker.call(|| async {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Err(FetchError::Timeout(Duration::from_millis(5)))
                })
            })
            .await;

        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert!(matches!(result, Err(FetchError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_execute_through_skips_operation_when_already_open() {
        let breaker = CircuitBreaker::new(
            "browser",
            CircuitBreakerConfig {
                failure_threshold: 1,
                open_duration: Duration::from_secs(60),
                ..Default::default()
            },
        );
        breaker.record_failure(&FetchError::Timeout(Duration::from_secs(1)));

        let invocations = AtomicU32::new(0);
        let result: Result<(), _> = policy(3)
            .execute_through(&breaker, &CancellationToken::new(), |_| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        assert!(matches!(result, Err(FetchError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff_returns_cancelled() {
        let slow = RetryPolicy::new(
            RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(30),
                jitter: false,
                ..Default::default()
            },
            FailureKinds::transient(),
        );
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let task = {
            let cancel = cancel.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                slow.execute(&cancel, |_| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(FetchError::Network("down".into()))
                    }
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(FetchError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_retry_after_extends_backoff() {
        let config = RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(200),
            jitter: false,
            ..Default::default()
        };
        let started = std::time::Instant::now();
        let result = RetryPolicy::new(config, FailureKinds::transient())
            .execute(&CancellationToken::new(), |attempt| async move {
                if attempt == 1 {
                    Err(FetchError::RateLimited {
                        retry_after: Some(Duration::from_millis(50)),
                    })
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
