//! Per-transport circuit breaker.
//!
//! Stops hammering an origin (or a whole transport) once it keeps failing,
//! and lets a single trial through after a cooldown to test recovery.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[open_duration]--> HALF_OPEN (one trial)
//!                                                                              |
//!                                       <--[trial failure]--                   |
//!                                                                              |
//! CLOSED <---------------------------[trial success]---------------------------+
//! ```
//!
//! The OPEN → HALF_OPEN transition is lazy: it is evaluated whenever the
//! breaker is called or inspected, there is no background timer.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{FailureKinds, FetchError};

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - one trial is allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Time to wait before transitioning from Open to Half-Open.
    pub open_duration: Duration,

    /// Error kinds that count as failures. Everything else passes through
    /// without touching breaker state.
    pub failure_kinds: FailureKinds,
}

impl CircuitBreakerConfig {
    /// Defaults for the lightweight HTTP transport: 5 failures, 5 minutes.
    pub fn http() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(300),
            failure_kinds: FailureKinds::transient(),
        }
    }

    /// Defaults for the browser transport: browser failures are costlier, so
    /// it trips sooner and stays open longer.
    pub fn browser() -> Self {
        Self {
            failure_threshold: 3,
            open_duration: Duration::from_secs(600),
            failure_kinds: FailureKinds::transient(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::http()
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
    last_error_message: Option<String>,
    trial_in_flight: bool,
}

impl CircuitBreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            last_error_message: None,
            trial_in_flight: false,
        }
    }
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

/// Thread-safe circuit breaker shared by every fetch through one transport.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(CircuitBreakerInner::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn failure_kinds(&self) -> &FailureKinds {
        &self.config.failure_kinds
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open = if inner.state == CircuitState::Open {
            Some(self.remaining_cooldown(&inner))
        } else {
            None
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_error: inner.last_error_message.clone(),
            time_until_half_open,
        }
    }

    /// Fails fast with `CircuitOpen` if a call made now would be rejected.
    ///
    /// Does not claim the half-open trial slot.
    pub fn check(&self) -> Result<(), FetchError> {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        match inner.state {
            CircuitState::Open => Err(self.open_error(&inner)),
            CircuitState::HalfOpen if inner.trial_in_flight => Err(self.trial_busy_error()),
            _ => Ok(()),
        }
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed: executes operation, tracks success/failure
    /// - Open: returns `FetchError::CircuitOpen` without executing
    /// - HalfOpen: executes the operation as the single trial; concurrent
    ///   callers are rejected until the trial settles
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let is_trial = self.admit()?;

        // Releases the trial slot if the future is dropped mid-flight.
        let mut guard = TrialGuard {
            breaker: self,
            armed: is_trial,
        };

        let result = operation().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.record_success(),
            Err(e) if self.config.failure_kinds.matches(e) => self.record_failure(e),
            Err(e) => {
                tracing::debug!(
                    circuit = %self.name,
                    kind = %e.kind(),
                    "Unclassified error bypasses circuit breaker"
                );
                if is_trial {
                    self.release_trial();
                }
            }
        }

        result
    }

    fn admit(&self) -> Result<bool, FetchError> {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => Err(self.open_error(&inner)),
            CircuitState::HalfOpen if inner.trial_in_flight => Err(self.trial_busy_error()),
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                tracing::info!(circuit = %self.name, "Admitting half-open trial");
                Ok(true)
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::HalfOpen => {
                tracing::info!(circuit = %self.name, "Trial succeeded, closing circuit breaker");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.last_error_message = None;
                inner.trial_in_flight = false;
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &FetchError) {
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_failure_time = Some(Instant::now());
                inner.last_error_message = Some(error.to_string());

                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        error = %error,
                        "Circuit breaker opening after {} consecutive failures",
                        inner.failure_count
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Circuit breaker trial failed, returning to open state"
                );
                inner.state = CircuitState::Open;
                inner.last_failure_time = Some(Instant::now());
                inner.last_error_message = Some(error.to_string());
                inner.trial_in_flight = false;
            }
            CircuitState::Open => {
                inner.last_error_message = Some(error.to_string());
            }
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        *inner = CircuitBreakerInner::new();
    }

    fn release_trial(&self) {
        let mut inner = self.lock_inner();
        inner.trial_in_flight = false;
    }

    fn remaining_cooldown(&self, inner: &CircuitBreakerInner) -> Duration {
        inner
            .last_failure_time
            .map(|t| self.config.open_duration.saturating_sub(t.elapsed()))
            .unwrap_or(self.config.open_duration)
    }

    fn open_error(&self, inner: &CircuitBreakerInner) -> FetchError {
        FetchError::CircuitOpen {
            transport: self.name.clone(),
            retry_after: self.remaining_cooldown(inner),
        }
    }

    fn trial_busy_error(&self) -> FetchError {
        FetchError::CircuitOpen {
            transport: self.name.clone(),
            retry_after: Duration::ZERO,
        }
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(last_failure) = inner.last_failure_time
            && last_failure.elapsed() >= self.config.open_duration
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
        }
    }
}

struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(circuit = %self.breaker.name, "Trial abandoned, releasing slot");
            self.breaker.release_trial();
        }
    }
}
