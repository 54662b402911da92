//! Circuit breaker guarding calls to one remote host.
//!
//! # State Transitions
//! ```text
//! Closed   → Open:     consecutive failures reach `failure_threshold`
//! Open     → HalfOpen: first call after `reset_timeout` (admitted as the trial)
//! HalfOpen → Closed:   trial succeeds
//! HalfOpen → Open:     trial fails (`opened_at` restarts)
//! ```
//!
//! Only one trial call is in flight while half-open; everything else is
//! rejected as if the circuit were still open.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::clock::{system_clock, Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub trial_in_flight: bool,
}

/// Returned by [`CircuitBreaker::execute`].
#[derive(Debug)]
pub enum CircuitError<E> {
    /// Call rejected without running the operation.
    Open { retry_in: Duration },
    /// The operation ran and failed.
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            CircuitError::Open { .. } => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for CircuitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitError::Open { retry_in } => {
                write!(f, "circuit open, next trial allowed in {retry_in:?}")
            }
            CircuitError::Inner(e) => e.fmt(f),
        }
    }
}

impl<E> std::error::Error for CircuitError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CircuitError::Inner(e) => Some(e),
            CircuitError::Open { .. } => None,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped on every state change and on reset. Permits carry the value
    /// they were issued under; outcomes from older generations are dropped.
    generation: u64,
}

impl BreakerState {
    fn closed(generation: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            generation,
        }
    }

    fn enter(&mut self, state: CircuitState) {
        self.state = state;
        self.generation = self.generation.wrapping_add(1);
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerState>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Admission ticket for one call. Dropping an unfinished trial hands the
/// half-open slot back so the breaker cannot get stuck waiting for it.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    generation: u64,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(self.trial, self.generation, outcome);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.record(true, self.generation, Outcome::Ignored);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Ignored,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerState::closed(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
            trial_in_flight: inner.trial_in_flight,
        }
    }

    /// Force the breaker closed. Idempotent. Calls still in flight when the
    /// reset happens no longer affect the breaker when they finish.
    pub fn reset(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, from = %inner.state, "Circuit breaker reset");
        }
        *inner = BreakerState::closed(inner.generation.wrapping_add(1));
    }

    /// Run `operation` if the circuit admits it. Every error counts as a
    /// failure.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_counting(operation, |_| true).await
    }

    /// Like [`execute`](Self::execute), but errors for which
    /// `counts_as_failure` returns false leave the failure count untouched.
    pub async fn execute_counting<F, Fut, T, E, P>(
        &self,
        operation: F,
        counts_as_failure: P,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let permit = self.acquire().map_err(|retry_in| {
            debug!(breaker = %self.name, ?retry_in, "Circuit open, call rejected");
            CircuitError::Open { retry_in }
        })?;

        match operation().await {
            Ok(value) => {
                permit.settle(Outcome::Success);
                Ok(value)
            }
            Err(err) => {
                let outcome = if counts_as_failure(&err) {
                    Outcome::Failure
                } else {
                    Outcome::Ignored
                };
                permit.settle(outcome);
                Err(CircuitError::Inner(err))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self) -> Result<Permit<'_>, Duration> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(self.permit(false, inner.generation)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| self.clock.now().saturating_duration_since(at))
                    .unwrap_or(self.config.reset_timeout);
                if elapsed >= self.config.reset_timeout {
                    inner.enter(CircuitState::HalfOpen);
                    inner.trial_in_flight = true;
                    info!(breaker = %self.name, "Circuit half-open, admitting trial call");
                    Ok(self.permit(true, inner.generation))
                } else {
                    Err(self.config.reset_timeout - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(Duration::ZERO)
                } else {
                    inner.trial_in_flight = true;
                    Ok(self.permit(true, inner.generation))
                }
            }
        }
    }

    fn permit(&self, trial: bool, generation: u64) -> Permit<'_> {
        Permit {
            breaker: self,
            trial,
            generation,
            settled: false,
        }
    }

    fn record(&self, trial: bool, generation: u64, outcome: Outcome) {
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!(
                breaker = %self.name,
                ?outcome,
                "Ignoring outcome of a call admitted before the last transition"
            );
            return;
        }
        let now = self.clock.now();

        if trial {
            inner.trial_in_flight = false;
            match outcome {
                Outcome::Success => {
                    info!(breaker = %self.name, "Trial call succeeded, circuit closed");
                    *inner = BreakerState::closed(inner.generation.wrapping_add(1));
                }
                Outcome::Failure => {
                    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                    inner.enter(CircuitState::Open);
                    inner.opened_at = Some(now);
                    warn!(breaker = %self.name, "Trial call failed, circuit re-opened");
                }
                Outcome::Ignored => {}
            }
            return;
        }

        match outcome {
            Outcome::Success => inner.consecutive_failures = 0,
            Outcome::Failure => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.config.failure_threshold.max(1) {
                    inner.enter(CircuitState::Open);
                    inner.opened_at = Some(now);
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        reset_timeout = ?self.config.reset_timeout,
                        "Circuit opened"
                    );
                }
            }
            Outcome::Ignored => {}
        }
    }
}
