use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{Classify, ErrorClass};
use crate::clock::{system_clock, Clock};

/// Decides whether a classified failure should trigger another attempt.
pub type RetryPredicate = Arc<dyn Fn(&ErrorClass) -> bool + Send + Sync>;

fn default_predicate() -> RetryPredicate {
    Arc::new(ErrorClass::is_retryable)
}

#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Overall budget for the whole loop, measured from the first attempt.
    pub max_elapsed: Option<Duration>,
    pub retryable: RetryPredicate,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_elapsed: None,
            retryable: default_predicate(),
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("max_elapsed", &self.max_elapsed)
            .field("retryable", &"<predicate>")
            .finish()
    }
}

impl RetryConfig {
    /// Backoff before retry number `retry` (0 is the first retry):
    /// `min(initial_delay * multiplier^retry, max_delay)`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let nanos = (self.initial_delay.as_nanos() as f64 * factor).round();
        let cap = self.max_delay.as_nanos() as f64;

        if !nanos.is_finite() || nanos >= cap {
            self.max_delay
        } else if nanos <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }

    /// Apply per-call overrides; unset fields keep this config's values.
    pub fn merge(&self, overrides: &RetryOverrides) -> RetryConfig {
        RetryConfig {
            max_attempts: overrides.max_attempts.unwrap_or(self.max_attempts),
            initial_delay: overrides.initial_delay.unwrap_or(self.initial_delay),
            max_delay: overrides.max_delay.unwrap_or(self.max_delay),
            multiplier: overrides.multiplier.unwrap_or(self.multiplier),
            max_elapsed: overrides.max_elapsed.or(self.max_elapsed),
            retryable: overrides
                .retryable
                .clone()
                .unwrap_or_else(|| self.retryable.clone()),
        }
    }
}

/// Partial [`RetryConfig`] supplied per call.
#[derive(Clone, Default)]
pub struct RetryOverrides {
    pub max_attempts: Option<u32>,
    pub initial_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    pub multiplier: Option<f64>,
    pub max_elapsed: Option<Duration>,
    pub retryable: Option<RetryPredicate>,
}

impl fmt::Debug for RetryOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOverrides")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("multiplier", &self.multiplier)
            .field("max_elapsed", &self.max_elapsed)
            .field("retryable", &self.retryable.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

impl RetryOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    pub fn max_elapsed(mut self, budget: Duration) -> Self {
        self.max_elapsed = Some(budget);
        self
    }

    pub fn retryable<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ErrorClass) -> bool + Send + Sync + 'static,
    {
        self.retryable = Some(Arc::new(predicate));
        self
    }
}

/// Why a retry loop gave up. The last operation error is carried unchanged.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every allowed attempt failed.
    Exhausted {
        attempts: u32,
        class: ErrorClass,
        error: E,
    },
    /// The failure was classified as not worth retrying.
    Rejected {
        attempt: u32,
        class: ErrorClass,
        error: E,
    },
    Cancelled {
        attempts: u32,
        last_error: Option<E>,
    },
    /// The next attempt could not start before `max_elapsed` ran out.
    DeadlineExceeded {
        attempts: u32,
        elapsed: Duration,
        last_error: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// Number of times the operation was invoked.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts, .. }
            | RetryError::DeadlineExceeded { attempts, .. } => *attempts,
            RetryError::Rejected { attempt, .. } => *attempt,
        }
    }

    pub fn error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::Rejected { error, .. } => Some(error),
            RetryError::Cancelled { last_error, .. }
            | RetryError::DeadlineExceeded { last_error, .. } => last_error.as_ref(),
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::Rejected { error, .. } => Some(error),
            RetryError::Cancelled { last_error, .. }
            | RetryError::DeadlineExceeded { last_error, .. } => last_error,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted {
                attempts, error, ..
            } => write!(f, "failed after {attempts} attempts: {error}"),
            RetryError::Rejected { error, .. } => write!(f, "non-retryable failure: {error}"),
            RetryError::Cancelled { attempts, .. } => {
                write!(f, "cancelled after {attempts} attempts")
            }
            RetryError::DeadlineExceeded {
                attempts, elapsed, ..
            } => write!(f, "retry deadline exceeded after {attempts} attempts ({elapsed:?})"),
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Same clock, config merged with `overrides`.
    pub fn with_overrides(&self, overrides: &RetryOverrides) -> Self {
        Self {
            config: self.config.merge(overrides),
            clock: self.clock.clone(),
        }
    }

    pub async fn run<F, Fut, T, E>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        self.run_inner(operation, None).await
    }

    /// Like [`run`](Self::run), but stops as soon as `cancel` fires, including
    /// in the middle of an attempt or a backoff sleep.
    pub async fn run_with_cancel<F, Fut, T, E>(
        &self,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        self.run_inner(operation, Some(cancel)).await
    }

    pub(crate) async fn run_inner<F, Fut, T, E>(
        &self,
        mut operation: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let started = self.clock.now();
        // A budget too large to represent as an instant is no deadline at all.
        let deadline = self
            .config
            .max_elapsed
            .and_then(|budget| started.checked_add(budget));
        let mut last_error: Option<E> = None;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    last_error,
                });
            }

            attempt += 1;
            let outcome = match cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            debug!(attempt, "Attempt abandoned, cancellation requested");
                            return Err(RetryError::Cancelled { attempts: attempt, last_error });
                        }
                        result = operation() => result,
                    }
                }
                None => operation().await,
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, "Operation succeeded after {} attempts", attempt);
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let class = error.classify();
            if !(self.config.retryable)(&class) {
                debug!(attempt, class = class.as_str(), error = %error, "Failure is not retryable");
                return Err(RetryError::Rejected {
                    attempt,
                    class,
                    error,
                });
            }

            if attempt >= max_attempts {
                warn!(attempt, class = class.as_str(), error = %error, "Operation failed after {} attempts", attempt);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    class,
                    error,
                });
            }

            let delay = class
                .retry_after()
                .unwrap_or_else(|| self.config.delay_for_retry(attempt - 1));

            if let Some(deadline) = deadline {
                let now = self.clock.now();
                if now.checked_add(delay).map_or(true, |resume| resume > deadline) {
                    warn!(attempt, ?delay, "Retry budget exhausted before next attempt");
                    return Err(RetryError::DeadlineExceeded {
                        attempts: attempt,
                        elapsed: now.saturating_duration_since(started),
                        last_error: Some(error),
                    });
                }
            }

            warn!(
                attempt,
                ?delay,
                class = class.as_str(),
                error = %error,
                "Attempt {} failed. Retrying in {:?}...",
                attempt,
                delay
            );

            match cancel {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            debug!(attempt, "Backoff interrupted, cancellation requested");
                            return Err(RetryError::Cancelled {
                                attempts: attempt,
                                last_error: Some(error),
                            });
                        }
                        _ = self.clock.sleep(delay) => {}
                    }
                }
                None => self.clock.sleep(delay).await,
            }

            last_error = Some(error);
        }
    }
}
