use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::{system_clock, Clock};

/// Longest single wait between refill checks.
const MAX_REFILL_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket size; also the largest burst.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl RateLimitConfig {
    /// Reason the settings cannot drive a limiter, if any.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.capacity == 0 {
            return Err("capacity must be >= 1");
        }
        if !self.refill_per_sec.is_finite() || self.refill_per_sec <= 0.0 {
            return Err("refill_per_sec must be a positive finite number");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("requested {requested} tokens exceeds capacity of {capacity}")]
pub struct RateLimitError {
    pub requested: f64,
    pub capacity: u32,
}

/// Token bucket limiting outbound attempts to one host.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<BucketState>>,
    capacity: u32,
    refill_rate: f64,
    clock: Arc<dyn Clock>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant, capacity: u32, refill_rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity as f64);
        self.last_refill = now;
    }
}

impl RateLimiter {
    /// Create a limiter with `capacity` tokens refilled at `refill_rate` per
    /// second. Capacity is at least one token.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self::with_clock(capacity, refill_rate, system_clock())
    }

    pub fn with_clock(capacity: u32, refill_rate: f64, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Arc::new(Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: clock.now(),
            })),
            capacity,
            refill_rate,
            clock,
        }
    }

    pub fn from_config(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_clock(config.capacity, config.refill_per_sec, clock)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Acquire a single token, waiting if necessary.
    pub async fn acquire(&self) {
        self.take(1.0).await;
    }

    /// Acquire multiple tokens, waiting if necessary.
    pub async fn acquire_tokens(&self, tokens: f64) -> Result<(), RateLimitError> {
        self.check_capacity(tokens)?;
        self.take(tokens).await;
        Ok(())
    }

    /// Wait until `tokens` are available and take them. Callers ensure
    /// `tokens` fits within capacity.
    async fn take(&self, tokens: f64) {
        loop {
            let mut state = self.state.lock().await;
            state.refill(self.clock.now(), self.capacity, self.refill_rate);

            if state.tokens >= tokens {
                state.tokens -= tokens;
                debug!(
                    "Rate limiter: acquired {} tokens, {} remaining",
                    tokens, state.tokens
                );
                return;
            }

            let wait = self.refill_wait(tokens - state.tokens);

            warn!(
                "Rate limit: waiting {:?} for {} tokens (current: {:.1}, capacity: {})",
                wait, tokens, state.tokens, self.capacity
            );

            // Release lock while waiting
            drop(state);
            self.clock.sleep(wait).await;
        }
    }

    /// Try to acquire a token without waiting.
    pub async fn try_acquire(&self) -> bool {
        self.try_acquire_tokens(1.0).await.unwrap_or(false)
    }

    pub async fn try_acquire_tokens(&self, tokens: f64) -> Result<bool, RateLimitError> {
        self.check_capacity(tokens)?;

        let mut state = self.state.lock().await;
        state.refill(self.clock.now(), self.capacity, self.refill_rate);

        if state.tokens >= tokens {
            state.tokens -= tokens;
            Ok(true)
        } else {
            debug!(
                "Rate limiter: insufficient tokens ({} < {})",
                state.tokens, tokens
            );
            Ok(false)
        }
    }

    pub async fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.refill(self.clock.now(), self.capacity, self.refill_rate);
        state.tokens
    }

    /// Time until `tokens_needed` have refilled, capped at
    /// [`MAX_REFILL_WAIT`]. A zero, negative or non-finite rate re-checks
    /// after the cap.
    fn refill_wait(&self, tokens_needed: f64) -> Duration {
        if self.refill_rate.is_nan() || self.refill_rate <= 0.0 {
            return MAX_REFILL_WAIT;
        }
        Duration::try_from_secs_f64(tokens_needed / self.refill_rate)
            .map_or(MAX_REFILL_WAIT, |wait| wait.min(MAX_REFILL_WAIT))
    }

    fn check_capacity(&self, tokens: f64) -> Result<(), RateLimitError> {
        if tokens > self.capacity as f64 {
            return Err(RateLimitError {
                requested: tokens,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}
