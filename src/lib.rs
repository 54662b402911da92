//! # resilient-http
//!
//! Resilience layer for outbound calls to third-party HTTP APIs: retries with
//! exponential backoff, a circuit breaker per upstream host, and a client that
//! combines both around reqwest.
//!
//! ## Quick Start
//!
//! ```no_run
//! use resilient_http::{Config, ResilientClient, RetryOverrides};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! // Load configuration from config.toml (defaults if absent)
//! let config = Config::load(None)?;
//! let client = ResilientClient::from_config(&config)?;
//!
//! // Breaker check, then up to max_attempts tries with backoff
//! let response = client.get("https://api.github.com/repos/rust-lang/rust").await?;
//! let repo: serde_json::Value = response.json()?;
//!
//! // Tighter policy for a single call
//! let overrides = RetryOverrides::new()
//!     .max_attempts(5)
//!     .initial_delay(Duration::from_millis(200));
//! let request = resilient_http::Request::get("https://api.linear.app/health");
//! client.request(request, Some(overrides)).await?;
//!
//! println!("{}", client.circuit_state("https://api.github.com")?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Standalone primitives
//!
//! ```no_run
//! use resilient_http::{CircuitBreaker, CircuitBreakerConfig, RetryConfig, RetryPolicy};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let policy = RetryPolicy::new(RetryConfig::default());
//! let breaker = CircuitBreaker::new("payments", CircuitBreakerConfig::default());
//!
//! let body = breaker
//!     .execute(|| policy.run(|| async {
//!         reqwest::get("https://status.example.com").await?.text().await
//!     }))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Retry**: capped exponential backoff, `Retry-After` aware, optional time budget and cancellation
//! - **Circuit Breaker**: closed/open/half-open with a single trial call after the reset timeout
//! - **Per-host isolation**: one breaker per hostname, created on first use
//! - **Rate Limiting**: optional token bucket per host
//! - **Usage quotas**: monthly per-user counters with 429-style refusals
//!
//! ## Configuration
//!
//! ```toml
//! [http]
//! base_url = "https://api.github.com"
//! timeout_ms = 30000
//!
//! [retry]
//! max_attempts = 3
//! initial_delay_ms = 1000
//! max_delay_ms = 10000
//! backoff_multiplier = 2.0
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! reset_timeout_ms = 60000
//! ```

pub mod circuit_breaker;
pub mod classify;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod rate_limiter;
pub mod registry;
pub mod request;
pub mod retry;
pub mod usage;

// Re-export commonly used types at the crate root
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitSnapshot, CircuitState,
};
pub use classify::{Classify, ErrorClass};
pub use client::{ResilientClient, ResilientClientBuilder};
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::Config;
pub use error::{Error, FailurePath};
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use registry::HostRegistry;
pub use request::{Request, RequestError, Response};
pub use retry::{RetryConfig, RetryError, RetryOverrides, RetryPolicy};
pub use usage::{UsageLimitExceeded, UsageLimits, UsageMeter, UsageMetric};
