use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::retry::RetryConfig;
use crate::usage::{UsageLimits, UsageMetric};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    /// Client-side throttling per host; off when absent.
    pub rate_limit: Option<RateLimitConfig>,
    pub usage: UsageSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub base_url: Option<String>,
    pub timeout_ms: u64,
    pub user_agent: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 30_000,
            user_agent: None,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_elapsed_ms: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            max_elapsed_ms: None,
        }
    }
}

impl RetrySettings {
    /// Retry config using the default HTTP-aware retry predicate.
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.backoff_multiplier,
            max_elapsed: self.max_elapsed_ms.map(Duration::from_millis),
            ..RetryConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
        }
    }
}

/// Monthly quotas; a missing value means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct UsageSettings {
    pub runs_per_month: Option<u64>,
    pub tokens_per_month: Option<u64>,
}

impl UsageSettings {
    pub fn to_limits(&self) -> UsageLimits {
        UsageLimits::unlimited()
            .with_limit(UsageMetric::Runs, self.runs_per_month)
            .with_limit(UsageMetric::Tokens, self.tokens_per_month)
    }
}

impl Config {
    /// Load `config.toml` from the working directory.
    pub fn new() -> Result<Self> {
        Self::from_file(DEFAULT_CONFIG_PATH)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&config_str)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        info!("Config: {:?}", config);
        Ok(config)
    }

    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Explicit path if given, else `config.toml` when present, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::new(),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.http.timeout_ms > 0, "http.timeout_ms must be > 0");
        ensure!(
            self.retry.max_attempts >= 1,
            "retry.max_attempts must be >= 1"
        );
        ensure!(
            self.retry.backoff_multiplier.is_finite() && self.retry.backoff_multiplier > 1.0,
            "retry.backoff_multiplier must be > 1"
        );
        ensure!(
            self.retry.initial_delay_ms <= self.retry.max_delay_ms,
            "retry.initial_delay_ms must not exceed retry.max_delay_ms"
        );
        ensure!(
            self.circuit_breaker.failure_threshold >= 1,
            "circuit_breaker.failure_threshold must be >= 1"
        );
        if let Some(rate_limit) = &self.rate_limit {
            if let Err(reason) = rate_limit.validate() {
                bail!("rate_limit.{reason}");
            }
        }
        Ok(())
    }
}
