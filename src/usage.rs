//! Monthly usage limits per user.
//!
//! Callers check a quota before doing metered work and record consumption
//! afterwards. Counters roll over at the start of each calendar month (UTC).
//! A refused check converts into [`UsageLimitExceeded`], which the route
//! layer reports as a 429.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageMetric {
    Runs,
    Tokens,
}

impl UsageMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageMetric::Runs => "runs",
            UsageMetric::Tokens => "tokens",
        }
    }
}

impl fmt::Display for UsageMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-metric monthly caps. Metrics without a cap are unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageLimits {
    limits: HashMap<UsageMetric, u64>,
}

impl UsageLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, metric: UsageMetric, limit: Option<u64>) -> Self {
        match limit {
            Some(limit) => {
                self.limits.insert(metric, limit);
            }
            None => {
                self.limits.remove(&metric);
            }
        }
        self
    }

    pub fn limit(&self, metric: UsageMetric) -> Option<u64> {
        self.limits.get(&metric).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageCheck {
    pub metric: UsageMetric,
    pub allowed: bool,
    pub current: u64,
    /// `None` when unlimited.
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
}

impl UsageCheck {
    pub fn ensure_allowed(&self) -> Result<(), UsageLimitExceeded> {
        match self.limit {
            Some(limit) if !self.allowed => Err(UsageLimitExceeded {
                metric: self.metric,
                current: self.current,
                limit,
                remaining: self.remaining.unwrap_or(0),
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Usage limit exceeded. You have used {current}/{limit} {metric} this month. Please upgrade your plan to continue.")]
pub struct UsageLimitExceeded {
    pub metric: UsageMetric,
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
}

impl UsageLimitExceeded {
    pub fn status_code(&self) -> u16 {
        429
    }

    pub fn error_code(&self) -> &'static str {
        "RATE_LIMIT_ERROR"
    }

    /// Time until the quota resets.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (next_period_start(now) - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Period {
    year: i32,
    month: u32,
}

impl Period {
    fn of(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }
}

fn next_period_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(now)
}

type UsageKey = (String, UsageMetric, Period);

/// In-memory usage counters.
#[derive(Debug, Clone)]
pub struct UsageMeter {
    limits: UsageLimits,
    counters: Arc<RwLock<HashMap<UsageKey, u64>>>,
}

impl UsageMeter {
    pub fn new(limits: UsageLimits) -> Self {
        Self {
            limits,
            counters: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn limits(&self) -> &UsageLimits {
        &self.limits
    }

    /// Would consuming `amount` more keep `user_id` within this month's quota?
    pub async fn check_limit(&self, user_id: &str, metric: UsageMetric, amount: u64) -> UsageCheck {
        self.check_limit_at(user_id, metric, amount, Utc::now()).await
    }

    pub async fn check_limit_at(
        &self,
        user_id: &str,
        metric: UsageMetric,
        amount: u64,
        at: DateTime<Utc>,
    ) -> UsageCheck {
        let current = self.usage_at(user_id, metric, at).await;
        let limit = self.limits.limit(metric);
        let check = UsageCheck {
            metric,
            allowed: limit.map_or(true, |limit| current.saturating_add(amount) <= limit),
            current,
            limit,
            remaining: limit.map(|limit| limit.saturating_sub(current)),
        };
        debug!(user_id, %metric, amount, current, allowed = check.allowed, "Usage check");
        check
    }

    /// Record consumption; returns the new monthly total.
    pub async fn track_usage(&self, user_id: &str, metric: UsageMetric, amount: u64) -> u64 {
        self.track_usage_at(user_id, metric, amount, Utc::now()).await
    }

    pub async fn track_usage_at(
        &self,
        user_id: &str,
        metric: UsageMetric,
        amount: u64,
        at: DateTime<Utc>,
    ) -> u64 {
        let mut counters = self.counters.write().await;
        let total = counters
            .entry((user_id.to_string(), metric, Period::of(at)))
            .or_insert(0);
        *total = total.saturating_add(amount);
        *total
    }

    pub async fn usage(&self, user_id: &str, metric: UsageMetric) -> u64 {
        self.usage_at(user_id, metric, Utc::now()).await
    }

    pub async fn usage_at(&self, user_id: &str, metric: UsageMetric, at: DateTime<Utc>) -> u64 {
        self.counters
            .read()
            .await
            .get(&(user_id.to_string(), metric, Period::of(at)))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    fn meter(runs: u64) -> UsageMeter {
        UsageMeter::new(UsageLimits::unlimited().with_limit(UsageMetric::Runs, Some(runs)))
    }

    #[tokio::test]
    async fn test_check_within_limit() {
        let meter = meter(10);
        meter.track_usage_at("user-1", UsageMetric::Runs, 4, at(2026, 3, 2)).await;

        let check = meter
            .check_limit_at("user-1", UsageMetric::Runs, 1, at(2026, 3, 20))
            .await;
        assert!(check.allowed);
        assert_eq!(check.current, 4);
        assert_eq!(check.limit, Some(10));
        assert_eq!(check.remaining, Some(6));
        assert!(check.ensure_allowed().is_ok());
    }

    #[tokio::test]
    async fn test_check_over_limit() {
        let meter = meter(3);
        meter.track_usage_at("user-1", UsageMetric::Runs, 3, at(2026, 3, 2)).await;

        let check = meter
            .check_limit_at("user-1", UsageMetric::Runs, 1, at(2026, 3, 3))
            .await;
        assert!(!check.allowed);

        let err = check.ensure_allowed().unwrap_err();
        assert_eq!(err.status_code(), 429);
        assert_eq!(err.error_code(), "RATE_LIMIT_ERROR");
        assert_eq!(
            err.to_string(),
            "Usage limit exceeded. You have used 3/3 runs this month. Please upgrade your plan to continue."
        );
    }

    #[tokio::test]
    async fn test_counters_roll_over_monthly() {
        let meter = meter(3);
        meter.track_usage_at("user-1", UsageMetric::Runs, 3, at(2026, 12, 31)).await;

        let january = meter
            .check_limit_at("user-1", UsageMetric::Runs, 1, at(2027, 1, 1))
            .await;
        assert!(january.allowed);
        assert_eq!(january.current, 0);
    }

    #[tokio::test]
    async fn test_unlimited_metric() {
        let meter = meter(1);
        meter.track_usage("user-1", UsageMetric::Tokens, 1_000_000).await;

        let check = meter.check_limit("user-1", UsageMetric::Tokens, 1_000_000).await;
        assert!(check.allowed);
        assert_eq!(check.limit, None);
        assert_eq!(check.remaining, None);
        assert_eq!(meter.usage("user-1", UsageMetric::Tokens).await, 1_000_000);
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let meter = meter(2);
        meter.track_usage("user-1", UsageMetric::Runs, 2).await;
        assert_eq!(meter.usage("user-2", UsageMetric::Runs).await, 0);
        assert!(meter.check_limit("user-2", UsageMetric::Runs, 1).await.allowed);
    }

    #[test]
    fn test_retry_after_until_next_month() {
        let err = UsageLimitExceeded {
            metric: UsageMetric::Runs,
            current: 5,
            limit: 5,
            remaining: 0,
        };
        let now = Utc.with_ymd_and_hms(2026, 12, 31, 23, 0, 0).unwrap();
        assert_eq!(err.retry_after(now), Duration::from_secs(3600));
    }
}
