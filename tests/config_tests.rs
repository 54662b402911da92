use pretty_assertions::assert_eq;
use resilient_http::config::{CircuitBreakerSettings, Config, RetrySettings};
use resilient_http::{ResilientClient, UsageMetric};
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn test_config_new_with_valid_file() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.toml");

    let config_content = r#"
[http]
base_url = "https://api.github.com"
timeout_ms = 5000
user_agent = "acme-integrations/1.0"

[retry]
max_attempts = 4
initial_delay_ms = 250
max_delay_ms = 4000
backoff_multiplier = 3.0
max_elapsed_ms = 20000

[circuit_breaker]
failure_threshold = 3
reset_timeout_ms = 15000

[rate_limit]
capacity = 10
refill_per_sec = 2.5

[usage]
runs_per_month = 100
"#;

    fs::write(&config_path, config_content).unwrap();

    let original_dir = std::env::current_dir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();

    let result = Config::new();
    let loaded = Config::load(None);

    std::env::set_current_dir(original_dir).unwrap();

    assert!(result.is_ok());
    assert!(loaded.is_ok());
    let config = result.unwrap();
    assert_eq!(config.http.base_url.as_deref(), Some("https://api.github.com"));
    assert_eq!(config.http.timeout(), Duration::from_secs(5));
    assert_eq!(
        config.retry,
        RetrySettings {
            max_attempts: 4,
            initial_delay_ms: 250,
            max_delay_ms: 4000,
            backoff_multiplier: 3.0,
            max_elapsed_ms: Some(20_000),
        }
    );
    assert_eq!(
        config.circuit_breaker,
        CircuitBreakerSettings {
            failure_threshold: 3,
            reset_timeout_ms: 15_000,
        }
    );
    let rate_limit = config.rate_limit.unwrap();
    assert_eq!(rate_limit.capacity, 10);
    assert_eq!(rate_limit.refill_per_sec, 2.5);

    let limits = config.usage.to_limits();
    assert_eq!(limits.limit(UsageMetric::Runs), Some(100));
    assert_eq!(limits.limit(UsageMetric::Tokens), None);
}

#[test]
fn test_config_from_missing_file() {
    let dir = tempdir().unwrap();
    let result = Config::from_file(dir.path().join("config.toml"));
    assert!(result.is_err());
}

#[test]
fn test_config_load_explicit_missing_path_fails() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    assert!(Config::load(Some(missing.as_path())).is_err());
}

#[test]
fn test_config_with_invalid_toml() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.toml");

    let invalid_content = r#"
[retry
max_attempts = 3
"#;

    fs::write(&config_path, invalid_content).unwrap();

    assert!(Config::from_file(&config_path).is_err());
}

#[test]
fn test_empty_config_uses_defaults() {
    let config = Config::from_toml_str("").unwrap();

    let retry = config.retry.to_retry_config();
    assert_eq!(retry.max_attempts, 3);
    assert_eq!(retry.initial_delay, Duration::from_secs(1));
    assert_eq!(retry.max_delay, Duration::from_secs(10));
    assert_eq!(retry.multiplier, 2.0);
    assert_eq!(retry.max_elapsed, None);

    let breaker = config.circuit_breaker.to_breaker_config();
    assert_eq!(breaker.failure_threshold, 5);
    assert_eq!(breaker.reset_timeout, Duration::from_secs(60));

    assert_eq!(config.http.timeout(), Duration::from_secs(30));
    assert!(config.http.base_url.is_none());
    assert!(config.rate_limit.is_none());
}

#[test]
fn test_partial_section_keeps_other_defaults() {
    let config = Config::from_toml_str(
        r#"
[retry]
max_attempts = 6
"#,
    )
    .unwrap();

    assert_eq!(config.retry.max_attempts, 6);
    assert_eq!(config.retry.initial_delay_ms, 1000);
    assert_eq!(config.circuit_breaker.failure_threshold, 5);
}

#[test]
fn test_validation_rejects_bad_values() {
    let cases = [
        "[retry]\nmax_attempts = 0\n",
        "[retry]\nbackoff_multiplier = 1.0\n",
        "[retry]\ninitial_delay_ms = 20000\nmax_delay_ms = 1000\n",
        "[circuit_breaker]\nfailure_threshold = 0\n",
        "[http]\ntimeout_ms = 0\n",
        "[rate_limit]\ncapacity = 5\nrefill_per_sec = 0.0\n",
    ];

    for case in cases {
        assert!(Config::from_toml_str(case).is_err(), "accepted: {case}");
    }
}

#[test]
fn test_client_from_config() {
    let config = Config::from_toml_str(
        r#"
[http]
base_url = "https://api.notion.com/v1/"
timeout_ms = 2000

[retry]
max_attempts = 2
"#,
    )
    .unwrap();

    let client = ResilientClient::from_config(&config).unwrap();
    assert_eq!(client.timeout(), Duration::from_secs(2));
    assert_eq!(client.retry_config().max_attempts, 2);
    assert_eq!(
        client.resolve_url("pages").unwrap().as_str(),
        "https://api.notion.com/v1/pages"
    );
}
