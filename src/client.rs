use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::header::HeaderValue;
use reqwest::{Client, Method, Url};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitSnapshot, CircuitState,
};
use crate::clock::{system_clock, Clock};
use crate::config::Config;
use crate::error::{Error, FailurePath};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::registry::HostRegistry;
use crate::request::{
    generate_request_id, parse_retry_after, Request, RequestError, RequestResult, Response,
    REQUEST_ID_HEADER,
};
use crate::retry::{RetryConfig, RetryError, RetryOverrides, RetryPolicy};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_USER_AGENT: &str = concat!("resilient-http/", env!("CARGO_PKG_VERSION"));

/// Longest slice of an error response body kept on [`RequestError::Status`].
const ERROR_BODY_LIMIT: usize = 2048;

/// HTTP client where every call goes through the host's circuit breaker and,
/// once admitted, through the retry policy.
#[derive(Debug)]
pub struct ResilientClient {
    http: Client,
    base_url: Option<Url>,
    timeout: Duration,
    retry_policy: RetryPolicy,
    breaker_config: CircuitBreakerConfig,
    breakers: HostRegistry<CircuitBreaker>,
    rate_limit: Option<RateLimitConfig>,
    rate_limiters: HostRegistry<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl ResilientClient {
    /// Client with default timeout, retry and breaker settings.
    pub fn new() -> Result<Self, Error> {
        Self::builder().build()
    }

    pub fn builder() -> ResilientClientBuilder {
        ResilientClientBuilder::default()
    }

    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let mut builder = Self::builder()
            .timeout(config.http.timeout())
            .retry_config(config.retry.to_retry_config())
            .circuit_breaker_config(config.circuit_breaker.to_breaker_config());
        if let Some(base_url) = &config.http.base_url {
            builder = builder.base_url(base_url);
        }
        if let Some(user_agent) = &config.http.user_agent {
            builder = builder.user_agent(user_agent);
        }
        if let Some(rate_limit) = config.rate_limit {
            builder = builder.rate_limit(rate_limit);
        }
        builder.build()
    }

    pub async fn request(
        &self,
        request: Request,
        overrides: Option<RetryOverrides>,
    ) -> Result<Response, Error> {
        self.execute(request, overrides, None).await
    }

    /// Like [`request`](Self::request); `cancel` aborts the in-flight attempt
    /// or backoff promptly. Cancellation does not count against the breaker.
    pub async fn request_with_cancel(
        &self,
        request: Request,
        overrides: Option<RetryOverrides>,
        cancel: &CancellationToken,
    ) -> Result<Response, Error> {
        self.execute(request, overrides, Some(cancel)).await
    }

    pub async fn get(&self, url: &str) -> Result<Response, Error> {
        self.request(Request::get(url), None).await
    }

    pub async fn post<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<Response, Error> {
        self.request(Request::new(Method::POST, url).json(body)?, None)
            .await
    }

    pub async fn put<B: Serialize + ?Sized>(&self, url: &str, body: &B) -> Result<Response, Error> {
        self.request(Request::new(Method::PUT, url).json(body)?, None)
            .await
    }

    pub async fn patch<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<Response, Error> {
        self.request(Request::new(Method::PATCH, url).json(body)?, None)
            .await
    }

    pub async fn delete(&self, url: &str) -> Result<Response, Error> {
        self.request(Request::delete(url), None).await
    }

    /// State of the breaker guarding `url`'s host. Hosts never called are
    /// reported closed.
    pub fn circuit_state(&self, url: &str) -> Result<CircuitState, Error> {
        Ok(self
            .circuit_snapshot(url)?
            .map(|snapshot| snapshot.state)
            .unwrap_or(CircuitState::Closed))
    }

    pub fn circuit_snapshot(&self, url: &str) -> Result<Option<CircuitSnapshot>, Error> {
        let host = host_key(&self.resolve_url(url)?)?;
        Ok(self.breakers.get(&host).map(|breaker| breaker.snapshot()))
    }

    pub fn reset_circuit_breaker(&self, url: &str) -> Result<(), Error> {
        let host = host_key(&self.resolve_url(url)?)?;
        if let Some(breaker) = self.breakers.get(&host) {
            breaker.reset();
        }
        Ok(())
    }

    /// Hosts with a breaker, sorted.
    pub fn hosts(&self) -> Vec<String> {
        self.breakers.hosts()
    }

    pub fn breakers(&self) -> &HostRegistry<CircuitBreaker> {
        &self.breakers
    }

    pub fn retry_config(&self) -> &RetryConfig {
        self.retry_policy.config()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve `raw` against the base URL. Scheme-less URLs without a base
    /// are taken as `https://`.
    pub fn resolve_url(&self, raw: &str) -> Result<Url, Error> {
        let invalid = |reason: String| Error::InvalidUrl {
            url: raw.to_string(),
            reason,
        };

        if raw.trim().is_empty() {
            return match &self.base_url {
                Some(base) => Ok(base.clone()),
                None => Err(invalid("empty url and no base url".to_string())),
            };
        }

        let url = match Url::parse(raw) {
            Ok(url) if url.has_host() => url,
            _ => match &self.base_url {
                Some(base) => base.join(raw).map_err(|e| invalid(e.to_string()))?,
                None => Url::parse(&format!("https://{raw}")).map_err(|e| invalid(e.to_string()))?,
            },
        };

        if url.has_host() {
            Ok(url)
        } else {
            Err(invalid("missing host".to_string()))
        }
    }

    fn breaker_for(&self, host: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_or_insert_with(host, || {
            CircuitBreaker::with_clock(host, self.breaker_config, self.clock.clone())
        })
    }

    fn rate_limiter_for(&self, host: &str) -> Option<Arc<RateLimiter>> {
        let config = self.rate_limit?;
        Some(self.rate_limiters.get_or_insert_with(host, || {
            RateLimiter::from_config(&config, self.clock.clone())
        }))
    }

    async fn execute(
        &self,
        request: Request,
        overrides: Option<RetryOverrides>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response, Error> {
        let url = self.resolve_url(&request.url)?;
        let host = host_key(&url)?;
        let request_id = request
            .request_id()
            .map(str::to_string)
            .unwrap_or_else(generate_request_id);

        let breaker = self.breaker_for(&host);
        let limiter = self.rate_limiter_for(&host);
        let policy = match &overrides {
            Some(overrides) => self.retry_policy.with_overrides(overrides),
            None => self.retry_policy.clone(),
        };

        let call = Call {
            request: &request,
            url: &url,
            request_id: &request_id,
            limiter: limiter.as_deref(),
            attempts: AtomicU32::new(0),
        };

        let outcome = breaker
            .execute_counting(
                || self.send_with_retries(&policy, &call, cancel),
                |err: &RetryError<RequestError>| !err.is_cancelled(),
            )
            .await;

        let err = match outcome {
            Ok(response) => return Ok(response),
            Err(CircuitError::Open { retry_in }) => Error::CircuitOpen {
                host: host.clone(),
                retry_in,
            },
            Err(CircuitError::Inner(err)) => Error::from(err),
        };

        let path = err.failure_path().as_str();
        let method = &request.method;
        let request_id = call.request_id;
        match err.failure_path() {
            FailurePath::CircuitOpen => warn!(
                path, %method, %url, %host, request_id,
                "Circuit open, request short-circuited without network attempt"
            ),
            FailurePath::RetriesExhausted => error!(
                path, %method, %url, %host, request_id,
                attempts = call.attempts.load(Ordering::SeqCst),
                error = %err,
                "Upstream unavailable, retries exhausted"
            ),
            FailurePath::NonRetryable => warn!(
                path, %method, %url, %host, request_id,
                error = %err,
                "Upstream request failed with non-retryable error"
            ),
            FailurePath::Cancelled => info!(
                path, %method, %url, %host, request_id,
                "Request cancelled by caller"
            ),
            FailurePath::DeadlineExceeded | FailurePath::Invalid => warn!(
                path, %method, %url, %host, request_id,
                error = %err,
                "Request abandoned"
            ),
        }
        Err(err)
    }

    async fn send_with_retries(
        &self,
        policy: &RetryPolicy,
        call: &Call<'_>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response, RetryError<RequestError>> {
        policy.run_inner(|| self.send_once(call), cancel).await
    }

    /// One attempt: wait for a rate-limit token, send, read the response.
    async fn send_once(&self, call: &Call<'_>) -> Result<Response, RequestError> {
        let Call {
            request,
            url,
            request_id,
            limiter,
            ..
        } = *call;
        let attempt = call.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(limiter) = limiter {
            limiter.acquire().await;
        }

        let mut headers = request.headers.clone();
        if let Ok(value) = HeaderValue::from_str(request_id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }

        let mut builder = self
            .http
            .request(request.method.clone(), url.clone())
            .headers(headers)
            .timeout(request.timeout.unwrap_or(self.timeout));
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let started = Instant::now();
        let result = match builder.send().await {
            Ok(response) => read_response(&request.method, url, request_id, response).await,
            Err(err) => Err(RequestError::from_reqwest(&request.method, url.as_str(), err)),
        };
        let latency = started.elapsed();

        RequestResult {
            method: &request.method,
            url: url.as_str(),
            request_id,
            attempt,
            status: match &result {
                Ok(response) => Some(response.status),
                Err(err) => err.status(),
            },
            latency,
            error: result.as_ref().err().map(ToString::to_string),
        }
        .log();

        result.map(|mut response| {
            response.latency = latency;
            response.attempts = attempt;
            response
        })
    }
}

/// Everything the attempts of one logical call share.
struct Call<'a> {
    request: &'a Request,
    url: &'a Url,
    request_id: &'a str,
    limiter: Option<&'a RateLimiter>,
    attempts: AtomicU32,
}

async fn read_response(
    method: &Method,
    url: &Url,
    request_id: &str,
    response: reqwest::Response,
) -> Result<Response, RequestError> {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .bytes()
        .await
        .map_err(|err| RequestError::from_reqwest(method, url.as_str(), err))?;

    if status.is_success() {
        return Ok(Response {
            status,
            headers,
            body: body.to_vec(),
            latency: Duration::ZERO,
            attempts: 0,
            request_id: request_id.to_string(),
        });
    }

    let body: String = String::from_utf8_lossy(&body)
        .chars()
        .take(ERROR_BODY_LIMIT)
        .collect();
    Err(RequestError::Status {
        method: method.clone(),
        url: url.to_string(),
        status,
        retry_after: parse_retry_after(&headers, Utc::now()),
        body,
    })
}

/// Breaker key: the lowercase hostname, port ignored.
pub fn host_key(url: &Url) -> Result<String, Error> {
    url.host_str()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| Error::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        })
}

#[derive(Debug)]
pub struct ResilientClientBuilder {
    base_url: Option<String>,
    timeout: Duration,
    user_agent: String,
    retry: RetryConfig,
    breaker: CircuitBreakerConfig,
    rate_limit: Option<RateLimitConfig>,
    clock: Option<Arc<dyn Clock>>,
    breakers: Option<HostRegistry<CircuitBreaker>>,
    http: Option<Client>,
}

impl Default for ResilientClientBuilder {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            rate_limit: None,
            clock: None,
            breakers: None,
            http: None,
        }
    }
}

impl ResilientClientBuilder {
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Per-call timeout of the underlying request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn circuit_breaker_config(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share breakers with other clients instead of owning a fresh registry.
    pub fn breaker_registry(mut self, breakers: HostRegistry<CircuitBreaker>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Use a preconfigured reqwest client; `user_agent` is then ignored.
    pub fn http_client(mut self, http: Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn build(self) -> Result<ResilientClient, Error> {
        let base_url = match self.base_url {
            Some(raw) => {
                Some(Url::parse(&raw).map_err(|e| Error::InvalidUrl {
                    url: raw.clone(),
                    reason: e.to_string(),
                })?)
            }
            None => None,
        };

        let http = match self.http {
            Some(http) => http,
            None => Client::builder()
                .user_agent(self.user_agent)
                .build()
                .map_err(Error::Build)?,
        };

        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate().map_err(|reason| Error::InvalidConfig {
                reason: format!("rate_limit.{reason}"),
            })?;
        }

        let clock = self.clock.unwrap_or_else(system_clock);

        Ok(ResilientClient {
            http,
            base_url,
            timeout: self.timeout,
            retry_policy: RetryPolicy::with_clock(self.retry, clock.clone()),
            breaker_config: self.breaker,
            breakers: self.breakers.unwrap_or_default(),
            rate_limit: self.rate_limit,
            rate_limiters: HostRegistry::new(),
            clock,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_base(base: Option<&str>) -> ResilientClient {
        let mut builder = ResilientClient::builder();
        if let Some(base) = base {
            builder = builder.base_url(base);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_resolve_absolute_url() {
        let client = client_with_base(Some("https://api.github.com"));
        let url = client
            .resolve_url("https://api.linear.app/graphql")
            .unwrap();
        assert_eq!(url.as_str(), "https://api.linear.app/graphql");
    }

    #[test]
    fn test_resolve_relative_against_base() {
        let client = client_with_base(Some("https://api.github.com/"));
        let url = client.resolve_url("repos/acme/app/issues").unwrap();
        assert_eq!(url.as_str(), "https://api.github.com/repos/acme/app/issues");
        assert_eq!(host_key(&url).unwrap(), "api.github.com");
    }

    #[test]
    fn test_resolve_scheme_less_defaults_to_https() {
        let client = client_with_base(None);
        let url = client.resolve_url("api.notion.com/v1/pages").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(host_key(&url).unwrap(), "api.notion.com");
    }

    #[test]
    fn test_resolve_rejects_hostless_urls() {
        let client = client_with_base(None);
        assert!(matches!(
            client.resolve_url("mailto:ops@example.com"),
            Err(Error::InvalidUrl { .. })
        ));
        assert!(client.resolve_url("").is_err());
    }

    #[test]
    fn test_empty_url_uses_base() {
        let client = client_with_base(Some("https://eu.posthog.com"));
        let url = client.resolve_url("").unwrap();
        assert_eq!(host_key(&url).unwrap(), "eu.posthog.com");
    }

    #[test]
    fn test_host_key_ignores_port_and_case() {
        let url = Url::parse("http://API.Example.COM:8443/health").unwrap();
        assert_eq!(host_key(&url).unwrap(), "api.example.com");
    }

    #[test]
    fn test_invalid_base_url_fails_build() {
        let result = ResilientClient::builder().base_url("not a url").build();
        assert!(matches!(result, Err(Error::InvalidUrl { .. })));
    }

    #[test]
    fn test_unusable_rate_limit_fails_build() {
        for refill_per_sec in [0.0, f64::NAN, -2.0] {
            let result = ResilientClient::builder()
                .rate_limit(RateLimitConfig {
                    capacity: 5,
                    refill_per_sec,
                })
                .build();
            match result {
                Err(err @ Error::InvalidConfig { .. }) => {
                    assert_eq!(err.failure_path(), FailurePath::Invalid);
                    assert_eq!(err.status_code(), 500);
                }
                other => panic!("expected invalid config, got {other:?}"),
            }
        }

        let tiny = ResilientClient::builder()
            .rate_limit(RateLimitConfig {
                capacity: 1,
                refill_per_sec: 1e-300,
            })
            .build();
        assert!(tiny.is_ok());
    }

    #[test]
    fn test_unknown_host_reports_closed_without_registering() {
        let client = client_with_base(None);
        assert_eq!(
            client.circuit_state("https://api.atlassian.com/wiki").unwrap(),
            CircuitState::Closed
        );
        assert!(client.circuit_snapshot("https://api.atlassian.com").unwrap().is_none());
        client
            .reset_circuit_breaker("https://api.atlassian.com")
            .unwrap();
        assert!(client.hosts().is_empty());
    }

    #[test]
    fn test_builder_defaults() {
        let client = ResilientClient::new().unwrap();
        assert_eq!(client.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(client.retry_config().max_attempts, 3);
        assert!(client.breakers().is_empty());
    }
}
