use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::classify::{Classify, ErrorClass};
use crate::error::Error;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Outbound request descriptor.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Absolute URL, or a path resolved against the client's base URL.
    pub url: String,
    pub body: Option<serde_json::Value>,
    pub headers: HeaderMap,
    /// Overrides the client's per-call timeout.
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: HeaderMap::new(),
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// Attach a JSON body.
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, Error> {
        self.body = Some(serde_json::to_value(body).map_err(Error::Encode)?);
        Ok(self)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Caller-supplied request id, if any.
    pub fn request_id(&self) -> Option<&str> {
        self.headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
    }
}

/// `req_<unix millis>_<random suffix>`
pub fn generate_request_id() -> String {
    format!(
        "req_{}_{:08x}",
        Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}

/// Successful response with its body fully read.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Latency of the attempt that produced this response.
    pub latency: Duration,
    /// Attempts it took, this one included.
    pub attempts: u32,
    pub request_id: String,
}

impl Response {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.body).map_err(Error::Decode)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Failure of a single attempt.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("{method} {url} timed out")]
    Timeout { method: Method, url: String },

    #[error("{method} {url}: connection failed: {source}")]
    Connect {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} {url}: {source}")]
    Transport {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} {url} responded with {status}")]
    Status {
        method: Method,
        url: String,
        status: StatusCode,
        retry_after: Option<Duration>,
        body: String,
    },
}

impl RequestError {
    pub(crate) fn from_reqwest(method: &Method, url: &str, err: reqwest::Error) -> Self {
        let method = method.clone();
        let url = url.to_string();
        if err.is_timeout() {
            RequestError::Timeout { method, url }
        } else if err.is_connect() {
            RequestError::Connect {
                method,
                url,
                source: err,
            }
        } else {
            RequestError::Transport {
                method,
                url,
                source: err,
            }
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RequestError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RequestError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl Classify for RequestError {
    fn classify(&self) -> ErrorClass {
        match self {
            RequestError::Timeout { .. } | RequestError::Connect { .. } => ErrorClass::Transient,
            RequestError::Transport { source, .. } => source.classify(),
            RequestError::Status {
                status,
                retry_after,
                ..
            } => ErrorClass::from_status(status.as_u16(), *retry_after),
        }
    }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Outcome of one attempt, for logging.
#[derive(Debug, Clone)]
pub struct RequestResult<'a> {
    pub method: &'a Method,
    pub url: &'a str,
    pub request_id: &'a str,
    pub attempt: u32,
    pub status: Option<StatusCode>,
    pub latency: Duration,
    pub error: Option<String>,
}

impl RequestResult<'_> {
    pub fn log(&self) {
        let status = self.status.map(|s| s.as_u16());
        let latency_ms = self.latency.as_millis() as u64;
        match &self.error {
            None => debug!(
                method = %self.method,
                url = self.url,
                request_id = self.request_id,
                attempt = self.attempt,
                status,
                latency_ms,
                "HTTP request succeeded"
            ),
            Some(error) => warn!(
                method = %self.method,
                url = self.url,
                request_id = self.request_id,
                attempt = self.attempt,
                status,
                latency_ms,
                error = error.as_str(),
                "HTTP request failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn headers_with_retry_after(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let headers = headers_with_retry_after("120");
        assert_eq!(
            parse_retry_after(&headers, Utc::now()),
            Some(Duration::from_secs(120))
        );
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let now = Utc.with_ymd_and_hms(2015, 10, 21, 7, 27, 30).unwrap();
        let headers = headers_with_retry_after("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(
            parse_retry_after(&headers, now),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_parse_retry_after_past_date_is_zero() {
        let now = Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap();
        let headers = headers_with_retry_after("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after(&headers, now), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_garbage() {
        assert_eq!(parse_retry_after(&HeaderMap::new(), Utc::now()), None);
        let headers = headers_with_retry_after("soon");
        assert_eq!(parse_retry_after(&headers, Utc::now()), None);
    }

    #[test]
    fn test_status_error_classification() {
        let err = RequestError::Status {
            method: Method::GET,
            url: "https://api.linear.app/graphql".to_string(),
            status: StatusCode::TOO_MANY_REQUESTS,
            retry_after: Some(Duration::from_secs(2)),
            body: String::new(),
        };
        assert_eq!(
            err.classify(),
            ErrorClass::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(
            err.to_string(),
            "GET https://api.linear.app/graphql responded with 429 Too Many Requests"
        );

        let timeout = RequestError::Timeout {
            method: Method::POST,
            url: "https://api.notion.com/v1/pages".to_string(),
        };
        assert_eq!(timeout.classify(), ErrorClass::Transient);
        assert_eq!(timeout.status(), None);
    }

    #[test]
    fn test_request_builder() {
        let request = Request::new(Method::POST, "/v1/pages")
            .json(&serde_json::json!({ "title": "Launch" }))
            .unwrap()
            .header(
                HeaderName::from_static(REQUEST_ID_HEADER),
                HeaderValue::from_static("req_1"),
            )
            .timeout(Duration::from_secs(5));

        assert_eq!(request.request_id(), Some("req_1"));
        assert_eq!(request.body, Some(serde_json::json!({ "title": "Launch" })));
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_generated_request_ids_are_distinct() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert!(a.starts_with("req_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_response_accessors() {
        let response = Response {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: br#"{"ok":true}"#.to_vec(),
            latency: Duration::from_millis(12),
            attempts: 1,
            request_id: "req_1".to_string(),
        };
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(response.text(), r#"{"ok":true}"#);
        assert!(response.json::<Vec<u32>>().is_err());
    }
}
