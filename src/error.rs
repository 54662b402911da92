use std::fmt;
use std::time::Duration;

use crate::classify::{Classify, ErrorClass};
use crate::request::RequestError;
use crate::retry::RetryError;

/// Which way a resilient call failed. Recorded as the `path` log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePath {
    /// Short-circuited by the breaker; no request was sent.
    CircuitOpen,
    RetriesExhausted,
    NonRetryable,
    Cancelled,
    DeadlineExceeded,
    /// Rejected locally before any network activity.
    Invalid,
}

impl FailurePath {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePath::CircuitOpen => "circuit_open",
            FailurePath::RetriesExhausted => "retries_exhausted",
            FailurePath::NonRetryable => "non_retryable",
            FailurePath::Cancelled => "cancelled",
            FailurePath::DeadlineExceeded => "deadline_exceeded",
            FailurePath::Invalid => "invalid",
        }
    }
}

impl fmt::Display for FailurePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("circuit open for {host}, next trial in {retry_in:?}")]
    CircuitOpen { host: String, retry_in: Duration },

    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: RequestError,
    },

    #[error("non-retryable failure: {source}")]
    NonRetryable {
        #[source]
        source: RequestError,
    },

    #[error("request cancelled after {attempts} attempts")]
    Cancelled {
        attempts: u32,
        last_error: Option<RequestError>,
    },

    #[error("retry deadline exceeded after {attempts} attempts ({elapsed:?})")]
    DeadlineExceeded {
        attempts: u32,
        elapsed: Duration,
        last_error: Option<RequestError>,
    },

    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid client configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode response body: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to build http client: {0}")]
    Build(#[source] reqwest::Error),
}

impl From<RetryError<RequestError>> for Error {
    fn from(err: RetryError<RequestError>) -> Self {
        match err {
            RetryError::Exhausted {
                attempts, error, ..
            } => Error::RetriesExhausted {
                attempts,
                source: error,
            },
            RetryError::Rejected { error, .. } => Error::NonRetryable { source: error },
            RetryError::Cancelled {
                attempts,
                last_error,
            } => Error::Cancelled {
                attempts,
                last_error,
            },
            RetryError::DeadlineExceeded {
                attempts,
                elapsed,
                last_error,
            } => Error::DeadlineExceeded {
                attempts,
                elapsed,
                last_error,
            },
        }
    }
}

impl Error {
    pub fn failure_path(&self) -> FailurePath {
        match self {
            Error::CircuitOpen { .. } => FailurePath::CircuitOpen,
            Error::RetriesExhausted { .. } => FailurePath::RetriesExhausted,
            Error::NonRetryable { .. } => FailurePath::NonRetryable,
            Error::Cancelled { .. } => FailurePath::Cancelled,
            Error::DeadlineExceeded { .. } => FailurePath::DeadlineExceeded,
            Error::InvalidUrl { .. }
            | Error::InvalidConfig { .. }
            | Error::Encode(_)
            | Error::Decode(_)
            | Error::Build(_) => FailurePath::Invalid,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }

    /// The last upstream failure, when one happened.
    pub fn last_error(&self) -> Option<&RequestError> {
        match self {
            Error::RetriesExhausted { source, .. } | Error::NonRetryable { source } => Some(source),
            Error::Cancelled { last_error, .. } | Error::DeadlineExceeded { last_error, .. } => {
                last_error.as_ref()
            }
            _ => None,
        }
    }

    /// Classification of the last upstream failure.
    pub fn class(&self) -> Option<ErrorClass> {
        self.last_error().map(Classify::classify)
    }

    /// Wait to advertise to the end user.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::CircuitOpen { retry_in, .. } => Some(*retry_in),
            _ => self.last_error().and_then(RequestError::retry_after),
        }
    }

    /// HTTP status the route layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::CircuitOpen { .. } => 503,
            Error::RetriesExhausted { .. } | Error::NonRetryable { .. } => match self.class() {
                Some(ErrorClass::RateLimited { .. }) => 429,
                _ => 502,
            },
            Error::Cancelled { .. } | Error::DeadlineExceeded { .. } => 504,
            Error::InvalidUrl { .. } | Error::Encode(_) => 400,
            Error::Decode(_) => 502,
            Error::InvalidConfig { .. } | Error::Build(_) => 500,
        }
    }

    /// Machine-readable code for error payloads.
    pub fn error_code(&self) -> &'static str {
        match self.status_code() {
            429 => "RATE_LIMIT_ERROR",
            502..=504 => "EXTERNAL_API_ERROR",
            400 => "VALIDATION_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }
}
