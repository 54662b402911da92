//! Failure classification.
//!
//! Every failed attempt is classified exactly once into an [`ErrorClass`];
//! retry decisions and logging dispatch on the tag instead of poking at the
//! transport's error shape.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::request::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection reset, timeout, DNS failure.
    Transient,
    /// HTTP 5xx, optionally with the server's requested wait.
    ServerError {
        status: u16,
        retry_after: Option<Duration>,
    },
    /// HTTP 429, optionally with the server's requested wait.
    RateLimited { retry_after: Option<Duration> },
    /// HTTP 4xx other than 429.
    ClientError { status: u16 },
    Unknown,
}

impl ErrorClass {
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 => ErrorClass::RateLimited { retry_after },
            500..=599 => ErrorClass::ServerError {
                status,
                retry_after,
            },
            400..=499 => ErrorClass::ClientError { status },
            _ => ErrorClass::Unknown,
        }
    }

    /// Server-specified wait, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ErrorClass::RateLimited { retry_after }
            | ErrorClass::ServerError { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// The default retry predicate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::Transient | ErrorClass::ServerError { .. } | ErrorClass::RateLimited { .. }
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ErrorClass::ServerError { status, .. } | ErrorClass::ClientError { status } => {
                Some(*status)
            }
            ErrorClass::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Short label used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::ServerError { .. } => "server_error",
            ErrorClass::RateLimited { .. } => "rate_limited",
            ErrorClass::ClientError { .. } => "client_error",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::ServerError { status, .. } | ErrorClass::ClientError { status } => {
                write!(f, "{} ({})", self.as_str(), status)
            }
            ErrorClass::RateLimited {
                retry_after: Some(wait),
            } => write!(f, "rate_limited (retry after {wait:?})"),
            _ => f.write_str(self.as_str()),
        }
    }
}

impl std::error::Error for ErrorClass {}

/// Errors that can be classified for retry decisions.
pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

impl Classify for ErrorClass {
    fn classify(&self) -> ErrorClass {
        *self
    }
}

impl Classify for io::Error {
    fn classify(&self) -> ErrorClass {
        match self.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof => ErrorClass::Transient,
            _ => ErrorClass::Unknown,
        }
    }
}

impl Classify for reqwest::Error {
    fn classify(&self) -> ErrorClass {
        if self.is_timeout() || self.is_connect() || self.is_request() {
            return ErrorClass::Transient;
        }
        match self.status() {
            Some(status) => ErrorClass::from_status(status.as_u16(), None),
            None => ErrorClass::Unknown,
        }
    }
}

impl Classify for anyhow::Error {
    fn classify(&self) -> ErrorClass {
        if let Some(err) = self.downcast_ref::<RequestError>() {
            return err.classify();
        }
        if let Some(err) = self.downcast_ref::<reqwest::Error>() {
            return err.classify();
        }
        if let Some(err) = self.downcast_ref::<io::Error>() {
            return err.classify();
        }
        if let Some(class) = self.downcast_ref::<ErrorClass>() {
            return *class;
        }
        ErrorClass::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            ErrorClass::from_status(503, None),
            ErrorClass::ServerError {
                status: 503,
                retry_after: None
            }
        );
        assert_eq!(
            ErrorClass::from_status(404, None),
            ErrorClass::ClientError { status: 404 }
        );
        assert_eq!(
            ErrorClass::from_status(429, Some(Duration::from_secs(2))),
            ErrorClass::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
        assert_eq!(ErrorClass::from_status(302, None), ErrorClass::Unknown);
    }

    #[test]
    fn test_default_retryability() {
        assert!(ErrorClass::Transient.is_retryable());
        assert!(ErrorClass::ServerError {
            status: 500,
            retry_after: None
        }
        .is_retryable());
        assert!(ErrorClass::RateLimited { retry_after: None }.is_retryable());
        assert!(!ErrorClass::ClientError { status: 400 }.is_retryable());
        assert!(!ErrorClass::Unknown.is_retryable());
    }

    #[test]
    fn test_io_errors_are_transient() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");

        assert_eq!(reset.classify(), ErrorClass::Transient);
        assert_eq!(timeout.classify(), ErrorClass::Transient);
        assert_eq!(denied.classify(), ErrorClass::Unknown);
    }

    #[test]
    fn test_anyhow_downcasts_to_inner_error() {
        let err = anyhow::Error::new(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(err.classify(), ErrorClass::Transient);

        let opaque = anyhow::anyhow!("something odd");
        assert_eq!(opaque.classify(), ErrorClass::Unknown);
    }

    #[test]
    fn test_retry_after_kept_for_retryable_statuses() {
        let wait = Some(Duration::from_secs(7));
        assert_eq!(ErrorClass::from_status(429, wait).retry_after(), wait);
        assert_eq!(ErrorClass::from_status(503, wait).retry_after(), wait);
        assert_eq!(ErrorClass::from_status(503, None).retry_after(), None);
        // Not retried, so the header has nothing to steer.
        assert_eq!(ErrorClass::from_status(404, wait).retry_after(), None);
        assert_eq!(ErrorClass::Transient.retry_after(), None);
    }
}
