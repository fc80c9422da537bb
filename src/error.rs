//! Typed errors at the external-service seams.
//!
//! Storage and CLI plumbing use `anyhow`; the backend and power clients
//! return these so worker loops can tell "backend offline, defer" apart
//! from "backend answered with garbage, retry then give up".

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    /// Connection refused, DNS failure, host asleep.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend request timed out")]
    Timeout,

    #[error("backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The response arrived but did not parse into the expected shape.
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

impl BackendError {
    /// Errors that mean "try again later" rather than "this input is bad".
    pub fn is_unavailable(&self) -> bool {
        match self {
            BackendError::Unavailable(_) | BackendError::Timeout => true,
            BackendError::Http { status, .. } => *status == 429 || *status >= 500,
            BackendError::Malformed(_) => false,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else if err.is_decode() {
            BackendError::Malformed(err.to_string())
        } else {
            BackendError::Unavailable(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum PowerError {
    #[error("power control is not configured: {0}")]
    NotConfigured(&'static str),

    #[error("invalid hardware address '{0}'")]
    InvalidMac(String),

    #[error("failed to send wake packet: {0}")]
    Wake(#[from] std::io::Error),

    #[error("inference backend did not come up within {0}s")]
    WakeTimeout(u64),

    #[error("shutdown command failed: {0}")]
    Shutdown(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_classification() {
        assert!(BackendError::Unavailable("refused".into()).is_unavailable());
        assert!(BackendError::Timeout.is_unavailable());
        assert!(BackendError::Http {
            status: 503,
            body: String::new()
        }
        .is_unavailable());
        assert!(!BackendError::Http {
            status: 400,
            body: String::new()
        }
        .is_unavailable());
        assert!(!BackendError::Malformed("x".into()).is_unavailable());
    }
}
