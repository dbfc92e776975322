//! Error type shared by every driver adapter.

use thiserror::Error;

/// Failure reported by a browser-like driver.
///
/// Callers classify these with [DriverError::is_session_lost] and
/// [DriverError::is_retryable] instead of matching on adapter-specific text.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The rendering context (window/tab) or the whole session is gone.
    #[error("Browser session lost: {message}")]
    SessionLost { message: String },

    #[error("Timed out during {operation}: {message}")]
    Timeout { operation: String, message: String },

    #[error("No such element: {0}")]
    NoSuchElement(String),

    #[error("Element not interactable: {0}")]
    NotInteractable(String),

    #[error("Script failed: {0}")]
    Script(String),

    #[error("Could not reach WebDriver at {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("WebDriver returned HTTP {status} ({error}): {message}")]
    Protocol {
        status: u16,
        error: String,
        message: String,
    },

    #[error("Unexpected WebDriver response: {0}")]
    Malformed(String),

    #[error("Operation not supported by this driver: {0}")]
    Unsupported(&'static str),
}

impl DriverError {
    pub fn is_session_lost(&self) -> bool {
        matches!(self, DriverError::SessionLost { .. })
    }

    /// Transient failures worth another attempt under a [RetryPolicy](crate::retry::RetryPolicy).
    pub fn is_retryable(&self) -> bool {
        match self {
            DriverError::Timeout { .. } => true,
            DriverError::Transport { source, .. } => source.is_timeout() || source.is_connect(),
            DriverError::Protocol { status, .. } => *status >= 500 && *status != 501,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_lost_is_not_retryable() {
        let e = DriverError::SessionLost {
            message: "no such window".into(),
        };
        assert!(e.is_session_lost());
        assert!(!e.is_retryable());
    }

    #[test]
    fn timeouts_and_server_errors_are_retryable() {
        let timeout = DriverError::Timeout {
            operation: "navigate".into(),
            message: "page load".into(),
        };
        assert!(timeout.is_retryable());
        let busy = DriverError::Protocol {
            status: 503,
            error: "unknown error".into(),
            message: "busy".into(),
        };
        assert!(busy.is_retryable());
        let unsupported = DriverError::Protocol {
            status: 501,
            error: "unsupported operation".into(),
            message: String::new(),
        };
        assert!(!unsupported.is_retryable());
    }

    #[test]
    fn element_errors_are_permanent() {
        assert!(!DriverError::NoSuchElement("a.next".into()).is_retryable());
        assert!(!DriverError::NotInteractable("a.next".into()).is_retryable());
    }
}
