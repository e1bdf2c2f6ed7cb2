//! Error types for external boundaries

use thiserror::Error;

/// Failure of an execution-gateway call.
///
/// Callers treat every variant as "unknown state", never as zero.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// Network failure, timeout or 5xx. Safe to retry.
    #[error("transient gateway error: {0}")]
    Transient(String),
    /// Post-only order would have matched immediately
    #[error("order would cross the book: {0}")]
    WouldCross(String),
    /// Exchange refused the request (validation, funds, market closed)
    #[error("rejected by exchange: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Gateway cannot serve this call at all
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }

    pub fn is_cross_reject(&self) -> bool {
        matches!(self, GatewayError::WouldCross(_))
    }

    /// Classify a free-text exchange rejection
    pub fn from_rejection(reason: &str) -> Self {
        let lower = reason.to_lowercase();
        if lower.contains("cross") || lower.contains("post only") || lower.contains("post-only") {
            GatewayError::WouldCross(reason.to_string())
        } else {
            GatewayError::Rejected(reason.to_string())
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return GatewayError::Transient(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                GatewayError::Transient(err.to_string())
            }
            Some(status) if status.as_u16() == 401 || status.as_u16() == 403 => {
                GatewayError::Auth(err.to_string())
            }
            Some(status) if status.as_u16() == 404 => GatewayError::NotFound(err.to_string()),
            _ => GatewayError::Transient(err.to_string()),
        }
    }
}

/// Failure of an advisory-oracle call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OracleError {
    #[error("oracle disabled")]
    Disabled,
    #[error("oracle timed out after {0} ms")]
    Timeout(u64),
    #[error("oracle transport error: {0}")]
    Transport(String),
    #[error("oracle returned an unusable response: {0}")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_text_is_classified() {
        assert!(GatewayError::from_rejection("order crosses book").is_cross_reject());
        assert!(GatewayError::from_rejection("invalid post-only order").is_cross_reject());
        assert!(!GatewayError::from_rejection("not enough balance").is_cross_reject());
        assert!(GatewayError::Transient("x".into()).is_transient());
    }
}
