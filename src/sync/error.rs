//! Sync Error Types
//!
//! Errors surfaced to callers of the preference store. They are `Clone`
//! because one batch outcome is delivered to every caller coalesced into it.
//! Malformed server documents never appear here: they are repaired by the
//! normalizer and only logged.

use super::api::SyncApiError;
use super::retry::Retryable;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// Rejected before queueing: wrong shape, not serializable, or too large
    #[error("Invalid preferences payload: {0}")]
    Validation(String),

    #[error("Transport error: {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },

    #[error("Anti-forgery token rejected: {0}")]
    Auth(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Save queue closed before the request settled")]
    QueueClosed,
}

impl SyncError {
    /// Server-supplied wait hint for rate-limited saves
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl Retryable for SyncError {
    fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport { .. } | SyncError::Auth(_))
    }
}

impl From<SyncApiError> for SyncError {
    fn from(e: SyncApiError) -> Self {
        match e {
            SyncApiError::Request(inner) => SyncError::Transport {
                status: inner.status().map(|s| s.as_u16()),
                message: inner.to_string(),
            },
            SyncApiError::Forbidden => SyncError::Auth("server rejected the token".to_string()),
            SyncApiError::Token(msg) => SyncError::Auth(msg),
            SyncApiError::RateLimited { retry_after } => SyncError::RateLimited { retry_after },
            SyncApiError::Server { status, message } => SyncError::Transport {
                status: Some(status),
                message: format!("{}: {}", status, message),
            },
            SyncApiError::InvalidResponse(msg) => SyncError::Transport {
                status: None,
                message: format!("invalid response: {}", msg),
            },
            SyncApiError::InvalidUrl(msg) => SyncError::Validation(msg),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_mapping() {
        let err: SyncError = SyncApiError::Server {
            status: 503,
            message: "maintenance".to_string(),
        }
        .into();
        assert_eq!(
            err,
            SyncError::Transport {
                status: Some(503),
                message: "503: maintenance".to_string()
            }
        );
        assert!(err.is_retryable());

        let err: SyncError = SyncApiError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        }
        .into();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert!(!err.is_retryable());

        let err: SyncError = SyncApiError::Forbidden.into();
        assert!(matches!(err, SyncError::Auth(_)));
    }

    #[test]
    fn test_validation_not_retryable() {
        assert!(!SyncError::Validation("too large".into()).is_retryable());
        assert!(!SyncError::QueueClosed.is_retryable());
    }
}
