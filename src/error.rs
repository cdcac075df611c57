//! Error taxonomy.
//!
//! Each layer owns one error type and resolves it at its own boundary:
//!
//! - [`ConnectionError`] is consumed by the reconnection policy and only
//!   surfaces to hosts as a `ConnectionState` transition (except
//!   `AuthMissing`, returned directly from `connect`).
//! - [`PresentationError`] never leaves its sink; the dispatcher logs it.
//! - [`ApiError`] bubbles unchanged to callers of the REST-backed operations.
//! - [`CacheError`] covers local persistence; write failures are logged.

use thiserror::Error;

/// Errors produced while establishing or running the push connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// `connect` was called without a usable credential. Not retried.
    #[error("no credential supplied")]
    AuthMissing,
    /// Recoverable transport failure; drives reconnect backoff.
    #[error("transport error: {0}")]
    Transport(String),
    /// The source refused the credential. Terminal for that credential.
    #[error("credential rejected: {0}")]
    AuthRejected(String),
}

impl ConnectionError {
    /// Whether the reconnection policy should retry after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Sink-local presentation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresentationError {
    /// The host denied permission for this sink.
    #[error("permission denied")]
    PermissionDenied,
    /// Audio playback failed (autoplay restrictions, missing device, ...).
    #[error("playback failed: {0}")]
    Playback(String),
    /// Any other sink failure.
    #[error("sink failed: {0}")]
    Sink(String),
}

/// Errors from the REST collaborator.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Fetching preferences failed.
    #[error("failed to fetch preferences: {0}")]
    PreferenceFetch(#[source] Box<ApiError>),
    /// Updating preferences failed.
    #[error("failed to update preferences: {0}")]
    PreferenceUpdate(#[source] Box<ApiError>),
    /// The request could not be sent or the connection broke.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },
    /// The response body did not match the expected shape.
    #[error("unexpected response body: {0}")]
    Decode(String),
    /// A request URL could not be built from the server URL.
    #[error("invalid request URL: {0}")]
    InvalidUrl(String),
    /// The engine has no API client configured.
    #[error("no API client configured")]
    NotConfigured,
}

/// Local cache persistence failures.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Reading or writing the cache file failed.
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// The cache file could not be (de)serialized.
    #[error("cache file is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_are_recoverable() {
        assert!(ConnectionError::Transport("reset".into()).is_recoverable());
        assert!(!ConnectionError::AuthMissing.is_recoverable());
        assert!(!ConnectionError::AuthRejected("401".into()).is_recoverable());
    }

    #[test]
    fn test_preference_errors_wrap_cause() {
        let err = ApiError::PreferenceFetch(Box::new(ApiError::Status {
            status: 503,
            body: "down".into(),
        }));
        assert_eq!(
            err.to_string(),
            "failed to fetch preferences: server returned 503: down"
        );
    }
}
