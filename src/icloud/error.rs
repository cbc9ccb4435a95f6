//! Error types for the cloud session boundary.

use thiserror::Error;

/// Errors surfaced by album and photo enumeration.
#[derive(Error, Debug)]
pub enum CloudError {
    /// The remote service could not be reached or answered 5xx.
    #[error("Cloud service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The service answered with an unexpected status code.
    #[error("Cloud API error {code}: {message}")]
    Api { code: u16, message: String },

    /// The response body did not have the expected shape.
    #[error("Malformed cloud response: {0}")]
    Protocol(String),

    /// The session is not authenticated for this operation.
    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),
}

impl From<reqwest::Error> for CloudError {
    fn from(e: reqwest::Error) -> Self {
        Self::ServiceUnavailable(e.to_string())
    }
}

/// Errors surfaced by byte downloads.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// The remote id is unknown or the object is gone.
    #[error("Remote photo not found: {0}")]
    NotFound(String),

    /// The remote service could not be reached mid-download.
    #[error("Cloud service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The stream ended before the advertised size was reached.
    #[error("Download truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    /// Local filesystem failure while persisting bytes.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
