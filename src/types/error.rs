//! Error types for blob-relay
//!
//! `RelayError` is what request handling produces and maps onto an HTTP
//! status. `FetchError` is what the origin produces; it is `Clone` because a
//! single failed fetch is reported to every waiter that joined it.

use std::time::Duration;

use hyper::StatusCode;

/// Failure of one origin fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("origin returned HTTP {0}")]
    Status(u16),

    #[error("origin transport error: {0}")]
    Transport(String),

    #[error("scratch storage error: {0}")]
    Storage(String),

    #[error("origin sent {received} bytes but declared {declared}")]
    Truncated { declared: u64, received: u64 },

    #[error("origin fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("origin fetch aborted: {0}")]
    Aborted(String),
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Main error type for relay operations
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid content key: {0}")]
    InvalidKey(String),

    #[error("Range not satisfiable for object of {total} bytes")]
    RangeNotSatisfiable { total: u64 },

    #[error("Upstream fetch failed: {0}")]
    UpstreamFetchFailure(#[from] FetchError),

    #[error("Cache entry for {0} points at a missing artifact")]
    CacheDesync(String),

    #[error("Client disconnected mid-transfer")]
    StreamAborted,

    #[error("Metadata resolution failed: {0}")]
    MetadataResolutionFailure(String),

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidKey(_) => StatusCode::BAD_REQUEST,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::UpstreamFetchFailure(_) => StatusCode::BAD_GATEWAY,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            // Desync and aborted streams never reach a client; anything else is ours.
            Self::CacheDesync(_)
            | Self::StreamAborted
            | Self::MetadataResolutionFailure(_)
            | Self::Io(_)
            | Self::Config(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert to status code and body tuple for HTTP response
    pub fn into_status_code_and_body(self) -> (StatusCode, String) {
        let status = self.status_code();
        let body = self.to_string();
        (status, body)
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
