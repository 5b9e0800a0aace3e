//! Search engine error types.
//!
//! Every transport call returns `SearchEngineError`. The variants are split so
//! callers can tell connection-level failures, which are worth retrying, from
//! rejections that will fail the same way again.

use thiserror::Error;

/// Unified errors from destination engine operations.
#[derive(Debug, Clone, Error)]
pub enum SearchEngineError {
    /// Invalid input detected before a request was sent.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// The request never produced a response (refused, reset, DNS, ...).
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The request did not complete within its time budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The engine answered with a 5xx or 429 status.
    #[error("Server error (status {status}): {body}")]
    ServerError { status: u16, body: String },

    /// The engine rejected the request with a 4xx status.
    #[error("Request rejected (status {status}): {body}")]
    Rejected { status: u16, body: String },

    /// Index creation hit an index of the same name.
    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    /// The named index or alias does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Failed to parse a response body.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Failed to serialize a request body.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl SearchEngineError {
    /// Create a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionError(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Create a serialization error.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }

    /// Classify a non-success HTTP status.
    ///
    /// 429 and 5xx become `ServerError`, everything else becomes `Rejected`.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        if status == 429 || status >= 500 {
            Self::ServerError { status, body }
        } else {
            Self::Rejected { status, body }
        }
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_) | Self::Timeout(_) | Self::ServerError { .. }
        )
    }
}
