//! Error types for the profile store client

use thiserror::Error;

/// Profile store client error
#[derive(Debug, Error)]
pub enum StoreError {
    /// HTTP request failed (store unreachable, timeout, connection reset)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Server returned a non-2xx status
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Profile, contract, notification or dispute not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid response from server
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The write queue pump for this partition is gone
    #[error("Write queue closed before the task settled")]
    QueueClosed,
}

impl StoreError {
    /// True for failures caused by the store being unreachable or unhealthy,
    /// as opposed to missing or malformed data.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            StoreError::Http(_) | StoreError::Server { .. } | StoreError::QueueClosed
        )
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
