//! Error types for cloud backends

use thiserror::Error;

/// Cloud backend error
#[derive(Debug, Error)]
pub enum CloudError {
    /// Instance does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Provider API rejected or failed the request
    #[error("Cloud API error: {0}")]
    Api(String),

    /// Instance creation did not finish in time
    #[error("Creating {name} timed out after {timeout_secs}s")]
    CreateTimeout { name: String, timeout_secs: u64 },

    /// Credentials rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Malformed backend configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }
}

/// Result type for cloud operations
pub type CloudResult<T> = Result<T, CloudError>;
