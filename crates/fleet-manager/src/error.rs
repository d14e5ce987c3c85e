//! Error types for the runner manager

use fleet_cloud::CloudError;
use fleet_platform::PlatformError;
use fleet_types::{IdentityError, ReactiveConfigError};
use thiserror::Error;

/// Runner manager error
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Reactive config error: {0}")]
    Reactive(#[from] ReactiveConfigError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A supervised task failed or panicked
    #[error("Worker {name} failed: {reason}")]
    Worker { name: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ManagerError {
    /// Errors that stop the reconcile loop instead of being retried next cycle
    pub fn is_fatal(&self) -> bool {
        match self {
            ManagerError::Platform(e) => e.is_fatal(),
            ManagerError::Cloud(CloudError::Unauthorized(_) | CloudError::Config(_)) => true,
            ManagerError::Config(_) => true,
            _ => false,
        }
    }
}

/// Result type for manager operations
pub type ManagerResult<T> = Result<T, ManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_errors_are_fatal() {
        let err = ManagerError::from(PlatformError::Token("expired".into()));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_cloud_api_errors_are_retryable() {
        let err = ManagerError::from(CloudError::Api("quota".into()));
        assert!(!err.is_fatal());
    }
}
