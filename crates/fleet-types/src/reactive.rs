//! Configuration handed to spawned reactive runner processes
//!
//! Reactive runners are created on demand for queued jobs. The process that
//! consumes the job queue receives everything it needs in one JSON document
//! stored in [`REACTIVE_CONFIG_ENV`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable carrying the serialized [`ReactiveProcessConfig`]
pub const REACTIVE_CONFIG_ENV: &str = "FLEET_REACTIVE_CONFIG";

#[derive(Debug, Error)]
pub enum ReactiveConfigError {
    #[error("Environment variable {0} is not set")]
    Missing(&'static str),

    #[error("Invalid reactive process config: {0}")]
    Invalid(String),

    #[error("Malformed reactive process config: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Read-only configuration bundle of one reactive worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactiveProcessConfig {
    /// Message queue connection URI
    pub queue_uri: String,

    /// Queue holding job notifications
    pub queue_name: String,

    /// Runner name prefix of the owning manager
    pub prefix: String,

    /// Cloud backend configuration, opaque to this crate
    pub cloud: serde_json::Value,

    /// Platform backend configuration, opaque to this crate
    pub platform: serde_json::Value,

    /// Labels the spawned runners support
    pub supported_labels: Vec<String>,
}

impl ReactiveProcessConfig {
    pub fn validate(&self) -> Result<(), ReactiveConfigError> {
        if self.queue_uri.trim().is_empty() {
            return Err(ReactiveConfigError::Invalid("queue_uri is empty".to_string()));
        }
        if self.queue_name.trim().is_empty() {
            return Err(ReactiveConfigError::Invalid("queue_name is empty".to_string()));
        }
        if self.prefix.trim().is_empty() {
            return Err(ReactiveConfigError::Invalid("prefix is empty".to_string()));
        }
        Ok(())
    }

    /// Serialize for [`REACTIVE_CONFIG_ENV`]
    pub fn to_env_value(&self) -> Result<String, ReactiveConfigError> {
        self.validate()?;
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_env_value(value: &str) -> Result<Self, ReactiveConfigError> {
        let config: Self = serde_json::from_str(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Read the configuration of the current process
    pub fn from_env() -> Result<Self, ReactiveConfigError> {
        let value = std::env::var(REACTIVE_CONFIG_ENV)
            .map_err(|_| ReactiveConfigError::Missing(REACTIVE_CONFIG_ENV))?;
        Self::from_env_value(&value)
    }
}
