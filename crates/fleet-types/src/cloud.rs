//! Cloud-side runner records
//!
//! Provider status strings are normalized into [`CloudRunnerStatus`] through a
//! total mapping: statuses the manager does not know about become
//! [`CloudRunnerStatus::Unexpected`] instead of failing the listing.

use crate::InstanceId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized status of a runner's virtual machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudRunnerStatus {
    Created,
    Active,
    Deleted,
    Error,
    Stopped,
    Unknown,
    Unexpected,
}

impl CloudRunnerStatus {
    /// Map an OpenStack server status to a runner status. Never fails.
    pub fn from_openstack(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "BUILD" | "REBUILD" => Self::Created,
            "ACTIVE" => Self::Active,
            "ERROR" => Self::Error,
            "STOPPED" | "SHUTOFF" => Self::Stopped,
            "DELETED" | "SOFT_DELETED" => Self::Deleted,
            "UNKNOWN" => Self::Unknown,
            _ => Self::Unexpected,
        }
    }

    /// Whether the instance can still host a working runner
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Created | Self::Active | Self::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Deleted => "deleted",
            Self::Error => "error",
            Self::Stopped => "stopped",
            Self::Unknown => "unknown",
            Self::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for CloudRunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration details stored alongside the cloud instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerMetadata {
    /// Platform provider that owns the registration
    pub platform_name: String,

    /// Platform-side runner id, set once the runner was registered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_id: Option<String>,
}

impl RunnerMetadata {
    pub fn new(platform_name: impl Into<String>) -> Self {
        Self {
            platform_name: platform_name.into(),
            runner_id: None,
        }
    }

    pub fn with_runner_id(mut self, runner_id: impl Into<String>) -> Self {
        self.runner_id = Some(runner_id.into());
        self
    }
}

/// A runner virtual machine as seen by the cloud provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudRunnerInstance {
    pub instance_id: InstanceId,

    /// Provider-specific server id
    pub server_id: String,

    pub metadata: RunnerMetadata,

    pub status: CloudRunnerStatus,

    pub created_at: chrono::DateTime<chrono::Utc>,
}
