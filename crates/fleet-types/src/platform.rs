//! Platform-side runner records

use crate::InstanceId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Runner state as reported by the CI platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlatformRunnerState {
    Busy,
    Idle,
    Offline,
}

impl PlatformRunnerState {
    /// Derive the state from the platform's `online` and `busy` flags.
    ///
    /// A busy runner is always `Busy`: platforms report runners that lost
    /// their connection mid-job as offline while the job still holds them.
    pub fn from_flags(online: bool, busy: bool) -> Self {
        if busy {
            Self::Busy
        } else if online {
            Self::Idle
        } else {
            Self::Offline
        }
    }
}

impl fmt::Display for PlatformRunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Busy => "BUSY",
            Self::Idle => "IDLE",
            Self::Offline => "OFFLINE",
        };
        f.write_str(s)
    }
}

/// A runner registration as seen by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformRunner {
    pub instance_id: InstanceId,

    /// Platform-side runner id
    pub runner_id: String,

    /// Platform provider that reported the runner
    pub platform_name: String,

    pub state: PlatformRunnerState,

    #[serde(default)]
    pub labels: Vec<String>,
}

/// Health of a single registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerHealth {
    pub online: bool,
    pub busy: bool,

    /// The platform no longer needs this runner (job finished or the
    /// registration is gone)
    pub deletable: bool,
}

impl RunnerHealth {
    pub fn state(&self) -> PlatformRunnerState {
        PlatformRunnerState::from_flags(self.online, self.busy)
    }

    /// Health of a registration the platform does not know about
    pub fn gone() -> Self {
        Self {
            online: false,
            busy: false,
            deletable: true,
        }
    }
}

/// Result of registering a runner on the platform
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerRegistration {
    pub runner_id: String,

    /// Platform provider holding the registration
    pub platform_name: String,

    /// Registration token or just-in-time configuration handed to the VM
    pub token: String,
}

impl fmt::Debug for RunnerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerRegistration")
            .field("runner_id", &self.runner_id)
            .field("platform_name", &self.platform_name)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Job metadata fetched from the platform for metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub conclusion: Option<String>,
    pub status: String,
}

impl JobInfo {
    /// Time the job waited for a runner
    pub fn queue_duration(&self) -> chrono::Duration {
        (self.started_at - self.created_at).max(chrono::Duration::zero())
    }
}
