//! Joined runner view
//!
//! A [`RunnerInstance`] pairs the cloud record and the platform registration
//! that share one [`InstanceId`]. Either side may be missing; the resulting
//! [`RunnerCondition`] tells the reconciler what to do about it.

use crate::{CloudRunnerInstance, InstanceId, PlatformRunner, PlatformRunnerState, RunnerHealth};
use serde::{Deserialize, Serialize};

/// A runner as seen by both the cloud and the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerInstance {
    pub instance_id: InstanceId,

    /// Cloud-side record, absent for orphaned registrations
    pub cloud: Option<CloudRunnerInstance>,

    /// Platform-side record, absent for unregistered instances
    pub platform: Option<PlatformRunner>,

    /// Latest health report, if the platform could be queried
    pub health: Option<RunnerHealth>,
}

/// Reconciliation class of a runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum RunnerCondition {
    /// Registered and waiting for (or starting up for) a job
    Idle,

    /// Running a job
    Busy,

    /// Cloud instance that was never registered on the platform
    Unregistered,

    /// Must be deleted
    Unhealthy { reason: String },

    /// Platform registration without a cloud instance
    Orphaned,
}

impl RunnerCondition {
    /// Whether the runner counts toward the desired population
    pub fn counts_toward_capacity(&self) -> bool {
        matches!(self, Self::Idle | Self::Busy | Self::Unregistered)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Unregistered => "unregistered",
            Self::Unhealthy { .. } => "unhealthy",
            Self::Orphaned => "orphaned",
        }
    }
}

impl RunnerInstance {
    pub fn name(&self) -> String {
        self.instance_id.name()
    }

    /// Effective platform state, preferring the fresher health report
    pub fn platform_state(&self) -> Option<PlatformRunnerState> {
        match (&self.health, &self.platform) {
            (Some(health), Some(_)) => Some(health.state()),
            (None, Some(platform)) => Some(platform.state),
            _ => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.platform_state() == Some(PlatformRunnerState::Busy)
    }

    /// Classify the runner.
    ///
    /// `online_timeout` bounds how long a registered runner may stay offline
    /// after its instance was created.
    pub fn condition(
        &self,
        online_timeout: chrono::Duration,
        now: chrono::DateTime<chrono::Utc>,
    ) -> RunnerCondition {
        let Some(cloud) = &self.cloud else {
            return RunnerCondition::Orphaned;
        };

        if !cloud.status.is_healthy() {
            return RunnerCondition::Unhealthy {
                reason: format!("cloud status {}", cloud.status),
            };
        }

        if self.platform.is_none() {
            // A recorded runner id means the platform knew this runner and
            // dropped it, which is what ephemeral runners do after a job.
            return match &cloud.metadata.runner_id {
                Some(runner_id) => RunnerCondition::Unhealthy {
                    reason: format!("registration {} no longer on platform", runner_id),
                },
                None => RunnerCondition::Unregistered,
            };
        }

        match self.platform_state() {
            Some(PlatformRunnerState::Busy) => return RunnerCondition::Busy,
            Some(PlatformRunnerState::Offline) if now - cloud.created_at > online_timeout => {
                return RunnerCondition::Unhealthy {
                    reason: format!(
                        "not online {}s after creation",
                        online_timeout.num_seconds()
                    ),
                };
            }
            _ => {}
        }

        if self.health.is_some_and(|h| h.deletable) {
            return RunnerCondition::Unhealthy {
                reason: "platform reports runner deletable".to_string(),
            };
        }

        RunnerCondition::Idle
    }
}
