//! Metric events and the artifacts runners leave behind
//!
//! Runners write small JSON documents before and after a job. The manager
//! collects them before deleting the instance and turns them into
//! [`MetricEvent`]s.

use serde::{Deserialize, Serialize};

/// Written by the runner when a job is picked up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreJobMetrics {
    pub timestamp: f64,
    pub workflow: String,
    pub workflow_run_id: String,
    /// `owner/repo`
    pub repository: String,
    pub event: String,
}

/// How the job ended from the runner's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostJobStatus {
    Normal,
    Abnormal,
    RepoPolicyCheckFailure,
}

impl PostJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Abnormal => "abnormal",
            Self::RepoPolicyCheckFailure => "repo_policy_check_failure",
        }
    }
}

/// Exit information for an abnormal job end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeInformation {
    pub code: i32,
}

/// Written by the runner after the job finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostJobMetrics {
    pub timestamp: f64,
    pub status: PostJobStatus,
    #[serde(default)]
    pub status_info: Option<CodeInformation>,
}

/// Everything read from a runner before it is deleted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerMetricsArtifacts {
    /// Unix timestamp at which runner installation finished
    #[serde(default)]
    pub installed_timestamp: Option<f64>,
    #[serde(default)]
    pub pre_job: Option<PreJobMetrics>,
    #[serde(default)]
    pub post_job: Option<PostJobMetrics>,
}

/// Events written to the metrics log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MetricEvent {
    RunnerInstalled {
        timestamp: f64,
        flavor: String,
        /// Seconds from instance creation to finished installation
        duration: f64,
    },
    RunnerStart {
        timestamp: f64,
        flavor: String,
        workflow: String,
        repo: String,
        github_event: String,
        /// Seconds the runner waited for its job
        idle: f64,
        #[serde(default)]
        queue_duration: Option<f64>,
    },
    RunnerStop {
        timestamp: f64,
        flavor: String,
        workflow: String,
        repo: String,
        github_event: String,
        status: String,
        #[serde(default)]
        status_info: Option<CodeInformation>,
        job_duration: f64,
        #[serde(default)]
        job_conclusion: Option<String>,
    },
    Reconciliation {
        timestamp: f64,
        flavor: String,
        crashed_runners: usize,
        idle_runners: usize,
        active_runners: usize,
        expected_runners: usize,
        duration: f64,
    },
}

impl MetricEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunnerInstalled { .. } => "runner_installed",
            Self::RunnerStart { .. } => "runner_start",
            Self::RunnerStop { .. } => "runner_stop",
            Self::Reconciliation { .. } => "reconciliation",
        }
    }
}
