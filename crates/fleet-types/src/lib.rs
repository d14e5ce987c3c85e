//! Fleet Types - Core types for the runner fleet manager
//!
//! The fleet manager keeps a desired number of ephemeral CI runners alive.
//! Every runner exists in two independent systems of record:
//!
//! - **Cloud**: the virtual machine hosting the runner
//! - **Platform**: the CI platform registration (GitHub, JobManager)
//!
//! ## Key Concepts
//!
//! - **InstanceId**: Canonical runner name shared by both sides
//! - **CloudRunnerInstance**: Cloud-side record with a normalized status
//! - **PlatformRunner**: Platform-side registration record
//! - **RunnerInstance**: Joined view classified into a [`RunnerCondition`]
//! - **MetricEvent**: Observability events emitted for finished runners

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod cloud;
pub mod ids;
pub mod metrics;
pub mod platform;
pub mod reactive;
pub mod runner;

// Re-export main types
pub use cloud::{CloudRunnerInstance, CloudRunnerStatus, RunnerMetadata};
pub use ids::{IdentityError, InstanceId, MAX_NAME_LENGTH, SUFFIX_LENGTH};
pub use metrics::{
    CodeInformation, MetricEvent, PostJobMetrics, PostJobStatus, PreJobMetrics,
    RunnerMetricsArtifacts,
};
pub use platform::{
    JobInfo, PlatformRunner, PlatformRunnerState, RunnerHealth, RunnerRegistration,
};
pub use reactive::{ReactiveConfigError, ReactiveProcessConfig, REACTIVE_CONFIG_ENV};
pub use runner::{RunnerCondition, RunnerInstance};
