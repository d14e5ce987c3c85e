//! Platform capability interface

use crate::error::PlatformResult;
use async_trait::async_trait;
use fleet_types::{
    InstanceId, JobInfo, PlatformRunner, RunnerHealth, RunnerMetadata, RunnerRegistration,
};

/// Manages runner registrations on a CI platform.
///
/// A registration is identified by the platform-side runner id stored in
/// [`RunnerMetadata`]; providers fall back to looking up the runner by name
/// when the id is missing.
#[async_trait]
pub trait PlatformProvider: Send + Sync {
    /// Provider name recorded in [`RunnerMetadata::platform_name`]
    fn name(&self) -> &str;

    /// Register a runner and return the token its VM boots with
    async fn register_runner(
        &self,
        instance_id: &InstanceId,
        labels: &[String],
    ) -> PlatformResult<RunnerRegistration>;

    /// List registrations whose names carry `prefix`
    async fn list_runners(&self, prefix: &str) -> PlatformResult<Vec<PlatformRunner>>;

    /// Health of one registration. A missing registration is reported as
    /// [`RunnerHealth::gone`], not as an error.
    async fn get_runner_health(
        &self,
        instance_id: &InstanceId,
        metadata: &RunnerMetadata,
    ) -> PlatformResult<RunnerHealth>;

    /// Token a VM uses to remove its own registration, if the platform has one
    async fn get_removal_token(&self) -> PlatformResult<Option<String>>;

    /// Remove a registration. Removing a missing registration succeeds.
    async fn deregister_runner(
        &self,
        instance_id: &InstanceId,
        metadata: &RunnerMetadata,
    ) -> PlatformResult<()>;

    /// Job the runner executed within workflow run `run_id`
    async fn get_job_info(
        &self,
        metadata: &RunnerMetadata,
        repository: &str,
        run_id: &str,
        runner: &InstanceId,
    ) -> PlatformResult<JobInfo>;
}
