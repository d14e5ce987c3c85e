//! Cloud capability interface

use crate::error::CloudResult;
use async_trait::async_trait;
use fleet_types::{
    CloudRunnerInstance, CloudRunnerStatus, InstanceId, RunnerMetadata, RunnerMetricsArtifacts,
    RunnerRegistration,
};

/// Provisions and inspects runner virtual machines.
///
/// Implementations only ever see instances whose names carry their own
/// prefix. Creation is not idempotent: a timed out `create_runner` may still
/// produce a server, so callers re-list before retrying.
#[async_trait]
pub trait CloudRunnerManager: Send + Sync {
    /// Backend name used in logs and metrics
    fn name(&self) -> &str;

    /// Runner name prefix owned by this manager
    fn prefix(&self) -> &str;

    /// Create an instance that boots a runner using `registration`
    async fn create_runner(
        &self,
        instance_id: &InstanceId,
        metadata: &RunnerMetadata,
        registration: &RunnerRegistration,
    ) -> CloudResult<CloudRunnerInstance>;

    /// Get one instance, `None` if it does not exist
    async fn get_runner(&self, instance_id: &InstanceId) -> CloudResult<Option<CloudRunnerInstance>>;

    /// List instances, optionally restricted to the given statuses
    async fn get_runners(
        &self,
        status_filter: Option<&[CloudRunnerStatus]>,
    ) -> CloudResult<Vec<CloudRunnerInstance>>;

    /// Delete an instance. Deleting a missing instance succeeds.
    async fn delete_runner(
        &self,
        instance_id: &InstanceId,
        removal_token: Option<&str>,
    ) -> CloudResult<()>;

    /// Delete several instances, reporting each outcome separately
    async fn delete_runners(
        &self,
        instance_ids: &[InstanceId],
        removal_token: Option<&str>,
    ) -> Vec<(InstanceId, CloudResult<()>)> {
        let mut outcomes = Vec::with_capacity(instance_ids.len());
        for instance_id in instance_ids {
            let result = self.delete_runner(instance_id, removal_token).await;
            outcomes.push((instance_id.clone(), result));
        }
        outcomes
    }

    /// Read the metric files a runner left behind
    async fn extract_metrics(
        &self,
        _instance_id: &InstanceId,
    ) -> CloudResult<Option<RunnerMetricsArtifacts>> {
        Ok(None)
    }
}

/// Apply an optional status filter
pub(crate) fn status_matches(
    status: CloudRunnerStatus,
    status_filter: Option<&[CloudRunnerStatus]>,
) -> bool {
    match status_filter {
        Some(statuses) if !statuses.is_empty() => statuses.contains(&status),
        _ => true,
    }
}
