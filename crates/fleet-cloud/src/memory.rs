//! In-memory cloud backend
//!
//! Suitable for development and testing. Servers live in a map keyed by
//! instance id; failures can be injected to exercise error paths.

use crate::error::{CloudError, CloudResult};
use crate::manager::{status_matches, CloudRunnerManager};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use fleet_types::{
    CloudRunnerInstance, CloudRunnerStatus, InstanceId, RunnerMetadata, RunnerMetricsArtifacts,
    RunnerRegistration,
};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// In-memory cloud
pub struct InMemoryCloud {
    prefix: String,
    servers: DashMap<InstanceId, CloudRunnerInstance>,
    registrations: DashMap<InstanceId, RunnerRegistration>,
    artifacts: DashMap<InstanceId, RunnerMetricsArtifacts>,
    removal_tokens: DashMap<InstanceId, Option<String>>,
    failing_deletes: DashSet<InstanceId>,
    failing_creates: AtomicUsize,
    next_server: AtomicU64,
}

impl InMemoryCloud {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            servers: DashMap::new(),
            registrations: DashMap::new(),
            artifacts: DashMap::new(),
            removal_tokens: DashMap::new(),
            failing_deletes: DashSet::new(),
            failing_creates: AtomicUsize::new(0),
            next_server: AtomicU64::new(1),
        }
    }

    /// Insert a server directly, bypassing registration
    pub fn insert(&self, instance: CloudRunnerInstance) {
        self.servers.insert(instance.instance_id.clone(), instance);
    }

    /// Change the status of an existing server
    pub fn set_status(&self, instance_id: &InstanceId, status: CloudRunnerStatus) {
        if let Some(mut server) = self.servers.get_mut(instance_id) {
            server.status = status;
        }
    }

    /// Attach metric artifacts to a server
    pub fn set_artifacts(&self, instance_id: &InstanceId, artifacts: RunnerMetricsArtifacts) {
        self.artifacts.insert(instance_id.clone(), artifacts);
    }

    /// Make the next `count` creations fail
    pub fn fail_next_creates(&self, count: usize) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    /// Make deletion of one server fail until cleared
    pub fn fail_delete(&self, instance_id: &InstanceId) {
        self.failing_deletes.insert(instance_id.clone());
    }

    /// Registration the server was created with
    pub fn registration(&self, instance_id: &InstanceId) -> Option<RunnerRegistration> {
        self.registrations.get(instance_id).map(|r| r.clone())
    }

    /// Removal token passed when the server was deleted
    pub fn removal_token(&self, instance_id: &InstanceId) -> Option<Option<String>> {
        self.removal_tokens.get(instance_id).map(|t| t.clone())
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    fn take_create_failure(&self) -> bool {
        self.failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CloudRunnerManager for InMemoryCloud {
    fn name(&self) -> &str {
        "memory"
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn create_runner(
        &self,
        instance_id: &InstanceId,
        metadata: &RunnerMetadata,
        registration: &RunnerRegistration,
    ) -> CloudResult<CloudRunnerInstance> {
        if self.take_create_failure() {
            return Err(CloudError::Api(format!("injected failure creating {}", instance_id)));
        }

        let server_id = format!("server-{}", self.next_server.fetch_add(1, Ordering::SeqCst));
        let instance = CloudRunnerInstance {
            instance_id: instance_id.clone(),
            server_id,
            metadata: metadata.clone(),
            status: CloudRunnerStatus::Active,
            created_at: chrono::Utc::now(),
        };

        self.servers.insert(instance_id.clone(), instance.clone());
        self.registrations
            .insert(instance_id.clone(), registration.clone());

        Ok(instance)
    }

    async fn get_runner(&self, instance_id: &InstanceId) -> CloudResult<Option<CloudRunnerInstance>> {
        Ok(self.servers.get(instance_id).map(|s| s.clone()))
    }

    async fn get_runners(
        &self,
        status_filter: Option<&[CloudRunnerStatus]>,
    ) -> CloudResult<Vec<CloudRunnerInstance>> {
        Ok(self
            .servers
            .iter()
            .filter(|s| s.instance_id.prefix() == self.prefix)
            .filter(|s| status_matches(s.status, status_filter))
            .map(|s| s.value().clone())
            .collect())
    }

    async fn delete_runner(
        &self,
        instance_id: &InstanceId,
        removal_token: Option<&str>,
    ) -> CloudResult<()> {
        if self.failing_deletes.contains(instance_id) {
            return Err(CloudError::Api(format!("injected failure deleting {}", instance_id)));
        }

        if self.servers.remove(instance_id).is_some() {
            self.removal_tokens
                .insert(instance_id.clone(), removal_token.map(str::to_string));
        }
        Ok(())
    }

    async fn extract_metrics(
        &self,
        instance_id: &InstanceId,
    ) -> CloudResult<Option<RunnerMetricsArtifacts>> {
        Ok(self.artifacts.get(instance_id).map(|a| a.clone()))
    }
}
