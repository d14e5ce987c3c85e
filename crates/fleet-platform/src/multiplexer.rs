//! Provider multiplexer
//!
//! Lets one fleet serve several platforms. New runners go to the first
//! provider whose labels cover the requested ones; existing runners are
//! routed by the platform name recorded in their metadata.

use crate::error::{PlatformError, PlatformResult};
use crate::github::GitHubPlatform;
use crate::jobmanager::JobManagerPlatform;
use crate::provider::PlatformProvider;
use async_trait::async_trait;
use fleet_types::{
    InstanceId, JobInfo, PlatformRunner, RunnerHealth, RunnerMetadata, RunnerRegistration,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// A concrete platform provider
pub enum PlatformBackend {
    GitHub(GitHubPlatform),
    JobManager(JobManagerPlatform),
    Custom(Arc<dyn PlatformProvider>),
}

impl PlatformBackend {
    pub fn provider(&self) -> &dyn PlatformProvider {
        match self {
            Self::GitHub(github) => github,
            Self::JobManager(jobmanager) => jobmanager,
            Self::Custom(provider) => provider.as_ref(),
        }
    }
}

/// One provider and the labels it serves
pub struct PlatformEntry {
    pub backend: PlatformBackend,
    pub labels: HashSet<String>,
}

impl PlatformEntry {
    pub fn new(backend: PlatformBackend, labels: impl IntoIterator<Item = String>) -> Self {
        Self {
            backend,
            labels: labels.into_iter().collect(),
        }
    }

    fn name(&self) -> &str {
        self.backend.provider().name()
    }

    fn serves(&self, labels: &[String]) -> bool {
        labels.iter().all(|label| self.labels.contains(label))
    }
}

/// Routes calls across several providers. The first entry is the default.
pub struct MultiplexerPlatform {
    entries: Vec<PlatformEntry>,
}

impl MultiplexerPlatform {
    pub fn new(entries: Vec<PlatformEntry>) -> PlatformResult<Self> {
        if entries.is_empty() {
            return Err(PlatformError::Config(
                "multiplexer needs at least one platform".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for entry in &entries {
            if !names.insert(entry.name().to_string()) {
                return Err(PlatformError::Config(format!(
                    "platform '{}' configured twice",
                    entry.name()
                )));
            }
        }

        Ok(Self { entries })
    }

    fn default_entry(&self) -> &PlatformEntry {
        &self.entries[0]
    }

    /// Provider for a new runner with the given labels
    pub fn for_labels(&self, labels: &[String]) -> &dyn PlatformProvider {
        self.entries
            .iter()
            .find(|entry| !labels.is_empty() && entry.serves(labels))
            .unwrap_or_else(|| self.default_entry())
            .backend
            .provider()
    }

    /// Provider holding an existing registration
    pub fn for_metadata(&self, metadata: &RunnerMetadata) -> &dyn PlatformProvider {
        match self
            .entries
            .iter()
            .find(|entry| entry.name() == metadata.platform_name)
        {
            Some(entry) => entry.backend.provider(),
            None => {
                debug!(
                    platform = %metadata.platform_name,
                    "Unknown platform name, using default provider"
                );
                self.default_entry().backend.provider()
            }
        }
    }
}

#[async_trait]
impl PlatformProvider for MultiplexerPlatform {
    fn name(&self) -> &str {
        "multiplexer"
    }

    async fn register_runner(
        &self,
        instance_id: &InstanceId,
        labels: &[String],
    ) -> PlatformResult<RunnerRegistration> {
        self.for_labels(labels)
            .register_runner(instance_id, labels)
            .await
    }

    /// Fails if any provider fails: a partial listing would make missing
    /// registrations look like orphaned or unregistered instances.
    async fn list_runners(&self, prefix: &str) -> PlatformResult<Vec<PlatformRunner>> {
        let listings = futures::future::join_all(
            self.entries
                .iter()
                .map(|entry| entry.backend.provider().list_runners(prefix)),
        )
        .await;

        let mut runners = Vec::new();
        for listing in listings {
            runners.extend(listing?);
        }
        Ok(runners)
    }

    async fn get_runner_health(
        &self,
        instance_id: &InstanceId,
        metadata: &RunnerMetadata,
    ) -> PlatformResult<RunnerHealth> {
        self.for_metadata(metadata)
            .get_runner_health(instance_id, metadata)
            .await
    }

    async fn get_removal_token(&self) -> PlatformResult<Option<String>> {
        self.default_entry()
            .backend
            .provider()
            .get_removal_token()
            .await
    }

    async fn deregister_runner(
        &self,
        instance_id: &InstanceId,
        metadata: &RunnerMetadata,
    ) -> PlatformResult<()> {
        self.for_metadata(metadata)
            .deregister_runner(instance_id, metadata)
            .await
    }

    async fn get_job_info(
        &self,
        metadata: &RunnerMetadata,
        repository: &str,
        run_id: &str,
        runner: &InstanceId,
    ) -> PlatformResult<JobInfo> {
        self.for_metadata(metadata)
            .get_job_info(metadata, repository, run_id, runner)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryPlatform;

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn multiplexer() -> (Arc<InMemoryPlatform>, Arc<InMemoryPlatform>, MultiplexerPlatform) {
        let github = Arc::new(InMemoryPlatform::new("github"));
        let jobmanager = Arc::new(InMemoryPlatform::new("jobmanager"));
        let mux = MultiplexerPlatform::new(vec![
            PlatformEntry::new(
                PlatformBackend::Custom(github.clone()),
                labels(&["x64", "large"]),
            ),
            PlatformEntry::new(
                PlatformBackend::Custom(jobmanager.clone()),
                labels(&["gpu", "x64"]),
            ),
        ])
        .unwrap();
        (github, jobmanager, mux)
    }

    #[tokio::test]
    async fn test_register_routes_by_labels() {
        let (github, jobmanager, mux) = multiplexer();
        let id = InstanceId::build("unit-0", false).unwrap();

        let registration = mux.register_runner(&id, &labels(&["gpu"])).await.unwrap();
        assert_eq!(registration.platform_name, "jobmanager");
        assert!(jobmanager.contains(&id));
        assert!(!github.contains(&id));
    }

    #[tokio::test]
    async fn test_unmatched_labels_use_default() {
        let (github, _, mux) = multiplexer();
        let id = InstanceId::build("unit-0", false).unwrap();

        let registration = mux.register_runner(&id, &labels(&["arm64"])).await.unwrap();
        assert_eq!(registration.platform_name, "github");
        assert!(github.contains(&id));
    }

    #[tokio::test]
    async fn test_deregister_routes_by_metadata() {
        let (github, jobmanager, mux) = multiplexer();
        let id = InstanceId::build("unit-0", false).unwrap();
        jobmanager.register_runner(&id, &[]).await.unwrap();

        mux.deregister_runner(&id, &RunnerMetadata::new("jobmanager"))
            .await
            .unwrap();
        assert_eq!(jobmanager.deregistered(), vec![id]);
        assert!(github.deregistered().is_empty());
    }

    #[tokio::test]
    async fn test_listing_merges_providers() {
        let (github, jobmanager, mux) = multiplexer();
        github
            .register_runner(&InstanceId::build("unit-0", false).unwrap(), &[])
            .await
            .unwrap();
        jobmanager
            .register_runner(&InstanceId::build("unit-0", false).unwrap(), &[])
            .await
            .unwrap();

        assert_eq!(mux.list_runners("unit-0").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_listing_fails_if_any_provider_fails() {
        let (_, jobmanager, mux) = multiplexer();
        jobmanager.expire_token(true);
        assert!(mux.list_runners("unit-0").await.is_err());
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let result = MultiplexerPlatform::new(vec![
            PlatformEntry::new(
                PlatformBackend::Custom(Arc::new(InMemoryPlatform::new("github"))),
                labels(&[]),
            ),
            PlatformEntry::new(
                PlatformBackend::Custom(Arc::new(InMemoryPlatform::new("github"))),
                labels(&[]),
            ),
        ]);
        assert!(matches!(result, Err(PlatformError::Config(_))));
    }
}
