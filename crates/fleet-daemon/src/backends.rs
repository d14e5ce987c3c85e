//! Construction of cloud, platform and reactive backends from configuration

use crate::config::{CloudConfig, DaemonConfig, LeafPlatformConfig, PlatformConfig};
use crate::error::DaemonResult;
use fleet_cloud::{CloudRunnerManager, InMemoryCloud, OpenStackCloud};
use fleet_manager::{ManagerError, ReactiveProcessManager};
use fleet_platform::{
    GitHubPlatform, InMemoryPlatform, JobManagerPlatform, MultiplexerPlatform, PlatformBackend,
    PlatformEntry, PlatformProvider,
};
use fleet_types::ReactiveProcessConfig;
use std::sync::Arc;

pub fn build_cloud(config: &DaemonConfig) -> DaemonResult<Arc<dyn CloudRunnerManager>> {
    let prefix = config.runner.prefix.clone();
    let cloud: Arc<dyn CloudRunnerManager> = match &config.cloud {
        CloudConfig::Memory => Arc::new(InMemoryCloud::new(prefix)),
        CloudConfig::OpenStack(openstack) => Arc::new(
            OpenStackCloud::new(openstack.clone(), prefix).map_err(ManagerError::from)?,
        ),
    };
    Ok(cloud)
}

fn build_leaf(config: &LeafPlatformConfig) -> DaemonResult<PlatformBackend> {
    let backend = match config {
        LeafPlatformConfig::GitHub(github) => PlatformBackend::GitHub(
            GitHubPlatform::new(github.clone()).map_err(ManagerError::from)?,
        ),
        LeafPlatformConfig::JobManager(jobmanager) => PlatformBackend::JobManager(
            JobManagerPlatform::new(jobmanager.clone()).map_err(ManagerError::from)?,
        ),
    };
    Ok(backend)
}

pub fn build_platform(config: &DaemonConfig) -> DaemonResult<Arc<dyn PlatformProvider>> {
    let platform: Arc<dyn PlatformProvider> = match &config.platform {
        PlatformConfig::Memory => Arc::new(InMemoryPlatform::new("memory")),
        PlatformConfig::GitHub(github) => {
            Arc::new(GitHubPlatform::new(github.clone()).map_err(ManagerError::from)?)
        }
        PlatformConfig::JobManager(jobmanager) => {
            Arc::new(JobManagerPlatform::new(jobmanager.clone()).map_err(ManagerError::from)?)
        }
        PlatformConfig::Multiplexer { platforms } => {
            let entries = platforms
                .iter()
                .map(|platform| {
                    Ok(PlatformEntry::new(
                        build_leaf(&platform.backend)?,
                        platform.labels.iter().cloned(),
                    ))
                })
                .collect::<DaemonResult<Vec<_>>>()?;
            Arc::new(MultiplexerPlatform::new(entries).map_err(ManagerError::from)?)
        }
    };
    Ok(platform)
}

/// Reactive worker supervisor and the number of workers to keep, if enabled
pub fn build_reactive(
    config: &DaemonConfig,
) -> DaemonResult<Option<(Arc<ReactiveProcessManager>, usize)>> {
    let Some(reactive) = &config.reactive else {
        return Ok(None);
    };

    let process_config = ReactiveProcessConfig {
        queue_uri: reactive.queue_uri.clone(),
        queue_name: reactive.queue_name.clone(),
        prefix: config.runner.prefix.clone(),
        cloud: serde_json::to_value(&config.cloud).map_err(ManagerError::from)?,
        platform: serde_json::to_value(&config.platform).map_err(ManagerError::from)?,
        supported_labels: config.runner.labels.clone(),
    };
    let manager =
        ReactiveProcessManager::new(reactive.program.clone(), reactive.args.clone(), &process_config)?;
    Ok(Some((Arc::new(manager), reactive.processes)))
}
