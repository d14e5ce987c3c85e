//! Runner lifecycle across cloud and platform
//!
//! Every runner is a cloud instance plus a platform registration sharing one
//! [`InstanceId`]. The manager joins both views and keeps them consistent:
//! registrations are created before instances and removed after them, so
//! an instance never boots without a registration to pick up.

use crate::error::{ManagerError, ManagerResult};
use crate::metrics::FleetMetrics;
use crate::propagation::MetricsPropagation;
use crate::workers::fan_out;
use fleet_cloud::CloudRunnerManager;
use fleet_platform::PlatformProvider;
use fleet_types::{
    CloudRunnerStatus, InstanceId, PlatformRunnerState, RunnerCondition, RunnerInstance,
    RunnerMetadata,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Runner manager settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Name prefix owned by this manager
    pub prefix: String,

    /// Labels requested for new runners
    pub labels: Vec<String>,

    /// How long a registered runner may stay offline after creation
    pub online_timeout: Duration,

    /// Maximum concurrent per-runner operations
    pub concurrency: usize,
}

impl ManagerConfig {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            labels: Vec::new(),
            online_timeout: Duration::from_secs(600),
            concurrency: 8,
        }
    }

    fn online_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.online_timeout)
            .unwrap_or_else(|_| chrono::Duration::weeks(52))
    }
}

/// Which runners a flush may delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Only runners not running a job
    FlushIdle,
    /// Busy runners too, cancelling their jobs
    FlushBusy,
}

/// Restricts [`RunnerManager::get_runners`]
#[derive(Debug, Clone, Default)]
pub struct RunnerFilter {
    pub platform_states: Option<Vec<PlatformRunnerState>>,
    pub cloud_statuses: Option<Vec<CloudRunnerStatus>>,
}

impl RunnerFilter {
    pub fn all() -> Self {
        Self::default()
    }

    fn matches(&self, runner: &RunnerInstance) -> bool {
        let platform_ok = match &self.platform_states {
            Some(states) => runner
                .platform_state()
                .is_some_and(|state| states.contains(&state)),
            None => true,
        };
        let cloud_ok = match &self.cloud_statuses {
            Some(statuses) => runner
                .cloud
                .as_ref()
                .is_some_and(|cloud| statuses.contains(&cloud.status)),
            None => true,
        };
        platform_ok && cloud_ok
    }
}

/// A per-runner operation that failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerFailure {
    pub instance_id: Option<InstanceId>,
    pub operation: String,
    pub reason: String,
}

impl RunnerFailure {
    fn new(instance_id: Option<InstanceId>, operation: &str, error: &ManagerError) -> Self {
        Self {
            instance_id,
            operation: operation.to_string(),
            reason: error.to_string(),
        }
    }
}

/// Result of [`RunnerManager::create_runners`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateOutcome {
    pub created: Vec<InstanceId>,
    pub failed: Vec<RunnerFailure>,
}

/// Result of [`RunnerManager::delete_runners`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub deleted: Vec<InstanceId>,
    /// Busy runners left alone
    pub skipped: Vec<InstanceId>,
    pub failed: Vec<RunnerFailure>,
}

/// Result of [`RunnerManager::cleanup`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupOutcome {
    /// Unhealthy runners deleted
    pub deleted: Vec<InstanceId>,
    /// Orphaned registrations removed
    pub deregistered: Vec<InstanceId>,
    /// Unregistered instances given a registration
    pub registered: Vec<InstanceId>,
    pub failed: Vec<RunnerFailure>,
}

enum DeleteResult {
    Deleted,
    Busy,
}

/// Creates, lists and deletes runners on both sides
pub struct RunnerManager {
    config: ManagerConfig,
    cloud: Arc<dyn CloudRunnerManager>,
    platform: Arc<dyn PlatformProvider>,
    propagation: Option<Arc<MetricsPropagation>>,
    metrics: Option<FleetMetrics>,
}

impl RunnerManager {
    pub fn new(
        config: ManagerConfig,
        cloud: Arc<dyn CloudRunnerManager>,
        platform: Arc<dyn PlatformProvider>,
    ) -> Self {
        Self {
            config,
            cloud,
            platform,
            propagation: None,
            metrics: None,
        }
    }

    /// Issue metric events for runners before they are deleted
    pub fn with_propagation(mut self, propagation: Arc<MetricsPropagation>) -> Self {
        self.propagation = Some(propagation);
        self
    }

    pub fn with_metrics(mut self, metrics: FleetMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    pub fn cloud(&self) -> &Arc<dyn CloudRunnerManager> {
        &self.cloud
    }

    pub fn platform(&self) -> &Arc<dyn PlatformProvider> {
        &self.platform
    }

    /// Classify a runner as of now
    pub fn classify(&self, runner: &RunnerInstance) -> RunnerCondition {
        runner.condition(self.config.online_timeout(), chrono::Utc::now())
    }

    fn record(&self, operation: &str, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_operation(operation, success);
        }
    }

    /// Joined view of every runner under the prefix, oldest first.
    ///
    /// Health is fetched for runners present on both sides; a runner whose
    /// health cannot be read keeps `health = None`.
    pub async fn get_runners(&self, filter: &RunnerFilter) -> ManagerResult<Vec<RunnerInstance>> {
        let (cloud_runners, platform_runners) = tokio::try_join!(
            async { self.cloud.get_runners(None).await.map_err(ManagerError::from) },
            async {
                self.platform
                    .list_runners(&self.config.prefix)
                    .await
                    .map_err(ManagerError::from)
            },
        )?;

        let mut joined: HashMap<InstanceId, RunnerInstance> = HashMap::new();
        for cloud in cloud_runners {
            joined.insert(
                cloud.instance_id.clone(),
                RunnerInstance {
                    instance_id: cloud.instance_id.clone(),
                    cloud: Some(cloud),
                    platform: None,
                    health: None,
                },
            );
        }
        for platform in platform_runners {
            let instance_id = platform.instance_id.clone();
            let runner = joined
                .entry(instance_id.clone())
                .or_insert_with(|| RunnerInstance {
                    instance_id,
                    cloud: None,
                    platform: None,
                    health: None,
                });
            runner.platform = Some(platform);
        }

        let mut runners: Vec<RunnerInstance> = joined.into_values().collect();
        runners.sort_by(|a, b| {
            let a_created = a.cloud.as_ref().map(|c| c.created_at);
            let b_created = b.cloud.as_ref().map(|c| c.created_at);
            a_created
                .cmp(&b_created)
                .then_with(|| a.name().cmp(&b.name()))
        });

        let probes: Vec<(usize, InstanceId, RunnerMetadata)> = runners
            .iter()
            .enumerate()
            .filter(|(_, runner)| runner.cloud.is_some())
            .filter_map(|(index, runner)| {
                runner.platform.as_ref().map(|platform| {
                    (
                        index,
                        runner.instance_id.clone(),
                        RunnerMetadata::new(platform.platform_name.clone())
                            .with_runner_id(platform.runner_id.clone()),
                    )
                })
            })
            .collect();

        let indices: Vec<usize> = probes.iter().map(|(index, _, _)| *index).collect();
        let platform = self.platform.clone();
        let healths = fan_out(probes, self.config.concurrency, move |(_, id, metadata)| {
            let platform = platform.clone();
            async move {
                platform
                    .get_runner_health(&id, &metadata)
                    .await
                    .map_err(ManagerError::from)
            }
        })
        .await;

        for (index, health) in indices.into_iter().zip(healths) {
            match health {
                Ok(health) => runners[index].health = Some(health),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(
                    runner = %runners[index].instance_id,
                    error = %e,
                    "Failed to read runner health"
                ),
            }
        }

        debug!(count = runners.len(), "Fetched runners");
        Ok(runners.into_iter().filter(|r| filter.matches(r)).collect())
    }

    /// Create `count` runners: register each on the platform, then boot an
    /// instance with the registration.
    ///
    /// A failed instance creation removes its registration again. Failed
    /// runners are reported, not retried. Fatal errors abort the call.
    pub async fn create_runners(
        &self,
        count: usize,
        labels: &[String],
    ) -> ManagerResult<CreateOutcome> {
        let mut outcome = CreateOutcome::default();
        if count == 0 {
            return Ok(outcome);
        }
        info!(count, "Creating runners");

        let cloud = self.cloud.clone();
        let platform = self.platform.clone();
        let prefix = self.config.prefix.clone();
        let labels: Arc<[String]> = labels.into();
        let results = fan_out((0..count).collect(), self.config.concurrency, move |_| {
            create_one(cloud.clone(), platform.clone(), prefix.clone(), labels.clone())
        })
        .await;

        for result in results {
            match result {
                Ok(instance_id) => {
                    self.record("create", true);
                    outcome.created.push(instance_id);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.record("create", false);
                    warn!(error = %e, "Failed to create runner");
                    outcome.failed.push(RunnerFailure::new(None, "create", &e));
                }
            }
        }

        info!(
            created = outcome.created.len(),
            failed = outcome.failed.len(),
            "Runner creation finished"
        );
        Ok(outcome)
    }

    /// Register an existing instance that has no platform registration
    pub async fn register_runner(
        &self,
        instance_id: &InstanceId,
        labels: &[String],
    ) -> ManagerResult<()> {
        let registration = self.platform.register_runner(instance_id, labels).await?;
        info!(
            runner = %instance_id,
            runner_id = %registration.runner_id,
            platform = %registration.platform_name,
            "Registered unregistered runner"
        );
        Ok(())
    }

    /// Delete runners on both sides.
    ///
    /// With [`FlushMode::FlushIdle`] the platform is asked again right
    /// before deletion and runners that picked up a job are skipped.
    pub async fn delete_runners(
        &self,
        runners: Vec<RunnerInstance>,
        mode: FlushMode,
    ) -> ManagerResult<DeleteOutcome> {
        self.delete_with(runners, mode == FlushMode::FlushIdle).await
    }

    async fn delete_with(
        &self,
        runners: Vec<RunnerInstance>,
        skip_busy: bool,
    ) -> ManagerResult<DeleteOutcome> {
        let mut outcome = DeleteOutcome::default();
        let (runners, busy): (Vec<_>, Vec<_>) = runners
            .into_iter()
            .partition(|runner| !(skip_busy && runner.is_busy()));
        outcome
            .skipped
            .extend(busy.into_iter().map(|runner| runner.instance_id));
        if runners.is_empty() {
            return Ok(outcome);
        }

        let removal_token = match self.platform.get_removal_token().await {
            Ok(token) => token,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "No removal token, deleting without one");
                None
            }
        };

        let ids: Vec<InstanceId> = runners.iter().map(|r| r.instance_id.clone()).collect();
        let cloud = self.cloud.clone();
        let platform = self.platform.clone();
        let propagation = self.propagation.clone();
        let results = fan_out(runners, self.config.concurrency, move |runner| {
            delete_one(
                cloud.clone(),
                platform.clone(),
                propagation.clone(),
                runner,
                removal_token.clone(),
                skip_busy,
            )
        })
        .await;

        for (instance_id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(DeleteResult::Deleted) => {
                    self.record("delete", true);
                    outcome.deleted.push(instance_id);
                }
                Ok(DeleteResult::Busy) => outcome.skipped.push(instance_id),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.record("delete", false);
                    warn!(runner = %instance_id, error = %e, "Failed to delete runner");
                    outcome
                        .failed
                        .push(RunnerFailure::new(Some(instance_id), "delete", &e));
                }
            }
        }

        Ok(outcome)
    }

    /// Delete idle runners, and busy ones with [`FlushMode::FlushBusy`]
    pub async fn flush_runners(&self, mode: FlushMode) -> ManagerResult<DeleteOutcome> {
        let runners = self.get_runners(&RunnerFilter::all()).await?;
        let selected: Vec<RunnerInstance> = runners
            .into_iter()
            .filter(|runner| match self.classify(runner) {
                RunnerCondition::Idle => true,
                RunnerCondition::Busy => mode == FlushMode::FlushBusy,
                _ => false,
            })
            .collect();

        info!(count = selected.len(), ?mode, "Flushing runners");
        self.delete_runners(selected, mode).await
    }

    /// Repair a fresh snapshot
    pub async fn cleanup(&self) -> ManagerResult<CleanupOutcome> {
        let runners = self.get_runners(&RunnerFilter::all()).await?;
        self.cleanup_runners(runners).await
    }

    /// Delete unhealthy runners, remove orphaned registrations and register
    /// unregistered instances of a snapshot
    pub async fn cleanup_runners(
        &self,
        runners: Vec<RunnerInstance>,
    ) -> ManagerResult<CleanupOutcome> {
        let mut unhealthy = Vec::new();
        let mut orphaned = Vec::new();
        let mut unregistered = Vec::new();
        for runner in runners {
            match self.classify(&runner) {
                RunnerCondition::Unhealthy { reason } => {
                    info!(runner = %runner.instance_id, %reason, "Runner unhealthy");
                    unhealthy.push(runner);
                }
                RunnerCondition::Orphaned => orphaned.push(runner),
                RunnerCondition::Unregistered => unregistered.push(runner.instance_id),
                RunnerCondition::Idle | RunnerCondition::Busy => {}
            }
        }

        let mut outcome = CleanupOutcome::default();

        let deleted = self.delete_with(unhealthy, false).await?;
        outcome.deleted = deleted.deleted;
        outcome.failed.extend(deleted.failed);

        let deregistered = self.delete_with(orphaned, false).await?;
        outcome.deregistered = deregistered.deleted;
        outcome.failed.extend(deregistered.failed);

        for instance_id in unregistered {
            match self.register_runner(&instance_id, &self.config.labels).await {
                Ok(()) => outcome.registered.push(instance_id),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(runner = %instance_id, error = %e, "Failed to register runner");
                    outcome
                        .failed
                        .push(RunnerFailure::new(Some(instance_id), "register", &e));
                }
            }
        }

        Ok(outcome)
    }
}

async fn create_one(
    cloud: Arc<dyn CloudRunnerManager>,
    platform: Arc<dyn PlatformProvider>,
    prefix: String,
    labels: Arc<[String]>,
) -> ManagerResult<InstanceId> {
    let instance_id = InstanceId::build(prefix, false)?;
    let registration = platform.register_runner(&instance_id, &labels).await?;
    let metadata = RunnerMetadata::new(registration.platform_name.clone())
        .with_runner_id(registration.runner_id.clone());

    if let Err(e) = cloud.create_runner(&instance_id, &metadata, &registration).await {
        warn!(runner = %instance_id, error = %e, "Instance creation failed, removing registration");
        if let Err(rollback) = platform.deregister_runner(&instance_id, &metadata).await {
            warn!(runner = %instance_id, error = %rollback, "Failed to remove registration");
        }
        return Err(e.into());
    }

    info!(runner = %instance_id, runner_id = %registration.runner_id, "Runner created");
    Ok(instance_id)
}

async fn delete_one(
    cloud: Arc<dyn CloudRunnerManager>,
    platform: Arc<dyn PlatformProvider>,
    propagation: Option<Arc<MetricsPropagation>>,
    runner: RunnerInstance,
    removal_token: Option<String>,
    skip_busy: bool,
) -> ManagerResult<DeleteResult> {
    let metadata = match (&runner.platform, &runner.cloud) {
        (Some(platform), _) => RunnerMetadata::new(platform.platform_name.clone())
            .with_runner_id(platform.runner_id.clone()),
        (None, Some(cloud)) => cloud.metadata.clone(),
        (None, None) => return Ok(DeleteResult::Deleted),
    };

    if skip_busy && runner.platform.is_some() {
        let health = platform
            .get_runner_health(&runner.instance_id, &metadata)
            .await?;
        if health.busy {
            info!(runner = %runner.instance_id, "Runner became busy, not deleting");
            return Ok(DeleteResult::Busy);
        }
    }

    if runner.cloud.is_some() {
        match cloud.extract_metrics(&runner.instance_id).await {
            Ok(Some(artifacts)) => {
                if let Some(propagation) = &propagation {
                    propagation.propagate(&runner, &artifacts).await;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(runner = %runner.instance_id, error = %e, "Failed to extract metrics"),
        }

        cloud
            .delete_runner(&runner.instance_id, removal_token.as_deref())
            .await?;
    }

    if runner.platform.is_some() || metadata.runner_id.is_some() {
        platform
            .deregister_runner(&runner.instance_id, &metadata)
            .await?;
    }

    info!(runner = %runner.instance_id, "Runner deleted");
    Ok(DeleteResult::Deleted)
}
