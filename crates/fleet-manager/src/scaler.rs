//! Reconcile cycles
//!
//! A cycle snapshots the fleet, scales it toward the desired size and
//! repairs whatever is broken. Cycles and operator flushes are serialized by
//! one lock; a caller arriving while a cycle runs waits for it and then
//! works on a fresh snapshot.

use crate::error::ManagerResult;
use crate::manager::{DeleteOutcome, FlushMode, RunnerFailure, RunnerFilter, RunnerManager};
use crate::propagation::MetricEventSink;
use chrono::{DateTime, Utc};
use fleet_types::{MetricEvent, RunnerCondition, RunnerInstance};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Reconciler settings
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    /// Desired number of runners
    pub desired: usize,

    /// Runner flavor reported in metric events
    pub flavor: String,

    /// File rewritten with the id of every finished cycle
    pub cycle_id_path: Option<PathBuf>,
}

/// Whether a cycle is in progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReconcileState {
    Idle,
    Running {
        cycle_id: Uuid,
        started_at: DateTime<Utc>,
    },
}

/// Summary of one finished cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub desired: usize,

    /// Runners to add (positive) or remove (negative)
    pub delta: i64,

    pub idle: usize,
    pub busy: usize,
    pub unregistered: usize,
    pub unhealthy: usize,
    pub orphaned: usize,

    pub created: usize,
    pub deleted: usize,
    pub registered: usize,
    pub deregistered: usize,
    pub failures: Vec<RunnerFailure>,
}

#[derive(Debug, Default)]
struct Counts {
    idle: usize,
    busy: usize,
    unregistered: usize,
    unhealthy: usize,
    orphaned: usize,
}

impl Counts {
    fn capacity(&self) -> usize {
        self.idle + self.busy + self.unregistered
    }
}

/// Marks the scaler idle again when a cycle ends, including on error
struct RunningGuard<'a> {
    state: &'a RwLock<ReconcileState>,
}

impl<'a> RunningGuard<'a> {
    fn enter(
        state: &'a RwLock<ReconcileState>,
        cycle_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Self {
        *state.write().unwrap_or_else(PoisonError::into_inner) =
            ReconcileState::Running { cycle_id, started_at };
        Self { state }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = ReconcileState::Idle;
    }
}

/// Drives the fleet toward the desired size
pub struct RunnerScaler {
    manager: Arc<RunnerManager>,
    config: ScalerConfig,
    sink: Option<Arc<MetricEventSink>>,
    lock: Mutex<()>,
    state: RwLock<ReconcileState>,
    last_report: RwLock<Option<ReconcileReport>>,
}

impl RunnerScaler {
    pub fn new(manager: Arc<RunnerManager>, config: ScalerConfig) -> Self {
        Self {
            manager,
            config,
            sink: None,
            lock: Mutex::new(()),
            state: RwLock::new(ReconcileState::Idle),
            last_report: RwLock::new(None),
        }
    }

    /// Emit a `Reconciliation` event after every cycle
    pub fn with_sink(mut self, sink: Arc<MetricEventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn manager(&self) -> &Arc<RunnerManager> {
        &self.manager
    }

    pub fn desired(&self) -> usize {
        self.config.desired
    }

    pub fn state(&self) -> ReconcileState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_report(&self) -> Option<ReconcileReport> {
        self.last_report
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one cycle. Waits for a cycle already in progress.
    pub async fn reconcile(&self) -> ManagerResult<ReconcileReport> {
        let _lock = self.lock.lock().await;
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let _running = RunningGuard::enter(&self.state, cycle_id, started_at);
        info!(%cycle_id, desired = self.config.desired, "Reconcile cycle started");

        let runners = self.manager.get_runners(&RunnerFilter::all()).await?;
        let mut counts = Counts::default();
        let mut conditions = Vec::with_capacity(runners.len());
        let mut idle = Vec::new();
        let mut repairs = Vec::new();
        for runner in runners {
            let condition = self.manager.classify(&runner);
            match &condition {
                RunnerCondition::Idle => counts.idle += 1,
                RunnerCondition::Busy => counts.busy += 1,
                RunnerCondition::Unregistered => counts.unregistered += 1,
                RunnerCondition::Unhealthy { .. } => counts.unhealthy += 1,
                RunnerCondition::Orphaned => counts.orphaned += 1,
            }
            match &condition {
                RunnerCondition::Idle => idle.push(runner),
                RunnerCondition::Busy => {}
                _ => repairs.push(runner),
            }
            conditions.push(condition);
        }

        let delta = self.config.desired as i64 - counts.capacity() as i64;
        info!(
            %cycle_id,
            idle = counts.idle,
            busy = counts.busy,
            unregistered = counts.unregistered,
            unhealthy = counts.unhealthy,
            orphaned = counts.orphaned,
            delta,
            "Fleet snapshot"
        );

        let mut failures = Vec::new();
        let mut created = 0;
        let mut deleted = 0;

        if delta > 0 {
            let outcome = self
                .manager
                .create_runners(delta as usize, &self.manager.config().labels)
                .await?;
            created = outcome.created.len();
            failures.extend(outcome.failed);
        } else if delta < 0 {
            let outcome = self.scale_down(idle, delta.unsigned_abs() as usize).await?;
            deleted += outcome.deleted.len();
            failures.extend(outcome.failed);
        }

        let cleanup = self.manager.cleanup_runners(repairs).await?;
        deleted += cleanup.deleted.len();
        failures.extend(cleanup.failed);

        let finished_at = Utc::now();
        let report = ReconcileReport {
            cycle_id,
            started_at,
            finished_at,
            desired: self.config.desired,
            delta,
            idle: counts.idle,
            busy: counts.busy,
            unregistered: counts.unregistered,
            unhealthy: counts.unhealthy,
            orphaned: counts.orphaned,
            created,
            deleted,
            registered: cleanup.registered.len(),
            deregistered: cleanup.deregistered.len(),
            failures,
        };

        self.finish_cycle(&report, &conditions).await;
        info!(
            %cycle_id,
            delta,
            created = report.created,
            deleted = report.deleted,
            failures = report.failures.len(),
            "Reconcile cycle finished"
        );
        Ok(report)
    }

    /// Delete the `count` oldest idle runners
    async fn scale_down(
        &self,
        mut idle: Vec<RunnerInstance>,
        count: usize,
    ) -> ManagerResult<DeleteOutcome> {
        idle.sort_by_key(|runner| runner.cloud.as_ref().map(|c| c.created_at));
        idle.truncate(count);
        info!(count = idle.len(), "Scaling down idle runners");
        self.manager.delete_runners(idle, FlushMode::FlushIdle).await
    }

    async fn finish_cycle(&self, report: &ReconcileReport, conditions: &[RunnerCondition]) {
        if let Some(path) = &self.config.cycle_id_path {
            if let Err(e) = tokio::fs::write(path, report.cycle_id.to_string()).await {
                warn!(path = %path.display(), error = %e, "Failed to write reconcile cycle id");
            }
        }

        if let Some(sink) = &self.sink {
            sink.metrics().set_conditions(&self.config.flavor, conditions);
            let duration =
                (report.finished_at - report.started_at).num_milliseconds() as f64 / 1000.0;
            let event = MetricEvent::Reconciliation {
                timestamp: report.finished_at.timestamp_millis() as f64 / 1000.0,
                flavor: self.config.flavor.clone(),
                crashed_runners: report.unhealthy,
                idle_runners: report.idle,
                active_runners: report.busy,
                expected_runners: report.desired,
                duration,
            };
            if let Err(e) = sink.emit(&event).await {
                warn!(error = %e, "Failed to issue reconciliation event");
            }
        }

        *self
            .last_report
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
    }

    /// Operator flush under the reconcile lock
    pub async fn flush(&self, mode: FlushMode) -> ManagerResult<DeleteOutcome> {
        let _lock = self.lock.lock().await;
        let _running = RunningGuard::enter(&self.state, Uuid::new_v4(), Utc::now());
        self.manager.flush_runners(mode).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use crate::metrics::FleetMetrics;
    use fleet_cloud::{CloudRunnerManager, InMemoryCloud};
    use fleet_platform::InMemoryPlatform;
    use fleet_types::{
        CloudRunnerInstance, CloudRunnerStatus, InstanceId, PlatformRunnerState, RunnerMetadata,
    };

    const PREFIX: &str = "unit-0";

    struct Fleet {
        cloud: Arc<InMemoryCloud>,
        platform: Arc<InMemoryPlatform>,
        manager: Arc<RunnerManager>,
    }

    impl Fleet {
        fn new() -> Self {
            let cloud = Arc::new(InMemoryCloud::new(PREFIX));
            let platform = Arc::new(InMemoryPlatform::new("memory"));
            let manager = Arc::new(RunnerManager::new(
                ManagerConfig::new(PREFIX),
                cloud.clone(),
                platform.clone(),
            ));
            Self {
                cloud,
                platform,
                manager,
            }
        }

        fn scaler(&self, desired: usize) -> RunnerScaler {
            RunnerScaler::new(
                self.manager.clone(),
                ScalerConfig {
                    desired,
                    flavor: "small".to_string(),
                    cycle_id_path: None,
                },
            )
        }

        /// A registered runner created `age_secs` ago
        fn seed(&self, age_secs: i64, state: PlatformRunnerState) -> InstanceId {
            let id = InstanceId::build(PREFIX, false).unwrap();
            let runner_id = self.platform.insert(id.clone(), state);
            self.seed_instance(&id, Some(runner_id), age_secs);
            id
        }

        fn seed_instance(&self, id: &InstanceId, runner_id: Option<String>, age_secs: i64) {
            let mut metadata = RunnerMetadata::new("memory");
            metadata.runner_id = runner_id;
            self.cloud.insert(CloudRunnerInstance {
                instance_id: id.clone(),
                server_id: format!("server-{}", id.suffix()),
                metadata,
                status: CloudRunnerStatus::Active,
                created_at: Utc::now() - chrono::Duration::seconds(age_secs),
            });
        }

        async fn ids(&self) -> Vec<InstanceId> {
            self.cloud
                .get_runners(None)
                .await
                .unwrap()
                .into_iter()
                .map(|r| r.instance_id)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_scale_up_from_empty() {
        let fleet = Fleet::new();
        let report = fleet.scaler(2).reconcile().await.unwrap();

        assert_eq!(report.delta, 2);
        assert_eq!(report.created, 2);
        assert_eq!(fleet.cloud.len(), 2);
        assert_eq!(fleet.platform.len(), 2);
    }

    #[tokio::test]
    async fn test_scale_up_tops_off_existing_runners() {
        let fleet = Fleet::new();
        let existing = vec![
            fleet.seed(30, PlatformRunnerState::Idle),
            fleet.seed(20, PlatformRunnerState::Busy),
            fleet.seed(10, PlatformRunnerState::Idle),
        ];

        let report = fleet.scaler(5).reconcile().await.unwrap();

        assert_eq!(report.delta, 2);
        assert_eq!(report.created, 2);
        assert_eq!(report.deleted, 0);
        assert_eq!(fleet.cloud.len(), 5);
        assert_eq!(fleet.platform.len(), 5);
        let ids = fleet.ids().await;
        assert!(existing.iter().all(|id| ids.contains(id)));
    }

    #[tokio::test]
    async fn test_second_cycle_is_a_no_op() {
        let fleet = Fleet::new();
        let scaler = fleet.scaler(2);
        scaler.reconcile().await.unwrap();

        let report = scaler.reconcile().await.unwrap();
        assert_eq!(report.delta, 0);
        assert_eq!(report.created, 0);
        assert_eq!(report.deleted, 0);
        assert_eq!(report.idle, 2);
        assert_eq!(fleet.cloud.len(), 2);
    }

    #[tokio::test]
    async fn test_scale_down_removes_oldest_idle_and_keeps_busy() {
        let fleet = Fleet::new();
        let oldest = fleet.seed(40, PlatformRunnerState::Idle);
        let busy = fleet.seed(30, PlatformRunnerState::Busy);
        let middle = fleet.seed(20, PlatformRunnerState::Idle);
        let newest = fleet.seed(10, PlatformRunnerState::Idle);

        let report = fleet.scaler(2).reconcile().await.unwrap();

        assert_eq!(report.delta, -2);
        assert_eq!(report.deleted, 2);
        let remaining = fleet.ids().await;
        assert!(remaining.contains(&busy));
        assert!(remaining.contains(&newest));
        assert!(!remaining.contains(&oldest));
        assert!(!remaining.contains(&middle));
        assert!(fleet.platform.contains(&busy));
    }

    #[tokio::test]
    async fn test_scale_down_never_touches_busy_runners() {
        let fleet = Fleet::new();
        let a = fleet.seed(30, PlatformRunnerState::Busy);
        let b = fleet.seed(20, PlatformRunnerState::Busy);

        let report = fleet.scaler(0).reconcile().await.unwrap();

        assert_eq!(report.delta, -2);
        assert_eq!(report.deleted, 0);
        assert_eq!(fleet.ids().await.len(), 2);
        assert!(fleet.platform.contains(&a) && fleet.platform.contains(&b));
    }

    #[tokio::test]
    async fn test_unregistered_instance_gets_registered() {
        let fleet = Fleet::new();
        let id = InstanceId::build(PREFIX, false).unwrap();
        fleet.seed_instance(&id, None, 5);

        let report = fleet.scaler(1).reconcile().await.unwrap();

        assert_eq!(report.unregistered, 1);
        assert_eq!(report.delta, 0);
        assert_eq!(report.registered, 1);
        assert!(fleet.platform.contains(&id));
        assert_eq!(fleet.cloud.len(), 1);
    }

    #[tokio::test]
    async fn test_finished_ephemeral_runner_is_replaced() {
        let fleet = Fleet::new();
        let scaler = fleet.scaler(1);
        scaler.reconcile().await.unwrap();
        let first = fleet.ids().await.remove(0);

        // The platform drops ephemeral registrations once their job is done
        fleet.platform.remove(&first);
        let report = scaler.reconcile().await.unwrap();

        assert_eq!(report.unhealthy, 1);
        assert_eq!(report.created, 1);
        assert_eq!(report.deleted, 1);
        let remaining = fleet.ids().await;
        assert_eq!(remaining.len(), 1);
        assert_ne!(remaining[0], first);
    }

    #[tokio::test]
    async fn test_orphaned_registration_is_removed() {
        let fleet = Fleet::new();
        let orphan = InstanceId::build(PREFIX, false).unwrap();
        fleet.platform.insert(orphan.clone(), PlatformRunnerState::Offline);

        let report = fleet.scaler(0).reconcile().await.unwrap();

        assert_eq!(report.orphaned, 1);
        assert_eq!(report.deregistered, 1);
        assert!(!fleet.platform.contains(&orphan));
    }

    #[tokio::test]
    async fn test_failed_creation_rolls_back_registration() {
        let fleet = Fleet::new();
        fleet.cloud.fail_next_creates(1);

        let report = fleet.scaler(2).reconcile().await.unwrap();

        assert_eq!(report.created, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(fleet.cloud.len(), 1);
        assert_eq!(fleet.platform.len(), 1);
        assert_eq!(fleet.platform.deregistered().len(), 1);
    }

    #[tokio::test]
    async fn test_one_failing_delete_does_not_block_others() {
        let fleet = Fleet::new();
        let stuck = fleet.seed(20, PlatformRunnerState::Idle);
        let broken = fleet.seed(10, PlatformRunnerState::Idle);
        fleet.cloud.set_status(&stuck, CloudRunnerStatus::Error);
        fleet.cloud.set_status(&broken, CloudRunnerStatus::Error);
        fleet.cloud.fail_delete(&stuck);

        let report = fleet.scaler(0).reconcile().await.unwrap();

        assert_eq!(report.unhealthy, 2);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].instance_id.as_ref(), Some(&stuck));
        assert_eq!(fleet.ids().await, vec![stuck]);
    }

    #[tokio::test]
    async fn test_concurrent_cycles_run_one_after_another() {
        let fleet = Fleet::new();
        let scaler = Arc::new(fleet.scaler(3));

        let (first, second) = tokio::join!(
            {
                let scaler = scaler.clone();
                async move { scaler.reconcile().await.unwrap() }
            },
            {
                let scaler = scaler.clone();
                async move { scaler.reconcile().await.unwrap() }
            }
        );

        let mut deltas = vec![first.delta, second.delta];
        deltas.sort();
        assert_eq!(deltas, vec![0, 3]);
        assert_eq!(fleet.cloud.len(), 3);
        assert_eq!(scaler.state(), ReconcileState::Idle);
    }

    #[tokio::test]
    async fn test_expired_token_aborts_cycle() {
        let fleet = Fleet::new();
        fleet.platform.expire_token(true);
        let scaler = fleet.scaler(2);

        let err = scaler.reconcile().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(scaler.state(), ReconcileState::Idle);
        assert!(scaler.last_report().is_none());
    }

    #[tokio::test]
    async fn test_cycle_id_file_and_reconciliation_event() {
        let dir = tempfile::tempdir().unwrap();
        let cycle_path = dir.path().join("cycle-id");
        let events_path = dir.path().join("metrics.log");

        let fleet = Fleet::new();
        let sink = Arc::new(MetricEventSink::new(
            Some(events_path.clone()),
            FleetMetrics::new().unwrap(),
        ));
        let scaler = RunnerScaler::new(
            fleet.manager.clone(),
            ScalerConfig {
                desired: 1,
                flavor: "small".to_string(),
                cycle_id_path: Some(cycle_path.clone()),
            },
        )
        .with_sink(sink);

        let report = scaler.reconcile().await.unwrap();

        let written = tokio::fs::read_to_string(&cycle_path).await.unwrap();
        assert_eq!(written, report.cycle_id.to_string());

        let events = tokio::fs::read_to_string(&events_path).await.unwrap();
        let event: serde_json::Value = serde_json::from_str(events.trim()).unwrap();
        assert_eq!(event["event"], "reconciliation");
        assert_eq!(event["expected_runners"], 1);
    }

    #[tokio::test]
    async fn test_flush_idle_then_busy() {
        let fleet = Fleet::new();
        let busy = fleet.seed(20, PlatformRunnerState::Busy);
        fleet.seed(10, PlatformRunnerState::Idle);
        let scaler = fleet.scaler(2);

        let outcome = scaler.flush(FlushMode::FlushIdle).await.unwrap();
        assert_eq!(outcome.deleted.len(), 1);
        assert_eq!(fleet.ids().await, vec![busy]);

        let outcome = scaler.flush(FlushMode::FlushBusy).await.unwrap();
        assert_eq!(outcome.deleted.len(), 1);
        assert!(fleet.cloud.is_empty());
        assert!(fleet.platform.is_empty());
    }
}
