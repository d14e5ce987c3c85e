//! Metric events for finished runners
//!
//! Before an instance is deleted the manager reads the metric artifacts the
//! runner left behind and turns them into [`MetricEvent`]s. Events are
//! appended to a JSON-lines log and folded into the Prometheus collectors.

use crate::error::ManagerResult;
use crate::metrics::FleetMetrics;
use fleet_platform::PlatformProvider;
use fleet_types::{JobInfo, MetricEvent, RunnerInstance, RunnerMetricsArtifacts};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Destination of metric events
pub struct MetricEventSink {
    path: Option<PathBuf>,
    metrics: FleetMetrics,
    write_lock: Mutex<()>,
}

impl MetricEventSink {
    /// Sink writing to `path`, or only to the collectors when `None`
    pub fn new(path: Option<PathBuf>, metrics: FleetMetrics) -> Self {
        Self {
            path,
            metrics,
            write_lock: Mutex::new(()),
        }
    }

    pub fn metrics(&self) -> &FleetMetrics {
        &self.metrics
    }

    /// Record one event
    pub async fn emit(&self, event: &MetricEvent) -> ManagerResult<()> {
        self.metrics.observe_event(event);

        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(event = event.name(), "Metric event written");
        Ok(())
    }
}

fn unix_seconds(time: chrono::DateTime<chrono::Utc>) -> f64 {
    time.timestamp_millis() as f64 / 1000.0
}

/// Builds and issues runner metric events
pub struct MetricsPropagation {
    flavor: String,
    platform: Arc<dyn PlatformProvider>,
    sink: Arc<MetricEventSink>,
}

impl MetricsPropagation {
    pub fn new(
        flavor: impl Into<String>,
        platform: Arc<dyn PlatformProvider>,
        sink: Arc<MetricEventSink>,
    ) -> Self {
        Self {
            flavor: flavor.into(),
            platform,
            sink,
        }
    }

    pub fn flavor(&self) -> &str {
        &self.flavor
    }

    pub fn sink(&self) -> &Arc<MetricEventSink> {
        &self.sink
    }

    /// Events describing one runner's life.
    ///
    /// `RunnerInstalled` needs the installation timestamp, `RunnerStart` the
    /// pre-job record and `RunnerStop` both job records; whatever is missing
    /// is skipped.
    pub fn build_events(
        &self,
        runner: &RunnerInstance,
        artifacts: &RunnerMetricsArtifacts,
        job_info: Option<&JobInfo>,
    ) -> Vec<MetricEvent> {
        let mut events = Vec::new();
        let created_at = runner.cloud.as_ref().map(|c| unix_seconds(c.created_at));

        if let (Some(installed), Some(created)) = (artifacts.installed_timestamp, created_at) {
            events.push(MetricEvent::RunnerInstalled {
                timestamp: installed,
                flavor: self.flavor.clone(),
                duration: (installed - created).max(0.0),
            });
        }

        let Some(pre_job) = &artifacts.pre_job else {
            return events;
        };

        let ready_at = artifacts.installed_timestamp.or(created_at);
        events.push(MetricEvent::RunnerStart {
            timestamp: pre_job.timestamp,
            flavor: self.flavor.clone(),
            workflow: pre_job.workflow.clone(),
            repo: pre_job.repository.clone(),
            github_event: pre_job.event.clone(),
            idle: ready_at.map_or(0.0, |ready| (pre_job.timestamp - ready).max(0.0)),
            queue_duration: job_info.map(|job| job.queue_duration().num_milliseconds() as f64 / 1000.0),
        });

        if let Some(post_job) = &artifacts.post_job {
            events.push(MetricEvent::RunnerStop {
                timestamp: post_job.timestamp,
                flavor: self.flavor.clone(),
                workflow: pre_job.workflow.clone(),
                repo: pre_job.repository.clone(),
                github_event: pre_job.event.clone(),
                status: post_job.status.as_str().to_string(),
                status_info: post_job.status_info,
                job_duration: (post_job.timestamp - pre_job.timestamp).max(0.0),
                job_conclusion: job_info.and_then(|job| job.conclusion.clone()),
            });
        }

        events
    }

    /// Build the runner's events and write them to the sink.
    ///
    /// Sink failures are logged; the returned events are the ones built.
    pub async fn issue_events(
        &self,
        runner: &RunnerInstance,
        artifacts: &RunnerMetricsArtifacts,
        job_info: Option<&JobInfo>,
    ) -> Vec<MetricEvent> {
        let events = self.build_events(runner, artifacts, job_info);
        for event in &events {
            if let Err(e) = self.sink.emit(event).await {
                warn!(runner = %runner.instance_id, event = event.name(), error = %e, "Failed to issue metric event");
            }
        }
        events
    }

    /// Look up the runner's job on the platform, then issue its events
    pub async fn propagate(
        &self,
        runner: &RunnerInstance,
        artifacts: &RunnerMetricsArtifacts,
    ) -> Vec<MetricEvent> {
        let job_info = match (&artifacts.pre_job, &runner.cloud) {
            (Some(pre_job), Some(cloud)) => match self
                .platform
                .get_job_info(
                    &cloud.metadata,
                    &pre_job.repository,
                    &pre_job.workflow_run_id,
                    &runner.instance_id,
                )
                .await
            {
                Ok(job) => Some(job),
                Err(e) => {
                    debug!(runner = %runner.instance_id, error = %e, "No job information");
                    None
                }
            },
            _ => None,
        };

        self.issue_events(runner, artifacts, job_info.as_ref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_platform::InMemoryPlatform;
    use fleet_types::{
        CloudRunnerInstance, CloudRunnerStatus, CodeInformation, InstanceId, PostJobMetrics,
        PostJobStatus, PreJobMetrics, RunnerMetadata,
    };

    const CREATED: i64 = 1_700_000_000;

    fn runner() -> RunnerInstance {
        let instance_id = InstanceId::build("unit-0", false).unwrap();
        RunnerInstance {
            cloud: Some(CloudRunnerInstance {
                instance_id: instance_id.clone(),
                server_id: "server-1".to_string(),
                metadata: RunnerMetadata::new("memory").with_runner_id("1"),
                status: CloudRunnerStatus::Active,
                created_at: chrono::DateTime::from_timestamp(CREATED, 0).unwrap(),
            }),
            instance_id,
            platform: None,
            health: None,
        }
    }

    fn artifacts() -> RunnerMetricsArtifacts {
        RunnerMetricsArtifacts {
            installed_timestamp: Some(CREATED as f64 + 60.0),
            pre_job: Some(PreJobMetrics {
                timestamp: CREATED as f64 + 100.0,
                workflow: "ci".to_string(),
                workflow_run_id: "1001".to_string(),
                repository: "acme/app".to_string(),
                event: "push".to_string(),
            }),
            post_job: Some(PostJobMetrics {
                timestamp: CREATED as f64 + 400.0,
                status: PostJobStatus::Abnormal,
                status_info: Some(CodeInformation { code: 2 }),
            }),
        }
    }

    fn propagation(path: Option<PathBuf>) -> (Arc<InMemoryPlatform>, MetricsPropagation) {
        let platform = Arc::new(InMemoryPlatform::new("memory"));
        let sink = Arc::new(MetricEventSink::new(path, FleetMetrics::new().unwrap()));
        let propagation = MetricsPropagation::new("small", platform.clone(), sink);
        (platform, propagation)
    }

    #[test]
    fn test_builds_full_event_set() {
        let (_, propagation) = propagation(None);
        let events = propagation.build_events(&runner(), &artifacts(), None);

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], MetricEvent::RunnerInstalled { duration, .. } if duration == 60.0));
        assert!(matches!(
            events[1],
            MetricEvent::RunnerStart { idle, queue_duration: None, .. } if idle == 40.0
        ));
        match &events[2] {
            MetricEvent::RunnerStop {
                status,
                status_info,
                job_duration,
                ..
            } => {
                assert_eq!(status, "abnormal");
                assert_eq!(*status_info, Some(CodeInformation { code: 2 }));
                assert_eq!(*job_duration, 300.0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_runner_that_never_took_a_job() {
        let (_, propagation) = propagation(None);
        let artifacts = RunnerMetricsArtifacts {
            installed_timestamp: Some(CREATED as f64 + 30.0),
            ..Default::default()
        };
        let events = propagation.build_events(&runner(), &artifacts, None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "runner_installed");
    }

    #[tokio::test]
    async fn test_propagate_uses_job_info() {
        let (platform, propagation) = propagation(None);
        let created = chrono::DateTime::from_timestamp(CREATED, 0).unwrap();
        platform.add_job(
            "1001",
            JobInfo {
                job_id: "7".to_string(),
                created_at: created,
                started_at: created + chrono::Duration::seconds(12),
                conclusion: Some("failure".to_string()),
                status: "completed".to_string(),
            },
        );

        let events = propagation.propagate(&runner(), &artifacts()).await;
        assert!(matches!(
            events[1],
            MetricEvent::RunnerStart { queue_duration: Some(q), .. } if q == 12.0
        ));
        assert!(matches!(
            &events[2],
            MetricEvent::RunnerStop { job_conclusion: Some(c), .. } if c == "failure"
        ));
    }

    #[tokio::test]
    async fn test_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events").join("metrics.log");
        let (_, propagation) = propagation(Some(path.clone()));

        propagation.issue_events(&runner(), &artifacts(), None).await;
        propagation.issue_events(&runner(), &artifacts(), None).await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 6);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "runner_installed");
        assert_eq!(first["flavor"], "small");
    }
}
