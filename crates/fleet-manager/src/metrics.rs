//! Prometheus collectors for the runner fleet

use crate::error::ManagerResult;
use fleet_types::{MetricEvent, RunnerCondition};
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

const CONDITIONS: [&str; 5] = ["idle", "busy", "unregistered", "unhealthy", "orphaned"];

/// Collectors registered on a private registry
#[derive(Clone)]
pub struct FleetMetrics {
    registry: Registry,

    /// Runners by condition, as of the last reconcile cycle
    pub runners: IntGaugeVec,

    /// Desired runner count
    pub expected_runners: IntGaugeVec,

    /// Lifecycle operations by outcome
    pub operations_total: IntCounterVec,

    /// Reconcile cycle duration
    pub reconcile_duration_seconds: Histogram,

    /// Metric events written to the event log
    pub events_total: IntCounterVec,

    /// Time jobs waited for a runner
    pub queue_duration_seconds: HistogramVec,

    /// Job execution time
    pub job_duration_seconds: HistogramVec,
}

impl FleetMetrics {
    pub fn new() -> ManagerResult<Self> {
        let registry = Registry::new_custom(Some("fleet".to_string()), None)?;

        let runners = IntGaugeVec::new(
            Opts::new("runners", "Runners by reconciliation condition"),
            &["flavor", "condition"],
        )?;
        registry.register(Box::new(runners.clone()))?;

        let expected_runners = IntGaugeVec::new(
            Opts::new("expected_runners", "Desired number of runners"),
            &["flavor"],
        )?;
        registry.register(Box::new(expected_runners.clone()))?;

        let operations_total = IntCounterVec::new(
            Opts::new("runner_operations_total", "Runner lifecycle operations"),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let reconcile_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("reconcile_duration_seconds", "Reconcile cycle duration")
                .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;

        let events_total = IntCounterVec::new(
            Opts::new("metric_events_total", "Metric events issued"),
            &["event"],
        )?;
        registry.register(Box::new(events_total.clone()))?;

        let queue_duration_seconds = HistogramVec::new(
            HistogramOpts::new("job_queue_duration_seconds", "Time jobs waited for a runner")
                .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0, 1800.0]),
            &["flavor"],
        )?;
        registry.register(Box::new(queue_duration_seconds.clone()))?;

        let job_duration_seconds = HistogramVec::new(
            HistogramOpts::new("job_duration_seconds", "Job execution time").buckets(vec![
                30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0, 21600.0,
            ]),
            &["flavor", "status"],
        )?;
        registry.register(Box::new(job_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            runners,
            expected_runners,
            operations_total,
            reconcile_duration_seconds,
            events_total,
            queue_duration_seconds,
            job_duration_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Count a lifecycle operation
    pub fn record_operation(&self, operation: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.operations_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    /// Replace the per-condition gauges with the latest snapshot
    pub fn set_conditions<'a>(
        &self,
        flavor: &str,
        conditions: impl IntoIterator<Item = &'a RunnerCondition>,
    ) {
        let mut counts = [0i64; CONDITIONS.len()];
        for condition in conditions {
            if let Some(index) = CONDITIONS.iter().position(|c| *c == condition.label()) {
                counts[index] += 1;
            }
        }
        for (label, count) in CONDITIONS.into_iter().zip(counts) {
            self.runners.with_label_values(&[flavor, label]).set(count);
        }
    }

    /// Update collectors derived from a metric event
    pub fn observe_event(&self, event: &MetricEvent) {
        self.events_total.with_label_values(&[event.name()]).inc();
        match event {
            MetricEvent::RunnerStart {
                flavor,
                queue_duration: Some(queue),
                ..
            } => self
                .queue_duration_seconds
                .with_label_values(&[flavor.as_str()])
                .observe(*queue),
            MetricEvent::RunnerStop {
                flavor,
                status,
                job_duration,
                ..
            } => self
                .job_duration_seconds
                .with_label_values(&[flavor.as_str(), status.as_str()])
                .observe(*job_duration),
            MetricEvent::Reconciliation {
                flavor,
                expected_runners,
                duration,
                ..
            } => {
                self.expected_runners
                    .with_label_values(&[flavor.as_str()])
                    .set(*expected_runners as i64);
                self.reconcile_duration_seconds.observe(*duration);
            }
            _ => {}
        }
    }

    /// Export in Prometheus text format
    pub fn export(&self) -> ManagerResult<String> {
        export_metrics(&self.registry)
    }
}

/// Export a registry in Prometheus text format
pub fn export_metrics(registry: &Registry) -> ManagerResult<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
