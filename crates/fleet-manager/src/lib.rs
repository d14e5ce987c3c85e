//! Fleet Manager - Runner lifecycle and reconciliation
//!
//! The [`RunnerManager`] joins the cloud and platform views of every runner
//! and performs lifecycle operations on both sides. The [`RunnerScaler`]
//! runs reconcile cycles that converge the fleet on the desired size, one
//! cycle at a time under a global lock.
//!
//! ## Components
//!
//! - [`RunnerManager`]: create, list, delete and clean up runners
//! - [`RunnerScaler`]: reconcile cycles and operator flushes
//! - [`MetricsPropagation`]: metric events for finished runners
//! - [`FleetMetrics`]: Prometheus collectors
//! - [`WorkerGroup`] / [`fan_out`]: task supervision and bounded concurrency
//! - [`ReactiveProcessManager`]: reactive runner worker processes

#![deny(unsafe_code)]

pub mod error;
pub mod manager;
pub mod metrics;
pub mod propagation;
pub mod reactive;
pub mod scaler;
pub mod workers;

pub use error::{ManagerError, ManagerResult};
pub use manager::{
    CleanupOutcome, CreateOutcome, DeleteOutcome, FlushMode, ManagerConfig, RunnerFailure,
    RunnerFilter, RunnerManager,
};
pub use metrics::{export_metrics, FleetMetrics};
pub use propagation::{MetricEventSink, MetricsPropagation};
pub use reactive::ReactiveProcessManager;
pub use scaler::{ReconcileReport, ReconcileState, RunnerScaler, ScalerConfig};
pub use workers::{fan_out, WorkerGroup};
