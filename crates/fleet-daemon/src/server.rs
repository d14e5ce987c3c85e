//! Server setup and lifecycle management

use crate::api::create_router;
use crate::api::rest::state::AppState;
use crate::backends::{build_cloud, build_platform, build_reactive};
use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use crate::scheduler::Scheduler;
use fleet_manager::{
    FleetMetrics, ManagerConfig, ManagerError, MetricEventSink, MetricsPropagation,
    RunnerManager, RunnerScaler, ScalerConfig, WorkerGroup,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// Fleet daemon server
pub struct Server {
    config: DaemonConfig,
    scheduler: Arc<Scheduler>,
    reconcile_rx: mpsc::Receiver<()>,
    metrics: FleetMetrics,
}

impl Server {
    /// Build backends, manager and scheduler from the configuration
    pub fn new(config: DaemonConfig) -> DaemonResult<Self> {
        config.validate().map_err(DaemonError::Config)?;

        let metrics = FleetMetrics::new()?;
        let sink = Arc::new(MetricEventSink::new(
            config.metrics.event_log.clone(),
            metrics.clone(),
        ));

        let cloud = build_cloud(&config)?;
        let platform = build_platform(&config)?;
        let propagation = Arc::new(MetricsPropagation::new(
            config.runner.flavor.clone(),
            platform.clone(),
            sink.clone(),
        ));

        let manager_config = ManagerConfig {
            prefix: config.runner.prefix.clone(),
            labels: config.runner.labels.clone(),
            online_timeout: Duration::from_secs(config.runner.online_timeout_secs),
            concurrency: config.runner.concurrency,
        };
        let manager = Arc::new(
            RunnerManager::new(manager_config, cloud, platform)
                .with_propagation(propagation)
                .with_metrics(metrics.clone()),
        );

        let scaler = Arc::new(
            RunnerScaler::new(
                manager,
                ScalerConfig {
                    desired: config.runner.desired,
                    flavor: config.runner.flavor.clone(),
                    cycle_id_path: config.state.cycle_id_path.clone(),
                },
            )
            .with_sink(sink),
        );

        let reactive = build_reactive(&config)?;
        let (scheduler, reconcile_rx) =
            Scheduler::new(config.scheduler.clone(), scaler, reactive);

        Ok(Self {
            config,
            scheduler,
            reconcile_rx,
            metrics,
        })
    }

    /// Run the server
    pub async fn run(self) -> DaemonResult<()> {
        let addr = self.config.server.listen_addr;

        let state = AppState::new(self.scheduler.clone(), self.metrics.clone());
        let app = create_router(state, self.config.server.enable_cors);

        let listener = TcpListener::bind(addr).await?;

        tracing::info!("Fleet daemon listening on {}", addr);
        tracing::info!(
            prefix = %self.config.runner.prefix,
            desired = self.config.runner.desired,
            "Managing runners"
        );

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut workers = WorkerGroup::new();

        workers.spawn(
            "scheduler",
            self.scheduler.clone().start(self.reconcile_rx),
        );
        workers.spawn("http", async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
                .map_err(ManagerError::from)
        });

        let outcome = tokio::select! {
            result = workers.wait_first_fault() => result.map_err(DaemonError::from),
            _ = shutdown_signal() => Ok(()),
        };

        tracing::info!("Fleet daemon shutting down");

        // Stop scheduler
        self.scheduler.stop().await;
        let _ = shutdown_tx.send(true);
        self.scheduler.shutdown().await;
        workers.shutdown().await;

        outcome
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
