//! Reconciliation loop and scheduler

use crate::config::SchedulerConfig;
use fleet_manager::{
    FlushMode, ManagerResult, ReactiveProcessManager, ReconcileReport, RunnerScaler,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Scheduler state
pub struct Scheduler {
    config: SchedulerConfig,
    scaler: Arc<RunnerScaler>,
    reactive: Option<(Arc<ReactiveProcessManager>, usize)>,
    reconcile_tx: mpsc::Sender<()>,
    running: Arc<RwLock<bool>>,
    stop: Notify,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        config: SchedulerConfig,
        scaler: Arc<RunnerScaler>,
        reactive: Option<(Arc<ReactiveProcessManager>, usize)>,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        // One pending trigger is enough: the cycle it starts sees every change.
        let (reconcile_tx, reconcile_rx) = mpsc::channel(1);

        let scheduler = Arc::new(Self {
            config,
            scaler,
            reactive,
            reconcile_tx,
            running: Arc::new(RwLock::new(false)),
            stop: Notify::new(),
        });

        (scheduler, reconcile_rx)
    }

    pub fn scaler(&self) -> &Arc<RunnerScaler> {
        &self.scaler
    }

    /// Trigger an immediate reconciliation.
    ///
    /// Returns `false` when the loop is no longer listening.
    pub fn trigger_reconcile(&self) -> bool {
        match self.reconcile_tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Run the reconcile loop until stopped.
    ///
    /// Ordinary cycle failures are logged and retried on the next tick. A
    /// fatal error (rejected credentials, bad configuration) ends the loop
    /// and is returned.
    pub async fn start(self: Arc<Self>, mut reconcile_rx: mpsc::Receiver<()>) -> ManagerResult<()> {
        {
            let mut running = self.running.write().await;
            *running = true;
        }

        tracing::info!(
            interval_secs = self.config.reconcile_interval_secs,
            "Scheduler started"
        );

        let mut interval = interval(Duration::from_secs(self.config.reconcile_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = interval.tick() => {}
                Some(_) = reconcile_rx.recv() => {
                    tracing::debug!("Triggered reconciliation");
                }
                _ = self.stop.notified() => break Ok(()),
            }

            if !*self.running.read().await {
                break Ok(());
            }

            match self.run_cycle().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "Reconciliation failed fatally, stopping scheduler");
                    break Err(e);
                }
                Err(e) => tracing::error!(error = %e, "Reconciliation failed"),
            }
        };

        *self.running.write().await = false;
        tracing::info!("Scheduler stopped");
        result
    }

    /// Stop the scheduler
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        self.stop.notify_one();
    }

    /// One reconcile cycle followed by the reactive worker adjustment
    pub async fn run_cycle(&self) -> ManagerResult<ReconcileReport> {
        let report = self.scaler.reconcile().await?;

        if let Some((reactive, processes)) = &self.reactive {
            match reactive.reconcile(*processes).await {
                Ok(0) => {}
                Ok(change) => tracing::info!(change, "Adjusted reactive workers"),
                Err(e) => tracing::warn!(error = %e, "Failed to adjust reactive workers"),
            }
        }

        Ok(report)
    }

    /// Final cleanup when the daemon exits
    pub async fn shutdown(&self) {
        let mode = if self.config.flush_busy_on_shutdown {
            Some(FlushMode::FlushBusy)
        } else if self.config.flush_on_shutdown {
            Some(FlushMode::FlushIdle)
        } else {
            None
        };

        if let Some(mode) = mode {
            match self.scaler.flush(mode).await {
                Ok(outcome) => tracing::info!(
                    ?mode,
                    deleted = outcome.deleted.len(),
                    failed = outcome.failed.len(),
                    "Flushed runners on shutdown"
                ),
                Err(e) => tracing::error!(error = %e, "Failed to flush runners on shutdown"),
            }
        }

        if let Some((reactive, _)) = &self.reactive {
            if let Err(e) = reactive.kill_all().await {
                tracing::warn!(error = %e, "Failed to stop reactive workers");
            }
        }
    }
}
