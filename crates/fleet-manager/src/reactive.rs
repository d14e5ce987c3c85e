//! Reactive runner worker processes
//!
//! Reactive runners are spawned on demand by worker processes that consume
//! a job queue. The manager only keeps the number of worker processes at the
//! requested quantity; each worker reads its configuration from
//! [`REACTIVE_CONFIG_ENV`].

use crate::error::ManagerResult;
use fleet_types::{ReactiveProcessConfig, REACTIVE_CONFIG_ENV};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Keeps a number of reactive worker processes alive
pub struct ReactiveProcessManager {
    program: PathBuf,
    args: Vec<String>,
    env_value: String,
    children: Mutex<Vec<Child>>,
}

impl ReactiveProcessManager {
    pub fn new(
        program: impl Into<PathBuf>,
        args: Vec<String>,
        config: &ReactiveProcessConfig,
    ) -> ManagerResult<Self> {
        Ok(Self {
            program: program.into(),
            args,
            env_value: config.to_env_value()?,
            children: Mutex::new(Vec::new()),
        })
    }

    /// Number of live worker processes
    pub async fn count(&self) -> usize {
        let mut children = self.children.lock().await;
        reap(&mut children);
        children.len()
    }

    /// Spawn or stop workers until `quantity` are running.
    ///
    /// Returns the change in process count.
    pub async fn reconcile(&self, quantity: usize) -> ManagerResult<i64> {
        let mut children = self.children.lock().await;
        reap(&mut children);
        let current = children.len();

        if quantity > current {
            for _ in current..quantity {
                let child = Command::new(&self.program)
                    .args(&self.args)
                    .env(REACTIVE_CONFIG_ENV, &self.env_value)
                    .stdin(Stdio::null())
                    .kill_on_drop(true)
                    .spawn()?;
                info!(pid = child.id(), "Spawned reactive worker");
                children.push(child);
            }
        } else {
            for mut child in children.drain(quantity..) {
                if let Err(e) = child.start_kill() {
                    warn!(pid = child.id(), error = %e, "Failed to stop reactive worker");
                    continue;
                }
                let pid = child.id();
                match child.wait().await {
                    Ok(status) => info!(?pid, %status, "Stopped reactive worker"),
                    Err(e) => warn!(?pid, error = %e, "Failed to reap reactive worker"),
                }
            }
        }

        Ok(quantity as i64 - current as i64)
    }

    /// Stop every worker
    pub async fn kill_all(&self) -> ManagerResult<()> {
        self.reconcile(0).await.map(|_| ())
    }
}

/// Drop workers that exited on their own
fn reap(children: &mut Vec<Child>) {
    children.retain_mut(|child| match child.try_wait() {
        Ok(None) => true,
        Ok(Some(status)) => {
            info!(%status, "Reactive worker exited");
            false
        }
        Err(e) => {
            warn!(error = %e, "Failed to poll reactive worker");
            false
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn config() -> ReactiveProcessConfig {
        ReactiveProcessConfig {
            queue_uri: "mongodb://queue:27017".to_string(),
            queue_name: "small".to_string(),
            prefix: "unit-0".to_string(),
            cloud: serde_json::json!({}),
            platform: serde_json::json!({}),
            supported_labels: vec![],
        }
    }

    #[tokio::test]
    async fn test_reconcile_spawns_and_stops_workers() {
        let manager =
            ReactiveProcessManager::new("sleep", vec!["30".to_string()], &config()).unwrap();

        assert_eq!(manager.reconcile(3).await.unwrap(), 3);
        assert_eq!(manager.count().await, 3);

        assert_eq!(manager.reconcile(1).await.unwrap(), -2);
        assert_eq!(manager.count().await, 1);

        manager.kill_all().await.unwrap();
        assert_eq!(manager.count().await, 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stopped_workers_are_reaped() {
        let manager =
            ReactiveProcessManager::new("sleep", vec!["30".to_string()], &config()).unwrap();
        manager.reconcile(2).await.unwrap();
        let pids: Vec<u32> = manager
            .children
            .lock()
            .await
            .iter()
            .filter_map(|child| child.id())
            .collect();
        assert_eq!(pids.len(), 2);

        manager.kill_all().await.unwrap();
        for pid in pids {
            assert!(!std::path::Path::new(&format!("/proc/{}", pid)).exists());
        }
    }

    #[tokio::test]
    async fn test_exited_workers_are_replaced() {
        let manager = ReactiveProcessManager::new("true", vec![], &config()).unwrap();
        manager.reconcile(2).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        assert_eq!(manager.count().await, 0);
        assert_eq!(manager.reconcile(2).await.unwrap(), 2);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut bad = config();
        bad.queue_uri = String::new();
        assert!(ReactiveProcessManager::new("sleep", vec![], &bad).is_err());
    }
}
