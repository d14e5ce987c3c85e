//! Task supervision and bounded concurrency
//!
//! [`WorkerGroup`] runs long-lived named tasks and surfaces the first one
//! that fails. [`fan_out`] runs a batch of short per-runner operations with
//! a concurrency limit and returns one result per input, in input order.

use crate::error::{ManagerError, ManagerResult};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinSet;
use tracing::{debug, error};

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked".to_string()
    }
}

/// Supervised set of long-running workers
#[derive(Default)]
pub struct WorkerGroup {
    workers: JoinSet<(String, ManagerResult<()>)>,
}

impl WorkerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a named worker. Panics are caught and reported as faults.
    pub fn spawn<F>(&mut self, name: impl Into<String>, worker: F)
    where
        F: Future<Output = ManagerResult<()>> + Send + 'static,
    {
        let name = name.into();
        debug!(worker = %name, "Spawning worker");
        self.workers.spawn(async move {
            let result = match AssertUnwindSafe(worker).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(ManagerError::Worker {
                    name: name.clone(),
                    reason: panic_message(panic),
                }),
            };
            (name, result)
        });
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait until a worker fails and return its error.
    ///
    /// Workers that finish cleanly are dropped from the group. Returns
    /// `Ok(())` once every worker has finished without a fault.
    pub async fn wait_first_fault(&mut self) -> ManagerResult<()> {
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(worker = %name, "Worker finished"),
                Ok((name, Err(e))) => {
                    error!(worker = %name, error = %e, "Worker failed");
                    return Err(e);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    return Err(ManagerError::Worker {
                        name: "unknown".to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Abort all remaining workers and wait for them to stop
    pub async fn shutdown(&mut self) {
        self.workers.abort_all();
        while self.workers.join_next().await.is_some() {}
    }
}

/// Run `f` over `items` with at most `concurrency` operations in flight.
///
/// The result vector matches `items` one to one. A panicking operation
/// yields an error for its item without affecting the others.
pub async fn fan_out<T, R, F, Fut>(
    items: Vec<T>,
    concurrency: usize,
    f: F,
) -> Vec<ManagerResult<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = ManagerResult<R>> + Send + 'static,
{
    let concurrency = concurrency.max(1);
    let mut results: Vec<Option<ManagerResult<R>>> = items.iter().map(|_| None).collect();
    let mut in_flight = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        while in_flight.len() >= concurrency {
            if let Some(joined) = in_flight.join_next().await {
                store(&mut results, joined);
            }
        }

        let operation = f(item);
        in_flight.spawn(async move {
            let outcome = AssertUnwindSafe(operation).catch_unwind().await;
            (index, outcome)
        });
    }

    while let Some(joined) = in_flight.join_next().await {
        store(&mut results, joined);
    }

    results
        .into_iter()
        .map(|result| {
            result.unwrap_or_else(|| {
                Err(ManagerError::Worker {
                    name: "fan_out".to_string(),
                    reason: "operation was cancelled".to_string(),
                })
            })
        })
        .collect()
}

type Joined<R> = Result<
    (usize, Result<ManagerResult<R>, Box<dyn Any + Send>>),
    tokio::task::JoinError,
>;

fn store<R>(results: &mut [Option<ManagerResult<R>>], joined: Joined<R>) {
    match joined {
        Ok((index, Ok(result))) => results[index] = Some(result),
        Ok((index, Err(panic))) => {
            results[index] = Some(Err(ManagerError::Worker {
                name: "fan_out".to_string(),
                reason: panic_message(panic),
            }))
        }
        Err(e) => error!(error = %e, "Fan-out task did not complete"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let results = fan_out(vec![30u64, 10, 20], 3, |delay| async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(delay)
        })
        .await;

        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![30, 10, 20]);
    }

    #[tokio::test]
    async fn test_fan_out_bounds_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = fan_out((0..10).collect(), 2, |_| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(results.len(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_fan_out_isolates_failures() {
        let results = fan_out(vec![1, 2, 3], 2, |n| async move {
            if n == 2 {
                panic!("runner {} exploded", n);
            }
            if n == 3 {
                return Err(ManagerError::Config("bad".to_string()));
            }
            Ok(n)
        })
        .await;

        assert_eq!(results[0].as_ref().unwrap(), &1);
        assert!(matches!(&results[1], Err(ManagerError::Worker { reason, .. }) if reason.contains("exploded")));
        assert!(matches!(&results[2], Err(ManagerError::Config(_))));
    }

    #[tokio::test]
    async fn test_worker_group_reports_first_fault() {
        let mut group = WorkerGroup::new();
        group.spawn("forever", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        group.spawn("broken", async {
            Err(ManagerError::Config("lost credentials".to_string()))
        });

        let fault = group.wait_first_fault().await.unwrap_err();
        assert!(matches!(fault, ManagerError::Config(_)));

        group.shutdown().await;
        assert!(group.is_empty());
    }

    fn group_should_panic() -> bool {
        true
    }

    #[tokio::test]
    async fn test_worker_group_catches_panics() {
        let mut group = WorkerGroup::new();
        group.spawn("panicky", async {
            if group_should_panic() {
                panic!("boom");
            }
            Ok(())
        });

        let fault = group.wait_first_fault().await.unwrap_err();
        assert!(matches!(fault, ManagerError::Worker { name, .. } if name == "panicky"));
    }

    #[tokio::test]
    async fn test_worker_group_clean_finish() {
        let mut group = WorkerGroup::new();
        group.spawn("once", async { Ok(()) });
        assert!(group.wait_first_fault().await.is_ok());
    }
}
