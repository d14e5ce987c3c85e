//! In-memory platform provider
//!
//! Keeps registrations in a map. Tests drive runner state directly through
//! the helper methods, standing in for runners picking up jobs.

use crate::error::{PlatformError, PlatformResult};
use crate::provider::PlatformProvider;
use async_trait::async_trait;
use dashmap::DashMap;
use fleet_types::{
    InstanceId, JobInfo, PlatformRunner, PlatformRunnerState, RunnerHealth, RunnerMetadata,
    RunnerRegistration,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct Registration {
    runner: PlatformRunner,
    deletable: bool,
}

/// In-memory platform
pub struct InMemoryPlatform {
    name: String,
    registrations: DashMap<InstanceId, Registration>,
    jobs: DashMap<String, JobInfo>,
    deregistered: Mutex<Vec<InstanceId>>,
    failing_registrations: AtomicUsize,
    token_expired: AtomicBool,
    failing_health: AtomicBool,
    next_id: AtomicU64,
}

impl InMemoryPlatform {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registrations: DashMap::new(),
            jobs: DashMap::new(),
            deregistered: Mutex::new(Vec::new()),
            failing_registrations: AtomicUsize::new(0),
            token_expired: AtomicBool::new(false),
            failing_health: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert a registration with no matching cloud instance
    pub fn insert(&self, instance_id: InstanceId, state: PlatformRunnerState) -> String {
        let runner_id = self.next_runner_id();
        self.registrations.insert(
            instance_id.clone(),
            Registration {
                runner: PlatformRunner {
                    instance_id,
                    runner_id: runner_id.clone(),
                    platform_name: self.name.clone(),
                    state,
                    labels: Vec::new(),
                },
                deletable: false,
            },
        );
        runner_id
    }

    /// Set the reported state of a registration
    pub fn set_state(&self, instance_id: &InstanceId, state: PlatformRunnerState) {
        if let Some(mut registration) = self.registrations.get_mut(instance_id) {
            registration.runner.state = state;
        }
    }

    /// Mark a registration as no longer needed
    pub fn set_deletable(&self, instance_id: &InstanceId) {
        if let Some(mut registration) = self.registrations.get_mut(instance_id) {
            registration.deletable = true;
        }
    }

    /// Drop a registration the way the platform does after an ephemeral job
    pub fn remove(&self, instance_id: &InstanceId) {
        self.registrations.remove(instance_id);
    }

    pub fn add_job(&self, run_id: impl Into<String>, job: JobInfo) {
        self.jobs.insert(run_id.into(), job);
    }

    pub fn fail_next_registrations(&self, count: usize) {
        self.failing_registrations.store(count, Ordering::SeqCst);
    }

    /// Make every call fail with a token error
    pub fn expire_token(&self, expired: bool) {
        self.token_expired.store(expired, Ordering::SeqCst);
    }

    pub fn fail_health(&self, failing: bool) {
        self.failing_health.store(failing, Ordering::SeqCst);
    }

    pub fn contains(&self, instance_id: &InstanceId) -> bool {
        self.registrations.contains_key(instance_id)
    }

    /// Instances deregistered so far, in order
    pub fn deregistered(&self) -> Vec<InstanceId> {
        self.deregistered
            .lock()
            .map(|list| list.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    fn next_runner_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn check_token(&self) -> PlatformResult<()> {
        if self.token_expired.load(Ordering::SeqCst) {
            return Err(PlatformError::Token("token expired".to_string()));
        }
        Ok(())
    }

    fn take_registration_failure(&self) -> bool {
        self.failing_registrations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PlatformProvider for InMemoryPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    async fn register_runner(
        &self,
        instance_id: &InstanceId,
        labels: &[String],
    ) -> PlatformResult<RunnerRegistration> {
        self.check_token()?;
        if self.take_registration_failure() {
            return Err(PlatformError::Api(format!(
                "injected failure registering {}",
                instance_id
            )));
        }

        let runner_id = self.next_runner_id();
        self.registrations.insert(
            instance_id.clone(),
            Registration {
                runner: PlatformRunner {
                    instance_id: instance_id.clone(),
                    runner_id: runner_id.clone(),
                    platform_name: self.name.clone(),
                    state: PlatformRunnerState::Idle,
                    labels: labels.to_vec(),
                },
                deletable: false,
            },
        );

        Ok(RunnerRegistration {
            token: format!("jit-{}", runner_id),
            runner_id,
            platform_name: self.name.clone(),
        })
    }

    async fn list_runners(&self, prefix: &str) -> PlatformResult<Vec<PlatformRunner>> {
        self.check_token()?;
        Ok(self
            .registrations
            .iter()
            .filter(|r| r.key().prefix() == prefix)
            .map(|r| r.runner.clone())
            .collect())
    }

    async fn get_runner_health(
        &self,
        instance_id: &InstanceId,
        _metadata: &RunnerMetadata,
    ) -> PlatformResult<RunnerHealth> {
        self.check_token()?;
        if self.failing_health.load(Ordering::SeqCst) {
            return Err(PlatformError::Api(format!(
                "injected failure reading health of {}",
                instance_id
            )));
        }

        Ok(match self.registrations.get(instance_id) {
            Some(registration) => {
                let state = registration.runner.state;
                RunnerHealth {
                    online: state != PlatformRunnerState::Offline,
                    busy: state == PlatformRunnerState::Busy,
                    deletable: registration.deletable,
                }
            }
            None => RunnerHealth::gone(),
        })
    }

    async fn get_removal_token(&self) -> PlatformResult<Option<String>> {
        self.check_token()?;
        Ok(Some(format!("remove-{}", self.name)))
    }

    async fn deregister_runner(
        &self,
        instance_id: &InstanceId,
        _metadata: &RunnerMetadata,
    ) -> PlatformResult<()> {
        self.check_token()?;
        if self.registrations.remove(instance_id).is_some() {
            if let Ok(mut list) = self.deregistered.lock() {
                list.push(instance_id.clone());
            }
        }
        Ok(())
    }

    async fn get_job_info(
        &self,
        _metadata: &RunnerMetadata,
        repository: &str,
        run_id: &str,
        _runner: &InstanceId,
    ) -> PlatformResult<JobInfo> {
        self.check_token()?;
        self.jobs
            .get(run_id)
            .map(|job| job.clone())
            .ok_or_else(|| PlatformError::NotFound(format!("run {} in {}", run_id, repository)))
    }
}
