//! JobManager provider
//!
//! JobManager is a job-dispatch service that hands work to runners it knows
//! by id. It has no removal tokens: deregistration is always done by the
//! fleet manager.

use crate::error::{check, PlatformError, PlatformResult};
use crate::provider::PlatformProvider;
use async_trait::async_trait;
use fleet_types::{
    InstanceId, JobInfo, PlatformRunner, PlatformRunnerState, RunnerHealth, RunnerMetadata,
    RunnerRegistration,
};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

pub const PLATFORM_NAME: &str = "jobmanager";

/// JobManager provider configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct JobManagerConfig {
    /// Base URL of the JobManager service
    pub url: String,

    /// Bearer token, if the service requires one
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl fmt::Debug for JobManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobManagerConfig")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

fn default_request_timeout() -> u64 {
    30
}

impl JobManagerConfig {
    pub fn validate(&self) -> PlatformResult<()> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(PlatformError::Config(format!(
                "jobmanager.url must be an http(s) URL, got '{}'",
                self.url
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    name: String,
    labels: &'a [String],
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    id: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct RunnerList {
    runners: Vec<JobManagerRunner>,
}

#[derive(Debug, Deserialize)]
struct JobManagerRunner {
    id: String,
    name: String,
    online: bool,
    busy: bool,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    online: bool,
    busy: bool,
    #[serde(default)]
    deletable: bool,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    id: String,
    created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    conclusion: Option<String>,
    status: String,
}

/// JobManager provider
pub struct JobManagerPlatform {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl JobManagerPlatform {
    pub fn new(config: JobManagerConfig) -> PlatformResult<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn runner_id<'a>(
        &self,
        instance_id: &InstanceId,
        metadata: &'a RunnerMetadata,
    ) -> PlatformResult<&'a str> {
        metadata.runner_id.as_deref().ok_or_else(|| {
            PlatformError::NotFound(format!("{} has no JobManager runner id", instance_id))
        })
    }
}

#[async_trait]
impl PlatformProvider for JobManagerPlatform {
    fn name(&self) -> &str {
        PLATFORM_NAME
    }

    async fn register_runner(
        &self,
        instance_id: &InstanceId,
        labels: &[String],
    ) -> PlatformResult<RunnerRegistration> {
        let request = RegisterRequest {
            name: instance_id.name(),
            labels,
        };
        let response = self
            .authorized(self.client.post(format!("{}/v1/runners", self.base_url)))
            .json(&request)
            .send()
            .await?;
        let body: RegisterResponse = check(response).await?.json().await?;

        info!(runner = %instance_id, runner_id = %body.id, "Registered JobManager runner");
        Ok(RunnerRegistration {
            runner_id: body.id,
            platform_name: PLATFORM_NAME.to_string(),
            token: body.token,
        })
    }

    async fn list_runners(&self, prefix: &str) -> PlatformResult<Vec<PlatformRunner>> {
        let response = self
            .authorized(self.client.get(format!("{}/v1/runners", self.base_url)))
            .query(&[("prefix", prefix)])
            .send()
            .await?;
        let body: RunnerList = check(response).await?.json().await?;

        Ok(body
            .runners
            .into_iter()
            .filter(|runner| InstanceId::name_has_prefix(prefix, &runner.name))
            .filter_map(|runner| {
                let instance_id = InstanceId::build_from_name(prefix, &runner.name).ok()?;
                Some(PlatformRunner {
                    instance_id,
                    runner_id: runner.id,
                    platform_name: PLATFORM_NAME.to_string(),
                    state: PlatformRunnerState::from_flags(runner.online, runner.busy),
                    labels: runner.labels,
                })
            })
            .collect())
    }

    async fn get_runner_health(
        &self,
        instance_id: &InstanceId,
        metadata: &RunnerMetadata,
    ) -> PlatformResult<RunnerHealth> {
        let Ok(runner_id) = self.runner_id(instance_id, metadata) else {
            return Ok(RunnerHealth::gone());
        };

        let response = self
            .authorized(
                self.client
                    .get(format!("{}/v1/runners/{}/health", self.base_url, runner_id)),
            )
            .send()
            .await?;
        match check(response).await {
            Ok(response) => {
                let health: HealthResponse = response.json().await?;
                Ok(RunnerHealth {
                    online: health.online,
                    busy: health.busy,
                    deletable: health.deletable,
                })
            }
            Err(e) if e.is_not_found() => Ok(RunnerHealth::gone()),
            Err(e) => Err(e),
        }
    }

    async fn get_removal_token(&self) -> PlatformResult<Option<String>> {
        Ok(None)
    }

    async fn deregister_runner(
        &self,
        instance_id: &InstanceId,
        metadata: &RunnerMetadata,
    ) -> PlatformResult<()> {
        let Ok(runner_id) = self.runner_id(instance_id, metadata) else {
            debug!(runner = %instance_id, "No JobManager registration to remove");
            return Ok(());
        };

        let response = self
            .authorized(
                self.client
                    .delete(format!("{}/v1/runners/{}", self.base_url, runner_id)),
            )
            .send()
            .await?;
        match check(response).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_job_info(
        &self,
        _metadata: &RunnerMetadata,
        _repository: &str,
        run_id: &str,
        _runner: &InstanceId,
    ) -> PlatformResult<JobInfo> {
        let response = self
            .authorized(self.client.get(format!("{}/v1/jobs/{}", self.base_url, run_id)))
            .send()
            .await?;
        let job: JobResponse = check(response).await?.json().await?;

        Ok(JobInfo {
            job_id: job.id,
            created_at: job.created_at,
            started_at: job.started_at.unwrap_or(job.created_at),
            conclusion: job.conclusion,
            status: job.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn platform(server: &MockServer) -> JobManagerPlatform {
        JobManagerPlatform::new(JobManagerConfig {
            url: server.uri(),
            token: Some("jm-token".to_string()),
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_non_http_url() {
        let config = JobManagerConfig {
            url: "ftp://jobs".to_string(),
            token: None,
            request_timeout_secs: 5,
        };
        assert!(matches!(config.validate(), Err(PlatformError::Config(_))));
    }

    #[test]
    fn test_config_debug_redacts_token() {
        let config = JobManagerConfig {
            url: "https://jobs.example".to_string(),
            token: Some("jm-secret".to_string()),
            request_timeout_secs: 5,
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("jm-secret"));
        assert!(debug.contains("https://jobs.example"));
    }

    #[tokio::test]
    async fn test_register() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/runners"))
            .and(header("authorization", "Bearer jm-token"))
            .and(body_partial_json(serde_json::json!({"labels": ["gpu"]})))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({"id": "r-17", "token": "boot"})),
            )
            .mount(&server)
            .await;

        let jobmanager = platform(&server);
        let id = InstanceId::build("unit-0", false).unwrap();
        let registration = jobmanager
            .register_runner(&id, &["gpu".to_string()])
            .await
            .unwrap();
        assert_eq!(registration.runner_id, "r-17");
        assert_eq!(registration.platform_name, "jobmanager");
    }

    #[tokio::test]
    async fn test_list_filters_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/runners"))
            .and(query_param("prefix", "unit-0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "runners": [
                    {"id": "1", "name": "unit-0-aaaaaaaaaaaa", "online": true, "busy": true},
                    {"id": "2", "name": "unit-01-bbbbbbbbbbbb", "online": true, "busy": false},
                ],
            })))
            .mount(&server)
            .await;

        let runners = platform(&server).list_runners("unit-0").await.unwrap();
        assert_eq!(runners.len(), 1);
        assert_eq!(runners[0].state, PlatformRunnerState::Busy);
    }

    #[tokio::test]
    async fn test_health_passes_deletable_through() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/runners/r-1/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "online": false, "busy": false, "deletable": true,
            })))
            .mount(&server)
            .await;

        let id = InstanceId::build("unit-0", false).unwrap();
        let metadata = RunnerMetadata::new("jobmanager").with_runner_id("r-1");
        let health = platform(&server)
            .get_runner_health(&id, &metadata)
            .await
            .unwrap();
        assert!(health.deletable);
    }

    #[tokio::test]
    async fn test_health_without_runner_id_is_gone() {
        let server = MockServer::start().await;
        let id = InstanceId::build("unit-0", false).unwrap();
        let health = platform(&server)
            .get_runner_health(&id, &RunnerMetadata::new("jobmanager"))
            .await
            .unwrap();
        assert_eq!(health, RunnerHealth::gone());
    }

    #[tokio::test]
    async fn test_deregister_missing_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/runners/r-9"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let id = InstanceId::build("unit-0", false).unwrap();
        let metadata = RunnerMetadata::new("jobmanager").with_runner_id("r-9");
        assert!(platform(&server).deregister_runner(&id, &metadata).await.is_ok());
    }

    #[tokio::test]
    async fn test_job_info() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/jobs/55"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "55",
                "created_at": "2024-05-01T10:00:00Z",
                "started_at": "2024-05-01T10:01:00Z",
                "status": "completed",
                "conclusion": "success",
            })))
            .mount(&server)
            .await;

        let id = InstanceId::build("unit-0", false).unwrap();
        let job = platform(&server)
            .get_job_info(&RunnerMetadata::new("jobmanager"), "", "55", &id)
            .await
            .unwrap();
        assert_eq!(job.queue_duration(), chrono::Duration::minutes(1));
    }
}
