//! GitHub Actions provider
//!
//! Runners are registered with just-in-time configurations, so a runner
//! takes exactly one job and the registration disappears afterwards.

use crate::error::{check, PlatformError, PlatformResult};
use crate::provider::PlatformProvider;
use async_trait::async_trait;
use fleet_types::{
    InstanceId, JobInfo, PlatformRunner, PlatformRunnerState, RunnerHealth, RunnerMetadata,
    RunnerRegistration,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

pub const PLATFORM_NAME: &str = "github";
const PAGE_SIZE: u32 = 100;

/// Where runners are registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitHubPath {
    /// Organization-wide runners within a runner group
    Org { org: String },
    /// Repository runners
    Repo { owner: String, repo: String },
}

impl GitHubPath {
    /// Parse `org` or `owner/repo`
    pub fn parse(path: &str) -> PlatformResult<Self> {
        let path = path.trim().trim_matches('/');
        match path.split('/').collect::<Vec<_>>().as_slice() {
            [org] if !org.is_empty() => Ok(Self::Org {
                org: org.to_string(),
            }),
            [owner, repo] if !owner.is_empty() && !repo.is_empty() => Ok(Self::Repo {
                owner: owner.to_string(),
                repo: repo.to_string(),
            }),
            _ => Err(PlatformError::Config(format!(
                "Invalid GitHub path '{}', expected 'org' or 'owner/repo'",
                path
            ))),
        }
    }

    fn runners_url(&self, api_url: &str) -> String {
        match self {
            Self::Org { org } => format!("{}/orgs/{}/actions/runners", api_url, org),
            Self::Repo { owner, repo } => {
                format!("{}/repos/{}/{}/actions/runners", api_url, owner, repo)
            }
        }
    }
}

impl fmt::Display for GitHubPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Org { org } => write!(f, "{}", org),
            Self::Repo { owner, repo } => write!(f, "{}/{}", owner, repo),
        }
    }
}

/// GitHub provider configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    /// Personal access token or app installation token
    pub token: String,

    /// `org` or `owner/repo`
    pub path: String,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Runner group for organization runners
    #[serde(default = "default_runner_group_id")]
    pub runner_group_id: u64,

    #[serde(default = "default_work_folder")]
    pub work_folder: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl fmt::Debug for GitHubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubConfig")
            .field("token", &"<redacted>")
            .field("path", &self.path)
            .field("api_url", &self.api_url)
            .field("runner_group_id", &self.runner_group_id)
            .finish()
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_runner_group_id() -> u64 {
    1
}

fn default_work_folder() -> String {
    "_work".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl GitHubConfig {
    pub fn new(token: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            path: path.into(),
            api_url: default_api_url(),
            runner_group_id: default_runner_group_id(),
            work_folder: default_work_folder(),
            request_timeout_secs: default_request_timeout(),
        }
    }

    pub fn validate(&self) -> PlatformResult<()> {
        if self.token.trim().is_empty() {
            return Err(PlatformError::Config("github.token is empty".to_string()));
        }
        GitHubPath::parse(&self.path)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RunnerList {
    total_count: usize,
    runners: Vec<GitHubRunner>,
}

#[derive(Debug, Deserialize)]
struct GitHubRunner {
    id: u64,
    name: String,
    status: String,
    busy: bool,
    #[serde(default)]
    labels: Vec<GitHubLabel>,
}

impl GitHubRunner {
    fn online(&self) -> bool {
        self.status == "online"
    }
}

#[derive(Debug, Deserialize)]
struct GitHubLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct JitConfigResponse {
    runner: JitRunner,
    encoded_jit_config: String,
}

#[derive(Debug, Deserialize)]
struct JitRunner {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct JobList {
    total_count: usize,
    jobs: Vec<GitHubJob>,
}

#[derive(Debug, Deserialize)]
struct GitHubJob {
    id: u64,
    #[serde(default)]
    runner_name: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    conclusion: Option<String>,
    status: String,
}

/// GitHub Actions provider
pub struct GitHubPlatform {
    client: Client,
    path: GitHubPath,
    runners_url: String,
    api_url: String,
    config: GitHubConfig,
}

impl GitHubPlatform {
    pub fn new(config: GitHubConfig) -> PlatformResult<Self> {
        config.validate()?;
        let path = GitHubPath::parse(&config.path)?;
        let api_url = config.api_url.trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|_| PlatformError::Config("github.token is not a valid header".to_string()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("x-github-api-version", HeaderValue::from_static("2022-11-28"));
        headers.insert(USER_AGENT, HeaderValue::from_static("fleet-manager"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            runners_url: path.runners_url(&api_url),
            path,
            api_url,
            config,
        })
    }

    pub fn path(&self) -> &GitHubPath {
        &self.path
    }

    async fn all_runners(&self) -> PlatformResult<Vec<GitHubRunner>> {
        let mut runners = Vec::new();
        let mut page = 1u32;
        loop {
            let response = self
                .client
                .get(&self.runners_url)
                .query(&[("per_page", PAGE_SIZE), ("page", page)])
                .send()
                .await?;
            let body: RunnerList = check(response).await?.json().await?;
            let fetched = body.runners.len();
            runners.extend(body.runners);

            if fetched == 0 || runners.len() >= body.total_count {
                break;
            }
            page += 1;
        }
        debug!(path = %self.path, count = runners.len(), "Listed GitHub runners");
        Ok(runners)
    }

    /// Resolve the platform-side id, looking the runner up by name if needed
    async fn resolve_runner_id(
        &self,
        instance_id: &InstanceId,
        metadata: &RunnerMetadata,
    ) -> PlatformResult<Option<u64>> {
        if let Some(id) = &metadata.runner_id {
            return id
                .parse()
                .map(Some)
                .map_err(|_| PlatformError::Api(format!("Invalid GitHub runner id '{}'", id)));
        }

        let name = instance_id.name();
        Ok(self
            .all_runners()
            .await?
            .into_iter()
            .find(|runner| runner.name == name)
            .map(|runner| runner.id))
    }
}

#[async_trait]
impl PlatformProvider for GitHubPlatform {
    fn name(&self) -> &str {
        PLATFORM_NAME
    }

    async fn register_runner(
        &self,
        instance_id: &InstanceId,
        labels: &[String],
    ) -> PlatformResult<RunnerRegistration> {
        let body = serde_json::json!({
            "name": instance_id.name(),
            "runner_group_id": self.config.runner_group_id,
            "labels": labels,
            "work_folder": self.config.work_folder,
        });
        let response = self
            .client
            .post(format!("{}/generate-jitconfig", self.runners_url))
            .json(&body)
            .send()
            .await?;
        let jit: JitConfigResponse = check(response).await?.json().await?;

        info!(runner = %instance_id, runner_id = jit.runner.id, "Registered GitHub runner");
        Ok(RunnerRegistration {
            runner_id: jit.runner.id.to_string(),
            platform_name: PLATFORM_NAME.to_string(),
            token: jit.encoded_jit_config,
        })
    }

    async fn list_runners(&self, prefix: &str) -> PlatformResult<Vec<PlatformRunner>> {
        Ok(self
            .all_runners()
            .await?
            .into_iter()
            .filter(|runner| InstanceId::name_has_prefix(prefix, &runner.name))
            .filter_map(|runner| {
                let instance_id = InstanceId::build_from_name(prefix, &runner.name).ok()?;
                Some(PlatformRunner {
                    instance_id,
                    runner_id: runner.id.to_string(),
                    platform_name: PLATFORM_NAME.to_string(),
                    state: PlatformRunnerState::from_flags(runner.online(), runner.busy),
                    labels: runner.labels.into_iter().map(|l| l.name).collect(),
                })
            })
            .collect())
    }

    async fn get_runner_health(
        &self,
        instance_id: &InstanceId,
        metadata: &RunnerMetadata,
    ) -> PlatformResult<RunnerHealth> {
        let Some(runner_id) = self.resolve_runner_id(instance_id, metadata).await? else {
            return Ok(RunnerHealth::gone());
        };

        let response = self
            .client
            .get(format!("{}/{}", self.runners_url, runner_id))
            .send()
            .await?;
        match check(response).await {
            Ok(response) => {
                let runner: GitHubRunner = response.json().await?;
                Ok(RunnerHealth {
                    online: runner.online(),
                    busy: runner.busy,
                    deletable: false,
                })
            }
            Err(e) if e.is_not_found() => Ok(RunnerHealth::gone()),
            Err(e) => Err(e),
        }
    }

    async fn get_removal_token(&self) -> PlatformResult<Option<String>> {
        let response = self
            .client
            .post(format!("{}/remove-token", self.runners_url))
            .send()
            .await?;
        let body: TokenResponse = check(response).await?.json().await?;
        Ok(Some(body.token))
    }

    async fn deregister_runner(
        &self,
        instance_id: &InstanceId,
        metadata: &RunnerMetadata,
    ) -> PlatformResult<()> {
        let Some(runner_id) = self.resolve_runner_id(instance_id, metadata).await? else {
            debug!(runner = %instance_id, "No GitHub registration to remove");
            return Ok(());
        };

        let response = self
            .client
            .delete(format!("{}/{}", self.runners_url, runner_id))
            .send()
            .await?;
        match check(response).await {
            Ok(_) => {
                info!(runner = %instance_id, runner_id, "Removed GitHub registration");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_job_info(
        &self,
        _metadata: &RunnerMetadata,
        repository: &str,
        run_id: &str,
        runner: &InstanceId,
    ) -> PlatformResult<JobInfo> {
        let url = format!(
            "{}/repos/{}/actions/runs/{}/jobs",
            self.api_url,
            repository.trim_matches('/'),
            run_id
        );
        let name = runner.name();
        let mut seen = 0usize;
        let mut page = 1u32;
        loop {
            let response = self
                .client
                .get(&url)
                .query(&[("per_page", PAGE_SIZE), ("page", page)])
                .send()
                .await?;
            let body: JobList = check(response).await?.json().await?;
            seen += body.jobs.len();

            if let Some(job) = body
                .jobs
                .into_iter()
                .find(|job| job.runner_name.as_deref() == Some(name.as_str()))
            {
                return Ok(JobInfo {
                    job_id: job.id.to_string(),
                    created_at: job.created_at,
                    started_at: job.started_at.unwrap_or(job.created_at),
                    conclusion: job.conclusion,
                    status: job.status,
                });
            }

            if seen == 0 || seen >= body.total_count {
                break;
            }
            page += 1;
        }

        Err(PlatformError::NotFound(format!(
            "No job of run {} in {} ran on {}",
            run_id, repository, name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn platform(server: &MockServer, path: &str) -> GitHubPlatform {
        let mut config = GitHubConfig::new("ghp_test", path);
        config.api_url = server.uri();
        GitHubPlatform::new(config).unwrap()
    }

    fn runner_json(id: u64, name: &str, status: &str, busy: bool) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": name,
            "status": status,
            "busy": busy,
            "labels": [{"name": "self-hosted"}, {"name": "x64"}],
        })
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            GitHubPath::parse("canonical").unwrap(),
            GitHubPath::Org {
                org: "canonical".to_string()
            }
        );
        assert_eq!(
            GitHubPath::parse("canonical/fleet").unwrap(),
            GitHubPath::Repo {
                owner: "canonical".to_string(),
                repo: "fleet".to_string()
            }
        );
        assert!(GitHubPath::parse("a/b/c").is_err());
        assert!(GitHubPath::parse("").is_err());
    }

    #[test]
    fn test_config_debug_redacts_token() {
        let config = GitHubConfig::new("ghp_secret", "org");
        assert!(!format!("{:?}", config).contains("ghp_secret"));
    }

    #[tokio::test]
    async fn test_register_uses_jit_config() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orgs/acme/actions/runners/generate-jitconfig"))
            .and(header("authorization", "Bearer ghp_test"))
            .and(body_partial_json(serde_json::json!({
                "runner_group_id": 1,
                "labels": ["x64"],
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "runner": {"id": 77, "name": "unit-0-aaaaaaaaaaaa"},
                "encoded_jit_config": "ZW5jb2RlZA==",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let github = platform(&server, "acme");
        let id = InstanceId::build("unit-0", false).unwrap();
        let registration = github
            .register_runner(&id, &["x64".to_string()])
            .await
            .unwrap();

        assert_eq!(registration.runner_id, "77");
        assert_eq!(registration.platform_name, "github");
        assert_eq!(registration.token, "ZW5jb2RlZA==");
    }

    #[tokio::test]
    async fn test_list_paginates_and_filters_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/fleet/actions/runners"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 3,
                "runners": [
                    runner_json(1, "unit-0-aaaaaaaaaaaa", "online", false),
                    runner_json(2, "other-0-bbbbbbbbbbbb", "online", false),
                ],
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/fleet/actions/runners"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 3,
                "runners": [runner_json(3, "unit-0rcccccccccccc", "offline", true)],
            })))
            .mount(&server)
            .await;

        let github = platform(&server, "acme/fleet");
        let runners = github.list_runners("unit-0").await.unwrap();

        assert_eq!(runners.len(), 2);
        assert_eq!(runners[0].runner_id, "1");
        assert_eq!(runners[0].state, PlatformRunnerState::Idle);
        assert_eq!(runners[0].labels, vec!["self-hosted", "x64"]);
        assert!(runners[1].instance_id.reactive());
        assert_eq!(runners[1].state, PlatformRunnerState::Busy);
    }

    #[tokio::test]
    async fn test_health_of_missing_runner_is_gone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orgs/acme/actions/runners/9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let github = platform(&server, "acme");
        let id = InstanceId::build("unit-0", false).unwrap();
        let metadata = RunnerMetadata::new("github").with_runner_id("9");
        let health = github.get_runner_health(&id, &metadata).await.unwrap();
        assert_eq!(health, RunnerHealth::gone());
    }

    #[tokio::test]
    async fn test_health_reports_busy_offline_runner() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orgs/acme/actions/runners/5"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(runner_json(5, "unit-0-aaaaaaaaaaaa", "offline", true)),
            )
            .mount(&server)
            .await;

        let github = platform(&server, "acme");
        let id = InstanceId::build_from_name("unit-0", "unit-0-aaaaaaaaaaaa").unwrap();
        let metadata = RunnerMetadata::new("github").with_runner_id("5");
        let health = github.get_runner_health(&id, &metadata).await.unwrap();
        assert_eq!(health.state(), PlatformRunnerState::Busy);
        assert!(!health.deletable);
    }

    #[tokio::test]
    async fn test_deregister_missing_runner_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/orgs/acme/actions/runners/9"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let github = platform(&server, "acme");
        let id = InstanceId::build("unit-0", false).unwrap();
        let metadata = RunnerMetadata::new("github").with_runner_id("9");
        assert!(github.deregister_runner(&id, &metadata).await.is_ok());
    }

    #[tokio::test]
    async fn test_deregister_by_name_without_runner_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orgs/acme/actions/runners"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 1,
                "runners": [runner_json(12, "unit-0-aaaaaaaaaaaa", "online", false)],
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/orgs/acme/actions/runners/12"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let github = platform(&server, "acme");
        let id = InstanceId::build_from_name("unit-0", "unit-0-aaaaaaaaaaaa").unwrap();
        github
            .deregister_runner(&id, &RunnerMetadata::new("github"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expired_token_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orgs/acme/actions/runners"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Bad credentials"))
            .mount(&server)
            .await;

        let github = platform(&server, "acme");
        let err = github.list_runners("unit-0").await.unwrap_err();
        assert!(matches!(err, PlatformError::Token(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_rate_limit_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orgs/acme/actions/runners"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("x-ratelimit-remaining", "0")
                    .set_body_string(r#"{"message":"API rate limit exceeded"}"#),
            )
            .mount(&server)
            .await;

        let github = platform(&server, "acme");
        let err = github.list_runners("unit-0").await.unwrap_err();
        assert!(matches!(err, PlatformError::Api(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_secondary_rate_limit_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orgs/acme/actions/runners"))
            .respond_with(ResponseTemplate::new(403).insert_header("retry-after", "60"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/orgs/acme/actions/runners/remove-token"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let github = platform(&server, "acme");
        let err = github.list_runners("unit-0").await.unwrap_err();
        assert!(!err.is_fatal());
        let err = github.get_removal_token().await.unwrap_err();
        assert!(matches!(err, PlatformError::Api(_)));
    }

    #[tokio::test]
    async fn test_forbidden_without_rate_limit_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orgs/acme/actions/runners"))
            .respond_with(
                ResponseTemplate::new(403)
                    .insert_header("x-ratelimit-remaining", "4999")
                    .set_body_string("Resource not accessible by integration"),
            )
            .mount(&server)
            .await;

        let github = platform(&server, "acme");
        let err = github.list_runners("unit-0").await.unwrap_err();
        assert!(matches!(err, PlatformError::Token(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_removal_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orgs/acme/actions/runners/remove-token"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({"token": "AREMOVE"})),
            )
            .mount(&server)
            .await;

        let github = platform(&server, "acme");
        assert_eq!(
            github.get_removal_token().await.unwrap(),
            Some("AREMOVE".to_string())
        );
    }

    #[tokio::test]
    async fn test_job_info_matches_runner_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/app/actions/runs/1001/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "total_count": 2,
                "jobs": [
                    {
                        "id": 1,
                        "runner_name": "somebody-else",
                        "created_at": "2024-05-01T10:00:00Z",
                        "started_at": "2024-05-01T10:00:05Z",
                        "conclusion": "success",
                        "status": "completed",
                    },
                    {
                        "id": 2,
                        "runner_name": "unit-0-aaaaaaaaaaaa",
                        "created_at": "2024-05-01T10:00:00Z",
                        "started_at": "2024-05-01T10:00:30Z",
                        "conclusion": "failure",
                        "status": "completed",
                    },
                ],
            })))
            .mount(&server)
            .await;

        let github = platform(&server, "acme");
        let runner = InstanceId::build_from_name("unit-0", "unit-0-aaaaaaaaaaaa").unwrap();
        let job = github
            .get_job_info(&RunnerMetadata::new("github"), "acme/app", "1001", &runner)
            .await
            .unwrap();

        assert_eq!(job.job_id, "2");
        assert_eq!(job.conclusion.as_deref(), Some("failure"));
        assert_eq!(job.queue_duration(), chrono::Duration::seconds(30));
    }
}
