//! OpenStack backend
//!
//! Talks to Keystone v3 for a scoped token and to Nova for servers. Every
//! operation authenticates afresh; no session state is shared between calls.
//!
//! Runners report metrics by printing `FLEET_METRICS <kind> <json>` lines to
//! the serial console, which is read back through `os-getConsoleOutput`
//! before the server is deleted.

use crate::error::{CloudError, CloudResult};
use crate::manager::{status_matches, CloudRunnerManager};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use fleet_types::{
    CloudRunnerInstance, CloudRunnerStatus, InstanceId, PostJobMetrics, PreJobMetrics,
    RunnerMetadata, RunnerMetricsArtifacts, RunnerRegistration,
};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const METRICS_MARKER: &str = "FLEET_METRICS";
const CONSOLE_LINES: u32 = 1000;

/// OpenStack connection and server template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenStackConfig {
    /// Keystone v3 endpoint, e.g. `https://keystone:5000/v3`
    pub auth_url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_domain")]
    pub user_domain_name: String,
    pub project_name: String,
    #[serde(default = "default_domain")]
    pub project_domain_name: String,
    #[serde(default)]
    pub region_name: Option<String>,

    /// Flavor id or name reference
    pub flavor: String,
    /// Image id
    pub image: String,
    /// Network id
    pub network: String,
    #[serde(default)]
    pub key_name: Option<String>,

    /// Upper bound for a single server creation
    #[serde(default = "default_create_timeout")]
    pub create_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_domain() -> String {
    "Default".to_string()
}

fn default_create_timeout() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    60
}

impl OpenStackConfig {
    pub fn validate(&self) -> CloudResult<()> {
        let required = [
            ("auth_url", &self.auth_url),
            ("username", &self.username),
            ("password", &self.password),
            ("project_name", &self.project_name),
            ("flavor", &self.flavor),
            ("image", &self.image),
            ("network", &self.network),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(CloudError::Config(format!("openstack.{} is empty", field)));
            }
        }
        if self.create_timeout_secs == 0 {
            return Err(CloudError::Config(
                "openstack.create_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Authenticated view of the compute API for one operation
struct Session {
    token: String,
    compute_url: String,
}

/// OpenStack cloud backend
pub struct OpenStackCloud {
    client: Client,
    config: OpenStackConfig,
    prefix: String,
}

impl OpenStackCloud {
    pub fn new(config: OpenStackConfig, prefix: impl Into<String>) -> CloudResult<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            config,
            prefix: prefix.into(),
        })
    }

    async fn authenticate(&self) -> CloudResult<Session> {
        let url = format!("{}/auth/tokens", self.config.auth_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": self.config.username,
                            "domain": { "name": self.config.user_domain_name },
                            "password": self.config.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": self.config.project_name,
                        "domain": { "name": self.config.project_domain_name },
                    }
                }
            }
        });

        let response = check(self.client.post(&url).json(&body).send().await?).await?;
        let token = response
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| CloudError::Api("Keystone response lacks X-Subject-Token".to_string()))?;

        let body: TokenResponse = response.json().await?;
        let compute_url = body
            .token
            .catalog
            .iter()
            .filter(|service| service.service_type == "compute")
            .flat_map(|service| service.endpoints.iter())
            .find(|endpoint| {
                endpoint.interface == "public"
                    && self
                        .config
                        .region_name
                        .as_ref()
                        .map_or(true, |region| endpoint.region.as_deref() == Some(region.as_str()))
            })
            .map(|endpoint| endpoint.url.trim_end_matches('/').to_string())
            .ok_or_else(|| CloudError::Config("No public compute endpoint in catalog".to_string()))?;

        Ok(Session { token, compute_url })
    }

    async fn list_servers(&self, session: &Session) -> CloudResult<Vec<Server>> {
        let url = format!("{}/servers/detail", session.compute_url);
        let response = self
            .client
            .get(&url)
            .header("X-Auth-Token", &session.token)
            .query(&[("name", format!("^{}", self.prefix))])
            .send()
            .await?;
        let body: ServerList = check(response).await?.json().await?;
        Ok(body.servers)
    }

    async fn find_server(
        &self,
        session: &Session,
        instance_id: &InstanceId,
    ) -> CloudResult<Option<Server>> {
        let name = instance_id.name();
        Ok(self
            .list_servers(session)
            .await?
            .into_iter()
            .find(|server| server.name == name))
    }

    fn to_instance(&self, server: Server) -> Option<CloudRunnerInstance> {
        if !InstanceId::name_has_prefix(&self.prefix, &server.name) {
            return None;
        }

        let instance_id = match InstanceId::build_from_name(&self.prefix, &server.name) {
            Ok(id) => id,
            Err(e) => {
                warn!(name = %server.name, error = %e, "Skipping server with unparsable name");
                return None;
            }
        };

        let status = CloudRunnerStatus::from_openstack(&server.status);
        if status == CloudRunnerStatus::Unexpected {
            warn!(name = %server.name, status = %server.status, "Server has unexpected status");
        }

        let metadata = RunnerMetadata {
            platform_name: server
                .metadata
                .get("platform_name")
                .cloned()
                .unwrap_or_default(),
            runner_id: server.metadata.get("runner_id").cloned(),
        };

        Some(CloudRunnerInstance {
            instance_id,
            server_id: server.id,
            metadata,
            status,
            created_at: server.created.unwrap_or_else(chrono::Utc::now),
        })
    }

    async fn create_server(
        &self,
        instance_id: &InstanceId,
        metadata: &RunnerMetadata,
        registration: &RunnerRegistration,
    ) -> CloudResult<CloudRunnerInstance> {
        let session = self.authenticate().await?;

        let mut server_metadata = HashMap::new();
        server_metadata.insert("prefix".to_string(), self.prefix.clone());
        server_metadata.insert("platform_name".to_string(), metadata.platform_name.clone());
        if let Some(runner_id) = &metadata.runner_id {
            server_metadata.insert("runner_id".to_string(), runner_id.clone());
        }

        let mut server = serde_json::json!({
            "name": instance_id.name(),
            "flavorRef": self.config.flavor,
            "imageRef": self.config.image,
            "networks": [{ "uuid": self.config.network }],
            "user_data": BASE64.encode(render_user_data(instance_id, registration)),
            "metadata": server_metadata,
        });
        if let Some(key_name) = &self.config.key_name {
            server["key_name"] = serde_json::Value::String(key_name.clone());
        }

        let url = format!("{}/servers", session.compute_url);
        let response = self
            .client
            .post(&url)
            .header("X-Auth-Token", &session.token)
            .json(&serde_json::json!({ "server": server }))
            .send()
            .await?;
        let created: CreatedServer = check(response).await?.json().await?;

        info!(name = %instance_id, server_id = %created.server.id, "Created OpenStack server");

        Ok(CloudRunnerInstance {
            instance_id: instance_id.clone(),
            server_id: created.server.id,
            metadata: metadata.clone(),
            status: CloudRunnerStatus::Created,
            created_at: chrono::Utc::now(),
        })
    }
}

#[async_trait]
impl CloudRunnerManager for OpenStackCloud {
    fn name(&self) -> &str {
        "openstack"
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn create_runner(
        &self,
        instance_id: &InstanceId,
        metadata: &RunnerMetadata,
        registration: &RunnerRegistration,
    ) -> CloudResult<CloudRunnerInstance> {
        let timeout_secs = self.config.create_timeout_secs;
        tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.create_server(instance_id, metadata, registration),
        )
        .await
        .map_err(|_| CloudError::CreateTimeout {
            name: instance_id.name(),
            timeout_secs,
        })?
    }

    async fn get_runner(&self, instance_id: &InstanceId) -> CloudResult<Option<CloudRunnerInstance>> {
        let session = self.authenticate().await?;
        Ok(self
            .find_server(&session, instance_id)
            .await?
            .and_then(|server| self.to_instance(server)))
    }

    async fn get_runners(
        &self,
        status_filter: Option<&[CloudRunnerStatus]>,
    ) -> CloudResult<Vec<CloudRunnerInstance>> {
        let session = self.authenticate().await?;
        Ok(self
            .list_servers(&session)
            .await?
            .into_iter()
            .filter_map(|server| self.to_instance(server))
            .filter(|instance| status_matches(instance.status, status_filter))
            .collect())
    }

    async fn delete_runner(
        &self,
        instance_id: &InstanceId,
        removal_token: Option<&str>,
    ) -> CloudResult<()> {
        // The platform registration is removed by the runner manager, so the
        // removal token is not forwarded to the server.
        if removal_token.is_some() {
            debug!(name = %instance_id, "Removal token not used by OpenStack backend");
        }

        let session = self.authenticate().await?;
        let Some(server) = self.find_server(&session, instance_id).await? else {
            debug!(name = %instance_id, "Server already gone");
            return Ok(());
        };

        let url = format!("{}/servers/{}", session.compute_url, server.id);
        let response = self
            .client
            .delete(&url)
            .header("X-Auth-Token", &session.token)
            .send()
            .await?;

        match check(response).await {
            Ok(_) => {
                info!(name = %instance_id, server_id = %server.id, "Deleted OpenStack server");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn extract_metrics(
        &self,
        instance_id: &InstanceId,
    ) -> CloudResult<Option<RunnerMetricsArtifacts>> {
        let session = self.authenticate().await?;
        let Some(server) = self.find_server(&session, instance_id).await? else {
            return Ok(None);
        };

        let url = format!("{}/servers/{}/action", session.compute_url, server.id);
        let response = self
            .client
            .post(&url)
            .header("X-Auth-Token", &session.token)
            .json(&serde_json::json!({ "os-getConsoleOutput": { "length": CONSOLE_LINES } }))
            .send()
            .await?;
        let console: ConsoleOutput = check(response).await?.json().await?;

        Ok(parse_console_metrics(&console.output))
    }
}

/// Cloud-init user data starting the runner with its registration
pub fn render_user_data(instance_id: &InstanceId, registration: &RunnerRegistration) -> String {
    format!(
        r#"#!/bin/bash
set -euo pipefail
emit() {{ echo "{marker} $1 $2" > /dev/ttyS0; }}
export RUNNER_NAME="{name}"
cat > /home/ubuntu/pre-job.sh <<'HOOK'
#!/bin/bash
echo "{marker} pre_job {{\"timestamp\": $(date +%s), \"workflow\": \"$GITHUB_WORKFLOW\", \"workflow_run_id\": \"$GITHUB_RUN_ID\", \"repository\": \"$GITHUB_REPOSITORY\", \"event\": \"$GITHUB_EVENT_NAME\"}}" > /dev/ttyS0
HOOK
chmod +x /home/ubuntu/pre-job.sh
export ACTIONS_RUNNER_HOOK_JOB_STARTED=/home/ubuntu/pre-job.sh
emit installed "{{\"timestamp\": $(date +%s)}}"
cd /home/ubuntu/actions-runner
status=normal
code=0
su ubuntu -c "./run.sh --jitconfig {token}" || {{ code=$?; status=abnormal; }}
emit post_job "{{\"timestamp\": $(date +%s), \"status\": \"$status\", \"status_info\": {{\"code\": $code}}}}"
"#,
        marker = METRICS_MARKER,
        name = instance_id.name(),
        token = registration.token,
    )
}

/// Extract metric artifacts from console output. Later lines win.
pub fn parse_console_metrics(output: &str) -> Option<RunnerMetricsArtifacts> {
    let mut artifacts = RunnerMetricsArtifacts::default();
    let mut found = false;

    for line in output.lines() {
        let Some(rest) = line
            .find(METRICS_MARKER)
            .map(|i| line[i + METRICS_MARKER.len()..].trim())
        else {
            continue;
        };
        let Some((kind, payload)) = rest.split_once(' ') else {
            continue;
        };

        let parsed = match kind {
            "installed" => serde_json::from_str::<InstalledLine>(payload)
                .map(|l| artifacts.installed_timestamp = Some(l.timestamp)),
            "pre_job" => serde_json::from_str::<PreJobMetrics>(payload)
                .map(|m| artifacts.pre_job = Some(m)),
            "post_job" => serde_json::from_str::<PostJobMetrics>(payload)
                .map(|m| artifacts.post_job = Some(m)),
            _ => continue,
        };

        match parsed {
            Ok(()) => found = true,
            Err(e) => warn!(kind, error = %e, "Ignoring malformed metrics line"),
        }
    }

    found.then_some(artifacts)
}

/// Map non-success responses to cloud errors
async fn check(response: Response) -> CloudResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudError::Unauthorized(body),
        StatusCode::NOT_FOUND => CloudError::NotFound(body),
        _ => CloudError::Api(format!("{}: {}", status, body)),
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogService>,
}

#[derive(Debug, Deserialize)]
struct CatalogService {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    url: String,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: Vec<Server>,
}

#[derive(Debug, Deserialize)]
struct Server {
    id: String,
    name: String,
    status: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    created: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
struct CreatedServer {
    server: CreatedServerRef,
}

#[derive(Debug, Deserialize)]
struct CreatedServerRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ConsoleOutput {
    output: String,
}

#[derive(Debug, Deserialize)]
struct InstalledLine {
    timestamp: f64,
}
