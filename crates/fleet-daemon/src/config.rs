//! Configuration for fleetd

use fleet_cloud::OpenStackConfig;
use fleet_platform::{GitHubConfig, JobManagerConfig};
use fleet_types::InstanceId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Runner fleet shape
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Virtual machine backend
    #[serde(default)]
    pub cloud: CloudConfig,

    /// CI platform backend
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Metric event output
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Persisted state
    #[serde(default)]
    pub state: StateConfig,

    /// Reactive worker processes, disabled when absent
    #[serde(default)]
    pub reactive: Option<ReactiveConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: SocketAddr,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: true,
        }
    }
}

/// Runner fleet shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Name prefix owned by this daemon, usually including a unit number
    pub prefix: String,

    /// Number of runners to keep
    #[serde(default)]
    pub desired: usize,

    #[serde(default)]
    pub labels: Vec<String>,

    /// Seconds a new runner may take to come online
    #[serde(default = "default_online_timeout")]
    pub online_timeout_secs: u64,

    /// Maximum concurrent per-runner operations
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Flavor name reported in metrics
    #[serde(default = "default_flavor")]
    pub flavor: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            prefix: "fleet-0".to_string(),
            desired: 0,
            labels: Vec::new(),
            online_timeout_secs: default_online_timeout(),
            concurrency: default_concurrency(),
            flavor: default_flavor(),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Reconciliation interval in seconds
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    /// Flush busy runners too when the daemon stops
    #[serde(default)]
    pub flush_busy_on_shutdown: bool,

    /// Flush idle runners when the daemon stops
    #[serde(default)]
    pub flush_on_shutdown: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            flush_busy_on_shutdown: false,
            flush_on_shutdown: false,
        }
    }
}

/// Virtual machine backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CloudConfig {
    /// In-memory cloud (for development/testing)
    #[default]
    Memory,

    OpenStack(OpenStackConfig),
}

/// CI platform backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PlatformConfig {
    /// In-memory platform (for development/testing)
    #[default]
    Memory,

    GitHub(GitHubConfig),

    JobManager(JobManagerConfig),

    /// Several platforms; the first one is the default
    Multiplexer { platforms: Vec<MultiplexedPlatform> },
}

/// One multiplexed platform and the labels it serves
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiplexedPlatform {
    #[serde(default)]
    pub labels: Vec<String>,

    #[serde(flatten)]
    pub backend: LeafPlatformConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LeafPlatformConfig {
    GitHub(GitHubConfig),
    JobManager(JobManagerConfig),
}

/// Metric event output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// JSON-lines event log, events only reach Prometheus when unset
    #[serde(default)]
    pub event_log: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Persisted state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    /// File rewritten with the id of every finished reconcile cycle
    #[serde(default)]
    pub cycle_id_path: Option<PathBuf>,
}

/// Reactive worker processes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactiveConfig {
    /// Worker executable
    pub program: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    pub queue_uri: String,

    pub queue_name: String,

    /// Worker processes to keep alive
    #[serde(default)]
    pub processes: usize,
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_online_timeout() -> u64 {
    600
}

fn default_concurrency() -> usize {
    8
}

fn default_flavor() -> String {
    "default".to_string()
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration from defaults, an optional file and `FLEET__` variables.
    ///
    /// Nested keys use a double underscore: `FLEET__RUNNER__DESIRED=3`.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("FLEET")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("runner.labels")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Reject values the core cannot work with
    pub fn validate(&self) -> Result<(), String> {
        let prefix = self.runner.prefix.trim();
        if prefix.is_empty() {
            return Err("runner.prefix is empty".to_string());
        }
        InstanceId::build(prefix, false).map_err(|e| format!("runner.prefix: {}", e))?;
        if self.runner.labels.iter().any(|label| label.trim().is_empty()) {
            return Err("runner.labels contains an empty label".to_string());
        }
        if self.runner.concurrency == 0 {
            return Err("runner.concurrency must be positive".to_string());
        }
        if self.runner.online_timeout_secs == 0 {
            return Err("runner.online_timeout_secs must be positive".to_string());
        }
        if self.runner.flavor.trim().is_empty() {
            return Err("runner.flavor is empty".to_string());
        }
        if self.scheduler.reconcile_interval_secs == 0 {
            return Err("scheduler.reconcile_interval_secs must be positive".to_string());
        }

        if let CloudConfig::OpenStack(openstack) = &self.cloud {
            openstack.validate().map_err(|e| e.to_string())?;
        }

        match &self.platform {
            PlatformConfig::Memory => {}
            PlatformConfig::GitHub(github) => github.validate().map_err(|e| e.to_string())?,
            PlatformConfig::JobManager(jobmanager) => {
                jobmanager.validate().map_err(|e| e.to_string())?
            }
            PlatformConfig::Multiplexer { platforms } => {
                if platforms.is_empty() {
                    return Err("platform.platforms is empty".to_string());
                }
                for platform in platforms {
                    match &platform.backend {
                        LeafPlatformConfig::GitHub(github) => {
                            github.validate().map_err(|e| e.to_string())?
                        }
                        LeafPlatformConfig::JobManager(jobmanager) => {
                            jobmanager.validate().map_err(|e| e.to_string())?
                        }
                    }
                }
            }
        }

        if let Some(reactive) = &self.reactive {
            if reactive.program.as_os_str().is_empty() {
                return Err("reactive.program is empty".to_string());
            }
            if reactive.queue_uri.trim().is_empty() {
                return Err("reactive.queue_uri is empty".to_string());
            }
            if reactive.queue_name.trim().is_empty() {
                return Err("reactive.queue_name is empty".to_string());
            }
        }

        Ok(())
    }
}
