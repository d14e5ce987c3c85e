//! Fleet daemon - keeps a pool of self-hosted CI runners alive
//!
//! The daemon provides:
//! - Reconciliation loop converging the fleet on the desired size
//! - Operational REST API for status, triggers and flushes
//! - Prometheus metrics and a metric event log

use clap::Parser;
use fleet_daemon::config::DaemonConfig;
use fleet_daemon::error::{DaemonError, DaemonResult};
use fleet_daemon::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Fleet daemon CLI
#[derive(Parser)]
#[command(name = "fleetd")]
#[command(about = "Fleet daemon - self-hosted CI runner fleet manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "FLEET_CONFIG")]
    config: Option<String>,

    /// Listen address, overrides server.listen_addr
    #[arg(short, long, env = "FLEET_LISTEN_ADDR")]
    listen: Option<String>,

    /// Log level, overrides logging.level
    #[arg(long, env = "FLEET_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "FLEET_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = DaemonConfig::load(cli.config.as_deref())?;

    // Initialize tracing
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    if cli.json || config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // Override with CLI args
    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen
            .parse()
            .map_err(|e| DaemonError::Config(format!("Invalid listen address: {}", e)))?;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        prefix = %config.runner.prefix,
        listen = %config.server.listen_addr,
        "Starting fleet daemon"
    );

    // Create and run server
    let server = Server::new(config)?;
    server.run().await
}
