//! previewd - pull-request preview environment orchestrator
//!
//! Reconciles Environment records into isolated namespaces plus GitOps
//! descriptors, tracks their cost, and tears them down on deletion or TTL
//! expiry.

use anyhow::Context;
use clap::Parser;
use preview_daemon::{Daemon, DaemonConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// previewd CLI
#[derive(Parser)]
#[command(name = "previewd")]
#[command(about = "Preview environment orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "PREVIEW_CONFIG")]
    config: Option<String>,

    /// JSON file of Environment records to create at startup
    #[arg(long, env = "PREVIEW_SEED_FILE")]
    seed: Option<String>,

    /// Log level, overrides the configuration file
    #[arg(long, env = "PREVIEW_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "PREVIEW_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = DaemonConfig::load(cli.config.as_deref())
        .with_context(|| format!("loading configuration from {:?}", cli.config))?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json {
        config.logging.json = true;
    }
    if cli.seed.is_some() {
        config.seed_file = cli.seed;
    }

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
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

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting previewd");

    let daemon = Daemon::new(config).context("building daemon")?;
    daemon.run().await?;
    Ok(())
}
