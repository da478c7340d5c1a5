//! Error types for previewd

use preview_cost::CostError;
use preview_store::StoreError;
use thiserror::Error;

/// Daemon errors
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid pricing: {0}")]
    Pricing(#[from] CostError),

    #[error("cannot read seed file {path}: {source}")]
    SeedRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("seed file {path} is not a list of environments: {source}")]
    SeedFormat {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("seeding environment {name}: {source}")]
    Seed {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type DaemonResult<T> = Result<T, DaemonError>;
