//! Configuration for previewd

use preview_cost::PricingConfig;
use preview_engine::{CleanupConfig, ControllerConfig, EngineConfig};
use preview_gitops::GitOpsConfig;
use preview_isolation::IsolationConfig;
use serde::{Deserialize, Serialize};

/// Main daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Reconciler settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Dispatcher settings
    #[serde(default)]
    pub controller: ControllerConfig,

    /// TTL sweep settings
    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub pricing: PricingConfig,

    #[serde(default)]
    pub isolation: IsolationConfig,

    #[serde(default)]
    pub gitops: GitOpsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// JSON file of Environment records created at startup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_file: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
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

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration: serde defaults, then the file at `path` if
    /// given, then `PREVIEW_*` environment variables.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `PREVIEW_ENGINE__BASE_DOMAIN=previews.internal`.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PREVIEW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
