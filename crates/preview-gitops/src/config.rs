//! GitOps configuration

use preview_types::SyncRetry;
use serde::{Deserialize, Serialize};

/// Descriptor generator configuration.
///
/// `repo_url_template` may use `{repository}`; `path_template` may use
/// `{repository}` and `{service}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitOpsConfig {
    /// Namespace the GitOps engine watches for descriptors
    #[serde(default = "default_descriptor_namespace")]
    pub descriptor_namespace: String,

    /// API server of the target cluster
    #[serde(default = "default_destination_server")]
    pub destination_server: String,

    #[serde(default = "default_repo_url_template")]
    pub repo_url_template: String,

    #[serde(default = "default_path_template")]
    pub path_template: String,

    /// GitOps project children belong to
    #[serde(default = "default_project")]
    pub project: String,

    #[serde(default)]
    pub sync_retry: SyncRetry,
}

impl Default for GitOpsConfig {
    fn default() -> Self {
        Self {
            descriptor_namespace: default_descriptor_namespace(),
            destination_server: default_destination_server(),
            repo_url_template: default_repo_url_template(),
            path_template: default_path_template(),
            project: default_project(),
            sync_retry: SyncRetry::default(),
        }
    }
}

fn default_descriptor_namespace() -> String {
    "argocd".to_string()
}

fn default_destination_server() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_repo_url_template() -> String {
    "https://github.com/{repository}.git".to_string()
}

fn default_path_template() -> String {
    "services/{service}/deploy".to_string()
}

fn default_project() -> String {
    "previews".to_string()
}
