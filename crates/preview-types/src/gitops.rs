//! GitOps descriptor records
//!
//! A [`DeploymentDescriptor`] is a list-generated template: the external
//! GitOps engine expands it into one [`ChildApplication`] per list element
//! and converges each child toward its pinned Git revision.

use crate::meta::{ObjectMeta, Resource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// List-generated deployment descriptor, one per environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDescriptor {
    pub metadata: ObjectMeta,
    pub spec: DescriptorSpec,
}

impl Resource for DeploymentDescriptor {
    const KIND: &'static str = "DeploymentDescriptor";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorSpec {
    pub generators: Vec<ListGenerator>,

    pub template: ChildTemplate,

    /// Fields written by other actors; carried through convergent updates
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Static list of template parameter sets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListGenerator {
    pub elements: Vec<BTreeMap<String, String>>,
}

/// Per-child template; string fields may contain `{{param}}` placeholders
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildTemplate {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    pub project: String,

    pub source: ChildSource,

    pub destination: Destination,

    pub sync_policy: SyncPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildSource {
    pub repo_url: String,
    pub path: String,
    /// Pinned head revision
    pub target_revision: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Target cluster API server
    pub server: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated: Option<SyncAutomation>,

    #[serde(default)]
    pub sync_options: Vec<String>,

    pub retry: SyncRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAutomation {
    pub prune: bool,
    pub self_heal: bool,
}

/// Bounded exponential retry for child syncs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncRetry {
    pub limit: u32,
    #[serde(with = "duration_secs")]
    pub backoff: Duration,
    pub factor: u32,
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
}

impl Default for SyncRetry {
    fn default() -> Self {
        Self {
            limit: 5,
            backoff: Duration::from_secs(5),
            factor: 2,
            max_backoff: Duration::from_secs(180),
        }
    }
}

/// Child application generated from a descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildApplication {
    pub metadata: ObjectMeta,
    pub spec: ChildTemplate,
    #[serde(default)]
    pub status: ChildApplicationStatus,
}

impl Resource for ChildApplication {
    const KIND: &'static str = "ChildApplication";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Health and sync state reported by the GitOps engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildApplicationStatus {
    pub health: HealthStatus,
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub message: String,
}

impl ChildApplicationStatus {
    pub fn is_ready(&self) -> bool {
        self.health == HealthStatus::Healthy && self.sync_status == SyncStatus::Synced
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Degraded,
    Suspended,
    /// The child has not been generated yet
    Missing,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Progressing => "Progressing",
            HealthStatus::Degraded => "Degraded",
            HealthStatus::Suspended => "Suspended",
            HealthStatus::Missing => "Missing",
            HealthStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    Synced,
    OutOfSync,
    #[default]
    Unknown,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncStatus::Synced => "Synced",
            SyncStatus::OutOfSync => "OutOfSync",
            SyncStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
