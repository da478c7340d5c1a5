//! Environment records
//!
//! An Environment is the desired + observed state for one pull request's
//! preview deployment. There is one per (repository, PR number).

use crate::gitops::{HealthStatus, SyncStatus};
use crate::meta::{labels, EnvironmentKey, ObjectMeta, Resource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Desired + observed state of a preview environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub metadata: ObjectMeta,

    pub spec: EnvironmentSpec,

    #[serde(default)]
    pub status: EnvironmentStatus,
}

impl Resource for Environment {
    const KIND: &'static str = "Environment";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Environment {
    /// Create a new environment record with empty status
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: EnvironmentSpec) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            spec,
            status: EnvironmentStatus::default(),
        }
    }

    pub fn key(&self) -> EnvironmentKey {
        EnvironmentKey::from_meta(&self.metadata)
    }

    pub fn phase(&self) -> Phase {
        self.status.phase
    }

    pub fn do_not_expire(&self) -> bool {
        self.metadata
            .annotations
            .get(labels::DO_NOT_EXPIRE)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    /// Creation + TTL; the recorded expiry is used only before the record
    /// has a creation timestamp. Tracks TTL edits.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let computed = self.metadata.creation_timestamp.and_then(|created| {
            let ttl = chrono::Duration::from_std(self.spec.ttl).ok()?;
            created.checked_add_signed(ttl)
        });
        computed.or(self.status.expires_at)
    }

    /// Whether TTL expiry applies at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.do_not_expire() {
            return false;
        }
        self.expires_at().is_some_and(|at| at <= now)
    }

    /// Labels tying owned records back to this environment
    pub fn association_labels(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(labels::MANAGED_BY.to_string(), labels::MANAGED_BY_VALUE.to_string());
        map.insert(labels::PR_NUMBER.to_string(), self.spec.pr_number.to_string());
        map.insert(
            labels::REPOSITORY.to_string(),
            labels::repository_value(&self.spec.repository),
        );
        map.insert(labels::ENVIRONMENT.to_string(), self.metadata.name.clone());
        map
    }

    /// Name of the GitOps descriptor for this environment
    pub fn descriptor_name(&self) -> String {
        format!("preview-{}", self.spec.pr_number)
    }

    /// Name of the generated child application for `service`
    pub fn child_name(&self, service: &str) -> String {
        format!("preview-{}-{}", self.spec.pr_number, service)
    }
}

/// Desired state, written by the event ingestion gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    /// Repository in `owner/name` form
    pub repository: String,

    pub pr_number: u64,

    /// Pinned head revision
    pub head_sha: String,

    pub base_branch: String,

    pub head_branch: String,

    /// Explicitly requested services; also the fallback when diff-based
    /// detection is unavailable
    #[serde(default)]
    pub services: Vec<String>,

    /// Time-to-live from creation
    #[serde(with = "duration_secs", default = "default_ttl")]
    pub ttl: Duration,

    /// Per-environment quota ceilings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<QuotaOverrides>,

    #[serde(default)]
    pub isolation: IsolationToggles,

    /// Price workloads at the spot rate
    #[serde(default)]
    pub use_spot_pricing: bool,
}

impl EnvironmentSpec {
    /// Spec with defaults for everything but the PR identity
    pub fn new(repository: impl Into<String>, pr_number: u64, head_sha: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            pr_number,
            head_sha: head_sha.into(),
            base_branch: "main".to_string(),
            head_branch: format!("pr-{}", pr_number),
            services: Vec::new(),
            ttl: default_ttl(),
            resources: None,
            isolation: IsolationToggles::default(),
            use_spot_pricing: false,
        }
    }

    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

fn default_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

/// Quota ceilings overriding the isolation defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_requests: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_requests: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limits: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limits: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claims: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancers: Option<u32>,
}

/// Which parts of the isolation boundary to provision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolationToggles {
    #[serde(default = "default_true")]
    pub resource_quota: bool,

    #[serde(default = "default_true")]
    pub network_policies: bool,

    /// Allow plain HTTP egress; `None` uses the isolation default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_http_egress: Option<bool>,
}

impl Default for IsolationToggles {
    fn default() -> Self {
        Self {
            resource_quota: true,
            network_policies: true,
            allow_http_egress: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Admitted by the store, not yet picked up
    #[default]
    Pending,
    /// Provisioning for the first time
    Creating,
    /// Every requested service is healthy and synced
    Ready,
    /// Converging a changed revision or service list
    Updating,
    /// Teardown in progress
    Deleting,
    /// Retried after a spec change, or on later ticks once retries ran out
    Failed,
}

impl Phase {
    /// The allowed edges of the lifecycle.
    ///
    /// Same-state edges are allowed for the converging phases so a tick that
    /// makes partial progress can record it.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        match self {
            Pending => matches!(next, Creating | Failed | Deleting),
            Creating => matches!(next, Creating | Ready | Failed | Deleting),
            Updating => matches!(next, Updating | Ready | Failed | Deleting),
            Ready => matches!(next, Ready | Updating | Deleting),
            Failed => matches!(next, Failed | Creating | Updating | Deleting),
            Deleting => matches!(next, Deleting),
        }
    }

    pub fn transition_to(self, next: Phase) -> Result<Phase, PhaseTransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(PhaseTransitionError {
                from: self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Creating => "Creating",
            Phase::Ready => "Ready",
            Phase::Updating => "Updating",
            Phase::Deleting => "Deleting",
            Phase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Rejected lifecycle edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid phase transition {from} -> {to}")]
pub struct PhaseTransitionError {
    pub from: Phase,
    pub to: Phase,
}

/// Named status conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionKind {
    /// Finalizer admitted; teardown is guaranteed
    Admitted,
    /// Namespace, quota and policies converged
    IsolationReady,
    /// Descriptor written and matching the desired template
    DescriptorSynced,
    /// Every child reports Healthy + Synced
    ServicesReady,
    /// Overall readiness
    Ready,
}

/// A named boolean condition with a machine-readable reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub kind: ConditionKind,
    pub status: bool,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Observed state, written only by the reconciliation engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStatus {
    #[serde(default)]
    pub phase: Phase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default)]
    pub services: Vec<ServiceStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostSnapshot>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<DateTime<Utc>>,

    /// Spec generation the last converging tick acted on
    #[serde(default)]
    pub observed_generation: u64,

    /// What the descriptor was last built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied: Option<AppliedRevision>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Consecutive transient failures
    #[serde(default)]
    pub retry_count: u32,

    /// Machine-readable reason for the Failed phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl EnvironmentStatus {
    pub fn condition(&self, kind: ConditionKind) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    pub fn is_condition_true(&self, kind: ConditionKind) -> bool {
        self.condition(kind).is_some_and(|c| c.status)
    }

    /// Set a condition. The transition time only moves when `status` flips.
    pub fn set_condition(
        &mut self,
        kind: ConditionKind,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        let reason = reason.into();
        let message = message.into();
        match self.conditions.iter_mut().find(|c| c.kind == kind) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason;
                existing.message = message;
            }
            None => self.conditions.push(Condition {
                kind,
                status,
                reason,
                message,
                last_transition_time: now,
            }),
        }
    }
}

/// Inputs of the last applied descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedRevision {
    pub head_sha: String,
    pub services: Vec<String>,
    pub generation: u64,
}

impl AppliedRevision {
    /// Same revision and service list; the generation is ignored
    pub fn same_rollout(&self, other: &AppliedRevision) -> bool {
        self.head_sha == other.head_sha && self.services == other.services
    }
}

/// Observed state of one requested service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub name: String,
    pub ready: bool,
    pub health: HealthStatus,
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Cost figures recorded on the environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSnapshot {
    pub currency: String,
    /// Fixed 4-decimal string
    pub hourly_cost: String,
    /// Hourly cost times TTL hours, fixed 4-decimal string
    pub total_cost: String,
    /// Lifetime cost computed when teardown starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_cost: Option<String>,
    pub calculated_at: DateTime<Utc>,
}

/// Serde helper for Duration as whole seconds
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
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
