//! Isolation boundary records: namespace, resource quota, network policies.

use crate::meta::{ObjectMeta, Resource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cluster-level compartment holding one environment's workloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    pub metadata: ObjectMeta,
}

impl NamespaceRecord {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self { metadata }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

impl Resource for NamespaceRecord {
    const KIND: &'static str = "Namespace";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Hard resource ceilings for a namespace.
///
/// Keys follow the platform's quota vocabulary (`requests.cpu`,
/// `limits.memory`, `persistentvolumeclaims`, `services.loadbalancers`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuotaRecord {
    pub metadata: ObjectMeta,
    pub hard: BTreeMap<String, String>,
}

impl ResourceQuotaRecord {
    pub const REQUESTS_CPU: &'static str = "requests.cpu";
    pub const REQUESTS_MEMORY: &'static str = "requests.memory";
    pub const LIMITS_CPU: &'static str = "limits.cpu";
    pub const LIMITS_MEMORY: &'static str = "limits.memory";
    pub const PVC_COUNT: &'static str = "persistentvolumeclaims";
    pub const LOAD_BALANCERS: &'static str = "services.loadbalancers";
}

impl Resource for ResourceQuotaRecord {
    const KIND: &'static str = "ResourceQuota";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicyRecord {
    pub metadata: ObjectMeta,
    pub spec: NetworkPolicySpec,
}

impl Resource for NetworkPolicyRecord {
    const KIND: &'static str = "NetworkPolicy";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Policy body. An empty rule list for a listed policy type denies that
/// direction entirely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicySpec {
    pub pod_selector: LabelSelector,
    pub policy_types: Vec<PolicyType>,
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
    #[serde(default)]
    pub egress: Vec<EgressRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyType {
    Ingress,
    Egress,
}

/// Label selector; empty matches everything in scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn matching(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut match_labels = BTreeMap::new();
        match_labels.insert(key.into(), value.into());
        Self { match_labels }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default)]
    pub from: Vec<NetworkPolicyPeer>,
    #[serde(default)]
    pub ports: Vec<NetworkPolicyPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressRule {
    #[serde(default)]
    pub to: Vec<NetworkPolicyPeer>,
    #[serde(default)]
    pub ports: Vec<NetworkPolicyPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicyPeer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicyPort {
    pub protocol: Protocol,
    pub port: u16,
}

impl NetworkPolicyPort {
    pub fn tcp(port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            port,
        }
    }

    pub fn udp(port: u16) -> Self {
        Self {
            protocol: Protocol::Udp,
            port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}
