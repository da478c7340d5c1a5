//! Isolation configuration

use serde::{Deserialize, Serialize};

/// Isolation manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationConfig {
    /// Namespace of the shared ingress gateway allowed to reach workloads
    #[serde(default = "default_gateway_namespace")]
    pub gateway_namespace: String,

    /// Port workloads accept gateway traffic on
    #[serde(default = "default_ingress_port")]
    pub ingress_port: u16,

    /// Namespace running cluster DNS
    #[serde(default = "default_dns_namespace")]
    pub dns_namespace: String,

    /// Allow plain HTTP egress unless an environment says otherwise
    #[serde(default)]
    pub allow_http_egress: bool,

    /// Quota ceilings applied when an environment has no override
    #[serde(default)]
    pub default_quota: QuotaDefaults,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            gateway_namespace: default_gateway_namespace(),
            ingress_port: default_ingress_port(),
            dns_namespace: default_dns_namespace(),
            allow_http_egress: false,
            default_quota: QuotaDefaults::default(),
        }
    }
}

/// Default quota ceilings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDefaults {
    #[serde(default = "default_cpu_requests")]
    pub cpu_requests: String,
    #[serde(default = "default_memory_requests")]
    pub memory_requests: String,
    #[serde(default = "default_cpu_limits")]
    pub cpu_limits: String,
    #[serde(default = "default_memory_limits")]
    pub memory_limits: String,
    #[serde(default)]
    pub persistent_volume_claims: u32,
    #[serde(default)]
    pub load_balancers: u32,
}

impl Default for QuotaDefaults {
    fn default() -> Self {
        Self {
            cpu_requests: default_cpu_requests(),
            memory_requests: default_memory_requests(),
            cpu_limits: default_cpu_limits(),
            memory_limits: default_memory_limits(),
            persistent_volume_claims: 0,
            load_balancers: 0,
        }
    }
}

fn default_gateway_namespace() -> String {
    "ingress-nginx".to_string()
}

fn default_ingress_port() -> u16 {
    8080
}

fn default_dns_namespace() -> String {
    "kube-system".to_string()
}

fn default_cpu_requests() -> String {
    "2".to_string()
}

fn default_memory_requests() -> String {
    "4Gi".to_string()
}

fn default_cpu_limits() -> String {
    "4".to_string()
}

fn default_memory_limits() -> String {
    "8Gi".to_string()
}
