//! The three-policy network set

use crate::config::IsolationConfig;
use preview_types::{
    EgressRule, IngressRule, LabelSelector, NetworkPolicyPeer, NetworkPolicyPort,
    NetworkPolicySpec, PolicyType,
};

pub const DEFAULT_DENY_ALL: &str = "default-deny-all";
pub const ALLOW_INGRESS: &str = "allow-ingress";
pub const ALLOW_EGRESS: &str = "allow-egress";

/// Label every namespace carries with its own name
const NAMESPACE_NAME_LABEL: &str = "kubernetes.io/metadata.name";

fn namespace_peer(namespace: &str) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        namespace_selector: Some(LabelSelector::matching(NAMESPACE_NAME_LABEL, namespace)),
        pod_selector: None,
    }
}

/// Deny everything in both directions. Takes no input.
pub fn default_deny_all() -> NetworkPolicySpec {
    NetworkPolicySpec {
        pod_selector: LabelSelector::everything(),
        policy_types: vec![PolicyType::Ingress, PolicyType::Egress],
        ingress: Vec::new(),
        egress: Vec::new(),
    }
}

/// Gateway traffic on the ingress port
pub fn allow_ingress(config: &IsolationConfig) -> NetworkPolicySpec {
    NetworkPolicySpec {
        pod_selector: LabelSelector::everything(),
        policy_types: vec![PolicyType::Ingress],
        ingress: vec![IngressRule {
            from: vec![namespace_peer(&config.gateway_namespace)],
            ports: vec![NetworkPolicyPort::tcp(config.ingress_port)],
        }],
        egress: Vec::new(),
    }
}

/// DNS, HTTPS and intra-namespace traffic, plus HTTP when enabled
pub fn allow_egress(config: &IsolationConfig, allow_http: bool) -> NetworkPolicySpec {
    let mut egress = vec![
        EgressRule {
            to: vec![namespace_peer(&config.dns_namespace)],
            ports: vec![NetworkPolicyPort::udp(53), NetworkPolicyPort::tcp(53)],
        },
        EgressRule {
            to: Vec::new(),
            ports: vec![NetworkPolicyPort::tcp(443)],
        },
        EgressRule {
            to: vec![NetworkPolicyPeer {
                namespace_selector: None,
                pod_selector: Some(LabelSelector::everything()),
            }],
            ports: Vec::new(),
        },
    ];
    if allow_http {
        egress.push(EgressRule {
            to: Vec::new(),
            ports: vec![NetworkPolicyPort::tcp(80)],
        });
    }

    NetworkPolicySpec {
        pod_selector: LabelSelector::everything(),
        policy_types: vec![PolicyType::Egress],
        ingress: Vec::new(),
        egress,
    }
}

/// The full set, in apply order
pub fn desired_policies(
    config: &IsolationConfig,
    allow_http: bool,
) -> [(&'static str, NetworkPolicySpec); 3] {
    [
        (DEFAULT_DENY_ALL, default_deny_all()),
        (ALLOW_INGRESS, allow_ingress(config)),
        (ALLOW_EGRESS, allow_egress(config, allow_http)),
    ]
}
