//! Preview Types - record model for pull-request preview environments
//!
//! Every record the orchestrator reads or writes lives in the control-plane
//! store and carries an [`ObjectMeta`] with an optimistic-concurrency token.
//!
//! ## Key Concepts
//!
//! - **Environment**: desired + observed state for one pull request's preview
//! - **NamespaceRecord / ResourceQuotaRecord / NetworkPolicyRecord**: the
//!   isolation boundary provisioned for an Environment
//! - **DeploymentDescriptor**: list-generated GitOps descriptor, one child
//!   application per requested service
//! - **Pod**: running workload, read for cost estimation
//!
//! Ownership across isolation boundaries is recorded with the annotation
//! triple in [`OwnerAnnotations`], never with structural parent links.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod environment;
pub mod gitops;
pub mod isolation;
pub mod meta;
pub mod quantity;
pub mod validation;
pub mod workload;

// Re-export main types
pub use environment::{
    AppliedRevision, Condition, ConditionKind, CostSnapshot, Environment, EnvironmentSpec,
    EnvironmentStatus, IsolationToggles, Phase, PhaseTransitionError, QuotaOverrides,
    ServiceStatus,
};
pub use gitops::{
    ChildApplication, ChildApplicationStatus, ChildSource, ChildTemplate, DeploymentDescriptor,
    DescriptorSpec, Destination, HealthStatus, ListGenerator, SyncAutomation, SyncPolicy,
    SyncRetry, SyncStatus,
};
pub use isolation::{
    EgressRule, IngressRule, LabelSelector, NamespaceRecord, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicyRecord, NetworkPolicySpec, PolicyType, Protocol,
    ResourceQuotaRecord,
};
pub use meta::{labels, EnvironmentKey, ObjectMeta, OwnerAnnotations, Resource};
pub use quantity::{parse_cpu_cores, parse_memory_gib, QuantityError};
pub use validation::ValidationError;
pub use workload::{Container, ContainerResources, Pod, PodPhase};
