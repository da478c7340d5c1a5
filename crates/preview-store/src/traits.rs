//! Store trait definitions

use crate::error::StoreResult;
use async_trait::async_trait;
use preview_types::{
    ChildApplication, DeploymentDescriptor, Environment, EnvironmentKey, NamespaceRecord,
    NetworkPolicyRecord, Pod, ResourceQuotaRecord,
};
use tokio::sync::broadcast;

/// Combined control-plane store
pub trait ControlPlaneStore:
    EnvironmentStore
    + NamespaceStore
    + QuotaStore
    + NetworkPolicyStore
    + DescriptorStore
    + ApplicationStore
    + WorkloadStore
    + Send
    + Sync
{
}

impl<T> ControlPlaneStore for T where
    T: EnvironmentStore
        + NamespaceStore
        + QuotaStore
        + NetworkPolicyStore
        + DescriptorStore
        + ApplicationStore
        + WorkloadStore
        + Send
        + Sync
{
}

/// Environment change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: EnvironmentKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// Created, or spec/metadata changed
    Applied,
    /// Record removed
    Deleted,
}

/// Storage for environment records
#[async_trait]
pub trait EnvironmentStore: Send + Sync {
    async fn get_environment(&self, key: &EnvironmentKey) -> StoreResult<Option<Environment>>;

    async fn list_environments(&self) -> StoreResult<Vec<Environment>>;

    /// Create a record; status is reset and generation starts at 1
    async fn create_environment(&self, env: Environment) -> StoreResult<Environment>;

    /// Write spec and metadata (labels, annotations, finalizers).
    ///
    /// Status is left as stored. Generation moves when the spec differs.
    /// When deletion was requested and the last finalizer is released the
    /// record is dropped and its final state returned.
    async fn update_environment(&self, env: Environment) -> StoreResult<Environment>;

    /// Write the status only
    async fn update_environment_status(&self, env: &Environment) -> StoreResult<Environment>;

    /// Request deletion. Returns `true` when the record was dropped
    /// immediately because it held no finalizers.
    async fn request_environment_deletion(&self, key: &EnvironmentKey) -> StoreResult<bool>;

    /// Subscribe to environment changes
    fn watch_environments(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Storage for namespaces (cluster-scoped)
#[async_trait]
pub trait NamespaceStore: Send + Sync {
    async fn get_namespace(&self, name: &str) -> StoreResult<Option<NamespaceRecord>>;

    async fn create_namespace(&self, ns: NamespaceRecord) -> StoreResult<NamespaceRecord>;

    async fn update_namespace(&self, ns: NamespaceRecord) -> StoreResult<NamespaceRecord>;

    /// Delete a namespace and everything inside it. Returns whether it existed.
    async fn delete_namespace(&self, name: &str) -> StoreResult<bool>;
}

/// Storage for resource quotas
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get_resource_quota(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<ResourceQuotaRecord>>;

    async fn create_resource_quota(
        &self,
        quota: ResourceQuotaRecord,
    ) -> StoreResult<ResourceQuotaRecord>;

    async fn update_resource_quota(
        &self,
        quota: ResourceQuotaRecord,
    ) -> StoreResult<ResourceQuotaRecord>;
}

/// Storage for network policies
#[async_trait]
pub trait NetworkPolicyStore: Send + Sync {
    async fn get_network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<NetworkPolicyRecord>>;

    async fn list_network_policies(&self, namespace: &str) -> StoreResult<Vec<NetworkPolicyRecord>>;

    async fn create_network_policy(
        &self,
        policy: NetworkPolicyRecord,
    ) -> StoreResult<NetworkPolicyRecord>;

    async fn update_network_policy(
        &self,
        policy: NetworkPolicyRecord,
    ) -> StoreResult<NetworkPolicyRecord>;
}

/// Storage for GitOps descriptors
#[async_trait]
pub trait DescriptorStore: Send + Sync {
    async fn get_descriptor(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<DeploymentDescriptor>>;

    async fn list_descriptors(&self, namespace: &str) -> StoreResult<Vec<DeploymentDescriptor>>;

    async fn create_descriptor(
        &self,
        descriptor: DeploymentDescriptor,
    ) -> StoreResult<DeploymentDescriptor>;

    async fn update_descriptor(
        &self,
        descriptor: DeploymentDescriptor,
    ) -> StoreResult<DeploymentDescriptor>;

    /// Returns whether the descriptor existed
    async fn delete_descriptor(&self, namespace: &str, name: &str) -> StoreResult<bool>;
}

/// Child applications, written by the external GitOps engine
#[async_trait]
pub trait ApplicationStore: Send + Sync {
    async fn get_application(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<ChildApplication>>;

    async fn list_applications(&self, namespace: &str) -> StoreResult<Vec<ChildApplication>>;

    /// Create or replace, ignoring the version token
    async fn apply_application(&self, app: ChildApplication) -> StoreResult<ChildApplication>;

    async fn delete_application(&self, namespace: &str, name: &str) -> StoreResult<bool>;
}

/// Running workloads, written by the platform
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    async fn list_pods(&self, namespace: &str) -> StoreResult<Vec<Pod>>;

    /// Create or replace, ignoring the version token
    async fn apply_pod(&self, pod: Pod) -> StoreResult<Pod>;
}
