//! In-memory control-plane store

use super::traits::*;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use preview_types::{
    ChildApplication, DeploymentDescriptor, Environment, EnvironmentKey, EnvironmentStatus,
    NamespaceRecord, NetworkPolicyRecord, Pod, Resource, ResourceQuotaRecord,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

/// (namespace, name); cluster-scoped records use an empty namespace
type RecordKey = (String, String);

fn key_of<T: Resource>(record: &T) -> RecordKey {
    let meta = record.meta();
    (meta.namespace_or_default().to_string(), meta.name.clone())
}

fn display_key((namespace, name): &RecordKey) -> String {
    if namespace.is_empty() {
        name.clone()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Versioned records of one kind
struct Table<T> {
    records: RwLock<BTreeMap<RecordKey, T>>,
}

impl<T: Resource> Table<T> {
    fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
        }
    }

    async fn get(&self, namespace: &str, name: &str) -> Option<T> {
        let records = self.records.read().await;
        records
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    async fn list(&self, namespace: Option<&str>) -> Vec<T> {
        let records = self.records.read().await;
        records
            .iter()
            .filter(|((ns, _), _)| namespace.map_or(true, |want| ns == want))
            .map(|(_, record)| record.clone())
            .collect()
    }

    async fn create(&self, mut record: T, version: u64) -> StoreResult<T> {
        let key = key_of(&record);
        let mut records = self.records.write().await;
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: T::KIND,
                name: display_key(&key),
            });
        }

        let meta = record.meta_mut();
        meta.uid = Uuid::new_v4().to_string();
        meta.resource_version = version;
        meta.generation = 1;
        meta.creation_timestamp = Some(Utc::now());
        meta.deletion_timestamp = None;

        records.insert(key, record.clone());
        Ok(record)
    }

    async fn update(&self, mut record: T, version: u64) -> StoreResult<T> {
        let key = key_of(&record);
        let mut records = self.records.write().await;
        let current = records.get(&key).ok_or_else(|| StoreError::NotFound {
            kind: T::KIND,
            name: display_key(&key),
        })?;

        check_version::<T>(&key, record.meta().resource_version, current)?;

        let meta = record.meta_mut();
        meta.uid = current.meta().uid.clone();
        meta.generation = current.meta().generation;
        meta.creation_timestamp = current.meta().creation_timestamp;
        meta.deletion_timestamp = current.meta().deletion_timestamp;
        meta.resource_version = version;

        records.insert(key, record.clone());
        Ok(record)
    }

    /// Create or replace without a version check
    async fn apply(&self, mut record: T, version: u64) -> T {
        let key = key_of(&record);
        let mut records = self.records.write().await;
        let meta = record.meta_mut();
        match records.get(&key) {
            Some(current) => {
                meta.uid = current.meta().uid.clone();
                meta.creation_timestamp = current.meta().creation_timestamp;
                meta.generation = current.meta().generation;
            }
            None => {
                meta.uid = Uuid::new_v4().to_string();
                meta.creation_timestamp = Some(Utc::now());
                meta.generation = 1;
            }
        }
        meta.resource_version = version;
        records.insert(key, record.clone());
        record
    }

    async fn delete(&self, namespace: &str, name: &str) -> bool {
        let mut records = self.records.write().await;
        records
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some()
    }

    /// Drop every record in `namespace`; returns how many were removed
    async fn delete_namespace(&self, namespace: &str) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|(ns, _), _| ns != namespace);
        before - records.len()
    }
}

fn check_version<T: Resource>(key: &RecordKey, presented: u64, current: &T) -> StoreResult<()> {
    let actual = current.meta().resource_version;
    if presented != actual {
        return Err(StoreError::Conflict {
            kind: T::KIND,
            name: display_key(key),
            expected: presented,
            actual,
        });
    }
    Ok(())
}

/// In-memory control plane for development and testing
pub struct InMemoryControlPlane {
    environments: RwLock<BTreeMap<RecordKey, Environment>>,
    namespaces: Table<NamespaceRecord>,
    quotas: Table<ResourceQuotaRecord>,
    policies: Table<NetworkPolicyRecord>,
    descriptors: Table<DeploymentDescriptor>,
    applications: Table<ChildApplication>,
    pods: Table<Pod>,
    version: AtomicU64,
    unavailable: AtomicBool,
    watch_tx: broadcast::Sender<WatchEvent>,
}

impl std::fmt::Debug for InMemoryControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryControlPlane")
            .field("version", &self.version.load(Ordering::SeqCst))
            .field("unavailable", &self.unavailable.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryControlPlane {
    /// Create an empty store
    pub fn new() -> Self {
        let (watch_tx, _) = broadcast::channel(1024);
        Self {
            environments: RwLock::new(BTreeMap::new()),
            namespaces: Table::new(),
            quotas: Table::new(),
            policies: Table::new(),
            descriptors: Table::new(),
            applications: Table::new(),
            pods: Table::new(),
            version: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            watch_tx,
        }
    }

    /// Make every call fail with [`StoreError::Unavailable`] until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn notify(&self, kind: WatchEventKind, key: EnvironmentKey) {
        // No receivers is fine
        let _ = self.watch_tx.send(WatchEvent { kind, key });
    }
}

fn env_key(key: &EnvironmentKey) -> RecordKey {
    (key.namespace.clone(), key.name.clone())
}

#[async_trait]
impl EnvironmentStore for InMemoryControlPlane {
    async fn get_environment(&self, key: &EnvironmentKey) -> StoreResult<Option<Environment>> {
        self.check_available()?;
        let environments = self.environments.read().await;
        Ok(environments.get(&env_key(key)).cloned())
    }

    async fn list_environments(&self) -> StoreResult<Vec<Environment>> {
        self.check_available()?;
        let environments = self.environments.read().await;
        Ok(environments.values().cloned().collect())
    }

    async fn create_environment(&self, mut env: Environment) -> StoreResult<Environment> {
        self.check_available()?;
        let key = env.key();
        let mut environments = self.environments.write().await;
        if environments.contains_key(&env_key(&key)) {
            return Err(StoreError::AlreadyExists {
                kind: Environment::KIND,
                name: key.to_string(),
            });
        }

        env.metadata.uid = Uuid::new_v4().to_string();
        env.metadata.resource_version = self.next_version();
        env.metadata.generation = 1;
        env.metadata.creation_timestamp = Some(Utc::now());
        env.metadata.deletion_timestamp = None;
        env.status = EnvironmentStatus::default();

        environments.insert(env_key(&key), env.clone());
        drop(environments);

        self.notify(WatchEventKind::Applied, key);
        Ok(env)
    }

    async fn update_environment(&self, mut env: Environment) -> StoreResult<Environment> {
        self.check_available()?;
        let key = env.key();
        let mut environments = self.environments.write().await;
        let current = environments
            .get(&env_key(&key))
            .ok_or_else(|| StoreError::NotFound {
                kind: Environment::KIND,
                name: key.to_string(),
            })?;

        check_version::<Environment>(&env_key(&key), env.metadata.resource_version, current)?;

        env.metadata.uid = current.metadata.uid.clone();
        env.metadata.creation_timestamp = current.metadata.creation_timestamp;
        env.metadata.deletion_timestamp = current.metadata.deletion_timestamp;
        env.metadata.generation = if env.spec != current.spec {
            current.metadata.generation + 1
        } else {
            current.metadata.generation
        };
        env.status = current.status.clone();
        env.metadata.resource_version = self.next_version();

        let released = env.metadata.is_deleting() && env.metadata.finalizers.is_empty();
        if released {
            environments.remove(&env_key(&key));
        } else {
            environments.insert(env_key(&key), env.clone());
        }
        drop(environments);

        if released {
            debug!(environment = %key, "Last finalizer released, record removed");
            self.notify(WatchEventKind::Deleted, key);
        } else {
            self.notify(WatchEventKind::Applied, key);
        }
        Ok(env)
    }

    async fn update_environment_status(&self, env: &Environment) -> StoreResult<Environment> {
        self.check_available()?;
        let key = env.key();
        let mut environments = self.environments.write().await;
        let current = environments
            .get_mut(&env_key(&key))
            .ok_or_else(|| StoreError::NotFound {
                kind: Environment::KIND,
                name: key.to_string(),
            })?;

        check_version::<Environment>(&env_key(&key), env.metadata.resource_version, current)?;

        current.status = env.status.clone();
        current.metadata.resource_version = self.next_version();
        Ok(current.clone())
    }

    async fn request_environment_deletion(&self, key: &EnvironmentKey) -> StoreResult<bool> {
        self.check_available()?;
        let mut environments = self.environments.write().await;
        let Some(current) = environments.get_mut(&env_key(key)) else {
            return Err(StoreError::NotFound {
                kind: Environment::KIND,
                name: key.to_string(),
            });
        };

        if current.metadata.finalizers.is_empty() {
            environments.remove(&env_key(key));
            drop(environments);
            self.notify(WatchEventKind::Deleted, key.clone());
            return Ok(true);
        }

        if current.metadata.deletion_timestamp.is_none() {
            current.metadata.deletion_timestamp = Some(Utc::now());
            current.metadata.resource_version = self.next_version();
            drop(environments);
            self.notify(WatchEventKind::Applied, key.clone());
        }
        Ok(false)
    }

    fn watch_environments(&self) -> broadcast::Receiver<WatchEvent> {
        self.watch_tx.subscribe()
    }
}

#[async_trait]
impl NamespaceStore for InMemoryControlPlane {
    async fn get_namespace(&self, name: &str) -> StoreResult<Option<NamespaceRecord>> {
        self.check_available()?;
        Ok(self.namespaces.get("", name).await)
    }

    async fn create_namespace(&self, ns: NamespaceRecord) -> StoreResult<NamespaceRecord> {
        self.check_available()?;
        self.namespaces.create(ns, self.next_version()).await
    }

    async fn update_namespace(&self, ns: NamespaceRecord) -> StoreResult<NamespaceRecord> {
        self.check_available()?;
        self.namespaces.update(ns, self.next_version()).await
    }

    async fn delete_namespace(&self, name: &str) -> StoreResult<bool> {
        self.check_available()?;
        if !self.namespaces.delete("", name).await {
            return Ok(false);
        }

        let removed = self.quotas.delete_namespace(name).await
            + self.policies.delete_namespace(name).await
            + self.applications.delete_namespace(name).await
            + self.pods.delete_namespace(name).await;
        debug!(namespace = name, removed, "Namespace deleted with contents");
        Ok(true)
    }
}

#[async_trait]
impl QuotaStore for InMemoryControlPlane {
    async fn get_resource_quota(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<ResourceQuotaRecord>> {
        self.check_available()?;
        Ok(self.quotas.get(namespace, name).await)
    }

    async fn create_resource_quota(
        &self,
        quota: ResourceQuotaRecord,
    ) -> StoreResult<ResourceQuotaRecord> {
        self.check_available()?;
        self.quotas.create(quota, self.next_version()).await
    }

    async fn update_resource_quota(
        &self,
        quota: ResourceQuotaRecord,
    ) -> StoreResult<ResourceQuotaRecord> {
        self.check_available()?;
        self.quotas.update(quota, self.next_version()).await
    }
}

#[async_trait]
impl NetworkPolicyStore for InMemoryControlPlane {
    async fn get_network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<NetworkPolicyRecord>> {
        self.check_available()?;
        Ok(self.policies.get(namespace, name).await)
    }

    async fn list_network_policies(&self, namespace: &str) -> StoreResult<Vec<NetworkPolicyRecord>> {
        self.check_available()?;
        Ok(self.policies.list(Some(namespace)).await)
    }

    async fn create_network_policy(
        &self,
        policy: NetworkPolicyRecord,
    ) -> StoreResult<NetworkPolicyRecord> {
        self.check_available()?;
        self.policies.create(policy, self.next_version()).await
    }

    async fn update_network_policy(
        &self,
        policy: NetworkPolicyRecord,
    ) -> StoreResult<NetworkPolicyRecord> {
        self.check_available()?;
        self.policies.update(policy, self.next_version()).await
    }
}

#[async_trait]
impl DescriptorStore for InMemoryControlPlane {
    async fn get_descriptor(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<DeploymentDescriptor>> {
        self.check_available()?;
        Ok(self.descriptors.get(namespace, name).await)
    }

    async fn list_descriptors(&self, namespace: &str) -> StoreResult<Vec<DeploymentDescriptor>> {
        self.check_available()?;
        Ok(self.descriptors.list(Some(namespace)).await)
    }

    async fn create_descriptor(
        &self,
        descriptor: DeploymentDescriptor,
    ) -> StoreResult<DeploymentDescriptor> {
        self.check_available()?;
        self.descriptors.create(descriptor, self.next_version()).await
    }

    async fn update_descriptor(
        &self,
        descriptor: DeploymentDescriptor,
    ) -> StoreResult<DeploymentDescriptor> {
        self.check_available()?;
        self.descriptors.update(descriptor, self.next_version()).await
    }

    async fn delete_descriptor(&self, namespace: &str, name: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self.descriptors.delete(namespace, name).await)
    }
}

#[async_trait]
impl ApplicationStore for InMemoryControlPlane {
    async fn get_application(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<ChildApplication>> {
        self.check_available()?;
        Ok(self.applications.get(namespace, name).await)
    }

    async fn list_applications(&self, namespace: &str) -> StoreResult<Vec<ChildApplication>> {
        self.check_available()?;
        Ok(self.applications.list(Some(namespace)).await)
    }

    async fn apply_application(&self, app: ChildApplication) -> StoreResult<ChildApplication> {
        self.check_available()?;
        Ok(self.applications.apply(app, self.next_version()).await)
    }

    async fn delete_application(&self, namespace: &str, name: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self.applications.delete(namespace, name).await)
    }
}

#[async_trait]
impl WorkloadStore for InMemoryControlPlane {
    async fn list_pods(&self, namespace: &str) -> StoreResult<Vec<Pod>> {
        self.check_available()?;
        Ok(self.pods.list(Some(namespace)).await)
    }

    async fn apply_pod(&self, pod: Pod) -> StoreResult<Pod> {
        self.check_available()?;
        Ok(self.pods.apply(pod, self.next_version()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use preview_types::{labels, EnvironmentSpec, ObjectMeta, Phase};
    use std::collections::BTreeMap;

    fn test_env() -> Environment {
        Environment::new(
            "previews",
            "owner-repo-7",
            EnvironmentSpec::new("owner/repo", 7, "abcdef1").with_services(["api"]),
        )
    }

    #[tokio::test]
    async fn test_create_assigns_identity() {
        let store = InMemoryControlPlane::new();
        let env = store.create_environment(test_env()).await.unwrap();

        assert!(!env.metadata.uid.is_empty());
        assert_eq!(env.metadata.generation, 1);
        assert!(env.metadata.resource_version > 0);
        assert!(env.metadata.creation_timestamp.is_some());

        let err = store.create_environment(test_env()).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = InMemoryControlPlane::new();
        let env = store.create_environment(test_env()).await.unwrap();

        let mut first = env.clone();
        first.spec.head_sha = "abcdef2".into();
        store.update_environment(first).await.unwrap();

        let mut stale = env;
        stale.spec.head_sha = "abcdef3".into();
        let err = store.update_environment(stale).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_generation_moves_only_on_spec_change() {
        let store = InMemoryControlPlane::new();
        let env = store.create_environment(test_env()).await.unwrap();

        let mut relabelled = env.clone();
        relabelled.metadata.labels.insert("team".into(), "web".into());
        let relabelled = store.update_environment(relabelled).await.unwrap();
        assert_eq!(relabelled.metadata.generation, 1);

        let mut edited = relabelled;
        edited.spec.services.push("auth".into());
        let edited = store.update_environment(edited).await.unwrap();
        assert_eq!(edited.metadata.generation, 2);
    }

    #[tokio::test]
    async fn test_status_write_keeps_spec() {
        let store = InMemoryControlPlane::new();
        let env = store.create_environment(test_env()).await.unwrap();

        let mut with_status = env.clone();
        with_status.status.phase = Phase::Creating;
        with_status.spec.head_sha = "ffffff1".into();
        let stored = store.update_environment_status(&with_status).await.unwrap();

        assert_eq!(stored.status.phase, Phase::Creating);
        assert_eq!(stored.spec.head_sha, "abcdef1");
        assert_eq!(stored.metadata.generation, 1);
    }

    #[tokio::test]
    async fn test_deletion_waits_for_finalizers() {
        let store = InMemoryControlPlane::new();
        let mut env = store.create_environment(test_env()).await.unwrap();
        env.metadata
            .finalizers
            .push(labels::CLEANUP_FINALIZER.to_string());
        let env = store.update_environment(env).await.unwrap();

        assert!(!store.request_environment_deletion(&env.key()).await.unwrap());
        let mut deleting = store.get_environment(&env.key()).await.unwrap().unwrap();
        assert!(deleting.metadata.is_deleting());

        deleting.metadata.finalizers.clear();
        store.update_environment(deleting).await.unwrap();
        assert!(store.get_environment(&env.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deletion_without_finalizers_is_immediate() {
        let store = InMemoryControlPlane::new();
        let env = store.create_environment(test_env()).await.unwrap();
        assert!(store.request_environment_deletion(&env.key()).await.unwrap());
        assert!(store.get_environment(&env.key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watch_reports_changes() {
        let store = InMemoryControlPlane::new();
        let mut rx = store.watch_environments();

        let env = store.create_environment(test_env()).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::Applied);
        assert_eq!(event.key, env.key());

        store.request_environment_deletion(&env.key()).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::Deleted);
    }

    #[tokio::test]
    async fn test_namespace_delete_cascades_contents() {
        let store = InMemoryControlPlane::new();
        store
            .create_namespace(NamespaceRecord::new(ObjectMeta::new("preview-pr-7-aaaaaaaa")))
            .await
            .unwrap();
        store
            .create_resource_quota(ResourceQuotaRecord {
                metadata: ObjectMeta::namespaced("preview-pr-7-aaaaaaaa", "preview-quota"),
                hard: BTreeMap::new(),
            })
            .await
            .unwrap();

        assert!(store.delete_namespace("preview-pr-7-aaaaaaaa").await.unwrap());
        assert!(store
            .get_resource_quota("preview-pr-7-aaaaaaaa", "preview-quota")
            .await
            .unwrap()
            .is_none());
        assert!(!store.delete_namespace("preview-pr-7-aaaaaaaa").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = InMemoryControlPlane::new();
        store.set_unavailable(true);
        let err = store.list_environments().await.unwrap_err();
        assert!(err.is_retryable());

        store.set_unavailable(false);
        assert!(store.list_environments().await.unwrap().is_empty());
    }
}
