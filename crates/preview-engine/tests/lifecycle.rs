//! End-to-end lifecycle tests against the in-memory control plane
//!
//! The external GitOps engine is simulated by rendering every descriptor and
//! writing child applications back with a chosen health.

use async_trait::async_trait;
use parking_lot::Mutex;
use preview_cost::{CostEstimator, PricingConfig, PricingHandle};
use preview_engine::{
    CleanupConfig, CleanupScheduler, CommitState, Controller, ControllerConfig, EngineConfig,
    EngineError, PullRequestDiff, ReconcileAction, Reconciler, RepositoryClient, RepositoryError,
};
use preview_gitops::{render_children, DescriptorGenerator, GitOpsConfig};
use preview_isolation::{IsolationConfig, IsolationManager};
use preview_store::{
    ApplicationStore, ControlPlaneStore, DescriptorStore, EnvironmentStore, InMemoryControlPlane,
    NamespaceStore, NetworkPolicyStore, QuotaStore, StoreError, StoreResult, WatchEvent,
    WorkloadStore,
};
use preview_types::{
    labels, ChildApplication, ChildApplicationStatus, ConditionKind, Container,
    DeploymentDescriptor, Environment, EnvironmentKey, EnvironmentSpec, HealthStatus,
    NamespaceRecord, NetworkPolicyRecord, ObjectMeta, Phase, Pod, PodPhase, ResourceQuotaRecord,
    SyncStatus,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

// ========== Test doubles ==========

/// In-memory control plane whose namespace reads can be made to fail
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryControlPlane,
    namespace_failures: AtomicU32,
}

impl FlakyStore {
    fn fail_namespace_reads(&self, times: u32) {
        self.namespace_failures.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl EnvironmentStore for FlakyStore {
    async fn get_environment(&self, key: &EnvironmentKey) -> StoreResult<Option<Environment>> {
        self.inner.get_environment(key).await
    }

    async fn list_environments(&self) -> StoreResult<Vec<Environment>> {
        self.inner.list_environments().await
    }

    async fn create_environment(&self, env: Environment) -> StoreResult<Environment> {
        self.inner.create_environment(env).await
    }

    async fn update_environment(&self, env: Environment) -> StoreResult<Environment> {
        self.inner.update_environment(env).await
    }

    async fn update_environment_status(&self, env: &Environment) -> StoreResult<Environment> {
        self.inner.update_environment_status(env).await
    }

    async fn request_environment_deletion(&self, key: &EnvironmentKey) -> StoreResult<bool> {
        self.inner.request_environment_deletion(key).await
    }

    fn watch_environments(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.watch_environments()
    }
}

#[async_trait]
impl NamespaceStore for FlakyStore {
    async fn get_namespace(&self, name: &str) -> StoreResult<Option<NamespaceRecord>> {
        let throttled = self
            .namespace_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(StoreError::Unavailable("throttled".into()));
        }
        self.inner.get_namespace(name).await
    }

    async fn create_namespace(&self, ns: NamespaceRecord) -> StoreResult<NamespaceRecord> {
        self.inner.create_namespace(ns).await
    }

    async fn update_namespace(&self, ns: NamespaceRecord) -> StoreResult<NamespaceRecord> {
        self.inner.update_namespace(ns).await
    }

    async fn delete_namespace(&self, name: &str) -> StoreResult<bool> {
        self.inner.delete_namespace(name).await
    }
}

#[async_trait]
impl QuotaStore for FlakyStore {
    async fn get_resource_quota(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<ResourceQuotaRecord>> {
        self.inner.get_resource_quota(namespace, name).await
    }

    async fn create_resource_quota(
        &self,
        quota: ResourceQuotaRecord,
    ) -> StoreResult<ResourceQuotaRecord> {
        self.inner.create_resource_quota(quota).await
    }

    async fn update_resource_quota(
        &self,
        quota: ResourceQuotaRecord,
    ) -> StoreResult<ResourceQuotaRecord> {
        self.inner.update_resource_quota(quota).await
    }
}

#[async_trait]
impl NetworkPolicyStore for FlakyStore {
    async fn get_network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<NetworkPolicyRecord>> {
        self.inner.get_network_policy(namespace, name).await
    }

    async fn list_network_policies(&self, namespace: &str) -> StoreResult<Vec<NetworkPolicyRecord>> {
        self.inner.list_network_policies(namespace).await
    }

    async fn create_network_policy(
        &self,
        policy: NetworkPolicyRecord,
    ) -> StoreResult<NetworkPolicyRecord> {
        self.inner.create_network_policy(policy).await
    }

    async fn update_network_policy(
        &self,
        policy: NetworkPolicyRecord,
    ) -> StoreResult<NetworkPolicyRecord> {
        self.inner.update_network_policy(policy).await
    }
}

#[async_trait]
impl DescriptorStore for FlakyStore {
    async fn get_descriptor(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<DeploymentDescriptor>> {
        self.inner.get_descriptor(namespace, name).await
    }

    async fn list_descriptors(&self, namespace: &str) -> StoreResult<Vec<DeploymentDescriptor>> {
        self.inner.list_descriptors(namespace).await
    }

    async fn create_descriptor(
        &self,
        descriptor: DeploymentDescriptor,
    ) -> StoreResult<DeploymentDescriptor> {
        self.inner.create_descriptor(descriptor).await
    }

    async fn update_descriptor(
        &self,
        descriptor: DeploymentDescriptor,
    ) -> StoreResult<DeploymentDescriptor> {
        self.inner.update_descriptor(descriptor).await
    }

    async fn delete_descriptor(&self, namespace: &str, name: &str) -> StoreResult<bool> {
        self.inner.delete_descriptor(namespace, name).await
    }
}

#[async_trait]
impl ApplicationStore for FlakyStore {
    async fn get_application(
        &self,
        namespace: &str,
        name: &str,
    ) -> StoreResult<Option<ChildApplication>> {
        self.inner.get_application(namespace, name).await
    }

    async fn list_applications(&self, namespace: &str) -> StoreResult<Vec<ChildApplication>> {
        self.inner.list_applications(namespace).await
    }

    async fn apply_application(&self, app: ChildApplication) -> StoreResult<ChildApplication> {
        self.inner.apply_application(app).await
    }

    async fn delete_application(&self, namespace: &str, name: &str) -> StoreResult<bool> {
        self.inner.delete_application(namespace, name).await
    }
}

#[async_trait]
impl WorkloadStore for FlakyStore {
    async fn list_pods(&self, namespace: &str) -> StoreResult<Vec<Pod>> {
        self.inner.list_pods(namespace).await
    }

    async fn apply_pod(&self, pod: Pod) -> StoreResult<Pod> {
        self.inner.apply_pod(pod).await
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ReportedStatus {
    state: CommitState,
    url: Option<String>,
    description: String,
}

/// Tracks overlapping `fetch_diff` calls, overall and per pull request
struct DiffGauge {
    latency: Duration,
    state: Mutex<GaugeState>,
}

#[derive(Default)]
struct GaugeState {
    calls: u32,
    in_flight: u32,
    peak: u32,
    in_flight_by_pr: HashMap<u64, u32>,
    peak_by_pr: HashMap<u64, u32>,
}

impl DiffGauge {
    fn new(latency: Duration) -> Self {
        Self {
            latency,
            state: Mutex::new(GaugeState::default()),
        }
    }

    fn enter(&self, pr_number: u64) {
        let mut state = self.state.lock();
        state.calls += 1;
        state.in_flight += 1;
        state.peak = state.peak.max(state.in_flight);
        let current = {
            let entry = state.in_flight_by_pr.entry(pr_number).or_default();
            *entry += 1;
            *entry
        };
        let peak = state.peak_by_pr.entry(pr_number).or_default();
        *peak = (*peak).max(current);
    }

    fn exit(&self, pr_number: u64) {
        let mut state = self.state.lock();
        state.in_flight -= 1;
        if let Some(entry) = state.in_flight_by_pr.get_mut(&pr_number) {
            *entry -= 1;
        }
    }

    fn calls(&self) -> u32 {
        self.state.lock().calls
    }

    fn peak(&self) -> u32 {
        self.state.lock().peak
    }

    fn peak_for(&self, pr_number: u64) -> u32 {
        self.state.lock().peak_by_pr.get(&pr_number).copied().unwrap_or(0)
    }
}

/// Repository client with a fixed diff that records commit statuses
#[derive(Default)]
struct ScriptedRepository {
    diff: Option<PullRequestDiff>,
    hang: bool,
    gauge: Option<DiffGauge>,
    statuses: Mutex<Vec<ReportedStatus>>,
}

impl ScriptedRepository {
    fn with_diff(files: &[&str]) -> Self {
        Self {
            diff: Some(PullRequestDiff {
                files: files.iter().map(|f| f.to_string()).collect(),
            }),
            ..Default::default()
        }
    }

    fn states(&self) -> Vec<CommitState> {
        self.statuses.lock().iter().map(|s| s.state).collect()
    }
}

#[async_trait]
impl RepositoryClient for ScriptedRepository {
    async fn fetch_diff(
        &self,
        _repository: &str,
        pr_number: u64,
    ) -> Result<PullRequestDiff, RepositoryError> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(gauge) = &self.gauge {
            gauge.enter(pr_number);
            tokio::time::sleep(gauge.latency).await;
            gauge.exit(pr_number);
        }
        self.diff
            .clone()
            .ok_or_else(|| RepositoryError::Unavailable("offline".into()))
    }

    async fn update_commit_status(
        &self,
        _repository: &str,
        _revision: &str,
        state: CommitState,
        url: Option<&str>,
        description: &str,
    ) -> Result<(), RepositoryError> {
        self.statuses.lock().push(ReportedStatus {
            state,
            url: url.map(str::to_string),
            description: description.to_string(),
        });
        Ok(())
    }
}

// ========== Harness ==========

struct Harness {
    store: Arc<FlakyStore>,
    repository: Arc<ScriptedRepository>,
    reconciler: Arc<Reconciler>,
}

impl Harness {
    fn new() -> Self {
        Self::with(ScriptedRepository::default(), EngineConfig::default())
    }

    fn with(repository: ScriptedRepository, config: EngineConfig) -> Self {
        let store = Arc::new(FlakyStore::default());
        let dyn_store: Arc<dyn ControlPlaneStore> = store.clone();
        let repository = Arc::new(repository);
        let reconciler = Reconciler::new(
            dyn_store.clone(),
            IsolationManager::new(dyn_store.clone(), IsolationConfig::default()),
            DescriptorGenerator::new(dyn_store, GitOpsConfig::default()),
            CostEstimator::new(PricingHandle::new(PricingConfig::default()).unwrap()),
            repository.clone(),
            config,
        );
        Self {
            store,
            repository,
            reconciler: Arc::new(reconciler),
        }
    }

    fn dyn_store(&self) -> Arc<dyn ControlPlaneStore> {
        self.store.clone()
    }

    async fn create(&self, name: &str, spec: EnvironmentSpec) -> EnvironmentKey {
        self.store
            .create_environment(Environment::new("previews", name, spec))
            .await
            .unwrap()
            .key()
    }

    async fn tick(&self, key: &EnvironmentKey) -> Result<ReconcileAction, EngineError> {
        self.reconciler
            .reconcile(key, Instant::now() + Duration::from_secs(30))
            .await
    }

    async fn get(&self, key: &EnvironmentKey) -> Environment {
        self.store.get_environment(key).await.unwrap().unwrap()
    }

    /// Play the GitOps engine: generate every child and report `health`
    async fn sync_children(&self, health: HealthStatus) {
        for descriptor in self.store.list_descriptors("argocd").await.unwrap() {
            for mut child in render_children(&descriptor) {
                child.status = ChildApplicationStatus {
                    health,
                    sync_status: SyncStatus::Synced,
                    message: String::new(),
                };
                self.store.apply_application(child).await.unwrap();
            }
        }
    }
}

fn spec(pr_number: u64) -> EnvironmentSpec {
    EnvironmentSpec::new("acme/shop", pr_number, "abc1234def")
        .with_services(["auth", "api"])
        .with_ttl(Duration::from_secs(4 * 3600))
}

fn running_pod(namespace: &str, name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta::namespaced(namespace, name),
        containers: vec![Container::with_requests("app", "500m", "1Gi")],
        phase: PodPhase::Running,
    }
}

fn requeue(secs: u64) -> ReconcileAction {
    ReconcileAction::Requeue(Duration::from_secs(secs))
}

async fn wait_until<F>(store: &FlakyStore, key: &EnvironmentKey, mut done: F)
where
    F: FnMut(Option<&Environment>) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let env = store.get_environment(key).await.unwrap();
        if done(env.as_ref()) {
            return;
        }
        assert!(Instant::now() < deadline, "environment {} never reached the expected state", key);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ========== Convergence ==========

#[tokio::test]
async fn test_environment_becomes_ready() {
    let h = Harness::new();
    let key = h.create("pr-123", spec(123)).await;

    assert_eq!(h.tick(&key).await.unwrap(), requeue(10));
    let env = h.get(&key).await;
    assert_eq!(env.phase(), Phase::Creating);
    assert!(env.metadata.has_finalizer(labels::CLEANUP_FINALIZER));
    assert!(env.status.is_condition_true(ConditionKind::Admitted));
    assert!(!env.status.is_condition_true(ConditionKind::ServicesReady));

    let namespace = env.status.namespace.clone().unwrap();
    assert!(namespace.starts_with("preview-pr-123-"));
    assert!(h.store.get_namespace(&namespace).await.unwrap().is_some());
    assert!(h
        .store
        .get_resource_quota(&namespace, "preview-quota")
        .await
        .unwrap()
        .is_some());
    assert_eq!(h.store.list_network_policies(&namespace).await.unwrap().len(), 3);
    assert!(h
        .store
        .get_descriptor("argocd", "preview-123")
        .await
        .unwrap()
        .is_some());

    h.sync_children(HealthStatus::Healthy).await;
    h.store.apply_pod(running_pod(&namespace, "auth-0")).await.unwrap();

    assert_eq!(h.tick(&key).await.unwrap(), requeue(300));
    let env = h.get(&key).await;
    assert_eq!(env.phase(), Phase::Ready);
    assert_eq!(env.status.url.as_deref(), Some("https://pr-123.preview.example.com"));
    assert_eq!(env.status.retry_count, 0);

    let created = env.metadata.creation_timestamp.unwrap();
    let expires = env.status.expires_at.unwrap();
    let drift = expires - created - chrono::Duration::hours(4);
    assert!(drift.num_seconds().abs() <= 1);

    let names: Vec<&str> = env.status.services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["auth", "api"]);
    assert!(env.status.services.iter().all(|s| s.ready));
    assert_eq!(
        env.status.services[0].url.as_deref(),
        Some("https://auth-pr-123.preview.example.com")
    );

    for kind in [
        ConditionKind::Admitted,
        ConditionKind::IsolationReady,
        ConditionKind::DescriptorSynced,
        ConditionKind::ServicesReady,
        ConditionKind::Ready,
    ] {
        assert!(env.status.is_condition_true(kind), "{:?} should be true", kind);
    }

    // 0.5 cores * 0.04 + 1 GiB * 0.005 per hour, over a 4h TTL
    let cost = env.status.cost.unwrap();
    assert_eq!(cost.currency, "USD");
    assert_eq!(cost.hourly_cost, "0.0250");
    assert_eq!(cost.total_cost, "0.1000");

    let statuses = h.repository.statuses.lock().clone();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].state, CommitState::Pending);
    assert_eq!(statuses[1].state, CommitState::Success);
    assert_eq!(statuses[1].url.as_deref(), Some("https://pr-123.preview.example.com"));
    assert!(statuses[1].description.contains("ready"));
}

#[tokio::test]
async fn test_ready_is_stable_across_ticks() {
    let h = Harness::new();
    let key = h.create("pr-8", spec(8)).await;

    h.tick(&key).await.unwrap();
    h.sync_children(HealthStatus::Healthy).await;
    h.tick(&key).await.unwrap();
    assert_eq!(h.get(&key).await.phase(), Phase::Ready);

    assert_eq!(h.tick(&key).await.unwrap(), requeue(300));
    assert_eq!(h.get(&key).await.phase(), Phase::Ready);
    // No further commit status for an unchanged phase
    assert_eq!(h.repository.states(), vec![CommitState::Pending, CommitState::Success]);
}

#[tokio::test]
async fn test_unhealthy_child_keeps_environment_converging() {
    let h = Harness::new();
    let key = h.create("pr-9", spec(9)).await;

    h.tick(&key).await.unwrap();
    h.sync_children(HealthStatus::Degraded).await;

    assert_eq!(h.tick(&key).await.unwrap(), requeue(10));
    let env = h.get(&key).await;
    assert_eq!(env.phase(), Phase::Creating);
    assert!(env.status.services.iter().all(|s| !s.ready));
    assert_eq!(env.status.services[0].health, HealthStatus::Degraded);

    let services_ready = env.status.condition(ConditionKind::ServicesReady).unwrap();
    assert!(!services_ready.status);
    assert_eq!(services_ready.reason, "ServicesProgressing");
}

#[tokio::test]
async fn test_new_revision_passes_through_updating() {
    let h = Harness::new();
    let key = h.create("pr-11", spec(11)).await;

    let mut phases = Vec::new();
    h.tick(&key).await.unwrap();
    phases.push(h.get(&key).await.phase());
    h.sync_children(HealthStatus::Healthy).await;
    h.tick(&key).await.unwrap();
    phases.push(h.get(&key).await.phase());

    let mut env = h.get(&key).await;
    env.spec.head_sha = "fedcba9876".to_string();
    h.store.update_environment(env).await.unwrap();

    // Children still report the old revision as healthy
    assert_eq!(h.tick(&key).await.unwrap(), requeue(10));
    phases.push(h.get(&key).await.phase());

    let descriptor = h
        .store
        .get_descriptor("argocd", "preview-11")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(descriptor.spec.template.source.target_revision, "fedcba9876");

    h.sync_children(HealthStatus::Healthy).await;
    h.tick(&key).await.unwrap();
    phases.push(h.get(&key).await.phase());

    assert_eq!(
        phases,
        vec![Phase::Creating, Phase::Ready, Phase::Updating, Phase::Ready]
    );
    let env = h.get(&key).await;
    assert_eq!(env.status.last_applied.unwrap().head_sha, "fedcba9876");
}

#[tokio::test]
async fn test_ttl_edit_keeps_environment_ready() {
    let h = Harness::new();
    let key = h.create("pr-12", spec(12)).await;
    h.tick(&key).await.unwrap();
    h.sync_children(HealthStatus::Healthy).await;
    h.tick(&key).await.unwrap();
    assert_eq!(h.get(&key).await.phase(), Phase::Ready);

    let mut env = h.get(&key).await;
    env.spec.ttl = Duration::from_secs(8 * 3600);
    let generation = h.store.update_environment(env).await.unwrap().metadata.generation;

    assert_eq!(h.tick(&key).await.unwrap(), requeue(300));
    let env = h.get(&key).await;
    assert_eq!(env.phase(), Phase::Ready);
    assert_eq!(env.status.observed_generation, generation);
    let drift = env.status.expires_at.unwrap()
        - env.metadata.creation_timestamp.unwrap()
        - chrono::Duration::hours(8);
    assert!(drift.num_seconds().abs() <= 1);
    assert_eq!(h.repository.states(), vec![CommitState::Pending, CommitState::Success]);
}

#[tokio::test]
async fn test_services_detected_from_diff() {
    let repository = ScriptedRepository::with_diff(&["services/web/src/main.rs", "README.md"]);
    let h = Harness::with(repository, EngineConfig::default());
    let key = h.create("pr-21", spec(21).with_services(["auth"])).await;

    h.tick(&key).await.unwrap();
    let env = h.get(&key).await;
    let names: Vec<&str> = env.status.services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["web"]);
    assert_eq!(env.status.last_applied.unwrap().services, vec!["web"]);

    let descriptor = h
        .store
        .get_descriptor("argocd", "preview-21")
        .await
        .unwrap()
        .unwrap();
    let elements = &descriptor.spec.generators[0].elements;
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].get("service").map(String::as_str), Some("web"));
}

#[tokio::test]
async fn test_invalid_diff_directories_are_ignored() {
    let repository = ScriptedRepository::with_diff(&["services/Payment_Svc/main.rs"]);
    let h = Harness::with(repository, EngineConfig::default());
    let key = h.create("pr-22", spec(22)).await;

    assert_eq!(h.tick(&key).await.unwrap(), requeue(10));
    let env = h.get(&key).await;
    assert_eq!(env.phase(), Phase::Creating);
    assert_eq!(env.status.failure_reason, None);
    assert_eq!(env.status.last_applied.unwrap().services, vec!["auth", "api"]);
}

#[tokio::test]
async fn test_valid_diff_directories_survive_invalid_siblings() {
    let repository = ScriptedRepository::with_diff(&[
        "services/Payment_Svc/main.rs",
        "services/web/index.ts",
    ]);
    let h = Harness::with(repository, EngineConfig::default());
    let key = h.create("pr-23", spec(23)).await;

    h.tick(&key).await.unwrap();
    let env = h.get(&key).await;
    assert_eq!(env.phase(), Phase::Creating);
    assert_eq!(env.status.last_applied.unwrap().services, vec!["web"]);
}

// ========== Failure handling ==========

#[tokio::test]
async fn test_invalid_spec_fails_until_edited() {
    let h = Harness::new();
    let mut bad = spec(31);
    bad.head_sha = "not-a-sha".to_string();
    let key = h.create("pr-31", bad).await;

    assert_eq!(h.tick(&key).await.unwrap(), ReconcileAction::AwaitChange);
    let env = h.get(&key).await;
    assert_eq!(env.phase(), Phase::Failed);
    assert_eq!(env.status.failure_reason.as_deref(), Some("InvalidRevision"));
    let ready = env.status.condition(ConditionKind::Ready).unwrap();
    assert!(!ready.status);
    assert_eq!(ready.reason, "InvalidRevision");
    assert_eq!(h.repository.states(), vec![CommitState::Failure]);

    // Nothing changes without a spec edit
    let version = env.metadata.resource_version;
    assert_eq!(h.tick(&key).await.unwrap(), ReconcileAction::AwaitChange);
    assert_eq!(h.get(&key).await.metadata.resource_version, version);

    let mut env = h.get(&key).await;
    env.spec.head_sha = "abc1234def".to_string();
    h.store.update_environment(env).await.unwrap();

    assert_eq!(h.tick(&key).await.unwrap(), requeue(10));
    let env = h.get(&key).await;
    assert_eq!(env.phase(), Phase::Creating);
    assert_eq!(env.status.failure_reason, None);
    assert_eq!(env.status.retry_count, 0);
}

#[tokio::test]
async fn test_no_services_is_permanent() {
    let h = Harness::new();
    let key = h.create("pr-32", spec(32).with_services(Vec::<String>::new())).await;

    assert_eq!(h.tick(&key).await.unwrap(), ReconcileAction::AwaitChange);
    let env = h.get(&key).await;
    assert_eq!(env.phase(), Phase::Failed);
    assert_eq!(env.status.failure_reason.as_deref(), Some("NoServices"));
}

#[tokio::test]
async fn test_transient_failures_back_off() {
    let h = Harness::new();
    let key = h.create("pr-41", spec(41)).await;
    h.store.fail_namespace_reads(2);

    assert_eq!(h.tick(&key).await.unwrap(), requeue(5));
    let env = h.get(&key).await;
    assert_eq!(env.phase(), Phase::Creating);
    assert_eq!(env.status.retry_count, 1);
    let isolation = env.status.condition(ConditionKind::IsolationReady).unwrap();
    assert!(!isolation.status);
    assert_eq!(isolation.reason, "NamespaceError");

    assert_eq!(h.tick(&key).await.unwrap(), requeue(10));
    assert_eq!(h.get(&key).await.status.retry_count, 2);

    assert_eq!(h.tick(&key).await.unwrap(), requeue(10));
    let env = h.get(&key).await;
    assert_eq!(env.phase(), Phase::Creating);
    assert_eq!(env.status.retry_count, 0);
    assert!(env.status.is_condition_true(ConditionKind::IsolationReady));
}

#[tokio::test]
async fn test_retries_exhausted_recovers_after_outage() {
    let h = Harness::new();
    let key = h.create("pr-42", spec(42)).await;
    h.store.fail_namespace_reads(7);

    for delay in [5, 10, 20, 40, 80] {
        assert_eq!(h.tick(&key).await.unwrap(), requeue(delay));
    }
    assert_eq!(h.tick(&key).await.unwrap(), requeue(180));

    let env = h.get(&key).await;
    assert_eq!(env.phase(), Phase::Failed);
    assert_eq!(env.status.failure_reason.as_deref(), Some("RetriesExhausted"));
    assert_eq!(h.repository.states(), vec![CommitState::Pending, CommitState::Failure]);

    // Still failing: stays Failed and keeps trying at the capped delay
    assert_eq!(h.tick(&key).await.unwrap(), requeue(180));
    assert_eq!(h.get(&key).await.phase(), Phase::Failed);
    assert_eq!(h.repository.states().len(), 2);

    // The outage is over; no spec edit is needed
    assert_eq!(h.tick(&key).await.unwrap(), requeue(10));
    let env = h.get(&key).await;
    assert_eq!(env.phase(), Phase::Creating);
    assert_eq!(env.status.failure_reason, None);
    assert_eq!(env.status.retry_count, 0);
    assert!(env.status.is_condition_true(ConditionKind::IsolationReady));
    assert_eq!(
        h.repository.states(),
        vec![CommitState::Pending, CommitState::Failure, CommitState::Pending]
    );
}

#[tokio::test]
async fn test_deadline_abandons_tick_without_status_write() {
    let repository = ScriptedRepository {
        hang: true,
        ..Default::default()
    };
    let h = Harness::with(repository, EngineConfig::default());
    let key = h.create("pr-51", spec(51)).await;

    let result = h
        .reconciler
        .reconcile(&key, Instant::now() + Duration::from_millis(50))
        .await;
    assert!(matches!(result, Err(EngineError::DeadlineExceeded(_))));

    let env = h.get(&key).await;
    assert_eq!(env.phase(), Phase::Pending);
    assert_eq!(env.status.retry_count, 0);
}

// ========== Teardown ==========

#[tokio::test]
async fn test_deletion_takes_two_ticks() {
    let h = Harness::new();
    let key = h.create("pr-61", spec(61)).await;
    h.tick(&key).await.unwrap();
    h.sync_children(HealthStatus::Healthy).await;
    h.tick(&key).await.unwrap();
    let namespace = h.get(&key).await.status.namespace.unwrap();

    assert!(!h.store.request_environment_deletion(&key).await.unwrap());

    assert_eq!(h.tick(&key).await.unwrap(), requeue(1));
    let env = h.get(&key).await;
    assert_eq!(env.phase(), Phase::Deleting);
    assert!(h.store.get_namespace(&namespace).await.unwrap().is_some());

    assert_eq!(h.tick(&key).await.unwrap(), ReconcileAction::Done);
    assert!(h.store.get_environment(&key).await.unwrap().is_none());
    assert!(h.store.get_namespace(&namespace).await.unwrap().is_none());
    assert!(h
        .store
        .get_descriptor("argocd", "preview-61")
        .await
        .unwrap()
        .is_none());
    assert!(h
        .store
        .get_application("argocd", "preview-61-auth")
        .await
        .unwrap()
        .is_none());

    assert_eq!(h.tick(&key).await.unwrap(), ReconcileAction::Done);
}

#[tokio::test]
async fn test_expired_environment_is_torn_down() {
    let h = Harness::new();
    let key = h.create("pr-71", spec(71).with_ttl(Duration::from_secs(1))).await;
    h.tick(&key).await.unwrap();
    let namespace = h.get(&key).await.status.namespace.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(h.tick(&key).await.unwrap(), requeue(1));
    let env = h.get(&key).await;
    assert!(env.metadata.is_deleting());
    assert_eq!(env.phase(), Phase::Deleting);

    assert_eq!(h.tick(&key).await.unwrap(), ReconcileAction::Done);
    assert!(h.store.get_environment(&key).await.unwrap().is_none());
    assert!(h.store.get_namespace(&namespace).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cleanup_sweep_honors_do_not_expire() {
    let h = Harness::new();
    let expiring = h.create("pr-81", spec(81).with_ttl(Duration::from_secs(1))).await;

    let mut pinned = Environment::new("previews", "pr-82", spec(82).with_ttl(Duration::from_secs(1)));
    pinned
        .metadata
        .annotations
        .insert(labels::DO_NOT_EXPIRE.to_string(), "true".to_string());
    let pinned = h.store.create_environment(pinned).await.unwrap().key();

    h.tick(&expiring).await.unwrap();
    h.tick(&pinned).await.unwrap();
    let namespace = h.get(&expiring).await.status.namespace.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let controller = Arc::new(Controller::new(
        h.reconciler.clone(),
        h.dyn_store(),
        ControllerConfig::default(),
    ));
    let cleanup = CleanupScheduler::new(h.dyn_store(), controller.clone(), CleanupConfig::default());

    let swept = cleanup.sweep().await.unwrap();
    assert_eq!(swept, vec![expiring.clone()]);

    let env = h.get(&expiring).await;
    assert_eq!(env.phase(), Phase::Deleting);
    assert!(env.status.cost.unwrap().actual_cost.is_some());

    assert_eq!(
        controller.reconcile_key(&expiring).await.unwrap(),
        ReconcileAction::Done
    );
    assert!(h.store.get_environment(&expiring).await.unwrap().is_none());
    assert!(h.store.get_namespace(&namespace).await.unwrap().is_none());

    // The pinned environment is untouched by both the sweep and its own tick
    h.tick(&pinned).await.unwrap();
    let env = h.get(&pinned).await;
    assert!(!env.metadata.is_deleting());
    assert_eq!(env.phase(), Phase::Creating);
}

// ========== Dispatcher ==========

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_controller_drives_full_lifecycle() {
    let config = EngineConfig {
        progress_requeue_secs: 1,
        ..EngineConfig::default()
    };
    let h = Harness::with(ScriptedRepository::default(), config);
    let controller = Arc::new(Controller::new(
        h.reconciler.clone(),
        h.dyn_store(),
        ControllerConfig::default(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(controller.clone().run(shutdown_rx));

    // Let the controller subscribe before the first event
    tokio::time::sleep(Duration::from_millis(50)).await;
    let key = h.create("pr-91", spec(91)).await;

    wait_until(&h.store, &key, |env| env.is_some_and(|e| e.phase() == Phase::Creating)).await;
    h.sync_children(HealthStatus::Healthy).await;
    wait_until(&h.store, &key, |env| env.is_some_and(|e| e.phase() == Phase::Ready)).await;

    h.store.request_environment_deletion(&key).await.unwrap();
    wait_until(&h.store, &key, |env| env.is_none()).await;
    assert!(h
        .store
        .get_descriptor("argocd", "preview-91")
        .await
        .unwrap()
        .is_none());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(35), running)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_tick_per_environment_at_a_time() {
    let repository = ScriptedRepository {
        gauge: Some(DiffGauge::new(Duration::from_millis(50))),
        ..Default::default()
    };
    let h = Harness::with(repository, EngineConfig::default());
    // Ticks never get past the namespace, so every tick fetches the diff
    h.store.fail_namespace_reads(u32::MAX);
    let first = h.create("pr-101", spec(101)).await;
    let second = h.create("pr-102", spec(102)).await;

    let controller = Arc::new(Controller::new(
        h.reconciler.clone(),
        h.dyn_store(),
        ControllerConfig::default(),
    ));
    for _ in 0..8 {
        controller.spawn_reconcile(first.clone());
        controller.spawn_reconcile(second.clone());
    }

    let gauge = h.repository.gauge.as_ref().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while gauge.calls() < 16 {
        assert!(Instant::now() < deadline, "only {} ticks ran", gauge.calls());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(gauge.peak_for(101), 1);
    assert_eq!(gauge.peak_for(102), 1);
    // Different environments are not serialised against each other
    assert!(gauge.peak() >= 2);
}

#[tokio::test]
async fn test_stopped_controller_runs_no_ticks() {
    let h = Harness::new();
    let controller = Arc::new(Controller::new(
        h.reconciler.clone(),
        h.dyn_store(),
        ControllerConfig::default(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(controller.clone().run(shutdown_rx));
    shutdown_tx.send(true).unwrap();
    running.await.unwrap();

    let key = h.create("pr-111", spec(111)).await;
    assert_eq!(
        controller.reconcile_key(&key).await.unwrap(),
        ReconcileAction::AwaitChange
    );
    let env = h.get(&key).await;
    assert_eq!(env.phase(), Phase::Pending);
    assert!(env.metadata.finalizers.is_empty());
}
