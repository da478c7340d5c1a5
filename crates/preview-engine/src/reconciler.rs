//! Reconciliation engine
//!
//! One [`Reconciler::reconcile`] call is one tick for one environment. A tick
//! reads the record, converges the isolation boundary and the GitOps
//! descriptor, observes child health and cost, and writes the observed status
//! last. Ticks are idempotent; the dispatcher guarantees at most one tick per
//! environment at a time.
//!
//! ## Lifecycle
//!
//! ```text
//! Pending -> Creating -> Ready <-> Updating
//!               |          |          |
//!               +--> Failed <---------+      (any) -> Deleting -> removed
//! ```
//!
//! Teardown takes two ticks: the first records `Deleting`, the second
//! deletes the namespace and descriptor, confirms both are gone and releases
//! the finalizer.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::repository::{detect_services_from_diff, CommitState, RepositoryClient};
use chrono::{DateTime, Utc};
use preview_cost::CostEstimator;
use preview_gitops::DescriptorGenerator;
use preview_isolation::{generate_namespace_name, IsolationError, IsolationManager};
use preview_store::{retry_on_conflict, ControlPlaneStore, DEFAULT_CONFLICT_RETRIES};
use preview_types::validation::{validate_name_length, validate_service_name, validate_services};
use preview_types::{
    labels, AppliedRevision, ConditionKind, CostSnapshot, Environment, EnvironmentKey,
    EnvironmentStatus, Phase, Pod, ServiceStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Failure reason recorded when transient failures outlast the retry budget
pub const RETRIES_EXHAUSTED: &str = "RetriesExhausted";

/// What the dispatcher should do after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Run again after the delay
    Requeue(Duration),
    /// Nothing to do until the record changes
    AwaitChange,
    /// The record is gone
    Done,
}

/// Result of converging owned resources for one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Ready,
    Converging,
}

/// The per-environment state machine
pub struct Reconciler {
    store: Arc<dyn ControlPlaneStore>,
    isolation: IsolationManager,
    gitops: DescriptorGenerator,
    cost: CostEstimator,
    repository: Arc<dyn RepositoryClient>,
    config: EngineConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ControlPlaneStore>,
        isolation: IsolationManager,
        gitops: DescriptorGenerator,
        cost: CostEstimator,
        repository: Arc<dyn RepositoryClient>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            isolation,
            gitops,
            cost,
            repository,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one tick for `key`, abandoning it at `deadline`.
    ///
    /// A tick cut off by the deadline writes no status.
    #[instrument(skip(self, key, deadline), fields(environment = %key))]
    pub async fn reconcile(
        &self,
        key: &EnvironmentKey,
        deadline: Instant,
    ) -> Result<ReconcileAction> {
        match tokio::time::timeout_at(deadline, self.tick(key)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Reconcile deadline exceeded");
                Err(EngineError::DeadlineExceeded(key.clone()))
            }
        }
    }

    async fn tick(&self, key: &EnvironmentKey) -> Result<ReconcileAction> {
        let Some(mut env) = self.load(key).await? else {
            debug!("Environment gone");
            return Ok(ReconcileAction::Done);
        };
        let now = Utc::now();

        if !env.metadata.is_deleting() && env.is_expired(now) {
            info!(expired_at = ?env.expires_at(), "TTL expired, requesting deletion");
            match self.store.request_environment_deletion(key).await {
                Ok(true) => return Ok(ReconcileAction::Done),
                Ok(false) => {}
                Err(e) if e.is_not_found() => return Ok(ReconcileAction::Done),
                Err(e) => return Err(EngineError::store(key, e)),
            }
            env = match self.load(key).await? {
                Some(env) => env,
                None => return Ok(ReconcileAction::Done),
            };
        }

        if env.metadata.is_deleting() {
            self.reconcile_deletion(env, now).await
        } else {
            self.reconcile_active(env, now).await
        }
    }

    // ========== Active path ==========

    async fn reconcile_active(&self, env: Environment, now: DateTime<Utc>) -> Result<ReconcileAction> {
        let key = env.key();
        let stored = env.phase();
        let spec_changed = env.metadata.generation != env.status.observed_generation;
        // Exhausted retries came from infrastructure, not from the spec
        let gave_up = env.status.failure_reason.as_deref() == Some(RETRIES_EXHAUSTED);

        match stored {
            Phase::Failed if !spec_changed && !gave_up => {
                debug!("Failed, waiting for a spec change");
                return Ok(ReconcileAction::AwaitChange);
            }
            Phase::Deleting => {
                warn!("Deleting phase without a deletion request");
                return Ok(ReconcileAction::AwaitChange);
            }
            _ => {}
        }

        let env = if env.metadata.has_finalizer(labels::CLEANUP_FINALIZER) {
            env
        } else {
            match self.admit(&key).await? {
                Some(env) => env,
                None => return Ok(ReconcileAction::Done),
            }
        };

        let mut status = env.status.clone();
        status.set_condition(
            ConditionKind::Admitted,
            true,
            "FinalizerAdded",
            "teardown is guaranteed",
            now,
        );
        if stored == Phase::Failed {
            if spec_changed {
                info!("Spec changed, retrying failed environment");
                status.retry_count = 0;
                status.failure_reason = None;
            } else {
                debug!("Retrying environment after exhausted retries");
            }
        }

        let mut working = match stored {
            Phase::Pending => Phase::Creating,
            Phase::Failed if env.status.last_applied.is_none() => Phase::Creating,
            Phase::Failed => Phase::Updating,
            other => other,
        };

        let outcome = self.converge(&env, &mut status, now).await;

        let retry = self.config.retry;
        let (next, action) = match outcome {
            Ok(Progress::Ready) => {
                status.retry_count = 0;
                status.failure_reason = None;
                status.set_condition(ConditionKind::Ready, true, "Ready", "all services ready", now);
                (Phase::Ready, ReconcileAction::Requeue(self.config.ready_requeue()))
            }
            Ok(Progress::Converging) => {
                status.retry_count = 0;
                status.failure_reason = None;
                if working == Phase::Ready {
                    working = Phase::Updating;
                }
                status.set_condition(
                    ConditionKind::Ready,
                    false,
                    "Progressing",
                    "services are converging",
                    now,
                );
                (working, ReconcileAction::Requeue(self.config.progress_requeue()))
            }
            Err(e) if e.is_retryable() => {
                status.retry_count = status.retry_count.saturating_add(1);
                if retry.exhausted(status.retry_count) {
                    warn!(error = %e, failures = status.retry_count, "Retries exhausted");
                    if working == Phase::Ready {
                        working = Phase::Updating;
                    }
                    self.mark_failed(&mut status, RETRIES_EXHAUSTED, &e.to_string(), now);
                    (Phase::Failed, ReconcileAction::Requeue(retry.max_delay()))
                } else {
                    let delay = retry.backoff(status.retry_count);
                    warn!(error = %e, attempt = status.retry_count, ?delay, "Transient failure, backing off");
                    if working != Phase::Ready {
                        status.set_condition(ConditionKind::Ready, false, e.reason(), e.to_string(), now);
                    }
                    (working, ReconcileAction::Requeue(delay))
                }
            }
            Err(e) => {
                warn!(error = %e, reason = e.reason(), "Permanent failure");
                if working == Phase::Ready {
                    working = Phase::Updating;
                }
                self.mark_failed(&mut status, e.reason(), &e.to_string(), now);
                (Phase::Failed, ReconcileAction::AwaitChange)
            }
        };

        self.check_transition(&key, stored, working)?;
        self.check_transition(&key, working, next)?;

        status.phase = next;
        status.observed_generation = env.metadata.generation;
        status.last_synced = Some(now);

        if !self.write_status(&key, &status).await? {
            return Ok(ReconcileAction::Done);
        }
        if next != stored {
            info!(from = %stored, to = %next, "Phase transition");
            self.report_commit_status(&env, &status).await;
        }
        Ok(action)
    }

    fn mark_failed(&self, status: &mut EnvironmentStatus, reason: &str, message: &str, now: DateTime<Utc>) {
        status.failure_reason = Some(reason.to_string());
        status.set_condition(ConditionKind::Ready, false, reason, message, now);
    }

    /// Converge owned resources and observe children and cost
    async fn converge(
        &self,
        env: &Environment,
        status: &mut EnvironmentStatus,
        now: DateTime<Utc>,
    ) -> Result<Progress> {
        let pr_number = env.spec.pr_number;
        status.created_at = env.metadata.creation_timestamp;
        status.expires_at = env.expires_at();
        status.url = Some(self.config.environment_url(pr_number));

        env.spec.validate()?;
        let services = self.resolve_services(env, status.last_applied.as_ref()).await;
        validate_services(&services)?;

        // Isolation boundary first; everything else lives inside it
        let namespace = match self.provision_isolation(env).await {
            Ok(namespace) => {
                status.set_condition(
                    ConditionKind::IsolationReady,
                    true,
                    "Provisioned",
                    format!("namespace {}", namespace),
                    now,
                );
                namespace
            }
            Err(e) => {
                status.set_condition(ConditionKind::IsolationReady, false, e.reason(), e.to_string(), now);
                return Err(e.into());
            }
        };
        status.namespace = Some(namespace.clone());

        if let Err(e) = self.gitops.ensure_descriptor(env, &namespace, &services).await {
            status.set_condition(ConditionKind::DescriptorSynced, false, e.reason(), e.to_string(), now);
            return Err(e.into());
        }
        status.set_condition(
            ConditionKind::DescriptorSynced,
            true,
            "Applied",
            format!("revision {}", env.spec.head_sha),
            now,
        );

        let applied = AppliedRevision {
            head_sha: env.spec.head_sha.clone(),
            services: services.clone(),
            generation: env.metadata.generation,
        };
        // Only a new revision or service list needs the GitOps engine to act
        let fresh = !status
            .last_applied
            .as_ref()
            .is_some_and(|previous| previous.same_rollout(&applied));
        status.last_applied = Some(applied);

        let mut observed = Vec::with_capacity(services.len());
        for service in &services {
            let child = self
                .gitops
                .get_child_status(&env.child_name(service), self.gitops.descriptor_namespace())
                .await?;
            observed.push(ServiceStatus {
                name: service.clone(),
                ready: child.is_ready(),
                health: child.health,
                sync_status: child.sync_status,
                url: Some(self.config.service_url(service, pr_number)),
            });
        }
        let waiting: Vec<&str> = observed
            .iter()
            .filter(|s| !s.ready)
            .map(|s| s.name.as_str())
            .collect();
        let all_ready = waiting.is_empty();
        status.services = observed.clone();

        if fresh {
            status.set_condition(
                ConditionKind::ServicesReady,
                false,
                "RevisionApplied",
                "waiting for the GitOps engine to pick up the new revision",
                now,
            );
        } else if all_ready {
            status.set_condition(ConditionKind::ServicesReady, true, "AllServicesReady", "", now);
        } else {
            status.set_condition(
                ConditionKind::ServicesReady,
                false,
                "ServicesProgressing",
                format!("waiting for {}", waiting.join(", ")),
                now,
            );
        }

        self.refresh_cost(env, &namespace, status, now).await;

        Ok(if all_ready && !fresh {
            Progress::Ready
        } else {
            Progress::Converging
        })
    }

    async fn provision_isolation(&self, env: &Environment) -> std::result::Result<String, IsolationError> {
        let namespace = self.isolation.ensure_namespace(env).await?;
        let name = namespace.name().to_string();
        self.isolation.ensure_resource_quota(env, &name).await?;
        self.isolation.ensure_network_policies(env, &name).await?;
        Ok(name)
    }

    /// Services to deploy this tick.
    ///
    /// The last applied list is reused until the revision or spec changes.
    /// Otherwise the diff decides, falling back to the explicit list when
    /// the repository client fails or the diff touches no service.
    async fn resolve_services(
        &self,
        env: &Environment,
        previous: Option<&AppliedRevision>,
    ) -> Vec<String> {
        if let Some(previous) = previous {
            if previous.head_sha == env.spec.head_sha
                && previous.generation == env.metadata.generation
            {
                return previous.services.clone();
            }
        }

        match self
            .repository
            .fetch_diff(&env.spec.repository, env.spec.pr_number)
            .await
        {
            Ok(diff) => {
                let (detected, rejected): (Vec<String>, Vec<String>) =
                    detect_services_from_diff(&diff, &self.config.services_dir)
                        .into_iter()
                        .partition(|service| {
                            validate_service_name(service).is_ok()
                                && validate_name_length(&env.child_name(service)).is_ok()
                        });
                if !rejected.is_empty() {
                    warn!(rejected = ?rejected, "Ignoring diff directories that are not valid service names");
                }
                if detected.is_empty() {
                    debug!("Diff touches no service, using requested services");
                    env.spec.services.clone()
                } else {
                    debug!(services = ?detected, "Services detected from diff");
                    detected
                }
            }
            Err(e) => {
                warn!(error = %e, "Repository client unavailable, using requested services");
                env.spec.services.clone()
            }
        }
    }

    async fn refresh_cost(
        &self,
        env: &Environment,
        namespace: &str,
        status: &mut EnvironmentStatus,
        now: DateTime<Utc>,
    ) {
        let pods = match self.store.list_pods(namespace).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "Cannot list workloads, keeping previous cost");
                return;
            }
        };
        let running: Vec<Pod> = pods.into_iter().filter(Pod::is_running).collect();

        match self
            .cost
            .estimate_environment_cost(&running, env.spec.ttl, env.spec.use_spot_pricing)
        {
            Ok(estimate) => {
                let actual = status.cost.as_ref().and_then(|c| c.actual_cost.clone());
                status.cost = Some(estimate.into_snapshot(actual, now));
            }
            Err(e) => warn!(error = %e, "Cost estimation failed, keeping previous cost"),
        }
    }

    // ========== Deletion path ==========

    async fn reconcile_deletion(&self, env: Environment, now: DateTime<Utc>) -> Result<ReconcileAction> {
        let key = env.key();

        if env.phase() != Phase::Deleting {
            let stored = env.phase();
            self.check_transition(&key, stored, Phase::Deleting)?;

            let mut status = env.status.clone();
            self.record_actual_cost(&env, &mut status, now).await;
            status.phase = Phase::Deleting;
            status.last_synced = Some(now);
            status.set_condition(ConditionKind::Ready, false, "Deleting", "teardown requested", now);

            if !self.write_status(&key, &status).await? {
                return Ok(ReconcileAction::Done);
            }
            info!(from = %stored, to = %Phase::Deleting, "Phase transition");
            return Ok(ReconcileAction::Requeue(self.config.deletion_requeue()));
        }

        match self.isolation.cleanup(&env).await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => return Err(e.into()),
            // Nothing could have been created under an invalid name
            Err(e) => warn!(error = %e, "Namespace cleanup skipped"),
        }

        match self
            .gitops
            .delete_descriptor(&env.descriptor_name(), self.gitops.descriptor_namespace())
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_retryable() => return Err(e.into()),
            Err(e) => warn!(error = %e, "Descriptor cleanup skipped"),
        }

        self.release_finalizer(&key).await?;
        info!("Environment torn down");
        Ok(ReconcileAction::Done)
    }

    async fn record_actual_cost(&self, env: &Environment, status: &mut EnvironmentStatus, now: DateTime<Utc>) {
        let namespace = match &status.namespace {
            Some(namespace) => namespace.clone(),
            None => match generate_namespace_name(env.spec.pr_number, &env.spec.repository) {
                Ok(namespace) => namespace,
                Err(_) => return,
            },
        };
        let Some(created) = env.metadata.creation_timestamp else {
            return;
        };
        let lifetime = (now - created).to_std().unwrap_or_default();

        let pods = match self.store.list_pods(&namespace).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "Cannot list workloads, actual cost not recorded");
                return;
            }
        };
        let running: Vec<Pod> = pods.into_iter().filter(Pod::is_running).collect();

        match self
            .cost
            .track_actual_cost(&namespace, &running, lifetime, env.spec.use_spot_pricing)
        {
            Ok(actual) => {
                info!(total = %actual.total_cost, currency = %actual.currency, "Actual cost recorded");
                match status.cost.as_mut() {
                    Some(cost) => cost.actual_cost = Some(actual.total_cost),
                    None => {
                        status.cost = Some(CostSnapshot {
                            currency: actual.currency,
                            hourly_cost: preview_cost::format_amount(0.0),
                            total_cost: preview_cost::format_amount(0.0),
                            actual_cost: Some(actual.total_cost),
                            calculated_at: now,
                        })
                    }
                }
            }
            Err(e) => warn!(error = %e, "Actual cost not recorded"),
        }
    }

    // ========== Store helpers ==========

    async fn load(&self, key: &EnvironmentKey) -> Result<Option<Environment>> {
        self.store
            .get_environment(key)
            .await
            .map_err(|e| EngineError::store(key, e))
    }

    /// Add the cleanup finalizer; `None` when the record disappeared
    async fn admit(&self, key: &EnvironmentKey) -> Result<Option<Environment>> {
        retry_on_conflict(DEFAULT_CONFLICT_RETRIES, move || async move {
            let Some(mut env) = self.store.get_environment(key).await? else {
                return Ok(None);
            };
            if env.metadata.has_finalizer(labels::CLEANUP_FINALIZER) {
                return Ok(Some(env));
            }
            env.metadata
                .finalizers
                .push(labels::CLEANUP_FINALIZER.to_string());
            let admitted = self.store.update_environment(env).await?;
            info!("Finalizer added");
            Ok(Some(admitted))
        })
        .await
        .map_err(|e| EngineError::store(key, e))
    }

    async fn release_finalizer(&self, key: &EnvironmentKey) -> Result<()> {
        let result = retry_on_conflict(DEFAULT_CONFLICT_RETRIES, move || async move {
            let Some(mut env) = self.store.get_environment(key).await? else {
                return Ok(());
            };
            let before = env.metadata.finalizers.len();
            env.metadata
                .finalizers
                .retain(|f| f != labels::CLEANUP_FINALIZER);
            if env.metadata.finalizers.len() != before {
                self.store.update_environment(env).await?;
            }
            Ok(())
        })
        .await;

        match result {
            Err(e) if !e.is_not_found() => Err(EngineError::store(key, e)),
            _ => Ok(()),
        }
    }

    /// Write `status` onto the current record. Returns `false` when the
    /// record no longer exists.
    async fn write_status(&self, key: &EnvironmentKey, status: &EnvironmentStatus) -> Result<bool> {
        let result = retry_on_conflict(DEFAULT_CONFLICT_RETRIES, move || async move {
            let Some(mut current) = self.store.get_environment(key).await? else {
                return Ok(false);
            };
            current.status = status.clone();
            self.store.update_environment_status(&current).await?;
            Ok(true)
        })
        .await;

        match result {
            Ok(written) => Ok(written),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(EngineError::store(key, e)),
        }
    }

    fn check_transition(&self, key: &EnvironmentKey, from: Phase, to: Phase) -> Result<()> {
        from.transition_to(to)
            .map(|_| ())
            .map_err(|source| EngineError::Transition {
                key: key.clone(),
                source,
            })
    }

    async fn report_commit_status(&self, env: &Environment, status: &EnvironmentStatus) {
        let (state, description) = match status.phase {
            Phase::Creating => (CommitState::Pending, "Preview environment is being created".to_string()),
            Phase::Updating => (CommitState::Pending, "Preview environment is updating".to_string()),
            Phase::Ready => (CommitState::Success, "Preview environment is ready".to_string()),
            Phase::Failed => (
                CommitState::Failure,
                format!(
                    "Preview environment failed: {}",
                    status.failure_reason.as_deref().unwrap_or("unknown")
                ),
            ),
            Phase::Pending | Phase::Deleting => return,
        };

        if let Err(e) = self
            .repository
            .update_commit_status(
                &env.spec.repository,
                &env.spec.head_sha,
                state,
                status.url.as_deref(),
                &description,
            )
            .await
        {
            warn!(error = %e, %state, "Commit status not reported");
        }
    }
}
