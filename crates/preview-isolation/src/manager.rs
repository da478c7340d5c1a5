//! Isolation Manager

use crate::config::IsolationConfig;
use crate::error::{IsolationError, Result};
use crate::policy::desired_policies;
use futures::future::try_join_all;
use preview_store::{retry_on_conflict, ControlPlaneStore, DEFAULT_CONFLICT_RETRIES};
use preview_types::validation::validate_name_length;
use preview_types::{
    labels, Environment, NamespaceRecord, NetworkPolicyRecord, ObjectMeta, OwnerAnnotations,
    ResourceQuotaRecord,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Name of the single quota record in each preview namespace
pub const QUOTA_NAME: &str = "preview-quota";

const NAMESPACE_PREFIX: &str = "preview-pr";
const HASH_CHARS: usize = 8;

/// Derive the namespace name for a PR of `repository`.
///
/// Fails instead of truncating when the result would not fit a DNS label.
pub fn generate_namespace_name(pr_number: u64, repository: &str) -> Result<String> {
    let digest = hex::encode(Sha256::digest(repository.as_bytes()));
    let name = format!("{}-{}-{}", NAMESPACE_PREFIX, pr_number, &digest[..HASH_CHARS]);
    validate_name_length(&name)?;
    Ok(name)
}

/// Provisions and tears down isolation boundaries
pub struct IsolationManager {
    store: Arc<dyn ControlPlaneStore>,
    config: IsolationConfig,
}

impl IsolationManager {
    pub fn new(store: Arc<dyn ControlPlaneStore>, config: IsolationConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IsolationConfig {
        &self.config
    }

    /// Labels and owner annotations shared by every record we write
    fn owned_meta(&self, env: &Environment, meta: ObjectMeta) -> ObjectMeta {
        let mut meta = meta;
        meta.labels.extend(env.association_labels());
        OwnerAnnotations::from_meta(&env.metadata).apply(&mut meta.annotations);
        meta
    }

    // ========== Namespace ==========

    /// Create the environment's namespace, or converge its labels and
    /// ownership annotations. Labels added by others are left alone.
    #[instrument(skip(self, env), fields(environment = %env.key()))]
    pub async fn ensure_namespace(&self, env: &Environment) -> Result<NamespaceRecord> {
        let name = generate_namespace_name(env.spec.pr_number, &env.spec.repository)?;
        let desired = NamespaceRecord::new(self.owned_meta(
            env,
            ObjectMeta::new(&name).with_annotation(labels::REPOSITORY_FULL, &env.spec.repository),
        ));

        let (name, desired) = (&name, &desired);
        let outcome = retry_on_conflict(DEFAULT_CONFLICT_RETRIES, move || async move {
            let mut current = match self.store.get_namespace(&name).await? {
                Some(current) => current,
                None => match self.store.create_namespace(desired.clone()).await {
                    Ok(created) => {
                        info!(namespace = %name, "Namespace created");
                        return Ok(Ok(created));
                    }
                    Err(e) if e.is_already_exists() => {
                        self.store.get_namespace(&name).await?.ok_or(e)?
                    }
                    Err(e) => return Err(e),
                },
            };

            if let Some(owner) = current.metadata.annotations.get(labels::REPOSITORY_FULL) {
                if owner != &env.spec.repository {
                    return Ok(Err(IsolationError::NamespaceCollision {
                        name: name.clone(),
                        owner: owner.clone(),
                    }));
                }
            }
            if current.metadata.is_deleting() {
                return Ok(Err(IsolationError::NamespaceTerminating(name.clone())));
            }

            if !current.metadata.merge_labels_and_annotations(&desired.metadata) {
                debug!(namespace = %name, "Namespace up to date");
                return Ok(Ok(current));
            }
            let updated = self.store.update_namespace(current).await?;
            info!(namespace = %name, "Namespace converged");
            Ok(Ok(updated))
        })
        .await
        .map_err(|e| IsolationError::namespace(name, e))?;

        outcome
    }

    // ========== Resource quota ==========

    /// Hard ceilings: configured defaults with the environment's overrides
    pub fn desired_quota_limits(&self, env: &Environment) -> BTreeMap<String, String> {
        let defaults = &self.config.default_quota;
        let overrides = env.spec.resources.clone().unwrap_or_default();

        let mut hard = BTreeMap::new();
        hard.insert(
            ResourceQuotaRecord::REQUESTS_CPU.to_string(),
            overrides.cpu_requests.unwrap_or_else(|| defaults.cpu_requests.clone()),
        );
        hard.insert(
            ResourceQuotaRecord::REQUESTS_MEMORY.to_string(),
            overrides
                .memory_requests
                .unwrap_or_else(|| defaults.memory_requests.clone()),
        );
        hard.insert(
            ResourceQuotaRecord::LIMITS_CPU.to_string(),
            overrides.cpu_limits.unwrap_or_else(|| defaults.cpu_limits.clone()),
        );
        hard.insert(
            ResourceQuotaRecord::LIMITS_MEMORY.to_string(),
            overrides
                .memory_limits
                .unwrap_or_else(|| defaults.memory_limits.clone()),
        );
        hard.insert(
            ResourceQuotaRecord::PVC_COUNT.to_string(),
            overrides
                .persistent_volume_claims
                .unwrap_or(defaults.persistent_volume_claims)
                .to_string(),
        );
        hard.insert(
            ResourceQuotaRecord::LOAD_BALANCERS.to_string(),
            overrides
                .load_balancers
                .unwrap_or(defaults.load_balancers)
                .to_string(),
        );
        hard
    }

    /// Apply the quota ceilings in `namespace`.
    ///
    /// Returns `None` when the environment turned quotas off; an existing
    /// quota is then left in place.
    #[instrument(skip(self, env), fields(environment = %env.key()))]
    pub async fn ensure_resource_quota(
        &self,
        env: &Environment,
        namespace: &str,
    ) -> Result<Option<ResourceQuotaRecord>> {
        if !env.spec.isolation.resource_quota {
            debug!(namespace, "Resource quota disabled");
            return Ok(None);
        }

        let desired = ResourceQuotaRecord {
            metadata: self.owned_meta(env, ObjectMeta::namespaced(namespace, QUOTA_NAME)),
            hard: self.desired_quota_limits(env),
        };

        let desired = &desired;
        let quota = retry_on_conflict(DEFAULT_CONFLICT_RETRIES, move || async move {
            let mut current = match self.store.get_resource_quota(namespace, QUOTA_NAME).await? {
                Some(current) => current,
                None => match self.store.create_resource_quota(desired.clone()).await {
                    Ok(created) => {
                        info!(namespace, "Resource quota created");
                        return Ok(created);
                    }
                    Err(e) if e.is_already_exists() => self
                        .store
                        .get_resource_quota(namespace, QUOTA_NAME)
                        .await?
                        .ok_or(e)?,
                    Err(e) => return Err(e),
                },
            };

            let mut changed = current.metadata.merge_labels_and_annotations(&desired.metadata);
            if current.hard != desired.hard {
                current.hard = desired.hard.clone();
                changed = true;
            }
            if !changed {
                debug!(namespace, "Resource quota up to date");
                return Ok(current);
            }
            let updated = self.store.update_resource_quota(current).await?;
            info!(namespace, "Resource quota converged");
            Ok(updated)
        })
        .await
        .map_err(|e| IsolationError::quota(namespace, QUOTA_NAME, e))?;

        Ok(Some(quota))
    }

    // ========== Network policies ==========

    /// Apply the deny-all, allow-ingress and allow-egress policies in
    /// `namespace`. Returns an empty list when the environment turned
    /// policies off.
    #[instrument(skip(self, env), fields(environment = %env.key()))]
    pub async fn ensure_network_policies(
        &self,
        env: &Environment,
        namespace: &str,
    ) -> Result<Vec<NetworkPolicyRecord>> {
        if !env.spec.isolation.network_policies {
            debug!(namespace, "Network policies disabled");
            return Ok(Vec::new());
        }

        let allow_http = env
            .spec
            .isolation
            .allow_http_egress
            .unwrap_or(self.config.allow_http_egress);

        // Independent records; converge them concurrently
        let pending = desired_policies(&self.config, allow_http).map(|(name, spec)| {
            let desired = NetworkPolicyRecord {
                metadata: self.owned_meta(env, ObjectMeta::namespaced(namespace, name)),
                spec,
            };
            async move {
                self.converge_policy(namespace, desired)
                    .await
                    .map_err(|e| IsolationError::policy(namespace, name, e))
            }
        });
        try_join_all(pending).await
    }

    async fn converge_policy(
        &self,
        namespace: &str,
        desired: NetworkPolicyRecord,
    ) -> preview_store::StoreResult<NetworkPolicyRecord> {
        let desired = &desired;
        let name = desired.metadata.name.as_str();
        retry_on_conflict(DEFAULT_CONFLICT_RETRIES, move || async move {
            let mut current = match self.store.get_network_policy(namespace, name).await? {
                Some(current) => current,
                None => match self.store.create_network_policy(desired.clone()).await {
                    Ok(created) => {
                        info!(namespace, policy = name, "Network policy created");
                        return Ok(created);
                    }
                    Err(e) if e.is_already_exists() => self
                        .store
                        .get_network_policy(namespace, name)
                        .await?
                        .ok_or(e)?,
                    Err(e) => return Err(e),
                },
            };

            let mut changed = current.metadata.merge_labels_and_annotations(&desired.metadata);
            if current.spec != desired.spec {
                current.spec = desired.spec.clone();
                changed = true;
            }
            if !changed {
                debug!(namespace, policy = name, "Network policy up to date");
                return Ok(current);
            }
            let updated = self.store.update_network_policy(current).await?;
            info!(namespace, policy = name, "Network policy converged");
            Ok(updated)
        })
        .await
    }

    // ========== Teardown ==========

    /// Delete the environment's namespace and confirm it is gone.
    ///
    /// A missing namespace is success. A namespace held by another
    /// repository is left untouched.
    #[instrument(skip(self, env), fields(environment = %env.key()))]
    pub async fn cleanup(&self, env: &Environment) -> Result<()> {
        let name = generate_namespace_name(env.spec.pr_number, &env.spec.repository)?;

        let current = self
            .store
            .get_namespace(&name)
            .await
            .map_err(|e| IsolationError::namespace(&name, e))?;
        let Some(current) = current else {
            debug!(namespace = %name, "Namespace already gone");
            return Ok(());
        };

        if let Some(owner) = current.metadata.annotations.get(labels::REPOSITORY_FULL) {
            if owner != &env.spec.repository {
                warn!(namespace = %name, owner = %owner, "Namespace belongs to another repository, not deleting");
                return Ok(());
            }
        }

        self.store
            .delete_namespace(&name)
            .await
            .map_err(|e| IsolationError::namespace(&name, e))?;

        let remaining = self
            .store
            .get_namespace(&name)
            .await
            .map_err(|e| IsolationError::namespace(&name, e))?;
        if remaining.is_some() {
            return Err(IsolationError::NamespaceTerminating(name));
        }

        info!(namespace = %name, "Namespace deleted");
        Ok(())
    }
}
