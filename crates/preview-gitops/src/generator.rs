//! Descriptor Generator

use crate::config::GitOpsConfig;
use crate::error::{GitOpsError, Result};
use crate::template::{expand_config, has_placeholder, render_children};
use preview_store::{retry_on_conflict, ControlPlaneStore, DEFAULT_CONFLICT_RETRIES};
use preview_types::validation::{validate_name_length, validate_services};
use preview_types::{
    labels, ChildApplicationStatus, ChildSource, ChildTemplate, DeploymentDescriptor,
    DescriptorSpec, Destination, Environment, HealthStatus, ListGenerator, ObjectMeta,
    OwnerAnnotations, SyncAutomation, SyncPolicy, SyncStatus,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

const SERVICE_PARAM: &str = "service";
const PATH_PARAM: &str = "path";

/// Sync option telling the engine never to create the destination namespace
const NO_CREATE_NAMESPACE: &str = "CreateNamespace=false";

/// Builds and converges GitOps descriptors
pub struct DescriptorGenerator {
    store: Arc<dyn ControlPlaneStore>,
    config: GitOpsConfig,
}

impl DescriptorGenerator {
    pub fn new(store: Arc<dyn ControlPlaneStore>, config: GitOpsConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &GitOpsConfig {
        &self.config
    }

    /// Namespace descriptors and children are written to
    pub fn descriptor_namespace(&self) -> &str {
        &self.config.descriptor_namespace
    }

    /// Desired descriptor for `env`, deploying `services` into `namespace`
    pub fn build(
        &self,
        env: &Environment,
        namespace: &str,
        services: &[String],
    ) -> Result<DeploymentDescriptor> {
        validate_services(services)?;
        let repository = env.spec.repository.as_str();

        let elements = services
            .iter()
            .map(|service| -> Result<BTreeMap<String, String>> {
                validate_name_length(&env.child_name(service))?;
                let path = expand_config(
                    &self.config.path_template,
                    &[("repository", repository), (SERVICE_PARAM, service)],
                )?;
                let mut element = BTreeMap::new();
                element.insert(SERVICE_PARAM.to_string(), service.clone());
                element.insert(PATH_PARAM.to_string(), path);
                Ok(element)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut template_labels = env.association_labels();
        template_labels.insert(labels::SERVICE.to_string(), format!("{{{{{}}}}}", SERVICE_PARAM));
        let mut owner = BTreeMap::new();
        OwnerAnnotations::from_meta(&env.metadata).apply(&mut owner);

        let template = ChildTemplate {
            name: format!("preview-{}-{{{{{}}}}}", env.spec.pr_number, SERVICE_PARAM),
            labels: template_labels,
            annotations: owner.clone(),
            project: self.config.project.clone(),
            source: ChildSource {
                repo_url: expand_config(
                    &self.config.repo_url_template,
                    &[("repository", repository)],
                )?,
                path: format!("{{{{{}}}}}", PATH_PARAM),
                target_revision: env.spec.head_sha.clone(),
            },
            destination: Destination {
                server: self.config.destination_server.clone(),
                namespace: namespace.to_string(),
            },
            sync_policy: SyncPolicy {
                automated: Some(SyncAutomation {
                    prune: true,
                    self_heal: true,
                }),
                sync_options: vec![NO_CREATE_NAMESPACE.to_string()],
                retry: self.config.sync_retry,
            },
        };

        let mut metadata =
            ObjectMeta::namespaced(&self.config.descriptor_namespace, env.descriptor_name());
        metadata.labels = env.association_labels();
        metadata.annotations = owner;

        let descriptor = DeploymentDescriptor {
            metadata,
            spec: DescriptorSpec {
                generators: vec![ListGenerator { elements }],
                template,
                extra: Default::default(),
            },
        };

        for child in render_children(&descriptor) {
            if has_placeholder(&child.spec.name) || has_placeholder(&child.spec.source.path) {
                return Err(GitOpsError::Template {
                    template: descriptor.spec.template.name.clone(),
                    message: format!("child '{}' left unexpanded", child.spec.name),
                });
            }
        }

        Ok(descriptor)
    }

    /// Converge the environment's descriptor.
    ///
    /// Generators, template and policy are overwritten; labels and fields
    /// written by other actors are kept.
    #[instrument(skip(self, env, services), fields(environment = %env.key()))]
    pub async fn ensure_descriptor(
        &self,
        env: &Environment,
        namespace: &str,
        services: &[String],
    ) -> Result<DeploymentDescriptor> {
        let desired = self.build(env, namespace, services)?;
        let ns = self.config.descriptor_namespace.as_str();
        let name = desired.metadata.name.clone();
        let (desired, name_ref) = (&desired, name.as_str());

        retry_on_conflict(DEFAULT_CONFLICT_RETRIES, move || async move {
            let mut current = match self.store.get_descriptor(ns, name_ref).await? {
                Some(current) => current,
                None => match self.store.create_descriptor(desired.clone()).await {
                    Ok(created) => {
                        info!(descriptor = name_ref, "Descriptor created");
                        return Ok(created);
                    }
                    Err(e) if e.is_already_exists() => {
                        self.store.get_descriptor(ns, name_ref).await?.ok_or(e)?
                    }
                    Err(e) => return Err(e),
                },
            };

            let mut changed = current.metadata.merge_labels_and_annotations(&desired.metadata);
            if current.spec.generators != desired.spec.generators {
                current.spec.generators = desired.spec.generators.clone();
                changed = true;
            }
            if current.spec.template != desired.spec.template {
                current.spec.template = desired.spec.template.clone();
                changed = true;
            }
            if !changed {
                debug!(descriptor = name_ref, "Descriptor up to date");
                return Ok(current);
            }
            let updated = self.store.update_descriptor(current).await?;
            info!(descriptor = name_ref, "Descriptor converged");
            Ok(updated)
        })
        .await
        .map_err(|e| GitOpsError::descriptor(ns, &name, e))
    }

    /// Delete a descriptor and the children generated from it, then confirm
    /// the descriptor is gone. A missing descriptor is success.
    #[instrument(skip(self))]
    pub async fn delete_descriptor(&self, name: &str, namespace: &str) -> Result<()> {
        let current = self
            .store
            .get_descriptor(namespace, name)
            .await
            .map_err(|e| GitOpsError::descriptor(namespace, name, e))?;
        let Some(current) = current else {
            debug!(descriptor = name, "Descriptor already gone");
            return Ok(());
        };

        self.store
            .delete_descriptor(namespace, name)
            .await
            .map_err(|e| GitOpsError::descriptor(namespace, name, e))?;

        let owner = OwnerAnnotations::read(&current.metadata.annotations);
        for child in render_children(&current) {
            let child_ns = child.metadata.namespace_or_default();
            let existing = self
                .store
                .get_application(child_ns, &child.metadata.name)
                .await
                .map_err(|e| GitOpsError::child(child_ns, &child.metadata.name, e))?;
            let Some(existing) = existing else { continue };

            // Only remove children carrying the descriptor's owner
            if owner.as_ref().map_or(true, |o| o.owns(&existing.metadata)) {
                self.store
                    .delete_application(child_ns, &child.metadata.name)
                    .await
                    .map_err(|e| GitOpsError::child(child_ns, &child.metadata.name, e))?;
                debug!(child = %child.metadata.name, "Child application deleted");
            }
        }

        let remaining = self
            .store
            .get_descriptor(namespace, name)
            .await
            .map_err(|e| GitOpsError::descriptor(namespace, name, e))?;
        if remaining.is_some() {
            return Err(GitOpsError::DeletePending {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }

        info!(descriptor = name, "Descriptor deleted");
        Ok(())
    }

    /// Health and sync state of one child. A child the engine has not
    /// generated yet reports `Missing`.
    pub async fn get_child_status(&self, name: &str, namespace: &str) -> Result<ChildApplicationStatus> {
        let child = self
            .store
            .get_application(namespace, name)
            .await
            .map_err(|e| GitOpsError::child(namespace, name, e))?;

        Ok(match child {
            Some(child) => child.status,
            None => ChildApplicationStatus {
                health: HealthStatus::Missing,
                sync_status: SyncStatus::Unknown,
                message: "child application not generated yet".to_string(),
            },
        })
    }
}
