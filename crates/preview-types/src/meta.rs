//! Record metadata shared by every control-plane record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known label, annotation and finalizer keys.
pub mod labels {
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const MANAGED_BY_VALUE: &str = "preview-controller";
    pub const PR_NUMBER: &str = "preview.dev/pr-number";
    pub const REPOSITORY: &str = "preview.dev/repository";
    pub const ENVIRONMENT: &str = "preview.dev/environment";
    pub const SERVICE: &str = "preview.dev/service";

    pub const OWNER_NAME: &str = "preview.dev/owner-name";
    pub const OWNER_NAMESPACE: &str = "preview.dev/owner-namespace";
    pub const OWNER_UID: &str = "preview.dev/owner-uid";
    pub const REPOSITORY_FULL: &str = "preview.dev/repository-full-name";

    /// Exempts an Environment from TTL expiry when set to `"true"`.
    pub const DO_NOT_EXPIRE: &str = "preview.dev/do-not-expire";

    /// Finalizer held by the engine until teardown is confirmed.
    pub const CLEANUP_FINALIZER: &str = "preview.dev/cleanup";

    /// Label-safe form of an `owner/name` repository
    pub fn repository_value(repository: &str) -> String {
        repository.replace('/', ".")
    }
}

/// Metadata common to all records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Record name, unique within its namespace
    pub name: String,

    /// Namespace for namespaced records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Identity assigned by the store on create
    #[serde(default)]
    pub uid: String,

    /// Optimistic concurrency token, bumped on every write
    #[serde(default)]
    pub resource_version: u64,

    /// Spec generation, bumped only when the desired state changes
    #[serde(default)]
    pub generation: u64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    /// Set when deletion was requested but finalizers are still held
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Metadata for a cluster-scoped record
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Metadata for a namespaced record
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Merge the labels and annotations of `desired` into this metadata.
    ///
    /// Keys not mentioned by `desired` are left alone. Returns `true` when
    /// anything changed.
    pub fn merge_labels_and_annotations(&mut self, desired: &ObjectMeta) -> bool {
        let mut changed = false;
        for (key, value) in &desired.labels {
            if self.labels.get(key) != Some(value) {
                self.labels.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        for (key, value) in &desired.annotations {
            if self.annotations.get(key) != Some(value) {
                self.annotations.insert(key.clone(), value.clone());
                changed = true;
            }
        }
        changed
    }
}

/// A record kept in the control-plane store
pub trait Resource: Clone + Send + Sync + 'static {
    /// Record kind, used in error messages and logs
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

/// Identity of an Environment record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentKey {
    pub namespace: String,
    pub name: String,
}

impl EnvironmentKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self::new(meta.namespace_or_default(), meta.name.clone())
    }
}

impl std::fmt::Display for EnvironmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Ownership recorded as an annotation triple.
///
/// Owned records live in a different isolation boundary than their owner, so
/// structural owner links are unavailable; the engine's deletion path reads
/// these annotations instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerAnnotations {
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

impl OwnerAnnotations {
    pub fn from_meta(owner: &ObjectMeta) -> Self {
        Self {
            name: owner.name.clone(),
            namespace: owner.namespace_or_default().to_string(),
            uid: owner.uid.clone(),
        }
    }

    /// Write the triple into an annotation map
    pub fn apply(&self, annotations: &mut BTreeMap<String, String>) {
        annotations.insert(labels::OWNER_NAME.to_string(), self.name.clone());
        annotations.insert(labels::OWNER_NAMESPACE.to_string(), self.namespace.clone());
        annotations.insert(labels::OWNER_UID.to_string(), self.uid.clone());
    }

    /// Read the triple back; `None` unless all three keys are present
    pub fn read(annotations: &BTreeMap<String, String>) -> Option<Self> {
        Some(Self {
            name: annotations.get(labels::OWNER_NAME)?.clone(),
            namespace: annotations.get(labels::OWNER_NAMESPACE)?.clone(),
            uid: annotations.get(labels::OWNER_UID)?.clone(),
        })
    }

    pub fn owns(&self, meta: &ObjectMeta) -> bool {
        Self::read(&meta.annotations).as_ref() == Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_foreign_keys() {
        let mut current = ObjectMeta::new("ns")
            .with_label("team", "payments")
            .with_annotation("note", "keep me");
        let desired = ObjectMeta::new("ns").with_label(labels::PR_NUMBER, "7");

        assert!(current.merge_labels_and_annotations(&desired));
        assert_eq!(current.labels.get("team").map(String::as_str), Some("payments"));
        assert_eq!(current.labels.get(labels::PR_NUMBER).map(String::as_str), Some("7"));
        assert_eq!(current.annotations.get("note").map(String::as_str), Some("keep me"));

        // Second merge is a no-op
        assert!(!current.merge_labels_and_annotations(&desired));
    }

    #[test]
    fn test_owner_annotations_roundtrip() {
        let mut owner = ObjectMeta::namespaced("previews", "pr-7");
        owner.uid = "abc-123".into();
        let triple = OwnerAnnotations::from_meta(&owner);

        let mut owned = ObjectMeta::new("preview-pr-7-deadbeef");
        triple.apply(&mut owned.annotations);

        assert!(triple.owns(&owned));
        assert_eq!(OwnerAnnotations::read(&owned.annotations), Some(triple));
    }

    #[test]
    fn test_partial_owner_annotations_are_ignored() {
        let meta = ObjectMeta::new("x").with_annotation(labels::OWNER_NAME, "pr-7");
        assert!(OwnerAnnotations::read(&meta.annotations).is_none());
    }

    #[test]
    fn test_environment_key_display() {
        let key = EnvironmentKey::new("previews", "pr-42");
        assert_eq!(key.to_string(), "previews/pr-42");
    }
}
