//! Isolation errors

use preview_store::StoreError;
use preview_types::ValidationError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum IsolationError {
    #[error("invalid isolation input: {0}")]
    Validation(#[from] ValidationError),

    #[error("namespace {name}: {source}")]
    Namespace {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("resource quota {namespace}/{name}: {source}")]
    Quota {
        namespace: String,
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("network policy {namespace}/{name}: {source}")]
    Policy {
        namespace: String,
        name: String,
        #[source]
        source: StoreError,
    },

    /// A previous incarnation's namespace is still being torn down
    #[error("namespace {0} is terminating")]
    NamespaceTerminating(String),

    /// The derived name is held by a different repository
    #[error("namespace {name} belongs to repository {owner}")]
    NamespaceCollision { name: String, owner: String },
}

impl IsolationError {
    pub(crate) fn namespace(name: &str, source: StoreError) -> Self {
        Self::Namespace {
            name: name.to_string(),
            source,
        }
    }

    pub(crate) fn quota(namespace: &str, name: &str, source: StoreError) -> Self {
        Self::Quota {
            namespace: namespace.to_string(),
            name: name.to_string(),
            source,
        }
    }

    pub(crate) fn policy(namespace: &str, name: &str, source: StoreError) -> Self {
        Self::Policy {
            namespace: namespace.to_string(),
            name: name.to_string(),
            source,
        }
    }

    /// Whether a later tick may succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Namespace { source, .. }
            | Self::Quota { source, .. }
            | Self::Policy { source, .. } => source.is_retryable(),
            Self::NamespaceTerminating(_) => true,
            Self::Validation(_) | Self::NamespaceCollision { .. } => false,
        }
    }

    /// Machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.reason(),
            Self::Namespace { .. } => "NamespaceError",
            Self::Quota { .. } => "ResourceQuotaError",
            Self::Policy { .. } => "NetworkPolicyError",
            Self::NamespaceTerminating(_) => "NamespaceTerminating",
            Self::NamespaceCollision { .. } => "NamespaceCollision",
        }
    }
}

pub type Result<T> = std::result::Result<T, IsolationError>;
