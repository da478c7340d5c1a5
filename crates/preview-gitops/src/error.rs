//! GitOps errors

use preview_store::StoreError;
use preview_types::ValidationError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum GitOpsError {
    #[error("invalid descriptor input: {0}")]
    Validation(#[from] ValidationError),

    /// A configured template could not be expanded
    #[error("malformed template '{template}': {message}")]
    Template { template: String, message: String },

    #[error("descriptor {namespace}/{name}: {source}")]
    Descriptor {
        namespace: String,
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("child application {namespace}/{name}: {source}")]
    Child {
        namespace: String,
        name: String,
        #[source]
        source: StoreError,
    },

    /// Deletion was issued but the descriptor is still readable
    #[error("descriptor {namespace}/{name} still present after delete")]
    DeletePending { namespace: String, name: String },
}

impl GitOpsError {
    pub(crate) fn descriptor(namespace: &str, name: &str, source: StoreError) -> Self {
        Self::Descriptor {
            namespace: namespace.to_string(),
            name: name.to_string(),
            source,
        }
    }

    pub(crate) fn child(namespace: &str, name: &str, source: StoreError) -> Self {
        Self::Child {
            namespace: namespace.to_string(),
            name: name.to_string(),
            source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Descriptor { source, .. } | Self::Child { source, .. } => source.is_retryable(),
            Self::DeletePending { .. } => true,
            Self::Validation(_) | Self::Template { .. } => false,
        }
    }

    /// Machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(e) => e.reason(),
            Self::Template { .. } => "MalformedDescriptor",
            Self::Descriptor { .. } => "DescriptorError",
            Self::Child { .. } => "ChildStatusError",
            Self::DeletePending { .. } => "DescriptorDeletePending",
        }
    }
}

pub type Result<T> = std::result::Result<T, GitOpsError>;
