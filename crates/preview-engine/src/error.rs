//! Engine errors

use preview_gitops::GitOpsError;
use preview_isolation::IsolationError;
use preview_store::StoreError;
use preview_types::{EnvironmentKey, PhaseTransitionError, ValidationError};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("environment {key}: {source}")]
    Store {
        key: EnvironmentKey,
        #[source]
        source: StoreError,
    },

    #[error("listing environments: {0}")]
    List(#[source] StoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Isolation(#[from] IsolationError),

    #[error(transparent)]
    GitOps(#[from] GitOpsError),

    /// The computed lifecycle edge is not in the transition table
    #[error("environment {key}: {source}")]
    Transition {
        key: EnvironmentKey,
        #[source]
        source: PhaseTransitionError,
    },

    #[error("environment {0}: reconcile deadline exceeded")]
    DeadlineExceeded(EnvironmentKey),
}

impl EngineError {
    pub(crate) fn store(key: &EnvironmentKey, source: StoreError) -> Self {
        Self::Store {
            key: key.clone(),
            source,
        }
    }

    /// Whether a later tick may succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { source, .. } | Self::List(source) => source.is_retryable(),
            Self::Isolation(e) => e.is_retryable(),
            Self::GitOps(e) => e.is_retryable(),
            Self::DeadlineExceeded(_) => true,
            Self::Validation(_) | Self::Transition { .. } => false,
        }
    }

    /// Machine-readable reason recorded in status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Store { .. } | Self::List(_) => "StoreError",
            Self::Validation(e) => e.reason(),
            Self::Isolation(e) => e.reason(),
            Self::GitOps(e) => e.reason(),
            Self::Transition { .. } => "InvalidTransition",
            Self::DeadlineExceeded(_) => "DeadlineExceeded",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
