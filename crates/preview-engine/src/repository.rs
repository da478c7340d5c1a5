//! Repository client seam and diff-based service detection

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error("repository client unavailable: {0}")]
    Unavailable(String),

    #[error("pull request {repository}#{pr_number} not found")]
    NotFound { repository: String, pr_number: u64 },
}

/// Files changed by a pull request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestDiff {
    pub files: Vec<String>,
}

/// Commit status state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
}

impl std::fmt::Display for CommitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// Access to the hosting repository
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    async fn fetch_diff(
        &self,
        repository: &str,
        pr_number: u64,
    ) -> Result<PullRequestDiff, RepositoryError>;

    async fn update_commit_status(
        &self,
        repository: &str,
        revision: &str,
        state: CommitState,
        url: Option<&str>,
        description: &str,
    ) -> Result<(), RepositoryError>;
}

/// Client used when no repository integration is configured.
///
/// Diffs are unavailable, so services always come from the environment's
/// explicit list; commit statuses are only logged.
#[derive(Debug, Clone, Default)]
pub struct OfflineRepositoryClient;

#[async_trait]
impl RepositoryClient for OfflineRepositoryClient {
    async fn fetch_diff(
        &self,
        _repository: &str,
        _pr_number: u64,
    ) -> Result<PullRequestDiff, RepositoryError> {
        Err(RepositoryError::Unavailable("no repository integration configured".into()))
    }

    async fn update_commit_status(
        &self,
        repository: &str,
        revision: &str,
        state: CommitState,
        url: Option<&str>,
        description: &str,
    ) -> Result<(), RepositoryError> {
        debug!(repository, revision, %state, url, description, "Commit status");
        Ok(())
    }
}

/// Services touched by a diff: the first path segment under `services_dir`.
///
/// Returned sorted and without duplicates. Files directly inside
/// `services_dir` are ignored.
pub fn detect_services_from_diff(diff: &PullRequestDiff, services_dir: &str) -> Vec<String> {
    let prefix = format!("{}/", services_dir.trim_matches('/'));
    diff.files
        .iter()
        .filter_map(|path| {
            let rest = path.trim_start_matches('/').strip_prefix(&prefix)?;
            let (service, _) = rest.split_once('/')?;
            (!service.is_empty()).then(|| service.to_string())
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
