//! Preview Engine - reconciliation for pull-request preview environments
//!
//! The engine drives each [`Environment`](preview_types::Environment) from
//! its desired state to an isolated namespace plus a GitOps descriptor whose
//! children report healthy, and tears everything down when the environment is
//! deleted or its TTL runs out.
//!
//! ## Components
//!
//! - [`Reconciler`]: one idempotent tick per environment
//! - [`Controller`]: watch/resync/requeue dispatch with per-environment
//!   serialization and a global concurrency limit
//! - [`CleanupScheduler`]: periodic TTL sweep
//! - [`RepositoryClient`]: diff-based service detection and commit statuses

#![deny(unsafe_code)]

pub mod cleanup;
pub mod config;
pub mod controller;
pub mod error;
pub mod reconciler;
pub mod repository;

pub use cleanup::CleanupScheduler;
pub use config::{CleanupConfig, ControllerConfig, EngineConfig, RetryPolicy};
pub use controller::Controller;
pub use error::{EngineError, Result};
pub use reconciler::{ReconcileAction, Reconciler};
pub use repository::{
    detect_services_from_diff, CommitState, OfflineRepositoryClient, PullRequestDiff,
    RepositoryClient, RepositoryError,
};
