//! Preview Isolation - per-environment isolation boundaries
//!
//! Each environment gets one namespace, one resource quota and three network
//! policies. Every operation is a convergent apply: read the current record,
//! compute the desired one, write only the difference. Repeating a call with
//! unchanged input is a no-op.
//!
//! Namespaces are named `preview-pr-{N}-{hash}` where `hash` is the first
//! eight hex characters of SHA-256 over the repository name. The name is a
//! pure function of (PR number, repository) and never changes for the life
//! of an environment.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod manager;
pub mod policy;

pub use config::{IsolationConfig, QuotaDefaults};
pub use error::{IsolationError, Result};
pub use manager::{generate_namespace_name, IsolationManager, QUOTA_NAME};
pub use policy::{desired_policies, ALLOW_EGRESS, ALLOW_INGRESS, DEFAULT_DENY_ALL};
