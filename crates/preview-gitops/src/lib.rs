//! Preview GitOps - deployment descriptor generation
//!
//! One list-generated [`DeploymentDescriptor`](preview_types::DeploymentDescriptor)
//! per environment, with one list element per requested service. The external
//! GitOps engine expands each element into a child application and converges
//! it toward the pinned head revision; this crate only declares the desired
//! state and reads back child health.
//!
//! Descriptors live in the GitOps namespace, not the environment's, so
//! ownership is recorded with the owner annotation triple and removal is an
//! explicit call from the engine's deletion path.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod generator;
pub mod template;

pub use config::GitOpsConfig;
pub use error::{GitOpsError, Result};
pub use generator::DescriptorGenerator;
pub use template::render_children;
