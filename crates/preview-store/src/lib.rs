//! Control-plane store for preview environments
//!
//! The store is the durable, watchable record layer every component reads
//! and writes through. Writers use optimistic concurrency: each record carries
//! a `resource_version`, updates must present the version they read, and a
//! mismatch is a [`StoreError::Conflict`]. Callers re-read and retry with
//! [`retry_on_conflict`]; nothing blind-overwrites.
//!
//! ## Semantics
//!
//! - `generation` on an Environment only moves when its spec changes
//! - Deletion of an Environment holding finalizers stamps
//!   `deletion_timestamp`; releasing the last finalizer drops the record
//! - Deleting a namespace drops every namespaced record inside it
//! - Environment creates, spec/metadata updates and removals are broadcast as
//!   [`WatchEvent`]s; status writes are not

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod memory;
pub mod retry;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryControlPlane;
pub use retry::{retry_on_conflict, DEFAULT_CONFLICT_RETRIES};
pub use traits::{
    ApplicationStore, ControlPlaneStore, DescriptorStore, EnvironmentStore, NamespaceStore,
    NetworkPolicyStore, QuotaStore, WatchEvent, WatchEventKind, WorkloadStore,
};
