//! Preview daemon library
//!
//! Wires the store, reconciler, dispatcher and cleanup scheduler into one
//! process:
//! - Layered configuration ([`DaemonConfig`])
//! - Startup seeding from a JSON file
//! - Graceful shutdown on SIGINT/SIGTERM

pub mod config;
pub mod error;
pub mod server;

pub use config::{DaemonConfig, LoggingConfig};
pub use error::{DaemonError, DaemonResult};
pub use server::{shutdown_signal, Daemon};
