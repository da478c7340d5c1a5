//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconciler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Domain environment URLs are served under
    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    /// Top-level directory holding one subdirectory per service
    #[serde(default = "default_services_dir")]
    pub services_dir: String,

    /// Backoff for transient failures
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Requeue interval while services are still converging
    #[serde(default = "default_progress_requeue")]
    pub progress_requeue_secs: u64,

    /// Resync interval for Ready environments
    #[serde(default = "default_ready_requeue")]
    pub ready_requeue_secs: u64,

    /// Delay between the two teardown ticks
    #[serde(default = "default_deletion_requeue")]
    pub deletion_requeue_secs: u64,

    /// Deadline for one reconcile tick
    #[serde(default = "default_tick_timeout")]
    pub tick_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_domain: default_base_domain(),
            services_dir: default_services_dir(),
            retry: RetryPolicy::default(),
            progress_requeue_secs: default_progress_requeue(),
            ready_requeue_secs: default_ready_requeue(),
            deletion_requeue_secs: default_deletion_requeue(),
            tick_timeout_secs: default_tick_timeout(),
        }
    }
}

impl EngineConfig {
    pub fn progress_requeue(&self) -> Duration {
        Duration::from_secs(self.progress_requeue_secs)
    }

    pub fn ready_requeue(&self) -> Duration {
        Duration::from_secs(self.ready_requeue_secs)
    }

    pub fn deletion_requeue(&self) -> Duration {
        Duration::from_secs(self.deletion_requeue_secs)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.tick_timeout_secs)
    }

    /// `https://pr-{N}.{domain}`
    pub fn environment_url(&self, pr_number: u64) -> String {
        format!("https://pr-{}.{}", pr_number, self.base_domain)
    }

    /// `https://{service}-pr-{N}.{domain}`
    pub fn service_url(&self, service: &str, pr_number: u64) -> String {
        format!("https://{}-pr-{}.{}", service, pr_number, self.base_domain)
    }
}

/// Bounded exponential backoff: `base * factor^(n-1)`, capped at
/// `max_delay`, for at most `max_attempts` consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_retry_base")]
    pub base_delay_secs: u64,

    #[serde(default = "default_retry_factor")]
    pub factor: u32,

    #[serde(default = "default_retry_max")]
    pub max_delay_secs: u64,

    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: default_retry_base(),
            factor: default_retry_factor(),
            max_delay_secs: default_retry_max(),
            max_attempts: default_retry_attempts(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let multiplier = u64::from(self.factor).saturating_pow(exponent);
        let secs = self
            .base_delay_secs
            .saturating_mul(multiplier)
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }

    /// Retry interval once the budget is spent
    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    /// Whether `failures` consecutive failures exceed the budget
    pub fn exhausted(&self, failures: u32) -> bool {
        failures > self.max_attempts
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Full resync interval
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    /// Reconciles running at once across all environments
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_reconciles: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: default_resync_interval(),
            max_concurrent_reconciles: default_max_concurrent(),
        }
    }
}

impl ControllerConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }
}

/// Cleanup scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Sweep interval
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

fn default_base_domain() -> String {
    "preview.example.com".to_string()
}

fn default_services_dir() -> String {
    "services".to_string()
}

fn default_progress_requeue() -> u64 {
    10
}

fn default_ready_requeue() -> u64 {
    300
}

fn default_deletion_requeue() -> u64 {
    1
}

fn default_tick_timeout() -> u64 {
    30
}

fn default_retry_base() -> u64 {
    5
}

fn default_retry_factor() -> u32 {
    2
}

fn default_retry_max() -> u64 {
    180
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_resync_interval() -> u64 {
    300
}

fn default_max_concurrent() -> usize {
    10
}

fn default_sweep_interval() -> u64 {
    60
}
