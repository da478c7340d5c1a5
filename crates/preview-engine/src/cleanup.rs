//! Periodic TTL sweep
//!
//! Requests deletion of every expired environment that is not marked
//! do-not-expire, then hands it to the controller so teardown starts without
//! waiting for the watch event.

use crate::config::CleanupConfig;
use crate::controller::Controller;
use crate::error::{EngineError, Result};
use chrono::Utc;
use preview_store::ControlPlaneStore;
use preview_types::EnvironmentKey;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

pub struct CleanupScheduler {
    store: Arc<dyn ControlPlaneStore>,
    controller: Arc<Controller>,
    config: CleanupConfig,
}

impl CleanupScheduler {
    pub fn new(
        store: Arc<dyn ControlPlaneStore>,
        controller: Arc<Controller>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            store,
            controller,
            config,
        }
    }

    /// One sweep. Returns the environments whose deletion was requested.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<Vec<EnvironmentKey>> {
        let now = Utc::now();
        let environments = self
            .store
            .list_environments()
            .await
            .map_err(EngineError::List)?;

        let mut expired = Vec::new();
        for env in environments {
            let past_ttl = env.expires_at().is_some_and(|at| at <= now);
            if env.metadata.is_deleting() || !past_ttl {
                continue;
            }
            let key = env.key();
            if !env.is_expired(now) {
                debug!(environment = %key, "Expired but marked do-not-expire");
                continue;
            }

            info!(environment = %key, expired_at = ?env.expires_at(), "Environment expired");
            match self.store.request_environment_deletion(&key).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    warn!(environment = %key, error = %e, "Deletion request failed");
                    continue;
                }
            }

            let result = self.controller.reconcile_key(&key).await;
            self.controller.schedule(key.clone(), result);
            expired.push(key);
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Sweep requested deletions");
        }
        Ok(expired)
    }

    /// Sweep every interval until `shutdown` flips to `true`
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval());
        info!(interval_secs = self.config.interval_secs, "Cleanup scheduler started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Sweep failed");
                    }
                }
            }
        }
        info!("Cleanup scheduler stopped");
    }
}
