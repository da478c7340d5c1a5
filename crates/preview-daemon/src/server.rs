//! Daemon wiring and lifecycle

use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};
use preview_cost::{CostEstimator, PricingHandle};
use preview_engine::{CleanupScheduler, Controller, OfflineRepositoryClient, Reconciler};
use preview_gitops::DescriptorGenerator;
use preview_isolation::IsolationManager;
use preview_store::{ControlPlaneStore, EnvironmentStore, InMemoryControlPlane};
use preview_types::Environment;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Preview environment daemon
pub struct Daemon {
    config: DaemonConfig,
    store: Arc<InMemoryControlPlane>,
    pricing: PricingHandle,
    controller: Arc<Controller>,
}

impl Daemon {
    /// Build every component from `config`
    pub fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let store = Arc::new(InMemoryControlPlane::new());
        let shared: Arc<dyn ControlPlaneStore> = store.clone();
        let pricing = PricingHandle::new(config.pricing.clone())?;

        let reconciler = Reconciler::new(
            shared.clone(),
            IsolationManager::new(shared.clone(), config.isolation.clone()),
            DescriptorGenerator::new(shared.clone(), config.gitops.clone()),
            CostEstimator::new(pricing.clone()),
            Arc::new(OfflineRepositoryClient),
            config.engine.clone(),
        );
        let controller = Arc::new(Controller::new(
            Arc::new(reconciler),
            shared,
            config.controller.clone(),
        ));

        Ok(Self {
            config,
            store,
            pricing,
            controller,
        })
    }

    pub fn store(&self) -> Arc<InMemoryControlPlane> {
        self.store.clone()
    }

    /// Live pricing; updates apply to the next estimate
    pub fn pricing(&self) -> &PricingHandle {
        &self.pricing
    }

    /// Create the environments listed in the seed file, if one is configured
    pub async fn seed(&self) -> DaemonResult<usize> {
        let Some(path) = &self.config.seed_file else {
            return Ok(0);
        };

        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| DaemonError::SeedRead {
                path: path.clone(),
                source,
            })?;
        let environments: Vec<Environment> =
            serde_json::from_str(&raw).map_err(|source| DaemonError::SeedFormat {
                path: path.clone(),
                source,
            })?;

        let mut created = 0;
        for env in environments {
            let name = env.key().to_string();
            match self.store.create_environment(env).await {
                Ok(_) => created += 1,
                Err(e) if e.is_already_exists() => {
                    warn!(environment = %name, "Seed environment already exists");
                }
                Err(source) => return Err(DaemonError::Seed { name, source }),
            }
        }
        info!(path = %path, count = created, "Seeded environments");
        Ok(created)
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(self) -> DaemonResult<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `signal` completes, then stop the controller and the
    /// cleanup scheduler and wait for both
    pub async fn run_until<F>(self, signal: F) -> DaemonResult<()>
    where
        F: Future<Output = ()>,
    {
        self.seed().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared: Arc<dyn ControlPlaneStore> = self.store.clone();

        let controller = tokio::spawn(self.controller.clone().run(shutdown_rx.clone()));
        let cleanup = CleanupScheduler::new(
            shared,
            self.controller.clone(),
            self.config.cleanup.clone(),
        );
        let cleanup = tokio::spawn(cleanup.run(shutdown_rx));

        info!(
            base_domain = %self.config.engine.base_domain,
            descriptor_namespace = %self.config.gitops.descriptor_namespace,
            "Preview daemon running"
        );

        signal.await;
        info!("Preview daemon shutting down");

        // Receivers only go away once both tasks have exited
        let _ = shutdown_tx.send(true);
        controller.await?;
        cleanup.await?;

        info!("Preview daemon stopped");
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
