//! Dispatcher: turns store events, resyncs and requeues into reconcile ticks
//!
//! At most one tick runs per environment at a time, and at most
//! `max_concurrent_reconciles` run across all environments. Each environment
//! has at most one pending requeue; a newer schedule supersedes the older one.

use crate::config::ControllerConfig;
use crate::error::{EngineError, Result};
use crate::reconciler::{ReconcileAction, Reconciler};
use dashmap::DashMap;
use preview_store::{ControlPlaneStore, WatchEvent, WatchEventKind};
use preview_types::EnvironmentKey;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct Controller {
    reconciler: Arc<Reconciler>,
    store: Arc<dyn ControlPlaneStore>,
    config: ControllerConfig,
    /// Per-environment tick lock
    locks: DashMap<EnvironmentKey, Arc<Mutex<()>>>,
    permits: Arc<Semaphore>,
    /// Token of the live requeue timer per environment
    timers: DashMap<EnvironmentKey, u64>,
    next_timer: AtomicU64,
    stopping: AtomicBool,
}

impl Controller {
    pub fn new(
        reconciler: Arc<Reconciler>,
        store: Arc<dyn ControlPlaneStore>,
        config: ControllerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_reconciles.max(1)));
        Self {
            reconciler,
            store,
            config,
            locks: DashMap::new(),
            permits,
            timers: DashMap::new(),
            next_timer: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Run one tick for `key` under its lock and a global permit.
    ///
    /// Once the controller has stopped this runs nothing and returns
    /// [`ReconcileAction::AwaitChange`].
    pub async fn reconcile_key(&self, key: &EnvironmentKey) -> Result<ReconcileAction> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            let Ok(_permit) = self.permits.acquire().await else {
                return Ok(ReconcileAction::AwaitChange);
            };
            let deadline = Instant::now() + self.reconciler.config().tick_timeout();
            self.reconciler.reconcile(key, deadline).await
        };

        drop(lock);
        if matches!(result, Ok(ReconcileAction::Done)) {
            self.forget(key);
        }
        result
    }

    /// Turn a tick result into the next scheduling decision
    pub fn error_policy(&self, key: &EnvironmentKey, error: &EngineError) -> ReconcileAction {
        if error.is_retryable() {
            let delay = self.reconciler.config().retry.backoff(1);
            warn!(environment = %key, error = %error, ?delay, "Reconcile failed, requeueing");
            ReconcileAction::Requeue(delay)
        } else {
            warn!(environment = %key, error = %error, "Reconcile failed, waiting for a change");
            ReconcileAction::AwaitChange
        }
    }

    /// Act on a tick's outcome
    pub fn schedule(self: &Arc<Self>, key: EnvironmentKey, result: Result<ReconcileAction>) {
        let action = match result {
            Ok(action) => action,
            Err(e) => self.error_policy(&key, &e),
        };

        match action {
            ReconcileAction::Requeue(delay) => {
                let token = self.next_timer.fetch_add(1, Ordering::Relaxed);
                self.timers.insert(key.clone(), token);
                debug!(environment = %key, ?delay, "Requeued");

                let this = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // A newer schedule for the key replaced this timer
                    if this.timers.remove_if(&key, |_, t| *t == token).is_some() {
                        this.spawn_reconcile(key);
                    }
                });
            }
            ReconcileAction::AwaitChange => {
                self.timers.remove(&key);
            }
            ReconcileAction::Done => {
                self.timers.remove(&key);
                self.forget(&key);
            }
        }
    }

    /// Reconcile `key` on a new task and schedule the outcome
    pub fn spawn_reconcile(self: &Arc<Self>, key: EnvironmentKey) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.reconcile_key(&key).await;
            if !this.stopping.load(Ordering::SeqCst) {
                this.schedule(key, result);
            }
        });
    }

    /// Queue a tick for every stored environment
    pub async fn resync(self: &Arc<Self>) {
        match self.store.list_environments().await {
            Ok(environments) => {
                debug!(count = environments.len(), "Resync");
                for env in environments {
                    self.spawn_reconcile(env.key());
                }
            }
            Err(e) => warn!(error = %e, "Resync failed"),
        }
    }

    /// Drop the lock entry for a key nobody is waiting on
    fn forget(&self, key: &EnvironmentKey) {
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Run until `shutdown` flips to `true`, then wait for in-flight ticks
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.store.watch_environments();
        let mut resync = tokio::time::interval(self.config.resync_interval());

        info!(
            max_concurrent = self.config.max_concurrent_reconciles,
            resync_secs = self.config.resync_interval_secs,
            "Controller started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(WatchEvent { kind: WatchEventKind::Applied, key }) => {
                        self.spawn_reconcile(key);
                    }
                    Ok(WatchEvent { kind: WatchEventKind::Deleted, key }) => {
                        debug!(environment = %key, "Environment removed");
                        self.timers.remove(&key);
                        self.forget(&key);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Watch lagged, resyncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Watch closed, stopping controller");
                        break;
                    }
                },
                _ = resync.tick() => self.resync().await,
            }
        }

        self.stopping.store(true, Ordering::SeqCst);
        self.timers.clear();

        let all = u32::try_from(self.config.max_concurrent_reconciles.max(1)).unwrap_or(u32::MAX);
        let drain = self.permits.acquire_many(all);
        if tokio::time::timeout(self.reconciler.config().tick_timeout(), drain)
            .await
            .is_err()
        {
            warn!("In-flight reconciles did not finish before shutdown");
        }
        // Ticks still waiting on a key lock find no permit
        self.permits.close();
        info!("Controller stopped");
    }
}
