//! Timer-driven sync cycles.

use crate::engine::{CycleReport, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use storesync_protocol::StoreId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Runs one cycle task per store on the tokio runtime.
///
/// Cycles run on the blocking pool, so the transport may block. Must be
/// used from within a tokio runtime.
pub struct SyncScheduler<T: SyncTransport + 'static> {
    engine: Arc<SyncEngine<T>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<HashMap<StoreId, JoinHandle<()>>>,
}

impl<T: SyncTransport + 'static> SyncScheduler<T> {
    /// Creates a scheduler with no running tasks.
    pub fn new(engine: Arc<SyncEngine<T>>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            shutdown,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// The scheduled engine.
    pub fn engine(&self) -> &Arc<SyncEngine<T>> {
        &self.engine
    }

    /// Starts every store whose configuration is enabled with auto-start,
    /// after recovering items whose batch outlived its lease. Returns how
    /// many stores were started.
    pub fn start_auto(&self) -> SyncResult<usize> {
        let mut started = 0;
        for config in self.engine.store().configurations()? {
            if !(config.enabled && config.auto_start) {
                continue;
            }
            self.engine.recover_orphaned(config.store_id)?;
            if self.start_store(config.store_id, config.sync_interval()) {
                started += 1;
            }
        }
        info!(stores = started, "Sync scheduler started");
        Ok(started)
    }

    /// Starts the cycle task of one store. Returns false if it already
    /// runs.
    pub fn start_store(&self, store_id: StoreId, every: Duration) -> bool {
        let mut tasks = self.tasks.lock();
        if tasks.get(&store_id).is_some_and(|t| !t.is_finished()) {
            return false;
        }

        let engine = Arc::clone(&self.engine);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        run_scheduled(Arc::clone(&engine), store_id).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(store_id = %store_id, "Cycle task stopped");
        });
        tasks.insert(store_id, handle);
        debug!(store_id = %store_id, interval_ms = every.as_millis() as u64, "Cycle task started");
        true
    }

    /// Runs a cycle for `store_id` now and waits for it.
    pub async fn trigger(&self, store_id: StoreId) -> SyncResult<CycleReport> {
        let engine = Arc::clone(&self.engine);
        match tokio::task::spawn_blocking(move || engine.force_cycle(store_id)).await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(SyncError::Cancelled),
            Err(e) => Err(SyncError::InvariantViolation(format!("cycle task panicked: {e}"))),
        }
    }

    /// Returns true while the cycle task of `store_id` runs.
    pub fn is_running(&self, store_id: StoreId) -> bool {
        self.tasks
            .lock()
            .get(&store_id)
            .is_some_and(|t| !t.is_finished())
    }

    /// Stops every cycle task and waits for running cycles to finish.
    pub async fn shutdown(&self) {
        info!("Sync scheduler shutdown requested");
        self.shutdown.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().drain().collect();
        for (store_id, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(store_id = %store_id, error = %e, "Cycle task ended abnormally");
            }
        }
        info!("Sync scheduler stopped");
    }
}

async fn run_scheduled<T: SyncTransport + 'static>(engine: Arc<SyncEngine<T>>, store_id: StoreId) {
    match tokio::task::spawn_blocking(move || engine.run_cycle(store_id)).await {
        Ok(Ok(report)) if report.is_noop() => {}
        Ok(Ok(report)) => {
            debug!(
                store_id = %store_id,
                batches = report.batches.len(),
                errors = report.errors.len(),
                "Scheduled cycle finished"
            );
        }
        Ok(Err(e)) => {
            warn!(store_id = %store_id, error = %e, "Scheduled cycle failed");
        }
        Err(e) => {
            error!(store_id = %store_id, error = %e, "Scheduled cycle panicked");
        }
    }
}
