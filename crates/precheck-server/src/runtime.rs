// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable precheck runtime.
//!
//! [`PrecheckRuntime`] composes the job store, a worker runtime, the admission
//! scheduler and the expiry reaper, so the service can be embedded into an
//! existing tokio application (an HTTP layer, tests) or run by the bundled
//! binary.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use precheck_server::runtime::PrecheckRuntime;
//! use precheck_server::store::SqliteJobStore;
//! use precheck_server::worker::{DockerRuntime, DockerRuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteJobStore::from_path("./data/precheck.db").await?);
//!     let worker_runtime = Arc::new(DockerRuntime::new(DockerRuntimeConfig::default()));
//!
//!     let runtime = PrecheckRuntime::builder()
//!         .store(store)
//!         .worker_runtime(worker_runtime)
//!         .data_dir("./data")
//!         .max_concurrent(2)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // Serve `runtime.state()` over HTTP ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::handlers::PrecheckHandlerState;
use crate::reaper::{ExpiryReaper, ReaperConfig};
use crate::scheduler::{AdmissionScheduler, SchedulerConfig};
use crate::store::{JobStore, RunStatus};
use crate::worker::WorkerRuntime;

/// Builder for creating a [`PrecheckRuntime`].
pub struct PrecheckRuntimeBuilder {
    store: Option<Arc<dyn JobStore>>,
    worker_runtime: Option<Arc<dyn WorkerRuntime>>,
    data_dir: PathBuf,
    max_concurrent: usize,
    scheduler_poll_interval: Duration,
    reaper_poll_interval: Duration,
}

impl Default for PrecheckRuntimeBuilder {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        let reaper = ReaperConfig::default();

        Self {
            store: None,
            worker_runtime: None,
            data_dir: PathBuf::from("./data"),
            max_concurrent: scheduler.max_concurrent,
            scheduler_poll_interval: scheduler.poll_interval,
            reaper_poll_interval: reaper.poll_interval,
        }
    }
}

impl PrecheckRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the job store (required).
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the worker runtime (required).
    pub fn worker_runtime(mut self, runtime: Arc<dyn WorkerRuntime>) -> Self {
        self.worker_runtime = Some(runtime);
        self
    }

    /// Take data dir, concurrency and poll intervals from a loaded [`Config`].
    pub fn config(self, config: &Config) -> Self {
        self.data_dir(config.data_dir.clone())
            .max_concurrent(config.max_concurrent)
            .scheduler_poll_interval(config.scheduler_poll_interval)
            .reaper_poll_interval(config.reaper_poll_interval)
    }

    /// Set the data directory holding `uploads/` and `runs/`.
    ///
    /// Default: `./data`
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Set the maximum number of concurrently running prechecks.
    ///
    /// Default: 1
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the admission scheduler tick interval.
    ///
    /// Default: 1 second
    pub fn scheduler_poll_interval(mut self, interval: Duration) -> Self {
        self.scheduler_poll_interval = interval;
        self
    }

    /// Set the expiry reaper tick interval.
    ///
    /// Default: 60 seconds
    pub fn reaper_poll_interval(mut self, interval: Duration) -> Self {
        self.reaper_poll_interval = interval;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing or invalid.
    pub fn build(self) -> Result<PrecheckRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let worker_runtime = self
            .worker_runtime
            .ok_or_else(|| anyhow::anyhow!("worker_runtime is required"))?;

        if self.max_concurrent == 0 {
            anyhow::bail!("max_concurrent must be at least 1");
        }

        Ok(PrecheckRuntimeConfig {
            store,
            worker_runtime,
            data_dir: self.data_dir,
            max_concurrent: self.max_concurrent,
            scheduler_poll_interval: self.scheduler_poll_interval,
            reaper_poll_interval: self.reaper_poll_interval,
        })
    }
}

/// Configuration for a [`PrecheckRuntime`].
pub struct PrecheckRuntimeConfig {
    store: Arc<dyn JobStore>,
    worker_runtime: Arc<dyn WorkerRuntime>,
    data_dir: PathBuf,
    max_concurrent: usize,
    scheduler_poll_interval: Duration,
    reaper_poll_interval: Duration,
}

impl PrecheckRuntimeConfig {
    /// Start the runtime: prepare storage, recover orphaned workers, then
    /// spawn the admission scheduler and expiry reaper.
    pub async fn start(self) -> Result<PrecheckRuntime> {
        let scheduler = Arc::new(AdmissionScheduler::new(
            self.store.clone(),
            self.worker_runtime.clone(),
            SchedulerConfig {
                poll_interval: self.scheduler_poll_interval,
                max_concurrent: self.max_concurrent,
            },
        ));

        let state = Arc::new(PrecheckHandlerState::new(
            self.store.clone(),
            self.worker_runtime.clone(),
            scheduler.clone(),
            self.data_dir,
        ));

        for dir in [state.uploads_dir(), state.runs_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        // Workers left over from a previous process
        match recover_orphaned_workers(self.store.as_ref(), self.worker_runtime.as_ref()).await {
            Ok(0) => {}
            Ok(stopped) => info!(stopped = stopped, "Removed orphaned workers"),
            Err(e) => warn!(error = %e, "Failed to recover orphaned workers"),
        }

        let scheduler_shutdown = scheduler.shutdown_handle();
        let scheduler_task = scheduler.clone();
        let scheduler_handle = tokio::spawn(async move {
            scheduler_task.run().await;
        });

        let reaper = ExpiryReaper::new(
            self.store.clone(),
            ReaperConfig {
                uploads_dir: state.uploads_dir(),
                poll_interval: self.reaper_poll_interval,
            },
        );
        let reaper_shutdown = reaper.shutdown_handle();
        let reaper_handle = tokio::spawn(async move {
            reaper.run().await;
        });

        info!(
            data_dir = %state.data_dir.display(),
            max_concurrent = self.max_concurrent,
            runtime = self.worker_runtime.runtime_type(),
            "PrecheckRuntime started"
        );

        Ok(PrecheckRuntime {
            scheduler_handle,
            reaper_handle,
            scheduler_shutdown,
            reaper_shutdown,
            state,
        })
    }
}

/// A running precheck service.
///
/// The runtime manages:
/// - the admission scheduler (reconciliation, admission)
/// - the expiry reaper for old uploads
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct PrecheckRuntime {
    scheduler_handle: JoinHandle<()>,
    reaper_handle: JoinHandle<()>,
    scheduler_shutdown: Arc<Notify>,
    reaper_shutdown: Arc<Notify>,
    state: Arc<PrecheckHandlerState>,
}

impl PrecheckRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> PrecheckRuntimeBuilder {
        PrecheckRuntimeBuilder::new()
    }

    /// Get a reference to the shared handler state.
    pub fn state(&self) -> &Arc<PrecheckHandlerState> {
        &self.state
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals both loops and waits for them. A tick in progress completes
    /// first. Running workers are left alone; the next start reconciles them.
    pub async fn shutdown(self) -> Result<()> {
        info!("PrecheckRuntime shutting down...");

        self.scheduler_shutdown.notify_one();
        self.reaper_shutdown.notify_one();

        let mut panicked = false;

        if let Err(e) = self.scheduler_handle.await {
            error!("Admission scheduler task panicked: {}", e);
            panicked = true;
        }

        if let Err(e) = self.reaper_handle.await {
            error!("Expiry reaper task panicked: {}", e);
            panicked = true;
        }

        if panicked {
            anyhow::bail!("background task panicked");
        }

        info!("PrecheckRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.scheduler_handle.is_finished() && !self.reaper_handle.is_finished()
    }
}

/// Stop workers that no run accounts for.
///
/// A worker survives only if its run is `running` in the store with exactly
/// this worker reference. Anything else (unknown run, finished run, or a run
/// still `queued`) is stopped and removed, so a queued run is always
/// launched fresh. Runs whose worker vanished are left to reconciliation.
///
/// Returns the number of workers stopped.
pub async fn recover_orphaned_workers(
    store: &dyn JobStore,
    runtime: &dyn WorkerRuntime,
) -> crate::error::Result<usize> {
    let workers = runtime.list_active().await?;

    if workers.is_empty() {
        debug!("No active workers to recover");
        return Ok(0);
    }

    info!(count = workers.len(), "Checking active workers for recovery");

    let mut stopped = 0;
    for worker in workers {
        let run = match worker.job_id.as_deref() {
            Some(job_id) => store.get_run(job_id).await?,
            None => None,
        };

        let owned = run.as_ref().is_some_and(|run| {
            run.status == RunStatus::Running
                && run.worker_ref.as_deref() == Some(worker.worker_ref.as_str())
        });

        if owned {
            debug!(
                worker = %worker.worker_ref,
                job_id = ?worker.job_id,
                "Worker belongs to a running run, keeping"
            );
            continue;
        }

        warn!(
            worker = %worker.worker_ref,
            job_id = ?worker.job_id,
            run_status = ?run.as_ref().map(|r| r.status),
            "Removing orphaned worker"
        );
        runtime.stop_and_remove(&worker.worker_ref).await;
        stopped += 1;
    }

    Ok(stopped)
}
