// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission scheduler.
//!
//! A single control loop that keeps the job store consistent with live worker
//! state. Every tick runs two phases, in order:
//!
//! 1. **Reconciliation**: poll the worker of every run the store believes is
//!    `running` and finalise runs whose worker exited or disappeared.
//! 2. **Admission**: if fewer than `max_concurrent` workers are live, launch the
//!    oldest queued run. At most one run is admitted per tick.
//!
//! Concurrency is counted from the worker runtime, not from the store: after a
//! crash the store's `running` rows may lag reality.
//!
//! Cancellation is not part of the tick; callers invoke
//! [`AdmissionScheduler::cancel_run`] directly. All status writes are
//! compare-and-set in the store, so a cancellation racing a tick can never move
//! a run out of a terminal state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::run_output;
use crate::store::{JobStore, Run, RunStatus, RunUpdate};
use crate::worker::{LaunchRequest, WorkerRef, WorkerRuntime, WorkerState};

/// Error recorded on a run whose worker can no longer be found.
pub const WORKER_DISAPPEARED: &str = "worker disappeared";

/// Configuration for the admission scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to tick.
    pub poll_interval: Duration,
    /// Maximum number of live workers.
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_concurrent: 1,
        }
    }
}

/// Result of the admission phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// No queued runs.
    Idle,
    /// The concurrency cap is reached.
    AtCapacity,
    /// The run was launched and is now `running`.
    Started(String),
    /// Launch failed; the run is now `failed`.
    LaunchFailed(String),
    /// The run left `queued` while it was being launched (e.g. cancelled);
    /// the fresh worker was removed again.
    Skipped(String),
}

/// Summary of one scheduler tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Runs moved to a terminal state by reconciliation.
    pub finalized: usize,
    /// What admission did.
    pub admission: AdmitOutcome,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The run was cancelled from `previous`.
    Cancelled {
        /// Status before cancellation.
        previous: RunStatus,
    },
    /// The run had already finished; nothing changed.
    AlreadyTerminal(RunStatus),
}

/// Background loop admitting queued runs and reconciling running ones.
pub struct AdmissionScheduler {
    store: Arc<dyn JobStore>,
    runtime: Arc<dyn WorkerRuntime>,
    config: SchedulerConfig,
    shutdown: Arc<Notify>,
}

impl AdmissionScheduler {
    /// Create a new admission scheduler.
    pub fn new(
        store: Arc<dyn JobStore>,
        runtime: Arc<dyn WorkerRuntime>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run the scheduler loop until shutdown is signalled.
    ///
    /// Tick failures are logged and never end the loop. An in-flight tick
    /// always completes before shutdown is observed.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_concurrent = self.config.max_concurrent,
            runtime = self.runtime.runtime_type(),
            "Admission scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Admission scheduler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Admission scheduler tick failed");
                    }
                }
            }
        }

        info!("Admission scheduler stopped");
    }

    /// Run one reconciliation phase followed by one admission phase.
    pub async fn tick(&self) -> Result<TickReport> {
        let finalized = self.reconcile().await?;
        let admission = self.admit().await?;

        Ok(TickReport {
            finalized,
            admission,
        })
    }

    /// Finalise runs whose worker exited or disappeared.
    ///
    /// Returns the number of runs moved to a terminal state. A store failure
    /// aborts the phase; a runtime failure for one run only skips that run.
    pub async fn reconcile(&self) -> Result<usize> {
        let running = self.store.get_running_runs().await?;
        if running.is_empty() {
            debug!("No running runs to reconcile");
            return Ok(0);
        }

        let mut finalized = 0;
        for run in &running {
            if self.reconcile_run(run).await? {
                finalized += 1;
            }
        }

        if finalized > 0 {
            info!(
                finalized = finalized,
                checked = running.len(),
                "Reconciled running runs"
            );
        }

        Ok(finalized)
    }

    async fn reconcile_run(&self, run: &Run) -> Result<bool> {
        let Some(worker) = run.worker_ref.as_deref().map(WorkerRef::new) else {
            // Nothing to poll: treat as lost
            warn!(run_id = %run.id, "Running run has no worker reference");
            return self.mark_disappeared(run).await;
        };

        let status = match self.runtime.status(&worker).await {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    run_id = %run.id,
                    worker = %worker,
                    error = %e,
                    "Failed to query worker status, will retry next tick"
                );
                return Ok(false);
            }
        };

        match status.state {
            WorkerState::Running => Ok(false),
            WorkerState::Missing => {
                warn!(run_id = %run.id, worker = %worker, "Worker disappeared");
                self.mark_disappeared(run).await
            }
            WorkerState::Exited => {
                let finished_at = status.finished_at.unwrap_or_else(Utc::now);
                let exit_code = status.exit_code.unwrap_or(-1);

                let update = if exit_code == 0 {
                    let output_checksums =
                        run_output::output_checksums(&run.run_dir, &run.top_cell).await;
                    if output_checksums.is_none() {
                        warn!(run_id = %run.id, "Run exited cleanly but produced no output artifact");
                    }
                    RunUpdate::completed(0, finished_at, output_checksums)
                } else {
                    let error = status
                        .error
                        .unwrap_or_else(|| format!("Precheck exited with code {}", exit_code));
                    RunUpdate::failed(error, Some(exit_code), finished_at)
                };

                let applied = self.store.update_run(&run.id, &update).await?;

                // Record first, then clean up: a failed removal must not leave
                // the run pointing at nothing.
                self.runtime.stop_and_remove(&worker).await;

                if applied {
                    info!(
                        run_id = %run.id,
                        exit_code = exit_code,
                        status = ?update.status,
                        "Run finished"
                    );
                }

                Ok(applied)
            }
        }
    }

    async fn mark_disappeared(&self, run: &Run) -> Result<bool> {
        let update = RunUpdate::failed(WORKER_DISAPPEARED, None, Utc::now());
        self.store.update_run(&run.id, &update).await
    }

    /// Launch the oldest queued run if below the concurrency cap.
    pub async fn admit(&self) -> Result<AdmitOutcome> {
        let live = self.runtime.count_running().await?;
        if live >= self.config.max_concurrent {
            debug!(
                live = live,
                max_concurrent = self.config.max_concurrent,
                "At capacity"
            );
            return Ok(AdmitOutcome::AtCapacity);
        }

        let Some(run) = self.store.get_next_queued_run().await? else {
            return Ok(AdmitOutcome::Idle);
        };

        let request = LaunchRequest::precheck(&run.id, &run.run_dir, &run.top_cell, &run.die_id);

        let worker = match self.runtime.launch(&request).await {
            Ok(worker) => worker,
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Failed to launch worker");
                let update = RunUpdate::failed(e.to_string(), None, Utc::now());
                self.store.update_run(&run.id, &update).await?;
                return Ok(AdmitOutcome::LaunchFailed(run.id));
            }
        };

        let update = RunUpdate::running(worker.as_str(), Utc::now());
        match self.store.update_run(&run.id, &update).await {
            Ok(true) => {
                info!(run_id = %run.id, worker = %worker, "Admitted run");
                Ok(AdmitOutcome::Started(run.id))
            }
            Ok(false) => {
                info!(
                    run_id = %run.id,
                    worker = %worker,
                    "Run left the queue during launch, removing worker"
                );
                self.runtime.stop_and_remove(&worker).await;
                Ok(AdmitOutcome::Skipped(run.id))
            }
            Err(e) => {
                // The run stays queued; don't leave an untracked worker behind
                self.runtime.stop_and_remove(&worker).await;
                Err(e)
            }
        }
    }

    /// Cancel a run.
    ///
    /// A queued run is cancelled directly. A running run has its worker stopped
    /// and removed first. Runs that already finished are left untouched.
    pub async fn cancel_run(&self, run_id: &str) -> Result<CancelOutcome> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;

        if run.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(run.status));
        }

        let stopped = match (run.status, run.worker_ref.as_deref()) {
            (RunStatus::Running, Some(worker)) => {
                let worker = WorkerRef::new(worker);
                self.runtime.stop_and_remove(&worker).await;
                Some(worker)
            }
            _ => None,
        };

        if !self
            .store
            .update_run(run_id, &RunUpdate::cancelled(Utc::now()))
            .await?
        {
            // Reconciliation finalised it first
            let current = self
                .store
                .get_run(run_id)
                .await?
                .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
            return Ok(CancelOutcome::AlreadyTerminal(current.status));
        }

        // Admission may have launched the run between our read and the update
        if let Some(cancelled) = self.store.get_run(run_id).await?
            && let Some(last) = cancelled.last_worker_ref.as_deref()
            && stopped.as_ref().map(WorkerRef::as_str) != Some(last)
        {
            self.runtime.stop_and_remove(&WorkerRef::new(last)).await;
        }

        info!(run_id = %run_id, previous = %run.status, "Cancelled run");

        Ok(CancelOutcome::Cancelled {
            previous: run.status,
        })
    }
}
