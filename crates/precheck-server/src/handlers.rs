// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Precheck API handlers.
//!
//! Transport-free implementations of the upload and precheck operations. An
//! HTTP layer maps these one-to-one onto routes and maps [`Error`] variants
//! onto status codes (`is_not_found()` -> 404, `UploadExpired` and
//! `InvalidRequest` -> 400, `WaitTimeout` -> 408).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::checksums::checksums_of_bytes;
use crate::error::{Error, Result};
use crate::projection::{RunView, UploadView};
use crate::reaper::upload_dir;
use crate::run_output;
use crate::scheduler::{AdmissionScheduler, CancelOutcome};
use crate::store::{
    DEFAULT_DIE_ID, INPUT_FILE_NAME, JobStore, ListRunsFilter, NewRun, NewUpload, Run, RunStatus,
};
use crate::worker::{LogOptions, WorkerRef, WorkerRuntime, WorkerStats, log_line_timestamp};

/// Name given to uploads that arrive without one.
const DEFAULT_UPLOAD_NAME: &str = "input.gds";

/// How often [`handle_wait_run`] re-reads the run.
const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Convert a path to absolute if it's relative.
///
/// Run directories are bind-mounted into workers, so they must not depend on
/// the current working directory at launch time.
fn ensure_absolute_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

/// Shared state for precheck handlers.
pub struct PrecheckHandlerState {
    /// Job store.
    pub store: Arc<dyn JobStore>,
    /// Worker runtime, for logs, stats and live counts.
    pub runtime: Arc<dyn WorkerRuntime>,
    /// Scheduler owning run state transitions (used for cancellation).
    pub scheduler: Arc<AdmissionScheduler>,
    /// Root of `uploads/` and `runs/` (always absolute).
    pub data_dir: PathBuf,
    /// How often [`handle_wait_run`] polls.
    pub wait_poll_interval: Duration,
    /// When the server started (for uptime calculation).
    pub start_time: Instant,
    /// Server version string.
    pub version: String,
}

impl PrecheckHandlerState {
    /// Create a new handler state.
    pub fn new(
        store: Arc<dyn JobStore>,
        runtime: Arc<dyn WorkerRuntime>,
        scheduler: Arc<AdmissionScheduler>,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            runtime,
            scheduler,
            data_dir: ensure_absolute_path(data_dir),
            wait_poll_interval: DEFAULT_WAIT_POLL_INTERVAL,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Set the poll interval used while waiting for a run.
    pub fn with_wait_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll_interval = interval;
        self
    }

    /// Directory holding one subdirectory per upload.
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    /// Directory holding one subdirectory per run.
    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }

    /// Maximum number of concurrently running prechecks.
    pub fn max_concurrent(&self) -> usize {
        self.scheduler.config().max_concurrent
    }

    /// Get the server uptime in milliseconds.
    pub fn uptime_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }

    async fn require_run(&self, run_id: &str) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }
}

// ============================================================================
// Health Check
// ============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResponse {
    /// Whether the job store answers.
    pub healthy: bool,
    /// Server version.
    pub version: String,
    /// Server uptime in milliseconds.
    pub uptime_ms: i64,
    /// Worker runtime in use.
    pub runtime: &'static str,
}

/// Handle health check request.
pub async fn handle_health_check(state: &PrecheckHandlerState) -> Result<HealthCheckResponse> {
    let healthy = match state.store.health_check().await {
        Ok(healthy) => healthy,
        Err(e) => {
            warn!(error = %e, "Job store health check failed");
            false
        }
    };

    Ok(HealthCheckResponse {
        healthy,
        version: state.version.clone(),
        uptime_ms: state.uptime_ms(),
        runtime: state.runtime.runtime_type(),
    })
}

// ============================================================================
// Queue Status
// ============================================================================

/// Global queue status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Runs waiting for admission.
    pub queued: i64,
    /// Workers executing right now, from live runtime state.
    pub running: usize,
    /// Admission cap.
    pub max_concurrent: usize,
}

/// Handle queue status request.
pub async fn handle_queue_status(state: &PrecheckHandlerState) -> Result<QueueStatus> {
    let queued = state.store.get_queue_length().await?;
    let running = state.runtime.count_running().await?;

    Ok(QueueStatus {
        queued,
        running,
        max_concurrent: state.max_concurrent(),
    })
}

// ============================================================================
// Uploads
// ============================================================================

/// Handle upload request: store the layout and record it.
///
/// The file lands at `{data_dir}/uploads/{id}/input.gds` whatever its
/// original name was.
pub async fn handle_create_upload(
    state: &PrecheckHandlerState,
    name: Option<&str>,
    data: &[u8],
) -> Result<UploadView> {
    let name = name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(DEFAULT_UPLOAD_NAME);

    info!(name = %name, size = data.len(), "Create upload request received");

    let new = NewUpload::new(name, PathBuf::new(), data.len() as u64, checksums_of_bytes(data));
    let dir = state.uploads_dir().join(&new.id);
    let filepath = dir.join(INPUT_FILE_NAME);

    tokio::fs::create_dir_all(&dir).await?;
    if let Err(e) = tokio::fs::write(&filepath, data).await {
        error!(upload_id = %new.id, error = %e, "Failed to write upload");
        let _ = tokio::fs::remove_dir_all(&dir).await;
        return Err(e.into());
    }

    let upload = match state.store.create_upload(NewUpload { filepath, ..new }).await {
        Ok(upload) => upload,
        Err(e) => {
            error!(error = %e, "Failed to record upload");
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(e);
        }
    };

    info!(upload_id = %upload.id, "Upload stored");

    Ok(UploadView::from(&upload))
}

/// Handle get upload request.
pub async fn handle_get_upload(state: &PrecheckHandlerState, upload_id: &str) -> Result<UploadView> {
    let upload = state
        .store
        .get_upload(upload_id)
        .await?
        .ok_or_else(|| Error::UploadNotFound(upload_id.to_string()))?;

    Ok(UploadView::from(&upload))
}

/// Handle list uploads request (newest first).
pub async fn handle_list_uploads(state: &PrecheckHandlerState) -> Result<Vec<UploadView>> {
    let uploads = state.store.list_uploads().await?;
    Ok(uploads.iter().map(UploadView::from).collect())
}

/// Handle delete upload request: remove the files, then the record.
///
/// Runs created from the upload keep their own copy of the input and are
/// not affected.
pub async fn handle_delete_upload(state: &PrecheckHandlerState, upload_id: &str) -> Result<()> {
    if state.store.get_upload(upload_id).await?.is_none() {
        return Err(Error::UploadNotFound(upload_id.to_string()));
    }

    let dir = upload_dir(&state.uploads_dir(), upload_id)
        .ok_or_else(|| Error::InvalidRequest(format!("Invalid upload id: {}", upload_id)))?;

    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    if !state.store.delete_upload(upload_id).await? {
        // Reaped concurrently
        return Err(Error::UploadNotFound(upload_id.to_string()));
    }

    info!(upload_id = %upload_id, "Upload deleted");
    Ok(())
}

// ============================================================================
// Runs
// ============================================================================

/// Request to queue a new precheck run.
#[derive(Debug, Clone)]
pub struct CreateRunRequest {
    /// Upload to verify.
    pub upload_id: String,
    /// Top cell of the layout.
    pub top_cell: String,
    /// Die id (defaults to `FFFFFFFF`).
    pub die_id: Option<String>,
}

/// Handle create run request.
///
/// Copies the upload into a fresh run directory and queues the run. The
/// scheduler picks it up on a later tick.
pub async fn handle_create_run(
    state: &PrecheckHandlerState,
    request: CreateRunRequest,
) -> Result<RunView> {
    info!(
        upload_id = %request.upload_id,
        top_cell = %request.top_cell,
        "Create precheck request received"
    );

    if request.top_cell.trim().is_empty() {
        return Err(Error::InvalidRequest("top_cell is required".to_string()));
    }

    let upload = state
        .store
        .get_upload(&request.upload_id)
        .await?
        .ok_or_else(|| Error::UploadNotFound(request.upload_id.clone()))?;

    if upload.is_expired_at(Utc::now()) {
        return Err(Error::UploadExpired(upload.id));
    }

    let die_id = request
        .die_id
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| DEFAULT_DIE_ID.to_string());

    let mut new = NewRun::new(&upload.id, &request.top_cell, PathBuf::new()).with_die_id(die_id);
    let run_dir = state.runs_dir().join(&new.id);
    new.run_dir = run_dir.clone();

    tokio::fs::create_dir_all(&run_dir).await?;
    if let Err(e) = tokio::fs::copy(&upload.filepath, run_dir.join(INPUT_FILE_NAME)).await {
        error!(
            upload_id = %upload.id,
            source = %upload.filepath.display(),
            error = %e,
            "Failed to copy upload into run directory"
        );
        let _ = tokio::fs::remove_dir_all(&run_dir).await;
        return Err(e.into());
    }

    let run = match state.store.create_run(new).await {
        Ok(run) => run,
        Err(e) => {
            let _ = tokio::fs::remove_dir_all(&run_dir).await;
            return Err(e);
        }
    };

    let queue_length = state.store.get_queue_length().await?;

    info!(
        run_id = %run.id,
        upload_id = %run.upload_id,
        queue_position = ?run.queue_position,
        "Precheck queued"
    );

    Ok(RunView::new(&run, queue_length))
}

/// Handle get run request.
pub async fn handle_get_run(state: &PrecheckHandlerState, run_id: &str) -> Result<RunView> {
    let run = state.require_run(run_id).await?;
    let queue_length = state.store.get_queue_length().await?;

    Ok(RunView::new(&run, queue_length))
}

/// Handle list runs request (newest first).
pub async fn handle_list_runs(
    state: &PrecheckHandlerState,
    filter: &ListRunsFilter,
) -> Result<Vec<RunView>> {
    let runs = state.store.list_runs(filter).await?;
    let queue_length = state.store.get_queue_length().await?;

    Ok(runs
        .iter()
        .map(|run| RunView::new(run, queue_length))
        .collect())
}

/// Handle cancel run request.
pub async fn handle_cancel_run(state: &PrecheckHandlerState, run_id: &str) -> Result<CancelOutcome> {
    info!(run_id = %run_id, "Cancel precheck request received");
    state.scheduler.cancel_run(run_id).await
}

// ============================================================================
// Logs
// ============================================================================

/// A page of worker log lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunLogs {
    /// Log lines, oldest first.
    pub lines: Vec<String>,
    /// Lower bound that was requested.
    pub since: Option<DateTime<Utc>>,
    /// Timestamp of the last line when timestamps were requested, else `since`.
    /// Pass it back as `since` to follow the log.
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Whether `tail` truncated the result.
    pub has_more: bool,
}

/// Handle get logs request.
///
/// Runs that never had a worker return an empty page. Once a finished run's
/// worker has been removed its logs are gone too, which also yields an empty
/// page.
pub async fn handle_get_logs(
    state: &PrecheckHandlerState,
    run_id: &str,
    options: &LogOptions,
) -> Result<RunLogs> {
    let run = state.require_run(run_id).await?;

    let empty = RunLogs {
        lines: Vec::new(),
        since: options.since,
        last_timestamp: options.since,
        has_more: false,
    };

    let Some(worker) = run.any_worker_ref().map(WorkerRef::new) else {
        return Ok(empty);
    };

    let lines = match state.runtime.logs(&worker, options).await {
        Ok(lines) => lines,
        Err(e) if run.is_terminal() => {
            debug!(run_id = %run_id, worker = %worker, error = %e, "Logs of finished run unavailable");
            return Ok(empty);
        }
        Err(e) => return Err(e.into()),
    };

    let last_timestamp = if options.timestamps {
        lines
            .last()
            .and_then(|line| log_line_timestamp(line))
            .or(options.since)
    } else {
        options.since
    };

    let has_more = options
        .tail
        .is_some_and(|tail| tail > 0 && lines.len() == tail);

    Ok(RunLogs {
        lines,
        since: options.since,
        last_timestamp,
        has_more,
    })
}

// ============================================================================
// Stats
// ============================================================================

/// Handle get stats request. Only running prechecks have stats.
pub async fn handle_get_stats(state: &PrecheckHandlerState, run_id: &str) -> Result<WorkerStats> {
    let run = state.require_run(run_id).await?;

    let worker = match (run.status, run.worker_ref.as_deref()) {
        (RunStatus::Running, Some(worker)) => WorkerRef::new(worker),
        _ => return Err(Error::InvalidRequest("Precheck is not running".to_string())),
    };

    Ok(state.runtime.stats(&worker).await?)
}

// ============================================================================
// Wait
// ============================================================================

/// Outcome of waiting for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitResponse {
    /// Worker exit code (0 when the run never exited, e.g. cancelled while queued).
    pub status_code: i32,
    /// Failure reason, if any.
    pub error: Option<String>,
}

/// Handle wait request: block until the run is terminal or `timeout` elapses.
///
/// Timing out does not affect the run.
pub async fn handle_wait_run(
    state: &PrecheckHandlerState,
    run_id: &str,
    timeout: Duration,
) -> Result<WaitResponse> {
    // A timeout too large to represent means no deadline
    let deadline = tokio::time::Instant::now().checked_add(timeout);

    loop {
        let run = state.require_run(run_id).await?;
        if run.is_terminal() {
            return Ok(WaitResponse {
                status_code: run.exit_code.unwrap_or(0),
                error: run.error,
            });
        }

        let pause = match deadline {
            Some(deadline) => {
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    return Err(Error::WaitTimeout {
                        run_id: run_id.to_string(),
                        timeout,
                    });
                }
                state.wait_poll_interval.min(deadline - now)
            }
            None => state.wait_poll_interval,
        };

        tokio::time::sleep(pause).await;
    }
}

// ============================================================================
// Output
// ============================================================================

/// Handle output request: path of the completed run's output layout.
pub async fn handle_output_path(state: &PrecheckHandlerState, run_id: &str) -> Result<PathBuf> {
    let run = state.require_run(run_id).await?;

    if run.status != RunStatus::Completed {
        return Err(Error::InvalidRequest("Precheck not completed".to_string()));
    }

    find_output_blocking(run.run_dir, run.top_cell)
        .await?
        .ok_or_else(|| Error::Other("Output GDS not found".to_string()))
}

async fn find_output_blocking(run_dir: PathBuf, top_cell: String) -> Result<Option<PathBuf>> {
    tokio::task::spawn_blocking(move || run_output::find_output(Path::new(&run_dir), &top_cell))
        .await
        .map_err(|e| Error::Other(format!("Output lookup task failed: {}", e)))
}
