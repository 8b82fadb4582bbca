// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker runtime trait definitions.
//!
//! Defines the abstract interface for launching and supervising precheck
//! workers.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Working directory as seen from inside a worker.
pub const WORKER_WORKDIR: &str = "/workdir";

/// Input layout path as seen from inside a worker.
pub const WORKER_INPUT_PATH: &str = "/workdir/input.gds";

/// Errors from worker runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// The worker could not be started.
    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    /// A runtime command exited unsuccessfully.
    #[error("{command} failed: {stderr}")]
    CommandFailed {
        /// Command that failed (e.g. `docker inspect`).
        command: String,
        /// Standard error output.
        stderr: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for worker runtime operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Opaque reference to a launched worker (container id, PID, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerRef(String);

impl WorkerRef {
    /// Wrap a substrate-specific id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The underlying id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<WorkerRef> for String {
    fn from(worker: WorkerRef) -> Self {
        worker.0
    }
}

/// Request to start a worker for one job.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Job (run) id
    pub job_id: String,
    /// Host directory bound into the worker at [`WORKER_WORKDIR`]
    pub working_dir: PathBuf,
    /// Arguments passed to the worker entrypoint
    pub args: Vec<String>,
}

impl LaunchRequest {
    /// Launch request for a precheck of `top_cell` with the given die id.
    pub fn precheck(
        job_id: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        top_cell: &str,
        die_id: &str,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            working_dir: working_dir.into(),
            args: vec![
                "--input".to_string(),
                WORKER_INPUT_PATH.to_string(),
                "--top".to_string(),
                top_cell.to_string(),
                "--id".to_string(),
                die_id.to_string(),
                "--dir".to_string(),
                WORKER_WORKDIR.to_string(),
            ],
        }
    }
}

/// Coarse worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Still executing (or about to)
    Running,
    /// Exited; see exit code
    Exited,
    /// The runtime no longer knows this worker
    Missing,
}

/// Status of a worker as reported by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStatus {
    /// Coarse state
    pub state: WorkerState,
    /// Exit code, once exited
    pub exit_code: Option<i32>,
    /// Runtime-reported error text (empty strings are normalised to `None`)
    pub error: Option<String>,
    /// When the worker exited, if known
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkerStatus {
    /// A worker that is still running.
    pub fn running() -> Self {
        Self {
            state: WorkerState::Running,
            exit_code: None,
            error: None,
            finished_at: None,
        }
    }

    /// A worker that exited with `exit_code`.
    pub fn exited(
        exit_code: i32,
        error: Option<String>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            state: WorkerState::Exited,
            exit_code: Some(exit_code),
            error: error.filter(|e| !e.is_empty()),
            finished_at,
        }
    }

    /// A worker the runtime cannot find.
    pub fn missing() -> Self {
        Self {
            state: WorkerState::Missing,
            exit_code: None,
            error: None,
            finished_at: None,
        }
    }
}

/// A worker known to the runtime, as returned by [`WorkerRuntime::list_active`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    /// Worker reference
    pub worker_ref: WorkerRef,
    /// Job the worker was launched for, if the runtime recorded it
    pub job_id: Option<String>,
    /// Whether the worker is still executing
    pub running: bool,
}

/// Options for fetching worker logs.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Only lines emitted at or after this time
    pub since: Option<DateTime<Utc>>,
    /// Only the last N lines
    pub tail: Option<usize>,
    /// Prefix each line with its RFC 3339 timestamp
    pub timestamps: bool,
}

/// Point-in-time resource usage of a worker.
///
/// Values are kept as the runtime formats them (e.g. `"12.5%"`, `"1.2GiB / 8GiB"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerStats {
    /// CPU usage
    #[serde(rename = "CPUPerc")]
    pub cpu_percent: String,
    /// Memory usage and limit
    #[serde(rename = "MemUsage")]
    pub mem_usage: String,
    /// Memory usage as a share of the limit
    #[serde(rename = "MemPerc")]
    pub mem_percent: String,
    /// Network I/O
    #[serde(rename = "NetIO")]
    pub net_io: String,
    /// Block I/O
    #[serde(rename = "BlockIO")]
    pub block_io: String,
    /// Process count
    #[serde(rename = "PIDs")]
    pub pids: String,
}

/// Timestamp prefix of a log line fetched with [`LogOptions::timestamps`].
pub fn log_line_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let prefix = line.split_once(' ').map_or(line, |(ts, _)| ts);
    DateTime::parse_from_rfc3339(prefix)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Trait for worker runtimes.
///
/// Runtimes are PURE execution substrates: they never touch the job store.
/// The caller (admission scheduler) owns every state transition and enforces
/// that each job is launched at most once.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Runtime type identifier (e.g. "docker", "mock")
    fn runtime_type(&self) -> &'static str;

    /// Start an isolated worker bound to the request's working directory.
    async fn launch(&self, request: &LaunchRequest) -> Result<WorkerRef>;

    /// Current status of a worker.
    ///
    /// A worker the runtime no longer knows is reported as
    /// [`WorkerState::Missing`], not as an error. Errors mean the runtime
    /// itself could not be queried.
    async fn status(&self, worker: &WorkerRef) -> Result<WorkerStatus>;

    /// Best-effort stop and cleanup. Failures are logged and reported as
    /// `false`, never raised.
    async fn stop_and_remove(&self, worker: &WorkerRef) -> bool;

    /// Number of workers executing right now, from live runtime state.
    async fn count_running(&self) -> Result<usize>;

    /// All workers this runtime manages, running or not.
    async fn list_active(&self) -> Result<Vec<WorkerInfo>>;

    /// Log lines of a worker.
    async fn logs(&self, worker: &WorkerRef, options: &LogOptions) -> Result<Vec<String>>;

    /// Resource usage of a worker.
    async fn stats(&self, worker: &WorkerRef) -> Result<WorkerStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precheck_launch_args() {
        let request = LaunchRequest::precheck("r1", "/data/runs/r1", "chip_top", "0000002A");

        assert_eq!(
            request.args,
            vec![
                "--input",
                "/workdir/input.gds",
                "--top",
                "chip_top",
                "--id",
                "0000002A",
                "--dir",
                "/workdir",
            ]
        );
        assert_eq!(request.working_dir, PathBuf::from("/data/runs/r1"));
    }

    #[test]
    fn test_exited_normalises_empty_error() {
        let status = WorkerStatus::exited(1, Some(String::new()), None);
        assert_eq!(status.state, WorkerState::Exited);
        assert_eq!(status.exit_code, Some(1));
        assert_eq!(status.error, None);
    }

    #[test]
    fn test_log_line_timestamp() {
        let ts = log_line_timestamp("2025-01-15T10:30:00.123456789Z step 3/12: DRC").unwrap();
        assert_eq!(ts.timestamp_subsec_nanos(), 123_456_789);
        assert!(log_line_timestamp("no timestamp here").is_none());
    }

    #[test]
    fn test_stats_from_docker_json() {
        let stats: WorkerStats = serde_json::from_str(
            r#"{"BlockIO":"0B / 0B","CPUPerc":"12.50%","Container":"abc","MemPerc":"1.00%","MemUsage":"80MiB / 8GiB","Name":"precheck-r1","NetIO":"1kB / 0B","PIDs":"7"}"#,
        )
        .unwrap();

        assert_eq!(stats.pids, "7");
        assert_eq!(stats.cpu_percent, "12.50%");
    }
}
