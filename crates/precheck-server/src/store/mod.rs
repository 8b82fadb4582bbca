// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job store: durable record of uploads and runs.
//!
//! The store is the single source of truth for run state. Every status change
//! goes through [`JobStore::update_run`], a single-row compare-and-set that
//! only applies legal forward transitions:
//!
//! ```text
//! queued ──► running ──► completed
//!   │           │
//!   │           ├──────► failed
//!   ├───────────┼──────► failed      (launch failure)
//!   └───────────┴──────► cancelled
//! ```
//!
//! Queue positions are never stored. They are derived on every read as
//! `1 + count(queued runs created earlier)`.

pub mod sqlite;

pub use self::sqlite::SqliteJobStore;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksums::Checksums;
use crate::error::Result;

/// File name of the input layout inside upload and run directories.
pub const INPUT_FILE_NAME: &str = "input.gds";

/// Die id used when the caller does not supply one.
pub const DEFAULT_DIE_ID: &str = "FFFFFFFF";

// ============================================================================
// Uploads
// ============================================================================

/// Availability of an upload, derived from its expiry time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// The upload can be used for new runs.
    Available,
    /// The expiry window has passed.
    Expired,
}

impl UploadState {
    /// State of an upload expiring at `expires_at`, as seen at `now`.
    pub fn at(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        if now >= expires_at {
            UploadState::Expired
        } else {
            UploadState::Available
        }
    }
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadState::Available => write!(f, "available"),
            UploadState::Expired => write!(f, "expired"),
        }
    }
}

/// A stored input artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    /// Upload id
    pub id: String,
    /// Display name supplied by the uploader
    pub name: String,
    /// Path of the stored file
    pub filepath: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Content checksums
    pub checksums: Checksums,
    /// When the upload was recorded
    pub created_at: DateTime<Utc>,
    /// When the upload stops being available
    pub expires_at: DateTime<Utc>,
    /// State computed when the record was read
    pub state: UploadState,
}

impl Upload {
    /// Whether the upload is past its expiry window at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        UploadState::at(self.expires_at, now) == UploadState::Expired
    }
}

/// Minimal reference to an expired upload, as returned to the reaper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRef {
    /// Upload id
    pub id: String,
    /// Path of the stored file
    pub filepath: PathBuf,
}

/// Parameters for recording a new upload.
#[derive(Debug, Clone)]
pub struct NewUpload {
    /// Upload id (UUID v4 unless pinned with [`NewUpload::with_id`])
    pub id: String,
    /// Display name
    pub name: String,
    /// Path of the stored file
    pub filepath: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Content checksums
    pub checksums: Checksums,
}

impl NewUpload {
    /// Describe a new upload with a freshly generated id.
    pub fn new(
        name: impl Into<String>,
        filepath: impl Into<PathBuf>,
        size: u64,
        checksums: Checksums,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            filepath: filepath.into(),
            size,
            checksums,
        }
    }

    /// Pin the id, e.g. when the file was already stored under it.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

// ============================================================================
// Runs
// ============================================================================

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Waiting for admission
    Queued,
    /// A worker is executing the run
    Running,
    /// Worker exited with code 0
    Completed,
    /// Launch failed, worker exited non-zero, or worker disappeared
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl RunStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [RunStatus; 5] = [
        RunStatus::Queued,
        RunStatus::Running,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ];

    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Statuses from which a run may move into `self`.
    pub fn predecessors(&self) -> &'static [RunStatus] {
        match self {
            RunStatus::Queued => &[],
            RunStatus::Running => &[RunStatus::Queued],
            RunStatus::Completed => &[RunStatus::Running],
            RunStatus::Failed | RunStatus::Cancelled => &[RunStatus::Queued, RunStatus::Running],
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        next.predecessors().contains(self)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(format!("Unknown run status: {}", s)),
        }
    }
}

/// A verification job derived from an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Run id
    pub id: String,
    /// Upload the run was created from (non-owning)
    pub upload_id: String,
    /// Top cell name passed to the worker
    pub top_cell: String,
    /// Die id passed to the worker
    pub die_id: String,
    /// Working directory bound into the worker
    pub run_dir: PathBuf,
    /// Lifecycle status
    pub status: RunStatus,
    /// Worker currently executing the run (only while running)
    pub worker_ref: Option<String>,
    /// Worker that last executed the run, kept for diagnostics
    pub last_worker_ref: Option<String>,
    /// When the run was queued
    pub created_at: DateTime<Utc>,
    /// When the worker was launched
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
    /// Worker exit code
    pub exit_code: Option<i32>,
    /// Human-readable failure reason
    pub error: Option<String>,
    /// Upload checksums snapshotted at creation
    pub input_checksums: Checksums,
    /// Output artifact checksums, set on completion
    pub output_checksums: Option<Checksums>,
    /// 1-based position in the queue, `None` unless queued
    pub queue_position: Option<i64>,
}

impl Run {
    /// Whether the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Worker reference for diagnostics: the live one, else the last one.
    pub fn any_worker_ref(&self) -> Option<&str> {
        self.worker_ref
            .as_deref()
            .or(self.last_worker_ref.as_deref())
    }
}

/// Parameters for queueing a new run.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Run id (UUID v4 unless pinned with [`NewRun::with_id`])
    pub id: String,
    /// Upload to run against
    pub upload_id: String,
    /// Top cell name
    pub top_cell: String,
    /// Die id
    pub die_id: String,
    /// Working directory
    pub run_dir: PathBuf,
}

impl NewRun {
    /// Describe a new run with a fresh id and the default die id.
    pub fn new(
        upload_id: impl Into<String>,
        top_cell: impl Into<String>,
        run_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            upload_id: upload_id.into(),
            top_cell: top_cell.into(),
            die_id: DEFAULT_DIE_ID.to_string(),
            run_dir: run_dir.into(),
        }
    }

    /// Set the die id.
    pub fn with_die_id(mut self, die_id: impl Into<String>) -> Self {
        self.die_id = die_id.into();
        self
    }

    /// Pin the id, e.g. when the run directory was named after it.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// Partial update of a run. Only fields that are `Some` are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    /// New status; must be a legal successor of the current one
    pub status: Option<RunStatus>,
    /// Worker reference; only together with `status = running`
    pub worker_ref: Option<String>,
    /// Launch time
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time
    pub finished_at: Option<DateTime<Utc>>,
    /// Worker exit code
    pub exit_code: Option<i32>,
    /// Failure reason
    pub error: Option<String>,
    /// Output checksums; only together with `status = completed`
    pub output_checksums: Option<Checksums>,
}

impl RunUpdate {
    /// `queued -> running` with the launched worker.
    pub fn running(worker_ref: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(RunStatus::Running),
            worker_ref: Some(worker_ref.into()),
            started_at: Some(started_at),
            ..Default::default()
        }
    }

    /// `running -> completed`.
    pub fn completed(
        exit_code: i32,
        finished_at: DateTime<Utc>,
        output_checksums: Option<Checksums>,
    ) -> Self {
        Self {
            status: Some(RunStatus::Completed),
            finished_at: Some(finished_at),
            exit_code: Some(exit_code),
            output_checksums,
            ..Default::default()
        }
    }

    /// `queued | running -> failed`.
    pub fn failed(
        error: impl Into<String>,
        exit_code: Option<i32>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: Some(RunStatus::Failed),
            finished_at: Some(finished_at),
            exit_code,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// `queued | running -> cancelled`.
    pub fn cancelled(finished_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(RunStatus::Cancelled),
            finished_at: Some(finished_at),
            ..Default::default()
        }
    }

    /// Whether the update writes nothing.
    pub fn is_empty(&self) -> bool {
        *self == RunUpdate::default()
    }
}

/// Filter for [`JobStore::list_runs`].
#[derive(Debug, Clone, Default)]
pub struct ListRunsFilter {
    /// Statuses to include; empty means all
    pub statuses: Vec<RunStatus>,
}

impl ListRunsFilter {
    /// No filtering.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only runs in one of `statuses`.
    pub fn with_statuses(statuses: impl IntoIterator<Item = RunStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
        }
    }
}

// ============================================================================
// Store trait
// ============================================================================

/// Durable store of uploads and runs.
///
/// Lookups for unknown ids return `None`/`false`, never an error. All
/// operations fail with [`crate::Error::Database`] on storage failure.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Record an upload; `expires_at = created_at + expiry window`.
    async fn create_upload(&self, upload: NewUpload) -> Result<Upload>;

    /// Get an upload by id.
    async fn get_upload(&self, id: &str) -> Result<Option<Upload>>;

    /// All uploads, newest first.
    async fn list_uploads(&self) -> Result<Vec<Upload>>;

    /// Delete an upload record. Runs referencing it are untouched.
    async fn delete_upload(&self, id: &str) -> Result<bool>;

    /// Uploads past their expiry time that no run references.
    async fn get_expired_uploads(&self) -> Result<Vec<UploadRef>>;

    /// Delete an upload record only if it is still expired and unreferenced.
    ///
    /// Returns `false` when the upload is gone, not yet expired, or a run
    /// has started referencing it since it was listed as expired.
    async fn delete_expired_upload(&self, id: &str) -> Result<bool>;

    /// Queue a run, snapshotting the upload's checksums.
    ///
    /// Fails with [`crate::Error::UploadNotFound`] if the upload record is gone.
    /// Expiry is the caller's policy and is not checked here.
    async fn create_run(&self, run: NewRun) -> Result<Run>;

    /// Get a run by id, with its current queue position.
    async fn get_run(&self, id: &str) -> Result<Option<Run>>;

    /// Runs matching `filter`, newest first.
    async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<Run>>;

    /// Apply a partial update if it is a legal transition.
    ///
    /// Returns `false` when the run is missing, the update is empty, or the
    /// run's current status does not allow it.
    async fn update_run(&self, id: &str, update: &RunUpdate) -> Result<bool>;

    /// Delete a run record (administrative pruning).
    async fn delete_run(&self, id: &str) -> Result<bool>;

    /// Oldest queued run (ties broken by id).
    async fn get_next_queued_run(&self) -> Result<Option<Run>>;

    /// Runs the store believes are running.
    async fn get_running_runs(&self) -> Result<Vec<Run>>;

    /// Queue position of a run, `None` if it is not queued.
    async fn get_queue_position(&self, id: &str) -> Result<Option<i64>>;

    /// Number of queued runs.
    async fn get_queue_length(&self) -> Result<i64>;

    /// Check that the store is reachable.
    async fn health_check(&self) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_run_status_round_trip() {
        for status in RunStatus::ALL {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("paused".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_transitions() {
        use RunStatus::*;

        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Failed));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(!Queued.can_transition_to(Completed));

        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Queued));

        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in RunStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_upload_state_boundary() {
        let now = Utc::now();
        assert_eq!(UploadState::at(now, now), UploadState::Expired);
        assert_eq!(
            UploadState::at(now + Duration::seconds(1), now),
            UploadState::Available
        );
    }

    #[test]
    fn test_new_run_defaults() {
        let run = NewRun::new("u1", "chip_top", "/data/runs/x");
        assert_eq!(run.die_id, DEFAULT_DIE_ID);
        assert!(Uuid::parse_str(&run.id).is_ok());

        let pinned = run.with_id("r1").with_die_id("0000002A");
        assert_eq!(pinned.id, "r1");
        assert_eq!(pinned.die_id, "0000002A");
    }

    #[test]
    fn test_run_update_constructors() {
        assert!(RunUpdate::default().is_empty());

        let now = Utc::now();
        let update = RunUpdate::running("ctr-1", now);
        assert_eq!(update.status, Some(RunStatus::Running));
        assert_eq!(update.worker_ref.as_deref(), Some("ctr-1"));
        assert!(!update.is_empty());

        let update = RunUpdate::failed("boom", Some(2), now);
        assert_eq!(update.error.as_deref(), Some("boom"));
        assert_eq!(update.exit_code, Some(2));
    }
}
