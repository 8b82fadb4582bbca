// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External views of uploads and runs.
//!
//! The API exposes container-engine shaped records (`Id`, `State.Status`,
//! `HostConfig.Binds`, ...). These types pin that field set down so the
//! transport layer only has to serialise them.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::checksums::Checksums;
use crate::store::{Run, RunStatus, Upload, UploadState};
use crate::worker::WORKER_WORKDIR;

/// Rendering of an absent timestamp.
pub const ZERO_TIME: &str = "0001-01-01T00:00:00Z";

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn format_optional_time(time: Option<DateTime<Utc>>) -> String {
    time.map(format_time)
        .unwrap_or_else(|| ZERO_TIME.to_string())
}

// ============================================================================
// Uploads
// ============================================================================

/// External view of an upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadView {
    /// Upload id
    pub id: String,
    /// Display name
    pub name: String,
    /// Creation time
    pub created: String,
    /// Size in bytes
    pub size: u64,
    /// Content checksums
    pub checksums: Checksums,
    /// Expiry time
    pub expires_at: String,
    /// Availability
    pub state: UploadStateView,
}

/// `State` of an [`UploadView`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadStateView {
    /// `available` or `expired`
    pub status: UploadState,
    /// Whether the upload has expired
    pub expired: bool,
}

impl From<&Upload> for UploadView {
    fn from(upload: &Upload) -> Self {
        Self {
            id: upload.id.clone(),
            name: upload.name.clone(),
            created: format_time(upload.created_at),
            size: upload.size,
            checksums: upload.checksums.clone(),
            expires_at: format_time(upload.expires_at),
            state: UploadStateView {
                status: upload.state,
                expired: upload.state == UploadState::Expired,
            },
        }
    }
}

// ============================================================================
// Runs
// ============================================================================

/// External view of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunView {
    /// Run id
    pub id: String,
    /// `precheck-{id}`
    pub name: String,
    /// Creation time
    pub created: String,
    /// Lifecycle state
    pub state: RunStateView,
    /// Run parameters
    pub config: RunConfigView,
    /// Working directory binding
    pub host_config: HostConfigView,
    /// Queue placement
    pub queue: QueueView,
    /// Worker reference (live, else last)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Input checksums
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<InputView>,
    /// Output artifact info, once completed with output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputView>,
}

/// `State` of a [`RunView`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunStateView {
    /// Lifecycle status
    pub status: RunStatus,
    /// Whether a worker is executing the run
    pub running: bool,
    /// Always false; runs cannot be paused
    pub paused: bool,
    /// Launch time or [`ZERO_TIME`]
    pub started_at: String,
    /// Terminal time or [`ZERO_TIME`]
    pub finished_at: String,
    /// Exit code, 0 when unknown
    pub exit_code: i32,
    /// Failure reason, empty when none
    pub error: String,
}

/// `Config` of a [`RunView`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunConfigView {
    /// Run parameters as labels
    pub labels: RunLabels,
}

/// Run parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunLabels {
    /// Source upload
    pub upload_id: String,
    /// Top cell
    pub top_cell: String,
    /// Die id
    pub die_id: String,
}

/// `HostConfig` of a [`RunView`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfigView {
    /// `{run_dir}:/workdir:rw`
    pub binds: Vec<String>,
}

/// `Queue` of a [`RunView`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueView {
    /// 1-based position, null unless queued
    pub position: Option<i64>,
    /// Number of queued runs
    pub length: i64,
}

/// `Input` of a [`RunView`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InputView {
    /// Input checksums
    pub checksums: Checksums,
}

/// `Output` of a [`RunView`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutputView {
    /// Whether the artifact can be downloaded
    pub available: bool,
    /// Artifact checksums
    pub checksums: Checksums,
}

impl RunView {
    /// Build the view of `run` given the current queue length.
    pub fn new(run: &Run, queue_length: i64) -> Self {
        Self {
            id: run.id.clone(),
            name: format!("precheck-{}", run.id),
            created: format_time(run.created_at),
            state: RunStateView {
                status: run.status,
                running: run.status == RunStatus::Running,
                paused: false,
                started_at: format_optional_time(run.started_at),
                finished_at: format_optional_time(run.finished_at),
                exit_code: run.exit_code.unwrap_or(0),
                error: run.error.clone().unwrap_or_default(),
            },
            config: RunConfigView {
                labels: RunLabels {
                    upload_id: run.upload_id.clone(),
                    top_cell: run.top_cell.clone(),
                    die_id: run.die_id.clone(),
                },
            },
            host_config: HostConfigView {
                binds: vec![format!(
                    "{}:{}:rw",
                    run.run_dir.display(),
                    WORKER_WORKDIR
                )],
            },
            queue: QueueView {
                position: run.queue_position,
                length: queue_length,
            },
            container_id: run.any_worker_ref().map(str::to_string),
            input: (!run.input_checksums.is_empty()).then(|| InputView {
                checksums: run.input_checksums.clone(),
            }),
            output: run
                .output_checksums
                .as_ref()
                .filter(|sums| !sums.is_empty())
                .map(|sums| OutputView {
                    available: true,
                    checksums: sums.clone(),
                }),
        }
    }
}
