// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed job store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::{debug, info};

use crate::checksums::Checksums;
use crate::error::{Error, Result};
use crate::migrations;

use super::{
    JobStore, ListRunsFilter, NewRun, NewUpload, Run, RunStatus, RunUpdate, Upload, UploadRef,
    UploadState,
};

/// Default upload expiry window.
pub const DEFAULT_UPLOAD_EXPIRY: Duration = Duration::from_secs(15 * 60);

/// Run columns plus the derived queue position.
///
/// Position is computed in the same statement as the row so a reader never
/// sees a row and a position from different moments.
const SELECT_RUN: &str = r#"
    SELECT r.id, r.upload_id, r.top_cell, r.die_id, r.status, r.worker_ref,
           r.last_worker_ref, r.run_dir, r.created_at, r.started_at, r.finished_at,
           r.exit_code, r.error, r.input_checksums, r.output_checksums,
           CASE WHEN r.status = 'queued' THEN (
               SELECT COUNT(*) + 1
               FROM runs q
               WHERE q.status = 'queued'
                 AND (q.created_at < r.created_at
                      OR (q.created_at = r.created_at AND q.id < r.id))
           ) END AS queue_position
    FROM runs r
"#;

const SELECT_UPLOAD: &str = r#"
    SELECT id, name, filepath, size, checksums, created_at, expires_at
    FROM uploads
"#;

/// SQLite-backed [`JobStore`].
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    upload_expiry: Duration,
    /// Last issued creation timestamp, shared by clones.
    last_created: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl SqliteJobStore {
    /// Create a store over an already-migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            upload_expiry: DEFAULT_UPLOAD_EXPIRY,
            last_created: Arc::new(Mutex::new(None)),
        }
    }

    /// Set the upload expiry window.
    pub fn with_upload_expiry(mut self, expiry: Duration) -> Self {
        self.upload_expiry = expiry;
        self
    }

    /// Connect to `url`, then run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        migrations::run(&pool).await?;

        info!(url = %url, "Job store ready");

        Ok(Self::new(pool))
    }

    /// Open (creating if needed) a database file and run migrations.
    ///
    /// Parent directories are created as needed.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Private in-memory store on a single, never-recycled connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        migrations::run(&pool).await?;

        Ok(Self::new(pool))
    }

    /// Issue a creation timestamp strictly later than any issued before.
    ///
    /// FIFO admission orders by `created_at`; two runs created within the same
    /// clock tick must still get distinct, ordered timestamps.
    fn next_created_at(&self) -> DateTime<Utc> {
        let now = now();
        let mut last = self
            .last_created
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let issued = match *last {
            Some(prev) if now <= prev => prev + TimeDelta::microseconds(1),
            _ => now,
        };
        *last = Some(issued);
        issued
    }

    async fn fetch_runs(&self, mut query: QueryBuilder<'_, Sqlite>) -> Result<Vec<Run>> {
        let rows: Vec<RunRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Run::try_from).collect()
    }
}

/// Current time at the precision the store keeps.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn validate_update(update: &RunUpdate) -> Result<()> {
    if update.worker_ref.is_some() && update.status != Some(RunStatus::Running) {
        return Err(Error::InvalidRequest(
            "worker_ref can only be set when entering running".to_string(),
        ));
    }
    if update.output_checksums.is_some() && update.status != Some(RunStatus::Completed) {
        return Err(Error::InvalidRequest(
            "output_checksums can only be set when entering completed".to_string(),
        ));
    }
    Ok(())
}

#[async_trait::async_trait]
impl JobStore for SqliteJobStore {
    async fn create_upload(&self, upload: NewUpload) -> Result<Upload> {
        let created_at = self.next_created_at();
        let expires_at = TimeDelta::from_std(self.upload_expiry)
            .ok()
            .and_then(|window| created_at.checked_add_signed(window))
            .ok_or_else(|| Error::InvalidRequest("upload expiry window out of range".into()))?;
        let size = i64::try_from(upload.size)
            .map_err(|_| Error::InvalidRequest(format!("upload too large: {}", upload.size)))?;

        sqlx::query(
            r#"
            INSERT INTO uploads (id, name, filepath, size, checksums, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&upload.id)
        .bind(&upload.name)
        .bind(upload.filepath.to_string_lossy().into_owned())
        .bind(size)
        .bind(serde_json::to_string(&upload.checksums)?)
        .bind(created_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        debug!(upload_id = %upload.id, expires_at = %expires_at, "Recorded upload");

        Ok(Upload {
            id: upload.id,
            name: upload.name,
            filepath: upload.filepath,
            size: upload.size,
            checksums: upload.checksums,
            created_at,
            expires_at,
            state: UploadState::at(expires_at, now()),
        })
    }

    async fn get_upload(&self, id: &str) -> Result<Option<Upload>> {
        let row: Option<UploadRow> = sqlx::query_as(&format!("{SELECT_UPLOAD} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let now = now();
        row.map(|r| r.into_upload(now)).transpose()
    }

    async fn list_uploads(&self) -> Result<Vec<Upload>> {
        let rows: Vec<UploadRow> =
            sqlx::query_as(&format!("{SELECT_UPLOAD} ORDER BY created_at DESC, id DESC"))
                .fetch_all(&self.pool)
                .await?;

        let now = now();
        rows.into_iter().map(|r| r.into_upload(now)).collect()
    }

    async fn delete_upload(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM uploads WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired_upload(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM uploads
            WHERE id = ?1
              AND expires_at <= ?2
              AND NOT EXISTS (SELECT 1 FROM runs WHERE upload_id = ?1)
            "#,
        )
        .bind(id)
        .bind(now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_expired_uploads(&self) -> Result<Vec<UploadRef>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT u.id, u.filepath
            FROM uploads u
            LEFT JOIN runs r ON r.upload_id = u.id
            WHERE u.expires_at <= ?1
              AND r.id IS NULL
            ORDER BY u.expires_at ASC, u.id ASC
            "#,
        )
        .bind(now())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, filepath)| UploadRef {
                id,
                filepath: PathBuf::from(filepath),
            })
            .collect())
    }

    async fn create_run(&self, run: NewRun) -> Result<Run> {
        let created_at = self.next_created_at();

        // Checksums are copied from the upload row in the same statement
        let result = sqlx::query(
            r#"
            INSERT INTO runs (id, upload_id, top_cell, die_id, status, run_dir, created_at, input_checksums)
            SELECT ?1, u.id, ?2, ?3, 'queued', ?4, ?5, u.checksums
            FROM uploads u
            WHERE u.id = ?6
            "#,
        )
        .bind(&run.id)
        .bind(&run.top_cell)
        .bind(&run.die_id)
        .bind(run.run_dir.to_string_lossy().into_owned())
        .bind(created_at)
        .bind(&run.upload_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::UploadNotFound(run.upload_id));
        }

        debug!(run_id = %run.id, upload_id = %run.upload_id, "Queued run");

        self.get_run(&run.id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run.id))
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let mut query = QueryBuilder::new(SELECT_RUN);
        query.push(" WHERE r.id = ").push_bind(id.to_string());

        Ok(self.fetch_runs(query).await?.into_iter().next())
    }

    async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<Run>> {
        let mut query = QueryBuilder::new(SELECT_RUN);

        if !filter.statuses.is_empty() {
            query.push(" WHERE r.status IN (");
            let mut statuses = query.separated(", ");
            for status in &filter.statuses {
                statuses.push_bind(status.as_str().to_string());
            }
            statuses.push_unseparated(")");
        }
        query.push(" ORDER BY r.created_at DESC, r.id DESC");

        self.fetch_runs(query).await
    }

    async fn update_run(&self, id: &str, update: &RunUpdate) -> Result<bool> {
        if update.is_empty() {
            return Ok(false);
        }
        validate_update(update)?;

        let allowed: &[RunStatus] = match update.status {
            Some(status) => status.predecessors(),
            None => &[RunStatus::Queued, RunStatus::Running],
        };
        if allowed.is_empty() {
            return Ok(false);
        }

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE runs SET ");
        {
            let mut set = query.separated(", ");

            if let Some(status) = update.status {
                set.push("status = ")
                    .push_bind_unseparated(status.as_str().to_string());
                if status.is_terminal() {
                    // Cleared but remembered
                    set.push("last_worker_ref = COALESCE(worker_ref, last_worker_ref)");
                    set.push("worker_ref = NULL");
                }
            }
            if let Some(worker_ref) = &update.worker_ref {
                set.push("worker_ref = ")
                    .push_bind_unseparated(worker_ref.clone());
            }
            if let Some(started_at) = update.started_at {
                set.push("started_at = ").push_bind_unseparated(started_at);
            }
            if let Some(finished_at) = update.finished_at {
                set.push("finished_at = ").push_bind_unseparated(finished_at);
            }
            if let Some(exit_code) = update.exit_code {
                set.push("exit_code = ").push_bind_unseparated(exit_code);
            }
            if let Some(error) = &update.error {
                set.push("error = ").push_bind_unseparated(error.clone());
            }
            if let Some(sums) = &update.output_checksums {
                set.push("output_checksums = ")
                    .push_bind_unseparated(serde_json::to_string(sums)?);
            }
        }

        query.push(" WHERE id = ").push_bind(id.to_string());
        query.push(" AND status IN (");
        let mut predecessors = query.separated(", ");
        for status in allowed {
            predecessors.push_bind(status.as_str().to_string());
        }
        predecessors.push_unseparated(")");

        let result = query.build().execute(&self.pool).await?;
        let applied = result.rows_affected() > 0;

        if !applied {
            debug!(
                run_id = %id,
                status = ?update.status,
                "Run update not applied (missing run or illegal transition)"
            );
        }

        Ok(applied)
    }

    async fn delete_run(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM runs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_next_queued_run(&self) -> Result<Option<Run>> {
        let mut query = QueryBuilder::new(SELECT_RUN);
        query.push(" WHERE r.status = 'queued' ORDER BY r.created_at ASC, r.id ASC LIMIT 1");

        Ok(self.fetch_runs(query).await?.into_iter().next())
    }

    async fn get_running_runs(&self) -> Result<Vec<Run>> {
        let mut query = QueryBuilder::new(SELECT_RUN);
        query.push(" WHERE r.status = 'running' ORDER BY r.started_at ASC, r.created_at ASC");

        self.fetch_runs(query).await
    }

    async fn get_queue_position(&self, id: &str) -> Result<Option<i64>> {
        Ok(self.get_run(id).await?.and_then(|run| run.queue_position))
    }

    async fn get_queue_length(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM runs WHERE status = 'queued'")
            .fetch_one(&self.pool)
            .await?;

        Ok(row.0)
    }

    async fn health_check(&self) -> Result<bool> {
        let result: std::result::Result<(i64,), _> =
            sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

// ============================================================================
// Row types
// ============================================================================

#[derive(sqlx::FromRow)]
struct UploadRow {
    id: String,
    name: String,
    filepath: String,
    size: i64,
    checksums: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl UploadRow {
    fn into_upload(self, now: DateTime<Utc>) -> Result<Upload> {
        let checksums: Checksums = serde_json::from_str(&self.checksums)?;
        let size = u64::try_from(self.size).map_err(|_| {
            Error::Other(format!("Upload {} has invalid size {}", self.id, self.size))
        })?;

        Ok(Upload {
            id: self.id,
            name: self.name,
            filepath: PathBuf::from(self.filepath),
            size,
            checksums,
            created_at: self.created_at,
            expires_at: self.expires_at,
            state: UploadState::at(self.expires_at, now),
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    upload_id: String,
    top_cell: String,
    die_id: String,
    status: String,
    worker_ref: Option<String>,
    last_worker_ref: Option<String>,
    run_dir: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    error: Option<String>,
    input_checksums: String,
    output_checksums: Option<String>,
    queue_position: Option<i64>,
}

impl TryFrom<RunRow> for Run {
    type Error = Error;

    fn try_from(row: RunRow) -> Result<Self> {
        let status: RunStatus = row.status.parse().map_err(Error::Other)?;
        let output_checksums = row
            .output_checksums
            .as_deref()
            .map(serde_json::from_str::<Checksums>)
            .transpose()?;

        Ok(Run {
            id: row.id,
            upload_id: row.upload_id,
            top_cell: row.top_cell,
            die_id: row.die_id,
            run_dir: PathBuf::from(row.run_dir),
            status,
            worker_ref: row.worker_ref,
            last_worker_ref: row.last_worker_ref,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            exit_code: row.exit_code,
            error: row.error,
            input_checksums: serde_json::from_str(&row.input_checksums)?,
            output_checksums,
            queue_position: row.queue_position,
        })
    }
}
