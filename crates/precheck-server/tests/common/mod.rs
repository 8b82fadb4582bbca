// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for precheck-server integration tests.
//!
//! Provides TestContext wiring an in-memory store, the mock worker runtime,
//! a scheduler and handler state over a temporary data directory.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use precheck_server::handlers::{
    CreateRunRequest, PrecheckHandlerState, handle_create_run, handle_create_upload,
};
use precheck_server::projection::RunView;
use precheck_server::scheduler::{AdmissionScheduler, SchedulerConfig};
use precheck_server::store::SqliteJobStore;
use precheck_server::worker::{MockWorkerRuntime, WorkerRef};

/// Test context with every component wired to in-memory fakes.
pub struct TestContext {
    pub store: Arc<SqliteJobStore>,
    pub runtime: Arc<MockWorkerRuntime>,
    pub scheduler: Arc<AdmissionScheduler>,
    pub state: PrecheckHandlerState,
    pub data_dir: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Context admitting one run at a time, with the default upload expiry.
    pub async fn new() -> Self {
        Self::with_options(1, None).await
    }

    /// Context with the given concurrency cap and optional upload expiry.
    pub async fn with_options(max_concurrent: usize, upload_expiry: Option<Duration>) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let data_dir = temp_dir.path().to_path_buf();

        let mut store = SqliteJobStore::in_memory()
            .await
            .expect("Failed to open in-memory store");
        if let Some(expiry) = upload_expiry {
            store = store.with_upload_expiry(expiry);
        }
        let store = Arc::new(store);
        let runtime = Arc::new(MockWorkerRuntime::new());

        let scheduler = Arc::new(AdmissionScheduler::new(
            store.clone(),
            runtime.clone(),
            SchedulerConfig {
                poll_interval: Duration::from_millis(10),
                max_concurrent,
            },
        ));

        let state = PrecheckHandlerState::new(
            store.clone(),
            runtime.clone(),
            scheduler.clone(),
            data_dir.clone(),
        )
        .with_wait_poll_interval(Duration::from_millis(10));

        Self {
            store,
            runtime,
            scheduler,
            state,
            data_dir,
            _temp_dir: temp_dir,
        }
    }

    /// Upload a small layout and return its id.
    pub async fn upload(&self) -> String {
        handle_create_upload(&self.state, Some("chip.gds"), b"GDSII layout bytes")
            .await
            .expect("Failed to create upload")
            .id
    }

    /// Queue a run of `top_cell` against a fresh upload.
    pub async fn queue_run(&self, top_cell: &str) -> RunView {
        let upload_id = self.upload().await;
        self.queue_run_for(&upload_id, top_cell).await
    }

    /// Queue a run of `top_cell` against an existing upload.
    pub async fn queue_run_for(&self, upload_id: &str, top_cell: &str) -> RunView {
        handle_create_run(
            &self.state,
            CreateRunRequest {
                upload_id: upload_id.to_string(),
                top_cell: top_cell.to_string(),
                die_id: None,
            },
        )
        .await
        .expect("Failed to create run")
    }

    /// Worker the mock runtime launched for `run_id`.
    pub async fn worker_for(&self, run_id: &str) -> WorkerRef {
        self.runtime
            .worker_for_job(run_id)
            .await
            .expect("No worker launched for run")
    }

    /// Run directory of `run_id`.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.data_dir.join("runs").join(run_id)
    }
}

/// Write an output layout where the pipeline would leave it.
pub fn write_output(run_dir: &Path, top_cell: &str, contents: &[u8]) -> PathBuf {
    let stage_dir = run_dir
        .join(top_cell)
        .join("runs")
        .join("RUN_2025-01-15")
        .join("KLayout.GenerateID");
    std::fs::create_dir_all(&stage_dir).expect("Failed to create stage dir");

    let path = stage_dir.join(format!("{}.gds", top_cell));
    std::fs::write(&path, contents).expect("Failed to write output");
    path
}
