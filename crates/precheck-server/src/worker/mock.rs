// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock worker runtime for testing.
//!
//! Simulates workers in memory. Workers stay running until a test calls
//! [`MockWorkerRuntime::exit_worker`] or [`MockWorkerRuntime::vanish_worker`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::traits::*;

/// Mock worker state.
#[derive(Debug, Clone)]
struct MockWorker {
    job_id: String,
    request: LaunchRequest,
    status: WorkerStatus,
    logs: Vec<String>,
}

#[derive(Debug, Default)]
struct MockState {
    workers: HashMap<WorkerRef, MockWorker>,
    launches: Vec<LaunchRequest>,
    stop_calls: Vec<WorkerRef>,
    next_id: u64,
    failures_pending: usize,
}

/// Mock worker runtime for testing.
#[derive(Clone, Default)]
pub struct MockWorkerRuntime {
    pub(crate) state: Arc<Mutex<MockState>>,
    /// If true, every launch fails
    pub fail_launches: bool,
    /// If true, `status` fails as if the runtime were unreachable
    pub fail_status: bool,
}

impl MockWorkerRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock runtime whose launches always fail.
    pub fn failing() -> Self {
        Self {
            fail_launches: true,
            ..Self::default()
        }
    }

    /// Make the next `count` launches fail.
    pub async fn fail_next_launches(&self, count: usize) {
        self.state.lock().await.failures_pending = count;
    }

    /// Mark a worker as exited with `exit_code`.
    pub async fn exit_worker(&self, worker: &WorkerRef, exit_code: i32) {
        self.exit_worker_with_error(worker, exit_code, None).await;
    }

    /// Mark a worker as exited with `exit_code` and a runtime error text.
    pub async fn exit_worker_with_error(
        &self,
        worker: &WorkerRef,
        exit_code: i32,
        error: Option<&str>,
    ) {
        let mut state = self.state.lock().await;
        if let Some(w) = state.workers.get_mut(worker) {
            w.status = WorkerStatus::exited(exit_code, error.map(str::to_string), Some(Utc::now()));
        }
    }

    /// Forget a worker, as if it were removed behind the runtime's back.
    pub async fn vanish_worker(&self, worker: &WorkerRef) {
        self.state.lock().await.workers.remove(worker);
    }

    /// Add a worker that was not launched through this runtime (e.g. left
    /// over from a previous process).
    pub async fn insert_worker(&self, job_id: &str, working_dir: &std::path::Path) -> WorkerRef {
        let mut state = self.state.lock().await;
        let worker = next_ref(&mut state);
        let request = LaunchRequest {
            job_id: job_id.to_string(),
            working_dir: working_dir.to_path_buf(),
            args: Vec::new(),
        };
        state.workers.insert(
            worker.clone(),
            MockWorker {
                job_id: job_id.to_string(),
                request,
                status: WorkerStatus::running(),
                logs: Vec::new(),
            },
        );
        worker
    }

    /// Append a log line to a worker.
    pub async fn push_log(&self, worker: &WorkerRef, line: &str) {
        let mut state = self.state.lock().await;
        if let Some(w) = state.workers.get_mut(worker) {
            w.logs.push(line.to_string());
        }
    }

    /// All launch requests received, in order (including failed ones).
    pub async fn launches(&self) -> Vec<LaunchRequest> {
        self.state.lock().await.launches.clone()
    }

    /// All `stop_and_remove` calls received, in order.
    pub async fn stop_calls(&self) -> Vec<WorkerRef> {
        self.state.lock().await.stop_calls.clone()
    }

    /// Number of `stop_and_remove` calls for one worker.
    pub async fn stop_count(&self, worker: &WorkerRef) -> usize {
        self.state
            .lock()
            .await
            .stop_calls
            .iter()
            .filter(|w| *w == worker)
            .count()
    }

    /// Worker currently launched for `job_id`, if any.
    pub async fn worker_for_job(&self, job_id: &str) -> Option<WorkerRef> {
        self.state
            .lock()
            .await
            .workers
            .iter()
            .find(|(_, w)| w.job_id == job_id)
            .map(|(r, _)| r.clone())
    }

    /// Launch request a live worker was started with.
    pub async fn request_for(&self, worker: &WorkerRef) -> Option<LaunchRequest> {
        self.state
            .lock()
            .await
            .workers
            .get(worker)
            .map(|w| w.request.clone())
    }
}

fn next_ref(state: &mut MockState) -> WorkerRef {
    state.next_id += 1;
    WorkerRef::new(format!("mock_{}", state.next_id))
}

#[async_trait]
impl WorkerRuntime for MockWorkerRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<WorkerRef> {
        let mut state = self.state.lock().await;
        state.launches.push(request.clone());

        if self.fail_launches || state.failures_pending > 0 {
            state.failures_pending = state.failures_pending.saturating_sub(1);
            return Err(WorkerError::LaunchFailed("Mock launch failure".to_string()));
        }

        let worker = next_ref(&mut state);
        state.workers.insert(
            worker.clone(),
            MockWorker {
                job_id: request.job_id.clone(),
                request: request.clone(),
                status: WorkerStatus::running(),
                logs: Vec::new(),
            },
        );

        Ok(worker)
    }

    async fn status(&self, worker: &WorkerRef) -> Result<WorkerStatus> {
        if self.fail_status {
            return Err(WorkerError::Other("Mock runtime unreachable".to_string()));
        }

        let state = self.state.lock().await;
        Ok(state
            .workers
            .get(worker)
            .map(|w| w.status.clone())
            .unwrap_or_else(WorkerStatus::missing))
    }

    async fn stop_and_remove(&self, worker: &WorkerRef) -> bool {
        let mut state = self.state.lock().await;
        state.stop_calls.push(worker.clone());
        state.workers.remove(worker).is_some()
    }

    async fn count_running(&self) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state
            .workers
            .values()
            .filter(|w| w.status.state == WorkerState::Running)
            .count())
    }

    async fn list_active(&self) -> Result<Vec<WorkerInfo>> {
        let state = self.state.lock().await;
        Ok(state
            .workers
            .iter()
            .map(|(worker, w)| WorkerInfo {
                worker_ref: worker.clone(),
                job_id: Some(w.job_id.clone()),
                running: w.status.state == WorkerState::Running,
            })
            .collect())
    }

    async fn logs(&self, worker: &WorkerRef, options: &LogOptions) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let w = state
            .workers
            .get(worker)
            .ok_or_else(|| WorkerError::CommandFailed {
                command: "logs".to_string(),
                stderr: format!("No such worker: {}", worker),
            })?;

        let skip = options
            .tail
            .map(|tail| w.logs.len().saturating_sub(tail))
            .unwrap_or(0);
        Ok(w.logs[skip..].to_vec())
    }

    async fn stats(&self, worker: &WorkerRef) -> Result<WorkerStats> {
        let state = self.state.lock().await;
        if !state.workers.contains_key(worker) {
            return Err(WorkerError::Other(format!("No such worker: {}", worker)));
        }

        Ok(WorkerStats {
            cpu_percent: "0.00%".to_string(),
            pids: "1".to_string(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(job_id: &str) -> LaunchRequest {
        LaunchRequest::precheck(job_id, format!("/tmp/runs/{job_id}"), "top", "FFFFFFFF")
    }

    #[tokio::test]
    async fn test_mock_launch_and_exit() {
        let runtime = MockWorkerRuntime::new();

        let worker = runtime.launch(&request("r1")).await.unwrap();
        assert_eq!(runtime.count_running().await.unwrap(), 1);
        assert_eq!(
            runtime.status(&worker).await.unwrap().state,
            WorkerState::Running
        );

        runtime.exit_worker(&worker, 0).await;
        let status = runtime.status(&worker).await.unwrap();
        assert_eq!(status.state, WorkerState::Exited);
        assert_eq!(status.exit_code, Some(0));
        assert_eq!(runtime.count_running().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mock_failing_launch() {
        let runtime = MockWorkerRuntime::failing();

        let result = runtime.launch(&request("r1")).await;
        assert!(matches!(result, Err(WorkerError::LaunchFailed(_))));
        assert_eq!(runtime.launches().await.len(), 1);
        assert_eq!(runtime.count_running().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mock_vanish_and_stop() {
        let runtime = MockWorkerRuntime::new();
        let worker = runtime.launch(&request("r1")).await.unwrap();

        runtime.vanish_worker(&worker).await;
        assert_eq!(
            runtime.status(&worker).await.unwrap().state,
            WorkerState::Missing
        );

        assert!(!runtime.stop_and_remove(&worker).await);
        assert_eq!(runtime.stop_count(&worker).await, 1);
    }

    #[tokio::test]
    async fn test_mock_logs_tail() {
        let runtime = MockWorkerRuntime::new();
        let worker = runtime.launch(&request("r1")).await.unwrap();
        for line in ["a", "b", "c"] {
            runtime.push_log(&worker, line).await;
        }

        let options = LogOptions {
            tail: Some(2),
            ..Default::default()
        };
        assert_eq!(runtime.logs(&worker, &options).await.unwrap(), vec!["b", "c"]);
    }
}
