// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker worker runtime.
//!
//! Drives the `docker` CLI. Each worker is one detached container:
//!
//! ```text
//! docker run -d --name {prefix}{run_id} --label precheck.run_id={run_id} \
//!     -v {run_dir}:/workdir:rw {image} python precheck.py {args...}
//! ```
//!
//! The container id printed by `docker run -d` is the [`WorkerRef`].

use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::traits::*;
use crate::config::Config;

/// Label carrying the run id on every worker container.
pub const RUN_ID_LABEL: &str = "precheck.run_id";

/// Configuration for the Docker runtime.
#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    /// Path or name of the docker binary
    pub docker_bin: String,
    /// Worker image
    pub image: String,
    /// Container name prefix; also used to find our containers
    pub container_prefix: String,
    /// Grace period for `docker stop`
    pub stop_timeout: Duration,
    /// Entrypoint command run before the launch arguments
    pub command: Vec<String>,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            image: "ghcr.io/wafer-space/gf180mcu-precheck:latest".to_string(),
            container_prefix: "precheck-".to_string(),
            stop_timeout: Duration::from_secs(10),
            command: vec!["python".to_string(), "precheck.py".to_string()],
        }
    }
}

impl From<&Config> for DockerRuntimeConfig {
    fn from(config: &Config) -> Self {
        Self {
            docker_bin: config.docker_bin.clone(),
            image: config.docker_image.clone(),
            container_prefix: config.container_prefix.clone(),
            stop_timeout: config.stop_timeout,
            ..Default::default()
        }
    }
}

/// Worker runtime backed by the Docker CLI.
pub struct DockerRuntime {
    config: DockerRuntimeConfig,
}

impl DockerRuntime {
    /// Create a new Docker runtime.
    pub fn new(config: DockerRuntimeConfig) -> Self {
        Self { config }
    }

    /// Container name for a job.
    pub fn container_name(&self, job_id: &str) -> String {
        format!("{}{}", self.config.container_prefix, job_id)
    }

    async fn exec(&self, args: &[String]) -> Result<Output> {
        debug!(docker = %self.config.docker_bin, args = ?args, "Running docker command");

        let output = Command::new(&self.config.docker_bin)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(output)
    }

    /// Run a docker subcommand and return stdout, failing on non-zero exit.
    async fn exec_ok(&self, args: &[String]) -> Result<String> {
        let output = self.exec(args).await?;

        if !output.status.success() {
            return Err(WorkerError::CommandFailed {
                command: format!("docker {}", args.first().map(String::as_str).unwrap_or("")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_args(&self, request: &LaunchRequest) -> Result<Vec<String>> {
        let working_dir = std::path::absolute(&request.working_dir)?;

        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.container_name(&request.job_id),
            "--label".to_string(),
            format!("{}={}", RUN_ID_LABEL, request.job_id),
            "-v".to_string(),
            format!("{}:{}:rw", working_dir.display(), WORKER_WORKDIR),
            self.config.image.clone(),
        ];
        args.extend(self.config.command.iter().cloned());
        args.extend(request.args.iter().cloned());

        Ok(args)
    }

    async fn list_containers(&self, running_only: bool) -> Result<Vec<WorkerInfo>> {
        let mut args = vec![
            "ps".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            format!("name={}", self.config.container_prefix),
            "--filter".to_string(),
            format!("label={}", RUN_ID_LABEL),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ];
        if !running_only {
            args.insert(1, "-a".to_string());
        }

        let stdout = self.exec_ok(&args).await?;

        let mut workers = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let entry: PsEntry = serde_json::from_str(line)?;
            workers.push(entry.into_worker_info(&self.config.container_prefix));
        }

        Ok(workers)
    }
}

#[async_trait]
impl WorkerRuntime for DockerRuntime {
    fn runtime_type(&self) -> &'static str {
        "docker"
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<WorkerRef> {
        let args = self.run_args(request)?;

        let container_id = match self.exec_ok(&args).await {
            Ok(stdout) => stdout.trim().to_string(),
            Err(WorkerError::CommandFailed { stderr, .. }) => {
                return Err(WorkerError::LaunchFailed(stderr));
            }
            Err(e) => return Err(WorkerError::LaunchFailed(e.to_string())),
        };

        if container_id.is_empty() {
            return Err(WorkerError::LaunchFailed(
                "docker run printed no container id".to_string(),
            ));
        }

        info!(
            job_id = %request.job_id,
            container_id = %container_id,
            image = %self.config.image,
            "Launched worker container"
        );

        Ok(WorkerRef::new(container_id))
    }

    async fn status(&self, worker: &WorkerRef) -> Result<WorkerStatus> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{json .State}}".to_string(),
            worker.to_string(),
        ];

        match self.exec_ok(&args).await {
            Ok(stdout) => {
                let state: ContainerState = serde_json::from_str(stdout.trim())?;
                Ok(state.into_status())
            }
            Err(WorkerError::CommandFailed { stderr, .. }) if is_no_such_object(&stderr) => {
                Ok(WorkerStatus::missing())
            }
            Err(e) => Err(e),
        }
    }

    async fn stop_and_remove(&self, worker: &WorkerRef) -> bool {
        let stop = vec![
            "stop".to_string(),
            "-t".to_string(),
            self.config.stop_timeout.as_secs().to_string(),
            worker.to_string(),
        ];
        if let Err(e) = self.exec_ok(&stop).await {
            // Already stopped or gone; removal below decides the outcome
            debug!(container_id = %worker, error = %e, "docker stop failed");
        }

        let remove = vec!["rm".to_string(), "-f".to_string(), worker.to_string()];
        match self.exec_ok(&remove).await {
            Ok(_) => {
                info!(container_id = %worker, "Removed worker container");
                true
            }
            Err(e) => {
                warn!(container_id = %worker, error = %e, "Failed to remove worker container");
                false
            }
        }
    }

    async fn count_running(&self) -> Result<usize> {
        Ok(self.list_containers(true).await?.len())
    }

    async fn list_active(&self) -> Result<Vec<WorkerInfo>> {
        self.list_containers(false).await
    }

    async fn logs(&self, worker: &WorkerRef, options: &LogOptions) -> Result<Vec<String>> {
        let mut args = vec!["logs".to_string()];
        if let Some(since) = options.since {
            args.push("--since".to_string());
            args.push(since.to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        if let Some(tail) = options.tail {
            args.push("--tail".to_string());
            args.push(tail.to_string());
        }
        if options.timestamps {
            args.push("--timestamps".to_string());
        }
        args.push(worker.to_string());

        let output = self.exec(&args).await?;
        if !output.status.success() {
            return Err(WorkerError::CommandFailed {
                command: "docker logs".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // The container's stdout and stderr arrive on separate pipes
        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        if options.timestamps {
            lines.sort_by_key(|line| log_line_timestamp(line));
        }

        Ok(lines)
    }

    async fn stats(&self, worker: &WorkerRef) -> Result<WorkerStats> {
        let args = vec![
            "stats".to_string(),
            "--no-stream".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
            worker.to_string(),
        ];

        let stdout = self.exec_ok(&args).await?;
        let line = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| WorkerError::Other(format!("no stats for {}", worker)))?;

        Ok(serde_json::from_str(line)?)
    }
}

/// Whether docker's stderr says the object does not exist.
fn is_no_such_object(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such object") || lower.contains("no such container")
}

/// `.State` of `docker inspect`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    status: String,
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    error: String,
    #[serde(default)]
    finished_at: Option<String>,
}

impl ContainerState {
    fn into_status(self) -> WorkerStatus {
        match self.status.as_str() {
            "exited" | "dead" => {
                // Docker reports "0001-01-01T00:00:00Z" for "never"
                let finished_at = self
                    .finished_at
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc))
                    .filter(|dt| dt.year() > 1);
                WorkerStatus::exited(self.exit_code, Some(self.error), finished_at)
            }
            // created, running, paused, restarting, removing
            _ => WorkerStatus::running(),
        }
    }
}

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsEntry {
    #[serde(rename = "ID")]
    id: String,
    names: String,
    state: String,
}

impl PsEntry {
    fn into_worker_info(self, prefix: &str) -> WorkerInfo {
        let job_id = self
            .names
            .split(',')
            .find_map(|name| name.strip_prefix(prefix))
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        WorkerInfo {
            worker_ref: WorkerRef::new(self.id),
            job_id,
            running: self.state == "running",
        }
    }
}
