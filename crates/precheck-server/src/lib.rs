// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Precheck Server - layout verification job service
//!
//! Accepts uploaded chip layouts, queues verification runs against them, and
//! executes each run in an isolated worker container, bounded by a global
//! concurrency cap. Run state is persisted so queue order and results survive
//! restarts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        API layer (HTTP, CLI, tests)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ handlers::*
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   precheck-server (This Crate)                           │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │  Job Store  │◄─│  Admission  │─►│   Worker    │  │   Expiry    │     │
//! │  │  (SQLite)   │  │  Scheduler  │  │   Runtime   │  │   Reaper    │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                   │ docker run / inspect / rm
//!           ▼                                   ▼
//! ┌───────────────────────┐          ┌─────────────────────────────────────┐
//! │ {DATA_DIR}/uploads/   │          │        Precheck workers             │
//! │ {DATA_DIR}/runs/      │◄─────────│  (/workdir bound to runs/{id})      │
//! └───────────────────────┘          └─────────────────────────────────────┘
//! ```
//!
//! The job store is the single source of truth for run state. The worker
//! runtime is a pure execution substrate; only the scheduler moves runs
//! between states.
//!
//! # Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `handle_create_upload` | Store a layout and record it with its checksum |
//! | `handle_get_upload` / `handle_list_uploads` | Inspect uploads |
//! | `handle_delete_upload` | Delete an upload's files and record |
//! | `handle_create_run` | Queue a precheck against an unexpired upload |
//! | `handle_get_run` / `handle_list_runs` | Inspect runs, with queue position |
//! | `handle_cancel_run` | Cancel a queued or running precheck |
//! | `handle_get_logs` / `handle_get_stats` | Worker output and resource usage |
//! | `handle_wait_run` | Block until a precheck finishes |
//! | `handle_output_path` | Locate a completed precheck's output layout |
//! | `handle_queue_status` | Queued/running counts and the admission cap |
//!
//! # Run Status State Machine
//!
//! ```text
//!                ┌────────┐
//!   create ─────►│ QUEUED │────────────────────┐
//!                └───┬────┘                    │
//!                    │ admit        launch fails│ cancel
//!                    ▼                  │       │
//!                ┌─────────┐            ▼       ▼
//!                │ RUNNING │──────►┌────────┐ ┌───────────┐
//!                └────┬────┘ exit≠0│ FAILED │ │ CANCELLED │
//!                     │    gone    └────────┘ └───────────┘
//!               exit 0│                           ▲
//!                     ▼                           │
//!               ┌───────────┐        cancel (running)
//!               │ COMPLETED │
//!               └───────────┘
//! ```
//!
//! Terminal states are final.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables (and `.env`):
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DATA_DIR` | `./data` | Root of `uploads/`, `runs/` and the default database |
//! | `PRECHECK_DATABASE_URL` | `sqlite:{DATA_DIR}/precheck.db?mode=rwc` | Job store |
//! | `PRECHECK_MAX_CONCURRENT` | `1` | Maximum concurrently running prechecks |
//! | `PRECHECK_UPLOAD_EXPIRY_MINUTES` | `15` | Upload expiry window |
//! | `PRECHECK_SCHEDULER_POLL_MS` | `1000` | Scheduler tick interval |
//! | `PRECHECK_REAPER_POLL_SECS` | `60` | Reaper tick interval |
//! | `PRECHECK_DOCKER_BIN` | `docker` | Container CLI |
//! | `PRECHECK_DOCKER_IMAGE` | `ghcr.io/wafer-space/gf180mcu-precheck:latest` | Worker image |
//! | `PRECHECK_CONTAINER_PREFIX` | `precheck-` | Worker container name prefix |
//! | `PRECHECK_STOP_TIMEOUT_SECS` | `10` | Grace period when stopping a worker |
//!
//! # Modules
//!
//! - [`config`]: Server configuration from environment variables
//! - [`store`]: Job store trait and SQLite implementation
//! - [`worker`]: Worker runtimes (Docker, mock)
//! - [`scheduler`]: Admission scheduler
//! - [`reaper`]: Expiry reaper
//! - [`projection`]: External views of uploads and runs
//! - [`handlers`]: API operations
//! - [`runtime`]: Embeddable runtime composing the above

#![deny(missing_docs)]

/// Embedded SQLite schema migrations.
///
/// ```ignore
/// use precheck_server::migrations;
///
/// let pool = SqlitePool::connect("sqlite:precheck.db?mode=rwc").await?;
/// migrations::run(&pool).await?;
/// ```
pub mod migrations;

/// Server configuration loaded from environment variables.
pub mod config;

/// Error types for precheck operations.
pub mod error;

/// Content checksums of uploads and outputs.
pub mod checksums;

/// Locating a run's output artifact.
pub mod run_output;

/// Durable job store for uploads and runs.
pub mod store;

/// Worker execution backends.
pub mod worker;

/// Admission scheduler: reconciliation, admission and cancellation.
pub mod scheduler;

/// Background worker deleting expired uploads.
pub mod reaper;

/// External views of uploads and runs.
pub mod projection;

/// Precheck API handlers.
pub mod handlers;

/// Embeddable precheck runtime.
pub mod runtime;

pub use config::Config;
pub use error::Error;
