// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Precheck Server - layout verification job service
//!
//! Runs the background half of the service:
//! - Admission scheduler (launch queued prechecks, reconcile running ones)
//! - Expiry reaper (delete expired uploads)
//! - Docker worker runtime

use std::sync::Arc;
use tracing::{info, warn};

use precheck_server::config::Config;
use precheck_server::runtime::PrecheckRuntime;
use precheck_server::store::SqliteJobStore;
use precheck_server::worker::{DockerRuntime, DockerRuntimeConfig, WorkerRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "precheck_server=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        data_dir = %config.data_dir.display(),
        max_concurrent = config.max_concurrent,
        image = %config.docker_image,
        "Starting Precheck Server"
    );

    tokio::fs::create_dir_all(&config.data_dir).await?;

    let store = Arc::new(
        SqliteJobStore::connect(&config.database_url)
            .await?
            .with_upload_expiry(config.upload_expiry),
    );

    let worker_runtime = Arc::new(DockerRuntime::new(DockerRuntimeConfig::from(&config)));
    info!(
        runtime_type = worker_runtime.runtime_type(),
        "Worker runtime initialized"
    );

    let runtime = PrecheckRuntime::builder()
        .store(store)
        .worker_runtime(worker_runtime)
        .config(&config)
        .build()?
        .start()
        .await?;

    info!("Precheck server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Precheck Server shut down");

    Ok(())
}
