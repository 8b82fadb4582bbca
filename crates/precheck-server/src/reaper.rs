// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker deleting expired uploads.
//!
//! Upload files live in `{DATA_DIR}/uploads/{upload_id}/`. An upload is reaped
//! once its expiry time has passed, unless a run references it: runs keep their
//! own copy of the input, but the upload remains their provenance record.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::store::{JobStore, UploadRef};

/// Configuration for the expiry reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Directory holding one subdirectory per upload.
    pub uploads_dir: PathBuf,
    /// How often to look for expired uploads.
    pub poll_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            uploads_dir: PathBuf::from("./data/uploads"),
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Background worker that removes expired, unreferenced uploads.
pub struct ExpiryReaper {
    store: Arc<dyn JobStore>,
    config: ReaperConfig,
    shutdown: Arc<Notify>,
}

impl ExpiryReaper {
    /// Create a new expiry reaper.
    pub fn new(store: Arc<dyn JobStore>, config: ReaperConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reaper loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            uploads_dir = %self.config.uploads_dir.display(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Expiry reaper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Expiry reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.reap_once().await {
                        error!(error = %e, "Failed to reap expired uploads");
                    }
                }
            }
        }

        info!("Expiry reaper stopped");
    }

    /// Delete every expired, unreferenced upload once.
    ///
    /// Returns the ids that were removed. A failure removing one upload is
    /// logged and does not stop the others.
    pub async fn reap_once(&self) -> Result<Vec<String>> {
        let expired = self.store.get_expired_uploads().await?;
        if expired.is_empty() {
            debug!("No expired uploads");
            return Ok(Vec::new());
        }

        let mut removed = Vec::new();
        for upload in &expired {
            match self.remove_upload(upload).await {
                Ok(true) => removed.push(upload.id.clone()),
                Ok(false) => {}
                Err(e) => {
                    error!(upload_id = %upload.id, error = %e, "Failed to remove expired upload");
                    // Continue with the rest
                }
            }
        }

        info!(
            removed = removed.len(),
            expired = expired.len(),
            "Reaped expired uploads"
        );

        Ok(removed)
    }

    /// Remove an upload's record, then its files.
    ///
    /// The record goes first and only while no run references it, so a run
    /// created after the expiry scan keeps its provenance.
    async fn remove_upload(&self, upload: &UploadRef) -> Result<bool> {
        let Some(dir) = upload_dir(&self.config.uploads_dir, &upload.id) else {
            warn!(upload_id = %upload.id, "Refusing to remove upload with unsafe id");
            return Ok(false);
        };

        if !self.store.delete_expired_upload(&upload.id).await? {
            debug!(upload_id = %upload.id, "Upload claimed or already gone, skipping");
            return Ok(false);
        }

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(upload_id = %upload.id, path = %dir.display(), "Removed upload files"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                // Record is gone; the files are orphaned until removed by hand
                warn!(
                    upload_id = %upload.id,
                    path = %dir.display(),
                    error = %e,
                    "Failed to remove upload files"
                );
            }
        }

        Ok(true)
    }
}

/// Storage directory of an upload, if `id` is a single plain path component.
pub fn upload_dir(uploads_dir: &Path, id: &str) -> Option<PathBuf> {
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(uploads_dir.join(id)),
        _ => None,
    }
}
