// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for precheck-server.

use std::time::Duration;

use thiserror::Error;

/// Precheck server errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Job store operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Applying schema migrations failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Worker runtime operation failed.
    #[error("Worker error: {0}")]
    Worker(#[from] crate::worker::WorkerError),

    /// Upload was not found.
    #[error("No such upload: {0}")]
    UploadNotFound(String),

    /// Run was not found.
    #[error("No such precheck: {0}")]
    RunNotFound(String),

    /// Upload is past its expiry window.
    #[error("Upload has expired: {0}")]
    UploadExpired(String),

    /// Waiting for a run to finish exceeded the caller's deadline.
    /// The run itself is unaffected.
    #[error("Timed out after {}s waiting for precheck {run_id}", timeout.as_secs())]
    WaitTimeout {
        /// Run being waited on.
        run_id: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error means the requested entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::UploadNotFound(_) | Error::RunNotFound(_))
    }
}

/// Result type using precheck-server Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_timeout_message() {
        let err = Error::WaitTimeout {
            run_id: "abc".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.to_string(), "Timed out after 5s waiting for precheck abc");
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(Error::UploadNotFound("u".into()).is_not_found());
        assert!(Error::RunNotFound("r".into()).is_not_found());
        assert!(!Error::UploadExpired("u".into()).is_not_found());
    }
}
