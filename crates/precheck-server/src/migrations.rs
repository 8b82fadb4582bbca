// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for precheck-server.
//!
//! The job store schema (uploads and runs) lives in `migrations/sqlite` and is
//! embedded at compile time.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use precheck_server::migrations;
//!
//! let pool = SqlitePool::connect("sqlite:data/precheck.db?mode=rwc").await?;
//! migrations::run(&pool).await?;
//! ```

use sqlx::SqlitePool;
use sqlx::migrate::{MigrateError, Migrator};

/// Embedded SQLite migrator.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run all pending migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run(pool: &SqlitePool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}
