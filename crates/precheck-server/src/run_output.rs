// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Locating a run's primary output artifact.
//!
//! The worker writes its final layout beneath the run directory at
//! `**/KLayout.GenerateID/{top_cell}.gds`. The exact parent directories depend
//! on the pipeline version, so the artifact is found by pattern rather than by
//! a fixed path.

use std::path::{Path, PathBuf};

use glob::Pattern;
use tracing::warn;

use crate::checksums::{Checksums, checksums_of_file_async};

/// Name of the pipeline stage directory holding the final layout.
pub const OUTPUT_STAGE_DIR: &str = "KLayout.GenerateID";

/// Find the first file matching the output pattern for `top_cell` under `run_dir`.
///
/// Returns `None` when the run produced no output (or the directory is gone).
pub fn find_output(run_dir: &Path, top_cell: &str) -> Option<PathBuf> {
    let pattern = format!(
        "{}/**/{}/{}.gds",
        Pattern::escape(&run_dir.to_string_lossy()),
        OUTPUT_STAGE_DIR,
        Pattern::escape(top_cell)
    );

    let paths = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "Invalid output pattern");
            return None;
        }
    };

    for entry in paths {
        match entry {
            Ok(path) if path.is_file() => return Some(path),
            Ok(_) => {}
            Err(e) => {
                // Unreadable subdirectory; keep looking elsewhere
                warn!(error = %e, "Failed to read run directory entry");
            }
        }
    }

    None
}

/// Checksums of the run's output artifact.
///
/// Absence of the artifact or a read failure yields `None`: the run still
/// completes, it just carries no output info.
pub async fn output_checksums(run_dir: &Path, top_cell: &str) -> Option<Checksums> {
    let path = find_output(run_dir, top_cell)?;

    match checksums_of_file_async(path.clone()).await {
        Ok(sums) => Some(sums),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to checksum run output");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksums::{SHA256, checksums_of_bytes};
    use tempfile::TempDir;

    fn write_output(run_dir: &Path, nested: &str, top_cell: &str, data: &[u8]) -> PathBuf {
        let dir = run_dir.join(nested).join(OUTPUT_STAGE_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{top_cell}.gds"));
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_find_output_nested() {
        let dir = TempDir::new().unwrap();
        let expected = write_output(dir.path(), "runs/RUN_2025/final", "chip_top", b"gds");

        assert_eq!(find_output(dir.path(), "chip_top"), Some(expected));
    }

    #[test]
    fn test_find_output_ignores_other_cells() {
        let dir = TempDir::new().unwrap();
        write_output(dir.path(), "final", "other_top", b"gds");

        assert_eq!(find_output(dir.path(), "chip_top"), None);
    }

    #[test]
    fn test_find_output_missing_run_dir() {
        let dir = TempDir::new().unwrap();
        assert_eq!(find_output(&dir.path().join("gone"), "chip_top"), None);
    }

    #[tokio::test]
    async fn test_output_checksums() {
        let dir = TempDir::new().unwrap();
        write_output(dir.path(), "final", "chip_top", b"layout-bytes");

        let sums = output_checksums(dir.path(), "chip_top").await.unwrap();
        assert_eq!(sums, checksums_of_bytes(b"layout-bytes"));
        assert!(sums.contains_key(SHA256));
    }

    #[tokio::test]
    async fn test_output_checksums_absent() {
        let dir = TempDir::new().unwrap();
        assert!(output_checksums(dir.path(), "chip_top").await.is_none());
    }
}
