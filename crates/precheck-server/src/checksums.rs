// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Content checksums for uploads and run outputs.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Algorithm name used as the key for SHA-256 digests.
pub const SHA256: &str = "sha256";

/// Checksums keyed by algorithm name (e.g. `{"sha256": "<hex>"}`).
pub type Checksums = BTreeMap<String, String>;

/// Checksums of an in-memory buffer.
pub fn checksums_of_bytes(data: &[u8]) -> Checksums {
    let digest = format!("{:x}", Sha256::digest(data));
    Checksums::from([(SHA256.to_string(), digest)])
}

/// Checksums of a file, streamed in chunks.
pub fn checksums_of_file(path: &Path) -> io::Result<Checksums> {
    let mut hasher = Sha256::new();
    let mut file = std::fs::File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    let digest = format!("{:x}", hasher.finalize());
    Ok(Checksums::from([(SHA256.to_string(), digest)]))
}

/// Async wrapper around [`checksums_of_file`] that hashes on the blocking pool.
pub async fn checksums_of_file_async(path: PathBuf) -> io::Result<Checksums> {
    tokio::task::spawn_blocking(move || checksums_of_file(&path))
        .await
        .map_err(io::Error::other)?
}
