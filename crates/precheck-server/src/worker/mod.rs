// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker module - execution substrates for precheck runs.

pub mod docker;
pub mod mock;
mod traits;

pub use docker::{DockerRuntime, DockerRuntimeConfig};
pub use mock::MockWorkerRuntime;
pub use traits::*;
