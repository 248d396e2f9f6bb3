// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! njd-storage: the `ValidPathInfo` registry and the failure cache, both
//! backed by the same append-only WAL plus an in-memory materialised
//! index rebuilt by replay on startup.

pub mod metadata_store;
pub mod state;
pub mod wal;

pub use metadata_store::{InMemoryMetadataStore, MetadataStore, StorageError, WalMetadataStore};
pub use state::MaterializedState;
pub use wal::{WalRecord, WalWriter};
