// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The metadata store contract the engine consumes (spec §6), and two
//! implementations: a WAL-backed one for real use, and an in-memory one
//! for tests (the teacher's `test-support` pattern).

use crate::state::MaterializedState;
use crate::wal::{WalRecord, WalWriter};
use njd_store::{StorePath, ValidPathInfo};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    async fn is_valid_path(&self, path: &StorePath) -> bool;
    async fn query_path_info(&self, path: &StorePath) -> Option<ValidPathInfo>;
    async fn query_deriver(&self, path: &StorePath) -> Option<StorePath>;

    /// Atomic across the whole batch (spec §6 "`registerValidPaths` must
    /// be atomic across the set of infos passed").
    async fn register_valid_paths(&self, infos: Vec<ValidPathInfo>) -> Result<(), StorageError>;

    async fn has_path_failed(&self, path: &StorePath) -> bool;
    async fn register_failed_path(&self, path: &StorePath) -> Result<(), StorageError>;
    async fn clear_failure_cache(&self) -> Result<(), StorageError>;
    async fn add_temp_root(&self, path: &StorePath) -> Result<(), StorageError>;
}

/// WAL + in-memory index, matching the teacher's `MaterializedState`/WAL
/// split. One log backs both the `ValidPathInfo` registry and the failure
/// cache (§4.G "same WAL-oriented storage crate ... as a separate
/// keyspace"), so clearing the failure cache is a write of one record,
/// not a second store.
pub struct WalMetadataStore {
    wal: Mutex<WalWriter>,
    state: Mutex<MaterializedState>,
}

impl WalMetadataStore {
    pub fn open(log_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let log_path: PathBuf = log_path.as_ref().to_path_buf();
        let records = crate::wal::replay(&log_path)?;
        let state = MaterializedState::rebuild(&records);
        let wal = WalWriter::open(&log_path)?;
        Ok(Self { wal: Mutex::new(wal), state: Mutex::new(state) })
    }

    fn apply_and_append(&self, record: WalRecord) -> Result<(), StorageError> {
        self.wal.lock().append(&record)?;
        self.state.lock().apply(&record);
        Ok(())
    }
}

#[async_trait::async_trait]
impl MetadataStore for WalMetadataStore {
    async fn is_valid_path(&self, path: &StorePath) -> bool {
        self.state.lock().valid_paths.contains_key(path)
    }

    async fn query_path_info(&self, path: &StorePath) -> Option<ValidPathInfo> {
        self.state.lock().valid_paths.get(path).cloned()
    }

    async fn query_deriver(&self, path: &StorePath) -> Option<StorePath> {
        self.state.lock().valid_paths.get(path).and_then(|info| info.deriver.clone())
    }

    async fn register_valid_paths(&self, infos: Vec<ValidPathInfo>) -> Result<(), StorageError> {
        self.apply_and_append(WalRecord::RegisterValidPaths { infos })
    }

    async fn has_path_failed(&self, path: &StorePath) -> bool {
        self.state.lock().failed_paths.contains(path)
    }

    async fn register_failed_path(&self, path: &StorePath) -> Result<(), StorageError> {
        self.apply_and_append(WalRecord::RegisterFailedPath { path: path.clone() })
    }

    async fn clear_failure_cache(&self) -> Result<(), StorageError> {
        self.apply_and_append(WalRecord::ClearFailureCache)
    }

    async fn add_temp_root(&self, path: &StorePath) -> Result<(), StorageError> {
        self.apply_and_append(WalRecord::AddTempRoot { path: path.clone() })
    }
}

/// Pure in-memory store for unit/integration tests; no durability.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    state: Mutex<MaterializedState>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn is_valid_path(&self, path: &StorePath) -> bool {
        self.state.lock().valid_paths.contains_key(path)
    }

    async fn query_path_info(&self, path: &StorePath) -> Option<ValidPathInfo> {
        self.state.lock().valid_paths.get(path).cloned()
    }

    async fn query_deriver(&self, path: &StorePath) -> Option<StorePath> {
        self.state.lock().valid_paths.get(path).and_then(|info| info.deriver.clone())
    }

    async fn register_valid_paths(&self, infos: Vec<ValidPathInfo>) -> Result<(), StorageError> {
        self.state.lock().apply(&WalRecord::RegisterValidPaths { infos });
        Ok(())
    }

    async fn has_path_failed(&self, path: &StorePath) -> bool {
        self.state.lock().failed_paths.contains(path)
    }

    async fn register_failed_path(&self, path: &StorePath) -> Result<(), StorageError> {
        self.state.lock().apply(&WalRecord::RegisterFailedPath { path: path.clone() });
        Ok(())
    }

    async fn clear_failure_cache(&self) -> Result<(), StorageError> {
        self.state.lock().apply(&WalRecord::ClearFailureCache);
        Ok(())
    }

    async fn add_temp_root(&self, path: &StorePath) -> Result<(), StorageError> {
        self.state.lock().apply(&WalRecord::AddTempRoot { path: path.clone() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use njd_store::Sha256Hash;
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn wal_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("metadata.wal");
        let target = StorePath::from_fingerprint("x", "foo").unwrap();
        {
            let store = WalMetadataStore::open(&log_path).unwrap();
            let info = ValidPathInfo::new(target.clone(), Sha256Hash::of_bytes(b"x"), BTreeSet::new());
            store.register_valid_paths(vec![info]).await.unwrap();
        }
        let reopened = WalMetadataStore::open(&log_path).unwrap();
        assert!(reopened.is_valid_path(&target).await);
    }

    #[tokio::test]
    async fn in_memory_store_has_no_durability_but_works_within_process() {
        let store = InMemoryMetadataStore::new();
        let target = StorePath::from_fingerprint("x", "foo").unwrap();
        store.register_failed_path(&target).await.unwrap();
        assert!(store.has_path_failed(&target).await);
        store.clear_failure_cache().await.unwrap();
        assert!(!store.has_path_failed(&target).await);
    }
}
