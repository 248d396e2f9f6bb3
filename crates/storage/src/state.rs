// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Materialized state rebuilt by folding [`crate::wal::WalRecord`]s.

use crate::wal::WalRecord;
use njd_store::{StorePath, ValidPathInfo};
use std::collections::{HashMap, HashSet};

/// The in-memory index the metadata store serves reads from. Every
/// mutation here must be idempotent: `apply` may see the same record
/// twice across a crash/replay boundary (spec §6 "the engine treats a
/// successful return as durable").
#[derive(Debug, Default, Clone)]
pub struct MaterializedState {
    pub valid_paths: HashMap<StorePath, ValidPathInfo>,
    pub failed_paths: HashSet<StorePath>,
    pub temp_roots: HashSet<StorePath>,
}

impl MaterializedState {
    pub fn apply(&mut self, record: &WalRecord) {
        match record {
            WalRecord::RegisterValidPaths { infos } => {
                for info in infos {
                    self.failed_paths.remove(&info.path);
                    self.valid_paths.insert(info.path.clone(), info.clone());
                }
            }
            WalRecord::RegisterFailedPath { path } => {
                self.failed_paths.insert(path.clone());
            }
            WalRecord::ClearFailureCache => {
                self.failed_paths.clear();
            }
            WalRecord::AddTempRoot { path } => {
                self.temp_roots.insert(path.clone());
            }
        }
    }

    pub fn rebuild(records: &[WalRecord]) -> Self {
        let mut state = Self::default();
        for record in records {
            state.apply(record);
        }
        state
    }

    /// The closure invariant (spec §8): every path reachable from a valid
    /// path's reference set is itself valid.
    pub fn closure_is_safe(&self) -> bool {
        self.valid_paths
            .values()
            .all(|info| info.references.iter().all(|r| self.valid_paths.contains_key(r)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use njd_store::Sha256Hash;
    use std::collections::BTreeSet;

    fn path(name: &str) -> StorePath {
        StorePath::from_fingerprint(name, name).unwrap()
    }

    #[test]
    fn registering_valid_clears_failure_record() {
        let mut state = MaterializedState::default();
        let p = path("foo");
        state.apply(&WalRecord::RegisterFailedPath { path: p.clone() });
        assert!(state.failed_paths.contains(&p));

        let info = ValidPathInfo::new(p.clone(), Sha256Hash::of_bytes(b"x"), BTreeSet::new());
        state.apply(&WalRecord::RegisterValidPaths { infos: vec![info] });
        assert!(!state.failed_paths.contains(&p));
        assert!(state.valid_paths.contains_key(&p));
    }

    #[test]
    fn replaying_the_same_record_twice_is_a_no_op() {
        let p = path("foo");
        let record = WalRecord::AddTempRoot { path: p.clone() };
        let mut state = MaterializedState::default();
        state.apply(&record);
        state.apply(&record);
        assert_eq!(state.temp_roots.len(), 1);
    }

    #[test]
    fn closure_safety_detects_a_dangling_reference() {
        let mut state = MaterializedState::default();
        let mut refs = BTreeSet::new();
        refs.insert(path("missing"));
        let info = ValidPathInfo::new(path("foo"), Sha256Hash::of_bytes(b"x"), refs);
        state.valid_paths.insert(info.path.clone(), info);
        assert!(!state.closure_is_safe());
    }
}
