// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Path-lock manager (spec §4.B): exclusive advisory locks on a *set* of
//! store paths, acquired as a unit via sibling `<path>.lock` files.

use nix::fcntl::{flock, FlockArg};
use njd_core::GoalId;
use njd_store::StorePath;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathLockError {
    #[error("path {0} is locked by another process")]
    WouldBlock(StorePath),
    /// Another goal in this very process already holds the lock (spec
    /// §4.B "ownedByMe" is false for it): an OS-level `flock` would
    /// never contend here, so this is detected up front instead.
    #[error("path {0} is held by another goal in this process")]
    HeldByAnotherGoal(StorePath),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

struct Held {
    owner: GoalId,
    file: File,
}

/// Tracks every lock set this process currently holds, keyed by the
/// target path's lock-file path.
pub struct PathLockManager {
    store_dir: PathBuf,
    held: HashMap<PathBuf, Held>,
}

impl PathLockManager {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self { store_dir: store_dir.into(), held: HashMap::new() }
    }

    fn lock_file_path(&self, path: &StorePath) -> PathBuf {
        self.store_dir.join(format!("{path}.lock"))
    }

    /// `ownedByMe` — true if this process (any goal) already holds the
    /// lock for `path`, used by goals to avoid self-deadlock.
    pub fn owned_by_me(&self, path: &StorePath) -> bool {
        self.held.contains_key(&self.lock_file_path(path))
    }

    /// Acquire locks for every path in `paths`, in sorted order to avoid
    /// cross-process deadlock. In non-blocking mode, any single failure
    /// releases everything already acquired in this call before
    /// returning.
    pub fn lock(
        &mut self,
        owner: GoalId,
        paths: &[StorePath],
        blocking: bool,
    ) -> Result<(), PathLockError> {
        let mut sorted: Vec<&StorePath> = paths.iter().collect();
        sorted.sort_by(|a, b| a.as_str().cmp(b.as_str()));

        let mut acquired = Vec::new();
        for path in sorted {
            let lock_path = self.lock_file_path(path);
            if let Some(held) = self.held.get(&lock_path) {
                if held.owner == owner {
                    continue;
                }
                for lock_path in acquired {
                    self.release_path(&lock_path);
                }
                return Err(PathLockError::HeldByAnotherGoal(path.clone()));
            }
            let file = OpenOptions::new().create(true).write(true).open(&lock_path)?;
            let arg = if blocking { FlockArg::LockExclusive } else { FlockArg::LockExclusiveNonblock };
            if flock(file.as_raw_fd(), arg).is_err() {
                for lock_path in acquired {
                    self.release_path(&lock_path);
                }
                return Err(PathLockError::WouldBlock(path.clone()));
            }
            self.held.insert(lock_path.clone(), Held { owner: owner.clone(), file });
            acquired.push(lock_path);
        }
        Ok(())
    }

    fn release_path(&mut self, lock_path: &Path) {
        if let Some(held) = self.held.remove(lock_path) {
            let _ = flock(held.file.as_raw_fd(), FlockArg::Unlock);
        }
    }

    /// Release every lock this call previously acquired for `paths`.
    /// `delete_files` must only be set once the protected paths are
    /// registered valid (spec §4.B policy).
    pub fn unlock(&mut self, paths: &[StorePath], delete_files: bool) {
        for path in paths {
            let lock_path = self.lock_file_path(path);
            self.release_path(&lock_path);
            if delete_files {
                let _ = std::fs::remove_file(&lock_path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(name: &str) -> StorePath {
        StorePath::from_fingerprint(name, name).unwrap()
    }

    #[test]
    fn a_single_goal_can_reacquire_its_own_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = PathLockManager::new(dir.path());
        let goal = GoalId::new();
        let p = path("foo");
        mgr.lock(goal.clone(), &[p.clone()], false).unwrap();
        assert!(mgr.owned_by_me(&p));
        mgr.lock(goal, &[p.clone()], false).unwrap();
    }

    #[test]
    fn a_different_goal_is_refused_not_silently_granted() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = PathLockManager::new(dir.path());
        let first = GoalId::new();
        let second = GoalId::new();
        let p = path("foo");
        mgr.lock(first, &[p.clone()], false).unwrap();
        let err = mgr.lock(second, &[p.clone()], false).unwrap_err();
        assert!(matches!(err, PathLockError::HeldByAnotherGoal(_)));
    }

    #[test]
    fn unlock_then_delete_removes_the_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = PathLockManager::new(dir.path());
        let goal = GoalId::new();
        let p = path("foo");
        mgr.lock(goal, &[p.clone()], false).unwrap();
        mgr.unlock(&[p.clone()], true);
        assert!(!mgr.owned_by_me(&p));
        assert!(!dir.path().join(format!("{p}.lock")).exists());
    }
}
