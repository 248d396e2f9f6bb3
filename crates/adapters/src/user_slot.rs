// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! User-slot pool (spec §4.A): a bounded set of system user identities
//! reserved for untrusted builders, leased via advisory locks on sibling
//! files so leases survive a crash (the kernel drops the lock).

use nix::fcntl::{flock, FlockArg};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use njd_core::UserSlotLease;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UserSlotError {
    #[error("no build user slot is available")]
    NoSlotAvailable,
    #[error("build-users group is empty or absent")]
    Misconfigured,
    #[error("io error leasing slot: {0}")]
    Io(#[from] std::io::Error),
    #[error("signal error: {0}")]
    Signal(#[from] nix::Error),
}

/// One configured member of the build-users group, resolved ahead of time
/// by whatever reads `/etc/group` (out of scope here, spec §1 treats the
/// group's membership as a collaborator concern); this pool only manages
/// the lease lifecycle over an already-resolved member list.
#[derive(Debug, Clone)]
pub struct SlotCandidate {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
}

pub struct UserSlotPool {
    dir: PathBuf,
    candidates: Vec<SlotCandidate>,
    held: HashMap<u32, File>,
}

impl UserSlotPool {
    pub fn new(state_dir: impl AsRef<Path>, candidates: Vec<SlotCandidate>) -> Self {
        Self { dir: state_dir.as_ref().join("userpool"), candidates, held: HashMap::new() }
    }

    fn lease_path(&self, uid: u32) -> PathBuf {
        self.dir.join(uid.to_string())
    }

    /// Acquire the first candidate whose lease file is not exclusively
    /// locked by another process.
    pub fn acquire(&mut self) -> Result<UserSlotLease, UserSlotError> {
        if self.candidates.is_empty() {
            return Err(UserSlotError::Misconfigured);
        }
        std::fs::create_dir_all(&self.dir)?;
        for candidate in self.candidates.clone() {
            if self.held.contains_key(&candidate.uid) {
                continue;
            }
            let file = OpenOptions::new().create(true).write(true).open(self.lease_path(candidate.uid))?;
            if flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock).is_ok() {
                self.held.insert(candidate.uid, file);
                return Ok(UserSlotLease { user: candidate.user, uid: candidate.uid, gid: candidate.gid });
            }
        }
        Err(UserSlotError::NoSlotAvailable)
    }

    /// Drop the advisory lock and forget the in-process record. Idempotent.
    pub fn release(&mut self, lease: &UserSlotLease) -> Result<(), UserSlotError> {
        if let Some(file) = self.held.remove(&lease.uid) {
            flock(file.as_raw_fd(), FlockArg::Unlock)?;
        }
        Ok(())
    }

    /// Send `SIGTERM` to every process running as `lease`'s uid. Required
    /// before release when a builder may have left background processes.
    ///
    /// This crate has no portable "processes by uid" enumeration without
    /// `/proc`; callers on non-Linux targets should treat this as a no-op
    /// collaborator concern (a setuid helper would perform the real scan).
    pub fn kill_leased_processes(&self, lease: &UserSlotLease) -> Result<(), UserSlotError> {
        #[cfg(target_os = "linux")]
        {
            let proc_dir = std::fs::read_dir("/proc")?;
            for entry in proc_dir.flatten() {
                let Some(pid_str) = entry.file_name().to_str().map(str::to_string) else { continue };
                let Ok(pid) = pid_str.parse::<i32>() else { continue };
                let status_path = entry.path().join("status");
                let Ok(status) = std::fs::read_to_string(&status_path) else { continue };
                let owned = status.lines().find(|l| l.starts_with("Uid:")).map(|l| {
                    l.split_whitespace().nth(1).and_then(|s| s.parse::<u32>().ok()) == Some(lease.uid)
                });
                if owned == Some(true) {
                    let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> SlotCandidate {
        SlotCandidate { user: format!("nixbld{n}"), uid: 30000 + n, gid: 30000 }
    }

    #[test]
    fn acquire_fails_when_no_candidates_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = UserSlotPool::new(dir.path(), vec![]);
        assert!(matches!(pool.acquire(), Err(UserSlotError::Misconfigured)));
    }

    #[test]
    fn two_acquisitions_never_hold_the_same_uid() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = UserSlotPool::new(dir.path(), vec![candidate(1), candidate(2)]);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.uid, b.uid);
        assert!(matches!(pool.acquire(), Err(UserSlotError::NoSlotAvailable)));
    }

    #[test]
    fn release_frees_the_slot_for_reacquisition() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = UserSlotPool::new(dir.path(), vec![candidate(1)]);
        let lease = pool.acquire().unwrap();
        pool.release(&lease).unwrap();
        assert!(pool.acquire().is_ok());
    }
}
