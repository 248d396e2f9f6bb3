// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The engine-level error taxonomy (spec §7).
//!
//! Every terminal goal failure is one of these variants. `cacheable`
//! encodes the failure-cache insertion policy from spec §4.E/§4.G: fixed
//! -output derivations and hook-origin failures are never cached, because
//! a fixed-output mismatch is adequately guarded by its hash and a
//! malfunctioning hook says nothing about whether the build itself would
//! succeed.

use njd_store::StorePath;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GoalError {
    /// A resource (path lock, build slot) was contended; recovered locally
    /// by sleeping in a wait set. Never terminal on its own.
    #[error("resource contended: {0}")]
    TransientResource(String),

    /// Every substituter in the candidate list missed or failed.
    #[error("no substituter could deliver {path}")]
    SubstituterMiss { path: StorePath },

    /// The builder produced wrong/missing outputs, bad ownership, a
    /// non-zero exit status, or violated `allowedReferences`.
    #[error("build of {drv} failed: {reason}")]
    BuildFailure { drv: StorePath, reason: String },

    /// The build hook itself malfunctioned (non-100 exit, protocol
    /// violation). Distinct from a remote build failure reported through
    /// the hook (which is still `BuildFailure` with status 100).
    #[error("build hook failed: {0}")]
    HookFailure(String),

    /// A hook-accepted remote build exited with status 100 (spec §4.E,
    /// §8 scenario 5): the remote infrastructure reported the build
    /// itself failed. Kept distinct from `BuildFailure` so this never
    /// gets treated as a deterministic local failure worth caching.
    #[error("remote build of {drv} failed: {reason}")]
    RemoteBuildFailure { drv: StorePath, reason: String },

    /// A waitee of this goal failed.
    #[error("{failed_waitees} dependency goal(s) failed")]
    InputFailure { failed_waitees: u32 },

    /// Missing build-users group, invalid derivation fields, platform
    /// mismatch. Surfaced immediately, never retried.
    #[error("misconfigured: {0}")]
    MisconfigurationFailure(String),

    /// Cooperative external cancellation.
    #[error("interrupted")]
    Interrupt,
}

impl GoalError {
    /// Whether a terminal failure of this kind may be inserted into the
    /// failure cache. `drv_is_fixed_output` must reflect the *derivation*
    /// being built, not just this output, per spec §4.E.
    pub fn cacheable(&self, drv_is_fixed_output: bool) -> bool {
        if drv_is_fixed_output {
            return false;
        }
        matches!(self, GoalError::BuildFailure { .. })
    }

    pub fn log_reason(&self) -> String {
        self.to_string()
    }
}

/// The non-zero exit status of a build hook child (spec §4.E): 100 means
/// the remote build itself failed; anything else is hook-level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookExitStatus(pub i32);

impl HookExitStatus {
    pub const REMOTE_BUILD_FAILED: i32 = 100;

    pub fn is_remote_build_failure(self) -> bool {
        self.0 == Self::REMOTE_BUILD_FAILED
    }
}

impl fmt::Display for HookExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_output_failures_are_never_cacheable() {
        let err = GoalError::BuildFailure { drv: test_path(), reason: "hash mismatch".into() };
        assert!(!err.cacheable(true));
        assert!(err.cacheable(false));
    }

    #[test]
    fn hook_failures_are_never_cacheable() {
        let err = GoalError::HookFailure("protocol violation".into());
        assert!(!err.cacheable(false));
    }

    #[test]
    fn remote_build_failures_are_never_cacheable() {
        let err = GoalError::RemoteBuildFailure { drv: test_path(), reason: "status 100".into() };
        assert!(!err.cacheable(false));
    }

    #[test]
    fn remote_build_failure_status_is_100() {
        assert!(HookExitStatus(100).is_remote_build_failure());
        assert!(!HookExitStatus(1).is_remote_build_failure());
    }

    fn test_path() -> StorePath {
        StorePath::from_fingerprint("x", "foo").unwrap()
    }
}
