// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Effects: side effects goal state handlers ask the Worker to perform.
//!
//! A state handler never forks, locks, or touches the metadata store
//! directly — it returns a batch of `Effect`s and its next state. A single
//! `njd_adapters::Executor` interprets them and feeds the results back as
//! `Event`s over a channel, so every mutation of goal state still happens
//! on the one task that owns it, even though the effects themselves run
//! concurrently as OS processes and async I/O.

use crate::ids::{ChildId, GoalId};
use njd_store::{StorePath, ValidPathInfo};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Which external program a `SpawnChild` effect launches (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildKind {
    Substituter,
    Builder,
    BuildHook,
    SetuidHelper,
}

impl ChildKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChildKind::Substituter => "substituter",
            ChildKind::Builder => "builder",
            ChildKind::BuildHook => "build-hook",
            ChildKind::SetuidHelper => "setuid-helper",
        }
    }
}

/// A leased build-user identity (spec §4.A).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSlotLease {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
}

/// Everything a sandboxed local build needs to construct its chroot
/// (spec §4.E steps 1-8), carried on `Effect::SpawnChild` rather than
/// looked up again by the executor: the goal already knows its own
/// declared input closure and leased identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub bind_paths: Vec<PathBuf>,
    pub store_dir: PathBuf,
    pub input_closure: BTreeSet<StorePath>,
    pub lease: UserSlotLease,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Effect {
    /// Emit an event into the structured log / event bus.
    Emit { event: crate::event::Event },

    /// Fork a child process, redirecting its stdio per §6, and begin
    /// monitoring its descriptors. `in_build_slot` controls whether
    /// `nrLocalBuilds` is incremented for it (spec §4.C "Counting").
    SpawnChild {
        goal: GoalId,
        kind: ChildKind,
        program: PathBuf,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        cwd: PathBuf,
        in_build_slot: bool,
        /// Present only for a local builder dispatched under
        /// `use_sandbox` (spec §4.E); `None` runs the child directly in
        /// `cwd` the way a substituter fetch always does.
        sandbox: Option<SandboxRequest>,
    },

    /// Send a termination signal to a monitored child (cancellation,
    /// spec §5 "Cancellation & timeouts").
    KillChild { child: ChildId },

    /// Acquire the path-lock set for `paths` as a unit (spec §4.B).
    /// Non-blocking acquisition reports failure instead of waiting.
    AcquireLock { goal: GoalId, paths: Vec<StorePath>, blocking: bool },

    /// Release a previously-acquired lock set. `delete_files` is only
    /// safe once every path in the set is registered valid (spec §4.B
    /// policy).
    ReleaseLock { goal: GoalId, paths: Vec<StorePath>, delete_files: bool },

    /// Lease a build-user identity from the user-slot pool (spec §4.A).
    AcquireUserSlot { goal: GoalId },

    /// Release a previously-leased identity. Idempotent.
    ReleaseUserSlot { lease: UserSlotLease },

    /// Terminate every process running as a leased uid, required before
    /// release when a builder may have left background processes.
    KillLeasedProcesses { lease: UserSlotLease },

    /// Atomically register a batch of paths as valid (spec §4.F step 5,
    /// §6 `registerValidPaths`).
    RegisterValidPaths { infos: Vec<ValidPathInfo> },

    /// Insert a failed output into the failure cache (spec §4.G).
    RegisterFailedPath { path: StorePath },

    /// Pin a path against garbage collection for the engine's lifetime
    /// (spec §5 "GC temp-root registration").
    AddTempRoot { path: StorePath },

    /// Run the build hook handshake for one derivation to completion
    /// (spec §4.E "Build hook protocol") as a background task; the
    /// verdict and, on accept, the remote exit status arrive later as
    /// `Event::HookOutcome` rather than as this call's return value,
    /// since a hook may hold a build open for a long time.
    ConsultBuildHook {
        goal: GoalId,
        program: PathBuf,
        args: Vec<String>,
        scratch_dir: PathBuf,
        inputs: BTreeSet<StorePath>,
        outputs: BTreeSet<StorePath>,
        registration: String,
    },

    /// Ask one substituter whether it has `target` (spec §4.D "tryNext").
    /// A quick bounded round-trip; the result comes back as
    /// `Event::SubstituterQueried` rather than a direct return value, to
    /// keep every goal-state mutation flowing through the one event loop.
    QuerySubstituter { goal: GoalId, program: PathBuf, target: StorePath },
}

impl Effect {
    /// Effect name for log spans.
    pub fn name(&self) -> &'static str {
        match self {
            Effect::Emit { .. } => "emit",
            Effect::SpawnChild { .. } => "spawn_child",
            Effect::KillChild { .. } => "kill_child",
            Effect::AcquireLock { .. } => "acquire_lock",
            Effect::ReleaseLock { .. } => "release_lock",
            Effect::AcquireUserSlot { .. } => "acquire_user_slot",
            Effect::ReleaseUserSlot { .. } => "release_user_slot",
            Effect::KillLeasedProcesses { .. } => "kill_leased_processes",
            Effect::RegisterValidPaths { .. } => "register_valid_paths",
            Effect::RegisterFailedPath { .. } => "register_failed_path",
            Effect::AddTempRoot { .. } => "add_temp_root",
            Effect::ConsultBuildHook { .. } => "consult_build_hook",
            Effect::QuerySubstituter { .. } => "query_substituter",
        }
    }

    /// Key-value pairs for structured logging.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        match self {
            Effect::Emit { event } => vec![("event", event.log_summary())],
            Effect::SpawnChild { goal, kind, program, .. } => vec![
                ("goal", goal.to_string()),
                ("kind", kind.as_str().to_string()),
                ("program", program.display().to_string()),
            ],
            Effect::KillChild { child } => vec![("child", child.to_string())],
            Effect::AcquireLock { goal, paths, blocking } => vec![
                ("goal", goal.to_string()),
                ("paths", paths.len().to_string()),
                ("blocking", blocking.to_string()),
            ],
            Effect::ReleaseLock { goal, paths, .. } => {
                vec![("goal", goal.to_string()), ("paths", paths.len().to_string())]
            }
            Effect::AcquireUserSlot { goal } => vec![("goal", goal.to_string())],
            Effect::ReleaseUserSlot { lease } => vec![("user", lease.user.clone())],
            Effect::KillLeasedProcesses { lease } => vec![("uid", lease.uid.to_string())],
            Effect::RegisterValidPaths { infos } => vec![("count", infos.len().to_string())],
            Effect::RegisterFailedPath { path } => vec![("path", path.to_string())],
            Effect::AddTempRoot { path } => vec![("path", path.to_string())],
            Effect::ConsultBuildHook { goal, program, .. } => {
                vec![("goal", goal.to_string()), ("program", program.display().to_string())]
            }
            Effect::QuerySubstituter { goal, program, target } => vec![
                ("goal", goal.to_string()),
                ("program", program.display().to_string()),
                ("target", target.to_string()),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effect_names_are_stable_identifiers() {
        let effect = Effect::AddTempRoot { path: StorePath::from_fingerprint("x", "foo").unwrap() };
        assert_eq!(effect.name(), "add_temp_root");
    }
}
