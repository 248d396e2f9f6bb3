// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The derivation goal (spec §4.E): realise every input, then either
//! delegate to a build hook or build locally under a sandbox, verifying
//! and registering the outputs before reporting success.

use crate::error::{GoalError, HookExitStatus};
use njd_core::goal::{ExitCode, GoalBehavior, GoalRecord};
use njd_core::{ChildId, ChildKind, Effect, Event, GoalId, HookOutcome, SandboxRequest, UserSlotLease};
use njd_store::{Derivation, StorePath, ValidPathInfo};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrvState {
    Init,
    AwaitingInputGoals,
    AcquiringLock,
    AcquiringUserSlot,
    TryToBuild,
    AwaitingHook,
    /// The hook asked to hold the decision open (spec §4.E "postpone");
    /// locks and the user slot are released while this goal waits for a
    /// poll tick rather than spending either on a build that isn't
    /// running yet.
    HookPostponed,
    Building,
    AwaitingVerification,
    Finished,
}

/// Where a `.drv`'s build actually ran, once decided (spec §4.E "classify
/// then dispatch").
enum Dispatch {
    LocalSandbox,
    Hook,
}

/// What a sandboxed local build needs from the engine config, resolved
/// once per goal at dispatch time rather than read from `EngineConfig`
/// again inside the state machine (spec §4.E steps 1-8).
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub bind_paths: Vec<PathBuf>,
    pub store_dir: PathBuf,
    pub input_closure: BTreeSet<StorePath>,
}

pub struct DerivationGoal {
    pub record: GoalRecord,
    pub drv_path: StorePath,
    pub state: DrvState,
    pub derivation: Option<Derivation>,
    pub invalid_outputs: BTreeSet<StorePath>,
    input_goals: BTreeSet<GoalId>,
    pub is_fixed_output: bool,
    lease: Option<UserSlotLease>,
    current_child: Option<ChildId>,
    locked: bool,
    dispatch: Option<Dispatch>,
    scratch_dir: PathBuf,
    failure: Option<GoalError>,
    hook_program: Option<PathBuf>,
    /// Once the hook has declined this derivation outright, never consult
    /// it again even though `hook_program` itself is still set (spec
    /// §4.E: a decline is final, unlike a postpone).
    hook_declined: bool,
    sandbox: Option<SandboxSettings>,
}

impl DerivationGoal {
    pub fn new(drv_path: StorePath) -> Self {
        let scratch_dir = std::env::temp_dir().join(format!("njd-build-{}", drv_path.hash_part()));
        Self {
            record: GoalRecord::new(format!("build {drv_path}")),
            drv_path,
            state: DrvState::Init,
            derivation: None,
            invalid_outputs: BTreeSet::new(),
            input_goals: BTreeSet::new(),
            is_fixed_output: false,
            lease: None,
            current_child: None,
            locked: false,
            dispatch: None,
            scratch_dir,
            failure: None,
            hook_program: None,
            hook_declined: false,
            sandbox: None,
        }
    }

    fn fail(&mut self, error: GoalError) -> Vec<Effect> {
        self.state = DrvState::Finished;
        self.record.exit = ExitCode::Failed;
        let reason = error.log_reason();
        self.failure = Some(error);
        vec![Effect::Emit {
            event: Event::BuildFailed {
                goal: self.record.id.clone(),
                drv: self.drv_path.clone(),
                primary_output: self.drv_path.clone(),
                status: None,
                reason,
                cached: false,
            },
        }]
    }

    pub fn failure(&self) -> Option<&GoalError> {
        self.failure.as_ref()
    }

    /// The `.drv` could not be loaded or some other precondition the
    /// worker checks before `handle_derivation_ready` failed.
    pub fn handle_load_failure(&mut self, reason: String) -> Vec<Effect> {
        self.fail(GoalError::MisconfigurationFailure(reason))
    }

    /// Seed the goal as already-failed without running any state at all
    /// (spec §4.G "the same outcome ... served directly from cache").
    pub fn mark_cached_failure(&mut self, reason: String) -> Vec<Effect> {
        self.state = DrvState::Finished;
        self.record.exit = ExitCode::Failed;
        self.failure = Some(GoalError::BuildFailure { drv: self.drv_path.clone(), reason: reason.clone() });
        vec![Effect::Emit {
            event: Event::BuildFailed {
                goal: self.record.id.clone(),
                drv: self.drv_path.clone(),
                primary_output: self.drv_path.clone(),
                status: None,
                reason,
                cached: true,
            },
        }]
    }

    /// Drive the state machine. Most states here only ask the worker for
    /// the next piece of information (load the `.drv`, check output
    /// validity, realise inputs); the worker feeds the answer back
    /// through the matching `handle_*` method and calls `work` again.
    pub fn work(&mut self) -> Vec<Effect> {
        match self.state {
            DrvState::Init => vec![Effect::AddTempRoot { path: self.drv_path.clone() }],
            DrvState::AwaitingInputGoals
            | DrvState::AcquiringLock
            | DrvState::AcquiringUserSlot
            | DrvState::AwaitingHook
            | DrvState::HookPostponed
            | DrvState::Building
            | DrvState::AwaitingVerification => Vec::new(),
            DrvState::TryToBuild => self.dispatch_build(),
            DrvState::Finished => Vec::new(),
        }
    }

    /// The `.drv` file has been loaded and every output's validity has
    /// been checked by the worker; decide whether to wait on inputs or
    /// jump straight to building.
    pub fn handle_derivation_ready(
        &mut self,
        derivation: Derivation,
        invalid_outputs: BTreeSet<StorePath>,
        input_goals: BTreeSet<GoalId>,
        hook_program: Option<PathBuf>,
        sandbox: Option<SandboxSettings>,
    ) -> Vec<Effect> {
        self.is_fixed_output = derivation.is_fixed_output();
        self.invalid_outputs = invalid_outputs;
        self.derivation = Some(derivation);
        self.hook_program = hook_program;
        self.sandbox = sandbox;

        if self.invalid_outputs.is_empty() {
            self.state = DrvState::Finished;
            self.record.exit = ExitCode::Success;
            return Vec::new();
        }

        self.input_goals = input_goals;
        if self.input_goals.is_empty() {
            self.state = DrvState::AcquiringLock;
            return vec![self.lock_effect(false)];
        }
        self.state = DrvState::AwaitingInputGoals;
        Vec::new()
    }

    fn lock_effect(&self, blocking: bool) -> Effect {
        Effect::AcquireLock {
            goal: self.record.id.clone(),
            paths: self.invalid_outputs.iter().cloned().collect(),
            blocking,
        }
    }

    /// All waitees (input derivations/sources) have reported in.
    pub fn handle_inputs_realised(&mut self, failed: u32) -> Vec<Effect> {
        if self.state != DrvState::AwaitingInputGoals {
            return Vec::new();
        }
        if failed > 0 {
            return self.fail(GoalError::InputFailure { failed_waitees: failed });
        }
        self.state = DrvState::AcquiringLock;
        vec![self.lock_effect(false)]
    }

    pub fn handle_lock_acquired(&mut self) -> Vec<Effect> {
        if self.state != DrvState::AcquiringLock {
            return Vec::new();
        }
        self.locked = true;
        self.state = DrvState::AcquiringUserSlot;
        vec![Effect::AcquireUserSlot { goal: self.record.id.clone() }]
    }

    pub fn handle_lock_contended(&mut self) -> Vec<Effect> {
        if self.state != DrvState::AcquiringLock {
            return Vec::new();
        }
        vec![self.lock_effect(false)]
    }

    /// Retry leasing a build-user identity after the pool reported none
    /// free (spec §4.A); a plain poll-retry, mirroring `handle_lock_contended`.
    pub fn handle_user_slot_contended(&mut self) -> Vec<Effect> {
        if self.state != DrvState::AcquiringUserSlot {
            return Vec::new();
        }
        vec![Effect::AcquireUserSlot { goal: self.record.id.clone() }]
    }

    pub fn handle_user_slot_acquired(&mut self, lease: UserSlotLease) -> Vec<Effect> {
        if self.state != DrvState::AcquiringUserSlot {
            return Vec::new();
        }
        self.lease = Some(lease);
        self.state = DrvState::TryToBuild;
        self.work()
    }

    /// Whether the next `dispatch_build` would claim a local build slot
    /// (spec §4.C "Counting" / §4.A budget): true once the hook has
    /// already declined this derivation, or there never was a hook to
    /// consult in the first place.
    pub fn needs_build_slot(&self) -> bool {
        self.hook_declined || self.hook_program.is_none()
    }

    fn dispatch_build(&mut self) -> Vec<Effect> {
        let Some(derivation) = self.derivation.clone() else {
            return self.fail(GoalError::MisconfigurationFailure("no derivation loaded".into()));
        };
        let Some(lease) = self.lease.clone() else {
            return self.fail(GoalError::MisconfigurationFailure("no user slot leased".into()));
        };

        if !self.hook_declined {
            if let Some(hook) = self.hook_program.clone() {
                self.dispatch = Some(Dispatch::Hook);
                self.state = DrvState::AwaitingHook;
                let inputs: BTreeSet<StorePath> = derivation
                    .input_sources
                    .iter()
                    .cloned()
                    .chain(derivation.input_derivations.keys().cloned())
                    .collect();
                return vec![Effect::ConsultBuildHook {
                    goal: self.record.id.clone(),
                    program: hook,
                    args: Vec::new(),
                    scratch_dir: self.scratch_dir.clone(),
                    inputs,
                    outputs: self.invalid_outputs.clone(),
                    registration: self.drv_path.to_string(),
                }];
            }
        }

        self.dispatch = Some(Dispatch::LocalSandbox);
        self.state = DrvState::Building;
        let sandbox = self.sandbox.clone().map(|s| SandboxRequest {
            bind_paths: s.bind_paths,
            store_dir: s.store_dir,
            input_closure: s.input_closure,
            lease: lease.clone(),
        });
        vec![
            Effect::Emit {
                event: Event::BuildStarted {
                    goal: self.record.id.clone(),
                    drv: self.drv_path.clone(),
                    primary_output: self.invalid_outputs.iter().next().cloned().unwrap_or_else(|| self.drv_path.clone()),
                },
            },
            Effect::SpawnChild {
                goal: self.record.id.clone(),
                kind: ChildKind::Builder,
                program: derivation.builder.clone(),
                args: derivation.args.clone(),
                env: derivation.env.clone(),
                cwd: self.scratch_dir.clone(),
                in_build_slot: true,
                sandbox,
            },
        ]
    }

    pub fn handle_hook_outcome(&mut self, outcome: HookOutcome) -> Vec<Effect> {
        if self.state != DrvState::AwaitingHook {
            return Vec::new();
        }
        match outcome {
            HookOutcome::Declined => {
                self.dispatch = None;
                self.hook_declined = true;
                self.state = DrvState::TryToBuild;
                self.work()
            }
            HookOutcome::Postponed => {
                self.dispatch = None;
                self.state = DrvState::HookPostponed;
                self.release_resources()
            }
            HookOutcome::Failed { reason } => self.fail(GoalError::HookFailure(reason)),
            HookOutcome::Accepted { status } => self.finish_build(status, true),
        }
    }

    /// Retry the hook handshake once the poll timer wakes this goal back
    /// up from `HookPostponed` (spec §4.E "postpone"): re-acquire the lock
    /// and user slot from scratch, exactly as a fresh `.drv` would.
    pub fn handle_postpone_elapsed(&mut self) -> Vec<Effect> {
        if self.state != DrvState::HookPostponed {
            return Vec::new();
        }
        self.state = DrvState::AcquiringLock;
        vec![self.lock_effect(false)]
    }

    fn release_resources(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(lease) = self.lease.take() {
            effects.push(Effect::ReleaseUserSlot { lease });
        }
        if self.locked {
            self.locked = false;
            effects.push(Effect::ReleaseLock {
                goal: self.record.id.clone(),
                paths: self.invalid_outputs.iter().cloned().collect(),
                delete_files: false,
            });
        }
        effects
    }

    pub fn handle_child_spawned(&mut self, child: ChildId) {
        self.current_child = Some(child);
    }

    pub fn handle_child_exited(&mut self, status: Option<i32>) -> Vec<Effect> {
        self.current_child = None;
        if self.state != DrvState::Building {
            return Vec::new();
        }
        self.finish_build(status, false)
    }

    /// `remote` distinguishes a hook-accepted build from one we forked
    /// ourselves: only a remote build's exit status 100 gets the
    /// dedicated, non-cacheable `RemoteBuildFailure` treatment (spec
    /// §4.E, §8 scenario 5); a local builder exiting 100 is an ordinary
    /// `BuildFailure`.
    fn finish_build(&mut self, status: Option<i32>, remote: bool) -> Vec<Effect> {
        if status != Some(0) {
            if remote && status.map(HookExitStatus).is_some_and(HookExitStatus::is_remote_build_failure) {
                return self.fail(GoalError::RemoteBuildFailure {
                    drv: self.drv_path.clone(),
                    reason: format!("remote build exited with status {status:?}"),
                });
            }
            let origin = if remote { "hook-accepted build" } else { "builder" };
            return self.fail(GoalError::BuildFailure {
                drv: self.drv_path.clone(),
                reason: format!("{origin} exited with status {status:?}"),
            });
        }
        self.state = DrvState::AwaitingVerification;
        Vec::new()
    }

    /// The worker has run the content verifier against every output
    /// (spec §4.F) and hands back either a batch to register or the
    /// failure it hit.
    pub fn handle_build_verified(&mut self, result: Result<Vec<ValidPathInfo>, GoalError>) -> Vec<Effect> {
        if self.state != DrvState::AwaitingVerification {
            return Vec::new();
        }
        match result {
            Err(e) => self.fail(e),
            Ok(infos) => {
                self.state = DrvState::Finished;
                self.record.exit = ExitCode::Success;
                let mut effects = vec![Effect::RegisterValidPaths { infos }];
                if let Some(lease) = self.lease.take() {
                    effects.push(Effect::ReleaseLock {
                        goal: self.record.id.clone(),
                        paths: self.invalid_outputs.iter().cloned().collect(),
                        delete_files: false,
                    });
                    effects.push(Effect::ReleaseUserSlot { lease });
                }
                effects.push(Effect::Emit {
                    event: Event::BuildSucceeded {
                        goal: self.record.id.clone(),
                        drv: self.drv_path.clone(),
                        primary_output: self
                            .invalid_outputs
                            .iter()
                            .next()
                            .cloned()
                            .unwrap_or_else(|| self.drv_path.clone()),
                    },
                });
                effects
            }
        }
    }

    pub fn output_path(&self, name: &str) -> Option<StorePath> {
        self.derivation.as_ref()?.output_path(&self.drv_path, name)
    }

    pub fn input_goals(&self) -> &BTreeSet<GoalId> {
        &self.input_goals
    }
}

impl GoalBehavior for DerivationGoal {
    fn work(&mut self) -> Vec<Effect> {
        DerivationGoal::work(self)
    }

    fn cancel(&mut self) -> Vec<Effect> {
        self.state = DrvState::Finished;
        self.record.exit = ExitCode::Failed;
        let mut effects = Vec::new();
        if let Some(child) = self.current_child.take() {
            effects.push(Effect::KillChild { child });
        }
        if let Some(lease) = self.lease.take() {
            effects.push(Effect::KillLeasedProcesses { lease: lease.clone() });
            effects.push(Effect::ReleaseUserSlot { lease });
        }
        if self.locked {
            effects.push(Effect::ReleaseLock {
                goal: self.record.id.clone(),
                paths: self.invalid_outputs.iter().cloned().collect(),
                delete_files: false,
            });
        }
        effects
    }

    fn handle_child_output(&mut self, _child: ChildId, _bytes: usize) -> Vec<Effect> {
        Vec::new()
    }

    fn handle_child_eof(&mut self, _child: ChildId) -> Vec<Effect> {
        Vec::new()
    }

    fn record(&self) -> &GoalRecord {
        &self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use njd_store::DerivationOutput;

    fn path(name: &str) -> StorePath {
        StorePath::from_fingerprint(name, name).unwrap()
    }

    fn sample_drv() -> Derivation {
        let mut outputs = BTreeMap::new();
        outputs.insert("out".to_string(), DerivationOutput::InputAddressed);
        Derivation {
            name: "hello".into(),
            outputs,
            input_sources: BTreeSet::new(),
            input_derivations: BTreeMap::new(),
            builder: "/bin/sh".into(),
            args: vec![],
            env: BTreeMap::new(),
            platform: "x86_64-linux".into(),
            impure_env_vars: vec![],
            allowed_references: None,
        }
    }

    #[test]
    fn all_outputs_already_valid_finishes_immediately() {
        let mut goal = DerivationGoal::new(path("hello.drv"));
        let effects = goal.handle_derivation_ready(sample_drv(), BTreeSet::new(), BTreeSet::new(), None, None);
        assert!(effects.is_empty());
        assert_eq!(goal.state, DrvState::Finished);
        assert_eq!(goal.record.exit, ExitCode::Success);
    }

    #[test]
    fn an_invalid_output_with_no_inputs_acquires_a_lock_right_away() {
        let mut goal = DerivationGoal::new(path("hello.drv"));
        let effects =
            goal.handle_derivation_ready(sample_drv(), BTreeSet::from([path("hello-out")]), BTreeSet::new(), None, None);
        assert!(matches!(effects[0], Effect::AcquireLock { .. }));
        assert_eq!(goal.state, DrvState::AcquiringLock);
    }

    #[test]
    fn a_failed_input_goal_fails_the_build_without_locking() {
        let mut goal = DerivationGoal::new(path("hello.drv"));
        goal.handle_derivation_ready(
            sample_drv(),
            BTreeSet::from([path("hello-out")]),
            BTreeSet::from([GoalId::new()]),
            None,
            None,
        );
        let effects = goal.handle_inputs_realised(1);
        assert_eq!(goal.state, DrvState::Finished);
        assert!(matches!(effects[0], Effect::Emit { event: Event::BuildFailed { .. } }));
    }

    #[test]
    fn a_nonzero_exit_fails_the_build() {
        let mut goal = DerivationGoal::new(path("hello.drv"));
        goal.handle_derivation_ready(sample_drv(), BTreeSet::from([path("hello-out")]), BTreeSet::new(), None, None);
        goal.handle_lock_acquired();
        goal.handle_user_slot_acquired(UserSlotLease { user: "njdbuild1".into(), uid: 30001, gid: 30000 });
        let effects = goal.handle_child_exited(Some(1));
        assert!(effects.is_empty());
        let effects = goal.handle_build_verified(Err(GoalError::BuildFailure {
            drv: path("hello.drv"),
            reason: "x".into(),
        }));
        assert_eq!(goal.state, DrvState::Finished);
        assert!(matches!(effects[0], Effect::Emit { event: Event::BuildFailed { .. } }));
    }

    #[test]
    fn a_verified_build_registers_and_releases_its_resources() {
        let mut goal = DerivationGoal::new(path("hello.drv"));
        goal.handle_derivation_ready(sample_drv(), BTreeSet::from([path("hello-out")]), BTreeSet::new(), None, None);
        goal.handle_lock_acquired();
        goal.handle_user_slot_acquired(UserSlotLease { user: "njdbuild1".into(), uid: 30001, gid: 30000 });
        goal.handle_child_exited(Some(0));
        let info = ValidPathInfo::new(
            path("hello-out"),
            njd_store::Sha256Hash::of_bytes(b"x"),
            BTreeSet::new(),
        );
        let effects = goal.handle_build_verified(Ok(vec![info]));
        assert!(effects.iter().any(|e| matches!(e, Effect::RegisterValidPaths { .. })));
        assert!(effects.iter().any(|e| matches!(e, Effect::ReleaseUserSlot { .. })));
        assert_eq!(goal.record.exit, ExitCode::Success);
    }

    #[test]
    fn a_postponed_hook_releases_its_lock_and_slot_instead_of_building_locally() {
        let mut goal = DerivationGoal::new(path("hello.drv"));
        goal.handle_derivation_ready(
            sample_drv(),
            BTreeSet::from([path("hello-out")]),
            BTreeSet::new(),
            Some(PathBuf::from("/bin/hook")),
            None,
        );
        goal.handle_lock_acquired();
        goal.handle_user_slot_acquired(UserSlotLease { user: "njdbuild1".into(), uid: 30001, gid: 30000 });
        let effects = goal.handle_hook_outcome(HookOutcome::Postponed);
        assert_eq!(goal.state, DrvState::HookPostponed);
        assert!(effects.iter().any(|e| matches!(e, Effect::ReleaseUserSlot { .. })));
        assert!(effects.iter().any(|e| matches!(e, Effect::ReleaseLock { .. })));
        assert!(!goal.needs_build_slot());

        let retry = goal.handle_postpone_elapsed();
        assert_eq!(goal.state, DrvState::AcquiringLock);
        assert!(matches!(retry[0], Effect::AcquireLock { .. }));
    }

    #[test]
    fn a_declined_hook_falls_back_to_a_local_build_slot() {
        let mut goal = DerivationGoal::new(path("hello.drv"));
        goal.handle_derivation_ready(
            sample_drv(),
            BTreeSet::from([path("hello-out")]),
            BTreeSet::new(),
            Some(PathBuf::from("/bin/hook")),
            None,
        );
        goal.handle_lock_acquired();
        goal.handle_user_slot_acquired(UserSlotLease { user: "njdbuild1".into(), uid: 30001, gid: 30000 });
        assert!(!goal.needs_build_slot());
        let effects = goal.handle_hook_outcome(HookOutcome::Declined);
        assert!(goal.needs_build_slot());
        assert_eq!(goal.state, DrvState::Building);
        assert!(effects.iter().any(|e| matches!(e, Effect::SpawnChild { .. })));
    }

    #[test]
    fn remote_build_failure_status_maps_to_the_dedicated_error() {
        let mut goal = DerivationGoal::new(path("hello.drv"));
        goal.handle_derivation_ready(
            sample_drv(),
            BTreeSet::from([path("hello-out")]),
            BTreeSet::new(),
            Some(PathBuf::from("/bin/hook")),
            None,
        );
        goal.handle_lock_acquired();
        goal.handle_user_slot_acquired(UserSlotLease { user: "njdbuild1".into(), uid: 30001, gid: 30000 });
        goal.handle_hook_outcome(HookOutcome::Accepted { status: Some(100) });
        assert_eq!(goal.state, DrvState::Finished);
        assert!(matches!(goal.failure(), Some(GoalError::RemoteBuildFailure { .. })));
    }
}
