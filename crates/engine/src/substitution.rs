// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The substitution goal (spec §4.D): fetch a store path from a
//! substituter instead of building it, verifying the closure and the
//! content hash before registering it valid.

use njd_core::goal::{ExitCode, GoalBehavior, GoalRecord};
use njd_core::{ChildId, ChildKind, Effect, Event, GoalId};
use njd_store::{StorePath, SubstitutablePathInfo, ValidPathInfo};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstState {
    Init,
    TryNext,
    AwaitingQuery,
    /// A substituter advertised this path; waiting on its `references` to
    /// themselves become valid before the fetch runs (spec §4.D closure
    /// invariant).
    AwaitingReferences,
    TryToRun,
    Building,
    AwaitingVerification,
    Finished,
}

/// One candidate substituter program, tried in the order the engine was
/// configured with them (spec §4.D "tryNext" iterates the configured
/// list).
pub struct SubstitutionGoal {
    pub record: GoalRecord,
    pub target: StorePath,
    pub state: SubstState,
    candidates: VecDeque<PathBuf>,
    current_program: Option<PathBuf>,
    current_info: Option<SubstitutablePathInfo>,
    current_child: Option<ChildId>,
    temp_root_registered: bool,
    failed_attempts: Vec<String>,
    reference_goals: BTreeSet<GoalId>,
}

impl SubstitutionGoal {
    pub fn new(target: StorePath) -> Self {
        Self {
            record: GoalRecord::new(format!("substitute {target}")),
            target,
            state: SubstState::Init,
            candidates: VecDeque::new(),
            current_program: None,
            current_info: None,
            current_child: None,
            temp_root_registered: false,
            failed_attempts: Vec::new(),
            reference_goals: BTreeSet::new(),
        }
    }

    pub fn configure(&mut self, substituters: &[PathBuf]) {
        self.candidates = substituters.iter().cloned().collect();
    }

    /// The target was already valid before any substituter was consulted
    /// (spec §4.D: substitution is a no-op when the path is already
    /// there).
    pub fn mark_already_valid(&mut self) -> Vec<Effect> {
        self.state = SubstState::Finished;
        self.record.exit = ExitCode::Success;
        Vec::new()
    }

    fn fail(&mut self, reason: String) -> Vec<Effect> {
        self.state = SubstState::Finished;
        self.record.exit = ExitCode::Failed;
        vec![Effect::Emit {
            event: Event::SubstituterFailed {
                goal: self.record.id.clone(),
                path: self.target.clone(),
                substituter: self.failed_attempts.join(", "),
                reason,
            },
        }]
    }

    /// Drive the state machine forward one step (spec §4.D). Called by
    /// the worker after construction, and again whenever an awaited event
    /// resolves this goal's current suspension.
    pub fn work(&mut self) -> Vec<Effect> {
        match self.state {
            SubstState::Init => {
                let mut effects = Vec::new();
                if !self.temp_root_registered {
                    effects.push(Effect::AddTempRoot { path: self.target.clone() });
                    self.temp_root_registered = true;
                }
                self.state = SubstState::TryNext;
                effects.extend(self.work());
                effects
            }
            SubstState::TryNext => {
                let Some(program) = self.candidates.pop_front() else {
                    return self.fail("no substituter has this path".to_string());
                };
                self.current_program = Some(program.clone());
                self.state = SubstState::AwaitingQuery;
                vec![Effect::QuerySubstituter {
                    goal: self.record.id.clone(),
                    program,
                    target: self.target.clone(),
                }]
            }
            SubstState::AwaitingQuery | SubstState::AwaitingReferences => Vec::new(),
            SubstState::TryToRun => {
                let program = self.current_program.clone().expect("program set before TryToRun");
                let dest = self.target.clone();
                self.state = SubstState::Building;
                vec![
                    Effect::Emit {
                        event: Event::SubstituterStarted {
                            goal: self.record.id.clone(),
                            path: dest.clone(),
                            substituter: program.display().to_string(),
                        },
                    },
                    Effect::SpawnChild {
                        goal: self.record.id.clone(),
                        kind: ChildKind::Substituter,
                        program,
                        args: vec!["--substitute".to_string(), dest.as_str().to_string()],
                        env: BTreeMap::new(),
                        cwd: std::env::temp_dir(),
                        in_build_slot: false,
                        sandbox: None,
                    },
                ]
            }
            SubstState::Building | SubstState::AwaitingVerification | SubstState::Finished => Vec::new(),
        }
    }

    /// Fold the reply to a `QuerySubstituter` effect back into the state
    /// machine (spec §4.D: a miss moves on to the next candidate; a hit
    /// parks on `AwaitingReferences` until the worker has wired a waitee
    /// goal for every reference that isn't already valid).
    pub fn handle_query_result(&mut self, program: &str, info: Option<SubstitutablePathInfo>) -> Vec<Effect> {
        if self.state != SubstState::AwaitingQuery {
            return Vec::new();
        }
        match info {
            None => {
                self.failed_attempts.push(program.to_string());
                self.state = SubstState::TryNext;
                self.work()
            }
            Some(info) => {
                self.current_info = Some(info);
                self.state = SubstState::AwaitingReferences;
                Vec::new()
            }
        }
    }

    /// The worker has checked every advertised reference against the
    /// metadata store and created a waitee goal for each one that wasn't
    /// already valid. An empty `pending` set means the closure is
    /// satisfied immediately and the fetch can start right away.
    pub fn handle_references_wired(&mut self, pending: BTreeSet<GoalId>) -> Vec<Effect> {
        if self.state != SubstState::AwaitingReferences {
            return Vec::new();
        }
        self.reference_goals = pending;
        if self.reference_goals.is_empty() {
            self.state = SubstState::TryToRun;
            return self.work();
        }
        Vec::new()
    }

    pub fn reference_goals(&self) -> &BTreeSet<GoalId> {
        &self.reference_goals
    }

    /// Every reference goal has reported in (spec §4.D closure
    /// invariant): proceed to the fetch only if all of them substituted
    /// successfully.
    pub fn handle_references_realised(&mut self, failed: u32) -> Vec<Effect> {
        if self.state != SubstState::AwaitingReferences {
            return Vec::new();
        }
        if failed > 0 {
            return self.fail(format!("{failed} referenced path(s) failed to substitute"));
        }
        self.state = SubstState::TryToRun;
        self.work()
    }

    pub fn handle_child_spawned(&mut self, child: ChildId) {
        self.current_child = Some(child);
    }

    pub fn handle_child_exited(&mut self, status: Option<i32>) -> Vec<Effect> {
        self.current_child = None;
        if self.state != SubstState::Building {
            return Vec::new();
        }
        if status == Some(0) {
            self.state = SubstState::AwaitingVerification;
            Vec::new()
        } else {
            let program = self.current_program.clone().unwrap_or_default();
            self.failed_attempts.push(program.display().to_string());
            self.state = SubstState::TryNext;
            self.work()
        }
    }

    /// The worker has verified and canonicalised the fetched output
    /// (spec §4.F) and hands back either the info to register or why
    /// verification failed.
    pub fn handle_verified(&mut self, result: Result<ValidPathInfo, String>) -> Vec<Effect> {
        if self.state != SubstState::AwaitingVerification {
            return Vec::new();
        }
        match result {
            Err(reason) => self.fail(reason),
            Ok(info) => {
                let program = self.current_program.clone().unwrap_or_default();
                self.state = SubstState::Finished;
                self.record.exit = ExitCode::Success;
                vec![
                    Effect::RegisterValidPaths { infos: vec![info] },
                    Effect::Emit {
                        event: Event::SubstituterSucceeded {
                            goal: self.record.id.clone(),
                            path: self.target.clone(),
                            substituter: program.display().to_string(),
                        },
                    },
                ]
            }
        }
    }

    pub fn info(&self) -> Option<&SubstitutablePathInfo> {
        self.current_info.as_ref()
    }
}

impl GoalBehavior for SubstitutionGoal {
    fn work(&mut self) -> Vec<Effect> {
        SubstitutionGoal::work(self)
    }

    fn cancel(&mut self) -> Vec<Effect> {
        self.state = SubstState::Finished;
        self.record.exit = ExitCode::Failed;
        match self.current_child.take() {
            Some(child) => vec![Effect::KillChild { child }],
            None => Vec::new(),
        }
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

    fn target() -> StorePath {
        StorePath::from_fingerprint("x", "foo").unwrap()
    }

    #[test]
    fn init_registers_a_temp_root_then_tries_the_first_candidate() {
        let mut goal = SubstitutionGoal::new(target());
        goal.configure(&[PathBuf::from("/bin/sub-a"), PathBuf::from("/bin/sub-b")]);
        let effects = goal.work();
        assert!(matches!(effects[0], Effect::AddTempRoot { .. }));
        assert!(matches!(effects[1], Effect::QuerySubstituter { .. }));
        assert_eq!(goal.state, SubstState::AwaitingQuery);
    }

    #[test]
    fn a_miss_advances_to_the_next_candidate() {
        let mut goal = SubstitutionGoal::new(target());
        goal.configure(&[PathBuf::from("/bin/sub-a"), PathBuf::from("/bin/sub-b")]);
        goal.work();
        let effects = goal.handle_query_result("/bin/sub-a", None);
        assert!(matches!(effects[0], Effect::QuerySubstituter { .. }));
    }

    #[test]
    fn exhausting_every_candidate_fails_the_goal() {
        let mut goal = SubstitutionGoal::new(target());
        goal.configure(&[PathBuf::from("/bin/sub-a")]);
        goal.work();
        goal.handle_query_result("/bin/sub-a", None);
        assert_eq!(goal.state, SubstState::Finished);
        assert_eq!(goal.record.exit, ExitCode::Failed);
    }

    #[test]
    fn a_hit_with_no_outstanding_references_leads_to_spawning_the_fetch() {
        let mut goal = SubstitutionGoal::new(target());
        goal.configure(&[PathBuf::from("/bin/sub-a")]);
        goal.work();
        let info = SubstitutablePathInfo {
            path: target(),
            references: Default::default(),
            deriver: None,
            download_size: 10,
            nar_size: 20,
        };
        goal.handle_query_result("/bin/sub-a", Some(info));
        assert_eq!(goal.state, SubstState::AwaitingReferences);
        let effects = goal.handle_references_wired(BTreeSet::new());
        assert!(effects.iter().any(|e| matches!(e, Effect::SpawnChild { .. })));
        assert_eq!(goal.state, SubstState::Building);
    }

    #[test]
    fn a_hit_with_outstanding_references_waits_for_them_before_fetching() {
        let mut goal = SubstitutionGoal::new(target());
        goal.configure(&[PathBuf::from("/bin/sub-a")]);
        goal.work();
        let dep = GoalId::new();
        let info = SubstitutablePathInfo {
            path: target(),
            references: Default::default(),
            deriver: None,
            download_size: 10,
            nar_size: 20,
        };
        goal.handle_query_result("/bin/sub-a", Some(info));
        let effects = goal.handle_references_wired(BTreeSet::from([dep.clone()]));
        assert!(effects.is_empty());
        assert_eq!(goal.state, SubstState::AwaitingReferences);
        assert!(goal.reference_goals().contains(&dep));
    }

    #[test]
    fn a_failed_reference_fails_the_goal_instead_of_fetching() {
        let mut goal = SubstitutionGoal::new(target());
        goal.configure(&[PathBuf::from("/bin/sub-a")]);
        goal.work();
        goal.handle_query_result(
            "/bin/sub-a",
            Some(SubstitutablePathInfo {
                path: target(),
                references: Default::default(),
                deriver: None,
                download_size: 1,
                nar_size: 1,
            }),
        );
        goal.handle_references_wired(BTreeSet::from([GoalId::new()]));
        let effects = goal.handle_references_realised(1);
        assert_eq!(goal.state, SubstState::Finished);
        assert_eq!(goal.record.exit, ExitCode::Failed);
        assert!(effects.iter().any(|e| matches!(e, Effect::Emit { .. })));
    }

    #[test]
    fn a_successful_exit_moves_to_verification_rather_than_finishing_outright() {
        let mut goal = SubstitutionGoal::new(target());
        goal.configure(&[PathBuf::from("/bin/sub-a")]);
        goal.work();
        goal.handle_query_result(
            "/bin/sub-a",
            Some(SubstitutablePathInfo {
                path: target(),
                references: Default::default(),
                deriver: None,
                download_size: 1,
                nar_size: 1,
            }),
        );
        goal.handle_references_wired(BTreeSet::new());
        goal.handle_child_exited(Some(0));
        assert_eq!(goal.state, SubstState::AwaitingVerification);
        assert_eq!(goal.record.exit, ExitCode::Busy);
    }

    #[test]
    fn a_verified_fetch_registers_the_path_and_succeeds() {
        let mut goal = SubstitutionGoal::new(target());
        goal.configure(&[PathBuf::from("/bin/sub-a")]);
        goal.work();
        goal.handle_query_result(
            "/bin/sub-a",
            Some(SubstitutablePathInfo {
                path: target(),
                references: Default::default(),
                deriver: None,
                download_size: 1,
                nar_size: 1,
            }),
        );
        goal.handle_references_wired(BTreeSet::new());
        goal.handle_child_exited(Some(0));
        let info = ValidPathInfo::new(target(), njd_store::Sha256Hash::of_bytes(b"data"), BTreeSet::new());
        let effects = goal.handle_verified(Ok(info));
        assert_eq!(goal.record.exit, ExitCode::Success);
        assert!(effects.iter().any(|e| matches!(e, Effect::RegisterValidPaths { .. })));
    }

    #[test]
    fn a_failed_verification_fails_the_goal() {
        let mut goal = SubstitutionGoal::new(target());
        goal.configure(&[PathBuf::from("/bin/sub-a")]);
        goal.work();
        goal.handle_query_result(
            "/bin/sub-a",
            Some(SubstitutablePathInfo {
                path: target(),
                references: Default::default(),
                deriver: None,
                download_size: 1,
                nar_size: 1,
            }),
        );
        goal.handle_references_wired(BTreeSet::new());
        goal.handle_child_exited(Some(0));
        goal.handle_verified(Err("hash mismatch".to_string()));
        assert_eq!(goal.state, SubstState::Finished);
        assert_eq!(goal.record.exit, ExitCode::Failed);
    }

    #[test]
    fn an_already_valid_target_short_circuits_to_success() {
        let mut goal = SubstitutionGoal::new(target());
        let effects = goal.mark_already_valid();
        assert!(effects.is_empty());
        assert_eq!(goal.state, SubstState::Finished);
        assert_eq!(goal.record.exit, ExitCode::Success);
    }
}
