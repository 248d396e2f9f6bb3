// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Worker loop (spec §4.C): drains awake goals, multiplexes their
//! effects through a single [`Executor`], and feeds the resulting events
//! back so every goal-state mutation happens on this one task.
//!
//! Each turn follows the same shape regardless of goal kind: remove the
//! goal from [`GoalGraph`]'s arena, run its state handler (which may
//! itself need to create new waitee goals — hence the removal, so the
//! handler can hold `&mut GoalGraph` without aliasing its own entry),
//! execute whatever effects it asked for, fold any resulting event back
//! in, then reinsert it and check whether it finished.

use crate::derivation::{DerivationGoal, DrvState};
use crate::failure_cache::FailureCache;
use crate::goal::{Goal, GoalGraph};
use crate::substitution::{SubstState, SubstitutionGoal};
use crate::verifier;
use njd_core::child::Child;
use njd_core::{ChildId, Effect, EngineConfig, Event, GoalId, HookOutcome};
use njd_core::{Clock, GoalBehavior};
use njd_storage::MetadataStore;
use njd_store::{Derivation, StorePath, ValidPathInfo};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("goal graph deadlocked with {0} top-level goal(s) still outstanding")]
    Deadlocked(usize),
}

/// Everything the Worker needs to interpret a goal's effects; kept as its
/// own struct so `step()` can pass it around without borrowing all of
/// `Worker` at once.
pub struct Worker<C: Clock> {
    graph: GoalGraph,
    executor: Arc<njd_adapters::Executor>,
    metadata: Arc<dyn MetadataStore>,
    failure_cache: FailureCache,
    config: EngineConfig,
    clock: C,
    children: HashMap<ChildId, Child>,
    event_rx: mpsc::Receiver<Event>,
}

impl<C: Clock> Worker<C> {
    pub fn new(
        executor: Arc<njd_adapters::Executor>,
        metadata: Arc<dyn MetadataStore>,
        config: EngineConfig,
        clock: C,
        event_rx: mpsc::Receiver<Event>,
    ) -> Self {
        let failure_cache =
            FailureCache::new(metadata.clone(), config.failure_caching_enabled);
        Self {
            graph: GoalGraph::new(),
            executor,
            metadata,
            failure_cache,
            config,
            clock,
            children: HashMap::new(),
            event_rx,
        }
    }

    fn store_path_on_disk(&self, path: &StorePath) -> PathBuf {
        self.config.state_dir.join("store").join(path.as_str())
    }

    /// Register a `.drv` as a top-level goal (spec §3 "top-level goals").
    pub fn request_build(&mut self, drv_path: StorePath) -> GoalId {
        let id = self.graph.get_or_create_derivation(drv_path);
        self.graph.add_top_goal(id.clone());
        id
    }

    pub fn request_substitution(&mut self, target: StorePath) -> GoalId {
        let id = self.graph.get_or_create_substitution(target);
        self.graph.add_top_goal(id.clone());
        id
    }

    pub fn goal_succeeded(&self, id: &GoalId) -> Option<bool> {
        self.graph.goals.get(id).map(Goal::succeeded)
    }

    /// Run until every top-level goal is terminal, or the graph
    /// deadlocks (spec §4.C "Deadlock/liveness").
    pub async fn run(&mut self) -> Result<(), WorkerError> {
        loop {
            if let Some(id) = self.graph.awake.pop_front() {
                self.step(id).await;
                continue;
            }

            let outstanding = self
                .graph
                .top_goals
                .iter()
                .filter(|id| !self.graph.goals.get(*id).map(Goal::is_terminal).unwrap_or(true))
                .count();
            if outstanding == 0 {
                return Ok(());
            }
            if self.graph.is_deadlocked(self.children.is_empty()) {
                return Err(WorkerError::Deadlocked(outstanding));
            }

            let timeout = self.next_wake_delay();
            match tokio::time::timeout(timeout, self.event_rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event).await,
                Ok(None) => return Ok(()),
                Err(_) => self.handle_timer_tick().await,
            }
        }
    }

    fn next_wake_delay(&self) -> Duration {
        if !self.graph.wanting_time.is_empty() {
            return self.config.poll_interval();
        }
        if !self.children.is_empty() {
            return self.config.max_silent_time().min(self.config.poll_interval());
        }
        self.config.poll_interval()
    }

    /// Poll-timer wake (spec §4.C rule 5): retry every goal parked on
    /// `wantingTime`, and cancel any child that has gone silent too long
    /// (spec §5 "Cancellation & timeouts").
    async fn handle_timer_tick(&mut self) {
        let silent: Vec<ChildId> = self
            .children
            .values()
            .filter(|c| c.is_silent_past(self.clock.now(), self.config.max_silent_time()))
            .map(|c| c.id)
            .collect();
        for child in silent {
            let _ = self.executor.execute(Effect::KillChild { child }).await;
        }

        let parked: Vec<GoalId> = self.graph.wanting_time.iter().cloned().collect();
        for id in parked {
            self.graph.wake(id);
        }
    }

    /// Only events genuinely delivered asynchronously over the channel
    /// reach here: everything else (`ChildSpawned`, `LockAcquired`,
    /// `LockContended`, `UserSlotAcquired`, `SubstituterQueried`) is a
    /// direct reply to the effect that asked for it and is folded back by
    /// [`Worker::run_effects`] before `execute` even returns.
    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::ChildOutput { child, bytes } => {
                if let Some(c) = self.children.get_mut(&child) {
                    c.touch(self.clock.now());
                }
                if let Some(owner) = self.children.get(&child).map(|c| c.owner.clone()) {
                    self.with_goal(&owner, |g| match g {
                        Goal::Substitution(g) => g.handle_child_output(child, bytes),
                        Goal::Derivation(g) => g.handle_child_output(child, bytes),
                    })
                    .await;
                }
            }
            Event::ChildEof { child } => {
                if let Some(owner) = self.children.get(&child).map(|c| c.owner.clone()) {
                    self.with_goal(&owner, |g| match g {
                        Goal::Substitution(g) => g.handle_child_eof(child),
                        Goal::Derivation(g) => g.handle_child_eof(child),
                    })
                    .await;
                }
            }
            Event::ChildExited { child, status } => {
                let removed = self.children.remove(&child);
                let freed_build_slot = removed.as_ref().is_some_and(|c| c.in_build_slot);
                if let Some(owner) = removed.map(|c| c.owner) {
                    self.step_child_exit(&owner, status).await;
                }
                if freed_build_slot {
                    self.release_one_build_slot_waiter();
                }
            }
            Event::HookOutcome { goal, outcome } => {
                self.step_hook_outcome(&goal, outcome).await;
            }
            Event::ChildSpawned { .. }
            | Event::UserSlotAcquired { .. }
            | Event::UserSlotUnavailable { .. }
            | Event::LockAcquired { .. }
            | Event::LockContended { .. }
            | Event::LockOwnedByAnotherGoal { .. }
            | Event::SubstituterQueried { .. }
            | Event::BuildStarted { .. }
            | Event::BuildSucceeded { .. }
            | Event::BuildFailed { .. }
            | Event::SubstituterStarted { .. }
            | Event::SubstituterSucceeded { .. }
            | Event::SubstituterFailed { .. }
            | Event::HookFailed { .. }
            | Event::GoalFinished { .. }
            | Event::PollElapsed
            | Event::Custom => {}
        }
    }

    /// A hook's verdict on one derivation has arrived; fold it in and, if
    /// it postponed the decision, park the goal on the poll timer rather
    /// than leaving it asleep forever (spec §4.E "postpone").
    async fn step_hook_outcome(&mut self, id: &GoalId, outcome: HookOutcome) {
        let Some(mut goal) = self.graph.goals.remove(id) else { return };
        let effects = match &mut goal {
            Goal::Derivation(g) => g.handle_hook_outcome(outcome),
            Goal::Substitution(_) => Vec::new(),
        };
        self.run_effects(&mut goal, effects).await;
        let postponed = matches!(&goal, Goal::Derivation(g) if g.state == DrvState::HookPostponed);
        self.reinsert(id.clone(), goal).await;
        if postponed {
            self.graph.wait_for_a_while(id.clone());
        }
    }

    fn children_in_build_slot_count(&self) -> usize {
        self.children.values().filter(|c| c.in_build_slot).count()
    }

    fn build_slot_available(&self) -> bool {
        self.children_in_build_slot_count() < self.config.max_build_jobs.max(1) as usize
    }

    /// A local build slot just freed up (spec §4.A budget); wake exactly
    /// one goal parked on `wantingBuildSlot` rather than the whole set, so
    /// the next one through still re-checks the budget before claiming it.
    fn release_one_build_slot_waiter(&mut self) {
        if let Some(id) = self.graph.wanting_build_slot.iter().next().cloned() {
            self.graph.wake(id);
        }
    }

    /// A monitored child exited; fold it into its owner and, for a
    /// builder whose exit moved the goal into `AwaitingVerification`, run
    /// the content verifier right away (spec §4.F) since that is
    /// filesystem work only the Worker can do.
    async fn step_child_exit(&mut self, owner: &GoalId, status: Option<i32>) {
        let Some(mut goal) = self.graph.goals.remove(owner) else { return };
        let effects = match &mut goal {
            Goal::Substitution(g) => g.handle_child_exited(status),
            Goal::Derivation(g) => g.handle_child_exited(status),
        };
        self.run_effects(&mut goal, effects).await;

        let mut post_verify = None;
        match &mut goal {
            Goal::Derivation(g) if g.state == DrvState::AwaitingVerification => {
                let result = self.verify_derivation(g).await;
                post_verify = Some(g.handle_build_verified(result));
            }
            Goal::Substitution(g) if g.state == SubstState::AwaitingVerification => {
                let result = self.verify_substitution(g).await;
                post_verify = Some(g.handle_verified(result));
            }
            _ => {}
        }
        if let Some(effects) = post_verify {
            self.run_effects(&mut goal, effects).await;
        }

        self.reinsert(owner.clone(), goal).await;
    }

    /// Verify a fetched substitution (spec §4.F steps 2-3, minus the
    /// fixed-output hash recheck and `allowedReferences` enforcement,
    /// neither of which apply to a substituter-advertised path).
    async fn verify_substitution(&self, g: &SubstitutionGoal) -> Result<ValidPathInfo, String> {
        let info = g.info().cloned().ok_or_else(|| "no substitutable info recorded".to_string())?;
        let root = self.store_path_on_disk(&info.path);
        verifier::verify_substituted_output(&info, &root)
    }

    async fn verify_derivation(
        &self,
        g: &DerivationGoal,
    ) -> Result<Vec<ValidPathInfo>, crate::error::GoalError> {
        let derivation = g.derivation.clone().ok_or_else(|| {
            crate::error::GoalError::MisconfigurationFailure("no derivation loaded".to_string())
        })?;
        let candidates = self.candidate_references_for(&derivation).await;
        let mut infos = Vec::new();
        for output_path in &g.invalid_outputs {
            let name = output_name_for(&derivation, &g.drv_path, output_path)
                .ok_or_else(|| crate::error::GoalError::MisconfigurationFailure("unknown output".into()))?;
            let root = self.store_path_on_disk(output_path);
            let info = verifier::verify_output(&g.drv_path, &derivation, &name, output_path, &root, &candidates)?;
            infos.push(info);
        }
        Ok(infos)
    }

    /// Every path a finished output might legitimately reference (spec
    /// §4.F step 3 scan set): its own input sources, plus the realised
    /// output path of each output it actually consumes from each input
    /// derivation. Loading those dependency `.drv`s again is cheap local
    /// disk I/O, not a network round-trip, and keeps this independent of
    /// whatever order goals happened to finish in.
    async fn candidate_references_for(&self, derivation: &Derivation) -> BTreeSet<StorePath> {
        let mut candidates: BTreeSet<StorePath> = derivation.input_sources.iter().cloned().collect();
        for (dep_drv_path, names) in &derivation.input_derivations {
            let on_disk = self.store_path_on_disk(dep_drv_path);
            let Ok(dep) = njd_store::derivation_from_path(&on_disk) else { continue };
            for name in names {
                if let Some(out) = dep.output_path(dep_drv_path, name) {
                    candidates.insert(out);
                }
            }
        }
        candidates
    }

    /// Remove the goal, run `f` against it for its effects, execute them,
    /// reinsert, and propagate completion. This is the generic path for
    /// single-event dispatches that don't need anything beyond the
    /// effect list `f` returns.
    async fn with_goal(&mut self, id: &GoalId, f: impl FnOnce(&mut Goal) -> Vec<Effect>) {
        let Some(mut goal) = self.graph.goals.remove(id) else { return };
        let effects = f(&mut goal);
        self.run_effects(&mut goal, effects).await;
        self.reinsert(id.clone(), goal).await;
    }

    /// Execute a goal's requested effects in order, folding any resulting
    /// event straight back into the very goal that asked for it before
    /// moving to the next effect — mirroring how a synchronous `work()`
    /// would have seen each reply in turn.
    ///
    /// `goal` is always held locally here, never looked up by id: most of
    /// these replies (`ChildSpawned`, `LockAcquired`, `UserSlotAcquired`,
    /// `SubstituterQueried`) come straight back from `Executor::execute`
    /// rather than over the channel, at a point where `goal` has been
    /// pulled out of `self.graph.goals` and a by-id lookup would find
    /// nothing there.
    async fn run_effects(&mut self, goal: &mut Goal, effects: Vec<Effect>) {
        let mut pending: std::collections::VecDeque<Effect> = effects.into();
        while let Some(effect) = pending.pop_front() {
            match self.executor.execute(effect).await {
                Ok(Some(event)) => pending.extend(self.apply_event(goal, event).await),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(goal = %goal.record().id, error = %e, "effect execution failed")
                }
            }
        }
    }

    /// Fold a direct reply to one of `goal`'s own effects back into it,
    /// returning whatever further effects that produced.
    ///
    /// The `SubstituterQueried` hit case is the one branch that needs more
    /// than the event's own payload: the closure invariant (spec §4.D)
    /// requires a waitee goal for every advertised reference that isn't
    /// already valid, wired the same way `prepare_derivation` wires input
    /// goals, before the fetch is allowed to proceed.
    async fn apply_event(&mut self, goal: &mut Goal, event: Event) -> Vec<Effect> {
        match event {
            Event::ChildSpawned { child, in_build_slot, goal: owner } => {
                self.children.insert(child, Child::new(child, owner, in_build_slot, self.clock.now()));
                match goal {
                    Goal::Substitution(g) => g.handle_child_spawned(child),
                    Goal::Derivation(g) => g.handle_child_spawned(child),
                }
                Vec::new()
            }
            Event::LockAcquired { .. } => match goal {
                Goal::Derivation(g) => g.handle_lock_acquired(),
                Goal::Substitution(_) => Vec::new(),
            },
            Event::LockContended { .. } | Event::LockOwnedByAnotherGoal { .. } => {
                self.graph.wait_for_a_while(goal.record().id.clone());
                Vec::new()
            }
            Event::UserSlotAcquired { lease, .. } => match goal {
                Goal::Derivation(g) => g.handle_user_slot_acquired(lease),
                Goal::Substitution(_) => Vec::new(),
            },
            Event::UserSlotUnavailable { .. } => {
                self.graph.wait_for_a_while(goal.record().id.clone());
                Vec::new()
            }
            Event::SubstituterQueried { program, info, .. } => match goal {
                Goal::Substitution(g) => match info {
                    None => g.handle_query_result(&program, None),
                    Some(info) => {
                        let references = info.references.clone();
                        let waiter = g.record.id.clone();
                        g.handle_query_result(&program, Some(info));
                        let mut pending = BTreeSet::new();
                        for reference in &references {
                            if self.metadata.is_valid_path(reference).await {
                                continue;
                            }
                            let sub = self.graph.get_or_create_substitution(reference.clone());
                            g.record.add_waitee(sub.clone());
                            if let Some(w) = self.graph.goals.get_mut(&sub) {
                                w.record_mut().waiters.insert(waiter.clone());
                            }
                            pending.insert(sub);
                        }
                        g.handle_references_wired(pending)
                    }
                },
                Goal::Derivation(_) => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    async fn reinsert(&mut self, id: GoalId, goal: Goal) {
        let terminal = goal.is_terminal();
        let succeeded = goal.succeeded();
        if terminal && !succeeded {
            if let Goal::Derivation(g) = &goal {
                if let Some(error) = g.failure() {
                    for output in &g.invalid_outputs {
                        let _ = self.failure_cache.record_if_cacheable(output, error, g.is_fixed_output).await;
                    }
                }
            }
        }
        let is_top_goal = self.graph.top_goals.contains(&id);
        self.graph.goals.insert(id.clone(), goal);
        if terminal {
            self.graph.finish_goal(&id, succeeded);
            if is_top_goal && !succeeded && !self.config.keep_going {
                self.graph.top_goals.clear();
            }
        }
    }

    /// Step one awake goal exactly once (spec §4.C "drain `awake`").
    async fn step(&mut self, id: GoalId) {
        let Some(mut goal) = self.graph.goals.remove(&id) else { return };

        if let Goal::Derivation(g) = &goal {
            if g.state == DrvState::TryToBuild && g.needs_build_slot() && !self.build_slot_available() {
                self.graph.goals.insert(id.clone(), goal);
                self.graph.wait_for_build_slot(id);
                return;
            }
        }

        if matches!(&goal, Goal::Substitution(g) if g.state == SubstState::Init) {
            let target = match &goal {
                Goal::Substitution(g) => g.target.clone(),
                Goal::Derivation(_) => unreachable!(),
            };
            let already_valid = self.metadata.is_valid_path(&target).await;
            let effects = match &mut goal {
                Goal::Substitution(g) if already_valid => g.mark_already_valid(),
                Goal::Substitution(g) => {
                    g.configure(&self.config.substituters);
                    g.work()
                }
                Goal::Derivation(_) => unreachable!(),
            };
            self.run_effects(&mut goal, effects).await;
            self.reinsert(id, goal).await;
            return;
        }

        let effects = match &mut goal {
            Goal::Substitution(g) if g.state == SubstState::AwaitingReferences => {
                let failed = g
                    .reference_goals()
                    .iter()
                    .filter(|w| !self.graph.goals.get(*w).map(Goal::succeeded).unwrap_or(false))
                    .count() as u32;
                g.handle_references_realised(failed)
            }
            Goal::Derivation(g) if g.state == DrvState::Init => {
                self.prepare_derivation(&id, g).await
            }
            Goal::Derivation(g) if g.state == DrvState::AwaitingInputGoals => {
                let failed = g
                    .input_goals()
                    .iter()
                    .filter(|w| !self.graph.goals.get(*w).map(Goal::succeeded).unwrap_or(false))
                    .count() as u32;
                g.handle_inputs_realised(failed)
            }
            Goal::Derivation(g) if g.state == DrvState::AcquiringLock => g.handle_lock_contended(),
            Goal::Derivation(g) if g.state == DrvState::AcquiringUserSlot => g.handle_user_slot_contended(),
            Goal::Derivation(g) if g.state == DrvState::HookPostponed => g.handle_postpone_elapsed(),
            Goal::Substitution(g) => g.work(),
            Goal::Derivation(g) => GoalBehavior::work(g),
        };
        self.run_effects(&mut goal, effects).await;
        self.reinsert(id, goal).await;
    }

    /// The async preparation a fresh derivation goal needs before it can
    /// run its own state machine: load the `.drv`, determine which
    /// outputs are missing, check the failure cache, and create whatever
    /// input goals those missing outputs depend on.
    async fn prepare_derivation(&mut self, id: &GoalId, g: &mut DerivationGoal) -> Vec<Effect> {
        let on_disk = self.store_path_on_disk(&g.drv_path);
        let derivation = match njd_store::derivation_from_path(&on_disk) {
            Ok(d) => d,
            Err(e) => return g.handle_load_failure(e.to_string()),
        };

        let mut invalid_outputs = BTreeSet::new();
        let mut cached_failure = false;
        for name in derivation.outputs.keys() {
            let Some(out_path) = derivation.output_path(&g.drv_path, name) else { continue };
            if !self.metadata.is_valid_path(&out_path).await {
                if self.failure_cache.has_failed(&out_path).await {
                    cached_failure = true;
                }
                invalid_outputs.insert(out_path);
            }
        }

        if cached_failure {
            return g.mark_cached_failure("output already in failure cache".to_string());
        }

        // `g` is out of `self.graph.goals` for the duration of this call
        // (the arena "remove before stepping" pattern), so the waiter side
        // of each edge is recorded straight on `g.record`; only the
        // waitee side can go through the graph.
        let mut input_goals = BTreeSet::new();
        if !invalid_outputs.is_empty() {
            for src in &derivation.input_sources {
                if !self.metadata.is_valid_path(src).await {
                    let sub = self.graph.get_or_create_substitution(src.clone());
                    g.record.add_waitee(sub.clone());
                    if let Some(w) = self.graph.goals.get_mut(&sub) {
                        w.record_mut().waiters.insert(id.clone());
                    }
                    input_goals.insert(sub);
                }
            }
            for drv_dep in derivation.input_derivations.keys() {
                let dep = self.graph.get_or_create_derivation(drv_dep.clone());
                g.record.add_waitee(dep.clone());
                if let Some(w) = self.graph.goals.get_mut(&dep) {
                    w.record_mut().waiters.insert(id.clone());
                }
                input_goals.insert(dep);
            }
        }

        let sandbox = if self.config.use_sandbox {
            let input_closure = self.candidate_references_for(&derivation).await;
            Some(crate::derivation::SandboxSettings {
                bind_paths: self.config.sandbox_bind_paths.clone(),
                store_dir: self.config.state_dir.join("store"),
                input_closure,
            })
        } else {
            None
        };

        g.handle_derivation_ready(derivation, invalid_outputs, input_goals, self.config.build_hook.clone(), sandbox)
    }
}

fn output_name_for(derivation: &Derivation, drv_path: &StorePath, output_path: &StorePath) -> Option<String> {
    derivation
        .outputs
        .keys()
        .find(|name| derivation.output_path(drv_path, name).as_ref() == Some(output_path))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use njd_adapters::{Executor, PathLockManager, SlotCandidate, UserSlotPool};
    use njd_core::SystemClock;
    use njd_store::DerivationOutput;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn harness(dir: &Path) -> (Worker<SystemClock>, Arc<njd_storage::InMemoryMetadataStore>) {
        let (tx, rx) = mpsc::channel(64);
        let metadata = Arc::new(njd_storage::InMemoryMetadataStore::new());
        let executor = Arc::new(Executor::new(
            metadata.clone(),
            UserSlotPool::new(dir, vec![SlotCandidate { user: "njdbuild1".into(), uid: 30001, gid: 30000 }]),
            PathLockManager::new(dir.join("store")),
            tx,
        ));
        let config = EngineConfig {
            state_dir: dir.to_path_buf(),
            poll_interval_secs: 1,
            max_silent_secs: 5,
            ..EngineConfig::default()
        };
        let worker: Worker<SystemClock> = Worker::new(executor, metadata.clone(), config, SystemClock, rx);
        (worker, metadata)
    }

    fn sample_drv(name: &str, builder: &str, args: Vec<&str>, env: BTreeMap<String, String>) -> Derivation {
        let mut outputs = BTreeMap::new();
        outputs.insert("out".to_string(), DerivationOutput::InputAddressed);
        Derivation {
            name: name.to_string(),
            outputs,
            input_sources: BTreeSet::new(),
            input_derivations: BTreeMap::new(),
            builder: builder.into(),
            args: args.into_iter().map(String::from).collect(),
            env,
            platform: "x86_64-linux".into(),
            impure_env_vars: vec![],
            allowed_references: None,
        }
    }

    fn write_drv(dir: &Path, drv_path: &StorePath, derivation: &Derivation) {
        let store = dir.join("store");
        std::fs::create_dir_all(&store).unwrap();
        std::fs::write(store.join(drv_path.as_str()), derivation.to_json().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn a_build_whose_output_is_already_valid_finishes_without_spawning_anything() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut worker, metadata) = harness(tmp.path());

        let drv_path = StorePath::from_fingerprint("hello-drv", "hello.drv").unwrap();
        let derivation = sample_drv("hello", "/bin/sh", vec![], BTreeMap::new());
        let out_path = derivation.output_path(&drv_path, "out").unwrap();
        write_drv(tmp.path(), &drv_path, &derivation);

        metadata
            .register_valid_paths(vec![ValidPathInfo::new(
                out_path,
                njd_store::Sha256Hash::of_bytes(b"anything"),
                BTreeSet::new(),
            )])
            .await
            .unwrap();

        let id = worker.request_build(drv_path);
        worker.run().await.unwrap();
        assert_eq!(worker.goal_succeeded(&id), Some(true));
    }

    /// Exercises the full local-build path: acquiring a lock and a user
    /// slot are both direct replies to their own effects (never delivered
    /// over the event channel), so this is also a regression test for
    /// folding those replies into the goal that is mid-flight rather than
    /// looking it up in the arena while it is temporarily absent.
    #[tokio::test]
    async fn a_local_build_runs_end_to_end_and_registers_its_output() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut worker, metadata) = harness(tmp.path());

        let drv_path = StorePath::from_fingerprint("hello-drv", "hello.drv").unwrap();
        let args = vec!["-c", "printf hi > \"$out\""];
        let out_path =
            sample_drv("hello", "/bin/sh", args.clone(), BTreeMap::new()).output_path(&drv_path, "out").unwrap();
        let mut env = BTreeMap::new();
        env.insert("out".to_string(), tmp.path().join("store").join(out_path.as_str()).display().to_string());
        let derivation = sample_drv("hello", "/bin/sh", args, env);
        write_drv(tmp.path(), &drv_path, &derivation);

        let id = worker.request_build(drv_path);
        worker.run().await.unwrap();

        assert_eq!(worker.goal_succeeded(&id), Some(true));
        assert!(metadata.is_valid_path(&out_path).await);
    }

    #[tokio::test]
    async fn a_failed_local_build_is_recorded_in_the_failure_cache() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut worker, metadata) = harness(tmp.path());

        let drv_path = StorePath::from_fingerprint("broken-drv", "broken.drv").unwrap();
        let derivation = sample_drv("broken", "/bin/sh", vec!["-c", "exit 1"], BTreeMap::new());
        let out_path = derivation.output_path(&drv_path, "out").unwrap();
        write_drv(tmp.path(), &drv_path, &derivation);

        let id = worker.request_build(drv_path);
        worker.run().await.unwrap();

        assert_eq!(worker.goal_succeeded(&id), Some(false));
        assert!(metadata.has_path_failed(&out_path).await);
    }

    #[tokio::test]
    async fn a_pure_substitution_succeeds_via_a_configured_substituter() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel(64);
        let metadata = Arc::new(njd_storage::InMemoryMetadataStore::new());
        let executor = Arc::new(Executor::new(
            metadata.clone(),
            UserSlotPool::new(tmp.path(), vec![SlotCandidate { user: "njdbuild1".into(), uid: 30001, gid: 30000 }]),
            PathLockManager::new(tmp.path().join("store")),
            tx,
        ));

        let target = StorePath::from_fingerprint("fetched", "fetched-1.0").unwrap();
        let info = njd_store::SubstitutablePathInfo {
            path: target.clone(),
            references: BTreeSet::new(),
            deriver: None,
            download_size: 1,
            nar_size: 1,
        };
        let info_json = serde_json::to_string(&info).unwrap();
        let dest = tmp.path().join("store").join(target.as_str());
        let fake_substituter = tmp.path().join("fake-substituter.sh");
        std::fs::write(
            &fake_substituter,
            format!(
                "#!/bin/sh\ncase \"$1\" in\n  --query)\n    cat <<'EOF'\n{info_json}\nEOF\n    ;;\n  --substitute)\n    mkdir -p {dest}\n    printf fetched > {dest}/payload\n    exit 0\n    ;;\nesac\n",
                dest = dest.display(),
            ),
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake_substituter, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let config = EngineConfig {
            state_dir: tmp.path().to_path_buf(),
            poll_interval_secs: 1,
            max_silent_secs: 5,
            substituters: vec![fake_substituter],
            ..EngineConfig::default()
        };
        let mut worker: Worker<SystemClock> = Worker::new(executor, metadata.clone(), config, SystemClock, rx);
        let id = worker.request_substitution(target.clone());
        worker.run().await.unwrap();
        assert_eq!(worker.goal_succeeded(&id), Some(true));
        assert!(metadata.is_valid_path(&target).await);
    }

    #[tokio::test]
    async fn a_substitution_with_an_already_valid_target_never_consults_a_substituter() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut worker, metadata) = harness(tmp.path());

        let target = StorePath::from_fingerprint("already-there", "already-there-1.0").unwrap();
        metadata
            .register_valid_paths(vec![ValidPathInfo::new(
                target.clone(),
                njd_store::Sha256Hash::of_bytes(b"anything"),
                BTreeSet::new(),
            )])
            .await
            .unwrap();

        let id = worker.request_substitution(target);
        worker.run().await.unwrap();
        assert_eq!(worker.goal_succeeded(&id), Some(true));
    }
}
