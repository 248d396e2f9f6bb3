// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The goal graph (spec §3 "Lifecycles", §9 "cyclic ownership in the goal
//! graph"): an arena of goals keyed by [`GoalId`], with the Worker's
//! four wait sets layered on top. Strong ownership lives in `goals`
//! itself and in `top_goals`; the per-kind caches and every `waitees`/
//! `waiters` set hold non-owning `GoalId`s, so the arena — not reference
//! counting — is what keeps a goal alive.

use crate::derivation::DerivationGoal;
use crate::substitution::SubstitutionGoal;
use njd_core::goal::{ExitCode, GoalRecord, Suspension};
use njd_core::GoalId;
use njd_store::StorePath;
use std::collections::{HashMap, HashSet, VecDeque};

/// One of the two concrete goal kinds (spec §9 "virtual dispatch for
/// goal state": a sum type over the two variants).
pub enum Goal {
    Substitution(SubstitutionGoal),
    Derivation(DerivationGoal),
}

impl Goal {
    pub fn record(&self) -> &GoalRecord {
        match self {
            Goal::Substitution(g) => &g.record,
            Goal::Derivation(g) => &g.record,
        }
    }

    pub fn record_mut(&mut self) -> &mut GoalRecord {
        match self {
            Goal::Substitution(g) => &mut g.record,
            Goal::Derivation(g) => &mut g.record,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.record().exit.is_terminal()
    }

    pub fn succeeded(&self) -> bool {
        self.record().exit == ExitCode::Success
    }
}

/// The arena plus the Worker's wait-set bookkeeping (spec §4.C state
/// list). Owned by [`crate::worker::Worker`]; kept as its own type so the
/// two goal-kind step functions can mutate scheduling state without the
/// Worker itself in scope.
#[derive(Default)]
pub struct GoalGraph {
    pub goals: HashMap<GoalId, Goal>,
    pub top_goals: HashSet<GoalId>,
    subst_cache: HashMap<StorePath, GoalId>,
    drv_cache: HashMap<StorePath, GoalId>,
    pub awake: VecDeque<GoalId>,
    pub wanting_build_slot: HashSet<GoalId>,
    pub wanting_any_goal: HashSet<GoalId>,
    pub wanting_time: HashSet<GoalId>,
}

impl GoalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// At-most-one-goal-per-target (spec §4.C, §8 "At-most-one"): return
    /// the existing substitution goal for `target` if the cache still
    /// names a live one, else create and register a fresh one.
    pub fn get_or_create_substitution(&mut self, target: StorePath) -> GoalId {
        if let Some(id) = self.subst_cache.get(&target) {
            if self.goals.contains_key(id) {
                return id.clone();
            }
        }
        let goal = SubstitutionGoal::new(target.clone());
        let id = goal.record.id.clone();
        self.subst_cache.insert(target, id.clone());
        self.goals.insert(id.clone(), Goal::Substitution(goal));
        self.awake.push_back(id.clone());
        id
    }

    pub fn get_or_create_derivation(&mut self, drv_path: StorePath) -> GoalId {
        if let Some(id) = self.drv_cache.get(&drv_path) {
            if self.goals.contains_key(id) {
                return id.clone();
            }
        }
        let goal = DerivationGoal::new(drv_path.clone());
        let id = goal.record.id.clone();
        self.drv_cache.insert(drv_path, id.clone());
        self.goals.insert(id.clone(), Goal::Derivation(goal));
        self.awake.push_back(id.clone());
        id
    }

    pub fn add_top_goal(&mut self, id: GoalId) {
        self.top_goals.insert(id);
    }

    /// Record `waiter` as depending on `waitee`'s completion (spec §5
    /// "addWaitee"). Moves `waiter` out of `awake` implicitly: the caller
    /// is expected to simply not re-enqueue it.
    pub fn add_waitee(&mut self, waiter: &GoalId, waitee: &GoalId) {
        if let Some(g) = self.goals.get_mut(waiter) {
            g.record_mut().waitees.insert(waitee.clone());
        }
        if let Some(g) = self.goals.get_mut(waitee) {
            g.record_mut().waiters.insert(waiter.clone());
        }
    }

    pub fn wake(&mut self, id: GoalId) {
        self.wanting_build_slot.remove(&id);
        self.wanting_any_goal.remove(&id);
        self.wanting_time.remove(&id);
        if let Some(g) = self.goals.get_mut(&id) {
            g.record_mut().suspension = Suspension::Awake;
        }
        if !self.awake.contains(&id) {
            self.awake.push_back(id);
        }
    }

    pub fn wait_for_build_slot(&mut self, id: GoalId) {
        if let Some(g) = self.goals.get_mut(&id) {
            g.record_mut().suspension = Suspension::WantingBuildSlot;
        }
        self.wanting_build_slot.insert(id);
    }

    pub fn wait_for_any_goal(&mut self, id: GoalId) {
        if let Some(g) = self.goals.get_mut(&id) {
            g.record_mut().suspension = Suspension::WantingAnyGoal;
        }
        self.wanting_any_goal.insert(id);
    }

    pub fn wait_for_a_while(&mut self, id: GoalId) {
        if let Some(g) = self.goals.get_mut(&id) {
            g.record_mut().suspension = Suspension::WantingTime;
        }
        self.wanting_time.insert(id);
    }

    /// Mark `id` terminal and propagate to every waiter (spec §4.C rule 6,
    /// §5 ordering guarantee (i)): each waiter's `nrFailed` is bumped on
    /// failure, and once a waiter's waitees are all accounted for, it is
    /// woken regardless of `wantingAnyGoal` membership.
    pub fn finish_goal(&mut self, id: &GoalId, succeeded: bool) {
        if let Some(g) = self.goals.get_mut(id) {
            g.record_mut().exit = if succeeded { ExitCode::Success } else { ExitCode::Failed };
        }
        let waiters: Vec<GoalId> =
            self.goals.get(id).map(|g| g.record().waiters.iter().cloned().collect()).unwrap_or_default();
        for waiter in waiters {
            let all_done = self
                .goals
                .get_mut(&waiter)
                .map(|g| g.record_mut().waitee_done(id.clone(), succeeded))
                .unwrap_or(false);
            if all_done {
                self.wake(waiter);
            }
        }
        for id in std::mem::take(&mut self.wanting_any_goal) {
            self.wake(id);
        }
    }

    /// Deadlock check (spec §4.C "Deadlock/liveness"): nothing left that
    /// can make progress while top-level goals remain outstanding.
    pub fn is_deadlocked(&self, children_empty: bool) -> bool {
        self.awake.is_empty()
            && children_empty
            && self.wanting_time.is_empty()
            && !self.top_goals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(name: &str) -> StorePath {
        StorePath::from_fingerprint(name, name).unwrap()
    }

    #[test]
    fn the_same_target_never_gets_two_live_substitution_goals() {
        let mut graph = GoalGraph::new();
        let a = graph.get_or_create_substitution(path("x"));
        let b = graph.get_or_create_substitution(path("x"));
        assert_eq!(a, b);
        assert_eq!(graph.goals.len(), 1);
    }

    #[test]
    fn finishing_a_waitee_wakes_a_waiter_once_all_waitees_are_done() {
        let mut graph = GoalGraph::new();
        let waitee_a = graph.get_or_create_substitution(path("a"));
        let waitee_b = graph.get_or_create_substitution(path("b"));
        let waiter = graph.get_or_create_derivation(path("d.drv"));
        graph.awake.clear();
        graph.add_waitee(&waiter, &waitee_a);
        graph.add_waitee(&waiter, &waitee_b);
        graph.wait_for_any_goal(waiter.clone());

        graph.finish_goal(&waitee_a, true);
        assert!(!graph.awake.contains(&waiter));

        graph.finish_goal(&waitee_b, true);
        assert!(graph.awake.contains(&waiter));
    }

    #[test]
    fn deadlock_is_detected_when_nothing_can_progress() {
        let mut graph = GoalGraph::new();
        let g = graph.get_or_create_substitution(path("x"));
        graph.add_top_goal(g.clone());
        graph.awake.clear();
        graph.wait_for_any_goal(g);
        assert!(graph.is_deadlocked(true));
    }
}
