// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The goal abstraction shared by the two goal kinds (spec §3 `Goal`,
//! §9 "virtual dispatch for goal state").
//!
//! `njd-engine` owns the actual goal graph (strong ownership of waitees,
//! weak back-references for waiters, per spec §9's "cyclic ownership"
//! note); this crate only fixes the shared bookkeeping fields and the
//! lifecycle contract every goal kind implements.

use crate::effect::Effect;
use crate::ids::{ChildId, GoalId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A goal's terminal status. `Busy` is not terminal; a goal in any wait
/// set is still `Busy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitCode {
    Busy,
    Success,
    Failed,
}

impl ExitCode {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExitCode::Busy)
    }
}

/// Which goal cache a goal belongs to (spec §4.C "at-most-one-goal-per
/// -target", one cache per kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GoalKind {
    Substitution,
    Derivation,
}

/// Which of the Worker's four wait sets a suspended goal currently
/// belongs to (spec §4.C, §5 "Suspension points"). A goal not suspended
/// is in `Awake`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspension {
    Awake,
    WantingBuildSlot,
    WantingAnyGoal,
    WantingTime,
}

/// Bookkeeping shared by every goal, regardless of kind (spec §3 `Goal`).
///
/// `waitees`/`waiters` here are bare [`GoalId`]s: the engine crate is
/// responsible for the actual owning/non-owning edges (`Rc` vs `Weak`)
/// that back them; this record exists so a state handler can reason about
/// "have all my waitees finished" without reaching into the engine's
/// storage.
#[derive(Debug, Clone)]
pub struct GoalRecord {
    pub id: GoalId,
    pub name: String,
    pub waitees: BTreeSet<GoalId>,
    pub waiters: BTreeSet<GoalId>,
    pub nr_failed: u32,
    pub exit: ExitCode,
    pub suspension: Suspension,
}

impl GoalRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: GoalId::new(),
            name: name.into(),
            waitees: BTreeSet::new(),
            waiters: BTreeSet::new(),
            nr_failed: 0,
            exit: ExitCode::Busy,
            suspension: Suspension::Awake,
        }
    }

    pub fn add_waitee(&mut self, waitee: GoalId) {
        self.waitees.insert(waitee);
    }

    /// Record that one waitee finished; returns true once every waitee
    /// this goal was tracking has reported in.
    pub fn waitee_done(&mut self, waitee: GoalId, succeeded: bool) -> bool {
        self.waitees.remove(&waitee);
        if !succeeded {
            self.nr_failed += 1;
        }
        self.waitees.is_empty()
    }
}

/// The lifecycle protocol both goal kinds implement (spec §9 "virtual
/// dispatch for goal state"): a sum type over the two concrete kinds with
/// a common interface, per-variant state held in each variant's own
/// struct.
pub trait GoalBehavior {
    /// Run the current state handler exactly once. Returns the effects to
    /// perform; the goal's own `GoalRecord` (exit code, suspension) is
    /// updated as a side effect of running the handler.
    fn work(&mut self) -> Vec<Effect>;

    /// Cooperative cancellation: kill any owned child and transition to
    /// `Failed` (spec §4.C "Cancellation", §5).
    fn cancel(&mut self) -> Vec<Effect>;

    fn handle_child_output(&mut self, child: ChildId, bytes: usize) -> Vec<Effect>;

    /// EOF handlers are expected to wake the goal themselves (spec §5).
    fn handle_child_eof(&mut self, child: ChildId) -> Vec<Effect>;

    fn record(&self) -> &GoalRecord;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waitee_done_reports_when_all_waitees_cleared() {
        let mut goal = GoalRecord::new("test");
        let a = GoalId::new();
        let b = GoalId::new();
        goal.add_waitee(a.clone());
        goal.add_waitee(b.clone());
        assert!(!goal.waitee_done(a, true));
        assert!(goal.waitee_done(b, false));
        assert_eq!(goal.nr_failed, 1);
    }
}
