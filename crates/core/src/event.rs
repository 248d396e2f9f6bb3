// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Events: the structured log records a terminal goal emits (spec §7),
//! and the internal signals that drive the Worker loop's wait sets.
//!
//! Serializes with `{"type": "domain:name", ...fields}`, matching the
//! convention used for every other wire-visible record in this workspace.
//! Unknown tags deserialize to `Custom` so a future variant doesn't break
//! a consumer reading an older log line.

use crate::ids::{ChildId, GoalId};
use njd_store::{StorePath, SubstitutablePathInfo};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    // -- terminal, user-visible records (spec §7) --
    #[serde(rename = "build:started")]
    BuildStarted { goal: GoalId, drv: StorePath, primary_output: StorePath },

    #[serde(rename = "build:succeeded")]
    BuildSucceeded { goal: GoalId, drv: StorePath, primary_output: StorePath },

    #[serde(rename = "build:failed")]
    BuildFailed {
        goal: GoalId,
        drv: StorePath,
        primary_output: StorePath,
        status: Option<i32>,
        reason: String,
        /// True when this outcome was served from the failure cache rather
        /// than from a fresh attempt (spec §4.G: "always reported with a
        /// distinct cached marker").
        #[serde(default)]
        cached: bool,
    },

    #[serde(rename = "substituter:started")]
    SubstituterStarted { goal: GoalId, path: StorePath, substituter: String },

    #[serde(rename = "substituter:succeeded")]
    SubstituterSucceeded { goal: GoalId, path: StorePath, substituter: String },

    #[serde(rename = "substituter:failed")]
    SubstituterFailed { goal: GoalId, path: StorePath, substituter: String, reason: String },

    #[serde(rename = "hook:failed")]
    HookFailed { goal: GoalId, drv: StorePath, status: Option<i32>, reason: String },

    // -- internal scheduler signals, never logged at top level --
    #[serde(rename = "child:spawned")]
    ChildSpawned { goal: GoalId, child: ChildId, in_build_slot: bool },

    #[serde(rename = "child:output")]
    ChildOutput { child: ChildId, bytes: usize },

    #[serde(rename = "child:eof")]
    ChildEof { child: ChildId },

    #[serde(rename = "child:exited")]
    ChildExited { child: ChildId, status: Option<i32> },

    #[serde(rename = "goal:finished")]
    GoalFinished { goal: GoalId, succeeded: bool },

    #[serde(rename = "poll:elapsed")]
    PollElapsed,

    #[serde(rename = "user_slot:acquired")]
    UserSlotAcquired { goal: GoalId, lease: crate::effect::UserSlotLease },

    #[serde(rename = "lock:acquired")]
    LockAcquired { goal: GoalId },

    #[serde(rename = "lock:contended")]
    LockContended { goal: GoalId },

    /// A path-lock set is held by a different goal in this very process
    /// (spec §4.B "ownedByMe"); recovered by waiting for that goal to
    /// finish rather than retrying the OS-level flock.
    #[serde(rename = "lock:owned_by_another_goal")]
    LockOwnedByAnotherGoal { goal: GoalId },

    /// No build-user slot was free (spec §4.A); recovered by poll-sleeping
    /// rather than failing the goal outright.
    #[serde(rename = "user_slot:unavailable")]
    UserSlotUnavailable { goal: GoalId },

    #[serde(rename = "hook:outcome")]
    HookOutcome { goal: GoalId, outcome: HookOutcome },

    #[serde(rename = "substituter:queried")]
    SubstituterQueried { goal: GoalId, program: String, info: Option<SubstitutablePathInfo> },

    #[serde(other)]
    Custom,
}

/// The build hook's final word on one derivation (spec §4.E): a verdict,
/// plus, on acceptance, the remote build's exit status once the hook's
/// pipe closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookOutcome {
    Declined,
    Postponed,
    Accepted { status: Option<i32> },
    /// The hook process itself malfunctioned (spawn error, bad handshake,
    /// protocol violation) — distinct from a remote build failure.
    Failed { reason: String },
}

impl Event {
    /// A short one-line summary for the effect/event log span, mirroring
    /// what the Worker writes to its structured log.
    pub fn log_summary(&self) -> String {
        match self {
            Event::BuildStarted { drv, .. } => format!("build-started drv={drv}"),
            Event::BuildSucceeded { drv, .. } => format!("build-succeeded drv={drv}"),
            Event::BuildFailed { drv, reason, cached, .. } => {
                format!("build-failed drv={drv} reason={reason}{}", if *cached { " (cached)" } else { "" })
            }
            Event::SubstituterStarted { path, substituter, .. } => {
                format!("substituter-started path={path} via={substituter}")
            }
            Event::SubstituterSucceeded { path, substituter, .. } => {
                format!("substituter-succeeded path={path} via={substituter}")
            }
            Event::SubstituterFailed { path, substituter, reason, .. } => {
                format!("substituter-failed path={path} via={substituter} reason={reason}")
            }
            Event::HookFailed { drv, reason, .. } => format!("hook-failed drv={drv} reason={reason}"),
            Event::ChildSpawned { goal, child, in_build_slot } => {
                format!("child-spawned goal={goal} pid={child} in_build_slot={in_build_slot}")
            }
            Event::ChildOutput { child, bytes } => format!("child-output pid={child} bytes={bytes}"),
            Event::ChildEof { child } => format!("child-eof pid={child}"),
            Event::ChildExited { child, status } => {
                format!("child-exited pid={child} status={status:?}")
            }
            Event::GoalFinished { goal, succeeded } => format!("goal-finished goal={goal} ok={succeeded}"),
            Event::PollElapsed => "poll-elapsed".to_string(),
            Event::UserSlotAcquired { goal, lease } => {
                format!("user-slot-acquired goal={goal} user={}", lease.user)
            }
            Event::LockAcquired { goal } => format!("lock-acquired goal={goal}"),
            Event::LockContended { goal } => format!("lock-contended goal={goal}"),
            Event::LockOwnedByAnotherGoal { goal } => format!("lock-owned-by-another-goal goal={goal}"),
            Event::UserSlotUnavailable { goal } => format!("user-slot-unavailable goal={goal}"),
            Event::HookOutcome { goal, outcome } => format!("hook-outcome goal={goal} outcome={outcome:?}"),
            Event::SubstituterQueried { goal, program, info } => {
                format!("substituter-queried goal={goal} program={program} hit={}", info.is_some())
            }
            Event::Custom => "custom".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_failed_round_trips_through_json() {
        let event = Event::BuildFailed {
            goal: GoalId::new(),
            drv: StorePath::from_fingerprint("x", "foo.drv").unwrap(),
            primary_output: StorePath::from_fingerprint("y", "foo").unwrap(),
            status: Some(1),
            reason: "bad exit".into(),
            cached: false,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"build:failed\""));
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn unknown_tag_deserializes_to_custom() {
        let event: Event = serde_json::from_str(r#"{"type":"something:new"}"#).unwrap();
        assert_eq!(event, Event::Custom);
    }
}
