// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-child-process bookkeeping the Worker loop needs to multiplex
//! readiness and enforce the silence timeout (spec §3 `Child`, §4.C).

use crate::ids::{ChildId, GoalId};
use std::time::Instant;

/// A child process the Worker is monitoring. `owner` is a non-owning
/// reference: the goal owns the child, not the other way around.
#[derive(Debug, Clone)]
pub struct Child {
    pub id: ChildId,
    pub owner: GoalId,
    pub in_build_slot: bool,
    pub last_output: Instant,
}

impl Child {
    pub fn new(id: ChildId, owner: GoalId, in_build_slot: bool, started_at: Instant) -> Self {
        Self { id, owner, in_build_slot, last_output: started_at }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_output = now;
    }

    pub fn is_silent_past(&self, now: Instant, max_silent: std::time::Duration) -> bool {
        now.saturating_duration_since(self.last_output) >= max_silent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn silence_detection_respects_threshold() {
        let t0 = Instant::now();
        let child = Child::new(1, GoalId::new(), true, t0);
        assert!(!child.is_silent_past(t0 + Duration::from_secs(1), Duration::from_secs(5)));
        assert!(child.is_silent_past(t0 + Duration::from_secs(6), Duration::from_secs(5)));
    }
}
