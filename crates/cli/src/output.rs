// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal output for the two top-level goal kinds.

use njd_core::GoalId;
use njd_store::StorePath;

pub fn print_goal_requested(kind: &str, target: &StorePath, id: &GoalId) {
    println!("{kind} {target} ({id})");
}

pub fn print_goal_succeeded(target: &StorePath) {
    println!("ok: {target}");
}

pub fn print_goal_failed(target: &StorePath) {
    eprintln!("failed: {target}");
}
