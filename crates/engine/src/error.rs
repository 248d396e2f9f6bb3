// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Re-exports the shared error taxonomy (spec §7). It lives in
//! `njd-core` because `njd-adapters` needs to construct it too
//! (a failed effect becomes a `GoalError` at the goal that requested it).

pub use njd_core::error::{GoalError, HookExitStatus};
