// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! njd-adapters: the I/O layer. Everything in here performs a real side
//! effect — spawning children, taking advisory locks, building a sandbox,
//! talking to a build hook or setuid helper, writing to the metadata
//! store — so that `njd-engine`'s goal state machines can stay pure
//! functions of [`njd_core::Effect`] in, [`njd_core::Event`] out.

pub mod build_hook;
pub mod executor;
pub mod path_lock;
pub mod sandbox;
pub mod setuid_helper;
pub mod subprocess;
pub mod substituter;
pub mod user_slot;

pub use executor::{ExecuteError, Executor};
pub use path_lock::{PathLockError, PathLockManager};
pub use sandbox::{SandboxError, SandboxPlan};
pub use subprocess::{run_with_timeout, SubprocessError};
pub use substituter::SubstituterError;
pub use user_slot::{SlotCandidate, UserSlotError, UserSlotPool};
