// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! njd-core: the domain types shared by every other crate in this
//! workspace — goal bookkeeping, the effect/event vocabulary the engine
//! and adapters speak, identifiers, the testable clock, and engine
//! configuration.
//!
//! This crate holds no I/O. `njd-adapters` performs effects; `njd-engine`
//! owns the actual goal graph and Worker loop built on these types.

pub mod child;
pub mod clock;
pub mod config;
pub mod effect;
pub mod error;
pub mod event;
pub mod goal;
pub mod id;
pub mod ids;
pub mod macros;

pub use child::Child;
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use effect::{ChildKind, Effect, SandboxRequest, UserSlotLease};
pub use error::{GoalError, HookExitStatus};
pub use event::{Event, HookOutcome};
pub use goal::{ExitCode, GoalBehavior, GoalKind, GoalRecord, Suspension};
pub use ids::{ChildId, GoalId};
