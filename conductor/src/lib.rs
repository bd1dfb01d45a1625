//! Task scheduling and git integration engine for coding agents.
//!
//! Tasks live in a JSON tree (`tasks.json`). One work loop per scheduling
//! identity claims the first available task, drives an agent through it in a
//! dedicated git worktree and merges the result under a cross-process lock.
//! The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (availability, status and step
//!   state machines, invariants, session classification). No I/O.
//! - **[`io`]**: Side-effecting adapters (task store, git, agents, locks,
//!   questions). Each seam is a trait so tests can substitute fakes.
//!
//! Orchestration modules ([`scheduler`], [`merge`], [`prime`], [`select`],
//! [`validate`]) coordinate core logic with I/O through an explicit
//! [`context::RunContext`].

pub mod context;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod merge;
pub mod prime;
pub mod scheduler;
pub mod select;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
