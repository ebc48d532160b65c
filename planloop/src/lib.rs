//! Conflict-aware plan execution loop for coding agents.
//!
//! This crate keeps restarting an external coding-agent process against a
//! markdown plan until every checklist item is resolved, dispatching
//! independent tasks in parallel when their declared file sets cannot
//! conflict. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (plan parsing, batch scheduling,
//!   summary rendering). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (git, worktrees, locking, process
//!   supervision, prompts). Isolated to enable scripted agents in tests.
//!
//! [`controller`] coordinates core logic with I/O to implement the main
//! dispatch → await → evaluate loop with its circuit breaker and watchdogs.

pub mod config;
pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
