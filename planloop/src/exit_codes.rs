//! Stable exit codes for the planloop CLI.

/// The plan completed: every checklist item is checked or skipped.
pub const OK: i32 = 0;
/// Anything else: validation failure, circuit breaker, max iterations,
/// lock contention, or nested invocation.
pub const FAILURE: i32 = 1;
