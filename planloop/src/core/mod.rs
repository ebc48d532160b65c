//! Pure, deterministic logic: plan parsing, batch scheduling, run summaries.

pub mod plan;
pub mod schedule;
pub mod summary;
