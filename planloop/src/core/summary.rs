//! Run summary rendering.
//!
//! Every terminal outcome persists a summary so the result of a run is
//! observable without scrolling logs.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Terminal outcome of a loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every checklist item is checked or skipped.
    Complete,
    /// The circuit breaker tripped after repeated no-progress iterations.
    CircuitBroken,
    /// The iteration budget ran out with items still unchecked.
    MaxIterationsReached,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Complete => crate::exit_codes::OK,
            RunStatus::CircuitBroken | RunStatus::MaxIterationsReached => crate::exit_codes::FAILURE,
        }
    }

    fn label(self) -> &'static str {
        match self {
            RunStatus::Complete => "complete",
            RunStatus::CircuitBroken => "circuit breaker",
            RunStatus::MaxIterationsReached => "max iterations reached",
        }
    }
}

/// Snapshot persisted at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub plan_path: PathBuf,
    pub completed: usize,
    pub remaining: usize,
    pub skipped: usize,
    pub finished_at: DateTime<Utc>,
    /// Raw checklist lines still unchecked, for a quick glance.
    pub remaining_preview: Vec<String>,
}

impl RunSummary {
    pub fn render_markdown(&self) -> String {
        let verdict = if self.status == RunStatus::Complete {
            "SUCCESS"
        } else {
            "FAILED"
        };
        let mut lines = vec![
            "# Plan Loop Result".to_string(),
            String::new(),
            format!("- Status: {verdict} (exit {})", self.status.exit_code()),
            format!("- Outcome: {}", self.status.label()),
            format!("- Plan: {}", self.plan_path.display()),
            format!("- Completed: {}", self.completed),
            format!("- Remaining: {}", self.remaining),
            format!("- Skipped: {}", self.skipped),
            format!("- Finished: {}", self.finished_at.to_rfc3339()),
        ];
        if !self.remaining_preview.is_empty() {
            lines.push(String::new());
            lines.push("## Remaining Items".to_string());
            lines.extend(self.remaining_preview.iter().cloned());
        }
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(status: RunStatus, remaining: usize) -> RunSummary {
        RunSummary {
            status,
            plan_path: PathBuf::from("docs/plans/plan.md"),
            completed: 1,
            remaining,
            skipped: 0,
            finished_at: Utc::now(),
            remaining_preview: if remaining > 0 {
                vec!["- [ ] leftover".to_string()]
            } else {
                Vec::new()
            },
        }
    }

    #[test]
    fn complete_summary_reports_success() {
        let rendered = summary(RunStatus::Complete, 0).render_markdown();
        assert!(rendered.contains("SUCCESS"));
        assert!(rendered.contains("Completed: 1"));
        assert!(!rendered.contains("Remaining Items"));
    }

    #[test]
    fn circuit_breaker_summary_reports_failure_and_preview() {
        let rendered = summary(RunStatus::CircuitBroken, 1).render_markdown();
        assert!(rendered.contains("FAILED"));
        assert!(rendered.contains("circuit breaker"));
        assert!(rendered.contains("- [ ] leftover"));
    }

    #[test]
    fn exit_codes_are_zero_only_for_complete() {
        assert_eq!(RunStatus::Complete.exit_code(), 0);
        assert_eq!(RunStatus::CircuitBroken.exit_code(), 1);
        assert_eq!(RunStatus::MaxIterationsReached.exit_code(), 1);
    }
}
