//! File-backed plan document.
//!
//! Wraps the pure [`Plan`](crate::core::plan::Plan) snapshot with load,
//! reload, and the two mutations the orchestrator performs: checking off a
//! verified task and the broad verify-everything pass. Spawned agents edit
//! the same file, so the snapshot may go stale at any time; callers reload
//! before trusting it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::plan::{ItemState, Plan, TaskRecord, rewrite_item_state};
use crate::io::process::run_shell_with_timeout;

/// Outcome of one inline verify attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyAttempt {
    /// Checklist position (zero-based) of the verified item.
    pub position: usize,
    pub command: String,
    pub passed: bool,
}

#[derive(Debug)]
pub struct PlanFile {
    path: PathBuf,
    plan: Plan,
}

impl PlanFile {
    /// Load the plan from disk. A missing file parses as an empty plan.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = read_or_empty(&path)?;
        Ok(Self {
            path,
            plan: Plan::parse(text),
        })
    }

    /// Re-read the backing file, replacing the snapshot.
    pub fn reload(&mut self) -> Result<()> {
        let text = read_or_empty(&self.path)?;
        self.plan = Plan::parse(text);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn checked(&self) -> usize {
        self.plan.checked()
    }

    pub fn unchecked(&self) -> usize {
        self.plan.unchecked()
    }

    pub fn skipped(&self) -> usize {
        self.plan.skipped()
    }

    pub fn total(&self) -> usize {
        self.plan.total()
    }

    pub fn is_complete(&self) -> bool {
        self.plan.is_complete()
    }

    pub fn next_unchecked(&self, n: usize) -> Vec<String> {
        self.plan.next_unchecked(n)
    }

    pub fn unchecked_tasks(&self) -> Vec<TaskRecord> {
        self.plan.unchecked_tasks()
    }

    pub fn tasks_aligned(&self) -> bool {
        self.plan.tasks_aligned()
    }

    /// Sibling progress log derived from the plan's own path.
    pub fn progress_path(&self) -> PathBuf {
        self.sibling("progress.md")
    }

    /// Sibling findings log derived from the plan's own path.
    pub fn findings_path(&self) -> PathBuf {
        self.sibling("findings.md")
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "plan".to_string());
        self.path
            .with_file_name(format!("{stem}.{suffix}"))
    }

    /// Flip the checklist item linked to `task_number` from unchecked to
    /// checked and persist.
    ///
    /// Returns whether a flip occurred. An unresolvable task↔item mapping
    /// or an already-resolved item both report `false`; neither is an error.
    #[instrument(skip_all, fields(task_number))]
    pub fn check_off(&mut self, task_number: u32) -> Result<bool> {
        let Some(task_idx) = self
            .plan
            .tasks()
            .iter()
            .position(|t| t.number == task_number)
        else {
            warn!(task_number, "no such task in plan");
            return Ok(false);
        };
        let Some(item_idx) = self.plan.item_index_for_task(task_idx) else {
            warn!(task_number, "task has no resolvable checklist item");
            return Ok(false);
        };
        if self.plan.items()[item_idx].state != ItemState::Unchecked {
            return Ok(false);
        }
        let rewritten = rewrite_item_state(self.plan.text(), item_idx, ItemState::Checked)
            .ok_or_else(|| anyhow!("checklist item {item_idx} out of range"))?;
        self.persist(rewritten)?;
        debug!(task_number, item_idx, "checked off task");
        Ok(true)
    }

    /// Run the inline verify command of every currently-unchecked item in
    /// `workdir`; flip the ones that pass and persist.
    ///
    /// Used after merges so a worker's self-report is never trusted.
    #[instrument(skip_all)]
    pub fn verify_and_check_all(
        &mut self,
        workdir: &Path,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Result<Vec<VerifyAttempt>> {
        let candidates: Vec<(usize, String)> = self
            .plan
            .items()
            .iter()
            .enumerate()
            .filter(|(_, item)| item.state == ItemState::Unchecked)
            .filter_map(|(idx, item)| item.verify.clone().map(|cmd| (idx, cmd)))
            .collect();

        let mut attempts = Vec::new();
        let mut text = self.plan.text().to_string();
        let mut flipped = false;

        for (position, command) in candidates {
            let passed = match run_shell_with_timeout(&command, workdir, timeout, output_limit_bytes)
            {
                Ok(output) => output.success(),
                Err(err) => {
                    warn!(position, %command, %err, "verify command failed to run");
                    false
                }
            };
            if passed {
                // Flipping a marker never changes item positions, so the
                // indices collected above stay valid.
                if let Some(rewritten) = rewrite_item_state(&text, position, ItemState::Checked) {
                    text = rewritten;
                    flipped = true;
                }
            }
            attempts.push(VerifyAttempt {
                position,
                command,
                passed,
            });
        }

        if flipped {
            self.persist(text)?;
        }
        Ok(attempts)
    }

    fn persist(&mut self, text: String) -> Result<()> {
        write_atomic(&self.path, &text)?;
        self.plan = Plan::parse(text);
        Ok(())
    }
}

fn read_or_empty(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))
}

/// Atomically replace the plan (temp file + rename).
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("plan path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("md.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp plan {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace plan {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASK_PLAN: &str = "\
# Test Plan

## Tasks

### Task 1: Alpha

- Create: `a.txt`

**Verify:** `test -f a.txt`

### Task 2: Beta

- Create: `b.txt`

**Verify:** `test -f b.txt`

## Checklist

- [ ] alpha | `test -f a.txt`
- [ ] beta | `test -f b.txt`
";

    fn write_plan(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("plan.md");
        fs::write(&path, body).expect("write plan");
        path
    }

    #[test]
    fn reload_reflects_external_modification() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_plan(temp.path(), "- [ ] one\n- [ ] two\n");
        let mut plan = PlanFile::load(&path).expect("load");
        assert_eq!(plan.unchecked(), 2);

        fs::write(&path, "- [x] one\n- [ ] two\n").expect("rewrite");
        assert_eq!(plan.unchecked(), 2, "snapshot is stable until reload");
        plan.reload().expect("reload");
        assert_eq!(plan.unchecked(), 1);
        assert_eq!(plan.checked(), 1);
    }

    #[test]
    fn sibling_paths_derive_from_plan_stem() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_plan(temp.path(), "- [ ] one\n");
        let plan = PlanFile::load(&path).expect("load");
        assert!(
            plan.progress_path()
                .to_string_lossy()
                .ends_with("plan.progress.md")
        );
        assert!(
            plan.findings_path()
                .to_string_lossy()
                .ends_with("plan.findings.md")
        );
    }

    #[test]
    fn check_off_flips_and_persists() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_plan(temp.path(), TASK_PLAN);
        let mut plan = PlanFile::load(&path).expect("load");

        assert!(plan.check_off(2).expect("check off"));
        assert_eq!(plan.checked(), 1);
        let on_disk = fs::read_to_string(&path).expect("read");
        assert!(on_disk.contains("- [x] beta"));
        assert!(on_disk.contains("- [ ] alpha"));

        // Second flip of the same task is a no-op.
        assert!(!plan.check_off(2).expect("repeat"));
    }

    #[test]
    fn check_off_refuses_unresolvable_mapping() {
        let text = "\
### Task 1: Alpha
- Create: `a.txt`
## Checklist
- [ ] alpha
- [ ] extra
";
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_plan(temp.path(), text);
        let mut plan = PlanFile::load(&path).expect("load");
        assert!(!plan.check_off(1).expect("mismatched counts never guess"));
        assert_eq!(plan.checked(), 0);
    }

    #[test]
    fn verify_and_check_all_flips_only_passing_items() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "present").expect("write");
        let path = write_plan(temp.path(), TASK_PLAN);
        let mut plan = PlanFile::load(&path).expect("load");

        let attempts = plan
            .verify_and_check_all(temp.path(), Duration::from_secs(5), 10_000)
            .expect("verify");

        assert_eq!(attempts.len(), 2);
        assert!(attempts[0].passed, "a.txt exists");
        assert!(!attempts[1].passed, "b.txt missing");
        assert_eq!(plan.checked(), 1);
        assert_eq!(plan.unchecked(), 1);
        let on_disk = fs::read_to_string(&path).expect("read");
        assert!(on_disk.contains("- [x] alpha"));
        assert!(on_disk.contains("- [ ] beta"));
    }

    #[test]
    fn verify_and_check_all_skips_items_without_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_plan(temp.path(), "- [ ] no command here\n- [x] done | `true`\n");
        let mut plan = PlanFile::load(&path).expect("load");
        let attempts = plan
            .verify_and_check_all(temp.path(), Duration::from_secs(5), 10_000)
            .expect("verify");
        assert!(attempts.is_empty());
        assert_eq!(plan.unchecked(), 1);
    }

    #[test]
    fn missing_plan_file_parses_as_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = PlanFile::load(temp.path().join("absent.md")).expect("load");
        assert_eq!(plan.total(), 0);
        assert!(plan.is_complete());
    }
}
