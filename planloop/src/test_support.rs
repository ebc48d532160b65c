//! Test-only helpers: a disposable git repository fixture, plan builders,
//! and a loop configuration tuned for fast scripted-agent tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::config::LoopConfig;

/// Relative plan location used by fixtures.
pub const PLAN_REL_PATH: &str = "docs/plans/plan.md";
/// Relative pointer location used by fixtures.
pub const POINTER_REL_PATH: &str = "docs/plans/.active";

/// A throwaway git repository with one initial commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new().context("create temp repo dir")?;
        let repo = Self { dir };
        repo.git(&["init", "--quiet"])?;
        repo.git(&["config", "user.email", "loop@example.invalid"])?;
        repo.git(&["config", "user.name", "Loop Tests"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        repo.write_file("README.md", "# fixture\n")?;
        repo.commit_all("chore: initial commit")?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Run git in the repo, returning trimmed stdout. Errors on failure.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Write a file relative to the repo root, creating parent directories.
    pub fn write_file(&self, rel: &str, contents: &str) -> Result<PathBuf> {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Write an executable `/bin/sh` script relative to the repo root.
    pub fn write_script(&self, rel: &str, body: &str) -> Result<PathBuf> {
        let path = self.write_file(rel, &format!("#!/bin/sh\n{body}"))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("chmod {}", path.display()))?;
        }
        Ok(path)
    }

    /// Write the plan and its pointer file, then commit everything.
    pub fn write_plan(&self, body: &str) -> Result<PathBuf> {
        let plan = self.write_file(PLAN_REL_PATH, body)?;
        self.write_file(POINTER_REL_PATH, &format!("{PLAN_REL_PATH}\n"))?;
        self.commit_all("chore: set up plan")?;
        Ok(plan)
    }

    pub fn read_plan(&self) -> Result<String> {
        fs::read_to_string(self.root().join(PLAN_REL_PATH)).context("read plan")
    }

    pub fn commit_all(&self, message: &str) -> Result<()> {
        self.git(&["add", "-A"])?;
        self.git(&["commit", "--quiet", "-m", message])?;
        Ok(())
    }

    pub fn head_commit(&self) -> Result<String> {
        self.git(&["rev-parse", "HEAD"])
    }

    pub fn commit_count(&self) -> Result<usize> {
        let out = self.git(&["rev-list", "--count", "HEAD"])?;
        out.parse().context("parse commit count")
    }

    /// Number of two-parent commits reachable from HEAD.
    pub fn merge_commit_count(&self) -> Result<usize> {
        let out = self.git(&["rev-list", "--merges", "--count", "HEAD"])?;
        out.parse().context("parse merge commit count")
    }
}

/// A plan with a checklist only (no task breakdown).
pub fn checklist_plan(items: &str) -> String {
    format!("# Test Plan\n\n**Goal:** Test\n\n## Checklist\n\n{items}\n")
}

/// A plan with a task breakdown followed by a checklist.
pub fn task_plan(tasks: &str, items: &str) -> String {
    format!("# Test Plan\n\n**Goal:** Test\n\n## Tasks\n\n{tasks}\n## Checklist\n\n{items}\n")
}

/// One `### Task` section with a single created file and an inline verify.
pub fn task_section(number: u32, title: &str, file: &str, verify: &str) -> String {
    format!(
        "### Task {number}: {title}\n\n**Files:**\n- Create: `{file}`\n\n**Verify:** `{verify}`\n\n"
    )
}

/// Loop configuration tuned for scripted-agent tests: short timeouts,
/// precheck skipped, explicit agent command.
pub fn test_config(agent_cmd: &str) -> LoopConfig {
    LoopConfig {
        agent_command: Some(agent_cmd.to_string()),
        task_timeout_secs: 60,
        heartbeat_interval_secs: 1,
        stall_timeout_secs: 600,
        idle_timeout_secs: 600,
        verify_timeout_secs: 10,
        precheck_timeout_secs: 5,
        grace_period_secs: 1,
        skip_precheck: true,
        ..LoopConfig::default()
    }
}
