//! Git adapter for the orchestrator.
//!
//! The loop enforces git safety (clean-tree precondition, squash merges,
//! rollback on conflict), so we keep a small, explicit wrapper around `git`
//! subprocess calls. Mutating commands go through a retry policy that only
//! retries transient index-lock contention; every other failure propagates
//! immediately.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Backoff policy for transient "index locked"-class failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// True for failures caused by another process briefly holding the index.
pub fn is_transient_lock_error(message: &str) -> bool {
    message.contains("index.lock") || message.contains("Unable to create")
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    retry: RetryPolicy,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(workdir: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            workdir: workdir.into(),
            retry,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current HEAD commit id.
    pub fn head_commit(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Ensure the worktree is clean, allowing entries with any of the given prefixes.
    #[instrument(skip_all)]
    pub fn ensure_clean_except_prefixes(&self, allowed_prefixes: &[&str]) -> Result<()> {
        let entries = self.status_porcelain()?;
        let mut disallowed = Vec::new();
        for entry in entries {
            if allowed_prefixes
                .iter()
                .any(|prefix| entry.path.starts_with(prefix))
            {
                continue;
            }
            disallowed.push(entry);
        }
        if disallowed.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(disallowed_count = disallowed.len(), "worktree not clean");
        let mut msg = String::new();
        msg.push_str("working tree not clean (disallowed changes):\n");
        for entry in disallowed {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Stage specific paths.
    pub fn add_paths(&self, paths: &[&Path]) -> Result<()> {
        let mut args = vec!["add", "--"];
        let rendered: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        args.extend(rendered.iter().map(String::as_str));
        self.run_checked_retry(&args)?;
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked_retry(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked_retry(&["commit", "-m", message])?;
        Ok(true)
    }

    /// List local branches matching a glob pattern.
    pub fn branch_list(&self, pattern: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["branch", "--list", "--format=%(refname:short)", pattern])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Run a mutating git command, retrying transient index-lock contention
    /// with exponential backoff. All other failures propagate immediately.
    #[instrument(skip_all, fields(cmd = %args.join(" ")))]
    pub fn run_checked_retry(&self, args: &[&str]) -> Result<Output> {
        let mut attempt = 0u32;
        loop {
            let output = self.run(args)?;
            if output.status.success() {
                return Ok(output);
            }
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let combined = format!("{}{}", stderr, String::from_utf8_lossy(&output.stdout));
            if is_transient_lock_error(&combined) && attempt < self.retry.max_retries {
                let delay = self.retry.base_delay * 2u32.saturating_pow(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, "git index locked, retrying");
                thread::sleep(delay);
                attempt += 1;
                continue;
            }
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            ));
        }
    }

    pub fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    pub fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert_eq!(
            e,
            StatusEntry {
                code: "??".to_string(),
                path: "foo.txt".to_string()
            }
        );
    }

    #[test]
    fn parses_modified_line() {
        let e = parse_status_line(" M src/main.rs").expect("parse");
        assert_eq!(e.code, " M");
        assert_eq!(e.path, "src/main.rs");
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn transient_classification_only_matches_lock_errors() {
        assert!(is_transient_lock_error(
            "fatal: Unable to create '/repo/.git/index.lock': File exists"
        ));
        assert!(!is_transient_lock_error("fatal: not a git repository"));
        assert!(!is_transient_lock_error("merge conflict in a.rs"));
    }

    #[test]
    fn non_transient_failure_does_not_retry() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        let err = git
            .run_checked_retry(&["checkout", "no-such-branch"])
            .unwrap_err();
        assert!(err.to_string().contains("git checkout"));
    }

    #[test]
    fn clean_check_allows_listed_prefixes() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        repo.write_file(".planloop/loop.log", "noise").expect("write");
        repo.write_file("untracked.txt", "dirt").expect("write");

        git.ensure_clean_except_prefixes(&[".planloop", "untracked.txt"])
            .expect("allowed prefixes");
        let err = git.ensure_clean_except_prefixes(&[".planloop"]).unwrap_err();
        assert!(err.to_string().contains("untracked.txt"));
    }

    #[test]
    fn commit_staged_skips_when_nothing_staged() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.root());
        assert!(!git.commit_staged("chore: empty").expect("commit"));

        repo.write_file("new.txt", "content").expect("write");
        git.add_all().expect("add");
        assert!(git.commit_staged("chore: add file").expect("commit"));
    }
}
