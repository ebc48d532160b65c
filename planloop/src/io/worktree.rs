//! Sandboxed working copies for parallel task attempts.
//!
//! Each task attempt gets a git worktree on a dedicated branch. Successful
//! attempts are integrated with a squash merge (one resulting commit, never
//! a two-parent merge commit), and the plan directory is restored to its
//! pre-merge state first: the orchestrator, not the worker, is the sole
//! writer of plan state. A conflicting merge rolls the main line back to the
//! prior commit and reports failure, never a partial application.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::io::git::Git;

const DIR_PREFIX: &str = "planloop-";
const BRANCH_PREFIX: &str = "planloop-worker-";

#[derive(Debug, Clone)]
pub struct WorktreeManager {
    git: Git,
    base_dir: PathBuf,
    /// Repo-relative directory shielded from merges (plan + pointer + logs).
    plan_dir: Option<String>,
}

impl WorktreeManager {
    pub fn new(root: impl Into<PathBuf>, base_dir: impl Into<PathBuf>, plan_dir: Option<String>) -> Self {
        Self {
            git: Git::new(root),
            base_dir: base_dir.into(),
            plan_dir,
        }
    }

    pub fn worktree_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{DIR_PREFIX}{name}"))
    }

    fn branch_name(name: &str) -> String {
        format!("{BRANCH_PREFIX}{name}")
    }

    /// Provision a sandbox on a fresh branch derived from `name`.
    ///
    /// Idempotent: an existing sandbox with the same name is torn down first.
    #[instrument(skip_all, fields(name))]
    pub fn create(&self, name: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("create worktree base {}", self.base_dir.display()))?;
        let path = self.worktree_path(name);
        if path.exists() {
            debug!(path = %path.display(), "replacing existing sandbox");
            self.remove(name);
        }
        let branch = Self::branch_name(name);
        let path_str = path.display().to_string();
        self.git
            .run_checked_retry(&["worktree", "add", &path_str, "-B", &branch])?;
        debug!(path = %path.display(), %branch, "sandbox created");
        Ok(path)
    }

    /// Integrate a sandbox branch into the main line via a squash merge.
    ///
    /// Returns `Ok(false)` when the merge conflicts; the main line is then
    /// hard-reset to the commit it was on before the attempt.
    #[instrument(skip_all, fields(name))]
    pub fn merge(&self, name: &str) -> Result<bool> {
        let branch = Self::branch_name(name);
        let prior = self.git.head_commit()?;

        let merge = self.git.run(&["merge", "--squash", &branch])?;
        if !merge.status.success() {
            warn!(%branch, "squash merge conflicted, rolling back");
            let _ = self.git.run(&["merge", "--abort"]);
            self.git.run_checked(&["reset", "--hard", &prior])?;
            return Ok(false);
        }

        if let Some(plan_dir) = &self.plan_dir {
            // Drop whatever the worker staged under the plan directory,
            // including files it added. Errors only mean the directory has
            // no tracked content yet.
            let _ = self.git.run(&[
                "restore",
                "--source=HEAD",
                "--staged",
                "--worktree",
                "--",
                plan_dir,
            ]);
        }

        match self
            .git
            .commit_staged(&format!("feat: integrate {name} (squash)"))
        {
            Ok(_) => Ok(true),
            Err(err) => {
                warn!(%branch, %err, "squash commit failed, rolling back");
                self.git.run_checked(&["reset", "--hard", &prior])?;
                Ok(false)
            }
        }
    }

    /// Tear down a sandbox and its branch. Idempotent, best effort.
    #[instrument(skip_all, fields(name))]
    pub fn remove(&self, name: &str) {
        let path = self.worktree_path(name);
        let path_str = path.display().to_string();
        let _ = self
            .git
            .run(&["worktree", "remove", "--force", &path_str]);
        if path.exists()
            && let Err(err) = fs::remove_dir_all(&path)
        {
            warn!(path = %path.display(), %err, "failed to delete sandbox directory");
        }
        let branch = Self::branch_name(name);
        let _ = self.git.run(&["branch", "-D", &branch]);
    }

    /// Reconcile leftovers from a previous aborted run.
    ///
    /// Removes sandbox directories whether or not version control still
    /// knows about them, prunes worktree metadata, and deletes worker
    /// branches whose expected sandbox no longer exists.
    #[instrument(skip_all)]
    pub fn cleanup_stale(&self) -> Result<()> {
        let _ = self.git.run(&["worktree", "prune"]);

        if self.base_dir.exists() {
            for entry in fs::read_dir(&self.base_dir)
                .with_context(|| format!("read {}", self.base_dir.display()))?
            {
                let entry = entry?;
                let file_name = entry.file_name();
                let Some(dir_name) = file_name.to_str() else {
                    continue;
                };
                if !entry.path().is_dir() || !dir_name.starts_with(DIR_PREFIX) {
                    continue;
                }
                let path_str = entry.path().display().to_string();
                let _ = self
                    .git
                    .run(&["worktree", "remove", "--force", &path_str]);
                if entry.path().exists()
                    && let Err(err) = fs::remove_dir_all(entry.path())
                {
                    warn!(path = %path_str, %err, "failed to delete stale sandbox");
                }
            }
        }
        let _ = self.git.run(&["worktree", "prune"]);

        for branch in self.git.branch_list(&format!("{BRANCH_PREFIX}*"))? {
            let Some(name) = branch.strip_prefix(BRANCH_PREFIX) else {
                continue;
            };
            if !self.worktree_path(name).exists() {
                debug!(%branch, "deleting orphaned worker branch");
                let _ = self.git.run(&["branch", "-D", &branch]);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    fn manager(repo: &TestRepo) -> WorktreeManager {
        WorktreeManager::new(
            repo.root(),
            repo.root().join(".worktrees"),
            Some("docs/plans".to_string()),
        )
    }

    #[test]
    fn create_is_idempotent() {
        let repo = TestRepo::new().expect("repo");
        let mgr = manager(&repo);

        let first = mgr.create("w1-i1").expect("create");
        assert!(first.join("README.md").exists());
        let second = mgr.create("w1-i1").expect("recreate");
        assert_eq!(first, second);
        assert!(second.exists());
    }

    #[test]
    fn squash_merge_adds_exactly_one_commit_and_no_merge_commit() {
        let repo = TestRepo::new().expect("repo");
        let mgr = manager(&repo);

        let wt = mgr.create("w1-i1").expect("create");
        std::fs::write(wt.join("feature.txt"), "done\n").expect("write");
        let worker_git = Git::new(&wt);
        worker_git.add_all().expect("add");
        assert!(worker_git.commit_staged("feat: add feature").expect("commit"));

        let before = repo.commit_count().expect("count");
        assert!(mgr.merge("w1-i1").expect("merge"));
        assert_eq!(repo.commit_count().expect("count"), before + 1);
        assert_eq!(repo.merge_commit_count().expect("merges"), 0);
        assert!(repo.root().join("feature.txt").exists());
        mgr.remove("w1-i1");
    }

    #[test]
    fn conflicting_merge_rolls_back_to_prior_commit() {
        let repo = TestRepo::new().expect("repo");
        repo.write_file("contested.txt", "base\n").expect("write");
        repo.commit_all("chore: add contested file").expect("commit");
        let mgr = manager(&repo);

        let wt = mgr.create("w1-i1").expect("create");
        std::fs::write(wt.join("contested.txt"), "worker version\n").expect("write");
        let worker_git = Git::new(&wt);
        worker_git.add_all().expect("add");
        assert!(worker_git.commit_staged("feat: worker edit").expect("commit"));

        repo.write_file("contested.txt", "mainline version\n")
            .expect("write");
        repo.commit_all("feat: mainline edit").expect("commit");
        let prior = repo.head_commit().expect("head");

        assert!(!mgr.merge("w1-i1").expect("merge should report conflict"));
        assert_eq!(repo.head_commit().expect("head"), prior);
        let contents =
            std::fs::read_to_string(repo.root().join("contested.txt")).expect("read");
        assert_eq!(contents, "mainline version\n");

        mgr.remove("w1-i1");
        assert!(
            repo.git(&["status", "--porcelain"]).expect("status").is_empty(),
            "tracked state must be byte-identical to before the attempt"
        );
    }

    #[test]
    fn merge_never_applies_worker_changes_to_the_plan_directory() {
        let repo = TestRepo::new().expect("repo");
        repo.write_plan("# Plan\n\n## Checklist\n\n- [ ] item\n")
            .expect("plan");
        let mgr = manager(&repo);

        let wt = mgr.create("w1-i1").expect("create");
        std::fs::write(
            wt.join("docs/plans/plan.md"),
            "# Plan\n\n## Checklist\n\n- [x] item\n",
        )
        .expect("edit plan");
        std::fs::write(wt.join("docs/plans/sneaky.md"), "added by worker\n").expect("write");
        std::fs::write(wt.join("real-work.txt"), "payload\n").expect("write");
        let worker_git = Git::new(&wt);
        worker_git.add_all().expect("add");
        assert!(worker_git.commit_staged("feat: work plus plan edit").expect("commit"));

        assert!(mgr.merge("w1-i1").expect("merge"));
        assert!(repo.root().join("real-work.txt").exists());
        assert!(
            repo.read_plan().expect("plan").contains("- [ ] item"),
            "worker's checklist edit must not reach the main line"
        );
        assert!(
            !repo.root().join("docs/plans/sneaky.md").exists(),
            "worker-added plan files must not reach the main line"
        );
        mgr.remove("w1-i1");
    }

    #[test]
    fn cleanup_stale_removes_orphan_directories_and_branches() {
        let repo = TestRepo::new().expect("repo");
        let mgr = manager(&repo);

        mgr.create("w1-i1").expect("create");
        mgr.create("w2-i1").expect("create");
        // An unregistered directory left behind by a killed run.
        std::fs::create_dir_all(repo.root().join(".worktrees/planloop-zombie"))
            .expect("mkdir");

        mgr.cleanup_stale().expect("cleanup");

        assert!(!mgr.worktree_path("w1-i1").exists());
        assert!(!mgr.worktree_path("w2-i1").exists());
        assert!(!repo.root().join(".worktrees/planloop-zombie").exists());
        let branches = Git::new(repo.root())
            .branch_list("planloop-worker-*")
            .expect("branches");
        assert!(branches.is_empty(), "stale branches: {branches:?}");
    }

    #[test]
    fn remove_is_idempotent() {
        let repo = TestRepo::new().expect("repo");
        let mgr = manager(&repo);
        mgr.create("w1-i1").expect("create");
        mgr.remove("w1-i1");
        mgr.remove("w1-i1");
        assert!(!mgr.worktree_path("w1-i1").exists());
    }
}
