//! Loop configuration and orchestrator-owned paths.
//!
//! Configuration is resolved exactly once at startup: defaults, then the
//! optional `.planloop/config.toml`, then environment overrides. The
//! resulting [`LoopConfig`] is immutable and passed explicitly into the
//! controller and its collaborators; nothing reads the environment mid-run.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Environment variable marking that a loop instance spawned this process.
///
/// Set on every child the controller launches; a fresh invocation that sees
/// it refuses to start, so an agent can never transitively re-enter the loop.
pub const NESTED_MARKER: &str = "PLANLOOP_ACTIVE";

/// Loop configuration (TOML, with environment overrides).
///
/// The file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    /// Pointer file naming the active plan.
    pub plan_pointer: PathBuf,

    /// Hard wall-clock ceiling per task attempt, in seconds.
    pub task_timeout_secs: u64,

    /// Heartbeat/progress report interval for sequential supervision, in seconds.
    pub heartbeat_interval_secs: u64,

    /// Terminate a sequential attempt after this long without checklist progress.
    pub stall_timeout_secs: u64,

    /// Terminate a sequential attempt after this long without any output.
    /// Tighter than the stall threshold; catches silent hangs.
    pub idle_timeout_secs: u64,

    /// Timeout for a single verify command, in seconds.
    pub verify_timeout_secs: u64,

    /// Timeout for the environment precheck, in seconds.
    pub precheck_timeout_secs: u64,

    /// Grace window between SIGTERM and SIGKILL when escalating, in seconds.
    pub grace_period_secs: u64,

    /// Maximum workers dispatched in one parallel batch.
    pub max_parallel: usize,

    /// Truncate captured command output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Explicit agent command line (overrides backend probing).
    pub agent_command: Option<String>,

    /// Allow starting with a dirty working tree.
    pub skip_dirty_check: bool,

    /// Skip the environment precheck when building prompts.
    pub skip_precheck: bool,

    /// True when the recursion-guard marker was present at startup.
    ///
    /// Captured here so the controller never re-reads ambient process state.
    #[serde(skip)]
    pub nested_invocation: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            plan_pointer: PathBuf::from("docs/plans/.active"),
            task_timeout_secs: 1800,
            heartbeat_interval_secs: 60,
            stall_timeout_secs: 300,
            idle_timeout_secs: 120,
            verify_timeout_secs: 30,
            precheck_timeout_secs: 60,
            grace_period_secs: 5,
            max_parallel: 4,
            output_limit_bytes: 100_000,
            agent_command: None,
            skip_dirty_check: false,
            skip_precheck: false,
            nested_invocation: false,
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.task_timeout_secs == 0 {
            return Err(anyhow!("task_timeout_secs must be > 0"));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(anyhow!("heartbeat_interval_secs must be > 0"));
        }
        if self.stall_timeout_secs == 0 {
            return Err(anyhow!("stall_timeout_secs must be > 0"));
        }
        if self.idle_timeout_secs == 0 {
            return Err(anyhow!("idle_timeout_secs must be > 0"));
        }
        if self.max_parallel == 0 {
            return Err(anyhow!("max_parallel must be >= 1"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Apply environment overrides via a lookup closure.
    ///
    /// Tests pass a map-backed closure; `main` passes `std::env::var`. This is
    /// the only place environment names are interpreted.
    pub fn apply_env<F>(&mut self, get: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get("PLANLOOP_PLAN_POINTER") {
            self.plan_pointer = PathBuf::from(v);
        }
        if let Some(v) = get("PLANLOOP_TASK_TIMEOUT") {
            self.task_timeout_secs = parse_secs("PLANLOOP_TASK_TIMEOUT", &v)?;
        }
        if let Some(v) = get("PLANLOOP_HEARTBEAT_INTERVAL") {
            self.heartbeat_interval_secs = parse_secs("PLANLOOP_HEARTBEAT_INTERVAL", &v)?;
        }
        if let Some(v) = get("PLANLOOP_STALL_TIMEOUT") {
            self.stall_timeout_secs = parse_secs("PLANLOOP_STALL_TIMEOUT", &v)?;
        }
        if let Some(v) = get("PLANLOOP_IDLE_TIMEOUT") {
            self.idle_timeout_secs = parse_secs("PLANLOOP_IDLE_TIMEOUT", &v)?;
        }
        if let Some(v) = get("PLANLOOP_MAX_PARALLEL") {
            self.max_parallel = v
                .trim()
                .parse()
                .with_context(|| format!("parse PLANLOOP_MAX_PARALLEL '{v}'"))?;
        }
        if let Some(v) = get("PLANLOOP_AGENT_CMD")
            && !v.trim().is_empty()
        {
            self.agent_command = Some(v);
        }
        if flag_set(get("PLANLOOP_SKIP_DIRTY_CHECK")) {
            self.skip_dirty_check = true;
        }
        if flag_set(get("PLANLOOP_SKIP_PRECHECK")) {
            self.skip_precheck = true;
        }
        if flag_set(get(NESTED_MARKER)) {
            self.nested_invocation = true;
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn precheck_timeout(&self) -> Duration {
        Duration::from_secs(self.precheck_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

fn parse_secs(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .with_context(|| format!("parse {name} '{raw}' as seconds"))
}

/// An environment flag counts as set when present and non-empty.
fn flag_set(value: Option<String>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}

/// Load config from a TOML file, falling back to defaults when missing.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// All canonical orchestrator-owned paths for a repository root.
#[derive(Debug, Clone)]
pub struct LoopPaths {
    pub root: PathBuf,
    pub planloop_dir: PathBuf,
    pub config_path: PathBuf,
    pub lock_path: PathBuf,
    pub log_path: PathBuf,
    pub worker_log_dir: PathBuf,
    pub result_path: PathBuf,
    pub worktree_base: PathBuf,
}

impl LoopPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let planloop_dir = root.join(".planloop");
        Self {
            config_path: planloop_dir.join("config.toml"),
            lock_path: planloop_dir.join("lock"),
            log_path: planloop_dir.join("loop.log"),
            worker_log_dir: planloop_dir.join("workers"),
            result_path: planloop_dir.join("result.md"),
            worktree_base: root.join(".worktrees"),
            planloop_dir,
            root,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, LoopConfig::default());
    }

    #[test]
    fn partial_file_fills_remaining_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "task_timeout_secs = 60\nmax_parallel = 2\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.task_timeout_secs, 60);
        assert_eq!(cfg.max_parallel, 2);
        assert_eq!(
            cfg.stall_timeout_secs,
            LoopConfig::default().stall_timeout_secs
        );
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut env = HashMap::new();
        env.insert("PLANLOOP_TASK_TIMEOUT", "90");
        env.insert("PLANLOOP_MAX_PARALLEL", "8");
        env.insert("PLANLOOP_SKIP_DIRTY_CHECK", "1");
        env.insert("PLANLOOP_AGENT_CMD", "echo done");
        env.insert(NESTED_MARKER, "1");

        let mut cfg = LoopConfig::default();
        cfg.apply_env(|key| env.get(key).map(|v| (*v).to_string()))
            .expect("apply env");

        assert_eq!(cfg.task_timeout_secs, 90);
        assert_eq!(cfg.max_parallel, 8);
        assert!(cfg.skip_dirty_check);
        assert!(!cfg.skip_precheck);
        assert_eq!(cfg.agent_command.as_deref(), Some("echo done"));
        assert!(cfg.nested_invocation);
    }

    #[test]
    fn empty_flag_value_is_not_set() {
        let mut cfg = LoopConfig::default();
        cfg.apply_env(|key| (key == "PLANLOOP_SKIP_PRECHECK").then(|| "  ".to_string()))
            .expect("apply env");
        assert!(!cfg.skip_precheck);
    }

    #[test]
    fn bad_numeric_override_errors() {
        let mut cfg = LoopConfig::default();
        let err = cfg
            .apply_env(|key| (key == "PLANLOOP_TASK_TIMEOUT").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PLANLOOP_TASK_TIMEOUT"));
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let cfg = LoopConfig {
            task_timeout_secs: 0,
            ..LoopConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn paths_are_rooted_under_planloop_dir() {
        let paths = LoopPaths::new("/repo");
        assert_eq!(paths.lock_path, PathBuf::from("/repo/.planloop/lock"));
        assert_eq!(paths.result_path, PathBuf::from("/repo/.planloop/result.md"));
        assert_eq!(paths.worktree_base, PathBuf::from("/repo/.worktrees"));
    }
}
