//! The orchestration controller.
//!
//! Drives the dispatch → await → evaluate loop: reload the plan, compute
//! conflict-free batches, dispatch the leading batch (parallel workers in
//! sandboxes, or one supervised sequential agent), integrate results, and
//! repeat until the plan completes, the circuit breaker trips, or the
//! iteration budget runs out.

use std::fs::{self, File};
use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::config::{LoopConfig, LoopPaths, NESTED_MARKER};
use crate::core::plan::TaskRecord;
use crate::core::schedule::{Batch, build_batches};
use crate::core::summary::{RunStatus, RunSummary};
use crate::io::agent::{AgentCommand, resolve_agent};
use crate::io::git::Git;
use crate::io::lock::ExclusiveLock;
use crate::io::plan_file::PlanFile;
use crate::io::precheck::run_precheck;
use crate::io::process::{
    ChildRegistry, POLL_INTERVAL, escalate_group_kill, run_shell_with_timeout, spawn_in_group,
};
use crate::io::prompt::PromptEngine;
use crate::io::pty::{PtyProcess, spawn_unbuffered};
use crate::io::worktree::WorktreeManager;

/// Consecutive no-progress iterations tolerated before the circuit breaker
/// aborts the run.
pub const MAX_STALE_ROUNDS: u32 = 3;

/// How many unchecked items the run summary previews.
const SUMMARY_PREVIEW_ITEMS: usize = 50;

#[derive(Debug)]
pub struct Controller {
    cfg: LoopConfig,
    paths: LoopPaths,
    plan: PlanFile,
    /// Plan path as written in the pointer file, used in prompts.
    plan_display: String,
    plan_dir_rel: String,
    git: Git,
    worktrees: WorktreeManager,
    lock: ExclusiveLock,
    registry: ChildRegistry,
    cancel: Arc<AtomicBool>,
    agent: AgentCommand,
    prompts: PromptEngine,
    max_iterations: u32,
}

struct Worker {
    name: String,
    task: TaskRecord,
    child: Child,
    deadline: Instant,
    status: Option<ExitStatus>,
}

impl Controller {
    /// Validate preconditions, acquire the exclusive lock, install signal
    /// flags, and reconcile stale sandboxes.
    ///
    /// Every validation failure here is fatal: reported, exit 1, no work
    /// begun.
    #[instrument(skip_all)]
    pub fn init(root: impl Into<PathBuf>, cfg: LoopConfig, max_iterations: u32) -> Result<Self> {
        cfg.validate()?;
        if cfg.nested_invocation {
            bail!("nested invocation detected: refusing to run inside a spawned agent");
        }
        let root = root.into();
        let paths = LoopPaths::new(&root);

        let pointer = if cfg.plan_pointer.is_absolute() {
            cfg.plan_pointer.clone()
        } else {
            root.join(&cfg.plan_pointer)
        };
        if !pointer.exists() {
            bail!(
                "no active plan: pointer {} not found",
                pointer.display()
            );
        }
        let plan_display = fs::read_to_string(&pointer)
            .with_context(|| format!("read pointer {}", pointer.display()))?
            .trim()
            .to_string();
        if plan_display.is_empty() {
            bail!("pointer {} is empty", pointer.display());
        }
        let plan_path = if PathBuf::from(&plan_display).is_absolute() {
            PathBuf::from(&plan_display)
        } else {
            root.join(&plan_display)
        };
        if !plan_path.exists() {
            bail!("plan file not found: {}", plan_path.display());
        }

        let plan = PlanFile::load(&plan_path)?;
        if plan.total() == 0 {
            bail!("plan has no checklist items: add a ## Checklist section first");
        }

        let git = Git::new(&root);
        if !cfg.skip_dirty_check {
            git.ensure_clean_except_prefixes(&[".planloop", ".worktrees"])
                .context("dirty working tree (commit or stash, or set PLANLOOP_SKIP_DIRTY_CHECK)")?;
        }

        let mut lock = ExclusiveLock::new(&paths.lock_path);
        if !lock.try_acquire()? {
            bail!(
                "another instance already holds {}",
                paths.lock_path.display()
            );
        }

        let cancel = Arc::new(AtomicBool::new(false));
        #[cfg(unix)]
        {
            signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&cancel))
                .context("register SIGTERM handler")?;
            signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&cancel))
                .context("register SIGINT handler")?;
        }

        let plan_dir_rel = plan_path
            .parent()
            .and_then(|dir| dir.strip_prefix(&root).ok())
            .map(|dir| dir.display().to_string())
            .filter(|dir| !dir.is_empty())
            .unwrap_or_else(|| "docs/plans".to_string());
        let worktrees = WorktreeManager::new(
            &root,
            &paths.worktree_base,
            Some(plan_dir_rel.clone()),
        );
        if let Err(err) = worktrees.cleanup_stale() {
            warn!(%err, "stale worktree cleanup failed at startup");
        }

        let agent = resolve_agent(cfg.agent_command.as_deref())?;
        fs::create_dir_all(&paths.planloop_dir)
            .with_context(|| format!("create {}", paths.planloop_dir.display()))?;

        Ok(Self {
            cfg,
            paths,
            plan,
            plan_display,
            plan_dir_rel,
            git,
            worktrees,
            lock,
            registry: ChildRegistry::new(),
            cancel,
            agent,
            prompts: PromptEngine::new(),
            max_iterations,
        })
    }

    /// Run the loop to a terminal state and persist the run summary.
    pub fn run(&mut self) -> Result<RunStatus> {
        self.startup_banner()?;

        let mut prev_checked = 0usize;
        let mut stale_rounds = 0u32;
        let mut prev_exit: Option<i32> = None;
        let mut iteration = 0u32;

        let status = loop {
            iteration += 1;
            if iteration > self.max_iterations {
                warn!(
                    max_iterations = self.max_iterations,
                    remaining = self.plan.unchecked(),
                    "reached max iterations with items still unchecked"
                );
                break RunStatus::MaxIterationsReached;
            }
            self.check_cancelled()?;
            self.plan.reload()?;

            if self.plan.is_complete() {
                info!(checked = self.plan.checked(), "all checklist items complete");
                break RunStatus::Complete;
            }

            if iteration > 1 && self.plan.checked() <= prev_checked {
                stale_rounds += 1;
                warn!(stale_rounds, limit = MAX_STALE_ROUNDS, "no progress this round");
                if stale_rounds >= MAX_STALE_ROUNDS {
                    warn!("circuit breaker: {MAX_STALE_ROUNDS} rounds with no progress, stopping");
                    for item in self.plan.next_unchecked(SUMMARY_PREVIEW_ITEMS) {
                        info!(%item, "still unchecked");
                    }
                    break RunStatus::CircuitBroken;
                }
            } else {
                stale_rounds = 0;
            }
            prev_checked = self.plan.checked();

            let pending = self.plan.unchecked_tasks();
            let batches = build_batches(&pending, self.cfg.max_parallel);
            info!(
                iteration,
                max_iterations = self.max_iterations,
                remaining = self.plan.unchecked(),
                done = self.plan.checked(),
                "starting iteration"
            );

            let exit = match batches.first() {
                Some(batch) if batch.parallel => {
                    let batch = batch.clone();
                    self.run_parallel_batch(&batch, iteration)?
                }
                first => {
                    let batch = first.cloned();
                    self.run_sequential(batch.as_ref(), iteration, prev_exit)?
                }
            };
            prev_exit = Some(exit);

            // Early completion check: skip a wasted iteration.
            self.plan.reload()?;
            if self.plan.is_complete() {
                info!(checked = self.plan.checked(), "all checklist items complete");
                break RunStatus::Complete;
            }
        };

        let summary = self.write_summary(status)?;
        println!("{}", summary.render_markdown());
        self.lock.release();
        Ok(status)
    }

    fn startup_banner(&mut self) -> Result<()> {
        self.plan.reload()?;
        let pending = self.plan.unchecked_tasks();
        let batches = build_batches(&pending, self.cfg.max_parallel);
        info!(
            remaining = self.plan.unchecked(),
            done = self.plan.checked(),
            total = self.plan.total(),
            batch_mode = !batches.is_empty(),
            "plan loop starting"
        );
        for (idx, batch) in batches.iter().enumerate() {
            let tasks: Vec<String> = batch.tasks.iter().map(|t| format!("T{}", t.number)).collect();
            info!(
                batch = idx + 1,
                parallel = batch.parallel,
                tasks = %tasks.join(", "),
                "scheduled batch"
            );
        }
        Ok(())
    }

    fn check_cancelled(&mut self) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(self.shutdown_on_signal());
        }
        Ok(())
    }

    /// Cleanup path shared by every signal-triggered exit: kill all child
    /// groups, prune sandboxes, release the lock.
    fn shutdown_on_signal(&mut self) -> anyhow::Error {
        warn!("termination signal received, cleaning up");
        self.registry.broadcast_cancel(self.cfg.grace_period());
        if let Err(err) = self.worktrees.cleanup_stale() {
            warn!(%err, "sandbox cleanup failed during shutdown");
        }
        self.lock.release();
        anyhow!("terminated by signal")
    }

    // --- Sequential dispatch -------------------------------------------------

    #[instrument(skip_all, fields(iteration))]
    fn run_sequential(
        &mut self,
        batch: Option<&Batch>,
        iteration: u32,
        prev_exit: Option<i32>,
    ) -> Result<i32> {
        let prompt = self.build_sequential_prompt(batch, iteration, prev_exit)?;
        let argv = self.agent.build_invocation(&prompt);
        let envs = vec![(NESTED_MARKER.to_string(), "1".to_string())];

        let mut proc = spawn_unbuffered(&argv, &self.paths.root, &self.paths.log_path, &envs)?;
        if let Some(pid) = proc.pid() {
            self.registry.register(pid, format!("agent-i{iteration}"));
        }

        let exit = self.supervise_sequential(&mut proc, iteration);
        if exit.is_err() {
            // The reader can only be joined once the child is gone.
            proc.kill();
        }
        proc.stop();
        if let Some(pid) = proc.pid() {
            self.registry.deregister(pid);
        }
        exit
    }

    fn build_sequential_prompt(
        &mut self,
        batch: Option<&Batch>,
        iteration: u32,
        prev_exit: Option<i32>,
    ) -> Result<String> {
        self.plan.reload()?;
        let plan_path = PathBuf::from(&self.plan_display);
        let progress = self.plan.progress_path();
        let findings = self.plan.findings_path();

        if let Some(batch) = batch {
            return self.prompts.render_task(
                &batch.tasks[0],
                &plan_path,
                &progress,
                &findings,
                iteration,
            );
        }

        let env_status = self.environment_status(prev_exit);
        let next_items = self.plan.next_unchecked(5);
        if iteration == 1 && self.plan.checked() == 0 {
            self.prompts.render_first_iteration(
                &plan_path,
                &progress,
                &findings,
                &env_status,
                &next_items,
                iteration,
            )
        } else {
            self.prompts.render_fallback(
                &plan_path,
                &progress,
                &findings,
                &env_status,
                &next_items,
                iteration,
            )
        }
    }

    fn environment_status(&self, prev_exit: Option<i32>) -> String {
        if self.cfg.skip_precheck {
            return "Precheck skipped".to_string();
        }
        if prev_exit == Some(0) {
            return "Environment OK (cached: last iteration succeeded)".to_string();
        }
        let report = run_precheck(&self.paths.root, self.cfg.precheck_timeout());
        if report.passed {
            "Environment OK".to_string()
        } else {
            format!("Environment FAILING:\n{}", report.output_tail)
        }
    }

    /// Wait for the sequential agent under three layered ceilings: the hard
    /// per-task timeout, the checklist-stall watchdog, and the tighter
    /// output-idle watchdog. All of them escalate TERM, grace, KILL against
    /// the process group.
    fn supervise_sequential(&mut self, proc: &mut PtyProcess, iteration: u32) -> Result<i32> {
        let started = Instant::now();
        let heartbeat = self.cfg.heartbeat_interval();
        let mut next_heartbeat = started + heartbeat;
        let mut stall = Duration::ZERO;
        let mut last_checked: Option<usize> = None;
        let mut last_log_len = 0u64;
        let mut last_output = started;

        loop {
            if let Some(code) = proc.try_wait()? {
                debug!(code, "agent process exited");
                return Ok(code);
            }
            if self.cancel.load(Ordering::SeqCst) {
                proc.kill();
                return Err(self.shutdown_on_signal());
            }
            if started.elapsed() >= self.cfg.task_timeout() {
                warn!(
                    iteration,
                    timeout_secs = self.cfg.task_timeout_secs,
                    "task timeout, terminating process group"
                );
                return self.escalate_pty_kill(proc);
            }

            let log_len = fs::metadata(&self.paths.log_path)
                .map(|m| m.len())
                .unwrap_or(0);
            if log_len != last_log_len {
                last_log_len = log_len;
                last_output = Instant::now();
            } else if last_output.elapsed() >= self.cfg.idle_timeout() {
                warn!(
                    iteration,
                    idle_secs = self.cfg.idle_timeout_secs,
                    "no output from agent, terminating process group"
                );
                return self.escalate_pty_kill(proc);
            }

            if Instant::now() >= next_heartbeat {
                next_heartbeat += heartbeat;
                self.plan.reload()?;
                let checked = self.plan.checked();
                info!(
                    iteration,
                    checked,
                    total = self.plan.total(),
                    elapsed_secs = started.elapsed().as_secs(),
                    "heartbeat"
                );
                if last_checked == Some(checked) {
                    stall += heartbeat;
                    if stall >= self.cfg.stall_timeout() {
                        warn!(
                            iteration,
                            stalled_secs = stall.as_secs(),
                            "no checklist progress, terminating process group"
                        );
                        return self.escalate_pty_kill(proc);
                    }
                } else {
                    stall = Duration::ZERO;
                    last_checked = Some(checked);
                }
            }

            thread::sleep(POLL_INTERVAL);
        }
    }

    /// TERM the group, wait out the grace window, then KILL.
    fn escalate_pty_kill(&self, proc: &mut PtyProcess) -> Result<i32> {
        proc.terminate();
        let deadline = Instant::now() + self.cfg.grace_period();
        while Instant::now() < deadline {
            if let Some(code) = proc.try_wait()? {
                return Ok(code);
            }
            thread::sleep(POLL_INTERVAL);
        }
        proc.kill();
        if let Some(code) = proc.try_wait()? {
            return Ok(code);
        }
        Ok(1)
    }

    // --- Parallel dispatch ---------------------------------------------------

    #[instrument(skip_all, fields(iteration, tasks = batch.tasks.len()))]
    fn run_parallel_batch(&mut self, batch: &Batch, iteration: u32) -> Result<i32> {
        fs::create_dir_all(&self.paths.worker_log_dir)
            .with_context(|| format!("create {}", self.paths.worker_log_dir.display()))?;

        let checklist_context = format!(
            "Completed: {}/{}.\nRemaining items:\n{}",
            self.plan.checked(),
            self.plan.total(),
            self.plan.next_unchecked(10).join("\n")
        );
        let plan_path = PathBuf::from(&self.plan_display);
        let envs = vec![(NESTED_MARKER.to_string(), "1".to_string())];

        let mut workers: Vec<Worker> = Vec::new();
        for task in &batch.tasks {
            let name = format!("w{}-i{}", task.number, iteration);
            let wt_path = match self.worktrees.create(&name) {
                Ok(path) => path,
                Err(err) => {
                    warn!(task = task.number, %err, "failed to create sandbox, skipping task");
                    continue;
                }
            };
            let prompt = self.prompts.render_worker(
                task,
                &plan_path,
                &self.plan_dir_rel,
                Some(checklist_context.as_str()),
            )?;
            let argv = self.agent.build_invocation(&prompt);
            let log_path = self.paths.worker_log_dir.join(format!("worker-{name}.log"));
            let log = File::create(&log_path)
                .with_context(|| format!("create worker log {}", log_path.display()))?;

            match spawn_in_group(&argv, &wt_path, log, &envs) {
                Ok(child) => {
                    info!(worker = %name, task = %task.title, sandbox = %wt_path.display(), "worker launched");
                    self.registry.register(child.id(), name.clone());
                    workers.push(Worker {
                        name,
                        task: task.clone(),
                        child,
                        deadline: Instant::now() + self.cfg.task_timeout(),
                        status: None,
                    });
                }
                Err(err) => {
                    warn!(task = task.number, %err, "failed to spawn worker");
                    self.worktrees.remove(&name);
                }
            }
        }

        self.await_workers(&mut workers)?;

        // Merges are applied strictly in declared-success order and are never
        // themselves parallelized. A failed merge is excluded without
        // blocking the rest.
        let mut any_success = false;
        let mut merged_any = false;
        for worker in &workers {
            let succeeded = worker.status.is_some_and(|s| s.success());
            if !succeeded {
                info!(worker = %worker.name, "worker failed, leaving item unchecked");
                continue;
            }
            any_success = true;
            match self.worktrees.merge(&worker.name) {
                Ok(true) => {
                    info!(worker = %worker.name, "merged worker");
                    merged_any = true;
                    self.credit_task(&worker.task)?;
                }
                Ok(false) => warn!(worker = %worker.name, "merge conflict, skipping"),
                Err(err) => warn!(worker = %worker.name, %err, "merge failed"),
            }
        }

        // When the task↔item mapping is ambiguous, fall back to broad
        // opportunistic verification of every unchecked item.
        self.plan.reload()?;
        if merged_any && !self.plan.tasks_aligned() {
            let attempts = self.plan.verify_and_check_all(
                &self.paths.root,
                self.cfg.verify_timeout(),
                self.cfg.output_limit_bytes,
            )?;
            if attempts.iter().any(|a| a.passed) {
                self.commit_plan("chore: check off verified items")?;
            }
        }

        for worker in &workers {
            self.registry.deregister(worker.child.id());
            self.worktrees.remove(&worker.name);
        }

        Ok(if any_success { 0 } else { 1 })
    }

    /// Poll all workers until every one has exited or hit its deadline.
    fn await_workers(&mut self, workers: &mut [Worker]) -> Result<()> {
        while workers.iter().any(|w| w.status.is_none()) {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(self.shutdown_on_signal());
            }
            for worker in workers.iter_mut().filter(|w| w.status.is_none()) {
                if let Some(status) = worker
                    .child
                    .try_wait()
                    .with_context(|| format!("poll worker {}", worker.name))?
                {
                    if status.success() {
                        info!(worker = %worker.name, "worker succeeded");
                    } else {
                        warn!(worker = %worker.name, code = ?status.code(), "worker failed");
                    }
                    worker.status = Some(status);
                } else if Instant::now() >= worker.deadline {
                    warn!(worker = %worker.name, "worker timed out, killing group");
                    let status =
                        escalate_group_kill(&mut worker.child, self.cfg.grace_period())?;
                    worker.status = Some(status);
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
        Ok(())
    }

    /// Re-run a merged task's verify command against the integrated tree and
    /// check its item off only on success; self-reports are never trusted.
    /// The checklist mutation is committed as its own labeled commit.
    fn credit_task(&mut self, task: &TaskRecord) -> Result<()> {
        let Some(verify) = &task.verify else {
            info!(task = task.number, "no verify command declared, leaving item unchecked");
            return Ok(());
        };
        let passed = match run_shell_with_timeout(
            verify,
            &self.paths.root,
            self.cfg.verify_timeout(),
            self.cfg.output_limit_bytes,
        ) {
            Ok(output) => output.success(),
            Err(err) => {
                warn!(task = task.number, %err, "verify command failed to run");
                false
            }
        };
        if !passed {
            warn!(task = task.number, "verify failed against integrated tree");
            return Ok(());
        }

        self.plan.reload()?;
        if self.plan.check_off(task.number)? {
            self.commit_plan(&format!("chore: check off task {}", task.number))?;
            info!(task = task.number, "verified and checked off");
        } else {
            warn!(
                task = task.number,
                "verify passed but check-off did not apply"
            );
        }
        Ok(())
    }

    fn commit_plan(&self, message: &str) -> Result<()> {
        self.git.add_paths(&[self.plan.path()])?;
        self.git.commit_staged(message)?;
        Ok(())
    }

    // --- Termination ---------------------------------------------------------

    fn write_summary(&mut self, status: RunStatus) -> Result<RunSummary> {
        self.plan.reload()?;
        let remaining = self.plan.unchecked();
        let summary = RunSummary {
            status,
            plan_path: self.plan.path().to_path_buf(),
            completed: self.plan.checked(),
            remaining,
            skipped: self.plan.skipped(),
            finished_at: Utc::now(),
            remaining_preview: if remaining > 0 {
                self.plan.next_unchecked(SUMMARY_PREVIEW_ITEMS)
            } else {
                Vec::new()
            },
        };
        if let Some(parent) = self.paths.result_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&self.paths.result_path, summary.render_markdown())
            .with_context(|| format!("write {}", self.paths.result_path.display()))?;
        Ok(summary)
    }
}
