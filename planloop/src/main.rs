//! Conflict-aware plan execution loop for coding agents.
//!
//! Keeps restarting an agent process against the active plan until every
//! checklist item is checked off, dispatching independent tasks in parallel
//! git worktrees when their declared file sets cannot conflict.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;

use planloop::config::{LoopConfig, LoopPaths, load_config};
use planloop::controller::Controller;
use planloop::core::schedule::build_batches;
use planloop::exit_codes;
use planloop::io::plan_file::PlanFile;
use planloop::logging;

#[derive(Parser)]
#[command(
    name = "planloop",
    version,
    about = "Conflict-aware plan execution loop for coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive the agent loop until the plan completes or a breaker trips.
    Run {
        /// Iteration budget for this run.
        #[arg(long, default_value_t = 10)]
        max_iterations: u32,
    },
    /// Print checklist counts for the active plan.
    Status {
        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the conflict-free batch partition for pending tasks.
    Batches {
        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run inline verify commands for unchecked items, checking off passes.
    Verify,
}

#[derive(Serialize)]
struct StatusReport {
    plan: PathBuf,
    checked: usize,
    unchecked: usize,
    skipped: usize,
    total: usize,
    complete: bool,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILURE);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve working directory")?;
    let paths = LoopPaths::new(&root);
    let mut cfg = load_config(&paths.config_path)?;
    cfg.apply_env(|key| std::env::var(key).ok())?;

    match cli.command {
        Command::Run { max_iterations } => cmd_run(&root, cfg, max_iterations),
        Command::Status { json } => cmd_status(&root, &cfg, json),
        Command::Batches { json } => cmd_batches(&root, &cfg, json),
        Command::Verify => cmd_verify(&root, &cfg),
    }
}

fn cmd_run(root: &Path, cfg: LoopConfig, max_iterations: u32) -> Result<i32> {
    let mut controller = Controller::init(root, cfg, max_iterations)?;
    let status = controller.run()?;
    Ok(status.exit_code())
}

fn cmd_status(root: &Path, cfg: &LoopConfig, json: bool) -> Result<i32> {
    let plan = load_active_plan(root, cfg)?;
    let report = StatusReport {
        plan: plan.path().to_path_buf(),
        checked: plan.checked(),
        unchecked: plan.unchecked(),
        skipped: plan.skipped(),
        total: plan.total(),
        complete: plan.is_complete(),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{}: {}/{} done, {} remaining, {} skipped",
            report.plan.display(),
            report.checked,
            report.total,
            report.unchecked,
            report.skipped
        );
        for item in plan.next_unchecked(5) {
            println!("  {item}");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_batches(root: &Path, cfg: &LoopConfig, json: bool) -> Result<i32> {
    let plan = load_active_plan(root, cfg)?;
    let pending = plan.unchecked_tasks();
    let batches = build_batches(&pending, cfg.max_parallel);
    if json {
        println!("{}", serde_json::to_string_pretty(&batches)?);
    } else if batches.is_empty() {
        println!("no pending tasks with a parsed task breakdown");
    } else {
        for (idx, batch) in batches.iter().enumerate() {
            let mode = if batch.parallel { "parallel" } else { "sequential" };
            let tasks: Vec<String> = batch
                .tasks
                .iter()
                .map(|t| format!("T{} {}", t.number, t.title))
                .collect();
            println!("batch {}: {mode} [{}]", idx + 1, tasks.join(", "));
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_verify(root: &Path, cfg: &LoopConfig) -> Result<i32> {
    let mut plan = load_active_plan(root, cfg)?;
    let attempts = plan.verify_and_check_all(
        root,
        cfg.verify_timeout(),
        cfg.output_limit_bytes,
    )?;
    if attempts.is_empty() {
        println!("no unchecked items carry an inline verify command");
        return Ok(exit_codes::OK);
    }
    for attempt in &attempts {
        let verdict = if attempt.passed { "pass" } else { "fail" };
        println!("item {}: {verdict} ({})", attempt.position + 1, attempt.command);
    }
    Ok(exit_codes::OK)
}

fn load_active_plan(root: &Path, cfg: &LoopConfig) -> Result<PlanFile> {
    let pointer = if cfg.plan_pointer.is_absolute() {
        cfg.plan_pointer.clone()
    } else {
        root.join(&cfg.plan_pointer)
    };
    if !pointer.exists() {
        bail!("no active plan: pointer {} not found", pointer.display());
    }
    let raw = std::fs::read_to_string(&pointer)
        .with_context(|| format!("read pointer {}", pointer.display()))?;
    let target = raw.trim();
    if target.is_empty() {
        bail!("pointer {} is empty", pointer.display());
    }
    let plan_path = if Path::new(target).is_absolute() {
        PathBuf::from(target)
    } else {
        root.join(target)
    };
    if !plan_path.exists() {
        bail!("plan file not found: {}", plan_path.display());
    }
    PlanFile::load(plan_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_defaults() {
        let cli = Cli::parse_from(["planloop", "run"]);
        assert!(matches!(
            cli.command,
            Command::Run { max_iterations: 10 }
        ));
    }

    #[test]
    fn parse_run_with_budget() {
        let cli = Cli::parse_from(["planloop", "run", "--max-iterations", "3"]);
        assert!(matches!(cli.command, Command::Run { max_iterations: 3 }));
    }

    #[test]
    fn parse_status_json() {
        let cli = Cli::parse_from(["planloop", "status", "--json"]);
        assert!(matches!(cli.command, Command::Status { json: true }));
    }
}
