//! Prompt builders for agent invocations.
//!
//! One template per dispatch mode: parallel worker (task-scoped, sandbox
//! cwd), sequential batch task, first iteration (environment emphasis), and
//! the generic fallback used when no task structure parses.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::plan::TaskRecord;

const WORKER_TEMPLATE: &str = include_str!("prompts/worker.md");
const TASK_TEMPLATE: &str = include_str!("prompts/task.md");
const FIRST_ITERATION_TEMPLATE: &str = include_str!("prompts/first_iteration.md");
const FALLBACK_TEMPLATE: &str = include_str!("prompts/fallback.md");

/// Task fields flattened for template rendering.
#[derive(Debug, Clone, Serialize)]
struct TaskContext {
    number: u32,
    title: String,
    files: String,
    verify: String,
}

impl TaskContext {
    fn from_task(task: &TaskRecord) -> Self {
        Self {
            number: task.number,
            title: task.title.clone(),
            files: task
                .files
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
            verify: task
                .verify
                .clone()
                .unwrap_or_else(|| "echo 'no verify command declared'".to_string()),
        }
    }
}

/// Template engine wrapper around minijinja.
#[derive(Debug)]
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("worker", WORKER_TEMPLATE)
            .expect("worker template should be valid");
        env.add_template("task", TASK_TEMPLATE)
            .expect("task template should be valid");
        env.add_template("first_iteration", FIRST_ITERATION_TEMPLATE)
            .expect("first_iteration template should be valid");
        env.add_template("fallback", FALLBACK_TEMPLATE)
            .expect("fallback template should be valid");
        Self { env }
    }

    /// Task-scoped instruction for a parallel worker running in a sandbox.
    pub fn render_worker(
        &self,
        task: &TaskRecord,
        plan_path: &Path,
        plan_dir: &str,
        checklist_context: Option<&str>,
    ) -> Result<String> {
        let template = self.env.get_template("worker").context("worker template")?;
        let rendered = template.render(context! {
            task => TaskContext::from_task(task),
            plan_path => plan_path.display().to_string(),
            plan_dir => plan_dir,
            checklist_context => checklist_context
                .map(str::trim)
                .filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    /// Consolidated instruction for a sequential single-task batch.
    pub fn render_task(
        &self,
        task: &TaskRecord,
        plan_path: &Path,
        progress_path: &Path,
        findings_path: &Path,
        iteration: u32,
    ) -> Result<String> {
        let template = self.env.get_template("task").context("task template")?;
        let rendered = template.render(context! {
            task => TaskContext::from_task(task),
            plan_path => plan_path.display().to_string(),
            progress_path => progress_path.display().to_string(),
            findings_path => findings_path.display().to_string(),
            iteration => iteration,
        })?;
        Ok(rendered)
    }

    /// First-iteration instruction with environment-setup emphasis.
    pub fn render_first_iteration(
        &self,
        plan_path: &Path,
        progress_path: &Path,
        findings_path: &Path,
        env_status: &str,
        next_items: &[String],
        iteration: u32,
    ) -> Result<String> {
        let template = self
            .env
            .get_template("first_iteration")
            .context("first_iteration template")?;
        let rendered = template.render(context! {
            plan_path => plan_path.display().to_string(),
            progress_path => progress_path.display().to_string(),
            findings_path => findings_path.display().to_string(),
            env_status => env_status,
            next_items => next_items.join("\n"),
            iteration => iteration,
        })?;
        Ok(rendered)
    }

    /// Generic "next unchecked item" instruction.
    pub fn render_fallback(
        &self,
        plan_path: &Path,
        progress_path: &Path,
        findings_path: &Path,
        env_status: &str,
        next_items: &[String],
        iteration: u32,
    ) -> Result<String> {
        let template = self
            .env
            .get_template("fallback")
            .context("fallback template")?;
        let rendered = template.render(context! {
            plan_path => plan_path.display().to_string(),
            progress_path => progress_path.display().to_string(),
            findings_path => findings_path.display().to_string(),
            env_status => env_status,
            next_items => next_items.join("\n"),
            iteration => iteration,
        })?;
        Ok(rendered)
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}
