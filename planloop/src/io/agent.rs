//! Agent backend selection.
//!
//! The loop never hardcodes one agent CLI: an explicit override wins, then
//! installed backends are probed in fixed preference order. Selection
//! happens once at startup; a missing backend fails the whole run.

use anyhow::{Result, anyhow};
use tracing::{debug, info};

/// Resolved agent command line, before the prompt is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    argv: Vec<String>,
}

impl AgentCommand {
    /// Full argv for one invocation with the given instruction text.
    ///
    /// `claude` takes the prompt directly after `-p`; every other backend
    /// takes it as the final argument.
    pub fn build_invocation(&self, prompt: &str) -> Vec<String> {
        if self.argv[0] == "claude" && self.argv.get(1).is_some_and(|a| a == "-p") {
            let mut out = vec![self.argv[0].clone(), self.argv[1].clone(), prompt.to_string()];
            out.extend(self.argv[2..].iter().cloned());
            return out;
        }
        let mut out = self.argv.clone();
        out.push(prompt.to_string());
        out
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }
}

/// Resolve the agent backend: explicit override, then `claude`, then
/// `kiro-cli`.
pub fn resolve_agent(override_cmd: Option<&str>) -> Result<AgentCommand> {
    if let Some(raw) = override_cmd {
        let argv: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
        if argv.is_empty() {
            return Err(anyhow!("agent command override is empty"));
        }
        debug!(command = %raw, "using explicit agent command");
        return Ok(AgentCommand { argv });
    }

    if which::which("claude").is_ok() {
        info!("selected agent backend: claude");
        return Ok(AgentCommand {
            argv: vec![
                "claude".to_string(),
                "-p".to_string(),
                "--allowedTools".to_string(),
                "Bash,Read,Write,Edit,Task,WebSearch,WebFetch".to_string(),
                "--output-format".to_string(),
                "text".to_string(),
            ],
        });
    }

    if which::which("kiro-cli").is_ok() {
        info!("selected agent backend: kiro-cli");
        return Ok(AgentCommand {
            argv: vec![
                "kiro-cli".to_string(),
                "chat".to_string(),
                "--no-interactive".to_string(),
                "--trust-all-tools".to_string(),
                "--agent".to_string(),
                "pilot".to_string(),
            ],
        });
    }

    Err(anyhow!(
        "no agent backend found: install claude or kiro-cli, or set PLANLOOP_AGENT_CMD"
    ))
}
