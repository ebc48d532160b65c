//! Child process helpers: group spawning, layered kill escalation, bounded
//! shell execution, and the cancellable child registry.
//!
//! Every agent or verify process the loop launches runs in its own process
//! group, so cancellation reaches the entire subtree of a multi-process
//! backend, not just the directly spawned child.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Poll slice for supervision loops. Short enough that signal flags and
/// deadlines are honored promptly.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Send SIGTERM to a child's process group (best effort).
pub fn terminate_group(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Send SIGKILL to a child's process group (best effort).
pub fn kill_group(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Terminate a child's group gracefully, escalating to SIGKILL after `grace`.
///
/// Returns the exit status once the child has been reaped.
pub fn escalate_group_kill(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    let pid = child.id();
    terminate_group(pid);
    let deadline = Instant::now() + grace;
    loop {
        if let Some(status) = child.try_wait().context("reap child after terminate")? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(POLL_INTERVAL.min(grace));
    }
    kill_group(pid);
    child.kill().ok();
    child.wait().context("reap child after kill")
}

/// Registry of in-flight child process groups.
///
/// Shared between the controller and its signal path: on a termination
/// signal every registered group gets SIGTERM, then SIGKILL after the grace
/// window. Registration is keyed by pid (equal to the group id, since all
/// children are spawned as group leaders).
#[derive(Debug, Clone, Default)]
pub struct ChildRegistry {
    children: Arc<Mutex<Vec<RegisteredChild>>>,
}

#[derive(Debug, Clone)]
struct RegisteredChild {
    pid: u32,
    label: String,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: u32, label: impl Into<String>) {
        let label = label.into();
        debug!(pid, %label, "registering child group");
        self.children
            .lock()
            .expect("child registry poisoned")
            .push(RegisteredChild { pid, label });
    }

    pub fn deregister(&self, pid: u32) {
        self.children
            .lock()
            .expect("child registry poisoned")
            .retain(|child| child.pid != pid);
    }

    pub fn is_empty(&self) -> bool {
        self.children
            .lock()
            .expect("child registry poisoned")
            .is_empty()
    }

    /// Broadcast cancellation to every registered group: TERM, grace, KILL.
    pub fn broadcast_cancel(&self, grace: Duration) {
        let snapshot: Vec<RegisteredChild> = {
            let mut guard = self.children.lock().expect("child registry poisoned");
            std::mem::take(&mut *guard)
        };
        if snapshot.is_empty() {
            return;
        }
        for child in &snapshot {
            warn!(pid = child.pid, label = %child.label, "cancelling child group");
            terminate_group(child.pid);
        }
        thread::sleep(grace);
        for child in &snapshot {
            kill_group(child.pid);
        }
    }
}

/// Spawn a command as its own process-group leader with output redirected to
/// a log file and extra environment entries applied.
///
/// The recursion-guard marker is passed in `envs` by the caller; spawning
/// never consults ambient process state.
#[instrument(skip_all, fields(program = argv.first().map(String::as_str).unwrap_or("")))]
pub fn spawn_in_group(
    argv: &[String],
    workdir: &Path,
    log: File,
    envs: &[(String, String)],
) -> Result<Child> {
    if argv.is_empty() {
        return Err(anyhow!("empty command line"));
    }
    let stderr_log = log.try_clone().context("clone worker log handle")?;
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr_log));
    for (key, value) in envs {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd.spawn()
        .with_context(|| format!("spawn {}", argv.join(" ")))
}

/// Captured output of a bounded shell command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    /// Last `lines` lines of combined stdout + stderr.
    pub fn tail(&self, lines: usize) -> String {
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&self.stdout),
            String::from_utf8_lossy(&self.stderr)
        );
        let all: Vec<&str> = combined.trim_end().lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Run a shell command with a timeout, capturing bounded output.
///
/// The child runs in its own process group; on timeout the whole group is
/// terminated then killed after a short grace window. Output beyond
/// `limit_bytes` per stream is discarded while still draining the pipes.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs()))]
pub fn run_shell_with_timeout(
    command: &str,
    workdir: &Path,
    timeout: Duration,
    limit_bytes: usize,
) -> Result<CommandOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(%command, "spawning shell command");
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn sh -c '{command}'"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing group");
            timed_out = true;
            escalate_group_kill(&mut child, Duration::from_secs(2))?
        }
    };

    let stdout = join_output(stdout_handle).context("join stdout")?;
    let stderr = join_output(stderr_handle).context("join stderr")?;

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<Vec<u8>>>) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            buf.extend_from_slice(&chunk[..n.min(remaining)]);
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_command_captures_output_and_exit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run_shell_with_timeout(
            "echo hello && echo oops >&2",
            temp.path(),
            Duration::from_secs(5),
            10_000,
        )
        .expect("run");
        assert!(out.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hello");
        assert_eq!(String::from_utf8_lossy(&out.stderr).trim(), "oops");
    }

    #[test]
    fn shell_failure_is_not_success() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out =
            run_shell_with_timeout("exit 3", temp.path(), Duration::from_secs(5), 10_000)
                .expect("run");
        assert!(!out.success());
        assert_eq!(out.status.code(), Some(3));
    }

    #[test]
    fn timeout_kills_the_whole_group() {
        let temp = tempfile::tempdir().expect("tempdir");
        let started = Instant::now();
        let out = run_shell_with_timeout(
            "sleep 30",
            temp.path(),
            Duration::from_millis(300),
            10_000,
        )
        .expect("run");
        assert!(out.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "group kill should not wait out the sleep"
        );
    }

    #[test]
    fn output_is_bounded_by_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run_shell_with_timeout(
            "yes x | head -c 100000",
            temp.path(),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(out.stdout.len() <= 1024);
    }

    #[test]
    fn tail_returns_last_lines_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run_shell_with_timeout(
            "printf 'one\ntwo\nthree\n'",
            temp.path(),
            Duration::from_secs(5),
            10_000,
        )
        .expect("run");
        assert_eq!(out.tail(2), "two\nthree");
    }

    #[test]
    fn registry_tracks_and_clears_children() {
        let registry = ChildRegistry::new();
        assert!(registry.is_empty());
        registry.register(12345, "w1");
        registry.register(12346, "w2");
        assert!(!registry.is_empty());
        registry.deregister(12345);
        registry.deregister(12346);
        assert!(registry.is_empty());
    }

    #[test]
    fn broadcast_cancel_terminates_registered_group() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = File::create(temp.path().join("w.log")).expect("log");
        let argv = vec!["sleep".to_string(), "30".to_string()];
        let mut child = spawn_in_group(&argv, temp.path(), log, &[]).expect("spawn");

        let registry = ChildRegistry::new();
        registry.register(child.id(), "sleeper");
        registry.broadcast_cancel(Duration::from_millis(100));
        assert!(registry.is_empty());

        let status = child
            .wait_timeout(Duration::from_secs(5))
            .expect("wait")
            .expect("child should have been terminated");
        assert!(!status.success());
    }
}
