//! Unbuffered process runner.
//!
//! Agent CLIs buffer aggressively when their output is a pipe, which starves
//! the idle watchdog and leaves the live log empty until exit. Running the
//! child on a pseudo-terminal keeps output line-buffered; a reader thread
//! tees every chunk to the log file with an immediate flush.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use portable_pty::{
    Child, ChildKiller, CommandBuilder, MasterPty, PtySize, PtySystem, SlavePty,
    native_pty_system,
};
use tracing::{debug, instrument, warn};

use crate::io::process::{kill_group, terminate_group};

/// A child running on a pseudo-terminal with its combined output teed to a
/// log file.
///
/// [`PtyProcess::stop`] must be called after the child has exited to
/// guarantee the reader has flushed before the log is treated as final.
pub struct PtyProcess {
    child: Box<dyn Child + Send + Sync>,
    master: Option<Box<dyn MasterPty + Send>>,
    reader: Option<JoinHandle<()>>,
    pid: Option<u32>,
    /// Cached exit code once the child has been reaped.
    exited: Option<i32>,
}

/// Launch `argv` on a fresh PTY in `workdir`, teeing output to `log_path`.
///
/// Extra environment entries (the recursion-guard marker among them) are
/// applied explicitly; nothing is inherited beyond the parent environment.
#[instrument(skip_all, fields(program = argv.first().map(String::as_str).unwrap_or("")))]
pub fn spawn_unbuffered(
    argv: &[String],
    workdir: &Path,
    log_path: &Path,
    envs: &[(String, String)],
) -> Result<PtyProcess> {
    if argv.is_empty() {
        return Err(anyhow!("empty command line"));
    }
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let mut log = File::create(log_path)
        .with_context(|| format!("create log file {}", log_path.display()))?;

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 40,
            cols: 120,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("open pty")?;

    let mut cmd = CommandBuilder::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.cwd(workdir);
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("spawn {} on pty", argv.join(" ")))?;
    // The slave side belongs to the child now; keeping it open would hold the
    // PTY alive past child exit and stall the reader at EOF.
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .context("clone pty reader")?;
    let handle = thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if log.write_all(&chunk[..n]).and_then(|()| log.flush()).is_err() {
                        warn!("pty log write failed, stopping tee");
                        break;
                    }
                }
                // The PTY reports EIO once the child side is gone.
                Err(_) => break,
            }
        }
    });

    let pid = child.process_id();
    debug!(?pid, "pty child spawned");
    Ok(PtyProcess {
        child,
        master: Some(pair.master),
        reader: Some(handle),
        pid,
        exited: None,
    })
}

impl PtyProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking exit check. Returns the exit code once the child is done.
    pub fn try_wait(&mut self) -> Result<Option<i32>> {
        if self.exited.is_some() {
            return Ok(self.exited);
        }
        let status = self.child.try_wait().context("poll pty child")?;
        if let Some(status) = status {
            self.exited = Some(status.exit_code() as i32);
        }
        Ok(self.exited)
    }

    /// SIGTERM the child's process group (the PTY child leads its own session).
    pub fn terminate(&mut self) {
        match self.pid {
            Some(pid) => terminate_group(pid),
            None => {
                let _ = self.child.kill();
            }
        }
    }

    /// SIGKILL the child's process group and reap it.
    pub fn kill(&mut self) {
        if self.exited.is_some() {
            return;
        }
        match self.pid {
            Some(pid) => kill_group(pid),
            None => {
                let _ = self.child.kill();
            }
        }
        if self.exited.is_none()
            && let Ok(status) = self.child.wait()
        {
            self.exited = Some(status.exit_code() as i32);
        }
    }

    /// Close the PTY and join the reader so the log file is final.
    ///
    /// The reader only reaches EOF once the child's side of the PTY is
    /// closed, so the child must be dead (exited or killed) before calling
    /// this; the join would otherwise block for as long as the child lives.
    pub fn stop(&mut self) {
        self.master.take();
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.exited.is_none() && matches!(self.child.try_wait(), Ok(None)) {
            self.kill();
        }
        self.stop();
    }
}
