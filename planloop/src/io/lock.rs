//! Single-instance exclusive lock.
//!
//! An advisory OS-level `flock` on a fixed path. The pid written into the
//! file is observability only; exclusion comes from the lock itself, since
//! pid inspection is racy and advisory.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, warn};

/// Exclusive lock handle. At most one live holder per path.
pub struct ExclusiveLock {
    path: PathBuf,
    held: Option<Flock<File>>,
}

impl std::fmt::Debug for ExclusiveLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveLock")
            .field("path", &self.path)
            .field("held", &self.held.is_some())
            .finish()
    }
}

impl ExclusiveLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            held: None,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Acquire the lock, blocking until it is available.
    pub fn acquire(&mut self) -> Result<()> {
        if self.held.is_some() {
            return Ok(());
        }
        let file = self.open_file()?;
        let flock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| anyhow::anyhow!("flock {}: {errno}", self.path.display()))?;
        self.held = Some(flock);
        self.record_holder()?;
        debug!(path = %self.path.display(), "lock acquired");
        Ok(())
    }

    /// Try to acquire the lock without blocking.
    ///
    /// Returns `Ok(false)` when another holder has it; the file handle is
    /// closed cleanly in that case.
    pub fn try_acquire(&mut self) -> Result<bool> {
        if self.held.is_some() {
            return Ok(true);
        }
        let file = self.open_file()?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => {
                self.held = Some(flock);
                self.record_holder()?;
                debug!(path = %self.path.display(), "lock acquired");
                Ok(true)
            }
            Err((file, errno)) => {
                // Dropping the file closes the handle without touching the
                // holder's lock.
                drop(file);
                debug!(path = %self.path.display(), %errno, "lock unavailable");
                Ok(false)
            }
        }
    }

    /// Release the lock and delete the lock path.
    ///
    /// Idempotent: safe to call repeatedly or when never acquired.
    pub fn release(&mut self) {
        if let Some(flock) = self.held.take() {
            drop(flock);
            if let Err(err) = fs::remove_file(&self.path)
                && err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %self.path.display(), %err, "failed to delete lock file");
            }
            debug!(path = %self.path.display(), "lock released");
        }
    }

    fn open_file(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("open lock file {}", self.path.display()))
    }

    fn record_holder(&mut self) -> Result<()> {
        let pid = std::process::id();
        if let Some(file) = self.held.as_mut() {
            file.set_len(0).context("truncate lock file")?;
            writeln!(file, "{pid}").context("write lock holder pid")?;
            file.flush().context("flush lock file")?;
        }
        Ok(())
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_try_acquires_never_both_succeed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lock");

        let mut first = ExclusiveLock::new(&path);
        let mut second = ExclusiveLock::new(&path);

        assert!(first.try_acquire().expect("first"));
        assert!(!second.try_acquire().expect("second"));
        assert!(first.is_held());
        assert!(!second.is_held());
    }

    #[test]
    fn try_acquire_succeeds_after_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lock");

        let mut first = ExclusiveLock::new(&path);
        assert!(first.try_acquire().expect("first"));
        first.release();

        let mut second = ExclusiveLock::new(&path);
        assert!(second.try_acquire().expect("second"));
    }

    #[test]
    fn release_is_repeat_safe_and_ok_unacquired() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lock");

        let mut never = ExclusiveLock::new(&path);
        never.release();
        never.release();

        let mut lock = ExclusiveLock::new(&path);
        assert!(lock.try_acquire().expect("acquire"));
        lock.release();
        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn blocking_acquire_succeeds_on_free_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lock");

        let mut lock = ExclusiveLock::new(&path);
        lock.acquire().expect("acquire");
        assert!(lock.is_held());
        // Re-acquiring an already-held lock is a no-op.
        lock.acquire().expect("reacquire");
        lock.release();
    }

    #[test]
    fn holder_pid_is_recorded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lock");

        let mut lock = ExclusiveLock::new(&path);
        assert!(lock.try_acquire().expect("acquire"));
        let contents = fs::read_to_string(&path).expect("read lock");
        assert_eq!(
            contents.trim(),
            std::process::id().to_string(),
            "lock file should carry the holder pid"
        );
    }

    #[test]
    fn drop_releases_the_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lock");

        {
            let mut lock = ExclusiveLock::new(&path);
            assert!(lock.try_acquire().expect("acquire"));
        }
        let mut next = ExclusiveLock::new(&path);
        assert!(next.try_acquire().expect("reacquire after drop"));
    }
}
