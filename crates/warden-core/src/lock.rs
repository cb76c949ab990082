//! Per-path advisory locks
//!
//! Each target maps to a numeric key (the first eight bytes of the SHA-256 of
//! its root-relative path) and the key to a lock file under the locks
//! directory. Acquisition polls an exclusive, non-blocking file lock until a
//! deadline. The lock is released when the guard drops, which covers normal
//! return, early `?` exits, panics and cancelled tasks alike. Lock files are
//! never deleted; unlinking a lock file another process has open would let
//! two writers in.

use crate::error::PatchError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use warden_artifact::{ContentHash, TargetPath};

/// Factory for per-path lock guards
#[derive(Debug, Clone)]
pub struct PathLocks {
    dir: PathBuf,
    timeout: Duration,
    poll: Duration,
}

impl PathLocks {
    /// Locks stored in `dir`, 30 second timeout, 100 ms polling
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            timeout: Duration::from_secs(30),
            poll: Duration::from_millis(100),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic numeric key for a root-relative path
    #[must_use]
    pub fn key_for(relative: &str) -> i64 {
        ContentHash::compute(relative.as_bytes()).prefix_i64()
    }

    fn lock_file(&self, key: i64) -> PathBuf {
        self.dir.join(format!("{key:016x}.lock"))
    }

    /// Wait for exclusive ownership of `target`.
    ///
    /// # Errors
    /// - [`PatchError::LockTimeout`] if the lock is still held at the deadline
    /// - [`PatchError::Io`] if the lock file cannot be created or locked
    pub async fn acquire(&self, target: &TargetPath) -> Result<PathLockGuard, PatchError> {
        let key = Self::key_for(target.relative());
        let path = self.lock_file(key);
        std::fs::create_dir_all(&self.dir).map_err(|e| PatchError::io(&self.dir, e))?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| PatchError::io(&path, e))?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::debug!(target_path = %target, key, "path lock acquired");
                    return Ok(PathLockGuard {
                        file,
                        key,
                        target: target.relative().to_string(),
                    });
                }
                Err(e) if is_contended(&e) => {
                    let waited = started.elapsed();
                    if waited >= self.timeout {
                        tracing::warn!(target_path = %target, key, ?waited, "path lock timed out");
                        return Err(PatchError::LockTimeout {
                            target: target.relative().to_string(),
                            waited,
                        });
                    }
                    tokio::time::sleep(self.poll.min(self.timeout - waited)).await;
                }
                Err(e) => return Err(PatchError::io(&path, e)),
            }
        }
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Proof of exclusive ownership of one target path
#[derive(Debug)]
pub struct PathLockGuard {
    file: File,
    key: i64,
    target: String,
}

impl PathLockGuard {
    #[inline]
    #[must_use]
    pub fn key(&self) -> i64 {
        self.key
    }

    /// Root-relative path this guard covers
    #[inline]
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(target_path = %self.target, error = %e, "path lock release failed");
        } else {
            tracing::debug!(target_path = %self.target, key = self.key, "path lock released");
        }
    }
}
