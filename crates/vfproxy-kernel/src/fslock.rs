//! Advisory file locks for shared registry files.
//!
//! Registry files such as `/etc/fstab` or the XFS project tables are edited by
//! several worker processes (and the Watcher). Every read-modify-write of
//! one goes through a [`FileLock`] on a sibling lock file. The lock is held
//! for as long as the returned [`FileLockGuard`] lives; dropping the guard
//! closes the descriptor, which releases the `flock`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rustix::fs::{FlockOperation, flock};
use rustix::io::Errno;

use crate::blocking::run_blocking;
use crate::error::{StorageError, StorageResult};

/// Default time to wait for a contended lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A named exclusive lock backed by `flock(2)`.
#[derive(Clone, Debug)]
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
}

/// Proof of a held [`FileLock`].
#[derive(Debug)]
pub struct FileLockGuard {
    _file: File,
    path: PathBuf,
}

impl FileLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, polling until the timeout elapses.
    pub async fn acquire(&self) -> StorageResult<FileLockGuard> {
        let path = self.path.clone();
        let file = run_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Ok(std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?)
        })
        .await?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match flock(&file, FlockOperation::NonBlockingLockExclusive) {
                Ok(()) => {
                    tracing::trace!(path = %self.path.display(), "file lock acquired");
                    return Ok(FileLockGuard {
                        _file: file,
                        path: self.path.clone(),
                    });
                }
                Err(e) if e == Errno::WOULDBLOCK || e == Errno::INTR => {}
                Err(e) => return Err(StorageError::Io(e.into())),
            }
            if Instant::now() >= deadline {
                return Err(StorageError::execution(format!(
                    "timed out after {:?} waiting for lock {}",
                    self.timeout,
                    self.path.display()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
