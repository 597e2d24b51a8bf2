//! Locking to make sure that multiple copies of the runtime don't clobber each other's cache
//! writes.
//!
//! A sibling `.lock` file created next to the thing being protected, in the style of `elba`'s own
//! `DirLock`, but released on drop alone isn't enough here: the module cache needs bounded waiting
//! and stale-lock reclaim, so this version layers retry-with-timeout and an mtime-based staleness
//! check on top of an `fs2` advisory lock on the sibling file.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use failure::ResultExt;
use fs2::FileExt;

use crate::err::{Error, ErrorKind, Res};

const RETRY_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// An exclusive lock on a logical resource (a cache root, a single module's folder). Held for as
/// long as the guard is alive; released on drop.
pub struct DirLock {
    path: PathBuf,
    file: std::fs::File,
}

impl DirLock {
    /// Blocks (yielding to the async runtime between attempts) until the lock at `path` is
    /// acquired or `timeout` elapses. `path` is the resource being protected; the lock file
    /// itself lives alongside it with a `.lock` extension, matching `elba`'s own convention.
    pub async fn acquire<P: AsRef<Path>>(path: P, timeout: Duration) -> Res<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock_path = lock_path_for(&path);

        let start = Instant::now();
        loop {
            let lp = lock_path.clone();
            let attempt = tokio::task::spawn_blocking(move || try_lock_once(&lp))
                .await
                .expect("lock task panicked");

            match attempt {
                Ok(file) => return Ok(DirLock { path, file }),
                Err(LockAttemptError::Busy) => {
                    if start.elapsed() >= timeout {
                        reclaim_if_stale(&lock_path, timeout);
                        if start.elapsed() >= timeout {
                            return Err(ErrorKind::CacheLocked(path.display().to_string()).into());
                        }
                    }
                    tokio::time::delay_for(RETRY_INTERVAL).await;
                }
                Err(LockAttemptError::Io(e)) => return Err(Error::from(e)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) -> Res<()> {
        FileExt::unlock(&self.file).context(ErrorKind::Io)?;
        Ok(())
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut p = path.to_path_buf();
    let name = format!(
        "{}.lock",
        path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    );
    p.set_file_name(name);
    p
}

enum LockAttemptError {
    Busy,
    Io(io::Error),
}

fn try_lock_once(lock_path: &Path) -> Result<std::fs::File, LockAttemptError> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(lock_path)
        .map_err(LockAttemptError::Io)?;

    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(LockAttemptError::Busy),
        Err(e) => Err(LockAttemptError::Io(e)),
    }
}

/// If the lock file's mtime predates `timeout`, the holder almost certainly died without
/// releasing it (a crashed process, a killed container); remove it so the next attempt can
/// succeed rather than waiting forever.
fn reclaim_if_stale(lock_path: &Path, timeout: Duration) {
    if let Ok(meta) = std::fs::metadata(lock_path) {
        if let Ok(modified) = meta.modified() {
            if SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default()
                >= timeout
            {
                let _ = std::fs::remove_file(lock_path);
            }
        }
    }
}
