//! Cross-process exclusive file locks with bounded waiting.
//!
//! Several short-lived invocations can touch the same state files at once.
//! Each read-modify-write holds a `FileLock` for its whole span; acquisition
//! polls a non-blocking `flock` until `timeout` so no caller hangs.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock on {path}")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("Failed to open lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// An exclusively locked file. The lock is released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Open (creating if needed) and exclusively lock `path`.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| LockError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| LockError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                    if started.elapsed() >= timeout {
                        tracing::warn!(path = %path.display(), ?timeout, "Lock acquisition timed out");
                        return Err(LockError::Timeout {
                            path: path.to_path_buf(),
                            waited: started.elapsed(),
                        });
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(source) => {
                    return Err(LockError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }
        }
    }

    /// The locked file, for callers that keep their data in it.
    pub fn file(&mut self) -> &mut File {
        &mut self.file
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::debug!(path = %self.path.display(), error = %err, "Failed to release lock");
        }
    }
}
