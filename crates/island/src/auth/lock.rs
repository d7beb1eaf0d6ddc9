// crates/island/src/auth/lock.rs
//! Cross-process mutex built on an exclusively-created lock file.
//!
//! Holder writes its pid into `<target>.lock`. A lock file older than the
//! staleness timeout is assumed abandoned and removed. Contention is retried
//! with exponential backoff.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock {path} still held after {attempts} attempts")]
    Contended { path: PathBuf, attempts: u32 },

    #[error("Failed to create lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub stale_after: Duration,
    pub initial_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(50),
            max_attempts: 8,
        }
    }
}

/// Held lock. Dropping it removes the lock file.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Lock path guarding `target`.
    pub fn path_for(target: &Path) -> PathBuf {
        let mut name = target.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        target.with_file_name(name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock guarding `target`.
    pub async fn acquire(target: &Path, options: LockOptions) -> Result<Self, LockError> {
        let path = Self::path_for(target);
        let mut backoff = options.initial_backoff;

        for attempt in 1..=options.max_attempts {
            match try_create(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), attempt, "lock acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if is_stale(&path, options.stale_after) {
                        warn!(path = %path.display(), "removing stale lock");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                }
                Err(source) => return Err(LockError::Io { path, source }),
            }

            if attempt < options.max_attempts {
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }

        Err(LockError::Contended {
            path,
            attempts: options.max_attempts,
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "lock file already gone");
        }
    }
}

fn try_create(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    // Informational only.
    let _ = writeln!(file, "{}", std::process::id());
    Ok(())
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .is_some_and(|age| age > stale_after)
}
