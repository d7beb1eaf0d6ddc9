// crates/island/src/live/watcher.rs
//! File system watcher for session log files.
//!
//! Watches the sessions root for `.jsonl` changes and emits created /
//! modified / removed events with sub-second latency.
//!
//! ## Path depth filtering
//!
//! ```text
//! ~/.pi/agent/sessions/
//! ├── {project}/
//! │   └── {timestamp}_{uuid}.jsonl     ← session log (WATCH)
//! ```
//!
//! Only paths exactly 2 components below the root are considered, matching
//! what the startup scan reads.
//!
//! ## Classification
//!
//! Raw notify events are coalesced for the configured latency, then each
//! path is stat'ed and compared with a `(mtime, size)` cache:
//! - not cached and present → `Created` (whatever the raw event said)
//! - cached and gone → `Removed`
//! - cached and changed → `Modified`
//! - cached and unchanged → suppressed

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use pi_island_core::is_session_file;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_LATENCY: Duration = Duration::from_millis(100);

/// Events emitted by the watcher, pre-filtered to session logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created {
        path: PathBuf,
        modified: DateTime<Utc>,
    },
    Modified {
        path: PathBuf,
        modified: DateTime<Utc>,
    },
    Removed {
        path: PathBuf,
    },
}

impl FileEvent {
    pub fn path(&self) -> &Path {
        match self {
            FileEvent::Created { path, .. }
            | FileEvent::Modified { path, .. }
            | FileEvent::Removed { path } => path,
        }
    }
}

/// What notify reported, before comparing against the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawChange {
    Created,
    Modified,
    Removed,
}

impl RawChange {
    /// Map notify event kinds. Metadata and xattr changes count as content
    /// modifications: some write patterns only surface that way.
    pub fn from_kind(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Create(_) => Some(RawChange::Created),
            EventKind::Modify(ModifyKind::Name(_)) => Some(RawChange::Created),
            EventKind::Modify(_) => Some(RawChange::Modified),
            EventKind::Remove(_) => Some(RawChange::Removed),
            EventKind::Any | EventKind::Other => Some(RawChange::Modified),
            EventKind::Access(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub modified: SystemTime,
    pub size: u64,
}

impl FileStamp {
    fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: metadata.len(),
        }
    }
}

/// `path → (mtime, size)` for every known session log.
#[derive(Debug, Default)]
pub struct FileIndex {
    entries: HashMap<PathBuf, FileStamp>,
}

impl FileIndex {
    /// Populate from every session log currently under `root`.
    pub fn scan(root: &Path) -> Self {
        let mut index = Self::default();
        let projects = match std::fs::read_dir(root) {
            Ok(rd) => rd,
            Err(e) => {
                debug!(root = %root.display(), error = %e, "sessions root not readable; empty index");
                return index;
            }
        };

        for project in projects.flatten() {
            let project_path = project.path();
            if !project_path.is_dir() {
                continue;
            }
            let Ok(files) = std::fs::read_dir(&project_path) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                if !is_session_file(&path) {
                    continue;
                }
                match file.metadata() {
                    Ok(m) if m.is_file() => {
                        index.entries.insert(path, FileStamp::of(&m));
                    }
                    _ => continue,
                }
            }
        }
        index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// Compare a raw change with the cache. `current` is the file's stamp
    /// right now, or `None` if it no longer exists.
    pub fn classify(
        &mut self,
        path: &Path,
        raw: RawChange,
        current: Option<FileStamp>,
    ) -> Option<FileEvent> {
        let Some(stamp) = current else {
            return self.entries.remove(path).map(|_| FileEvent::Removed {
                path: path.to_path_buf(),
            });
        };

        let modified: DateTime<Utc> = stamp.modified.into();
        match self.entries.insert(path.to_path_buf(), stamp) {
            None => Some(FileEvent::Created {
                path: path.to_path_buf(),
                modified,
            }),
            Some(previous) if previous == stamp => {
                debug!(path = %path.display(), ?raw, "unchanged; suppressed");
                None
            }
            Some(_) => Some(FileEvent::Modified {
                path: path.to_path_buf(),
                modified,
            }),
        }
    }
}

/// True for `{root}/{project}/{file}.jsonl`.
pub fn is_watched_path(root: &Path, path: &Path) -> bool {
    is_session_file(path)
        && path
            .strip_prefix(root)
            .is_ok_and(|rel| rel.components().count() == 2)
}

/// Keeps the watch alive; dropping it stops both notify and the classifier.
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start watching `root`, sending classified events on `tx`.
///
/// If the root does not exist yet, logs a warning and returns a watcher that
/// watches nothing.
pub fn start_watcher(
    root: PathBuf,
    latency: Duration,
    tx: mpsc::Sender<FileEvent>,
) -> notify::Result<WatcherHandle> {
    let (raw_tx, raw_rx) = mpsc::unbounded_channel::<(PathBuf, RawChange)>();
    let filter_root = root.clone();

    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                let Some(change) = RawChange::from_kind(&event.kind) else {
                    return;
                };
                for path in event.paths {
                    if is_watched_path(&filter_root, &path) {
                        let _ = raw_tx.send((path, change));
                    }
                }
            }
            Err(e) => error!("File watcher error: {}", e),
        })?;

    if root.exists() {
        watcher.watch(&root, RecursiveMode::Recursive)?;
        info!(root = %root.display(), "watching session logs");
    } else {
        warn!(root = %root.display(), "sessions directory does not exist; file watcher idle");
    }

    let scan_root = root.clone();
    let task = tokio::spawn(async move {
        let index = tokio::task::spawn_blocking(move || FileIndex::scan(&scan_root))
            .await
            .unwrap_or_default();
        debug!(files = index.len(), "initial watcher scan complete");
        classify_loop(index, raw_rx, latency, tx).await;
    });

    Ok(WatcherHandle {
        _watcher: watcher,
        task,
    })
}

async fn classify_loop(
    mut index: FileIndex,
    mut raw_rx: mpsc::UnboundedReceiver<(PathBuf, RawChange)>,
    latency: Duration,
    tx: mpsc::Sender<FileEvent>,
) {
    while let Some(first) = raw_rx.recv().await {
        let batch = coalesce(first, &mut raw_rx, latency).await;
        for (path, raw) in batch {
            let current = tokio::fs::metadata(&path)
                .await
                .ok()
                .filter(|m| m.is_file())
                .map(|m| FileStamp::of(&m));
            if let Some(event) = index.classify(&path, raw, current) {
                debug!(?event, "session file event");
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Gather everything arriving within `latency` of `first`, one entry per
/// path in first-seen order.
async fn coalesce(
    first: (PathBuf, RawChange),
    raw_rx: &mut mpsc::UnboundedReceiver<(PathBuf, RawChange)>,
    latency: Duration,
) -> Vec<(PathBuf, RawChange)> {
    let mut batch = vec![first];
    let deadline = tokio::time::Instant::now() + latency;
    while let Ok(Some((path, change))) = tokio::time::timeout_at(deadline, raw_rx.recv()).await {
        match batch.iter_mut().find(|(p, _)| *p == path) {
            Some(entry) => entry.1 = change,
            None => batch.push((path, change)),
        }
    }
    batch
}
