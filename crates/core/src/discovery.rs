// crates/core/src/discovery.rs
//! Startup scan of the sessions root.
//!
//! `<root>/<project>/<timestamp>_<uuid>.jsonl`. Only the newest few files of
//! each project are loaded, so startup cost does not grow with history.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::fs;
use tracing::debug;

use crate::error::DiscoveryError;
use crate::parser::parse_session_file;
use crate::paths;
use crate::session::Session;

/// Returns the sessions root (`~/.pi/agent/sessions`).
///
/// # Errors
/// Returns `DiscoveryError::HomeDirNotFound` if the home directory cannot be determined.
pub fn default_sessions_dir() -> Result<PathBuf, DiscoveryError> {
    paths::sessions_dir().ok_or(DiscoveryError::HomeDirNotFound)
}

pub fn is_session_file(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "jsonl")
}

/// A session log found on disk, with the mtime used for ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFileEntry {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
}

/// Up to `per_project` most-recently-modified logs from every project dir.
///
/// A missing root is an empty result, not an error.
///
/// # Errors
/// Returns an error when the root exists but cannot be listed.
pub async fn recent_session_files(
    root: &Path,
    per_project: usize,
) -> Result<Vec<SessionFileEntry>, DiscoveryError> {
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(root = %root.display(), "sessions directory does not exist");
            return Ok(vec![]);
        }
        Err(e) => return Err(DiscoveryError::io(root, e)),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| DiscoveryError::io(root, e))?
    {
        let project = entry.path();
        if !entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            continue;
        }
        match project_session_files(&project).await {
            Ok(mut files) => {
                files.truncate(per_project);
                found.extend(files);
            }
            Err(e) => debug!(project = %project.display(), error = %e, "skipping unreadable project"),
        }
    }

    found.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(found)
}

/// All logs in one project directory, newest first.
async fn project_session_files(project: &Path) -> Result<Vec<SessionFileEntry>, std::io::Error> {
    let mut entries = fs::read_dir(project).await?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_session_file(&path) {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        files.push(SessionFileEntry {
            path,
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: metadata.len(),
        });
    }

    files.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(files)
}

/// Parse the recent logs into historical sessions, newest first.
///
/// Listing and parse failures are logged and treated as "nothing to load".
pub async fn load_recent_sessions(root: &Path, per_project: usize) -> Vec<Session> {
    let files = match recent_session_files(root, per_project).await {
        Ok(files) => files,
        Err(e) => {
            tracing::warn!(root = %root.display(), error = %e, "cannot list sessions directory");
            return vec![];
        }
    };

    let mut sessions = Vec::with_capacity(files.len());
    for file in files {
        match parse_session_file(&file.path).await {
            Ok(Some(mut session)) => {
                session.file_modified_at = Some(file.modified.into());
                sessions.push(session);
            }
            Ok(None) => debug!(path = %file.path.display(), "log has no session header"),
            Err(e) => debug!(path = %file.path.display(), error = %e, "skipping unreadable log"),
        }
    }
    sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
    sessions
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self as stdfs, File, FileTimes};
    use std::time::Duration;

    fn write_log(dir: &Path, name: &str, cwd: &str, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        stdfs::write(
            &path,
            format!("{{\"type\":\"session\",\"cwd\":\"{cwd}\"}}\n{{\"type\":\"message\",\"message\":{{\"role\":\"user\",\"content\":\"{name}\"}}}}\n"),
        )
        .unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_times(FileTimes::new().set_modified(mtime))
            .unwrap();
        path
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let files = recent_session_files(Path::new("/nonexistent/pi/sessions"), 3)
            .await
            .unwrap();
        assert!(files.is_empty());
        assert!(load_recent_sessions(Path::new("/nonexistent/pi/sessions"), 3)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_takes_newest_per_project() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("--a--");
        let b = tmp.path().join("--b--");
        stdfs::create_dir_all(&a).unwrap();
        stdfs::create_dir_all(&b).unwrap();

        for (i, age) in [50u64, 40, 30, 20, 10].iter().enumerate() {
            write_log(&a, &format!("t{i}_a{i}.jsonl"), "/a", *age);
        }
        write_log(&b, "t0_b0.jsonl", "/b", 100);
        stdfs::write(b.join("notes.txt"), "ignore me").unwrap();
        stdfs::write(tmp.path().join("stray_x.jsonl"), "{}").unwrap();

        let files = recent_session_files(tmp.path(), 3).await.unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["t4_a4.jsonl", "t3_a3.jsonl", "t2_a2.jsonl", "t0_b0.jsonl"]);

        let sessions = load_recent_sessions(tmp.path(), 3).await;
        assert_eq!(sessions.len(), 4);
        assert!(sessions.iter().all(|s| !s.is_live() && s.file_modified_at.is_some()));
        assert!(sessions.iter().any(|s| s.id == "b0"));
    }
}
