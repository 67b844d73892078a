//! Deletes task-owned upload files.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Deleted { bytes: u64 },
    /// Nothing to delete; also what a second cleanup of the same path sees.
    AlreadyGone,
    Failed(String),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FileJanitor;

impl FileJanitor {
    /// Remove `path`. Never returns an error; problems are logged.
    pub async fn cleanup(&self, path: &Path) -> CleanupOutcome {
        let bytes = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("Cleanup: {:?} already gone", path);
                return CleanupOutcome::AlreadyGone;
            }
            Err(_) => 0,
        };

        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                log::info!("Cleanup: deleted {:?} ({} bytes)", path, bytes);
                CleanupOutcome::Deleted { bytes }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => CleanupOutcome::AlreadyGone,
            Err(e) => {
                log::warn!("Cleanup: failed to delete {:?}: {}", path, e);
                CleanupOutcome::Failed(e.to_string())
            }
        }
    }

    /// Delete files in `dir` older than `max_age` that no processing task
    /// owns. Returns the deleted paths.
    pub async fn sweep_orphans(
        &self,
        dir: &Path,
        max_age: Duration,
        active: &HashSet<PathBuf>,
    ) -> Vec<PathBuf> {
        let mut deleted = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return deleted,
            Err(e) => {
                log::warn!("Sweep: cannot read {:?}: {}", dir, e);
                return deleted;
            }
        };

        let now = SystemTime::now();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Sweep: error listing {:?}: {}", dir, e);
                    break;
                }
            };
            let path = entry.path();
            if active.contains(&path) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            if let CleanupOutcome::Deleted { .. } = self.cleanup(&path).await {
                deleted.push(path);
            }
        }

        if !deleted.is_empty() {
            log::info!("Sweep: removed {} orphaned uploads from {:?}", deleted.len(), dir);
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("upload.txt");
        std::fs::write(&path, "hello").unwrap();

        let janitor = FileJanitor;
        assert_eq!(janitor.cleanup(&path).await, CleanupOutcome::Deleted { bytes: 5 });
        assert!(!path.exists());
        assert_eq!(janitor.cleanup(&path).await, CleanupOutcome::AlreadyGone);
    }

    #[tokio::test]
    async fn test_cleanup_failure_is_reported_not_raised() {
        let temp = TempDir::new().unwrap();
        // A directory cannot be removed with remove_file
        let dir = temp.path().join("folder");
        std::fs::create_dir(&dir).unwrap();

        let outcome = FileJanitor.cleanup(&dir).await;
        assert!(matches!(outcome, CleanupOutcome::Failed(_)));
        assert!(dir.exists());
    }

    #[tokio::test]
    async fn test_sweep_skips_active_and_fresh_files() {
        let temp = TempDir::new().unwrap();
        let active = temp.path().join("active.txt");
        let orphan = temp.path().join("orphan.txt");
        std::fs::write(&active, "a").unwrap();
        std::fs::write(&orphan, "b").unwrap();

        let janitor = FileJanitor;
        let keep: HashSet<PathBuf> = [active.clone()].into_iter().collect();

        // Everything is fresh: nothing goes
        let deleted = janitor
            .sweep_orphans(temp.path(), Duration::from_secs(3600), &keep)
            .await;
        assert!(deleted.is_empty());

        let deleted = janitor.sweep_orphans(temp.path(), Duration::ZERO, &keep).await;
        assert_eq!(deleted, vec![orphan.clone()]);
        assert!(active.exists());
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn test_sweep_missing_dir() {
        let temp = TempDir::new().unwrap();
        let deleted = FileJanitor
            .sweep_orphans(&temp.path().join("nope"), Duration::ZERO, &HashSet::new())
            .await;
        assert!(deleted.is_empty());
    }
}
