//! Snapshot and diff persistence with retention pruning.
//!
//! Layout: `<workspace>/snapshots/<subject>/<snapshot_id>.json` and
//! `<workspace>/diffs/<subject>/<diff_id>.json`. Retention is by file
//! mtime: untagged snapshots 90 days, tagged 365, diffs 90.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::debug;

use super::{Diff, Snapshot, SnapshotSubject};

pub const RETENTION_DAYS: u64 = 90;
pub const RETENTION_TAGGED_DAYS: u64 = 365;

const SUBJECTS: [SnapshotSubject; 4] = [
    SnapshotSubject::Fileops,
    SnapshotSubject::Tasks,
    SnapshotSubject::Health,
    SnapshotSubject::Custom,
];

/// Filesystem store for snapshots and diffs.
pub struct SnapshotStore {
    snapshots_root: PathBuf,
    diffs_root: PathBuf,
}

impl SnapshotStore {
    pub fn new(snapshots_root: impl Into<PathBuf>, diffs_root: impl Into<PathBuf>) -> Self {
        Self {
            snapshots_root: snapshots_root.into(),
            diffs_root: diffs_root.into(),
        }
    }

    fn subject_dir(&self, subject: SnapshotSubject) -> Result<PathBuf> {
        let dir = self.snapshots_root.join(subject.as_str());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    fn diff_dir(&self, subject: SnapshotSubject) -> Result<PathBuf> {
        let dir = self.diffs_root.join(subject.as_str());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<PathBuf> {
        let path = self
            .subject_dir(snapshot.metadata.subject)?
            .join(format!("{}.json", snapshot.metadata.snapshot_id));
        let data = serde_json::to_string_pretty(snapshot).context("Failed to serialize snapshot")?;
        std::fs::write(&path, data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Load by id; searches every subject directory when `subject` is `None`.
    pub fn load_snapshot(
        &self,
        snapshot_id: &str,
        subject: Option<SnapshotSubject>,
    ) -> Result<Snapshot> {
        let candidates: Vec<SnapshotSubject> = match subject {
            Some(s) => vec![s],
            None => SUBJECTS.to_vec(),
        };
        for subject in candidates {
            let path = self
                .snapshots_root
                .join(subject.as_str())
                .join(format!("{snapshot_id}.json"));
            if path.exists() {
                let data = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                return serde_json::from_str(&data)
                    .with_context(|| format!("Corrupt snapshot at {}", path.display()));
            }
        }
        anyhow::bail!("Snapshot not found: {snapshot_id}")
    }

    pub fn list_snapshots(&self, subject: SnapshotSubject) -> Result<Vec<PathBuf>> {
        let dir = self.subject_dir(subject)?;
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        Ok(paths)
    }

    pub fn save_diff(&self, diff: &Diff) -> Result<PathBuf> {
        let path = self
            .diff_dir(diff.subject)?
            .join(format!("{}.json", diff.diff_id));
        let data = serde_json::to_string_pretty(diff).context("Failed to serialize diff")?;
        std::fs::write(&path, data)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Remove snapshots whose mtime precedes the retention cutoff. Tagged
    /// snapshots use the longer window. Returns removed paths.
    pub fn prune_snapshots(&self) -> Result<Vec<PathBuf>> {
        let now = SystemTime::now();
        let mut removed = Vec::new();

        for subject in SUBJECTS {
            for path in self.list_snapshots(subject)? {
                let Ok(data) = std::fs::read_to_string(&path) else {
                    continue;
                };
                let Ok(snapshot) = serde_json::from_str::<Snapshot>(&data) else {
                    continue;
                };
                let days = if snapshot.metadata.tags.is_empty() {
                    RETENTION_DAYS
                } else {
                    RETENTION_TAGGED_DAYS
                };
                if is_older_than(&path, now, days)? {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("Failed to remove {}", path.display()))?;
                    debug!(path = %path.display(), "pruned snapshot");
                    removed.push(path);
                }
            }
        }
        Ok(removed)
    }

    /// Remove diffs older than the retention window. Returns removed paths.
    pub fn prune_diffs(&self) -> Result<Vec<PathBuf>> {
        let now = SystemTime::now();
        let mut removed = Vec::new();

        for subject in SUBJECTS {
            let dir = self.diff_dir(subject)?;
            for entry in std::fs::read_dir(&dir)
                .with_context(|| format!("Failed to list {}", dir.display()))?
            {
                let path = entry?.path();
                if !path.is_file() {
                    continue;
                }
                if is_older_than(&path, now, RETENTION_DAYS)? {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("Failed to remove {}", path.display()))?;
                    removed.push(path);
                }
            }
        }
        Ok(removed)
    }
}

fn is_older_than(path: &Path, now: SystemTime, days: u64) -> Result<bool> {
    let mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let age = now.duration_since(mtime).unwrap_or(Duration::ZERO);
    Ok(age > Duration::from_secs(days * 24 * 3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::capture;
    use tempfile::tempdir;

    fn store(root: &Path) -> SnapshotStore {
        SnapshotStore::new(root.join("snapshots"), root.join("diffs"))
    }

    fn sample_snapshot(root: &Path) -> Snapshot {
        let target = root.join("target");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("f.rs"), "fn f() {}\n").unwrap();
        capture(&target, SnapshotSubject::Fileops).unwrap()
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let snapshot = sample_snapshot(dir.path());

        let path = store.save_snapshot(&snapshot).unwrap();
        assert!(path.ends_with(format!("fileops/{}.json", snapshot.id())));

        let loaded = store.load_snapshot(snapshot.id(), None).unwrap();
        assert_eq!(loaded, snapshot);

        let by_subject = store
            .load_snapshot(snapshot.id(), Some(SnapshotSubject::Fileops))
            .unwrap();
        assert_eq!(by_subject.id(), snapshot.id());
    }

    #[test]
    fn test_load_missing_snapshot_errors() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.load_snapshot("nope", None).is_err());
    }

    #[test]
    fn test_list_snapshots() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.list_snapshots(SnapshotSubject::Fileops).unwrap().is_empty());
        store.save_snapshot(&sample_snapshot(dir.path())).unwrap();
        assert_eq!(store.list_snapshots(SnapshotSubject::Fileops).unwrap().len(), 1);
    }

    #[test]
    fn test_prune_keeps_recent_files() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.save_snapshot(&sample_snapshot(dir.path())).unwrap();

        let removed = store.prune_snapshots().unwrap();
        assert!(removed.is_empty());
        assert_eq!(store.list_snapshots(SnapshotSubject::Fileops).unwrap().len(), 1);
    }

    #[test]
    fn test_save_diff_lands_under_subject() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let a = sample_snapshot(dir.path());
        let diff = crate::snapshot::compare(&a, &a);
        let path = store.save_diff(&diff).unwrap();
        assert!(path.to_string_lossy().contains("diffs/fileops/"));
        assert!(path.exists());
    }
}
