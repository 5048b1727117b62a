//! Directory fingerprints.
//!
//! A snapshot records per-file path and size plus aggregate stats for one
//! subtree; two snapshots of the same subject can be diffed to describe what
//! an agent actually touched. Snapshots are metadata-only: file contents are
//! never stored.

pub mod diff;
pub mod store;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use walkdir::WalkDir;

pub use diff::{Diff, DiffChange, DiffItem, DiffSummary, compare};

/// Observable domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSubject {
    Fileops,
    Tasks,
    Health,
    Custom,
}

impl SnapshotSubject {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fileops => "fileops",
            Self::Tasks => "tasks",
            Self::Health => "health",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotMetadata {
    pub snapshot_id: String,
    pub timestamp: DateTime<Utc>,
    pub subject: SnapshotSubject,
    /// The observed path or logical target.
    pub target: String,
    #[serde(default)]
    pub git_hash: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    /// Custom tags; tagged snapshots get the longer retention.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotStats {
    pub total_files: u64,
    pub total_dirs: u64,
    pub total_size: u64,
    /// Extension → file count.
    #[serde(default)]
    pub file_types: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub stats: SnapshotStats,
    /// Sorted by path, so serialization is deterministic.
    pub files: Vec<FileRecord>,
}

impl Snapshot {
    pub fn id(&self) -> &str {
        &self.metadata.snapshot_id
    }
}

/// Capture a fingerprint of `target`. The `.git` directory is skipped; if
/// the target sits in a git repository, HEAD and branch are stamped on the
/// metadata.
pub fn capture(target: &Path, subject: SnapshotSubject) -> std::io::Result<Snapshot> {
    let mut files = Vec::new();
    let mut total_dirs: u64 = 0;
    let mut total_size: u64 = 0;
    let mut file_types: BTreeMap<String, u64> = BTreeMap::new();

    for entry in WalkDir::new(target)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git")
    {
        let entry = entry.map_err(std::io::Error::other)?;
        if entry.depth() == 0 {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(target)
            .expect("walkdir yields children of target")
            .to_string_lossy()
            .replace('\\', "/");

        if entry.file_type().is_dir() {
            total_dirs += 1;
        } else if entry.file_type().is_file() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            total_size += size;
            let ext = entry
                .path()
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_else(|| "(none)".to_string());
            *file_types.entry(ext).or_insert(0) += 1;
            files.push(FileRecord { path: rel, size });
        }
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let (git_hash, git_branch) = git_context(target);

    Ok(Snapshot {
        metadata: SnapshotMetadata {
            snapshot_id: Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            subject,
            target: target.to_string_lossy().to_string(),
            git_hash,
            git_branch,
            tags: BTreeMap::new(),
        },
        stats: SnapshotStats {
            total_files: files.len() as u64,
            total_dirs,
            total_size,
            file_types,
        },
        files,
    })
}

/// Read-only HEAD and branch of the repository containing `target`, when
/// there is one.
fn git_context(target: &Path) -> (Option<String>, Option<String>) {
    let Ok(repo) = git2::Repository::discover(target) else {
        return (None, None);
    };
    let Ok(head) = repo.head() else {
        return (None, None);
    };
    let hash = head.peel_to_commit().ok().map(|c| c.id().to_string());
    let branch = head.shorthand().map(str::to_string);
    (hash, branch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn populate(root: &Path) {
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/main.rs"), "fn main() {}\n").unwrap();
        std::fs::write(root.join("src/lib.rs"), "pub mod x;\n").unwrap();
        std::fs::write(root.join("README.md"), "# readme\n").unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join(".git/HEAD"), "ref: refs/heads/dev\n").unwrap();
    }

    #[test]
    fn test_capture_counts_and_skips_git_dir() {
        let dir = tempdir().unwrap();
        populate(dir.path());

        let snap = capture(dir.path(), SnapshotSubject::Fileops).unwrap();
        assert_eq!(snap.stats.total_files, 3);
        assert_eq!(snap.stats.total_dirs, 1);
        assert!(snap.stats.total_size > 0);
        assert!(snap.files.iter().all(|f| !f.path.starts_with(".git")));
        assert_eq!(snap.stats.file_types["rs"], 2);
        assert_eq!(snap.stats.file_types["md"], 1);
    }

    #[test]
    fn test_capture_files_sorted_by_path() {
        let dir = tempdir().unwrap();
        populate(dir.path());
        let snap = capture(dir.path(), SnapshotSubject::Fileops).unwrap();
        let paths: Vec<&str> = snap.files.iter().map(|f| f.path.as_str()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn test_serialize_round_trip_is_byte_identical() {
        let dir = tempdir().unwrap();
        populate(dir.path());
        let snap = capture(dir.path(), SnapshotSubject::Fileops).unwrap();

        let first = serde_json::to_string(&snap).unwrap();
        let back: Snapshot = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string(&back).unwrap();
        assert_eq!(first, second);
        assert_eq!(snap, back);
    }

    #[test]
    fn test_capture_empty_directory() {
        let dir = tempdir().unwrap();
        let snap = capture(dir.path(), SnapshotSubject::Health).unwrap();
        assert_eq!(snap.stats.total_files, 0);
        assert_eq!(snap.stats.total_size, 0);
        assert!(snap.files.is_empty());
    }

    #[test]
    fn test_subject_strings() {
        assert_eq!(SnapshotSubject::Fileops.as_str(), "fileops");
        assert_eq!(SnapshotSubject::Tasks.as_str(), "tasks");
        assert_eq!(SnapshotSubject::Health.as_str(), "health");
    }
}
