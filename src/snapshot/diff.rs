//! Snapshot comparison.
//!
//! `compare(old, new)` classifies every path as added, removed, modified, or
//! moved. A move is a removed file and an added file sharing basename and
//! size; the pairing is symmetric, so comparing in the opposite order swaps
//! the added/removed counters and keeps modified/moved equal.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Snapshot, SnapshotSubject};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffChange {
    Added,
    Removed,
    Modified,
    Moved,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffItem {
    #[serde(rename = "type")]
    pub change: DiffChange,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_delta: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiffSummary {
    pub added_files: u64,
    pub removed_files: u64,
    pub modified_files: u64,
    pub moved_files: u64,
    pub added_dirs: u64,
    pub removed_dirs: u64,
    pub size_delta: i64,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.added_files == 0
            && self.removed_files == 0
            && self.modified_files == 0
            && self.moved_files == 0
            && self.added_dirs == 0
            && self.removed_dirs == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diff {
    pub diff_id: String,
    pub timestamp: DateTime<Utc>,
    pub old_snapshot_id: String,
    pub new_snapshot_id: String,
    pub subject: SnapshotSubject,
    pub summary: DiffSummary,
    /// Ordered by path within each change class.
    pub changes: Vec<DiffItem>,
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn dir_set(files: &BTreeMap<&str, u64>) -> BTreeSet<String> {
    let mut dirs = BTreeSet::new();
    for path in files.keys() {
        let mut current = *path;
        while let Some((parent, _)) = current.rsplit_once('/') {
            dirs.insert(parent.to_string());
            current = parent;
        }
    }
    dirs
}

/// Compare two snapshots of the same subject.
pub fn compare(old: &Snapshot, new: &Snapshot) -> Diff {
    let old_files: BTreeMap<&str, u64> = old
        .files
        .iter()
        .map(|f| (f.path.as_str(), f.size))
        .collect();
    let new_files: BTreeMap<&str, u64> = new
        .files
        .iter()
        .map(|f| (f.path.as_str(), f.size))
        .collect();

    let mut added: Vec<(&str, u64)> = Vec::new();
    let mut removed: Vec<(&str, u64)> = Vec::new();
    let mut changes = Vec::new();

    for (path, new_size) in &new_files {
        match old_files.get(path) {
            None => added.push((path, *new_size)),
            Some(old_size) if old_size != new_size => changes.push(DiffItem {
                change: DiffChange::Modified,
                path: (*path).to_string(),
                old_path: None,
                size_delta: Some(*new_size as i64 - *old_size as i64),
            }),
            Some(_) => {}
        }
    }
    for (path, old_size) in &old_files {
        if !new_files.contains_key(path) {
            removed.push((path, *old_size));
        }
    }

    // Pair moves: one removed and one added entry with the same basename
    // and size. Each side is consumed at most once.
    let mut moved = Vec::new();
    let mut consumed_added = vec![false; added.len()];
    removed.retain(|(old_path, old_size)| {
        let slot = added.iter().enumerate().position(|(i, (new_path, new_size))| {
            !consumed_added[i]
                && *new_size == *old_size
                && basename(new_path) == basename(old_path)
        });
        match slot {
            Some(i) => {
                consumed_added[i] = true;
                moved.push(DiffItem {
                    change: DiffChange::Moved,
                    path: added[i].0.to_string(),
                    old_path: Some((*old_path).to_string()),
                    size_delta: Some(0),
                });
                false
            }
            None => true,
        }
    });
    let added: Vec<(&str, u64)> = added
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !consumed_added[*i])
        .map(|(_, pair)| pair)
        .collect();

    for (path, size) in &added {
        changes.push(DiffItem {
            change: DiffChange::Added,
            path: (*path).to_string(),
            old_path: None,
            size_delta: Some(*size as i64),
        });
    }
    for (path, size) in &removed {
        changes.push(DiffItem {
            change: DiffChange::Removed,
            path: (*path).to_string(),
            old_path: None,
            size_delta: Some(-(*size as i64)),
        });
    }
    changes.extend(moved);
    changes.sort_by(|a, b| a.path.cmp(&b.path));

    let old_dirs = dir_set(&old_files);
    let new_dirs = dir_set(&new_files);

    let summary = DiffSummary {
        added_files: changes
            .iter()
            .filter(|c| c.change == DiffChange::Added)
            .count() as u64,
        removed_files: changes
            .iter()
            .filter(|c| c.change == DiffChange::Removed)
            .count() as u64,
        modified_files: changes
            .iter()
            .filter(|c| c.change == DiffChange::Modified)
            .count() as u64,
        moved_files: changes
            .iter()
            .filter(|c| c.change == DiffChange::Moved)
            .count() as u64,
        added_dirs: new_dirs.difference(&old_dirs).count() as u64,
        removed_dirs: old_dirs.difference(&new_dirs).count() as u64,
        size_delta: new.stats.total_size as i64 - old.stats.total_size as i64,
    };

    Diff {
        diff_id: Uuid::new_v4().simple().to_string(),
        timestamp: Utc::now(),
        old_snapshot_id: old.metadata.snapshot_id.clone(),
        new_snapshot_id: new.metadata.snapshot_id.clone(),
        subject: new.metadata.subject,
        summary,
        changes,
    }
}
