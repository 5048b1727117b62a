//! Worktree lifecycle management.
//!
//! Every job gets its own worktree carved from the configured base branch;
//! the directory and branch names are deterministic and carry the job's
//! eight-character suffix so retries never collide. Git subprocesses are
//! capped at 30 seconds.

pub mod git;
pub mod safe_git;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::info;

use crate::errors::WorktreeError;
use crate::webhook::event::{WebhookJob, branch_name, worktree_name};

pub const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: String,
    pub head: Option<String>,
    pub branch: Option<String>,
    pub detached: bool,
}

/// Run git with arguments, bounded by [`GIT_TIMEOUT`]. Returns stdout.
pub(crate) async fn run_git(
    operation: &str,
    args: &[&str],
    cwd: &Path,
) -> Result<String, WorktreeError> {
    let mut cmd = Command::new("git");
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(GIT_TIMEOUT, async {
        cmd.output().await.map_err(WorktreeError::SpawnFailed)
    })
    .await
    .map_err(|_| WorktreeError::Timeout {
        operation: operation.to_string(),
        seconds: GIT_TIMEOUT.as_secs(),
    })??;

    if !output.status.success() {
        return Err(WorktreeError::GitFailed {
            operation: operation.to_string(),
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Creates and reaps per-job worktrees.
pub struct WorktreeManager {
    /// Directory that receives the worktrees.
    base_path: PathBuf,
    /// Main checkout the worktrees are carved from.
    repo_path: PathBuf,
    base_branch: String,
}

impl WorktreeManager {
    pub fn new(
        base_path: impl Into<PathBuf>,
        repo_path: impl Into<PathBuf>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            repo_path: repo_path.into(),
            base_branch: base_branch.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Create the isolated worktree for a job and record its path and
    /// branch on the job.
    pub async fn create_worktree(&self, job: &mut WebhookJob) -> Result<PathBuf, WorktreeError> {
        let name = worktree_name(job);
        let branch = branch_name(job);
        let path = self.base_path.join(&name);

        std::fs::create_dir_all(&self.base_path).map_err(WorktreeError::SpawnFailed)?;

        let path_str = path.to_string_lossy().to_string();
        run_git(
            "worktree add",
            &[
                "worktree",
                "add",
                &path_str,
                "-b",
                &branch,
                &self.base_branch,
            ],
            &self.repo_path,
        )
        .await?;

        info!(job_id = %job.job_id, path = %path_str, branch = %branch, "worktree created");
        job.worktree_path = Some(path_str);
        job.branch_name = Some(branch);
        Ok(path)
    }

    /// Remove a worktree. Callers must first check the owning job reached a
    /// terminal state (`WebhookJob::can_cleanup`).
    pub async fn remove_worktree(&self, worktree_path: &Path) -> Result<(), WorktreeError> {
        let path_str = worktree_path.to_string_lossy().to_string();
        run_git(
            "worktree remove",
            &["worktree", "remove", &path_str],
            &self.repo_path,
        )
        .await?;
        info!(path = %path_str, "worktree removed");
        Ok(())
    }

    /// Parsed `git worktree list --porcelain`, for diagnostics.
    pub async fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, WorktreeError> {
        let stdout = run_git(
            "worktree list",
            &["worktree", "list", "--porcelain"],
            &self.repo_path,
        )
        .await?;
        Ok(parse_porcelain(&stdout))
    }
}

/// Parse the porcelain worktree listing: records separated by blank lines,
/// `worktree ` / `HEAD ` / `branch ` / `detached` prefixed fields.
pub fn parse_porcelain(stdout: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current = WorktreeInfo::default();

    for line in stdout.lines() {
        if line.is_empty() {
            if !current.path.is_empty() {
                worktrees.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some(path) = line.strip_prefix("worktree ") {
            current.path = path.to_string();
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            current.head = Some(head.to_string());
        } else if let Some(branch) = line.strip_prefix("branch ") {
            current.branch = Some(branch.to_string());
        } else if line.starts_with("detached") {
            current.detached = true;
        }
    }
    if !current.path.is_empty() {
        worktrees.push(current);
    }
    worktrees
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::event::{WebhookEvent, WebhookSource};
    use chrono::Utc;

    fn job(issue: i64) -> WebhookJob {
        WebhookJob::create(WebhookEvent {
            source: WebhookSource::GitHub,
            event_type: "issues.opened".into(),
            event_id: issue.to_string(),
            payload: serde_json::json!({"issue": {"number": issue}}),
            received_at: Utc::now(),
            signature: None,
            delivery_id: None,
        })
    }

    #[test]
    fn test_parse_porcelain_multiple_entries() {
        let listing = "worktree /repo\nHEAD abc123\nbranch refs/heads/dev\n\nworktree /wt/skybridge-github-42-deadbeef\nHEAD def456\nbranch refs/heads/webhook/github/issue/42/deadbeef\n\nworktree /wt/detached-one\nHEAD 987fed\ndetached\n";
        let parsed = parse_porcelain(listing);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].path, "/repo");
        assert_eq!(parsed[0].branch.as_deref(), Some("refs/heads/dev"));
        assert_eq!(
            parsed[1].branch.as_deref(),
            Some("refs/heads/webhook/github/issue/42/deadbeef")
        );
        assert!(parsed[2].detached);
        assert!(parsed[2].branch.is_none());
    }

    #[test]
    fn test_parse_porcelain_without_trailing_blank() {
        let listing = "worktree /only\nHEAD abc";
        let parsed = parse_porcelain(listing);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].head.as_deref(), Some("abc"));
    }

    #[test]
    fn test_parse_porcelain_empty() {
        assert!(parse_porcelain("").is_empty());
    }

    // End-to-end worktree creation against a real repository.
    #[tokio::test]
    async fn test_create_and_remove_worktree() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        for args in [
            vec!["init", "-b", "dev"],
            vec!["config", "user.email", "test@test"],
            vec!["config", "user.name", "test"],
        ] {
            let out = std::process::Command::new("git")
                .args(&args)
                .current_dir(&repo)
                .output()
                .unwrap();
            assert!(out.status.success(), "git {args:?} failed");
        }
        std::fs::write(repo.join("README.md"), "seed\n").unwrap();
        for args in [vec!["add", "."], vec!["commit", "-m", "seed"]] {
            let out = std::process::Command::new("git")
                .args(&args)
                .current_dir(&repo)
                .output()
                .unwrap();
            assert!(out.status.success());
        }

        let manager = WorktreeManager::new(dir.path().join("worktrees"), &repo, "dev");
        let mut job = job(42);
        let path = manager.create_worktree(&mut job).await.unwrap();

        assert!(path.exists());
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("skybridge-github-42-"));
        assert!(name.ends_with(job.suffix()));
        assert_eq!(
            job.branch_name.as_deref().unwrap(),
            format!("webhook/github/issue/42/{}", job.suffix())
        );

        let listed = manager.list_worktrees().await.unwrap();
        assert!(listed.iter().any(|w| w.path.ends_with(&name)));

        manager.remove_worktree(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_create_worktree_fails_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorktreeManager::new(
            dir.path().join("worktrees"),
            dir.path().join("not-a-repo"),
            "dev",
        );
        let mut j = job(1);
        let err = manager.create_worktree(&mut j).await.unwrap_err();
        match err {
            WorktreeError::GitFailed { .. } | WorktreeError::SpawnFailed(_) => {}
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(j.worktree_path.is_none());
    }
}
