//! Git plumbing the orchestrator runs inside a job's worktree: staging,
//! committing, pushing, and PR creation through the `gh` CLI.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::info;

use super::run_git;
use crate::errors::WorktreeError;

/// Whether the worktree has any staged, unstaged, or untracked changes.
pub async fn has_changes(worktree: &Path) -> Result<bool, WorktreeError> {
    let stdout = run_git("status", &["status", "--porcelain"], worktree).await?;
    Ok(!stdout.trim().is_empty())
}

/// Stage everything in the worktree.
pub async fn stage_all(worktree: &Path) -> Result<(), WorktreeError> {
    run_git("add", &["add", "-A"], worktree).await?;
    Ok(())
}

/// Commit staged changes and return the new commit hash.
pub async fn commit(worktree: &Path, message: &str) -> Result<String, WorktreeError> {
    run_git("commit", &["commit", "-m", message], worktree).await?;
    let hash = run_git("rev-parse", &["rev-parse", "HEAD"], worktree).await?;
    let hash = hash.trim().to_string();
    info!(commit = %hash, "changes committed");
    Ok(hash)
}

/// Push the branch, setting the upstream on first push.
pub async fn push(worktree: &Path, branch: &str) -> Result<(), WorktreeError> {
    run_git("push", &["push", "-u", "origin", branch], worktree).await?;
    info!(branch = %branch, "branch pushed");
    Ok(())
}

/// Short human summary of the staged changes: file list plus `--stat`
/// totals. Call after [`stage_all`] so newly created files are included.
pub async fn diff_summary(worktree: &Path) -> Result<String, WorktreeError> {
    let files = run_git(
        "diff --cached --name-only",
        &["diff", "--cached", "--name-only"],
        worktree,
    )
    .await?;
    let stat = run_git(
        "diff --cached --stat",
        &["diff", "--cached", "--stat"],
        worktree,
    )
    .await?;
    Ok(format!(
        "Files changed:\n{}\n\nStatistics:\n{}",
        files.trim(),
        stat.trim()
    ))
}

/// Create a pull request for the pushed branch via the `gh` CLI. Returns
/// the PR URL.
pub async fn create_pull_request(
    worktree: &Path,
    title: &str,
    body: &str,
    base_branch: &str,
) -> Result<String, WorktreeError> {
    let output = Command::new("gh")
        .args(["pr", "create", "--title", title, "--body", body, "--base", base_branch])
        .current_dir(worktree)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(WorktreeError::SpawnFailed)?;

    if !output.status.success() {
        return Err(WorktreeError::GitFailed {
            operation: "gh pr create".to_string(),
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let pr_url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    info!(pr_url = %pr_url, "pull request created");
    Ok(pr_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "dev"],
            vec!["config", "user.email", "test@test"],
            vec!["config", "user.name", "test"],
        ] {
            let out = std::process::Command::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .unwrap();
            assert!(out.status.success());
        }
    }

    #[tokio::test]
    async fn test_has_changes_and_stage_commit_cycle() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());

        assert!(!has_changes(dir.path()).await.unwrap());

        std::fs::write(dir.path().join("fix.rs"), "fn fixed() {}\n").unwrap();
        assert!(has_changes(dir.path()).await.unwrap());

        stage_all(dir.path()).await.unwrap();
        let hash = commit(dir.path(), "fix: retry loop\n\nFixes #42")
            .await
            .unwrap();
        assert_eq!(hash.len(), 40);
        assert!(!has_changes(dir.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_without_staged_changes_fails() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let err = commit(dir.path(), "empty").await.unwrap_err();
        assert!(matches!(err, WorktreeError::GitFailed { .. }));
    }

    #[tokio::test]
    async fn test_diff_summary_covers_staged_changes() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        stage_all(dir.path()).await.unwrap();
        commit(dir.path(), "seed").await.unwrap();

        // One modification and one brand-new file; both must show up once
        // staged.
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        std::fs::write(dir.path().join("fresh.rs"), "fn fresh() {}\n").unwrap();
        stage_all(dir.path()).await.unwrap();

        let summary = diff_summary(dir.path()).await.unwrap();
        assert!(summary.contains("a.txt"));
        assert!(summary.contains("fresh.rs"));
        assert!(summary.contains("Statistics:"));
    }
}
