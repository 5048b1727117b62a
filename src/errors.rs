//! Typed error hierarchy for the Skybridge core.
//!
//! One enum per subsystem:
//! - `IntakeError` — webhook authentication and payload validation
//! - `QueueError` — durable job queue operations
//! - `WorktreeError` — worktree lifecycle and the safe-git guard
//! - `AgentError` — agent subprocess execution
//! - `KanbanError` — kanban projection and external sync

use std::path::PathBuf;

use thiserror::Error;

/// Errors from webhook intake. Every variant is terminal for the request;
/// only `Queue` failures are worth a client retry.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Signature verification failed for source {source_name}")]
    Unauthorized { source_name: String },

    #[error("Missing required header {0}")]
    MissingHeader(&'static str),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Unsupported webhook source: {0}")]
    UnsupportedSource(String),

    #[error("Unsupported event type: {0}")]
    UnsupportedEvent(String),

    #[error("Webhook secret not configured for source {0}")]
    SecretNotConfigured(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Errors from the job queue (both in-memory and file-backed).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job {job_id} already exists in the queue")]
    DuplicateJob { job_id: String },

    #[error("Job {job_id} not found in any bin")]
    JobNotFound { job_id: String },

    #[error("Queue I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt job file at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from worktree management and the safe-git gatekeeper.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("Failed to spawn git: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("git {operation} failed (exit code {exit_code:?}): {stderr}")]
    GitFailed {
        operation: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("git {operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("destructive command blocked: {0}")]
    CommandBlocked(String),

    #[error("Branch must start with 'sky/' or 'sky-test/': '{0}'")]
    BranchPrefixRequired(String),

    #[error("Checkout of existing branch blocked: '{0}'")]
    CheckoutBlocked(String),

    #[error("Empty git command")]
    EmptyCommand,
}

/// Errors from one agent execution.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Agent timed out after {seconds}s without a terminal message")]
    TimedOut { seconds: u64 },

    #[error("Agent exited with code {exit_code:?} before emitting a result")]
    CrashedBeforeResult { exit_code: Option<i32> },

    #[error("Agent result could not be parsed: {0}")]
    MalformedResult(String),

    #[error("Prompt template error: {0}")]
    PromptTemplate(String),
}

/// Errors from the kanban projection and the external provider sync.
#[derive(Debug, Error)]
pub enum KanbanError {
    #[error("Kanban database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("List '{0}' not found")]
    ListNotFound(String),

    #[error("Card {0} not found")]
    CardNotFound(String),

    #[error("Provider request failed: {0}")]
    Provider(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intake_unauthorized_is_matchable() {
        let err = IntakeError::Unauthorized {
            source_name: "github".into(),
        };
        match &err {
            IntakeError::Unauthorized { source_name } => assert_eq!(source_name, "github"),
            _ => panic!("Expected Unauthorized variant"),
        }
        assert!(err.to_string().contains("github"));
    }

    #[test]
    fn queue_error_converts_into_intake_error() {
        let inner = QueueError::DuplicateJob {
            job_id: "github-issues.opened-abc12345".into(),
        };
        let intake: IntakeError = inner.into();
        assert!(matches!(intake, IntakeError::Queue(_)));
    }

    #[test]
    fn queue_io_error_carries_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = QueueError::Io {
            path: PathBuf::from("/queue/jobs/x.json"),
            source: io_err,
        };
        match &err {
            QueueError::Io { path, source } => {
                assert_eq!(path, &PathBuf::from("/queue/jobs/x.json"));
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected Io"),
        }
    }

    #[test]
    fn worktree_blocked_variants_are_distinct() {
        let blocked = WorktreeError::CommandBlocked("git reset --hard".into());
        let prefix = WorktreeError::BranchPrefixRequired("feature-xyz".into());
        assert!(matches!(blocked, WorktreeError::CommandBlocked(_)));
        assert!(matches!(prefix, WorktreeError::BranchPrefixRequired(_)));
        assert!(blocked.to_string().contains("destructive command blocked"));
    }

    #[test]
    fn agent_timeout_carries_seconds() {
        let err = AgentError::TimedOut { seconds: 600 };
        assert!(err.to_string().contains("600"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&IntakeError::MissingHeader("X-GitHub-Event"));
        assert_std_error(&QueueError::JobNotFound { job_id: "x".into() });
        assert_std_error(&WorktreeError::EmptyCommand);
        assert_std_error(&AgentError::TimedOut { seconds: 1 });
        assert_std_error(&KanbanError::ListNotFound("Issues".into()));
    }
}
