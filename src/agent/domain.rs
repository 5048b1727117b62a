//! Agent execution lifecycle records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::AgentMessage;

/// States of one agent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Subprocess configured, not yet started.
    Created,
    Running,
    /// Wall-clock timeout expired before a terminal message.
    TimedOut,
    Completed,
    Failed,
}

impl AgentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TimedOut | Self::Completed | Self::Failed)
    }
}

/// One reasoning step surfaced by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingStep {
    pub step: u32,
    pub thought: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Structured output of a finished agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub changes_made: bool,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_deleted: Vec<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub thinkings: Vec<ThinkingStep>,
}

impl AgentResult {
    pub fn touched_files(&self) -> usize {
        self.files_created.len() + self.files_modified.len() + self.files_deleted.len()
    }
}

/// How a failed execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Exited without emitting a terminal message.
    Crashed,
    /// Terminal message present but unparseable.
    Malformed,
    /// Terminal message parsed and flagged `is_error`.
    AgentReported,
}

/// Classification of a finished execution; only `SuccessWithChanges`
/// advances a job to the commit step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    SuccessWithChanges,
    SuccessNoChanges,
    /// No terminal message inside the timeout.
    TimedOut,
    /// Exited (typically nonzero) without a terminal message.
    CrashedBeforeResult,
    /// Terminal message present but could not be parsed.
    MalformedResult,
    /// Agent reported its own failure in a well-formed result.
    Failed,
}

/// Lifecycle record for one agent subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecution {
    pub agent_type: String,
    pub job_id: String,
    pub worktree_path: String,
    pub skill: String,
    pub state: AgentState,
    #[serde(default)]
    pub result: Option<AgentResult>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub failure_kind: Option<FailureKind>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Every streamed message in arrival order.
    #[serde(default)]
    pub streamed_messages: Vec<AgentMessage>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_seconds: u64,
}

impl AgentExecution {
    pub fn new(
        agent_type: impl Into<String>,
        job_id: impl Into<String>,
        worktree_path: impl Into<String>,
        skill: impl Into<String>,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            job_id: job_id.into(),
            worktree_path: worktree_path.into(),
            skill: skill.into(),
            state: AgentState::Created,
            result: None,
            error_message: None,
            failure_kind: None,
            stdout: String::new(),
            stderr: String::new(),
            streamed_messages: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout_seconds,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = AgentState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, result: AgentResult) {
        self.state = AgentState::Completed;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
    }

    pub fn mark_timed_out(&mut self, error: impl Into<String>) {
        self.state = AgentState::TimedOut;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(error.into());
    }

    pub fn mark_failed(&mut self, kind: FailureKind, error: impl Into<String>) {
        self.state = AgentState::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(error.into());
        self.failure_kind = Some(kind);
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    /// Failure taxonomy for the orchestrator.
    pub fn outcome(&self) -> ExecutionOutcome {
        match self.state {
            AgentState::TimedOut => ExecutionOutcome::TimedOut,
            AgentState::Failed => match self.failure_kind {
                Some(FailureKind::Crashed) => ExecutionOutcome::CrashedBeforeResult,
                Some(FailureKind::Malformed) => ExecutionOutcome::MalformedResult,
                Some(FailureKind::AgentReported) | None => ExecutionOutcome::Failed,
            },
            AgentState::Completed => match &self.result {
                Some(result) if result.changes_made => ExecutionOutcome::SuccessWithChanges,
                Some(_) => ExecutionOutcome::SuccessNoChanges,
                None => ExecutionOutcome::Failed,
            },
            AgentState::Created | AgentState::Running => ExecutionOutcome::Failed,
        }
    }
}
