//! Domain events published at every job and issue lifecycle transition.
//!
//! Subscriptions are keyed by [`EventKind`] (the variant tag), so publication
//! is a straight map lookup instead of downcasting.

pub mod bus;
pub mod console;
pub mod metrics;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use bus::{EventBus, EventHandler};

/// Tag identifying a concrete event variant. Used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IssueReceived,
    IssueAssigned,
    IssueLabelled,
    IssueClosed,
    IssueCommented,
    JobCreated,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    JobCommitted,
    JobPushed,
    WorktreeRemoved,
    PrCreated,
    TrelloCardCreated,
    TrelloCardUpdated,
    TrelloCardMoved,
    TrelloCardArchived,
    TrelloCommentAdded,
}

/// Variant-specific payload of a domain event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    IssueReceived {
        issue_number: i64,
        repository: String,
        title: String,
        body: String,
        sender: String,
        action: String,
        labels: Vec<String>,
    },
    IssueAssigned {
        issue_number: i64,
        repository: String,
        assignee: String,
        sender: String,
    },
    IssueLabelled {
        issue_number: i64,
        repository: String,
        label: String,
        action: String,
        sender: String,
    },
    IssueClosed {
        issue_number: i64,
        repository: String,
        sender: String,
        reason: String,
    },
    IssueCommented {
        issue_number: i64,
        repository: String,
        comment_id: i64,
        comment_body: String,
        sender: String,
    },
    JobCreated {
        job_id: String,
        issue_number: Option<i64>,
        repository: String,
    },
    JobStarted {
        job_id: String,
        issue_number: Option<i64>,
        repository: String,
        agent_type: String,
    },
    JobProgress {
        job_id: String,
        issue_number: Option<i64>,
        step: i64,
        total_steps: i64,
        step_name: String,
    },
    JobCompleted {
        job_id: String,
        issue_number: Option<i64>,
        repository: String,
        files_modified: usize,
        duration_seconds: f64,
        worktree_path: String,
    },
    JobFailed {
        job_id: String,
        issue_number: Option<i64>,
        repository: String,
        error_message: String,
        error_type: String,
        duration_seconds: f64,
    },
    JobCommitted {
        job_id: String,
        issue_number: Option<i64>,
        repository: String,
        commit_hash: String,
        commit_message: String,
    },
    JobPushed {
        job_id: String,
        issue_number: Option<i64>,
        repository: String,
        branch_name: String,
        commit_hash: String,
    },
    WorktreeRemoved {
        job_id: String,
        issue_number: Option<i64>,
        worktree_path: String,
    },
    PrCreated {
        pr_number: i64,
        issue_number: Option<i64>,
        repository: String,
        pr_url: String,
        pr_title: String,
        branch_name: String,
    },
    TrelloCardCreated {
        card_id: String,
        trello_card_id: String,
        issue_number: Option<i64>,
    },
    TrelloCardUpdated {
        card_id: String,
        trello_card_id: String,
    },
    TrelloCardMoved {
        card_id: String,
        from_list: String,
        to_list: String,
    },
    TrelloCardArchived {
        card_id: String,
    },
    TrelloCommentAdded {
        card_id: String,
        comment: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::IssueReceived { .. } => EventKind::IssueReceived,
            Self::IssueAssigned { .. } => EventKind::IssueAssigned,
            Self::IssueLabelled { .. } => EventKind::IssueLabelled,
            Self::IssueClosed { .. } => EventKind::IssueClosed,
            Self::IssueCommented { .. } => EventKind::IssueCommented,
            Self::JobCreated { .. } => EventKind::JobCreated,
            Self::JobStarted { .. } => EventKind::JobStarted,
            Self::JobProgress { .. } => EventKind::JobProgress,
            Self::JobCompleted { .. } => EventKind::JobCompleted,
            Self::JobFailed { .. } => EventKind::JobFailed,
            Self::JobCommitted { .. } => EventKind::JobCommitted,
            Self::JobPushed { .. } => EventKind::JobPushed,
            Self::WorktreeRemoved { .. } => EventKind::WorktreeRemoved,
            Self::PrCreated { .. } => EventKind::PrCreated,
            Self::TrelloCardCreated { .. } => EventKind::TrelloCardCreated,
            Self::TrelloCardUpdated { .. } => EventKind::TrelloCardUpdated,
            Self::TrelloCardMoved { .. } => EventKind::TrelloCardMoved,
            Self::TrelloCardArchived { .. } => EventKind::TrelloCardArchived,
            Self::TrelloCommentAdded { .. } => EventKind::TrelloCommentAdded,
        }
    }

    /// Dotted event type string, e.g. "job.started".
    pub fn event_type(&self) -> &'static str {
        match self.kind() {
            EventKind::IssueReceived => "issue.received",
            EventKind::IssueAssigned => "issue.assigned",
            EventKind::IssueLabelled => "issue.labelled",
            EventKind::IssueClosed => "issue.closed",
            EventKind::IssueCommented => "issue.commented",
            EventKind::JobCreated => "job.created",
            EventKind::JobStarted => "job.started",
            EventKind::JobProgress => "job.progress",
            EventKind::JobCompleted => "job.completed",
            EventKind::JobFailed => "job.failed",
            EventKind::JobCommitted => "job.committed",
            EventKind::JobPushed => "job.pushed",
            EventKind::WorktreeRemoved => "worktree.removed",
            EventKind::PrCreated => "pr.created",
            EventKind::TrelloCardCreated => "trello.card_created",
            EventKind::TrelloCardUpdated => "trello.card_updated",
            EventKind::TrelloCardMoved => "trello.card_moved",
            EventKind::TrelloCardArchived => "trello.card_archived",
            EventKind::TrelloCommentAdded => "trello.comment_added",
        }
    }
}

/// An immutable domain event: identity envelope plus a variant payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    /// Tracing id propagated from the originating webhook delivery.
    pub correlation_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl DomainEvent {
    pub fn new(correlation_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            correlation_id: correlation_id.into(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    /// Job id, for variants that carry one.
    pub fn job_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::JobCreated { job_id, .. }
            | EventPayload::JobStarted { job_id, .. }
            | EventPayload::JobProgress { job_id, .. }
            | EventPayload::JobCompleted { job_id, .. }
            | EventPayload::JobFailed { job_id, .. }
            | EventPayload::JobCommitted { job_id, .. }
            | EventPayload::JobPushed { job_id, .. }
            | EventPayload::WorktreeRemoved { job_id, .. } => Some(job_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        let payload = EventPayload::JobStarted {
            job_id: "j1".into(),
            issue_number: Some(42),
            repository: "o/r".into(),
            agent_type: "resolve-issue".into(),
        };
        assert_eq!(payload.kind(), EventKind::JobStarted);
        assert_eq!(payload.event_type(), "job.started");
    }

    #[test]
    fn test_event_identity_fields() {
        let event = DomainEvent::new(
            "d-001",
            EventPayload::WorktreeRemoved {
                job_id: "j1".into(),
                issue_number: Some(7),
                worktree_path: "/wt/skybridge-github-7-abcd1234".into(),
            },
        );
        assert_eq!(event.correlation_id, "d-001");
        assert!(!event.event_id.is_empty());
        assert_eq!(event.job_id(), Some("j1"));
    }

    #[test]
    fn test_serialization_round_trip() {
        let event = DomainEvent::new(
            "d-002",
            EventPayload::JobCommitted {
                job_id: "j2".into(),
                issue_number: Some(9),
                repository: "o/r".into(),
                commit_hash: "abc123".into(),
                commit_message: "fix: something".into(),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"job_committed\""));
        let back: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), EventKind::JobCommitted);
        assert_eq!(back.event_id, event.event_id);
    }

    #[test]
    fn test_issue_events_carry_no_job_id() {
        let event = DomainEvent::new(
            "d-003",
            EventPayload::IssueClosed {
                issue_number: 3,
                repository: "o/r".into(),
                sender: "alice".into(),
                reason: "completed".into(),
            },
        );
        assert!(event.job_id().is_none());
    }
}
