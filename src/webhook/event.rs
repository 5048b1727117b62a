//! Webhook domain entities.
//!
//! [`WebhookEvent`] is the immutable record of one inbound delivery;
//! [`WebhookJob`] is the mutable aggregate that owns it through the
//! processing lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported webhook sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookSource {
    GitHub,
    Discord,
    YouTube,
    Stripe,
}

impl WebhookSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::Discord => "discord",
            Self::YouTube => "youtube",
            Self::Stripe => "stripe",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "github" => Some(Self::GitHub),
            "discord" => Some(Self::Discord),
            "youtube" => Some(Self::YouTube),
            "stripe" => Some(Self::Stripe),
            _ => None,
        }
    }
}

/// Processing state of a webhook job.
///
/// Terminal states are `Completed`, `Failed`, and `CleanupFailed`; the
/// status only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    /// Commit/push succeeded but the worktree could not be removed.
    CleanupFailed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::CleanupFailed => "cleanup_failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::CleanupFailed)
    }
}

/// One inbound webhook delivery, immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub source: WebhookSource,
    /// Full event type, e.g. "issues.opened" or "ping".
    pub event_type: String,
    /// Source-side identifier of the subject (issue number for GitHub issues).
    pub event_id: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    /// Raw signature header value, kept for audit.
    #[serde(default)]
    pub signature: Option<String>,
    /// Delivery id; when present it is the idempotency key.
    #[serde(default)]
    pub delivery_id: Option<String>,
}

impl WebhookEvent {
    /// Issue number for GitHub `issues.*` events.
    pub fn issue_number(&self) -> Option<i64> {
        if self.source == WebhookSource::GitHub && self.event_type.starts_with("issues.") {
            self.payload.get("issue")?.get("number")?.as_i64()
        } else {
            None
        }
    }

    /// `(owner, name)` of the repository, when the payload carries one.
    pub fn repository(&self) -> Option<(String, String)> {
        let repo = self.payload.get("repository")?;
        let owner = repo.get("owner")?.get("login")?.as_str()?;
        let name = repo.get("name")?.as_str()?;
        Some((owner.to_string(), name.to_string()))
    }

    pub fn repository_full_name(&self) -> String {
        self.repository()
            .map(|(owner, name)| format!("{owner}/{name}"))
            .unwrap_or_default()
    }

    pub fn issue_title(&self) -> Option<&str> {
        self.payload.get("issue")?.get("title")?.as_str()
    }

    pub fn issue_labels(&self) -> Vec<String> {
        self.payload
            .get("issue")
            .and_then(|i| i.get("labels"))
            .and_then(|l| l.as_array())
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|l| l.get("name").and_then(|n| n.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Background job processing one [`WebhookEvent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookJob {
    pub job_id: String,
    pub event: WebhookEvent,
    pub status: JobStatus,
    /// Stable tracing id: the delivery id when present, else the job id.
    pub correlation_id: String,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub issue_number: Option<i64>,
    #[serde(default)]
    pub initial_snapshot: Option<String>,
    #[serde(default)]
    pub final_snapshot: Option<String>,
    /// Cross-cutting state such as the kanban card id.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl WebhookJob {
    /// Mint a new pending job for an event. The job id embeds a short random
    /// suffix so retries for the same issue stay distinguishable.
    pub fn create(event: WebhookEvent) -> Self {
        let suffix = &Uuid::new_v4().simple().to_string()[..8];
        let job_id = format!("{}-{}-{}", event.source.as_str(), event.event_type, suffix);
        let correlation_id = event.delivery_id.clone().unwrap_or_else(|| job_id.clone());
        let issue_number = event.issue_number();

        Self {
            job_id,
            event,
            status: JobStatus::Pending,
            correlation_id,
            worktree_path: None,
            branch_name: None,
            issue_number,
            initial_snapshot: None,
            final_snapshot: None,
            metadata: serde_json::Map::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Last eight characters of the job id, used in worktree and branch names.
    pub fn suffix(&self) -> &str {
        match self.job_id.rsplit_once('-') {
            Some((_, tail)) => tail,
            None => &self.job_id[..self.job_id.len().min(8)],
        }
    }

    pub fn mark_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(error.into());
    }

    pub fn mark_cleanup_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::CleanupFailed;
        self.completed_at.get_or_insert_with(Utc::now);
        self.error_message = Some(error.into());
    }

    /// Worktree removal is only safe once the job has reached a terminal state.
    pub fn can_cleanup(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Deterministic worktree directory name, e.g. `skybridge-github-225-cf560ba0`.
pub fn worktree_name(job: &WebhookJob) -> String {
    match job.issue_number {
        Some(issue) => format!(
            "skybridge-{}-{}-{}",
            job.event.source.as_str(),
            issue,
            job.suffix()
        ),
        None => format!("skybridge-{}-{}", job.event.source.as_str(), job.job_id),
    }
}

/// Deterministic branch name, e.g. `webhook/github/issue/225/cf560ba0`.
pub fn branch_name(job: &WebhookJob) -> String {
    match job.issue_number {
        Some(issue) => format!(
            "webhook/{}/issue/{}/{}",
            job.event.source.as_str(),
            issue,
            job.suffix()
        ),
        None => format!("webhook/{}/{}", job.event.source.as_str(), job.job_id),
    }
}
