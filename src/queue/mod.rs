//! Durable job queue port and implementations.
//!
//! Two adapters back the same trait: [`memory::InMemoryJobQueue`] for a
//! single process and tests, and [`file::FileBasedJobQueue`] for durable
//! multi-process operation. Both provide FIFO dequeue, idempotency lookup by
//! delivery id, and visible state transitions.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::QueueError;
use crate::webhook::event::{JobStatus, WebhookJob};

pub use file::FileBasedJobQueue;
pub use memory::InMemoryJobQueue;

/// Compact job projection for the WebUI job list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub source: String,
    pub event_type: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub worktree_path: Option<String>,
}

impl JobSummary {
    pub fn from_job(job: &WebhookJob) -> Self {
        Self {
            job_id: job.job_id.clone(),
            source: job.event.source.as_str().to_string(),
            event_type: job.event.event_type.clone(),
            status: job.status,
            created_at: job.created_at,
            worktree_path: job.worktree_path.clone(),
        }
    }
}

/// Port for the webhook job queue.
///
/// Processing is at-least-once: a crash between `dequeue` and
/// `complete`/`fail` leaves the job in doubt, and the file-backed adapter
/// resurrects such jobs on restart.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a pending job. Fails on a duplicate `job_id`; records the
    /// delivery id for idempotency.
    async fn enqueue(&self, job: WebhookJob) -> Result<String, QueueError>;

    /// Pop the oldest pending job, or `None` when the queue is empty.
    async fn dequeue(&self) -> Result<Option<WebhookJob>, QueueError>;

    /// Block until a job arrives or the timeout elapses. A lapsed timeout
    /// returns `Ok(None)`, not an error.
    async fn wait_for_dequeue(
        &self,
        timeout: Option<std::time::Duration>,
    ) -> Result<Option<WebhookJob>, QueueError>;

    /// Look a job up across every bin.
    async fn get_job(&self, job_id: &str) -> Result<Option<WebhookJob>, QueueError>;

    /// Persist field updates (worktree path, snapshots, metadata, status
    /// timestamps) without moving the job between bins.
    async fn update(&self, job: &WebhookJob) -> Result<(), QueueError>;

    /// Move the job to the completed bin.
    async fn complete(
        &self,
        job_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<(), QueueError>;

    /// Move the job to the failed bin with an error message.
    async fn fail(&self, job_id: &str, error: &str) -> Result<(), QueueError>;

    /// Terminal `CleanupFailed`: the job finished its work but its worktree
    /// could not be reaped. Stored in the failed bin with the distinct status.
    async fn fail_cleanup(&self, job_id: &str, error: &str) -> Result<(), QueueError>;

    /// True when any in-flight or terminal job carries this delivery id and
    /// its TTL has not lapsed.
    async fn exists_by_delivery(&self, delivery_id: &str) -> Result<bool, QueueError>;

    /// Count of pending jobs.
    async fn size(&self) -> usize;

    /// Newest-first job summaries, optionally filtered by status.
    async fn list_jobs(
        &self,
        limit: usize,
        status_filter: Option<JobStatus>,
    ) -> Result<Vec<JobSummary>, QueueError>;
}
