//! In-memory job queue.
//!
//! Single-process and non-durable; jobs are lost on restart. Delivery ids
//! are held with a TTL (default 24 h) and reaped on each enqueue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use super::{JobQueue, JobSummary};
use crate::errors::QueueError;
use crate::webhook::event::{JobStatus, WebhookJob};

struct Inner {
    /// Pending job ids in FIFO order.
    pending: VecDeque<String>,
    /// Every job by id, pending or not.
    jobs: HashMap<String, WebhookJob>,
    /// Insertion order of job ids, for newest-first listings.
    insertion_order: Vec<String>,
    /// delivery_id → recorded-at, for TTL-bounded idempotency.
    delivery_ids: HashMap<String, DateTime<Utc>>,
}

pub struct InMemoryJobQueue {
    inner: Mutex<Inner>,
    notify: Arc<Notify>,
    ttl: chrono::Duration,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::with_ttl_hours(24)
    }

    pub fn with_ttl_hours(ttl_hours: i64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                jobs: HashMap::new(),
                insertion_order: Vec::new(),
                delivery_ids: HashMap::new(),
            }),
            notify: Arc::new(Notify::new()),
            ttl: chrono::Duration::hours(ttl_hours),
        }
    }

    fn reap_expired_deliveries(inner: &mut Inner, ttl: chrono::Duration) {
        let now = Utc::now();
        let before = inner.delivery_ids.len();
        inner.delivery_ids.retain(|_, recorded| now - *recorded <= ttl);
        let reaped = before - inner.delivery_ids.len();
        if reaped > 0 {
            debug!(reaped, "reaped expired delivery ids");
        }
    }

    /// Drop everything. Test hook.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.pending.clear();
        inner.jobs.clear();
        inner.insertion_order.clear();
        inner.delivery_ids.clear();
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: WebhookJob) -> Result<String, QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(&job.job_id) {
            return Err(QueueError::DuplicateJob {
                job_id: job.job_id.clone(),
            });
        }

        Self::reap_expired_deliveries(&mut inner, self.ttl);

        let job_id = job.job_id.clone();
        if let Some(delivery_id) = &job.event.delivery_id {
            inner.delivery_ids.insert(delivery_id.clone(), Utc::now());
        }
        inner.pending.push_back(job_id.clone());
        inner.insertion_order.push(job_id.clone());
        inner.jobs.insert(job_id.clone(), job);
        drop(inner);

        self.notify.notify_one();
        Ok(job_id)
    }

    async fn dequeue(&self) -> Result<Option<WebhookJob>, QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(job_id) = inner.pending.pop_front() else {
            return Ok(None);
        };
        Ok(inner.jobs.get(&job_id).cloned())
    }

    async fn wait_for_dequeue(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<WebhookJob>, QueueError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            if let Some(job) = self.dequeue().await? {
                return Ok(Some(job));
            }
            let notified = self.notify.notified();
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<WebhookJob>, QueueError> {
        Ok(self.inner.lock().await.jobs.get(job_id).cloned())
    }

    async fn update(&self, job: &WebhookJob) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(&job.job_id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(QueueError::JobNotFound {
                job_id: job.job_id.to_string(),
            }),
        }
    }

    async fn complete(
        &self,
        job_id: &str,
        _result: Option<serde_json::Value>,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(job_id) {
            Some(job) => {
                job.mark_completed();
                Ok(())
            }
            None => Err(QueueError::JobNotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(job_id) {
            Some(job) => {
                job.mark_failed(error);
                Ok(())
            }
            None => Err(QueueError::JobNotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    async fn fail_cleanup(&self, job_id: &str, error: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(job_id) {
            Some(job) => {
                job.mark_cleanup_failed(error);
                Ok(())
            }
            None => Err(QueueError::JobNotFound {
                job_id: job_id.to_string(),
            }),
        }
    }

    async fn exists_by_delivery(&self, delivery_id: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        Self::reap_expired_deliveries(&mut inner, self.ttl);
        Ok(inner.delivery_ids.contains_key(delivery_id))
    }

    async fn size(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    async fn list_jobs(
        &self,
        limit: usize,
        status_filter: Option<JobStatus>,
    ) -> Result<Vec<JobSummary>, QueueError> {
        let inner = self.inner.lock().await;
        let summaries = inner
            .insertion_order
            .iter()
            .rev()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|job| status_filter.is_none_or(|s| job.status == s))
            .take(limit)
            .map(JobSummary::from_job)
            .collect();
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::event::{WebhookEvent, WebhookSource};

    fn event(number: i64, delivery: Option<&str>) -> WebhookEvent {
        WebhookEvent {
            source: WebhookSource::GitHub,
            event_type: "issues.opened".into(),
            event_id: number.to_string(),
            payload: serde_json::json!({"issue": {"number": number}}),
            received_at: Utc::now(),
            signature: None,
            delivery_id: delivery.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_fifo() {
        let queue = InMemoryJobQueue::new();
        let first = WebhookJob::create(event(1, None));
        let second = WebhookJob::create(event(2, None));
        let first_id = first.job_id.clone();
        let second_id = second.job_id.clone();

        queue.enqueue(first).await.unwrap();
        queue.enqueue(second).await.unwrap();
        assert_eq!(queue.size().await, 2);

        assert_eq!(queue.dequeue().await.unwrap().unwrap().job_id, first_id);
        assert_eq!(queue.dequeue().await.unwrap().unwrap().job_id, second_id);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_job_id_rejected() {
        let queue = InMemoryJobQueue::new();
        let job = WebhookJob::create(event(1, None));
        let dup = job.clone();
        queue.enqueue(job).await.unwrap();
        let err = queue.enqueue(dup).await.unwrap_err();
        assert!(matches!(err, QueueError::DuplicateJob { .. }));
    }

    #[tokio::test]
    async fn test_exists_by_delivery() {
        let queue = InMemoryJobQueue::new();
        assert!(!queue.exists_by_delivery("d-1").await.unwrap());
        queue
            .enqueue(WebhookJob::create(event(1, Some("d-1"))))
            .await
            .unwrap();
        assert!(queue.exists_by_delivery("d-1").await.unwrap());
        assert!(!queue.exists_by_delivery("d-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_delivery_ttl_expiry() {
        let queue = InMemoryJobQueue::with_ttl_hours(0);
        queue
            .enqueue(WebhookJob::create(event(1, Some("d-ttl"))))
            .await
            .unwrap();
        // TTL of zero hours: the entry is already past its lifetime.
        assert!(!queue.exists_by_delivery("d-ttl").await.unwrap());
    }

    #[tokio::test]
    async fn test_complete_and_fail_set_status() {
        let queue = InMemoryJobQueue::new();
        let job = WebhookJob::create(event(1, None));
        let job_id = queue.enqueue(job).await.unwrap();
        queue.dequeue().await.unwrap();

        queue.complete(&job_id, None).await.unwrap();
        let stored = queue.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.completed_at.is_some());

        let other_id = queue
            .enqueue(WebhookJob::create(event(2, None)))
            .await
            .unwrap();
        queue.fail(&other_id, "agent crashed").await.unwrap();
        let failed = queue.get_job(&other_id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("agent crashed"));
    }

    #[tokio::test]
    async fn test_fail_cleanup_sets_distinct_status() {
        let queue = InMemoryJobQueue::new();
        let job_id = queue
            .enqueue(WebhookJob::create(event(3, None)))
            .await
            .unwrap();
        queue
            .fail_cleanup(&job_id, "worktree removal failed")
            .await
            .unwrap();
        let stored = queue.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::CleanupFailed);
    }

    #[tokio::test]
    async fn test_wait_for_dequeue_times_out_with_none() {
        let queue = InMemoryJobQueue::new();
        let got = queue
            .wait_for_dequeue(Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_wait_for_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let waiter = Arc::clone(&queue);
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_dequeue(Some(Duration::from_secs(5)))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue
            .enqueue(WebhookJob::create(event(9, None)))
            .await
            .unwrap();

        let job = handle.await.unwrap();
        assert!(job.is_some());
    }

    #[tokio::test]
    async fn test_update_persists_fields() {
        let queue = InMemoryJobQueue::new();
        let mut job = WebhookJob::create(event(1, None));
        queue.enqueue(job.clone()).await.unwrap();

        job.worktree_path = Some("/wt/x".into());
        job.metadata
            .insert("kanban_card_id".into(), serde_json::json!("card-1"));
        queue.update(&job).await.unwrap();

        let stored = queue.get_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.worktree_path.as_deref(), Some("/wt/x"));
        assert_eq!(stored.metadata["kanban_card_id"], "card-1");
    }

    #[tokio::test]
    async fn test_list_jobs_newest_first_with_filter() {
        let queue = InMemoryJobQueue::new();
        let a = queue
            .enqueue(WebhookJob::create(event(1, None)))
            .await
            .unwrap();
        let b = queue
            .enqueue(WebhookJob::create(event(2, None)))
            .await
            .unwrap();
        queue.complete(&a, None).await.unwrap();

        let all = queue.list_jobs(10, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].job_id, b);

        let pending = queue
            .list_jobs(10, Some(JobStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].job_id, b);
    }
}
