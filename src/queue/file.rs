//! File-backed job queue.
//!
//! Each bin is a directory and each job one JSON file named by `job_id`.
//! State transitions are directory renames, which are atomic within one
//! filesystem; writes go through a tempfile-then-rename in the destination
//! directory so a crash never leaves a torn job file.
//!
//! ```text
//! <queue_root>/
//!   jobs/<job_id>.json        pending
//!   processing/<job_id>.json
//!   completed/<job_id>.json
//!   failed/<job_id>.json      (also holds cleanup_failed jobs)
//! ```
//!
//! On open, any job left in `processing/` by a crashed worker is moved back
//! to `jobs/` with `started_at` cleared, making it eligible again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use super::{JobQueue, JobSummary};
use crate::errors::QueueError;
use crate::webhook::event::{JobStatus, WebhookJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bin {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Bin {
    const ALL: [Bin; 4] = [Bin::Pending, Bin::Processing, Bin::Completed, Bin::Failed];

    fn dir_name(&self) -> &'static str {
        match self {
            Bin::Pending => "jobs",
            Bin::Processing => "processing",
            Bin::Completed => "completed",
            Bin::Failed => "failed",
        }
    }
}

/// In-memory idempotency index over the on-disk bins. Misses fall back to a
/// full bin scan so a concurrent writer process is still detected.
struct DeliveryIndex {
    entries: HashMap<String, DateTime<Utc>>,
}

pub struct FileBasedJobQueue {
    root: PathBuf,
    index: Mutex<DeliveryIndex>,
    notify: Arc<Notify>,
    ttl: chrono::Duration,
}

fn io_err(path: &Path, source: std::io::Error) -> QueueError {
    QueueError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl FileBasedJobQueue {
    /// Open (or create) a queue rooted at `root`, running the recovery sweep
    /// and hydrating the delivery-id index.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let root: PathBuf = root.into();
        for bin in Bin::ALL {
            let dir = root.join(bin.dir_name());
            std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }

        let queue = Self {
            root,
            index: Mutex::new(DeliveryIndex {
                entries: HashMap::new(),
            }),
            notify: Arc::new(Notify::new()),
            ttl: chrono::Duration::hours(24),
        };
        queue.recover_in_doubt_jobs()?;
        queue.hydrate_index()?;
        Ok(queue)
    }

    pub fn with_ttl_hours(mut self, hours: i64) -> Self {
        self.ttl = chrono::Duration::hours(hours);
        self
    }

    fn bin_dir(&self, bin: Bin) -> PathBuf {
        self.root.join(bin.dir_name())
    }

    fn job_path(&self, bin: Bin, job_id: &str) -> PathBuf {
        self.bin_dir(bin).join(format!("{job_id}.json"))
    }

    /// Crash recovery: processing/ jobs are in doubt, return them to pending.
    fn recover_in_doubt_jobs(&self) -> Result<(), QueueError> {
        let processing = self.bin_dir(Bin::Processing);
        for entry in std::fs::read_dir(&processing).map_err(|e| io_err(&processing, e))? {
            let entry = entry.map_err(|e| io_err(&processing, e))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match self.read_job_file(&path) {
                Ok(mut job) => {
                    info!(job_id = %job.job_id, "resurrecting in-doubt job from processing/");
                    job.status = JobStatus::Pending;
                    job.started_at = None;
                    self.write_job_file(Bin::Pending, &job)?;
                    std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable job file");
                }
            }
        }
        Ok(())
    }

    fn hydrate_index(&self) -> Result<(), QueueError> {
        let mut entries = HashMap::new();
        for bin in Bin::ALL {
            for job in self.read_bin(bin)? {
                if let Some(delivery_id) = job.event.delivery_id {
                    entries.insert(delivery_id, job.created_at);
                }
            }
        }
        // open() runs before self is shared, so the lock cannot be held.
        self.index.try_lock().expect("index unshared during open").entries = entries;
        Ok(())
    }

    fn read_job_file(&self, path: &Path) -> Result<WebhookJob, QueueError> {
        let data = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        serde_json::from_str(&data).map_err(|e| QueueError::Corrupt {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Crash-safe write: tempfile in the destination directory, then rename.
    fn write_job_file(&self, bin: Bin, job: &WebhookJob) -> Result<(), QueueError> {
        let dir = self.bin_dir(bin);
        let tmp = dir.join(format!(".tmp-{}.json", job.job_id));
        let dest = self.job_path(bin, &job.job_id);
        let data = serde_json::to_string_pretty(job).expect("job serialization is infallible");
        std::fs::write(&tmp, data).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &dest).map_err(|e| io_err(&dest, e))?;
        Ok(())
    }

    fn read_bin(&self, bin: Bin) -> Result<Vec<WebhookJob>, QueueError> {
        let dir = self.bin_dir(bin);
        let mut jobs = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(".tmp-"))
            {
                continue;
            }
            match self.read_job_file(&path) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable job file"),
            }
        }
        Ok(jobs)
    }

    /// Locate the bin currently holding a job.
    fn find_bin(&self, job_id: &str) -> Option<Bin> {
        Bin::ALL
            .into_iter()
            .find(|bin| self.job_path(*bin, job_id).exists())
    }

    /// Move a job into a terminal bin with the given mutation applied.
    fn finish(
        &self,
        job_id: &str,
        dest: Bin,
        mutate: impl FnOnce(&mut WebhookJob),
    ) -> Result<(), QueueError> {
        let source_bin = self.find_bin(job_id).ok_or_else(|| QueueError::JobNotFound {
            job_id: job_id.to_string(),
        })?;
        let source_path = self.job_path(source_bin, job_id);
        let mut job = self.read_job_file(&source_path)?;
        mutate(&mut job);
        self.write_job_file(dest, &job)?;
        if source_bin != dest {
            std::fs::remove_file(&source_path).map_err(|e| io_err(&source_path, e))?;
        }
        Ok(())
    }

    fn scan_for_delivery(&self, delivery_id: &str) -> Result<Option<DateTime<Utc>>, QueueError> {
        for bin in Bin::ALL {
            for job in self.read_bin(bin)? {
                if job.event.delivery_id.as_deref() == Some(delivery_id) {
                    return Ok(Some(job.created_at));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl JobQueue for FileBasedJobQueue {
    async fn enqueue(&self, job: WebhookJob) -> Result<String, QueueError> {
        if self.find_bin(&job.job_id).is_some() {
            return Err(QueueError::DuplicateJob {
                job_id: job.job_id.clone(),
            });
        }

        self.write_job_file(Bin::Pending, &job)?;

        if let Some(delivery_id) = &job.event.delivery_id {
            let mut index = self.index.lock().await;
            index.entries.insert(delivery_id.clone(), Utc::now());
        }

        self.notify.notify_one();
        Ok(job.job_id)
    }

    async fn dequeue(&self) -> Result<Option<WebhookJob>, QueueError> {
        let mut pending = self.read_bin(Bin::Pending)?;
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });

        for job in pending {
            let from = self.job_path(Bin::Pending, &job.job_id);
            let to = self.job_path(Bin::Processing, &job.job_id);
            // The rename is the claim; losing the race to another worker
            // just means trying the next pending file.
            match std::fs::rename(&from, &to) {
                Ok(()) => return Ok(Some(job)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(&from, e)),
            }
        }
        Ok(None)
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
            // Bounded naps so files written by other processes (which never
            // touch our Notify) are still picked up.
            let nap = Duration::from_millis(250);
            let notified = self.notify.notified();
            match deadline {
                Some(deadline) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    let wait = nap.min(deadline - now);
                    let _ = tokio::time::timeout(wait, notified).await;
                }
                None => {
                    let _ = tokio::time::timeout(nap, notified).await;
                }
            }
        }
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<WebhookJob>, QueueError> {
        match self.find_bin(job_id) {
            Some(bin) => Ok(Some(self.read_job_file(&self.job_path(bin, job_id))?)),
            None => Ok(None),
        }
    }

    async fn update(&self, job: &WebhookJob) -> Result<(), QueueError> {
        let bin = self
            .find_bin(&job.job_id)
            .ok_or_else(|| QueueError::JobNotFound {
                job_id: job.job_id.clone(),
            })?;
        self.write_job_file(bin, job)
    }

    async fn complete(
        &self,
        job_id: &str,
        _result: Option<serde_json::Value>,
    ) -> Result<(), QueueError> {
        self.finish(job_id, Bin::Completed, |job| job.mark_completed())
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<(), QueueError> {
        self.finish(job_id, Bin::Failed, |job| job.mark_failed(error))
    }

    async fn fail_cleanup(&self, job_id: &str, error: &str) -> Result<(), QueueError> {
        self.finish(job_id, Bin::Failed, |job| job.mark_cleanup_failed(error))
    }

    async fn exists_by_delivery(&self, delivery_id: &str) -> Result<bool, QueueError> {
        let now = Utc::now();
        {
            let index = self.index.lock().await;
            if let Some(recorded) = index.entries.get(delivery_id) {
                if now - *recorded <= self.ttl {
                    return Ok(true);
                }
            }
        }
        // Index miss: another process may have enqueued the delivery.
        match self.scan_for_delivery(delivery_id)? {
            Some(created_at) if now - created_at <= self.ttl => {
                let mut index = self.index.lock().await;
                index.entries.insert(delivery_id.to_string(), created_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn size(&self) -> usize {
        self.read_bin(Bin::Pending).map(|jobs| jobs.len()).unwrap_or(0)
    }

    async fn list_jobs(
        &self,
        limit: usize,
        status_filter: Option<JobStatus>,
    ) -> Result<Vec<JobSummary>, QueueError> {
        let mut all = Vec::new();
        for bin in Bin::ALL {
            all.extend(self.read_bin(bin)?);
        }
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all
            .iter()
            .filter(|job| status_filter.is_none_or(|s| job.status == s))
            .take(limit)
            .map(JobSummary::from_job)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::event::{WebhookEvent, WebhookSource};
    use tempfile::tempdir;

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
    async fn test_enqueue_writes_pending_file_with_delivery_id() {
        let dir = tempdir().unwrap();
        let queue = FileBasedJobQueue::open(dir.path()).unwrap();
        let job_id = queue
            .enqueue(WebhookJob::create(event(225, Some("d-123"))))
            .await
            .unwrap();

        let path = dir.path().join("jobs").join(format!("{job_id}.json"));
        assert!(path.exists());
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["event"]["delivery_id"], "d-123");
    }

    #[tokio::test]
    async fn test_dequeue_moves_file_to_processing() {
        let dir = tempdir().unwrap();
        let queue = FileBasedJobQueue::open(dir.path()).unwrap();
        let job_id = queue
            .enqueue(WebhookJob::create(event(1, None)))
            .await
            .unwrap();

        let job = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(job.job_id, job_id);
        assert!(!dir.path().join("jobs").join(format!("{job_id}.json")).exists());
        assert!(
            dir.path()
                .join("processing")
                .join(format!("{job_id}.json"))
                .exists()
        );
    }

    #[tokio::test]
    async fn test_fifo_order_by_created_at() {
        let dir = tempdir().unwrap();
        let queue = FileBasedJobQueue::open(dir.path()).unwrap();

        let mut first = WebhookJob::create(event(1, None));
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let first_id = first.job_id.clone();
        let second = WebhookJob::create(event(2, None));

        // Enqueue newest first; dequeue must still honor creation order.
        queue.enqueue(second).await.unwrap();
        queue.enqueue(first).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap().unwrap().job_id, first_id);
    }

    #[tokio::test]
    async fn test_complete_and_fail_move_to_terminal_bins() {
        let dir = tempdir().unwrap();
        let queue = FileBasedJobQueue::open(dir.path()).unwrap();
        let a = queue
            .enqueue(WebhookJob::create(event(1, None)))
            .await
            .unwrap();
        let b = queue
            .enqueue(WebhookJob::create(event(2, None)))
            .await
            .unwrap();
        queue.dequeue().await.unwrap();
        queue.dequeue().await.unwrap();

        queue.complete(&a, None).await.unwrap();
        queue.fail(&b, "boom").await.unwrap();

        let done = queue.get_job(&a).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(dir.path().join("completed").join(format!("{a}.json")).exists());

        let failed = queue.get_job(&b).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_cleanup_failed_lands_in_failed_bin_with_status() {
        let dir = tempdir().unwrap();
        let queue = FileBasedJobQueue::open(dir.path()).unwrap();
        let job_id = queue
            .enqueue(WebhookJob::create(event(1, None)))
            .await
            .unwrap();
        queue.dequeue().await.unwrap();
        queue.fail_cleanup(&job_id, "worktree busy").await.unwrap();

        let stored = queue.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::CleanupFailed);
        assert!(
            dir.path()
                .join("failed")
                .join(format!("{job_id}.json"))
                .exists()
        );
    }

    #[tokio::test]
    async fn test_delivery_survives_dequeue_complete_and_restart() {
        let dir = tempdir().unwrap();
        {
            let queue = FileBasedJobQueue::open(dir.path()).unwrap();
            let job_id = queue
                .enqueue(WebhookJob::create(event(1, Some("d-keep"))))
                .await
                .unwrap();
            queue.dequeue().await.unwrap();
            assert!(queue.exists_by_delivery("d-keep").await.unwrap());
            queue.complete(&job_id, None).await.unwrap();
            assert!(queue.exists_by_delivery("d-keep").await.unwrap());
        }

        // Fresh instance, as a different process would see it.
        let reopened = FileBasedJobQueue::open(dir.path()).unwrap();
        assert!(reopened.exists_by_delivery("d-keep").await.unwrap());
        assert!(!reopened.exists_by_delivery("d-other").await.unwrap());
    }

    #[tokio::test]
    async fn test_crash_recovery_resurrects_processing_jobs() {
        let dir = tempdir().unwrap();
        let job_id;
        {
            let queue = FileBasedJobQueue::open(dir.path()).unwrap();
            job_id = queue
                .enqueue(WebhookJob::create(event(1, None)))
                .await
                .unwrap();
            let mut job = queue.dequeue().await.unwrap().unwrap();
            job.mark_processing();
            queue.update(&job).await.unwrap();
            // Simulated crash: the job stays in processing/.
        }

        let reopened = FileBasedJobQueue::open(dir.path()).unwrap();
        assert_eq!(reopened.size().await, 1);
        let job = reopened.dequeue().await.unwrap().unwrap();
        assert_eq!(job.job_id, job_id);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn test_exists_by_delivery_detects_foreign_writer() {
        let dir = tempdir().unwrap();
        let queue = FileBasedJobQueue::open(dir.path()).unwrap();

        // Another process enqueues behind our back.
        let other = FileBasedJobQueue::open(dir.path()).unwrap();
        other
            .enqueue(WebhookJob::create(event(5, Some("d-foreign"))))
            .await
            .unwrap();

        assert!(queue.exists_by_delivery("d-foreign").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_job_id_rejected() {
        let dir = tempdir().unwrap();
        let queue = FileBasedJobQueue::open(dir.path()).unwrap();
        let job = WebhookJob::create(event(1, None));
        let dup = job.clone();
        queue.enqueue(job).await.unwrap();
        assert!(matches!(
            queue.enqueue(dup).await.unwrap_err(),
            QueueError::DuplicateJob { .. }
        ));
    }

    #[tokio::test]
    async fn test_update_rewrites_in_place() {
        let dir = tempdir().unwrap();
        let queue = FileBasedJobQueue::open(dir.path()).unwrap();
        let mut job = WebhookJob::create(event(1, None));
        queue.enqueue(job.clone()).await.unwrap();

        job.worktree_path = Some("/wt/skybridge-github-1-abc".into());
        job.branch_name = Some("webhook/github/issue/1/abc".into());
        queue.update(&job).await.unwrap();

        let stored = queue.get_job(&job.job_id).await.unwrap().unwrap();
        assert_eq!(stored.worktree_path, job.worktree_path);
        assert_eq!(stored.branch_name, job.branch_name);
        assert_eq!(queue.size().await, 1);
    }

    #[tokio::test]
    async fn test_wait_for_dequeue_timeout_returns_none() {
        let dir = tempdir().unwrap();
        let queue = FileBasedJobQueue::open(dir.path()).unwrap();
        let got = queue
            .wait_for_dequeue(Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_list_jobs_spans_bins() {
        let dir = tempdir().unwrap();
        let queue = FileBasedJobQueue::open(dir.path()).unwrap();
        let a = queue
            .enqueue(WebhookJob::create(event(1, None)))
            .await
            .unwrap();
        queue
            .enqueue(WebhookJob::create(event(2, None)))
            .await
            .unwrap();
        queue.dequeue().await.unwrap();
        queue.dequeue().await.unwrap();
        queue.complete(&a, None).await.unwrap();

        let all = queue.list_jobs(10, None).await.unwrap();
        assert_eq!(all.len(), 2);
        let completed = queue
            .list_jobs(10, Some(JobStatus::Completed))
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].job_id, a);
    }
}
