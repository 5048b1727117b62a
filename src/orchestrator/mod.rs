//! Per-job step machine and the worker pool driving it.
//!
//! Each worker dequeues FIFO and runs one job at a time through:
//! mark processing → worktree → snapshot₀ → agent → snapshot₁ →
//! stage/commit/push → optional PR → cleanup → terminal state, publishing a
//! domain event after every transition. The worktree is released on every
//! exit path, including agent timeout and panics inside the step sequence;
//! a removal failure after otherwise-successful work yields the terminal
//! `CleanupFailed` state.

pub mod commit;

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::agent::{AgentContext, AgentFacade, ExecutionOutcome, skill_for_labels};
use crate::events::{DomainEvent, EventBus, EventPayload};
use crate::queue::JobQueue;
use crate::snapshot::{self, SnapshotSubject, store::SnapshotStore};
use crate::webhook::event::WebhookJob;
use crate::worktree::{WorktreeManager, git};

use self::commit::generate_commit_message;

/// What the step sequence produced before cleanup.
struct StepSuccess {
    files_modified: usize,
}

/// Steps reported through `JobProgress`: worktree, snapshot, agent, diff,
/// commit. Jobs without changes stop after the diff step.
const TOTAL_STEPS: i64 = 5;

pub struct JobOrchestrator {
    queue: Arc<dyn JobQueue>,
    bus: Arc<EventBus>,
    worktrees: Arc<WorktreeManager>,
    agent: Arc<dyn AgentFacade>,
    snapshots: Arc<SnapshotStore>,
    base_branch: String,
    /// Push and PR creation need a remote; tests and air-gapped runs turn
    /// them off.
    push_enabled: bool,
    create_pr: bool,
}

impl JobOrchestrator {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        bus: Arc<EventBus>,
        worktrees: Arc<WorktreeManager>,
        agent: Arc<dyn AgentFacade>,
        snapshots: Arc<SnapshotStore>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            bus,
            worktrees,
            agent,
            snapshots,
            base_branch: base_branch.into(),
            push_enabled: true,
            create_pr: true,
        }
    }

    pub fn with_push(mut self, enabled: bool) -> Self {
        self.push_enabled = enabled;
        self
    }

    pub fn with_pr(mut self, enabled: bool) -> Self {
        self.create_pr = enabled;
        self
    }

    /// Start `count` workers stealing work off the queue.
    pub fn start_workers(self: &Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker| {
                let orchestrator = Arc::clone(self);
                tokio::spawn(async move {
                    info!(worker, "job worker started");
                    orchestrator.worker_loop().await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self) {
        loop {
            match self
                .queue
                .wait_for_dequeue(Some(Duration::from_secs(5)))
                .await
            {
                Ok(Some(job)) => {
                    let job_id = job.job_id.clone();
                    if let Err(e) = self.process(job).await {
                        error!(job_id = %job_id, error = %e, "job processing errored");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "dequeue failed; backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Drive one job to a terminal state. Always reaches cleanup, even when
    /// a step panics.
    pub async fn process(&self, mut job: WebhookJob) -> anyhow::Result<()> {
        let correlation_id = job.correlation_id.clone();
        let skill = skill_for_labels(&job.event.issue_labels());
        let repository = job.event.repository_full_name();

        job.mark_processing();
        self.queue.update(&job).await?;
        self.publish(
            &correlation_id,
            EventPayload::JobStarted {
                job_id: job.job_id.clone(),
                issue_number: job.issue_number,
                repository: repository.clone(),
                agent_type: skill.to_string(),
            },
        )
        .await;

        let steps = AssertUnwindSafe(self.run_steps(&mut job, skill))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                Err(format!("step sequence panicked: {detail}"))
            });

        // Persist whatever the steps recorded on the job (worktree path,
        // snapshots, metadata) before settling the terminal state.
        self.queue.update(&job).await?;
        let duration_seconds = job
            .started_at
            .map(|start| (Utc::now() - start).num_milliseconds() as f64 / 1000.0)
            .unwrap_or_default();

        match steps {
            Ok(success) => {
                // The job is otherwise-complete; mark it locally so cleanup
                // sees a terminal state, then write the terminal bin once
                // based on whether the worktree could be reaped.
                job.mark_completed();
                debug_assert!(job.can_cleanup());
                let cleanup_ok = self.cleanup(&job, &correlation_id).await;
                if cleanup_ok {
                    self.queue.complete(&job.job_id, None).await?;
                    self.publish(
                        &correlation_id,
                        EventPayload::JobCompleted {
                            job_id: job.job_id.clone(),
                            issue_number: job.issue_number,
                            repository,
                            files_modified: success.files_modified,
                            duration_seconds,
                            worktree_path: job.worktree_path.clone().unwrap_or_default(),
                        },
                    )
                    .await;
                } else {
                    self.queue
                        .fail_cleanup(&job.job_id, "worktree removal failed")
                        .await?;
                    self.publish(
                        &correlation_id,
                        EventPayload::JobFailed {
                            job_id: job.job_id.clone(),
                            issue_number: job.issue_number,
                            repository,
                            error_message: "worktree removal failed".to_string(),
                            error_type: "CleanupFailed".to_string(),
                            duration_seconds,
                        },
                    )
                    .await;
                }
            }
            Err(error) => {
                self.queue.fail(&job.job_id, &error).await?;
                self.cleanup(&job, &correlation_id).await;
                self.publish(
                    &correlation_id,
                    EventPayload::JobFailed {
                        job_id: job.job_id.clone(),
                        issue_number: job.issue_number,
                        repository,
                        error_message: error.clone(),
                        error_type: error_type_of(&error),
                        duration_seconds,
                    },
                )
                .await;
            }
        }
        Ok(())
    }

    /// Steps 2–6. Errors are strings so the failure path owns the full
    /// message that lands on the job record.
    async fn run_steps(&self, job: &mut WebhookJob, skill: &str) -> Result<StepSuccess, String> {
        let worktree = self
            .worktrees
            .create_worktree(job)
            .await
            .map_err(|e| format!("worktree creation failed: {e}"))?;
        self.queue
            .update(job)
            .await
            .map_err(|e| format!("queue update failed: {e}"))?;
        self.publish_progress(job, 1, "worktree").await;

        let initial = snapshot::capture(&worktree, SnapshotSubject::Fileops)
            .map_err(|e| format!("initial snapshot failed: {e}"))?;
        self.snapshots
            .save_snapshot(&initial)
            .map_err(|e| format!("initial snapshot save failed: {e}"))?;
        job.initial_snapshot = Some(initial.id().to_string());
        self.publish_progress(job, 2, "snapshot").await;

        let context = self.agent_context(job, skill, &worktree);
        let execution = self
            .agent
            .spawn(job, skill, &worktree, &context)
            .await
            .map_err(|e| format!("agent spawn failed: {e}"))?;

        let outcome = execution.outcome();
        info!(job_id = %job.job_id, ?outcome, "agent finished");
        self.publish_progress(job, 3, "agent").await;

        let final_snapshot = snapshot::capture(&worktree, SnapshotSubject::Fileops)
            .map_err(|e| format!("final snapshot failed: {e}"))?;
        self.snapshots
            .save_snapshot(&final_snapshot)
            .map_err(|e| format!("final snapshot save failed: {e}"))?;
        self.snapshots
            .save_diff(&snapshot::compare(&initial, &final_snapshot))
            .map_err(|e| format!("diff save failed: {e}"))?;
        job.final_snapshot = Some(final_snapshot.id().to_string());
        self.publish_progress(job, 4, "diff").await;

        match outcome {
            ExecutionOutcome::SuccessWithChanges => {}
            ExecutionOutcome::SuccessNoChanges => {
                return Ok(StepSuccess { files_modified: 0 });
            }
            ExecutionOutcome::TimedOut => {
                return Err(format!(
                    "agent timed out after {}s",
                    execution.timeout_seconds
                ));
            }
            ExecutionOutcome::CrashedBeforeResult => {
                return Err(format!(
                    "agent crashed before result: {}",
                    execution.error_message.unwrap_or_default()
                ));
            }
            ExecutionOutcome::MalformedResult => {
                return Err(format!(
                    "agent result malformed: {}",
                    execution.error_message.unwrap_or_default()
                ));
            }
            ExecutionOutcome::Failed => {
                return Err(format!(
                    "agent failed: {}",
                    execution.error_message.unwrap_or_default()
                ));
            }
        }

        let result = execution.result.as_ref().expect("success carries a result");
        let files_modified = result.touched_files();

        // The agent may report changes its edits later reverted; an
        // untouched tree completes without a commit.
        if !git::has_changes(&worktree)
            .await
            .map_err(|e| format!("status check failed: {e}"))?
        {
            info!(job_id = %job.job_id, "agent reported changes but worktree is clean");
            return Ok(StepSuccess { files_modified: 0 });
        }

        git::stage_all(&worktree)
            .await
            .map_err(|e| format!("stage failed: {e}"))?;
        let change_summary = git::diff_summary(&worktree)
            .await
            .map_err(|e| format!("diff summary failed: {e}"))?;
        job.metadata.insert(
            "change_summary".to_string(),
            serde_json::Value::String(change_summary.clone()),
        );

        let issue_title = job.event.issue_title().unwrap_or_default().to_string();
        let scope = job.event.repository().map(|(_, name)| name);
        let message = generate_commit_message(
            &job.event.issue_labels(),
            &issue_title,
            job.issue_number.unwrap_or_default(),
            scope.as_deref(),
        );
        let commit_hash = git::commit(&worktree, &message)
            .await
            .map_err(|e| format!("commit failed: {e}"))?;
        self.publish(
            &job.correlation_id,
            EventPayload::JobCommitted {
                job_id: job.job_id.clone(),
                issue_number: job.issue_number,
                repository: job.event.repository_full_name(),
                commit_hash: commit_hash.clone(),
                commit_message: message,
            },
        )
        .await;

        if self.push_enabled {
            let branch = job.branch_name.clone().unwrap_or_default();
            git::push(&worktree, &branch)
                .await
                .map_err(|e| format!("push failed: {e}"))?;
            self.publish(
                &job.correlation_id,
                EventPayload::JobPushed {
                    job_id: job.job_id.clone(),
                    issue_number: job.issue_number,
                    repository: job.event.repository_full_name(),
                    branch_name: branch.clone(),
                    commit_hash,
                },
            )
            .await;

            if self.create_pr {
                self.open_pull_request(job, &worktree, &branch, &issue_title, &change_summary)
                    .await;
            }
        }
        self.publish_progress(job, 5, "commit").await;

        Ok(StepSuccess { files_modified })
    }

    /// PR creation is best-effort: a failure is logged and the job still
    /// completes.
    async fn open_pull_request(
        &self,
        job: &WebhookJob,
        worktree: &PathBuf,
        branch: &str,
        issue_title: &str,
        change_summary: &str,
    ) {
        let body = format!(
            "Automated change for issue #{}.\n\n{}\n\nCloses #{}",
            job.issue_number.unwrap_or_default(),
            change_summary,
            job.issue_number.unwrap_or_default()
        );
        match git::create_pull_request(worktree, issue_title, &body, &self.base_branch).await {
            Ok(pr_url) => {
                let pr_number = pr_url
                    .rsplit('/')
                    .next()
                    .and_then(|n| n.parse().ok())
                    .unwrap_or_default();
                self.publish(
                    &job.correlation_id,
                    EventPayload::PrCreated {
                        pr_number,
                        issue_number: job.issue_number,
                        repository: job.event.repository_full_name(),
                        pr_url,
                        pr_title: issue_title.to_string(),
                        branch_name: branch.to_string(),
                    },
                )
                .await;
            }
            Err(e) => warn!(job_id = %job.job_id, error = %e, "pull request creation failed"),
        }
    }

    /// Remove the worktree and publish `WorktreeRemoved`. Returns false
    /// when removal failed; jobs without a worktree count as clean.
    async fn cleanup(&self, job: &WebhookJob, correlation_id: &str) -> bool {
        let Some(path) = &job.worktree_path else {
            return true;
        };
        match self.worktrees.remove_worktree(std::path::Path::new(path)).await {
            Ok(()) => {
                self.publish(
                    correlation_id,
                    EventPayload::WorktreeRemoved {
                        job_id: job.job_id.clone(),
                        issue_number: job.issue_number,
                        worktree_path: path.clone(),
                    },
                )
                .await;
                true
            }
            Err(e) => {
                error!(job_id = %job.job_id, path = %path, error = %e, "worktree removal failed");
                false
            }
        }
    }

    fn agent_context(&self, job: &WebhookJob, skill: &str, worktree: &PathBuf) -> AgentContext {
        AgentContext::from([
            (
                "worktree_path".to_string(),
                worktree.to_string_lossy().to_string(),
            ),
            (
                "issue_number".to_string(),
                job.issue_number.unwrap_or_default().to_string(),
            ),
            (
                "repository".to_string(),
                job.event.repository_full_name(),
            ),
            ("skill".to_string(), skill.to_string()),
        ])
    }

    async fn publish(&self, correlation_id: &str, payload: EventPayload) {
        self.bus
            .publish(DomainEvent::new(correlation_id, payload))
            .await;
    }

    async fn publish_progress(&self, job: &WebhookJob, step: i64, step_name: &str) {
        self.publish(
            &job.correlation_id,
            EventPayload::JobProgress {
                job_id: job.job_id.clone(),
                issue_number: job.issue_number,
                step,
                total_steps: TOTAL_STEPS,
                step_name: step_name.to_string(),
            },
        )
        .await;
    }
}

fn error_type_of(error: &str) -> String {
    if error.contains("timed out") {
        "AgentTimeout".to_string()
    } else if error.contains("malformed") {
        "AgentMalformedOutput".to_string()
    } else if error.contains("crashed") {
        "AgentCrashed".to_string()
    } else if error.contains("worktree creation") {
        "WorktreeCreateFailed".to_string()
    } else {
        "JobFailed".to_string()
    }
}
