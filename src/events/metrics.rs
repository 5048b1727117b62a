//! Metrics aggregation over the event stream.
//!
//! Subscribes to every job and issue event, keeps counters plus a sliding
//! one-hour window of job completions for throughput and latency
//! percentiles. Queried by the `/metrics` handler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::{DomainEvent, EventBus, EventKind, EventPayload};

fn window() -> Duration {
    Duration::hours(1)
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub events_total: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub issues_received: u64,
    pub success_rate: f64,
    pub jobs_per_hour: usize,
    pub latency_p50_seconds: f64,
    pub latency_p95_seconds: f64,
    pub latency_p99_seconds: f64,
    pub event_counts: HashMap<String, u64>,
}

#[derive(Default)]
struct MetricsState {
    events_total: u64,
    jobs_completed: u64,
    jobs_failed: u64,
    issues_received: u64,
    event_counts: HashMap<String, u64>,
    /// (completed_at, duration_seconds) per terminal job inside the window.
    window: Vec<(DateTime<Utc>, f64)>,
}

impl MetricsState {
    fn trim_window(&mut self, now: DateTime<Utc>) {
        self.window.retain(|(ts, _)| now - *ts <= window());
    }
}

/// Listener maintaining in-memory metrics. Clone the handle freely; state is
/// shared behind a mutex taken only for short updates.
#[derive(Clone, Default)]
pub struct MetricsListener {
    state: Arc<Mutex<MetricsState>>,
}

impl MetricsListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe this listener to every job and issue event kind.
    pub fn register(&self, bus: &EventBus) -> Vec<String> {
        let kinds = [
            EventKind::IssueReceived,
            EventKind::IssueAssigned,
            EventKind::IssueLabelled,
            EventKind::IssueClosed,
            EventKind::IssueCommented,
            EventKind::JobCreated,
            EventKind::JobStarted,
            EventKind::JobProgress,
            EventKind::JobCompleted,
            EventKind::JobFailed,
            EventKind::JobCommitted,
            EventKind::JobPushed,
            EventKind::WorktreeRemoved,
            EventKind::PrCreated,
        ];
        kinds
            .into_iter()
            .map(|kind| {
                let listener = self.clone();
                bus.subscribe_fn(kind, move |event| listener.record(&event))
            })
            .collect()
    }

    pub fn record(&self, event: &DomainEvent) {
        let mut state = self.state.lock().unwrap();
        state.events_total += 1;
        *state
            .event_counts
            .entry(event.event_type().to_string())
            .or_insert(0) += 1;

        match &event.payload {
            EventPayload::JobCompleted {
                duration_seconds, ..
            } => {
                state.jobs_completed += 1;
                state.window.push((event.timestamp, *duration_seconds));
                state.trim_window(Utc::now());
            }
            EventPayload::JobFailed {
                duration_seconds, ..
            } => {
                state.jobs_failed += 1;
                state.window.push((event.timestamp, *duration_seconds));
                state.trim_window(Utc::now());
            }
            EventPayload::IssueReceived { .. } => {
                state.issues_received += 1;
            }
            _ => {}
        }
    }

    pub fn report(&self) -> MetricsReport {
        let mut state = self.state.lock().unwrap();
        state.trim_window(Utc::now());

        let terminal = state.jobs_completed + state.jobs_failed;
        let success_rate = if terminal > 0 {
            state.jobs_completed as f64 / terminal as f64
        } else {
            0.0
        };

        let mut latencies: Vec<f64> = state.window.iter().map(|(_, d)| *d).collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        MetricsReport {
            events_total: state.events_total,
            jobs_completed: state.jobs_completed,
            jobs_failed: state.jobs_failed,
            issues_received: state.issues_received,
            success_rate,
            jobs_per_hour: state.window.len(),
            latency_p50_seconds: percentile(&latencies, 0.50),
            latency_p95_seconds: percentile(&latencies, 0.95),
            latency_p99_seconds: percentile(&latencies, 0.99),
            event_counts: state.event_counts.clone(),
        }
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((q * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(duration: f64) -> DomainEvent {
        DomainEvent::new(
            "c",
            EventPayload::JobCompleted {
                job_id: "j".into(),
                issue_number: Some(1),
                repository: "o/r".into(),
                files_modified: 2,
                duration_seconds: duration,
                worktree_path: String::new(),
            },
        )
    }

    fn failed(duration: f64) -> DomainEvent {
        DomainEvent::new(
            "c",
            EventPayload::JobFailed {
                job_id: "j".into(),
                issue_number: Some(1),
                repository: "o/r".into(),
                error_message: "e".into(),
                error_type: "AgentTimeout".into(),
                duration_seconds: duration,
            },
        )
    }

    #[test]
    fn test_success_rate() {
        let metrics = MetricsListener::new();
        metrics.record(&completed(1.0));
        metrics.record(&completed(2.0));
        metrics.record(&failed(3.0));
        let report = metrics.report();
        assert_eq!(report.jobs_completed, 2);
        assert_eq!(report.jobs_failed, 1);
        assert!((report.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentiles_nearest_rank() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&values, 0.50), 50.0);
        assert_eq!(percentile(&values, 0.95), 95.0);
        assert_eq!(percentile(&values, 0.99), 99.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
        assert_eq!(percentile(&[7.0], 0.99), 7.0);
    }

    #[test]
    fn test_jobs_per_hour_counts_window_entries() {
        let metrics = MetricsListener::new();
        for _ in 0..5 {
            metrics.record(&completed(0.5));
        }
        assert_eq!(metrics.report().jobs_per_hour, 5);
    }

    #[test]
    fn test_event_counts_by_type() {
        let metrics = MetricsListener::new();
        metrics.record(&completed(1.0));
        metrics.record(&completed(1.0));
        metrics.record(&failed(1.0));
        let report = metrics.report();
        assert_eq!(report.event_counts["job.completed"], 2);
        assert_eq!(report.event_counts["job.failed"], 1);
    }

    #[tokio::test]
    async fn test_register_subscribes_to_job_events() {
        let bus = EventBus::new();
        let metrics = MetricsListener::new();
        let subs = metrics.register(&bus);
        assert_eq!(subs.len(), 14);

        bus.publish(completed(1.5)).await;
        assert_eq!(metrics.report().jobs_completed, 1);
    }
}
