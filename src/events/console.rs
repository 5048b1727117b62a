//! Console push channel for the WebUI.
//!
//! Job progress is forwarded as newline-delimited JSON envelopes over a
//! process-wide broadcast channel; each `/ws/console` client filters by
//! `job_id` at the socket loop.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use super::{DomainEvent, EventBus, EventKind, EventPayload};

/// Severity levels exposed to the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleLevel {
    Info,
    Warning,
    Error,
    ToolUse,
}

/// One console envelope as sent to WebSocket clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleMessage {
    pub timestamp: String,
    pub job_id: String,
    pub level: ConsoleLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ConsoleMessage {
    pub fn new(job_id: impl Into<String>, level: ConsoleLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            job_id: job_id.into(),
            level,
            message: message.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Fan-out of console messages to connected WebSocket clients.
#[derive(Clone)]
pub struct ConsoleBroadcaster {
    tx: broadcast::Sender<ConsoleMessage>,
}

impl ConsoleBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleMessage> {
        self.tx.subscribe()
    }

    /// Send a message; a send with no connected clients is not an error.
    pub fn send(&self, message: ConsoleMessage) {
        let _ = self.tx.send(message);
    }

    pub fn send_raw(
        &self,
        job_id: &str,
        level: ConsoleLevel,
        message: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) {
        let mut msg = ConsoleMessage::new(job_id, level, message);
        msg.metadata = metadata;
        self.send(msg);
    }

    /// Subscribe to every job event and mirror it onto the console channel.
    pub fn register(&self, bus: &EventBus) {
        let kinds = [
            EventKind::JobStarted,
            EventKind::JobProgress,
            EventKind::JobCompleted,
            EventKind::JobFailed,
            EventKind::JobCommitted,
            EventKind::JobPushed,
            EventKind::WorktreeRemoved,
        ];
        for kind in kinds {
            let broadcaster = self.clone();
            bus.subscribe_fn(kind, move |event| broadcaster.forward(&event));
        }
    }

    fn forward(&self, event: &DomainEvent) {
        let Some(job_id) = event.job_id() else {
            return;
        };
        let (level, message) = match &event.payload {
            EventPayload::JobStarted { agent_type, .. } => (
                ConsoleLevel::Info,
                format!("Job started with agent {agent_type}"),
            ),
            EventPayload::JobProgress {
                step,
                total_steps,
                step_name,
                ..
            } => (
                ConsoleLevel::Info,
                format!("Step {step}/{total_steps}: {step_name}"),
            ),
            EventPayload::JobCompleted { files_modified, .. } => (
                ConsoleLevel::Info,
                format!("Job completed ({files_modified} files modified)"),
            ),
            EventPayload::JobFailed { error_message, .. } => {
                (ConsoleLevel::Error, format!("Job failed: {error_message}"))
            }
            EventPayload::JobCommitted { commit_hash, .. } => (
                ConsoleLevel::Info,
                format!("Changes committed as {commit_hash}"),
            ),
            EventPayload::JobPushed { branch_name, .. } => {
                (ConsoleLevel::Info, format!("Pushed branch {branch_name}"))
            }
            EventPayload::WorktreeRemoved { worktree_path, .. } => (
                ConsoleLevel::Info,
                format!("Worktree removed: {worktree_path}"),
            ),
            _ => {
                warn!(event_type = event.event_type(), "unexpected console event");
                return;
            }
        };
        self.send(ConsoleMessage::new(job_id, level, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_message_serializes_without_null_metadata() {
        let msg = ConsoleMessage::new("j1", ConsoleLevel::Info, "hello");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"level\":\"info\""));
        assert!(!json.contains("metadata"));

        let with_meta = msg.with_metadata(serde_json::json!({"tool": "Edit"}));
        let json = serde_json::to_string(&with_meta).unwrap();
        assert!(json.contains("\"tool\":\"Edit\""));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscriber() {
        let broadcaster = ConsoleBroadcaster::new(16);
        let mut rx = broadcaster.subscribe();
        broadcaster.send_raw("j1", ConsoleLevel::ToolUse, "Editing: src/main.rs", None);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.job_id, "j1");
        assert_eq!(received.level, ConsoleLevel::ToolUse);
    }

    #[tokio::test]
    async fn test_forward_job_events_onto_channel() {
        let bus = EventBus::new();
        let broadcaster = ConsoleBroadcaster::new(16);
        broadcaster.register(&bus);
        let mut rx = broadcaster.subscribe();

        bus.publish(DomainEvent::new(
            "c",
            EventPayload::JobFailed {
                job_id: "j9".into(),
                issue_number: None,
                repository: String::new(),
                error_message: "agent timed out".into(),
                error_type: "AgentTimeout".into(),
                duration_seconds: 1.0,
            },
        ))
        .await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.job_id, "j9");
        assert_eq!(msg.level, ConsoleLevel::Error);
        assert!(msg.message.contains("agent timed out"));
    }

    #[test]
    fn test_send_without_subscribers_is_silent() {
        let broadcaster = ConsoleBroadcaster::new(4);
        broadcaster.send_raw("j", ConsoleLevel::Info, "nobody listening", None);
    }
}
