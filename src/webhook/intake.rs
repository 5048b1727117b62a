//! Webhook intake: authenticate, deduplicate, and enqueue.
//!
//! The only synchronous signal a webhook sender gets is the intake outcome;
//! everything downstream is observable via the console channel, metrics,
//! and the kanban board.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::event::{WebhookEvent, WebhookJob, WebhookSource};
use super::signature::SignatureVerifier;
use crate::errors::IntakeError;
use crate::events::{DomainEvent, EventBus, EventPayload};
use crate::queue::JobQueue;

/// Result of one intake attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Job enqueued; `job_id` is `None` when the delivery was a duplicate
    /// and the request is acknowledged as a no-op.
    Accepted { job_id: Option<String> },
    /// Source-level liveness probe (GitHub `ping`); no job minted.
    Pong,
}

struct SourceConfig {
    verifier: Arc<dyn SignatureVerifier>,
    secret: String,
}

/// Front door for inbound webhooks.
pub struct WebhookIntake {
    queue: Arc<dyn JobQueue>,
    bus: Arc<EventBus>,
    sources: HashMap<WebhookSource, SourceConfig>,
}

impl WebhookIntake {
    pub fn new(queue: Arc<dyn JobQueue>, bus: Arc<EventBus>) -> Self {
        Self {
            queue,
            bus,
            sources: HashMap::new(),
        }
    }

    /// Register a source with its verifier and shared secret. Unregistered
    /// sources are rejected outright.
    pub fn register_source(
        mut self,
        source: WebhookSource,
        verifier: Arc<dyn SignatureVerifier>,
        secret: impl Into<String>,
    ) -> Self {
        self.sources.insert(
            source,
            SourceConfig {
                verifier,
                secret: secret.into(),
            },
        );
        self
    }

    /// Process one inbound delivery.
    ///
    /// `event_header` is the source's event-type header value (e.g. GitHub's
    /// `X-GitHub-Event`); the full event type is composed with the payload's
    /// `action` field when one exists.
    pub async fn receive(
        &self,
        source: WebhookSource,
        event_header: &str,
        payload_bytes: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<IntakeOutcome, IntakeError> {
        let config = self.sources.get(&source).ok_or_else(|| {
            IntakeError::UnsupportedSource(source.as_str().to_string())
        })?;

        // Authentication comes first; nothing else is inspected before it.
        let signature = config
            .verifier
            .extract_signature(headers)
            .ok_or(IntakeError::MissingHeader("signature header"))?;
        if !config
            .verifier
            .verify(payload_bytes, &signature, &config.secret)
        {
            warn!(source = source.as_str(), "webhook signature mismatch");
            return Err(IntakeError::Unauthorized {
                source_name: source.as_str().to_string(),
            });
        }

        let payload: serde_json::Value = serde_json::from_slice(payload_bytes)
            .map_err(|e| IntakeError::InvalidPayload(format!("payload is not JSON: {e}")))?;

        if event_header == "ping" {
            return Ok(IntakeOutcome::Pong);
        }

        let event_type = compose_event_type(event_header, &payload);

        // The core only schedules work for issue events.
        if source == WebhookSource::GitHub && !event_type.starts_with("issues.") {
            return Err(IntakeError::UnsupportedEvent(event_type));
        }

        let delivery_id = delivery_id_for(source, headers);
        if let Some(delivery_id) = &delivery_id {
            if self.queue.exists_by_delivery(delivery_id).await? {
                info!(delivery_id = %delivery_id, "duplicate delivery acknowledged as no-op");
                return Ok(IntakeOutcome::Accepted { job_id: None });
            }
        }

        let issue = payload
            .get("issue")
            .ok_or_else(|| IntakeError::InvalidPayload("payload has no issue object".into()))?;
        let issue_number = issue
            .get("number")
            .and_then(|n| n.as_i64())
            .ok_or_else(|| IntakeError::InvalidPayload("issue number missing".into()))?;

        let event = WebhookEvent {
            source,
            event_type,
            event_id: issue_number.to_string(),
            payload,
            received_at: chrono::Utc::now(),
            signature: Some(signature),
            delivery_id,
        };

        let issue_received = issue_received_payload(&event, issue_number);
        let job = WebhookJob::create(event);
        let correlation_id = job.correlation_id.clone();
        let job_created = EventPayload::JobCreated {
            job_id: job.job_id.clone(),
            issue_number: job.issue_number,
            repository: job.event.repository_full_name(),
        };

        let job_id = self.queue.enqueue(job).await?;
        info!(job_id = %job_id, correlation_id = %correlation_id, "job enqueued");

        self.bus
            .publish_batch(vec![
                DomainEvent::new(correlation_id.clone(), issue_received),
                DomainEvent::new(correlation_id, job_created),
            ])
            .await;

        Ok(IntakeOutcome::Accepted {
            job_id: Some(job_id),
        })
    }
}

/// Compose `header.action`, or the header verbatim for action-less events.
fn compose_event_type(event_header: &str, payload: &serde_json::Value) -> String {
    match payload.get("action").and_then(|a| a.as_str()) {
        Some(action) => format!("{event_header}.{action}"),
        None => event_header.to_string(),
    }
}

fn delivery_id_for(source: WebhookSource, headers: &HashMap<String, String>) -> Option<String> {
    match source {
        WebhookSource::GitHub => headers.get("X-GitHub-Delivery").cloned(),
        _ => None,
    }
}

fn issue_received_payload(event: &WebhookEvent, issue_number: i64) -> EventPayload {
    let issue = event.payload.get("issue");
    let get_str = |v: Option<&serde_json::Value>, key: &str| {
        v.and_then(|o| o.get(key))
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string()
    };
    EventPayload::IssueReceived {
        issue_number,
        repository: event.repository_full_name(),
        title: get_str(issue, "title"),
        body: get_str(issue, "body"),
        sender: event
            .payload
            .get("sender")
            .and_then(|s| s.get("login"))
            .and_then(|l| l.as_str())
            .unwrap_or_default()
            .to_string(),
        action: event
            .payload
            .get("action")
            .and_then(|a| a.as_str())
            .unwrap_or_default()
            .to_string(),
        labels: event.issue_labels(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryJobQueue;
    use crate::webhook::signature::GitHubSignatureVerifier;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    const SECRET: &str = "test-secret";

    fn sign(payload: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn intake() -> (WebhookIntake, Arc<InMemoryJobQueue>, Arc<EventBus>) {
        let queue = Arc::new(InMemoryJobQueue::new());
        let bus = Arc::new(EventBus::new());
        let intake = WebhookIntake::new(queue.clone(), bus.clone()).register_source(
            WebhookSource::GitHub,
            Arc::new(GitHubSignatureVerifier),
            SECRET,
        );
        (intake, queue, bus)
    }

    fn issue_body() -> Vec<u8> {
        serde_json::json!({
            "action": "opened",
            "issue": {"number": 42, "title": "t", "body": "b", "labels": [{"name": "bug"}]},
            "repository": {"owner": {"login": "o"}, "name": "r"},
        })
        .to_string()
        .into_bytes()
    }

    fn headers_for(payload: &[u8], delivery: &str) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert("X-Hub-Signature-256".to_string(), sign(payload));
        headers.insert("X-GitHub-Delivery".to_string(), delivery.to_string());
        headers
    }

    #[tokio::test]
    async fn test_happy_path_enqueues_job_with_correlation() {
        let (intake, queue, bus) = intake();
        let body = issue_body();
        let headers = headers_for(&body, "d-001");

        let outcome = intake
            .receive(WebhookSource::GitHub, "issues", &body, &headers)
            .await
            .unwrap();

        let IntakeOutcome::Accepted { job_id: Some(job_id) } = outcome else {
            panic!("expected accepted with job id");
        };
        let job = queue.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(job.correlation_id, "d-001");
        assert_eq!(job.issue_number, Some(42));
        assert_eq!(job.event.event_type, "issues.opened");
        assert_eq!(queue.size().await, 1);

        let history = bus.history(None);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].event_type(), "issue.received");
        assert_eq!(history[0].event_type(), "job.created");
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_accepted_noop() {
        let (intake, queue, _) = intake();
        let body = issue_body();
        let headers = headers_for(&body, "d-001");

        intake
            .receive(WebhookSource::GitHub, "issues", &body, &headers)
            .await
            .unwrap();
        let second = intake
            .receive(WebhookSource::GitHub, "issues", &body, &headers)
            .await
            .unwrap();

        assert_eq!(second, IntakeOutcome::Accepted { job_id: None });
        assert_eq!(queue.size().await, 1);
    }

    #[tokio::test]
    async fn test_bad_signature_rejected_without_side_effects() {
        let (intake, queue, bus) = intake();
        let body = issue_body();
        let mut headers = headers_for(&body, "d-001");
        // Mutate one hex character of the signature.
        let sig = headers.get_mut("X-Hub-Signature-256").unwrap();
        let last = sig.pop().unwrap();
        sig.push(if last == '0' { '1' } else { '0' });

        let err = intake
            .receive(WebhookSource::GitHub, "issues", &body, &headers)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::Unauthorized { .. }));
        assert_eq!(queue.size().await, 0);
        assert!(bus.history(None).is_empty());
    }

    #[tokio::test]
    async fn test_ping_returns_pong_without_job() {
        let (intake, queue, _) = intake();
        let body = br#"{"zen":"Keep it logically awesome."}"#.to_vec();
        let headers = headers_for(&body, "d-ping");

        let outcome = intake
            .receive(WebhookSource::GitHub, "ping", &body, &headers)
            .await
            .unwrap();
        assert_eq!(outcome, IntakeOutcome::Pong);
        assert_eq!(queue.size().await, 0);
    }

    #[tokio::test]
    async fn test_missing_signature_header() {
        let (intake, _, _) = intake();
        let body = issue_body();
        let headers = HashMap::new();
        let err = intake
            .receive(WebhookSource::GitHub, "issues", &body, &headers)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::MissingHeader(_)));
    }

    #[tokio::test]
    async fn test_unsupported_event_type_rejected() {
        let (intake, _, _) = intake();
        let body = serde_json::json!({"action": "created", "comment": {}})
            .to_string()
            .into_bytes();
        let headers = headers_for(&body, "d-x");
        let err = intake
            .receive(WebhookSource::GitHub, "pull_request", &body, &headers)
            .await
            .unwrap_err();
        match err {
            IntakeError::UnsupportedEvent(t) => assert_eq!(t, "pull_request.created"),
            other => panic!("expected UnsupportedEvent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_issue_number_rejected() {
        let (intake, _, _) = intake();
        let body = serde_json::json!({"action": "opened", "issue": {"title": "no number"}})
            .to_string()
            .into_bytes();
        let headers = headers_for(&body, "d-y");
        let err = intake
            .receive(WebhookSource::GitHub, "issues", &body, &headers)
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_unregistered_source_rejected() {
        let (intake, _, _) = intake();
        let err = intake
            .receive(WebhookSource::Discord, "message", b"{}", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IntakeError::UnsupportedSource(_)));
    }

    #[test]
    fn test_compose_event_type() {
        let with_action = serde_json::json!({"action": "opened"});
        assert_eq!(compose_event_type("issues", &with_action), "issues.opened");
        let without = serde_json::json!({"zen": "..."});
        assert_eq!(compose_event_type("ping", &without), "ping");
    }
}
