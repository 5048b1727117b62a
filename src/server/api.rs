//! HTTP handlers: webhook intake, health, metrics, job listing, and the
//! ticket/envelope RPC surface.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::auth::AuthError;
use super::AppState;
use crate::errors::IntakeError;
use crate::webhook::event::WebhookSource;
use crate::webhook::intake::IntakeOutcome;
use crate::webhook::signature::SignatureVerifier;

/// Headers the per-source verifiers and the intake look up by canonical
/// name; axum lowercases everything on the wire.
const CANONICAL_HEADERS: &[(&str, &str)] = &[
    ("x-github-event", "X-GitHub-Event"),
    ("x-github-delivery", "X-GitHub-Delivery"),
    ("x-hub-signature-256", "X-Hub-Signature-256"),
    ("x-trello-webhook", "X-Trello-Webhook"),
];

fn canonical_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (wire, canonical) in CANONICAL_HEADERS {
        if let Some(value) = headers.get(*wire).and_then(|v| v.to_str().ok()) {
            map.insert((*canonical).to_string(), value.to_string());
        }
    }
    map
}

fn intake_error_response(error: IntakeError) -> Response {
    let status = match &error {
        IntakeError::Unauthorized { .. } | IntakeError::MissingHeader(_) => {
            StatusCode::UNAUTHORIZED
        }
        IntakeError::InvalidPayload(_)
        | IntakeError::UnsupportedSource(_)
        | IntakeError::UnsupportedEvent(_) => StatusCode::BAD_REQUEST,
        IntakeError::SecretNotConfigured(_) | IntakeError::Queue(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    (status, Json(json!({"error": error.to_string()}))).into_response()
}

pub async fn github_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header_map = canonical_headers(&headers);
    let Some(event_header) = header_map.get("X-GitHub-Event").cloned() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing X-GitHub-Event header"})),
        )
            .into_response();
    };

    match state
        .intake
        .receive(WebhookSource::GitHub, &event_header, &body, &header_map)
        .await
    {
        Ok(IntakeOutcome::Pong) => (StatusCode::OK, Json(json!({"message": "pong"}))).into_response(),
        Ok(IntakeOutcome::Accepted {
            job_id: Some(job_id),
        }) => (StatusCode::ACCEPTED, Json(json!({"job_id": job_id}))).into_response(),
        Ok(IntakeOutcome::Accepted { job_id: None }) => (
            StatusCode::OK,
            Json(json!({"message": "duplicate delivery ignored"})),
        )
            .into_response(),
        Err(error) => {
            warn!(error = %error, "github webhook rejected");
            intake_error_response(error)
        }
    }
}

pub async fn trello_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((verifier, secret)) = &state.trello else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "trello webhook not configured"})),
        )
            .into_response();
    };

    let header_map = canonical_headers(&headers);
    let Some(signature) = verifier.extract_signature(&header_map) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing X-Trello-Webhook header"})),
        )
            .into_response();
    };
    if !verifier.verify(&body, &signature, secret) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "signature verification failed"})),
        )
            .into_response();
    }

    // Inbound reconciliation is handled by the sync layer; acknowledging
    // receipt is all the HTTP surface owes Trello.
    (StatusCode::OK, Json(json!({"message": "received"}))).into_response()
}

pub async fn health() -> Response {
    (
        StatusCode::OK,
        Json(json!({"status": "ok", "service": "skybridge"})),
    )
        .into_response()
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let report = state.metrics.report();
    let queue_size = state.queue.size().await;
    (
        StatusCode::OK,
        Json(json!({
            "queue_size": queue_size,
            "events_total": report.events_total,
            "jobs_completed": report.jobs_completed,
            "jobs_failed": report.jobs_failed,
            "issues_received": report.issues_received,
            "success_rate": report.success_rate,
            "jobs_per_hour": report.jobs_per_hour,
            "latency_p50_seconds": report.latency_p50_seconds,
            "latency_p95_seconds": report.latency_p95_seconds,
            "latency_p99_seconds": report.latency_p99_seconds,
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub status: Option<String>,
}

fn default_limit() -> usize {
    100
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobsQuery>,
) -> Response {
    let status_filter = match query.status.as_deref() {
        None => None,
        Some("pending") => Some(crate::webhook::event::JobStatus::Pending),
        Some("processing") => Some(crate::webhook::event::JobStatus::Processing),
        Some("completed") => Some(crate::webhook::event::JobStatus::Completed),
        Some("failed") => Some(crate::webhook::event::JobStatus::Failed),
        Some("cleanup_failed") => Some(crate::webhook::event::JobStatus::CleanupFailed),
        Some(other) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("unknown status filter: {other}")})),
            )
                .into_response();
        }
    };

    match state.queue.list_jobs(query.limit, status_filter).await {
        Ok(jobs) => (StatusCode::OK, Json(json!({"jobs": jobs}))).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

// ── Ticket / envelope ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TicketQuery {
    pub method: String,
}

fn auth_error_response(error: AuthError) -> Response {
    let status = match error {
        AuthError::Unauthorized | AuthError::BadTicket => StatusCode::UNAUTHORIZED,
        AuthError::MethodForbidden(_) => StatusCode::FORBIDDEN,
        AuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
    };
    (status, Json(json!({"error": error.to_string()}))).into_response()
}

fn credentials(headers: &HeaderMap) -> (Option<&str>, Option<&str>) {
    let api_key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    (api_key, bearer)
}

pub async fn issue_ticket(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TicketQuery>,
    headers: HeaderMap,
) -> Response {
    let (api_key, bearer) = credentials(&headers);
    let caller = match state
        .tickets
        .authenticate(api_key, bearer, state.loopback_only)
    {
        Ok(caller) => caller,
        Err(e) => return auth_error_response(e),
    };
    match state.tickets.issue(&caller, &query.method) {
        Ok(ticket) => (
            StatusCode::OK,
            Json(json!({"ticket": ticket, "method": query.method})),
        )
            .into_response(),
        Err(e) => auth_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct EnvelopeRequest {
    pub ticket: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub async fn execute_envelope(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnvelopeRequest>,
) -> Response {
    if let Err(e) = state.tickets.redeem(&request.ticket, &request.method) {
        return auth_error_response(e);
    }
    match state.rpc.invoke(&request.method, request.params).await {
        Some(Ok(result)) => (StatusCode::OK, Json(json!({"result": result}))).into_response(),
        Some(Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("unknown method: {}", request.method)})),
        )
            .into_response(),
    }
}
