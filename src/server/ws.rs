//! `/ws/console` — per-job console streaming.
//!
//! Clients connect with `?job_id=<id>` and receive the newline-delimited
//! JSON envelopes for that job. A ping/pong keepalive detects dead peers.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use super::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct ConsoleQuery {
    pub job_id: String,
}

pub async fn console_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConsoleQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_console_socket(socket, state, query.job_id))
}

async fn run_console_socket(socket: WebSocket, state: Arc<AppState>, job_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.console.subscribe();

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick fires immediately; consume it.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    debug!(job_id = %job_id, "console client connected");

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            broadcast = rx.recv() => {
                match broadcast {
                    Ok(message) if message.job_id == job_id => {
                        let Ok(json) = serde_json::to_string(&message) else { continue };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {} // other job's traffic
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(job_id = %job_id, skipped, "console client lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    debug!(job_id = %job_id, "console client disconnected");
}
