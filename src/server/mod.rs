//! HTTP ingress: router assembly, shared state, and server startup.

pub mod api;
pub mod auth;
pub mod ws;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::events::console::ConsoleBroadcaster;
use crate::events::metrics::MetricsListener;
use crate::queue::JobQueue;
use crate::webhook::WebhookIntake;
use crate::webhook::signature::TrelloSignatureVerifier;

pub use auth::TicketRegistry;

/// Future type returned by RPC handlers.
pub type RpcFuture = Pin<Box<dyn Future<Output = anyhow::Result<serde_json::Value>> + Send>>;
pub type RpcHandler = Arc<dyn Fn(serde_json::Value) -> RpcFuture + Send + Sync>;

/// Explicit name → handler registry for the envelope surface.
#[derive(Default)]
pub struct RpcRegistry {
    handlers: Mutex<HashMap<String, RpcHandler>>,
}

impl RpcRegistry {
    pub fn register(&self, name: impl Into<String>, handler: RpcHandler) {
        self.handlers.lock().unwrap().insert(name.into(), handler);
    }

    pub async fn invoke(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> Option<anyhow::Result<serde_json::Value>> {
        let handler = {
            let handlers = self.handlers.lock().unwrap();
            handlers.get(name).cloned()
        };
        match handler {
            Some(handler) => Some(handler(params).await),
            None => None,
        }
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Shared state behind every handler.
pub struct AppState {
    pub intake: WebhookIntake,
    pub queue: Arc<dyn JobQueue>,
    pub metrics: MetricsListener,
    pub console: ConsoleBroadcaster,
    pub tickets: TicketRegistry,
    pub rpc: RpcRegistry,
    /// Trello signature verification (verifier + secret), when configured.
    pub trello: Option<(TrelloSignatureVerifier, String)>,
    /// True when the listener binds loopback only; grants the
    /// `ALLOW_LOCALHOST` bypass to every connection.
    pub loopback_only: bool,
}

impl AppState {
    /// Register the built-in RPC methods served through `/envelope`.
    pub fn register_builtin_methods(self: &Arc<Self>) {
        let queue = Arc::clone(&self.queue);
        self.rpc.register(
            "queue.status",
            Arc::new(move |_params| {
                let queue = Arc::clone(&queue);
                Box::pin(async move {
                    Ok(serde_json::json!({"pending": queue.size().await}))
                }) as RpcFuture
            }),
        );

        let queue = Arc::clone(&self.queue);
        self.rpc.register(
            "jobs.list",
            Arc::new(move |params| {
                let queue = Arc::clone(&queue);
                Box::pin(async move {
                    let limit = params
                        .get("limit")
                        .and_then(|l| l.as_u64())
                        .unwrap_or(100) as usize;
                    let jobs = queue.list_jobs(limit, None).await?;
                    Ok(serde_json::to_value(jobs)?)
                }) as RpcFuture
            }),
        );
    }
}

/// Assemble the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/github", post(api::github_webhook))
        .route("/webhooks/trello", post(api::trello_webhook))
        .route("/health", get(api::health))
        .route("/metrics", get(api::metrics))
        .route("/jobs", get(api::list_jobs))
        .route("/ticket", get(api::issue_ticket))
        .route("/envelope", post(api::execute_envelope))
        .route("/ws/console", get(ws::console_handler))
        .with_state(state)
}

/// Server knobs beyond the process [`Config`].
pub struct ServerConfig {
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8430,
            dev_mode: false,
        }
    }
}

/// Build state from the process config and the already-wired core pieces.
pub fn build_state(
    config: &Config,
    intake: WebhookIntake,
    queue: Arc<dyn JobQueue>,
    metrics: MetricsListener,
    console: ConsoleBroadcaster,
    loopback_only: bool,
) -> Arc<AppState> {
    let trello = config
        .webhook_secret("trello")
        .map(|secret| {
            let callback = std::env::var("TRELLO_CALLBACK_URL").unwrap_or_default();
            (TrelloSignatureVerifier::new(callback), secret)
        });

    let state = Arc::new(AppState {
        intake,
        queue,
        metrics,
        console,
        tickets: TicketRegistry::new(config.auth.clone()),
        rpc: RpcRegistry::default(),
        trello,
        loopback_only,
    });
    state.register_builtin_methods();
    state
}

/// Bind and serve until ctrl-c.
pub async fn start_server(server_config: ServerConfig, state: Arc<AppState>) -> Result<()> {
    let mut app = build_router(state);
    if server_config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if server_config.dev_mode {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let addr = format!("{host}:{}", server_config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %listener.local_addr()?, "skybridge listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install ctrl-c handler");
    info!("shutdown requested");
}
