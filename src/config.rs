//! Runtime configuration for Skybridge.
//!
//! All settings come from environment variables (a `.env` file is honored
//! via dotenvy). The workspace root holds the durable state layout:
//!
//! ```text
//! <workspace>/
//!   queue/          file-backed job queue bins
//!   data/kanban.db  kanban projection store
//!   snapshots/      per-subject snapshot JSON
//!   diffs/          per-subject diff JSON
//! ```
//!
//! Worktrees live outside the workspace (default sibling directory) so an
//! agent confined to its worktree can never touch queue or kanban state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Feature flags evaluated once at startup.
#[derive(Debug, Clone, Copy)]
pub struct FeatureFlags {
    /// Prefer the SDK stream-json adapter over the legacy CLI adapter.
    pub use_sdk_adapter: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            use_sdk_adapter: true,
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

impl FeatureFlags {
    pub fn from_env() -> Self {
        Self {
            use_sdk_adapter: env_bool("USE_SDK_ADAPTER", true),
        }
    }
}

/// API auth and quota settings for the ticket/envelope surface.
#[derive(Debug, Clone, Default)]
pub struct ApiAuthConfig {
    pub api_keys: Vec<String>,
    pub bearer_tokens: Vec<String>,
    /// Method name → comma-separated allowed key prefixes. Empty map allows all.
    pub method_policy: HashMap<String, Vec<String>>,
    pub rate_limit_per_minute: u32,
    pub allow_localhost: bool,
}

impl ApiAuthConfig {
    pub fn from_env() -> Self {
        let split_csv = |key: &str| -> Vec<String> {
            std::env::var(key)
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };

        // SKYBRIDGE_METHOD_POLICY format: "method_a=key1|key2;method_b=key3"
        let mut method_policy = HashMap::new();
        if let Ok(raw) = std::env::var("SKYBRIDGE_METHOD_POLICY") {
            for entry in raw.split(';').filter(|e| !e.trim().is_empty()) {
                if let Some((method, keys)) = entry.split_once('=') {
                    let keys: Vec<String> = keys
                        .split('|')
                        .map(|k| k.trim().to_string())
                        .filter(|k| !k.is_empty())
                        .collect();
                    method_policy.insert(method.trim().to_string(), keys);
                }
            }
        }

        Self {
            api_keys: split_csv("SKYBRIDGE_API_KEYS"),
            bearer_tokens: split_csv("SKYBRIDGE_BEARER_TOKENS"),
            method_policy,
            rate_limit_per_minute: std::env::var("SKYBRIDGE_RATE_LIMIT_PER_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            allow_localhost: env_bool("ALLOW_LOCALHOST", false),
        }
    }
}

/// Process-wide configuration, loaded once in `main` and passed by handle.
#[derive(Debug, Clone)]
pub struct Config {
    /// Workspace root for durable state.
    pub workspace: PathBuf,
    /// Root directory under which per-job worktrees are created.
    pub worktrees_base: PathBuf,
    /// Repository the worktrees are carved from.
    pub repo_path: PathBuf,
    /// Base branch for new worktrees.
    pub base_branch: String,
    /// Number of concurrent job workers.
    pub worker_count: usize,
    /// Delivery-id TTL for idempotency, in hours.
    pub dedup_ttl_hours: i64,
    pub flags: FeatureFlags,
    pub auth: ApiAuthConfig,
}

impl Config {
    /// Load configuration from the environment. `repo_path` anchors relative
    /// defaults for the workspace and worktree roots.
    pub fn from_env(repo_path: PathBuf) -> Result<Self> {
        // A missing .env file is fine; a malformed one is not.
        match dotenvy::dotenv() {
            Ok(_) | Err(dotenvy::Error::Io(_)) => {}
            Err(e) => return Err(e).context("Failed to parse .env file"),
        }

        let workspace = std::env::var("SKYBRIDGE_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| repo_path.join("workspace"));

        let worktrees_base = std::env::var("WORKTREES_BASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                repo_path
                    .parent()
                    .map(|p| p.join("skybridge-worktrees"))
                    .unwrap_or_else(|| repo_path.join("worktrees"))
            });

        let base_branch =
            std::env::var("SKYBRIDGE_BASE_BRANCH").unwrap_or_else(|_| "dev".to_string());

        let worker_count = std::env::var("SKYBRIDGE_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4);

        Ok(Self {
            workspace,
            worktrees_base,
            repo_path,
            base_branch,
            worker_count,
            dedup_ttl_hours: 24,
            flags: FeatureFlags::from_env(),
            auth: ApiAuthConfig::from_env(),
        })
    }

    /// HMAC secret for a webhook source, from `WEBHOOK_<SOURCE>_SECRET`.
    pub fn webhook_secret(&self, source: &str) -> Option<String> {
        std::env::var(format!("WEBHOOK_{}_SECRET", source.to_uppercase())).ok()
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.workspace.join("queue")
    }

    pub fn kanban_db_path(&self) -> PathBuf {
        self.workspace.join("data").join("kanban.db")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.workspace.join("snapshots")
    }

    pub fn diffs_dir(&self) -> PathBuf {
        self.workspace.join("diffs")
    }

    /// Create the workspace directory layout.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.queue_dir(),
            self.workspace.join("data"),
            self.snapshots_dir(),
            self.diffs_dir(),
            self.worktrees_base.clone(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Test-friendly constructor anchored entirely below one directory.
pub fn config_for_root(root: &Path) -> Config {
    Config {
        workspace: root.join("workspace"),
        worktrees_base: root.join("worktrees"),
        repo_path: root.join("repo"),
        base_branch: "dev".to_string(),
        worker_count: 4,
        dedup_ttl_hours: 24,
        flags: FeatureFlags::default(),
        auth: ApiAuthConfig::default(),
    }
}
