//! Agent execution subsystem.
//!
//! [`AgentFacade`] is the capability set the orchestrator works against; the
//! concrete adapter (SDK stream-json or legacy CLI) is chosen once at
//! startup from the `USE_SDK_ADAPTER` flag.

pub mod adapter;
pub mod domain;
pub mod message;
pub mod prompt;
pub mod tools;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

pub use adapter::{CliAgentAdapter, SdkAgentAdapter};
pub use domain::{AgentExecution, AgentResult, AgentState, ExecutionOutcome, FailureKind};
pub use message::AgentMessage;
pub use prompt::PromptConfig;

use crate::config::FeatureFlags;
use crate::errors::AgentError;
use crate::events::console::ConsoleBroadcaster;
use crate::webhook::event::WebhookJob;

/// Placeholder values substituted into the system prompt.
pub type AgentContext = HashMap<String, String>;

/// Capability set every agent adapter implements.
#[async_trait]
pub trait AgentFacade: Send + Sync {
    /// Run one agent to completion (or timeout) inside the worktree. Errors
    /// are spawn-level only; execution failures are recorded on the
    /// returned [`AgentExecution`].
    async fn spawn(
        &self,
        job: &WebhookJob,
        skill: &str,
        worktree_path: &Path,
        context: &AgentContext,
    ) -> Result<AgentExecution, AgentError>;

    fn agent_type(&self) -> &'static str;

    fn timeout_for_skill(&self, skill: &str) -> u64;
}

/// Per-skill wall-clock timeouts (seconds).
#[derive(Debug, Clone, Default)]
pub struct SkillTimeouts {
    overrides: HashMap<String, u64>,
}

impl SkillTimeouts {
    pub fn get(&self, skill: &str) -> u64 {
        if let Some(seconds) = self.overrides.get(skill) {
            return *seconds;
        }
        match skill {
            "resolve-issue" => 900,
            "analyze-issue" | "publish-issue" => 300,
            "review-issue" => 600,
            _ => 600,
        }
    }

    pub fn set(&mut self, skill: &str, seconds: u64) {
        self.overrides.insert(skill.to_string(), seconds);
    }
}

/// Skill selection from issue labels; the orchestrator runs this once per
/// job before invoking the facade.
pub fn skill_for_labels(labels: &[String]) -> &'static str {
    let has = |needle: &str| labels.iter().any(|l| l.eq_ignore_ascii_case(needle));
    if has("analyze") || has("brainstorm") {
        "analyze-issue"
    } else if has("review") {
        "review-issue"
    } else if has("publish") || has("release") {
        "publish-issue"
    } else {
        "resolve-issue"
    }
}

/// Choose the adapter once at startup.
pub fn select_adapter(flags: &FeatureFlags, console: ConsoleBroadcaster) -> Arc<dyn AgentFacade> {
    if flags.use_sdk_adapter {
        Arc::new(SdkAgentAdapter::new(console))
    } else {
        Arc::new(CliAgentAdapter::new(console))
    }
}
