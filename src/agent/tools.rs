//! Host-side tools available to the agent.
//!
//! These run in the orchestrator process, never inside the worktree
//! subprocess. The set is fixed; invocations arrive as structured tool-use
//! messages and anything outside the enum is ignored.

use serde_json::Value;
use tracing::{info, warn};

use crate::events::console::{ConsoleBroadcaster, ConsoleLevel};

/// The fixed privileged tool set.
#[derive(Debug, Clone, PartialEq)]
pub enum SkybridgeTool {
    /// Push a progress line to console subscribers.
    PublishProgress { message: String },
    /// Emit a structured log line attributed to the agent.
    EmitLog { level: String, message: String },
    /// Record a named checkpoint for later inspection.
    RecordCheckpoint { name: String },
}

impl SkybridgeTool {
    /// Map a tool-use (name, input) pair onto the tool set. Returns `None`
    /// for tools executed by the agent itself (Read, Edit, Bash, ...).
    pub fn parse(name: &str, input: &Value) -> Option<Self> {
        let text = |key: &str| {
            input
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        match name {
            "skybridge_progress" => Some(Self::PublishProgress {
                message: text("message"),
            }),
            "skybridge_log" => Some(Self::EmitLog {
                level: {
                    let level = text("level");
                    if level.is_empty() { "info".to_string() } else { level }
                },
                message: text("message"),
            }),
            "skybridge_checkpoint" => Some(Self::RecordCheckpoint { name: text("name") }),
            _ => None,
        }
    }
}

/// Executes host-side tools on behalf of one job's agent.
pub struct ToolHost {
    job_id: String,
    console: ConsoleBroadcaster,
}

impl ToolHost {
    pub fn new(job_id: impl Into<String>, console: ConsoleBroadcaster) -> Self {
        Self {
            job_id: job_id.into(),
            console,
        }
    }

    pub fn dispatch(&self, tool: SkybridgeTool) {
        match tool {
            SkybridgeTool::PublishProgress { message } => {
                self.console
                    .send_raw(&self.job_id, ConsoleLevel::Info, message, None);
            }
            SkybridgeTool::EmitLog { level, message } => {
                let console_level = match level.as_str() {
                    "warning" | "warn" => ConsoleLevel::Warning,
                    "error" => ConsoleLevel::Error,
                    _ => ConsoleLevel::Info,
                };
                match console_level {
                    ConsoleLevel::Error => warn!(job_id = %self.job_id, "{message}"),
                    _ => info!(job_id = %self.job_id, "{message}"),
                }
                self.console
                    .send_raw(&self.job_id, console_level, message, None);
            }
            SkybridgeTool::RecordCheckpoint { name } => {
                info!(job_id = %self.job_id, checkpoint = %name, "checkpoint recorded");
                self.console.send_raw(
                    &self.job_id,
                    ConsoleLevel::Info,
                    format!("checkpoint: {name}"),
                    Some(serde_json::json!({"checkpoint": name})),
                );
            }
        }
    }
}
