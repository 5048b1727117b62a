//! System prompt rendering.
//!
//! The prompt is a JSON document (role, instructions, rules) treated as the
//! source of truth; `{placeholder}` markers are substituted from the job
//! context at spawn time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub role: String,
    #[serde(default)]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    pub version: String,
    pub template: PromptTemplate,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            template: PromptTemplate {
                role: "You are an autonomous coding agent resolving a GitHub issue.".to_string(),
                instructions: vec![
                    "Work only inside the isolated git worktree at {worktree_path}".to_string(),
                    "You are handling issue #{issue_number} in {repository}".to_string(),
                    "Run git through the safe_git tool; direct shell git is unavailable".to_string(),
                    "Report progress with the skybridge_progress tool as you work".to_string(),
                    "Finish by emitting a single structured result message".to_string(),
                ],
                rules: vec![
                    "DO NOT modify files outside the worktree".to_string(),
                    "DO NOT checkout existing branches; create sky/* branches only".to_string(),
                    "ALWAYS read code before changing it".to_string(),
                ],
            },
        }
    }
}

impl PromptConfig {
    /// Load a prompt config from a JSON file, falling back to the default
    /// when the file does not exist.
    pub fn load_or_default(path: &std::path::Path) -> Result<Self, AgentError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .map_err(|e| AgentError::PromptTemplate(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&data)
            .map_err(|e| AgentError::PromptTemplate(format!("parse {}: {e}", path.display())))
    }

    /// Render the prompt, substituting `{key}` markers from `context`.
    pub fn render(&self, context: &HashMap<String, String>) -> String {
        let mut parts = vec![self.template.role.clone(), String::new()];

        if !self.template.instructions.is_empty() {
            parts.push("INSTRUCTIONS:".to_string());
            for instruction in &self.template.instructions {
                parts.push(format!("- {}", substitute(instruction, context)));
            }
            parts.push(String::new());
        }

        if !self.template.rules.is_empty() {
            parts.push("RULES:".to_string());
            for rule in &self.template.rules {
                parts.push(format!("- {}", substitute(rule, context)));
            }
        }

        parts.join("\n").trim_end().to_string()
    }
}

/// Replace `{key}` with the context value; unknown keys are left verbatim so
/// a missing context entry is visible in the rendered prompt.
fn substitute(text: &str, context: &HashMap<String, String>) -> String {
    let mut out = text.to_string();
    for (key, value) in context {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}
