//! Agent adapters: spawn the opaque subprocess, stream its messages,
//! enforce the wall-clock timeout, and extract the structured result.
//!
//! Two adapters implement [`AgentFacade`]: the SDK adapter speaks the
//! stream-json protocol (preferred), the CLI adapter drives the legacy
//! plain-text protocol whose last stdout line is the result JSON. Both share
//! the subprocess machinery below.
//!
//! Timeout handling is cooperative first: stdin is closed so a well-behaved
//! agent can wind down, then the process is killed after a short grace.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::domain::{AgentExecution, AgentResult, FailureKind};
use super::message::{AgentMessage, describe_tool_use, parse_stream_line};
use super::prompt::PromptConfig;
use super::tools::{SkybridgeTool, ToolHost};
use super::{AgentContext, AgentFacade, SkillTimeouts};
use crate::errors::AgentError;
use crate::events::console::{ConsoleBroadcaster, ConsoleLevel};
use crate::webhook::event::WebhookJob;

/// Grace between cooperative shutdown and hard kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

struct StreamResult {
    messages: Vec<AgentMessage>,
    terminal: Option<AgentMessage>,
    timed_out: bool,
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
}

/// Spawn the command and pump its stdout until a terminal message, EOF, or
/// the deadline. Every parsed message is offered to `on_message`.
async fn stream_subprocess(
    mut cmd: Command,
    timeout: Duration,
    mut on_message: impl FnMut(&AgentMessage),
) -> Result<StreamResult, AgentError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(AgentError::SpawnFailed)?;
    let stdin = child.stdin.take();
    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");

    let stderr_task = tokio::spawn(async move {
        let mut collected = String::new();
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            collected.push_str(&line);
            collected.push('\n');
        }
        collected
    });

    let mut lines = BufReader::new(stdout).lines();
    let deadline = tokio::time::Instant::now() + timeout;

    let mut messages = Vec::new();
    let mut terminal = None;
    let mut timed_out = false;
    let mut stdout_log = String::new();

    loop {
        match tokio::time::timeout_at(deadline, lines.next_line()).await {
            Err(_) => {
                timed_out = true;
                break;
            }
            Ok(Ok(Some(line))) => {
                stdout_log.push_str(&line);
                stdout_log.push('\n');
                if let Some(message) = parse_stream_line(&line) {
                    on_message(&message);
                    let is_terminal = message.is_terminal();
                    if is_terminal {
                        terminal = Some(message.clone());
                    }
                    messages.push(message);
                    if is_terminal {
                        break;
                    }
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                warn!(error = %e, "agent stdout read failed");
                break;
            }
        }
    }

    // Cooperative shutdown: dropping stdin signals EOF to the agent.
    drop(stdin);
    let status = match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(status) => status.map_err(AgentError::SpawnFailed)?,
        Err(_) => {
            debug!("agent did not exit within grace; killing");
            child.kill().await.map_err(AgentError::SpawnFailed)?;
            child.wait().await.map_err(AgentError::SpawnFailed)?
        }
    };

    let stderr = stderr_task.await.unwrap_or_default();

    Ok(StreamResult {
        messages,
        terminal,
        timed_out,
        stdout: stdout_log,
        stderr,
        exit_code: status.code(),
    })
}

/// Fold the stream result into the execution record.
fn finish_execution(execution: &mut AgentExecution, stream: StreamResult) {
    execution.streamed_messages = stream.messages;
    execution.stdout = stream.stdout;
    execution.stderr = stream.stderr;

    if stream.timed_out {
        execution.mark_timed_out(format!(
            "no terminal message within {}s",
            execution.timeout_seconds
        ));
        return;
    }

    match stream.terminal {
        Some(AgentMessage::Result {
            is_error, result, ..
        }) => {
            if is_error == Some(true) {
                let detail = result
                    .as_ref()
                    .and_then(|r| r.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("agent reported an error result");
                execution.mark_failed(FailureKind::AgentReported, detail.to_string());
                return;
            }
            match result {
                Some(value) => match serde_json::from_value::<AgentResult>(value) {
                    Ok(parsed) => execution.mark_completed(parsed),
                    Err(e) => execution.mark_failed(
                        FailureKind::Malformed,
                        format!("result payload did not parse: {e}"),
                    ),
                },
                None => execution.mark_failed(
                    FailureKind::Malformed,
                    "terminal message carried no result payload",
                ),
            }
        }
        Some(_) => unreachable!("terminal is only ever a Result message"),
        None => {
            execution.mark_failed(
                FailureKind::Crashed,
                format!(
                    "exit code {:?} without a terminal message",
                    stream.exit_code
                ),
            );
        }
    }
}

/// Forward one streamed message to the console and the host tool set.
fn relay_message(message: &AgentMessage, tools: &ToolHost, console: &ConsoleBroadcaster, job_id: &str) {
    match message {
        AgentMessage::Assistant { .. } => {
            if let Some(thinking) = message.thinking_text() {
                console.send_raw(job_id, ConsoleLevel::Info, thinking, None);
            }
            for (name, input) in message.tool_uses() {
                match SkybridgeTool::parse(name, input) {
                    Some(tool) => tools.dispatch(tool),
                    None => console.send_raw(
                        job_id,
                        ConsoleLevel::ToolUse,
                        describe_tool_use(name, input),
                        Some(input.clone()),
                    ),
                }
            }
        }
        AgentMessage::Progress { content } => {
            console.send_raw(job_id, ConsoleLevel::Info, content.clone(), None);
        }
        AgentMessage::System { .. } | AgentMessage::Result { .. } => {}
    }
}

fn render_prompt(prompts: &PromptConfig, context: &AgentContext) -> String {
    prompts.render(context)
}

fn task_prompt(job: &WebhookJob, skill: &str) -> String {
    let title = job.event.issue_title().unwrap_or("(no title)");
    let body = job
        .event
        .payload
        .get("issue")
        .and_then(|i| i.get("body"))
        .and_then(|b| b.as_str())
        .unwrap_or("");
    format!(
        "Skill: {skill}\nIssue #{}: {title}\n\n{body}",
        job.issue_number.unwrap_or_default()
    )
}

/// Preferred adapter: drives the agent through its SDK CLI in stream-json
/// mode, one JSON message per stdout line.
pub struct SdkAgentAdapter {
    command: String,
    console: ConsoleBroadcaster,
    prompts: PromptConfig,
    timeouts: SkillTimeouts,
}

impl SdkAgentAdapter {
    pub fn new(console: ConsoleBroadcaster) -> Self {
        Self {
            command: std::env::var("SKYBRIDGE_AGENT_CMD").unwrap_or_else(|_| "claude".to_string()),
            console,
            prompts: PromptConfig::default(),
            timeouts: SkillTimeouts::default(),
        }
    }

    /// Override the agent binary (tests point this at a stub script).
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_prompts(mut self, prompts: PromptConfig) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_timeout(mut self, skill: &str, seconds: u64) -> Self {
        self.timeouts.set(skill, seconds);
        self
    }
}

#[async_trait]
impl AgentFacade for SdkAgentAdapter {
    async fn spawn(
        &self,
        job: &WebhookJob,
        skill: &str,
        worktree_path: &Path,
        context: &AgentContext,
    ) -> Result<AgentExecution, AgentError> {
        let timeout_seconds = self.timeout_for_skill(skill);
        let mut execution = AgentExecution::new(
            self.agent_type(),
            &job.job_id,
            worktree_path.to_string_lossy(),
            skill,
            timeout_seconds,
        );

        let system_prompt = render_prompt(&self.prompts, context);
        let mut cmd = Command::new(&self.command);
        cmd.args([
            "--print",
            "--output-format",
            "stream-json",
            "--system-prompt",
            &system_prompt,
            "-p",
            &task_prompt(job, skill),
        ])
        .current_dir(worktree_path);

        info!(job_id = %job.job_id, skill = %skill, timeout_seconds, "spawning sdk agent");
        execution.mark_running();

        let tools = ToolHost::new(&job.job_id, self.console.clone());
        let console = self.console.clone();
        let job_id = job.job_id.clone();
        let stream = stream_subprocess(cmd, Duration::from_secs(timeout_seconds), |message| {
            relay_message(message, &tools, &console, &job_id);
        })
        .await?;

        finish_execution(&mut execution, stream);
        Ok(execution)
    }

    fn agent_type(&self) -> &'static str {
        "claude-sdk"
    }

    fn timeout_for_skill(&self, skill: &str) -> u64 {
        self.timeouts.get(skill)
    }
}

/// Legacy adapter: plain stdout protocol. Progress is free text; the final
/// line is expected to be the result JSON.
pub struct CliAgentAdapter {
    command: String,
    console: ConsoleBroadcaster,
    prompts: PromptConfig,
    timeouts: SkillTimeouts,
}

impl CliAgentAdapter {
    pub fn new(console: ConsoleBroadcaster) -> Self {
        Self {
            command: std::env::var("SKYBRIDGE_AGENT_CMD").unwrap_or_else(|_| "claude".to_string()),
            console,
            prompts: PromptConfig::default(),
            timeouts: SkillTimeouts::default(),
        }
    }

    /// Override the agent binary (tests point this at a stub script).
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn with_timeout(mut self, skill: &str, seconds: u64) -> Self {
        self.timeouts.set(skill, seconds);
        self
    }
}

#[async_trait]
impl AgentFacade for CliAgentAdapter {
    async fn spawn(
        &self,
        job: &WebhookJob,
        skill: &str,
        worktree_path: &Path,
        context: &AgentContext,
    ) -> Result<AgentExecution, AgentError> {
        let timeout_seconds = self.timeout_for_skill(skill);
        let mut execution = AgentExecution::new(
            self.agent_type(),
            &job.job_id,
            worktree_path.to_string_lossy(),
            skill,
            timeout_seconds,
        );

        let system_prompt = render_prompt(&self.prompts, context);
        let mut cmd = Command::new(&self.command);
        cmd.args([
            "--print",
            "--append-system-prompt",
            &system_prompt,
            &task_prompt(job, skill),
        ])
        .current_dir(worktree_path);

        info!(job_id = %job.job_id, skill = %skill, timeout_seconds, "spawning cli agent");
        execution.mark_running();

        let console = self.console.clone();
        let job_id = job.job_id.clone();
        let stream = stream_subprocess(cmd, Duration::from_secs(timeout_seconds), |message| {
            if let AgentMessage::Progress { content } = message {
                console.send_raw(&job_id, ConsoleLevel::Info, content.clone(), None);
            }
        })
        .await?;

        finish_cli_execution(&mut execution, stream);
        Ok(execution)
    }

    fn agent_type(&self) -> &'static str {
        "claude-cli"
    }

    fn timeout_for_skill(&self, skill: &str) -> u64 {
        self.timeouts.get(skill)
    }
}

/// Legacy protocol result extraction: the last non-empty stdout line must be
/// the result JSON.
fn finish_cli_execution(execution: &mut AgentExecution, stream: StreamResult) {
    execution.streamed_messages = stream.messages;
    execution.stdout = stream.stdout.clone();
    execution.stderr = stream.stderr;

    if stream.timed_out {
        execution.mark_timed_out(format!(
            "no result within {}s",
            execution.timeout_seconds
        ));
        return;
    }

    if stream.exit_code != Some(0) {
        execution.mark_failed(
            FailureKind::Crashed,
            format!("exit code {:?} without a result", stream.exit_code),
        );
        return;
    }

    let Some(last_line) = stream.stdout.lines().rev().find(|l| !l.trim().is_empty()) else {
        execution.mark_failed(FailureKind::Crashed, "agent produced no output");
        return;
    };
    match serde_json::from_str::<AgentResult>(last_line.trim()) {
        Ok(result) => execution.mark_completed(result),
        Err(e) => execution.mark_failed(
            FailureKind::Malformed,
            format!("final line is not a result JSON: {e}"),
        ),
    }
}
