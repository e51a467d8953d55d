//! AI agent collaborator interface.
//!
//! Stages hand the agent a prompt and get back a structured outcome.
//! `CommandAgent` shells out to the configured agent CLI; tests substitute
//! a scripted double through the `AgentRunner` trait.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// A single prompt execution request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, timeout: Duration) -> Self {
        Self {
            prompt: prompt.into(),
            working_dir: None,
            timeout,
        }
    }
}

/// Structured result of one agent run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl AgentOutcome {
    /// Fail with context if the agent did not succeed; otherwise return the
    /// captured output.
    pub fn into_output(self) -> Result<String> {
        if self.success {
            Ok(self.output)
        } else {
            anyhow::bail!(
                "Agent run failed: {}",
                self.error.as_deref().unwrap_or("no error output")
            )
        }
    }
}

/// Narrow interface over the AI agent provider.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, request: AgentRequest) -> Result<AgentOutcome>;
}

/// Runs the agent as a subprocess: prompt on stdin, output from stdout.
pub struct CommandAgent {
    command: String,
    args: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: &str, args: &[String]) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
        }
    }
}

#[async_trait]
impl AgentRunner for CommandAgent {
    async fn run(&self, request: AgentRequest) -> Result<AgentOutcome> {
        debug!(command = %self.command, prompt_len = request.prompt.len(), "Spawning agent");

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = request.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn agent command '{}'", self.command))?;

        let mut stdin = child.stdin.take().context("Agent stdin unavailable")?;
        stdin
            .write_all(request.prompt.as_bytes())
            .await
            .context("Failed to write prompt to agent stdin")?;
        drop(stdin);

        let output = match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(result) => result.context("Failed to collect agent output")?,
            Err(_) => {
                // kill_on_drop reaps the child when the future is dropped.
                return Ok(AgentOutcome {
                    success: false,
                    output: String::new(),
                    error: Some(format!("agent timed out after {:?}", request.timeout)),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            Ok(AgentOutcome {
                success: true,
                output: stdout,
                error: None,
            })
        } else {
            Ok(AgentOutcome {
                success: false,
                output: stdout,
                error: Some(if stderr.is_empty() {
                    format!("agent exited with status {}", output.status)
                } else {
                    stderr
                }),
            })
        }
    }
}

/// Extract the first JSON object or array embedded in agent output.
///
/// Agents wrap structured answers in prose or code fences; this scans for
/// the first balanced `{...}` or `[...]` block that parses.
pub fn extract_json(output: &str) -> Option<serde_json::Value> {
    for (start, open) in output.char_indices().filter(|(_, c)| *c == '{' || *c == '[') {
        let close = if open == '{' { '}' } else { ']' };
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, c) in output[start..].char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                c if c == open && !in_string => depth += 1,
                c if c == close && !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &output[start..start + offset + c.len_utf8()];
                        if let Ok(value) = serde_json::from_str(candidate) {
                            return Some(value);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }
    None
}
