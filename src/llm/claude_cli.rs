//! CLI subprocess backend (the `claude-code` provider). Completion-only:
//! the chat surface is adapted through the flattening shim.

use crate::error::{LlmError, Result};
use crate::llm::CompletionModel;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt as _;

const DEFAULT_COMMAND: &str = "claude";

pub struct ClaudeCliModel {
    command: String,
    model: String,
}

impl ClaudeCliModel {
    pub fn new(model: String) -> Self {
        Self {
            command: std::env::var("MESSAGE_AGENT_CLAUDE_COMMAND")
                .unwrap_or_else(|_| DEFAULT_COMMAND.to_string()),
            model,
        }
    }
}

#[async_trait]
impl CompletionModel for ClaudeCliModel {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let mut command = tokio::process::Command::new(&self.command);
        command
            .arg("-p")
            .arg("--system-prompt")
            .arg(system)
            .arg("--model")
            .arg(&self.model)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|error| LlmError::CompletionFailed(format!("failed to spawn {}: {error}", self.command)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(user.as_bytes())
                .await
                .map_err(|error| LlmError::CompletionFailed(error.to_string()))?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|error| LlmError::CompletionFailed(error.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let snippet: String = stderr.chars().take(500).collect();
            return Err(LlmError::CompletionFailed(format!(
                "{} exited with {}: {snippet}",
                self.command, output.status
            ))
            .into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
