//! Configuration loading and validation.
//!
//! The host reads a single YAML file. `${NAME}` placeholders anywhere in
//! the raw text are substituted from the environment before parsing, so
//! tokens never need to live in the file itself.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Host configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    pub persona: PersonaConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub task_persistence: TaskPersistenceConfig,
    #[serde(default)]
    pub web: WebConfig,
}

/// The persona this host speaks as.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaConfig {
    pub name: String,
    pub system_prompt: String,
}

/// LLM backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LlmProvider {
    /// OpenAI-compatible HTTP endpoint.
    DirectApi,
    /// GitHub-token-mediated Copilot endpoint.
    Copilot,
    /// CLI subprocess, completion-only.
    ClaudeCode,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub github_token: Option<String>,
}

/// One configured channel. `type` selects the adapter.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    #[serde(rename = "type")]
    pub channel_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub session_data_path: Option<PathBuf>,
    #[serde(default)]
    pub puppet_provider: Option<String>,
    #[serde(default)]
    pub enabled_skills: Option<Vec<String>>,
    /// Per-channel override; replaces the global block entirely when set.
    #[serde(default)]
    pub verification: Option<VerificationConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConfig {
    #[serde(default)]
    pub servers: HashMap<String, McpServerConfig>,
}

/// Child-process MCP server launch description.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_true")]
    pub skip_for_short_responses: bool,
    #[serde(default = "default_short_response_threshold")]
    pub short_response_threshold: usize,
    #[serde(default)]
    pub llm_review: LlmReviewConfig,
    #[serde(default)]
    pub rules: RulesConfig,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: default_max_retries(),
            confidence_threshold: default_confidence_threshold(),
            skip_for_short_responses: true,
            short_response_threshold: default_short_response_threshold(),
            llm_review: LlmReviewConfig::default(),
            rules: RulesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmReviewConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub provider: Option<LlmProvider>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillsConfig {
    #[serde(default)]
    pub directories: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_history_segment_bytes")]
    pub max_segment_size_bytes: u64,
    #[serde(default = "default_history_segments")]
    pub max_segments: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_messages: default_max_messages(),
            max_segment_size_bytes: default_history_segment_bytes(),
            max_segments: default_history_segments(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_health_port")]
    pub port: u16,
    #[serde(default = "default_monitor_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// `channelId:conversationId` targets for restart notices.
    #[serde(default)]
    pub recovery_targets: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            port: default_health_port(),
            check_interval_secs: default_monitor_interval_secs(),
            reconnect_base_delay_ms: default_reconnect_base_ms(),
            reconnect_max_delay_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            recovery_targets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_journal_segment_bytes")]
    pub max_segment_size_bytes: u64,
    #[serde(default = "default_journal_segments")]
    pub max_segments: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_segment_size_bytes: default_journal_segment_bytes(),
            max_segments: default_journal_segments(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPersistenceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub recover_on_startup: bool,
}

impl Default for TaskPersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recover_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_web_port(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_retries() -> usize {
    3
}
fn default_confidence_threshold() -> f64 {
    0.7
}
fn default_short_response_threshold() -> usize {
    50
}
fn default_max_messages() -> usize {
    100
}
fn default_history_segment_bytes() -> u64 {
    524_288
}
fn default_history_segments() -> usize {
    20
}
fn default_heartbeat_interval_secs() -> u64 {
    10
}
fn default_health_port() -> u16 {
    3001
}
fn default_monitor_interval_secs() -> u64 {
    30
}
fn default_reconnect_base_ms() -> u64 {
    2_000
}
fn default_reconnect_max_ms() -> u64 {
    120_000
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_journal_segment_bytes() -> u64 {
    1_048_576
}
fn default_journal_segments() -> usize {
    10
}
fn default_web_port() -> u16 {
    3000
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
            path: path.display().to_string(),
            source,
        })?;

        let substituted = interpolate_env_placeholders(&raw);
        let config: Config = serde_yaml::from_str(&substituted)
            .map_err(|error| ConfigError::Parse(error.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.persona.system_prompt.trim().is_empty() {
            return Err(ConfigError::Invalid("persona.systemPrompt is empty".into()).into());
        }

        for (id, channel) in &self.channels {
            match channel.channel_type.as_str() {
                "telegram" | "whatsapp" | "wechat" | "imessage" | "web" => {}
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "channel '{id}' has unknown type '{other}'"
                    ))
                    .into());
                }
            }
            if channel.channel_type == "telegram"
                && channel.enabled
                && channel.token.as_deref().unwrap_or("").is_empty()
            {
                return Err(
                    ConfigError::Invalid(format!("channel '{id}' requires a token")).into(),
                );
            }
        }

        Ok(())
    }

    /// Resolve the data root: config override, then
    /// `$MESSAGE_AGENT_DATA_DIR`, then `<home>/.message-agent-host`.
    pub fn data_root(&self) -> PathBuf {
        if let Some(dir) = &self.history.data_dir {
            return dir.clone();
        }
        if let Ok(dir) = std::env::var("MESSAGE_AGENT_DATA_DIR") {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .map(|home| home.join(".message-agent-host"))
            .unwrap_or_else(|| PathBuf::from(".message-agent-host"))
    }

    /// Effective verification config for a channel: the channel override
    /// replaces the global block entirely when present.
    pub fn verification_for(&self, channel_id: &str) -> &VerificationConfig {
        self.channels
            .get(channel_id)
            .and_then(|channel| channel.verification.as_ref())
            .unwrap_or(&self.verification)
    }
}

/// Replace `${NAME}` placeholders with environment values. Unset
/// variables substitute to the empty string; an unterminated `${` is
/// left verbatim.
pub fn interpolate_env_placeholders(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut cursor = 0;

    while let Some(start_offset) = value[cursor..].find("${") {
        let start = cursor + start_offset;
        output.push_str(&value[cursor..start]);

        let placeholder_start = start + 2;
        let Some(end_offset) = value[placeholder_start..].find('}') else {
            output.push_str(&value[start..]);
            return output;
        };

        let end = placeholder_start + end_offset;
        let var_name = &value[placeholder_start..end];
        if var_name.is_empty() {
            output.push_str("${}");
        } else {
            let resolved = std::env::var(var_name).unwrap_or_default();
            output.push_str(&resolved);
        }

        cursor = end + 1;
    }

    output.push_str(&value[cursor..]);
    output
}
