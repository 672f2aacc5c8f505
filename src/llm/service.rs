//! Chat types and the backend-agnostic LLM service.

use crate::config::{LlmConfig, LlmProvider, LlmReviewConfig};
use crate::error::Result;
use crate::llm::{claude_cli::ClaudeCliModel, copilot::CopilotModel, extract, openai::OpenAiCompatibleModel};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Participant role in an LLM transcript.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    #[default]
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatRole::System => write!(f, "system"),
            ChatRole::User => write!(f, "user"),
            ChatRole::Assistant => write!(f, "assistant"),
            ChatRole::Tool => write!(f, "tool"),
        }
    }
}

/// One turn of an LLM transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Tool role only: binds the result to a prior tool call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Assistant role only: the calls this turn emitted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// A tool the model may call. `input_schema` is JSON-schema shaped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique per invocation.
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Map<String, Value>,
}

impl ToolCall {
    /// The `arguments` string input of skill tools.
    pub fn arguments_text(&self) -> String {
        match self.arguments.get("arguments") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Tagged-variant result every backend normalises into.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub usage: Option<Usage>,
    pub tool_calls: Vec<ToolCall>,
}

/// Backend with a native messages+tools interface.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Result<ChatResponse>;
}

/// Backend that only supports a single-string completion.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

enum Backend {
    Chat(Arc<dyn ChatModel>),
    Completion(Arc<dyn CompletionModel>),
}

/// Uniform front over chat-style and completion-only backends. A
/// chat-only consumer may call [`LlmService::complete`]; a
/// completion-only backend is adapted to [`LlmService::chat`] through
/// prompt flattening and embedded tool-call extraction.
pub struct LlmService {
    backend: Backend,
}

impl LlmService {
    pub fn with_chat_model(model: Arc<dyn ChatModel>) -> Self {
        Self {
            backend: Backend::Chat(model),
        }
    }

    pub fn with_completion_model(model: Arc<dyn CompletionModel>) -> Self {
        Self {
            backend: Backend::Completion(model),
        }
    }

    /// Build the configured backend.
    pub fn from_config(config: &LlmConfig, client: &reqwest::Client) -> Result<Self> {
        Self::build(config.provider, &config.model, config, client)
    }

    /// Build the verifier backend, falling back to the primary provider
    /// and model where the review block is silent.
    pub fn from_review_config(
        review: &LlmReviewConfig,
        base: &LlmConfig,
        client: &reqwest::Client,
    ) -> Result<Self> {
        let provider = review.provider.unwrap_or(base.provider);
        let model = review.model.as_deref().unwrap_or(&base.model);
        Self::build(provider, model, base, client)
    }

    fn build(
        provider: LlmProvider,
        model: &str,
        config: &LlmConfig,
        client: &reqwest::Client,
    ) -> Result<Self> {
        Ok(match provider {
            LlmProvider::DirectApi => Self::with_chat_model(Arc::new(OpenAiCompatibleModel::new(
                client.clone(),
                config.base_url.clone(),
                config.api_key.clone(),
                model.to_string(),
                config.max_tokens,
            ))),
            LlmProvider::Copilot => Self::with_chat_model(Arc::new(CopilotModel::new(
                client.clone(),
                config.github_token.clone().unwrap_or_default(),
                model.to_string(),
                config.max_tokens,
            ))),
            LlmProvider::ClaudeCode => {
                Self::with_completion_model(Arc::new(ClaudeCliModel::new(model.to_string())))
            }
        })
    }

    /// Messages + tools in, text + optional tool calls out.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse> {
        match &self.backend {
            Backend::Chat(model) => model.chat(messages, tools).await,
            Backend::Completion(model) => {
                extract::chat_via_completion(model.as_ref(), messages, tools).await
            }
        }
    }

    /// Single system+user completion.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String> {
        match &self.backend {
            Backend::Completion(model) => model.complete(system, user).await,
            Backend::Chat(model) => {
                let messages = [ChatMessage::system(system), ChatMessage::user(user)];
                let response = model.chat(&messages, &[]).await?;
                Ok(response.content)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoChat;

    #[async_trait]
    impl ChatModel for EchoChat {
        async fn chat(
            &self,
            messages: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<ChatResponse> {
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(ChatResponse {
                content: format!("echo: {last}"),
                model: "echo".into(),
                usage: None,
                tool_calls: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn complete_adapts_onto_chat_backend() {
        let service = LlmService::with_chat_model(Arc::new(EchoChat));
        let text = service.complete("be brief", "ping").await.expect("complete");
        assert_eq!(text, "echo: ping");
    }

    #[test]
    fn arguments_text_prefers_the_arguments_string() {
        let mut arguments = serde_json::Map::new();
        arguments.insert("arguments".into(), Value::String("2 + 3".into()));
        let call = ToolCall {
            id: "t1".into(),
            name: "skill__calc".into(),
            arguments,
        };
        assert_eq!(call.arguments_text(), "2 + 3");

        let empty = ToolCall {
            id: "t2".into(),
            name: "skill__calc".into(),
            arguments: serde_json::Map::new(),
        };
        assert_eq!(empty.arguments_text(), "");
    }
}
