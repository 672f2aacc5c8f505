//! Copilot chat backend: a GitHub token is exchanged for a short-lived
//! session token, cached and refreshed lazily, then used against the
//! OpenAI-shaped Copilot completions endpoint.

use crate::error::{LlmError, Result};
use crate::llm::openai::wire;
use crate::llm::{ChatMessage, ChatModel, ChatResponse, ToolDefinition};

use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";
const CHAT_URL: &str = "https://api.githubcopilot.com/chat/completions";
const USER_AGENT: &str = concat!("message-agent/", env!("CARGO_PKG_VERSION"));
/// Refresh slightly early so an in-flight request never carries a token
/// that expires mid-call.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    token: String,
    expires_at: Instant,
}

pub struct CopilotModel {
    client: reqwest::Client,
    github_token: String,
    model: String,
    max_tokens: Option<u32>,
    session: RwLock<Option<CachedToken>>,
}

impl CopilotModel {
    pub fn new(
        client: reqwest::Client,
        github_token: String,
        model: String,
        max_tokens: Option<u32>,
    ) -> Self {
        Self {
            client,
            github_token,
            model,
            max_tokens,
            session: RwLock::new(None),
        }
    }

    async fn session_token(&self) -> Result<String> {
        {
            let session = self.session.read().await;
            if let Some(cached) = session.as_ref()
                && cached.expires_at > Instant::now() + EXPIRY_MARGIN
            {
                return Ok(cached.token.clone());
            }
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
            /// Epoch seconds.
            expires_at: i64,
        }

        let response = self
            .client
            .get(TOKEN_URL)
            .header("Authorization", format!("token {}", self.github_token))
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|error| LlmError::ProviderRequest(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::ProviderRequest(format!(
                "copilot token exchange failed: HTTP {status}"
            ))
            .into());
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|error| LlmError::MalformedResponse(error.to_string()))?;

        let now_epoch = chrono::Utc::now().timestamp();
        let ttl = Duration::from_secs(token.expires_at.saturating_sub(now_epoch).max(0) as u64);

        let mut session = self.session.write().await;
        *session = Some(CachedToken {
            token: token.token.clone(),
            expires_at: Instant::now() + ttl,
        });

        Ok(token.token)
    }
}

#[async_trait]
impl ChatModel for CopilotModel {
    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Result<ChatResponse> {
        let token = self.session_token().await?;
        let body = wire::request_body(&self.model, messages, tools, self.max_tokens);

        let response = self
            .client
            .post(CHAT_URL)
            .bearer_auth(token)
            .header("User-Agent", USER_AGENT)
            .header("Editor-Version", USER_AGENT)
            .json(&body)
            .send()
            .await
            .map_err(|error| LlmError::ProviderRequest(error.to_string()))?;

        wire::parse_response(response).await
    }
}
