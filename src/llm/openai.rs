//! OpenAI-compatible chat backend (the `direct-api` provider), plus the
//! wire types shared with the Copilot backend.

use crate::error::{LlmError, Result};
use crate::llm::{ChatMessage, ChatModel, ChatResponse, ChatRole, ToolCall, ToolDefinition, Usage};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatibleModel {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: Option<u32>,
}

impl OpenAiCompatibleModel {
    pub fn new(
        client: reqwest::Client,
        base_url: Option<String>,
        api_key: Option<String>,
        model: String,
        max_tokens: Option<u32>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            model,
            max_tokens,
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatibleModel {
    async fn chat(&self, messages: &[ChatMessage], tools: &[ToolDefinition]) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = wire::request_body(&self.model, messages, tools, self.max_tokens);

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|error| LlmError::ProviderRequest(error.to_string()))?;
        wire::parse_response(response).await
    }
}

/// OpenAI chat-completions wire format, shared by every backend that
/// speaks it.
pub(crate) mod wire {
    use super::*;

    #[derive(Serialize)]
    struct WireMessage<'a> {
        role: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<WireToolCall>>,
    }

    #[derive(Serialize)]
    struct WireToolCall {
        id: String,
        #[serde(rename = "type")]
        kind: &'static str,
        function: WireFunctionCall,
    }

    #[derive(Serialize)]
    struct WireFunctionCall {
        name: String,
        /// Arguments are a JSON-encoded string on the wire.
        arguments: String,
    }

    pub(crate) fn request_body(
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        max_tokens: Option<u32>,
    ) -> Value {
        let wire_messages: Vec<Value> = messages
            .iter()
            .map(|message| {
                let role = match message.role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                    ChatRole::Tool => "tool",
                };
                let tool_calls = if message.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        message
                            .tool_calls
                            .iter()
                            .map(|call| WireToolCall {
                                id: call.id.clone(),
                                kind: "function",
                                function: WireFunctionCall {
                                    name: call.name.clone(),
                                    arguments: Value::Object(call.arguments.clone()).to_string(),
                                },
                            })
                            .collect(),
                    )
                };
                serde_json::to_value(WireMessage {
                    role,
                    content: Some(message.content.as_str()),
                    tool_call_id: message.tool_call_id.as_deref(),
                    tool_calls,
                })
                .unwrap_or(Value::Null)
            })
            .collect();

        let mut body = serde_json::json!({
            "model": model,
            "messages": wire_messages,
        });
        if let Some(max_tokens) = max_tokens {
            body["max_tokens"] = max_tokens.into();
        }
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|tool| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.input_schema,
                        }
                    })
                })
                .collect();
        }
        body
    }

    #[derive(Deserialize)]
    struct Completion {
        #[serde(default)]
        model: Option<String>,
        choices: Vec<Choice>,
        #[serde(default)]
        usage: Option<WireUsage>,
    }

    #[derive(Deserialize)]
    struct Choice {
        message: ResponseMessage,
    }

    #[derive(Deserialize)]
    struct ResponseMessage {
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        tool_calls: Vec<ResponseToolCall>,
    }

    #[derive(Deserialize)]
    struct ResponseToolCall {
        id: String,
        function: ResponseFunctionCall,
    }

    #[derive(Deserialize)]
    struct ResponseFunctionCall {
        name: String,
        arguments: String,
    }

    #[derive(Deserialize)]
    struct WireUsage {
        #[serde(default)]
        prompt_tokens: u64,
        #[serde(default)]
        completion_tokens: u64,
    }

    pub(crate) async fn parse_response(response: reqwest::Response) -> Result<ChatResponse> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| LlmError::ProviderRequest(error.to_string()))?;

        if !status.is_success() {
            let snippet: String = text.chars().take(500).collect();
            return Err(LlmError::ProviderRequest(format!("HTTP {status}: {snippet}")).into());
        }

        let completion: Completion = serde_json::from_str(&text)
            .map_err(|error| LlmError::MalformedResponse(error.to_string()))?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::MalformedResponse("no choices in response".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|call| {
                let arguments = match serde_json::from_str::<Value>(&call.function.arguments) {
                    Ok(Value::Object(map)) => map,
                    _ => {
                        let mut map = serde_json::Map::new();
                        map.insert("_raw".into(), Value::String(call.function.arguments));
                        map
                    }
                };
                ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments,
                }
            })
            .collect();

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            model: completion.model.unwrap_or_default(),
            usage: completion.usage.map(|usage| Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            }),
            tool_calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_carries_messages_and_tools() {
        let messages = [
            ChatMessage::system("persona"),
            ChatMessage::user("add 2 and 3"),
        ];
        let tools = [ToolDefinition {
            name: "calc__add".into(),
            description: "add two numbers".into(),
            input_schema: serde_json::json!({"type": "object"}),
        }];

        let body = wire::request_body("gpt-4o-mini", &messages, &tools, Some(256));

        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "add 2 and 3");
        assert_eq!(body["tools"][0]["function"]["name"], "calc__add");
    }

    #[test]
    fn tool_role_carries_call_binding() {
        let mut assistant = ChatMessage::assistant("");
        assistant.tool_calls.push(ToolCall {
            id: "t1".into(),
            name: "calc__add".into(),
            arguments: serde_json::Map::new(),
        });
        let messages = [assistant, ChatMessage::tool("5", "t1")];

        let body = wire::request_body("m", &messages, &[], None);

        assert_eq!(body["messages"][0]["tool_calls"][0]["id"], "t1");
        assert_eq!(
            body["messages"][0]["tool_calls"][0]["function"]["name"],
            "calc__add"
        );
        assert_eq!(body["messages"][1]["role"], "tool");
        assert_eq!(body["messages"][1]["tool_call_id"], "t1");
        assert!(body.get("tools").is_none());
    }
}
