//! Completion-adapter shim: flattens a chat transcript into one prompt,
//! teaches the backend a JSON tool-call convention, and scans the reply
//! for the first embedded tool call.
//!
//! This is a compatibility path for backends that cannot surface tool
//! calls natively; chat-style backends bypass it entirely.

use crate::error::Result;
use crate::llm::{ChatMessage, ChatResponse, ChatRole, CompletionModel, ToolCall, ToolDefinition};

use serde_json::Value;

/// Run a chat request against a completion-only backend.
pub async fn chat_via_completion(
    model: &dyn CompletionModel,
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
) -> Result<ChatResponse> {
    let (mut system, prompt) = flatten_messages(messages);
    if !tools.is_empty() {
        system.push_str(&tool_catalog_suffix(tools)?);
    }

    let text = model.complete(&system, &prompt).await?;
    let tool_calls = extract_tool_call(&text).into_iter().collect();

    Ok(ChatResponse {
        content: text,
        model: "completion".to_string(),
        usage: None,
        tool_calls,
    })
}

/// Split a transcript into (system prompt, flattened prompt). Non-system
/// turns become `[role]` sections; tool results are prefixed
/// `[Tool Result]`.
pub fn flatten_messages(messages: &[ChatMessage]) -> (String, String) {
    let mut system_parts = Vec::new();
    let mut sections = Vec::new();

    for message in messages {
        match message.role {
            ChatRole::System => system_parts.push(message.content.clone()),
            ChatRole::Tool => sections.push(format!("[Tool Result]\n{}", message.content)),
            role => sections.push(format!("[{role}]\n{}", message.content)),
        }
    }

    (system_parts.join("\n\n"), sections.join("\n\n"))
}

/// Serialise the tool catalogue with the response convention the shim
/// knows how to parse back out.
fn tool_catalog_suffix(tools: &[ToolDefinition]) -> Result<String> {
    let catalog = serde_json::to_string_pretty(tools)
        .map_err(|error| crate::error::LlmError::MalformedResponse(error.to_string()))?;
    Ok(format!(
        "\n\nYou have access to the following tools:\n{catalog}\n\n\
         To call a tool, respond with a single JSON object of the form \
         {{\"tool_call\": {{\"name\": \"<tool name>\", \"arguments\": {{...}}}}}} \
         and nothing else. Otherwise respond normally."
    ))
}

/// Find the first JSON object in `text` matching the tool-call shape
/// and synthesise a [`ToolCall`] with a locally-minted id.
pub fn extract_tool_call(text: &str) -> Option<ToolCall> {
    for (offset, _) in text.match_indices('{') {
        let Some(candidate) = balanced_object(&text[offset..]) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        let Some(call) = value.get("tool_call") else {
            continue;
        };
        let Some(name) = call.get("name").and_then(Value::as_str) else {
            continue;
        };
        let arguments = match call.get("arguments") {
            Some(Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        return Some(ToolCall {
            id: format!("call-{}", uuid::Uuid::new_v4()),
            name: name.to_string(),
            arguments,
        });
    }
    None
}

/// The balanced `{...}` slice starting at the front of `text`, honouring
/// string literals and escapes.
fn balanced_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (index, character) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match character {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[..=index]);
                }
            }
            _ => {}
        }
    }
    None
}
