//! Chat routes: message injection, the SSE stream, history, and the
//! conversation listing.

use super::server::ApiState;
use crate::channel::traits::Channel as _;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Sse;
use axum::response::sse::Event;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;

#[derive(Deserialize)]
pub(super) struct ChatRequest {
    text: Option<String>,
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ChatAccepted {
    conversation_id: String,
    message_id: String,
}

fn bad_request(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({"error": message})),
    )
}

/// `POST /api/chat`: inject a browser message, fire-and-forget, and
/// return the ids the client needs to open its stream.
pub(super) async fn post_chat(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatAccepted>, (StatusCode, Json<serde_json::Value>)> {
    let text = request
        .text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| bad_request("text is required"))?;

    let (conversation_id, message_id) = state
        .web_channel
        .inject_message(text, request.conversation_id.clone());

    Ok(Json(ChatAccepted {
        conversation_id,
        message_id,
    }))
}

#[derive(Deserialize)]
pub(super) struct StreamQuery {
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
}

/// `GET /api/chat/stream?conversationId=…`: subscribe to a
/// conversation's `message` and `typing` events.
pub(super) async fn chat_stream(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<StreamQuery>,
) -> Result<
    Sse<impl Stream<Item = Result<Event, Infallible>>>,
    (StatusCode, Json<serde_json::Value>),
> {
    let conversation_id = query
        .conversation_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| bad_request("conversationId is required"))?;

    let mut events = state.sse.register(&conversation_id);

    let stream = async_stream::stream! {
        // Initial keepalive comment confirms the subscription.
        yield Ok(Event::default().comment("ok"));

        while let Some(payload) = events.recv().await {
            match serde_json::to_string(&payload.data) {
                Ok(json) => yield Ok(Event::default().event(payload.event).data(json)),
                Err(error) => tracing::warn!(%error, "failed to serialise sse payload"),
            }
        }
    };

    Ok(Sse::new(stream))
}

#[derive(Deserialize)]
pub(super) struct HistoryQuery {
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
}

#[derive(Serialize)]
pub(super) struct HistoryMessage {
    role: String,
    content: String,
    #[serde(rename = "toolCallId", skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

/// `GET /api/history?conversationId=…`
pub(super) async fn history(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let conversation_id = query
        .conversation_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| bad_request("conversationId is required"))?;

    let messages = state
        .history
        .get_messages(state.web_channel.id(), &conversation_id, 1000)
        .map_err(|error| {
            tracing::warn!(%error, "failed to read history");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "failed to read history"})),
            )
        })?;

    let messages: Vec<HistoryMessage> = messages
        .into_iter()
        .map(|entry| HistoryMessage {
            role: entry.role.to_string(),
            content: entry.content,
            tool_call_id: entry.tool_call_id,
        })
        .collect();

    Ok(Json(serde_json::json!({
        "conversationId": conversation_id,
        "messages": messages,
    })))
}

/// `GET /api/conversations`
pub(super) async fn conversations(
    State(state): State<Arc<ApiState>>,
) -> Json<serde_json::Value> {
    let conversations = state
        .history
        .list_conversations(state.web_channel.id())
        .unwrap_or_else(|error| {
            tracing::warn!(%error, "failed to list conversations");
            Vec::new()
        });
    Json(serde_json::json!({"conversations": conversations}))
}
