//! Message-agent: a multi-channel conversational agent host.
//!
//! A single long-running process that ingests messages from pluggable
//! channels, routes each through an LLM pipeline with tool use and
//! response verification, and persists history and task state so an
//! abrupt death is recoverable on the next start.

pub mod agent;
pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod health;
pub mod llm;
pub mod mcp;
pub mod skills;
pub mod storage;
pub mod tasks;
pub mod watchdog;

pub use error::{Error, Result};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The single process-wide inbound handler every channel delivers into.
pub type MessageHandler = Arc<dyn Fn(NormalizedMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Canonical inbound message, normalised from platform events.
/// Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    /// Globally unique message id minted by the channel.
    pub id: String,
    pub channel_id: String,
    /// Platform-scoped conversation identifier.
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub text: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Opaque platform message id, echoed back for reply-to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl NormalizedMessage {
    /// The serialisation unit for history: `<channelId>:<conversationId>`.
    pub fn conversation_key(&self) -> String {
        conversation_key(&self.channel_id, &self.conversation_id)
    }
}

/// Build the `(channelId, conversationId)` serialisation key.
pub fn conversation_key(channel_id: &str, conversation_id: &str) -> String {
    format!("{channel_id}:{conversation_id}")
}

/// Outbound message handed to a channel for platform delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// A reply to a specific inbound message, when the platform gave us
    /// a message id to anchor on.
    pub fn reply_to(text: impl Into<String>, platform_message_id: Option<String>) -> Self {
        Self {
            text: text.into(),
            reply_to_message_id: platform_message_id,
            attachments: Vec::new(),
        }
    }
}

/// File attachment metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// Channel connection state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelStatus::Disconnected => write!(f, "disconnected"),
            ChannelStatus::Connecting => write!(f, "connecting"),
            ChannelStatus::Connected => write!(f, "connected"),
            ChannelStatus::Error => write!(f, "error"),
        }
    }
}

/// Point-in-time channel status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub channel_type: String,
    pub status: ChannelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
