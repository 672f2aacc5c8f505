//! Telegram channel over the Bot HTTP API.
//!
//! A deliberately narrow adapter: `getUpdates` long polling inbound,
//! `sendMessage` / `sendChatAction` outbound. The poll loop marks the
//! channel `error` and exits on transport failure; the channel monitor
//! owns reconnection.

use crate::channel::traits::Channel;
use crate::error::{ChannelError, Result};
use crate::{ChannelInfo, ChannelStatus, MessageHandler, NormalizedMessage, OutgoingMessage};

use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

const API_BASE: &str = "https://api.telegram.org";
const POLL_TIMEOUT_SECS: u32 = 50;

struct Inner {
    id: String,
    token: String,
    client: reqwest::Client,
    handler: Mutex<Option<MessageHandler>>,
    status: Mutex<(ChannelStatus, Option<String>)>,
}

pub struct TelegramChannel {
    inner: Arc<Inner>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: serde::de::Deserialize<'de>"))]
struct ApiEnvelope<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Deserialize)]
struct TelegramMessage {
    message_id: i64,
    #[serde(default)]
    from: Option<TelegramUser>,
    chat: TelegramChat,
    date: i64,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Deserialize)]
struct TelegramChat {
    id: i64,
}

impl Inner {
    fn method_url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.token)
    }

    fn set_status(&self, status: ChannelStatus, error: Option<String>) {
        *self.status.lock().expect("status lock") = (status, error);
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: Value,
    ) -> anyhow::Result<T> {
        let response = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await?;
        let envelope: ApiEnvelope<T> = response.json().await?;
        if !envelope.ok {
            anyhow::bail!(
                "telegram {method} failed: {}",
                envelope.description.unwrap_or_else(|| "unknown error".into())
            );
        }
        envelope
            .result
            .ok_or_else(|| anyhow::anyhow!("telegram {method} returned no result"))
    }

    fn normalize(&self, message: TelegramMessage) -> Option<NormalizedMessage> {
        let text = message.text?;
        let (sender_id, sender_name) = match message.from {
            Some(user) => (
                user.id.to_string(),
                user.username.or(user.first_name),
            ),
            None => ("unknown".to_string(), None),
        };
        Some(NormalizedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: self.id.clone(),
            conversation_id: message.chat.id.to_string(),
            sender_id,
            sender_name,
            text,
            timestamp: message.date * 1000,
            platform_message_id: Some(message.message_id.to_string()),
            attachments: Vec::new(),
        })
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut offset: i64 = 0;
        loop {
            let body = serde_json::json!({
                "timeout": POLL_TIMEOUT_SECS,
                "offset": offset,
                "allowed_updates": ["message"],
            });
            match self.call::<Vec<Update>>("getUpdates", body).await {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        let Some(message) = update.message else {
                            continue;
                        };
                        let Some(normalized) = self.normalize(message) else {
                            continue;
                        };
                        let handler = self.handler.lock().expect("handler lock").clone();
                        match handler {
                            Some(handler) => handler(normalized).await,
                            None => {
                                tracing::warn!(channel = %self.id, "telegram message dropped: no handler installed");
                            }
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(channel = %self.id, %error, "telegram poll failed");
                    self.set_status(ChannelStatus::Error, Some(error.to_string()));
                    return;
                }
            }
        }
    }
}

impl TelegramChannel {
    pub fn new(id: impl Into<String>, token: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                token: token.into(),
                client,
                handler: Mutex::new(None),
                status: Mutex::new((ChannelStatus::Disconnected, None)),
            }),
            poll_task: Mutex::new(None),
        }
    }

    fn stop_polling(&self) {
        if let Some(handle) = self.poll_task.lock().expect("poll lock").take() {
            handle.abort();
        }
    }
}

impl Channel for TelegramChannel {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn channel_type(&self) -> &str {
        "telegram"
    }

    fn set_handler(&self, handler: MessageHandler) {
        *self.inner.handler.lock().expect("handler lock") = Some(handler);
    }

    async fn connect(&self) {
        self.inner.set_status(ChannelStatus::Connecting, None);

        // Validate the token before declaring the channel healthy.
        match self.inner.call::<Value>("getMe", Value::Null).await {
            Ok(_) => {
                self.stop_polling();
                let inner = self.inner.clone();
                let handle = tokio::spawn(inner.poll_loop());
                *self.poll_task.lock().expect("poll lock") = Some(handle);
                self.inner.set_status(ChannelStatus::Connected, None);
            }
            Err(error) => {
                tracing::warn!(channel = %self.inner.id, %error, "telegram connect failed");
                self.inner
                    .set_status(ChannelStatus::Error, Some(error.to_string()));
            }
        }
    }

    async fn disconnect(&self) {
        self.stop_polling();
        self.inner.set_status(ChannelStatus::Disconnected, None);
    }

    async fn send_message(&self, conversation_id: &str, message: OutgoingMessage) -> Result<()> {
        let mut body = serde_json::json!({
            "chat_id": conversation_id,
            "text": message.text,
        });
        if let Some(reply_to) = &message.reply_to_message_id
            && let Ok(message_id) = reply_to.parse::<i64>()
        {
            body["reply_to_message_id"] = message_id.into();
        }

        self.inner
            .call::<Value>("sendMessage", body)
            .await
            .map(|_| ())
            .map_err(|error| ChannelError::SendFailed(error.to_string()).into())
    }

    async fn send_typing_indicator(&self, conversation_id: &str) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": conversation_id,
            "action": "typing",
        });
        self.inner
            .call::<Value>("sendChatAction", body)
            .await
            .map(|_| ())
            .map_err(|error| ChannelError::SendFailed(error.to_string()).into())
    }

    fn info(&self) -> ChannelInfo {
        let (status, error) = self.inner.status.lock().expect("status lock").clone();
        ChannelInfo {
            id: self.inner.id.clone(),
            channel_type: "telegram".into(),
            status,
            error,
        }
    }
}
