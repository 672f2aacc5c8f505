//! In-process web channel: bridges the HTTP/SSE surface onto the same
//! pipeline every other channel feeds.
//!
//! Inbound messages are injected by the chat API rather than pulled
//! from a platform; outbound messages and typing indicators fan out as
//! SSE events to all subscribers of the conversation.

use crate::api::sse::SseManager;
use crate::channel::traits::Channel;
use crate::error::Result;
use crate::{ChannelInfo, ChannelStatus, MessageHandler, NormalizedMessage, OutgoingMessage};

use std::sync::{Arc, Mutex};

pub const WEB_SENDER_ID: &str = "web-user";

pub struct WebChannel {
    id: String,
    sse: Arc<SseManager>,
    handler: Mutex<Option<MessageHandler>>,
    status: Mutex<ChannelStatus>,
}

impl WebChannel {
    pub fn new(id: impl Into<String>, sse: Arc<SseManager>) -> Self {
        Self {
            id: id.into(),
            sse,
            handler: Mutex::new(None),
            status: Mutex::new(ChannelStatus::Disconnected),
        }
    }

    pub fn sse(&self) -> &Arc<SseManager> {
        &self.sse
    }

    /// Inject a browser message into the pipeline. Mints a fresh
    /// conversation id when none is supplied, fires the shared handler
    /// without awaiting it, and returns `(conversationId, messageId)`
    /// immediately so the caller can open its SSE stream.
    pub fn inject_message(
        &self,
        text: impl Into<String>,
        conversation_id: Option<String>,
    ) -> (String, String) {
        let conversation_id = conversation_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let message_id = uuid::Uuid::new_v4().to_string();

        let message = NormalizedMessage {
            id: message_id.clone(),
            channel_id: self.id.clone(),
            conversation_id: conversation_id.clone(),
            sender_id: WEB_SENDER_ID.to_string(),
            sender_name: None,
            text: text.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            platform_message_id: None,
            attachments: Vec::new(),
        };

        let handler = self.handler.lock().expect("handler lock").clone();
        match handler {
            Some(handler) => {
                // Fire-and-forget: a handler crash is logged here and
                // never reaches the HTTP caller.
                let work = tokio::spawn(handler(message));
                tokio::spawn(async move {
                    if let Err(error) = work.await {
                        tracing::error!(%error, "web message handler crashed");
                    }
                });
            }
            None => {
                tracing::warn!(channel = %self.id, "web message dropped: no handler installed");
            }
        }

        (conversation_id, message_id)
    }
}

impl Channel for WebChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn channel_type(&self) -> &str {
        "web"
    }

    fn set_handler(&self, handler: MessageHandler) {
        *self.handler.lock().expect("handler lock") = Some(handler);
    }

    async fn connect(&self) {
        *self.status.lock().expect("status lock") = ChannelStatus::Connected;
    }

    async fn disconnect(&self) {
        *self.status.lock().expect("status lock") = ChannelStatus::Disconnected;
    }

    async fn send_message(&self, conversation_id: &str, message: OutgoingMessage) -> Result<()> {
        self.sse.send(
            conversation_id,
            "message",
            serde_json::json!({
                "text": message.text,
                "conversationId": conversation_id,
                "timestamp": chrono::Utc::now().timestamp_millis(),
            }),
        );
        Ok(())
    }

    async fn send_typing_indicator(&self, conversation_id: &str) -> Result<()> {
        self.sse.send(
            conversation_id,
            "typing",
            serde_json::json!({"conversationId": conversation_id}),
        );
        Ok(())
    }

    fn info(&self) -> ChannelInfo {
        ChannelInfo {
            id: self.id.clone(),
            channel_type: "web".into(),
            status: *self.status.lock().expect("status lock"),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn inject_mints_conversation_and_message_ids() {
        let channel = WebChannel::new("web", Arc::new(SseManager::new()));
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let delivered_for_handler = delivered.clone();
        channel.set_handler(Arc::new(move |message| {
            let delivered = delivered_for_handler.clone();
            Box::pin(async move {
                delivered.lock().expect("lock").push(message);
            })
        }));

        let (conversation_id, message_id) = channel.inject_message("hello", None);
        assert!(!conversation_id.is_empty());
        assert!(!message_id.is_empty());

        // The handler runs detached; wait for it.
        for _ in 0..50 {
            if !delivered.lock().expect("lock").is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let messages = delivered.lock().expect("lock");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender_id, WEB_SENDER_ID);
        assert_eq!(messages[0].conversation_id, conversation_id);
        assert_eq!(messages[0].id, message_id);
    }

    #[tokio::test]
    async fn inject_reuses_supplied_conversation_id() {
        let channel = WebChannel::new("web", Arc::new(SseManager::new()));
        channel.set_handler(Arc::new(|_message| Box::pin(async {})));

        let (conversation_id, _) = channel.inject_message("hi", Some("c42".into()));
        assert_eq!(conversation_id, "c42");
    }

    #[tokio::test]
    async fn outbound_messages_become_sse_events() {
        let sse = Arc::new(SseManager::new());
        let channel = WebChannel::new("web", sse.clone());
        let mut rx = sse.register("c1");

        channel
            .send_message("c1", OutgoingMessage::text("reply"))
            .await
            .expect("send");
        channel.send_typing_indicator("c1").await.expect("typing");

        let first = rx.recv().await.expect("message event");
        assert_eq!(first.event, "message");
        assert_eq!(first.data["text"], "reply");
        assert_eq!(first.data["conversationId"], "c1");

        let second = rx.recv().await.expect("typing event");
        assert_eq!(second.event, "typing");
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let channel = WebChannel::new("web", Arc::new(SseManager::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_for_handler = calls.clone();
        channel.set_handler(Arc::new(move |_message| {
            calls_for_handler.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                panic!("handler blew up");
            })
        }));

        let (_, _) = channel.inject_message("boom", None);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // A second injection still works; the process survived.
        let (_, _) = channel.inject_message("again", None);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
