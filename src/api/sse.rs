//! SSE subscriber registry for the browser chat surface.
//!
//! Maps conversation ids to live connections. Senders that fail are
//! pruned silently; a browser that disconnects mid-pipeline just stops
//! receiving events.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// One event destined for a browser stream.
#[derive(Debug, Clone)]
pub struct SsePayload {
    pub event: String,
    pub data: Value,
}

#[derive(Default)]
pub struct SseManager {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<SsePayload>>>>,
}

impl SseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a new connection to a conversation's event stream.
    pub fn register(&self, conversation_id: &str) -> mpsc::UnboundedReceiver<SsePayload> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .entry(conversation_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Fan an event out to every subscriber of the conversation,
    /// dropping broken connections.
    pub fn send(&self, conversation_id: &str, event: &str, data: Value) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock");
        let Some(senders) = subscribers.get_mut(conversation_id) else {
            return;
        };

        senders.retain(|sender| {
            sender
                .send(SsePayload {
                    event: event.to_string(),
                    data: data.clone(),
                })
                .is_ok()
        });

        if senders.is_empty() {
            subscribers.remove(conversation_id);
        }
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .get(conversation_id)
            .map(|senders| senders.len())
            .unwrap_or(0)
    }
}
