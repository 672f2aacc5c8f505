//! Channel registry: fan-out connect/disconnect and aggregated status.

use crate::channel::traits::ChannelDyn;
use crate::{ChannelInfo, MessageHandler};

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Owns every channel keyed by id and the single shared inbound
/// handler.
#[derive(Default)]
pub struct ChannelManager {
    channels: RwLock<HashMap<String, Arc<dyn ChannelDyn>>>,
    handler: RwLock<Option<MessageHandler>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. If the shared handler is already installed
    /// it is applied immediately.
    pub async fn register(&self, channel: Arc<dyn ChannelDyn>) {
        if let Some(handler) = self.handler.read().await.clone() {
            channel.set_handler(handler);
        }
        let mut channels = self.channels.write().await;
        channels.insert(channel.id().to_string(), channel);
    }

    /// Install the process-wide inbound handler on every channel,
    /// current and future.
    pub async fn set_handler(&self, handler: MessageHandler) {
        {
            let mut slot = self.handler.write().await;
            *slot = Some(handler.clone());
        }
        for channel in self.channels.read().await.values() {
            channel.set_handler(handler.clone());
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn ChannelDyn>> {
        self.channels.read().await.get(id).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<dyn ChannelDyn>> {
        let mut channels: Vec<_> = self.channels.read().await.values().cloned().collect();
        channels.sort_by(|a, b| a.id().cmp(b.id()));
        channels
    }

    /// Connect every channel. A failure on one is reflected in its
    /// status and never short-circuits the rest.
    pub async fn connect_all(&self) {
        for channel in self.all().await {
            channel.connect().await;
            let info = channel.info();
            if info.status == crate::ChannelStatus::Connected {
                tracing::info!(channel = %info.id, "channel connected");
            } else {
                tracing::warn!(
                    channel = %info.id,
                    status = %info.status,
                    error = info.error.as_deref().unwrap_or(""),
                    "channel failed to connect"
                );
            }
        }
    }

    pub async fn disconnect_all(&self) {
        for channel in self.all().await {
            channel.disconnect().await;
        }
    }

    /// Aggregated status reports, ordered by channel id.
    pub async fn statuses(&self) -> Vec<ChannelInfo> {
        self.all().await.iter().map(|channel| channel.info()).collect()
    }
}
