//! Channel trait and dynamic dispatch companion.

use crate::error::Result;
use crate::{ChannelInfo, MessageHandler, OutgoingMessage};
use futures::future::BoxFuture;

/// Static trait for channel adapters.
///
/// `connect` must move the channel through `connecting → connected` (or
/// `→ error` with a reason) without throwing at the caller; failures
/// surface through [`Channel::info`]. Exactly one message handler is
/// installed per channel at startup by the channel manager.
pub trait Channel: Send + Sync + 'static {
    /// Stable identity, the `channelId` on every message.
    fn id(&self) -> &str;

    /// Platform tag (`telegram`, `web`, ...).
    fn channel_type(&self) -> &str;

    /// Install the shared inbound handler.
    fn set_handler(&self, handler: MessageHandler);

    fn connect(&self) -> impl std::future::Future<Output = ()> + Send;

    fn disconnect(&self) -> impl std::future::Future<Output = ()> + Send;

    fn send_message(
        &self,
        conversation_id: &str,
        message: OutgoingMessage,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn send_typing_indicator(
        &self,
        conversation_id: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Point-in-time status report.
    fn info(&self) -> ChannelInfo;
}

/// Dynamic trait for runtime polymorphism. Use this when you need
/// `Arc<dyn ChannelDyn>` for storing different adapters together.
pub trait ChannelDyn: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn channel_type(&self) -> &str;

    fn set_handler(&self, handler: MessageHandler);

    fn connect<'a>(&'a self) -> BoxFuture<'a, ()>;

    fn disconnect<'a>(&'a self) -> BoxFuture<'a, ()>;

    fn send_message<'a>(
        &'a self,
        conversation_id: &'a str,
        message: OutgoingMessage,
    ) -> BoxFuture<'a, Result<()>>;

    fn send_typing_indicator<'a>(&'a self, conversation_id: &'a str) -> BoxFuture<'a, Result<()>>;

    fn info(&self) -> ChannelInfo;
}

/// Blanket implementation: any type implementing Channel automatically
/// implements ChannelDyn.
impl<T: Channel> ChannelDyn for T {
    fn id(&self) -> &str {
        Channel::id(self)
    }

    fn channel_type(&self) -> &str {
        Channel::channel_type(self)
    }

    fn set_handler(&self, handler: MessageHandler) {
        Channel::set_handler(self, handler)
    }

    fn connect<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(Channel::connect(self))
    }

    fn disconnect<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(Channel::disconnect(self))
    }

    fn send_message<'a>(
        &'a self,
        conversation_id: &'a str,
        message: OutgoingMessage,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(Channel::send_message(self, conversation_id, message))
    }

    fn send_typing_indicator<'a>(&'a self, conversation_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(Channel::send_typing_indicator(self, conversation_id))
    }

    fn info(&self) -> ChannelInfo {
        Channel::info(self)
    }
}
