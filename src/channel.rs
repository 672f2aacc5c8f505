//! Channel abstraction: a uniform inbound/outbound contract that hides
//! platform idiosyncrasies.

pub mod manager;
pub mod telegram;
pub mod traits;
pub mod web;

pub use manager::ChannelManager;
pub use telegram::TelegramChannel;
pub use traits::{Channel, ChannelDyn};
pub use web::WebChannel;
