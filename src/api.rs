//! Browser-facing HTTP surface: chat, SSE streaming, and the
//! dashboard.

pub mod chat;
pub mod server;
pub mod sse;
pub mod system;

pub use server::{ApiState, start_http_server};
pub use sse::{SseManager, SsePayload};
