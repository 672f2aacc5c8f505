//! LLM service: a uniform chat/complete interface over heterogeneous
//! backends, with tool-call extraction for completion-only providers.

pub mod claude_cli;
pub mod copilot;
pub mod extract;
pub mod openai;
pub mod service;

pub use service::{
    ChatMessage, ChatModel, ChatResponse, ChatRole, CompletionModel, LlmService, ToolCall,
    ToolDefinition, Usage,
};
