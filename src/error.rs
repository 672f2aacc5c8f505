//! Top-level error types for the agent host.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Channel transport errors. Surfaced via channel status; the channel
/// monitor owns reconnection.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel {id} not found")]
    NotFound { id: String },

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// LLM provider errors. The pipeline fails the task and replies with an
/// error message.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider request failed: {0}")]
    ProviderRequest(String),

    #[error("completion failed: {0}")]
    CompletionFailed(String),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Durable storage errors. Journal writes swallow these; history writes
/// propagate them into the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("task {id} not found in active store")]
    TaskNotFound { id: String },

    #[error("corrupt record in {path}: {detail}")]
    Corrupt { path: String, detail: String },

    #[error("write failed for {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Tool invocation errors. Inlined into the tool result inside the
/// tool-use loop, never aborting it.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool call failed: {0}")]
    CallFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
