//! MCP client connections and namespaced tool discovery.
//!
//! Each configured server is launched once as a child process speaking
//! MCP over stdio. The tool catalogue is namespaced `<server>__<tool>`
//! at handshake time and cached on the connection, so the pipeline only
//! ever sees flat tool names and flattened text results.

use crate::config::McpServerConfig;
use crate::error::{Result, ToolError};
use crate::llm::ToolDefinition;

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use rmcp::ClientHandler;
use rmcp::service::{RoleClient, RunningService};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Separator between server and tool name in the flat namespace.
pub const TOOL_NAMESPACE_SEPARATOR: &str = "__";

/// Anything the pipeline can pull tools from and invoke them on. The
/// MCP manager is the production implementation; tests substitute their
/// own.
#[async_trait]
pub trait ToolSource: Send + Sync {
    /// The union of every connected server's tools, namespaced.
    async fn get_all_tools(&self) -> Vec<ToolDefinition>;

    /// Invoke a namespaced tool and flatten its text output.
    async fn invoke_tool(&self, namespaced_name: &str, arguments: serde_json::Value)
    -> Result<String>;
}

type McpClientSession = RunningService<RoleClient, McpClient>;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum McpConnectionState {
    Connecting,
    Connected,
    Failed(String),
    Disconnected,
}

/// Client identity presented at handshake. Server notifications are
/// ignored; the catalogue is fixed for the life of a connection.
#[derive(Clone, Default)]
struct McpClient;

impl ClientHandler for McpClient {
    fn get_info(&self) -> rmcp::model::ClientInfo {
        let mut client_info =
            rmcp::model::Implementation::new("message-agent", env!("CARGO_PKG_VERSION"));
        client_info.description = Some("message-agent MCP client".to_string());
        rmcp::model::ClientInfo::new(
            rmcp::model::ClientCapabilities::default(),
            client_info,
        )
    }
}

/// A live session together with the namespaced catalogue it advertised
/// at handshake.
struct LiveSession {
    session: McpClientSession,
    tools: Vec<ToolDefinition>,
}

/// One configured server: child-process lifecycle, cached catalogue,
/// and the invoke path.
pub struct McpConnection {
    server: String,
    config: McpServerConfig,
    state: RwLock<McpConnectionState>,
    live: Mutex<Option<LiveSession>>,
}

impl McpConnection {
    pub fn new(server: String, config: McpServerConfig) -> Self {
        Self {
            server,
            config,
            state: RwLock::new(McpConnectionState::Disconnected),
            live: Mutex::new(None),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub async fn state(&self) -> McpConnectionState {
        self.state.read().await.clone()
    }

    async fn set_state(&self, state: McpConnectionState) {
        *self.state.write().await = state;
    }

    /// Spawn the child process, handshake, and cache the namespaced
    /// tool catalogue.
    pub async fn connect(&self) -> anyhow::Result<()> {
        self.set_state(McpConnectionState::Connecting).await;

        let attempt = async {
            let mut command = tokio::process::Command::new(&self.config.command);
            command.args(&self.config.args).envs(&self.config.env);

            let transport = rmcp::transport::TokioChildProcess::new(command)
                .with_context(|| format!("failed to spawn mcp server '{}'", self.server))?;
            let session = rmcp::serve_client(McpClient, transport)
                .await
                .with_context(|| format!("handshake with mcp server '{}' failed", self.server))?;

            let listed = session
                .list_all_tools()
                .await
                .map_err(|error| anyhow!("failed to list tools for '{}': {error}", self.server))?;
            let tools = listed
                .into_iter()
                .map(|tool| self.namespaced_definition(tool))
                .collect();

            Ok::<LiveSession, anyhow::Error>(LiveSession { session, tools })
        };

        match attempt.await {
            Ok(live) => {
                *self.live.lock().await = Some(live);
                self.set_state(McpConnectionState::Connected).await;
                Ok(())
            }
            Err(error) => {
                *self.live.lock().await = None;
                self.set_state(McpConnectionState::Failed(error.to_string()))
                    .await;
                Err(error)
            }
        }
    }

    /// Map a server-native tool onto the flat namespace the pipeline
    /// speaks.
    fn namespaced_definition(&self, tool: rmcp::model::Tool) -> ToolDefinition {
        ToolDefinition {
            name: format!(
                "{}{TOOL_NAMESPACE_SEPARATOR}{}",
                self.server,
                tool.name.as_ref()
            ),
            description: tool
                .description
                .as_ref()
                .map(|description| description.to_string())
                .unwrap_or_default(),
            input_schema: tool.schema_as_json_value(),
        }
    }

    pub async fn disconnect(&self) {
        let mut taken = self.live.lock().await.take();
        if let Some(live) = taken.as_mut()
            && let Err(error) = live.session.close().await
        {
            tracing::warn!(server = %self.server, %error, "failed to close mcp session");
        }
        self.set_state(McpConnectionState::Disconnected).await;
    }

    /// The catalogue cached at handshake; empty while disconnected.
    pub async fn tools(&self) -> Vec<ToolDefinition> {
        self.live
            .lock()
            .await
            .as_ref()
            .map(|live| live.tools.clone())
            .unwrap_or_default()
    }

    /// Call one of this server's tools and flatten the text content
    /// parts of the result with newlines. A server-reported error
    /// becomes a `ToolError` carrying the flattened text.
    pub async fn invoke(&self, tool: &str, arguments: serde_json::Value) -> Result<String> {
        let arguments = match arguments {
            serde_json::Value::Object(map) => Some(map),
            serde_json::Value::Null => None,
            _ => {
                return Err(ToolError::CallFailed(
                    "tool arguments must be a JSON object or null".into(),
                )
                .into());
            }
        };

        let live = self.live.lock().await;
        let Some(live) = live.as_ref() else {
            return Err(ToolError::CallFailed(format!(
                "mcp server '{}' is not connected",
                self.server
            ))
            .into());
        };

        let mut request = rmcp::model::CallToolRequestParams::new(Cow::Owned(tool.to_string()));
        if let Some(arguments) = arguments {
            request = request.with_arguments(arguments);
        }
        let result = live
            .session
            .call_tool(request)
            .await
            .map_err(|error| ToolError::CallFailed(error.to_string()))?;

        let output = collect_result_text(&result);
        if result.is_error.unwrap_or(false) {
            return Err(ToolError::CallFailed(if output.is_empty() {
                format!(
                    "mcp server '{}' reported an error calling '{tool}'",
                    self.server
                )
            } else {
                output
            })
            .into());
        }

        Ok(output)
    }
}

/// Owns one connection per configured server. The server set is fixed
/// at startup.
pub struct McpManager {
    connections: Vec<Arc<McpConnection>>,
}

impl McpManager {
    pub fn new(configs: HashMap<String, McpServerConfig>) -> Self {
        let mut connections: Vec<_> = configs
            .into_iter()
            .map(|(server, config)| Arc::new(McpConnection::new(server, config)))
            .collect();
        connections.sort_by(|a, b| a.server().cmp(b.server()));
        Self { connections }
    }

    /// Connect every configured server. One failure never blocks the
    /// rest.
    pub async fn connect_all(&self) {
        for connection in &self.connections {
            if let Err(error) = connection.connect().await {
                tracing::warn!(server = %connection.server(), %error, "failed to connect mcp server");
            }
        }
    }

    pub async fn disconnect_all(&self) {
        for connection in &self.connections {
            connection.disconnect().await;
        }
    }

    fn find(&self, server: &str) -> Option<&Arc<McpConnection>> {
        self.connections
            .iter()
            .find(|connection| connection.server() == server)
    }

    fn split_namespaced(namespaced_name: &str) -> Result<(&str, &str)> {
        match namespaced_name.split_once(TOOL_NAMESPACE_SEPARATOR) {
            Some((server, tool)) if !server.is_empty() && !tool.is_empty() => Ok((server, tool)),
            _ => Err(ToolError::UnknownTool(namespaced_name.to_string()).into()),
        }
    }
}

#[async_trait]
impl ToolSource for McpManager {
    async fn get_all_tools(&self) -> Vec<ToolDefinition> {
        let mut definitions = Vec::new();
        for connection in &self.connections {
            definitions.extend(connection.tools().await);
        }
        definitions
    }

    async fn invoke_tool(
        &self,
        namespaced_name: &str,
        arguments: serde_json::Value,
    ) -> Result<String> {
        let (server, tool) = Self::split_namespaced(namespaced_name)?;
        let connection = self
            .find(server)
            .ok_or_else(|| ToolError::UnknownTool(namespaced_name.to_string()))?;
        connection.invoke(tool, arguments).await
    }
}

/// Flatten the text content parts of a tool result with newlines.
fn collect_result_text(result: &rmcp::model::CallToolResult) -> String {
    let mut parts = Vec::new();
    for content in &result.content {
        match &content.raw {
            rmcp::model::RawContent::Text(text) => parts.push(text.text.clone()),
            rmcp::model::RawContent::Resource(resource) => {
                match &resource.resource {
                    rmcp::model::ResourceContents::TextResourceContents { text, .. } => {
                        parts.push(text.clone());
                    }
                    _ => parts.push("[non-text resource]".to_string()),
                }
            }
            other => {
                parts.push(
                    serde_json::to_string(other)
                        .unwrap_or_else(|_| "[unsupported content]".to_string()),
                );
            }
        }
    }
    if let Some(structured) = &result.structured_content {
        parts.push(structured.to_string());
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_requires_both_halves() {
        assert_eq!(
            McpManager::split_namespaced("calc__add").expect("split"),
            ("calc", "add")
        );
        // Only the first separator splits; the rest belongs to the tool.
        assert_eq!(
            McpManager::split_namespaced("fs__read__file").expect("split"),
            ("fs", "read__file")
        );
        assert!(McpManager::split_namespaced("justaname").is_err());
        assert!(McpManager::split_namespaced("__tool").is_err());
        assert!(McpManager::split_namespaced("server__").is_err());
    }

    #[tokio::test]
    async fn invoking_unknown_server_is_an_unknown_tool_error() {
        let manager = McpManager::new(HashMap::new());
        let error = manager
            .invoke_tool("ghost__tool", serde_json::Value::Null)
            .await
            .expect_err("no such server");
        assert!(matches!(
            error,
            crate::Error::Tool(ToolError::UnknownTool(_))
        ));
    }

    #[tokio::test]
    async fn invoking_a_disconnected_server_fails_cleanly() {
        let connection = McpConnection::new(
            "calc".into(),
            McpServerConfig {
                command: "true".into(),
                args: Vec::new(),
                env: HashMap::new(),
            },
        );

        assert_eq!(connection.state().await, McpConnectionState::Disconnected);
        assert!(connection.tools().await.is_empty());

        let error = connection
            .invoke("add", serde_json::Value::Null)
            .await
            .expect_err("not connected");
        assert!(matches!(
            error,
            crate::Error::Tool(ToolError::CallFailed(_))
        ));
    }

    #[tokio::test]
    async fn rejects_non_object_arguments() {
        let connection = McpConnection::new(
            "calc".into(),
            McpServerConfig {
                command: "true".into(),
                args: Vec::new(),
                env: HashMap::new(),
            },
        );

        let error = connection
            .invoke("add", serde_json::json!([1, 2]))
            .await
            .expect_err("array arguments");
        assert!(matches!(
            error,
            crate::Error::Tool(ToolError::CallFailed(_))
        ));
    }
}
