//! HTTP server setup: router, cached index page, and API route wiring.

use super::{chat, sse::SseManager, system};
use crate::channel::{ChannelManager, WebChannel};
use crate::storage::{HistoryStore, Journal};
use crate::tasks::{TaskManager, TaskStore};

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Single-page chat client, served from a cached string.
const INDEX_HTML: &str = include_str!("index.html");

/// Shared state for every API handler.
pub struct ApiState {
    pub web_channel: Arc<WebChannel>,
    pub sse: Arc<SseManager>,
    pub history: Arc<HistoryStore>,
    pub journal: Arc<Journal>,
    pub tasks: Arc<TaskManager>,
    pub task_store: Arc<TaskStore>,
    pub channels: Arc<ChannelManager>,
    pub started: Instant,
}

/// Start the HTTP server on the given address. Shuts down when the
/// watch channel flips to true; closing the server also closes every
/// SSE subscriber.
pub async fn start_http_server(
    bind: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/chat", post(chat::post_chat))
        .route("/chat/stream", get(chat::chat_stream))
        .route("/history", get(chat::history))
        .route("/conversations", get(chat::conversations))
        .route("/status", get(system::status))
        .route("/tasks", get(system::tasks))
        .route("/journal", get(system::journal));

    let app = Router::new()
        .route("/", get(index))
        .route("/index.html", get(index))
        .nest("/api", api_routes)
        .fallback(not_found)
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "web server listening");

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
        {
            tracing::error!(%error, "web server exited with error");
        }
    });

    Ok(handle)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "Not found"})),
    )
}
