//! Dashboard routes: host status, task listings, and the journal view.

use super::server::ApiState;

use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use std::sync::Arc;

/// Resident set size in bytes, best effort.
fn rss_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:")
                    && let Some(kb) = rest.trim().split_whitespace().next()
                    && let Ok(kb) = kb.parse::<u64>()
                {
                    return kb * 1024;
                }
            }
        }
    }
    0
}

/// `GET /api/status`
pub(super) async fn status(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let channels = state.channels.statuses().await;
    let rss = rss_bytes();
    Json(serde_json::json!({
        "channels": channels,
        "activeTasks": state.tasks.active_count().await,
        "memory": {
            "rss": rss,
            "heapUsed": rss,
            "heapTotal": rss,
        },
        "uptime": state.started.elapsed().as_secs(),
    }))
}

/// `GET /api/tasks`: in-memory and persisted views side by side.
pub(super) async fn tasks(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "active": state.tasks.active_summaries().await,
        "persisted": state.task_store.list_active(),
    }))
}

#[derive(Deserialize)]
pub(super) struct JournalQuery {
    #[serde(rename = "channelId")]
    channel_id: Option<String>,
    #[serde(rename = "conversationId")]
    conversation_id: Option<String>,
    limit: Option<usize>,
}

/// `GET /api/journal?channelId=&conversationId=&limit=`, newest-first.
pub(super) async fn journal(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<JournalQuery>,
) -> Json<serde_json::Value> {
    let entries = state
        .journal
        .read_recent(
            query.channel_id.as_deref(),
            query.conversation_id.as_deref(),
            query.limit.unwrap_or(50),
        )
        .await;
    Json(serde_json::json!({"entries": entries}))
}
