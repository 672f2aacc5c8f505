//! Heartbeat: a periodic liveness record written atomically to disk and
//! served over HTTP on a dedicated port.
//!
//! The watchdog reads the file; operators read the endpoint. The writer
//! is just another tokio task, so it never keeps a shut-down process
//! alive on its own.

use crate::ChannelInfo;
use crate::channel::ChannelManager;
use crate::storage::write_json_atomic;

use axum::Json;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Aggregate host status derived from channel states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Ok,
    Degraded,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub pid: u32,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub uptime_seconds: u64,
    pub status: HostStatus,
    pub channels: Vec<ChannelInfo>,
    #[serde(rename = "memoryMB")]
    pub memory_mb: f64,
}

/// `error` if any channel errored; `degraded` if any settled channel is
/// not connected; `ok` otherwise. Channels still connecting don't count
/// against health.
pub fn aggregate_status(channels: &[ChannelInfo]) -> HostStatus {
    use crate::ChannelStatus;

    if channels
        .iter()
        .any(|channel| channel.status == ChannelStatus::Error)
    {
        return HostStatus::Error;
    }
    if channels.iter().any(|channel| {
        channel.status != ChannelStatus::Connecting && channel.status != ChannelStatus::Connected
    }) {
        return HostStatus::Degraded;
    }
    HostStatus::Ok
}

/// Resident set size in megabytes, best effort.
fn memory_mb() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:")
                    && let Some(kb) = rest.trim().split_whitespace().next()
                    && let Ok(kb) = kb.parse::<f64>()
                {
                    return kb / 1024.0;
                }
            }
        }
    }
    0.0
}

pub struct Heartbeat {
    channels: Arc<ChannelManager>,
    path: PathBuf,
    interval: Duration,
    port: u16,
    started: Instant,
}

impl Heartbeat {
    pub fn new(
        channels: Arc<ChannelManager>,
        path: PathBuf,
        interval: Duration,
        port: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            channels,
            path,
            interval,
            port,
            started: Instant::now(),
        })
    }

    pub async fn payload(&self) -> HeartbeatPayload {
        let channels = self.channels.statuses().await;
        HeartbeatPayload {
            pid: std::process::id(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            uptime_seconds: self.started.elapsed().as_secs(),
            status: aggregate_status(&channels),
            channels,
            memory_mb: memory_mb(),
        }
    }

    /// Write one heartbeat now.
    pub async fn beat(&self) {
        let payload = self.payload().await;
        if let Err(error) = write_json_atomic(&self.path, &payload) {
            tracing::warn!(%error, "failed to write heartbeat file");
        }
    }

    /// Start the periodic writer and the HTTP listener. Both stop when
    /// `shutdown` flips to true.
    pub async fn start(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        let writer = self.clone();
        let mut writer_shutdown = shutdown.clone();
        let writer_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(writer.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => writer.beat().await,
                    _ = async {
                        while !*writer_shutdown.borrow() {
                            if writer_shutdown.changed().await.is_err() {
                                break;
                            }
                        }
                    } => break,
                }
            }
        });

        let heartbeat = self.clone();
        let app = axum::Router::new()
            .route("/", axum::routing::get(serve_health))
            .route("/health", axum::routing::get(serve_health))
            .with_state(heartbeat);

        let address = std::net::SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(address).await?;
        tracing::info!(%address, "health endpoint listening");

        let mut server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.wait_for(|stop| *stop).await;
                })
                .await
            {
                tracing::error!(%error, "health server exited with error");
            }
        });

        Ok(writer_handle)
    }
}

async fn serve_health(
    axum::extract::State(heartbeat): axum::extract::State<Arc<Heartbeat>>,
) -> (StatusCode, Json<HeartbeatPayload>) {
    let payload = heartbeat.payload().await;
    let status = if payload.status == HostStatus::Ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::RecordingChannel;
    use crate::{ChannelStatus, ChannelInfo};

    fn info(id: &str, status: ChannelStatus) -> ChannelInfo {
        ChannelInfo {
            id: id.into(),
            channel_type: "recording".into(),
            status,
            error: None,
        }
    }

    #[test]
    fn status_aggregation_rules() {
        assert_eq!(aggregate_status(&[]), HostStatus::Ok);
        assert_eq!(
            aggregate_status(&[info("a", ChannelStatus::Connected)]),
            HostStatus::Ok
        );
        assert_eq!(
            aggregate_status(&[
                info("a", ChannelStatus::Connected),
                info("b", ChannelStatus::Connecting)
            ]),
            HostStatus::Ok
        );
        assert_eq!(
            aggregate_status(&[
                info("a", ChannelStatus::Connected),
                info("b", ChannelStatus::Disconnected)
            ]),
            HostStatus::Degraded
        );
        assert_eq!(
            aggregate_status(&[
                info("a", ChannelStatus::Disconnected),
                info("b", ChannelStatus::Error)
            ]),
            HostStatus::Error
        );
    }

    #[tokio::test]
    async fn beat_writes_a_parseable_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channels = Arc::new(ChannelManager::new());
        let channel = Arc::new(RecordingChannel::new("rec"));
        channel.set_status(ChannelStatus::Connected, None);
        channels.register(channel).await;

        let path = dir.path().join("health").join("heartbeat.json");
        let heartbeat = Heartbeat::new(
            channels,
            path.clone(),
            Duration::from_secs(10),
            0,
        );
        heartbeat.beat().await;

        let raw = std::fs::read_to_string(&path).expect("heartbeat file");
        let payload: HeartbeatPayload = serde_json::from_str(&raw).expect("parse");
        assert_eq!(payload.pid, std::process::id());
        assert_eq!(payload.status, HostStatus::Ok);
        assert_eq!(payload.channels.len(), 1);

        // The wire format uses the exact field names the watchdog reads.
        let value: serde_json::Value = serde_json::from_str(&raw).expect("value");
        assert!(value.get("uptimeSeconds").is_some());
        assert!(value.get("memoryMB").is_some());
    }
}
