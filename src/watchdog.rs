//! External supervisor: restarts the host when its heartbeat goes
//! stale.
//!
//! Runs as a separate process (`message-agent-watchdog`). The host is
//! judged unhealthy when the heartbeat file is missing, malformed,
//! older than the timeout, or names a dead PID. An optional HTTP probe
//! logs a warning but never triggers a restart by itself.

use crate::health::RecoveryEvent;
use crate::storage::write_json_atomic;

use anyhow::Context as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const GRACEFUL_STOP_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub heartbeat_file: PathBuf,
    pub heartbeat_timeout: Duration,
    pub check_interval: Duration,
    pub host_command: String,
    pub max_restarts: usize,
    pub restart_window: Duration,
    pub health_url: Option<String>,
    pub recovery_event_file: PathBuf,
    pub startup_grace: Duration,
}

impl WatchdogConfig {
    /// Read configuration from the environment. `HOST_COMMAND` is
    /// required; everything else has defaults anchored at the standard
    /// data root.
    pub fn from_env() -> anyhow::Result<Self> {
        let data_root = std::env::var("MESSAGE_AGENT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|home| home.join(".message-agent-host"))
                    .unwrap_or_else(|| PathBuf::from(".message-agent-host"))
            });

        let host_command = std::env::var("HOST_COMMAND")
            .context("HOST_COMMAND environment variable is required")?;

        Ok(Self {
            heartbeat_file: std::env::var("HEARTBEAT_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_root.join("health").join("heartbeat.json")),
            heartbeat_timeout: Duration::from_secs(env_u64("HEARTBEAT_TIMEOUT", 60)),
            check_interval: Duration::from_secs(env_u64("CHECK_INTERVAL", 15)),
            host_command,
            max_restarts: env_u64("MAX_RESTARTS", 5) as usize,
            restart_window: Duration::from_secs(env_u64("RESTART_WINDOW", 300)),
            health_url: std::env::var("HEALTH_URL").ok(),
            recovery_event_file: std::env::var("RECOVERY_EVENT_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_root.join("health").join("recovery-event.json")),
            startup_grace: Duration::from_secs(15),
        })
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Health verdict for one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Unhealthy(String),
}

/// Judge the heartbeat file. `now_ms` is injected for testability.
pub fn assess_heartbeat(path: &Path, timeout: Duration, now_ms: i64) -> Verdict {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Verdict::Unhealthy("heartbeat file missing".into()),
    };

    let value: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(error) => return Verdict::Unhealthy(format!("heartbeat malformed: {error}")),
    };

    let Some(timestamp) = value.get("timestamp").and_then(serde_json::Value::as_i64) else {
        return Verdict::Unhealthy("heartbeat has no timestamp".into());
    };
    let age_ms = now_ms.saturating_sub(timestamp);
    if age_ms > timeout.as_millis() as i64 {
        return Verdict::Unhealthy(format!("heartbeat stale ({age_ms} ms old)"));
    }

    let Some(pid) = value.get("pid").and_then(serde_json::Value::as_u64) else {
        return Verdict::Unhealthy("heartbeat has no pid".into());
    };
    if !process_alive(pid as u32) {
        return Verdict::Unhealthy(format!("heartbeat pid {pid} no longer exists"));
    }

    Verdict::Healthy
}

/// kill(pid, 0) checks existence without sending a signal.
pub fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Sliding window of restart timestamps. Plain list pruned on every
/// check; N is bounded by `max + 1`.
pub struct RestartWindow {
    timestamps: Vec<Instant>,
    max: usize,
    window: Duration,
}

impl RestartWindow {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            timestamps: Vec::new(),
            max,
            window,
        }
    }

    fn prune(&mut self, now: Instant) {
        self.timestamps
            .retain(|at| now.duration_since(*at) < self.window);
    }

    /// Whether another restart is allowed right now.
    pub fn allows(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.timestamps.len() < self.max
    }

    pub fn record(&mut self, now: Instant) {
        self.prune(now);
        self.timestamps.push(now);
    }
}

pub struct Watchdog {
    config: WatchdogConfig,
    child: Option<tokio::process::Child>,
    window: RestartWindow,
    restart_count: u64,
    http: reqwest::Client,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        let window = RestartWindow::new(config.max_restarts, config.restart_window);
        Self {
            config,
            child: None,
            window,
            restart_count: 0,
            http: reqwest::Client::new(),
        }
    }

    /// Supervision loop; runs until the process is terminated.
    pub async fn run(&mut self) {
        tracing::info!(
            heartbeat = %self.config.heartbeat_file.display(),
            interval = ?self.config.check_interval,
            "watchdog started"
        );

        loop {
            tokio::time::sleep(self.config.check_interval).await;
            self.probe_http().await;

            let verdict = assess_heartbeat(
                &self.config.heartbeat_file,
                self.config.heartbeat_timeout,
                chrono::Utc::now().timestamp_millis(),
            );
            match verdict {
                Verdict::Healthy => {}
                Verdict::Unhealthy(reason) => {
                    tracing::warn!(%reason, "host judged unhealthy");
                    self.restart(&reason).await;
                }
            }
        }
    }

    /// Supplementary HTTP check; failures only warn.
    async fn probe_http(&self) {
        let Some(url) = &self.config.health_url else {
            return;
        };
        match self.http.get(url).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::warn!(url, status = %response.status(), "health endpoint unhealthy");
            }
            Err(error) => {
                tracing::warn!(url, %error, "health endpoint unreachable");
            }
        }
    }

    async fn restart(&mut self, reason: &str) {
        if !self.window.allows(Instant::now()) {
            tracing::warn!(
                max = self.config.max_restarts,
                window = ?self.config.restart_window,
                "restart rate limit reached, pausing this cycle"
            );
            return;
        }

        self.stop_previous_host().await;

        self.restart_count += 1;
        let event = RecoveryEvent {
            timestamp: chrono::Utc::now().timestamp_millis(),
            reason: reason.to_string(),
            restart_count: self.restart_count,
            watchdog_pid: std::process::id(),
        };
        if let Err(error) = write_json_atomic(&self.config.recovery_event_file, &event) {
            tracing::warn!(%error, "failed to write recovery event file");
        }

        tracing::info!(command = %self.config.host_command, "spawning host");
        match tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.config.host_command)
            .spawn()
        {
            Ok(child) => {
                self.child = Some(child);
                self.window.record(Instant::now());
            }
            Err(error) => {
                tracing::error!(%error, "failed to spawn host");
            }
        }

        tokio::time::sleep(self.config.startup_grace).await;
    }

    /// Stop the stale host: graceful signal to the heartbeat PID, wait,
    /// force-kill, plus the tracked child if one exists.
    async fn stop_previous_host(&mut self) {
        if let Some(pid) = self.heartbeat_pid()
            && process_alive(pid)
        {
            tracing::info!(pid, "sending graceful stop to stale host");
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }

            let deadline = Instant::now() + GRACEFUL_STOP_WAIT;
            while process_alive(pid) && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            if process_alive(pid) {
                tracing::warn!(pid, "host ignored graceful stop, killing");
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGKILL);
                }
            }
        }

        if let Some(mut child) = self.child.take() {
            if let Err(error) = child.start_kill() {
                tracing::debug!(%error, "tracked child already gone");
            }
            let _ = child.wait().await;
        }
    }

    fn heartbeat_pid(&self) -> Option<u32> {
        let raw = std::fs::read_to_string(&self.config.heartbeat_file).ok()?;
        let value: serde_json::Value = serde_json::from_str(&raw).ok()?;
        value.get("pid").and_then(serde_json::Value::as_u64).map(|pid| pid as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_unhealthy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let verdict = assess_heartbeat(
            &dir.path().join("nope.json"),
            Duration::from_secs(60),
            1_000_000,
        );
        assert!(matches!(verdict, Verdict::Unhealthy(reason) if reason.contains("missing")));
    }

    #[test]
    fn malformed_file_is_unhealthy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("heartbeat.json");
        std::fs::write(&path, "not json").expect("write");
        let verdict = assess_heartbeat(&path, Duration::from_secs(60), 1_000_000);
        assert!(matches!(verdict, Verdict::Unhealthy(reason) if reason.contains("malformed")));
    }

    #[test]
    fn stale_timestamp_is_unhealthy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("heartbeat.json");
        std::fs::write(
            &path,
            serde_json::json!({"pid": std::process::id(), "timestamp": 0}).to_string(),
        )
        .expect("write");

        let verdict = assess_heartbeat(&path, Duration::from_secs(60), 61_000);
        assert!(matches!(verdict, Verdict::Unhealthy(reason) if reason.contains("stale")));
    }

    #[test]
    fn live_pid_and_fresh_timestamp_is_healthy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("heartbeat.json");
        let now = 1_000_000i64;
        std::fs::write(
            &path,
            serde_json::json!({"pid": std::process::id(), "timestamp": now - 5_000}).to_string(),
        )
        .expect("write");

        assert_eq!(
            assess_heartbeat(&path, Duration::from_secs(60), now),
            Verdict::Healthy
        );
    }

    #[test]
    fn dead_pid_is_unhealthy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("heartbeat.json");
        // PID near the max is effectively never allocated.
        std::fs::write(
            &path,
            serde_json::json!({"pid": 4_194_000, "timestamp": 1_000_000}).to_string(),
        )
        .expect("write");

        let verdict = assess_heartbeat(&path, Duration::from_secs(60), 1_000_500);
        assert!(matches!(verdict, Verdict::Unhealthy(reason) if reason.contains("no longer exists")));
    }

    #[test]
    fn restart_window_limits_and_drains() {
        let mut window = RestartWindow::new(2, Duration::from_secs(10));
        let start = Instant::now();

        assert!(window.allows(start));
        window.record(start);
        assert!(window.allows(start + Duration::from_secs(1)));
        window.record(start + Duration::from_secs(1));

        // Window full.
        assert!(!window.allows(start + Duration::from_secs(2)));

        // Old entries drain out as time passes.
        assert!(window.allows(start + Duration::from_secs(11)));
    }
}
