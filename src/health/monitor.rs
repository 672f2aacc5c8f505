//! Channel monitor: periodic health sweep with exponential-backoff
//! reconnection.
//!
//! A connected channel resets its failure count; a channel mid-connect
//! is left alone; anything else sleeps `min(base * 2^failures, max)`
//! and gets a disconnect/connect cycle. After `max_attempts`
//! consecutive failures the counter resets and the channel sits out one
//! sweep as a cooldown.

use crate::ChannelStatus;
use crate::channel::{ChannelManager, traits::ChannelDyn};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub check_interval: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            max_attempts: 10,
        }
    }
}

/// `min(base * 2^failures, max)`.
pub fn compute_backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let multiplier = 2u64.saturating_pow(failures);
    base.saturating_mul(multiplier.min(u32::MAX as u64) as u32).min(max)
}

pub struct ChannelMonitor {
    channels: Arc<ChannelManager>,
    config: MonitorConfig,
    failures: Mutex<HashMap<String, u32>>,
    cooldown: Mutex<HashSet<String>>,
}

impl ChannelMonitor {
    pub fn new(channels: Arc<ChannelManager>, config: MonitorConfig) -> Arc<Self> {
        Arc::new(Self {
            channels,
            config,
            failures: Mutex::new(HashMap::new()),
            cooldown: Mutex::new(HashSet::new()),
        })
    }

    /// Run sweeps until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.check_interval) => {}
                _ = shutdown.wait_for(|stop| *stop) => return,
            }

            for channel in self.channels.all().await {
                self.check_channel(channel.as_ref()).await;
            }
        }
    }

    /// One sweep step for one channel.
    pub(crate) async fn check_channel(&self, channel: &dyn ChannelDyn) {
        let id = channel.id().to_string();
        match channel.info().status {
            ChannelStatus::Connected => {
                self.failures.lock().await.remove(&id);
            }
            ChannelStatus::Connecting => {}
            _ => {
                if self.cooldown.lock().await.remove(&id) {
                    tracing::info!(channel = %id, "reconnect cooldown, skipping one sweep");
                    return;
                }

                let failures = *self.failures.lock().await.get(&id).unwrap_or(&0);
                let delay =
                    compute_backoff(self.config.base_delay, self.config.max_delay, failures);
                tracing::info!(channel = %id, failures, ?delay, "reconnecting channel");
                tokio::time::sleep(delay).await;

                channel.disconnect().await;
                channel.connect().await;

                if channel.info().status == ChannelStatus::Connected {
                    self.failures.lock().await.remove(&id);
                    tracing::info!(channel = %id, "channel reconnected");
                } else {
                    let mut failures = self.failures.lock().await;
                    let count = failures.entry(id.clone()).or_insert(0);
                    *count += 1;
                    if *count >= self.config.max_attempts {
                        tracing::warn!(
                            channel = %id,
                            attempts = *count,
                            "reconnect attempts exhausted, cooling down"
                        );
                        *count = 0;
                        drop(failures);
                        self.cooldown.lock().await.insert(id);
                    }
                }
            }
        }
    }

    #[cfg(test)]
    async fn failure_count(&self, id: &str) -> u32 {
        *self.failures.lock().await.get(id).unwrap_or(&0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::RecordingChannel;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(2_000);
        let max = Duration::from_millis(120_000);
        assert_eq!(compute_backoff(base, max, 0), Duration::from_millis(2_000));
        assert_eq!(compute_backoff(base, max, 1), Duration::from_millis(4_000));
        assert_eq!(compute_backoff(base, max, 2), Duration::from_millis(8_000));
        assert_eq!(compute_backoff(base, max, 6), Duration::from_millis(120_000));
        // Huge failure counts must not overflow.
        assert_eq!(compute_backoff(base, max, 63), max);
    }

    async fn monitor_with(channel: Arc<RecordingChannel>) -> Arc<ChannelMonitor> {
        let channels = Arc::new(ChannelManager::new());
        channels.register(channel).await;
        ChannelMonitor::new(
            channels,
            MonitorConfig {
                check_interval: Duration::from_millis(10),
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(8),
                max_attempts: 3,
            },
        )
    }

    #[tokio::test]
    async fn failure_counter_grows_then_resets_on_success() {
        let channel = Arc::new(RecordingChannel::new("rec"));
        channel.set_status(crate::ChannelStatus::Error, Some("down".into()));
        channel.fail_next_connects(2);
        let monitor = monitor_with(channel.clone()).await;

        monitor.check_channel(channel.as_ref() as &dyn ChannelDyn).await;
        assert_eq!(monitor.failure_count("rec").await, 1);

        monitor.check_channel(channel.as_ref() as &dyn ChannelDyn).await;
        assert_eq!(monitor.failure_count("rec").await, 2);

        // Third connect succeeds and the counter clears.
        monitor.check_channel(channel.as_ref() as &dyn ChannelDyn).await;
        assert_eq!(monitor.failure_count("rec").await, 0);
        assert_eq!(channel.info().status, crate::ChannelStatus::Connected);
    }

    #[tokio::test]
    async fn exhausted_attempts_trigger_a_cooldown_sweep() {
        let channel = Arc::new(RecordingChannel::new("rec"));
        channel.set_status(crate::ChannelStatus::Error, Some("down".into()));
        channel.fail_next_connects(100);
        let monitor = monitor_with(channel.clone()).await;

        for _ in 0..3 {
            monitor.check_channel(channel.as_ref() as &dyn ChannelDyn).await;
        }
        // Counter reset after max_attempts, channel now cooling down.
        assert_eq!(monitor.failure_count("rec").await, 0);
        assert!(monitor.cooldown.lock().await.contains("rec"));

        // The cooldown sweep does not attempt a connect.
        let before = channel.info();
        monitor.check_channel(channel.as_ref() as &dyn ChannelDyn).await;
        assert!(!monitor.cooldown.lock().await.contains("rec"));
        assert_eq!(channel.info().status, before.status);
    }

    #[tokio::test]
    async fn connected_channels_are_left_alone() {
        let channel = Arc::new(RecordingChannel::new("rec"));
        channel.set_status(crate::ChannelStatus::Connected, None);
        let channels = Arc::new(ChannelManager::new());
        channels.register(channel.clone()).await;
        let monitor = ChannelMonitor::new(channels, MonitorConfig::default());

        monitor.check_channel(channel.as_ref() as &dyn ChannelDyn).await;
        assert_eq!(monitor.failure_count("rec").await, 0);
        assert_eq!(channel.info().status, crate::ChannelStatus::Connected);
    }
}
