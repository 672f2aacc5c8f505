//! Liveness and self-healing: heartbeat emission, per-channel
//! reconnection, and post-restart recovery.

pub mod heartbeat;
pub mod monitor;
pub mod recovery;

pub use heartbeat::{Heartbeat, HeartbeatPayload, HostStatus};
pub use monitor::{ChannelMonitor, MonitorConfig};
pub use recovery::{RecoveryEvent, RecoveryNotifier, TaskRecovery};
