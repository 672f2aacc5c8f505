//! Post-restart recovery: notify users that the watchdog restarted the
//! host, and reconcile tasks orphaned by the previous generation.
//!
//! Recovery must never throw: every per-target and per-task failure is
//! logged and skipped so one poison record cannot wedge startup into a
//! restart loop.

use crate::channel::ChannelManager;
use crate::storage::{Journal, JournalEvent};
use crate::tasks::{TaskPhase, TaskStore};
use crate::OutgoingMessage;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Written by the watchdog on every restart, consumed once here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryEvent {
    /// Epoch milliseconds of the restart.
    pub timestamp: i64,
    pub reason: String,
    pub restart_count: u64,
    pub watchdog_pid: u32,
}

/// Sends the restart notice to configured `channelId:conversationId`
/// targets, then removes the event file.
pub struct RecoveryNotifier {
    path: PathBuf,
    targets: Vec<String>,
    channels: Arc<ChannelManager>,
}

impl RecoveryNotifier {
    pub fn new(path: PathBuf, targets: Vec<String>, channels: Arc<ChannelManager>) -> Self {
        Self {
            path,
            targets,
            channels,
        }
    }

    pub async fn notify_if_restarted(&self) {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return,
            Err(error) => {
                tracing::warn!(%error, "failed to read recovery event file");
                return;
            }
        };

        let event: RecoveryEvent = match serde_json::from_str(&raw) {
            Ok(event) => event,
            Err(error) => {
                // A malformed file would poison every future start.
                tracing::warn!(%error, "malformed recovery event file, removing");
                self.remove_event_file();
                return;
            }
        };

        let notice = format_notice(&event, chrono::Utc::now());
        for target in &self.targets {
            let Some((channel_id, conversation_id)) = target.split_once(':') else {
                tracing::warn!(target, "invalid recovery target, expected channel:conversation");
                continue;
            };
            let Some(channel) = self.channels.get(channel_id).await else {
                tracing::warn!(target, "recovery target channel not registered");
                continue;
            };
            if let Err(error) = channel
                .send_message(conversation_id, OutgoingMessage::text(notice.clone()))
                .await
            {
                tracing::warn!(target, %error, "failed to deliver restart notice");
            }
        }

        self.remove_event_file();
    }

    fn remove_event_file(&self) {
        if let Err(error) = std::fs::remove_file(&self.path)
            && error.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(%error, "failed to remove recovery event file");
        }
    }
}

pub(crate) fn format_notice(
    event: &RecoveryEvent,
    now: chrono::DateTime<chrono::Utc>,
) -> String {
    let down_since = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(event.timestamp)
        .map(|at| at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| "unknown".to_string());
    let downtime_seconds =
        ((now.timestamp_millis() - event.timestamp).max(0) as f64 / 1000.0).round() as i64;

    format!(
        "⚠ I was restarted after a failure.\n\
         Reason: {}\n\
         Restart number: {}\n\
         Down since: {down_since} (about {downtime_seconds}s)\n\
         Back online: {}",
        event.reason,
        event.restart_count,
        now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    )
}

/// Disclaimer prefixed to responses that were interrupted mid-verify.
pub const UNVERIFIED_PREFIX: &str =
    "[Recovered after interruption — response may not have been fully verified]";

/// Reconciles `tasks/active/` leftovers from a previous generation.
pub struct TaskRecovery {
    store: Arc<TaskStore>,
    journal: Arc<Journal>,
    channels: Arc<ChannelManager>,
}

impl TaskRecovery {
    pub fn new(store: Arc<TaskStore>, journal: Arc<Journal>, channels: Arc<ChannelManager>) -> Self {
        Self {
            store,
            journal,
            channels,
        }
    }

    /// For every orphaned task: tell the user what happened (resend
    /// request, unverified response, or the ready-but-unsent response),
    /// journal the outcome, and force the file to completed. Send
    /// failures never leave a task behind in `active/`.
    pub async fn recover(&self) {
        let orphans = self.store.list_active();
        if orphans.is_empty() {
            return;
        }
        tracing::info!(count = orphans.len(), "recovering orphaned tasks");

        for task in orphans {
            let (action, outbound): (&str, Option<String>) = match task.phase {
                TaskPhase::Received | TaskPhase::HistoryWritten | TaskPhase::LlmCalling => (
                    "instructed_resend",
                    Some(
                        "⚠ I was restarted while processing your message. Please resend it."
                            .to_string(),
                    ),
                ),
                TaskPhase::Verifying => match &task.pending_response {
                    Some(pending) => (
                        "sent_unverified",
                        Some(format!("{UNVERIFIED_PREFIX}\n\n{pending}")),
                    ),
                    None => (
                        "instructed_resend",
                        Some(
                            "⚠ I was restarted while processing your message. Please resend it."
                                .to_string(),
                        ),
                    ),
                },
                TaskPhase::Responding => match &task.pending_response {
                    Some(pending) => ("sent_pending", Some(pending.clone())),
                    None => ("stale", None),
                },
                TaskPhase::Completed | TaskPhase::Failed => ("stale", None),
            };

            if let Some(text) = outbound {
                match self.channels.get(&task.channel_id).await {
                    Some(channel) => {
                        if let Err(error) = channel
                            .send_message(&task.conversation_id, OutgoingMessage::text(text))
                            .await
                        {
                            tracing::warn!(task_id = %task.id, %error, "recovery send failed");
                        }
                    }
                    None => {
                        tracing::warn!(
                            task_id = %task.id,
                            channel = %task.channel_id,
                            "recovery target channel not registered"
                        );
                    }
                }
            }

            self.journal
                .record(
                    JournalEvent::TaskFailed,
                    &task.id,
                    &task.channel_id,
                    &task.conversation_id,
                    serde_json::json!({
                        "recovery": true,
                        "phase": task.phase.as_str(),
                        "action": action,
                    }),
                )
                .await;

            if let Err(error) = self.store.complete(&task.id) {
                tracing::warn!(task_id = %task.id, %error, "failed to force-complete orphaned task");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::RecordingChannel;
    use crate::tasks::store::{PersistedTask, PhaseUpdate};
    use crate::NormalizedMessage;

    fn message(conversation: &str) -> NormalizedMessage {
        NormalizedMessage {
            id: "m1".into(),
            channel_id: "rec".into(),
            conversation_id: conversation.into(),
            sender_id: "u1".into(),
            sender_name: None,
            text: "original question".into(),
            timestamp: 1,
            platform_message_id: None,
            attachments: Vec::new(),
        }
    }

    struct Fixture {
        recovery: TaskRecovery,
        store: Arc<TaskStore>,
        journal: Arc<Journal>,
        channel: Arc<RecordingChannel>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(TaskStore::new(dir.path().join("tasks")));
        let journal = Arc::new(Journal::new(dir.path().join("journal"), true, 1 << 20, 4));
        let channels = Arc::new(ChannelManager::new());
        let channel = Arc::new(RecordingChannel::new("rec"));
        channels.register(channel.clone()).await;
        Fixture {
            recovery: TaskRecovery::new(store.clone(), journal.clone(), channels),
            store,
            journal,
            channel,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn verifying_task_sends_unverified_response() {
        let fixture = fixture().await;
        fixture
            .store
            .persist(&PersistedTask::new("t1", message("c1")))
            .expect("persist");
        fixture
            .store
            .update_phase(
                "t1",
                TaskPhase::Verifying,
                PhaseUpdate {
                    pending_response: Some("X".into()),
                    ..PhaseUpdate::default()
                },
            )
            .expect("update");

        fixture.recovery.recover().await;

        let sent = fixture.channel.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.text.starts_with(
            "[Recovered after interruption — response may not have been fully verified]\n\nX"
        ));
        assert!(fixture.store.list_active().is_empty());

        let entries = fixture.journal.read_recent(Some("rec"), Some("c1"), 10).await;
        let failure = entries
            .iter()
            .find(|entry| entry.event == JournalEvent::TaskFailed)
            .expect("task_failed entry");
        assert_eq!(failure.data["recovery"], true);
        assert_eq!(failure.data["phase"], "verifying");
        assert_eq!(failure.data["action"], "sent_unverified");
    }

    #[tokio::test]
    async fn early_phase_tasks_ask_for_a_resend() {
        let fixture = fixture().await;
        fixture
            .store
            .persist(&PersistedTask::new("t1", message("c1")))
            .expect("persist");

        fixture.recovery.recover().await;

        let sent = fixture.channel.sent().await;
        assert!(sent[0].1.text.contains("Please resend it"));
        assert!(fixture.store.list_active().is_empty());
    }

    #[tokio::test]
    async fn responding_task_sends_pending_verbatim() {
        let fixture = fixture().await;
        fixture
            .store
            .persist(&PersistedTask::new("t1", message("c1")))
            .expect("persist");
        fixture
            .store
            .update_phase(
                "t1",
                TaskPhase::Responding,
                PhaseUpdate {
                    pending_response: Some("the finished answer".into()),
                    ..PhaseUpdate::default()
                },
            )
            .expect("update");

        fixture.recovery.recover().await;

        assert_eq!(fixture.channel.sent().await[0].1.text, "the finished answer");
    }

    #[tokio::test]
    async fn recovery_completes_every_orphan_even_when_sends_fail() {
        let fixture = fixture().await;
        fixture.channel.fail_sends();
        for n in 0..3 {
            fixture
                .store
                .persist(&PersistedTask::new(format!("t{n}"), message("c1")))
                .expect("persist");
        }

        fixture.recovery.recover().await;

        assert!(fixture.store.list_active().is_empty());
        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let completed_dir = fixture
            ._dir
            .path()
            .join("tasks")
            .join("completed")
            .join(date);
        assert_eq!(
            std::fs::read_dir(completed_dir).expect("completed dir").count(),
            3
        );
    }

    #[tokio::test]
    async fn notifier_formats_sends_and_removes_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("recovery-event.json");
        let event = RecoveryEvent {
            timestamp: chrono::Utc::now().timestamp_millis() - 30_000,
            reason: "heartbeat stale".into(),
            restart_count: 2,
            watchdog_pid: 4242,
        };
        std::fs::write(&path, serde_json::to_string(&event).expect("serialise")).expect("write");

        let channels = Arc::new(ChannelManager::new());
        let channel = Arc::new(RecordingChannel::new("rec"));
        channels.register(channel.clone()).await;

        let notifier =
            RecoveryNotifier::new(path.clone(), vec!["rec:ops".into()], channels.clone());
        notifier.notify_if_restarted().await;

        let sent = channel.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "ops");
        assert!(sent[0].1.text.contains("heartbeat stale"));
        assert!(sent[0].1.text.contains("Restart number: 2"));
        assert!(!path.exists(), "event file consumed");

        // Second start: nothing to announce.
        notifier.notify_if_restarted().await;
        assert_eq!(channel.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn malformed_event_file_is_removed_without_sending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("recovery-event.json");
        std::fs::write(&path, "{ nope").expect("write");

        let channels = Arc::new(ChannelManager::new());
        let channel = Arc::new(RecordingChannel::new("rec"));
        channels.register(channel.clone()).await;

        let notifier = RecoveryNotifier::new(path.clone(), vec!["rec:ops".into()], channels);
        notifier.notify_if_restarted().await;

        assert!(channel.sent().await.is_empty());
        assert!(!path.exists());
    }
}
