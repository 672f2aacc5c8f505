//! Background task submission and lifecycle accounting.
//!
//! Each inbound message becomes one tracked tokio task. The manager
//! owns the active-task map and the per-conversation typing keepalive;
//! completion and failure both settle the persisted record and clean up
//! typing once the conversation has no other in-flight work.

use crate::channel::ChannelManager;
use crate::storage::{Journal, JournalEvent};
use crate::tasks::store::{PersistedTask, PhaseUpdate, TaskPhase, TaskStore};
use crate::{NormalizedMessage, OutgoingMessage};

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Typing refresh cadence; platforms time indicators out after ~5 s.
const TYPING_CADENCE: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

struct ActiveTask {
    channel_id: String,
    conversation_id: String,
    status: TaskRunStatus,
    started_at: String,
}

/// Dashboard view of one in-flight task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTaskSummary {
    pub id: String,
    pub channel_id: String,
    pub conversation_id: String,
    pub status: TaskRunStatus,
    pub started_at: String,
}

pub struct TaskManager {
    store: Arc<TaskStore>,
    journal: Arc<Journal>,
    channels: Arc<ChannelManager>,
    active: Mutex<HashMap<String, ActiveTask>>,
    /// One keepalive per conversation key, aborted when the last task
    /// for that conversation settles.
    typing: Mutex<HashMap<String, JoinHandle<()>>>,
    typing_cadence: Duration,
    persistence_enabled: bool,
}

impl TaskManager {
    pub fn new(
        store: Arc<TaskStore>,
        journal: Arc<Journal>,
        channels: Arc<ChannelManager>,
        persistence_enabled: bool,
    ) -> Self {
        Self {
            store,
            journal,
            channels,
            active: Mutex::new(HashMap::new()),
            typing: Mutex::new(HashMap::new()),
            typing_cadence: TYPING_CADENCE,
            persistence_enabled,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_typing_cadence(mut self, cadence: Duration) -> Self {
        self.typing_cadence = cadence;
        self
    }

    /// Submit pipeline work for an inbound message. Allocates the task
    /// id, records the active entry, persists the initial state, keeps
    /// the typing indicator alive, and launches the work concurrently.
    /// Returns the task id.
    pub async fn submit<F, Fut>(self: Arc<Self>, message: NormalizedMessage, pipeline: F) -> String
    where
        F: FnOnce(String, NormalizedMessage) -> Fut + Send + 'static,
        Fut: Future<Output = crate::Result<()>> + Send + 'static,
    {
        let task_id = uuid::Uuid::new_v4().to_string();

        self.journal
            .record(
                JournalEvent::TaskReceived,
                &task_id,
                &message.channel_id,
                &message.conversation_id,
                serde_json::json!({"messageId": message.id}),
            )
            .await;

        if self.persistence_enabled
            && let Err(error) = self.store.persist(&PersistedTask::new(&task_id, message.clone()))
        {
            tracing::warn!(task_id, %error, "failed to persist new task");
        }

        {
            let mut active = self.active.lock().await;
            active.insert(
                task_id.clone(),
                ActiveTask {
                    channel_id: message.channel_id.clone(),
                    conversation_id: message.conversation_id.clone(),
                    status: TaskRunStatus::Running,
                    started_at: crate::storage::now_iso(),
                },
            );
        }

        self.ensure_typing(&message).await;

        let manager = self;
        let spawned_id = task_id.clone();
        tokio::spawn(async move {
            let result = pipeline(spawned_id.clone(), message.clone()).await;
            manager.settle(&spawned_id, &message, result).await;
        });

        task_id
    }

    /// Advance the persisted phase for an in-flight task. Storage
    /// trouble here is logged, never fatal to the pipeline.
    pub fn update_phase(&self, task_id: &str, phase: TaskPhase, update: PhaseUpdate) {
        if !self.persistence_enabled {
            return;
        }
        if let Err(error) = self.store.update_phase(task_id, phase, update) {
            tracing::warn!(task_id, %phase, %error, "failed to persist task phase");
        }
    }

    async fn settle(&self, task_id: &str, message: &NormalizedMessage, result: crate::Result<()>) {
        match result {
            Ok(()) => {
                self.journal
                    .record(
                        JournalEvent::TaskCompleted,
                        task_id,
                        &message.channel_id,
                        &message.conversation_id,
                        serde_json::Value::Null,
                    )
                    .await;
                if self.persistence_enabled
                    && let Err(error) = self.store.complete(task_id)
                {
                    tracing::warn!(task_id, %error, "failed to move task to completed");
                }
            }
            Err(error) => {
                tracing::error!(task_id, %error, "pipeline task failed");
                self.journal
                    .record(
                        JournalEvent::TaskFailed,
                        task_id,
                        &message.channel_id,
                        &message.conversation_id,
                        serde_json::json!({"error": error.to_string()}),
                    )
                    .await;
                if self.persistence_enabled
                    && let Err(store_error) = self.store.fail(task_id, &error.to_string())
                {
                    tracing::warn!(task_id, %store_error, "failed to persist task failure");
                }
                self.send_error_reply(message, &error).await;
            }
        }

        let conversation_still_busy = {
            let mut active = self.active.lock().await;
            active.remove(task_id);
            active.values().any(|task| {
                task.channel_id == message.channel_id
                    && task.conversation_id == message.conversation_id
            })
        };

        if !conversation_still_busy {
            let key = message.conversation_key();
            let mut typing = self.typing.lock().await;
            if let Some(handle) = typing.remove(&key) {
                handle.abort();
            }
        }
    }

    /// Best-effort user-facing failure reply on the originating channel.
    async fn send_error_reply(&self, message: &NormalizedMessage, error: &crate::Error) {
        let Some(channel) = self.channels.get(&message.channel_id).await else {
            return;
        };
        let reply = OutgoingMessage::reply_to(
            format!("⚠ An error occurred processing your message: {error}"),
            message.platform_message_id.clone(),
        );
        if let Err(send_error) = channel
            .send_message(&message.conversation_id, reply)
            .await
        {
            tracing::warn!(channel = %message.channel_id, %send_error, "failed to send error reply");
        }
    }

    /// Start (or keep) the periodic typing emitter for the
    /// conversation. Emitter errors are swallowed.
    async fn ensure_typing(&self, message: &NormalizedMessage) {
        let key = message.conversation_key();
        let mut typing = self.typing.lock().await;
        if typing.contains_key(&key) {
            return;
        }

        let channels = self.channels.clone();
        let channel_id = message.channel_id.clone();
        let conversation_id = message.conversation_id.clone();
        let cadence = self.typing_cadence;

        let handle = tokio::spawn(async move {
            loop {
                if let Some(channel) = channels.get(&channel_id).await
                    && let Err(error) = channel.send_typing_indicator(&conversation_id).await
                {
                    tracing::debug!(channel = %channel_id, %error, "typing indicator failed");
                }
                tokio::time::sleep(cadence).await;
            }
        });
        typing.insert(key, handle);
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    pub async fn active_summaries(&self) -> Vec<ActiveTaskSummary> {
        let active = self.active.lock().await;
        let mut summaries: Vec<ActiveTaskSummary> = active
            .iter()
            .map(|(id, task)| ActiveTaskSummary {
                id: id.clone(),
                channel_id: task.channel_id.clone(),
                conversation_id: task.conversation_id.clone(),
                status: task.status,
                started_at: task.started_at.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        summaries
    }

    pub async fn has_typing(&self, key: &str) -> bool {
        self.typing.lock().await.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_support::RecordingChannel;
    use std::time::Duration;

    fn message(conversation: &str) -> NormalizedMessage {
        NormalizedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: "rec".into(),
            conversation_id: conversation.into(),
            sender_id: "u1".into(),
            sender_name: None,
            text: "hello".into(),
            timestamp: 1,
            platform_message_id: Some("p1".into()),
            attachments: Vec::new(),
        }
    }

    async fn manager_with_channel() -> (Arc<TaskManager>, Arc<RecordingChannel>, tempfile::TempDir)
    {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(TaskStore::new(dir.path().join("tasks")));
        let journal = Arc::new(Journal::new(dir.path().join("journal"), true, 1 << 20, 4));
        let channel = Arc::new(RecordingChannel::new("rec"));
        let channels = Arc::new(ChannelManager::new());
        channels.register(channel.clone()).await;
        let manager = Arc::new(
            TaskManager::new(store, journal, channels, true)
                .with_typing_cadence(Duration::from_millis(10)),
        );
        (manager, channel, dir)
    }

    #[tokio::test]
    async fn successful_task_completes_and_clears_typing() {
        let (manager, channel, _dir) = manager_with_channel().await;
        let message = message("c1");
        let key = message.conversation_key();

        manager
            .clone()
            .submit(message, |_task_id, _message| async { Ok(()) })
            .await;

        // Give the pipeline task a moment to settle.
        for _ in 0..50 {
            if manager.active_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(manager.active_count().await, 0);
        assert!(!manager.has_typing(&key).await);
        // No error reply on success.
        assert!(channel.sent().await.is_empty());
    }

    #[tokio::test]
    async fn failed_task_sends_error_reply() {
        let (manager, channel, _dir) = manager_with_channel().await;

        manager
            .clone()
            .submit(message("c1"), |_task_id, _message| async {
                Err(anyhow::anyhow!("boom").into())
            })
            .await;

        for _ in 0..50 {
            if !channel.sent().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let sent = channel.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(
            sent[0]
                .1
                .text
                .starts_with("⚠ An error occurred processing your message:")
        );
        assert_eq!(sent[0].1.reply_to_message_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn typing_survives_until_last_task_for_conversation() {
        let (manager, _channel, _dir) = manager_with_channel().await;
        let key = "rec:c1".to_string();

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        manager
            .clone()
            .submit(message("c1"), move |_task_id, _message| async move {
                let _ = release_rx.await;
                Ok(())
            })
            .await;
        manager
            .clone()
            .submit(message("c1"), |_task_id, _message| async { Ok(()) })
            .await;

        // The quick task settles while the slow one still runs.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.has_typing(&key).await, "typing stays while busy");

        release_tx.send(()).expect("release");
        for _ in 0..50 {
            if !manager.has_typing(&key).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!manager.has_typing(&key).await);
    }

    #[tokio::test]
    async fn typing_indicator_is_emitted_periodically() {
        let (manager, channel, _dir) = manager_with_channel().await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        manager
            .clone()
            .submit(message("c1"), move |_task_id, _message| async move {
                let _ = release_rx.await;
                Ok(())
            })
            .await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(channel.typing_count().await >= 2);
        release_tx.send(()).expect("release");
    }
}
