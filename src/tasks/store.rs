//! Durable task state.
//!
//! Every in-flight task owns exactly one file under `tasks/active/`;
//! terminal tasks move to `tasks/completed/<YYYY-MM-DD>/`. All writes
//! are atomic so recovery after a crash sees whole documents only.

use crate::NormalizedMessage;
use crate::error::{Result, StorageError};
use crate::storage::{now_iso, write_json_atomic};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Pipeline phase recorded for crash recovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Received,
    HistoryWritten,
    LlmCalling,
    Verifying,
    Responding,
    Completed,
    Failed,
}

impl TaskPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskPhase::Received => "received",
            TaskPhase::HistoryWritten => "history_written",
            TaskPhase::LlmCalling => "llm_calling",
            TaskPhase::Verifying => "verifying",
            TaskPhase::Responding => "responding",
            TaskPhase::Completed => "completed",
            TaskPhase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// On-disk task record: the inbound message snapshot plus phase
/// bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTask {
    pub id: String,
    pub channel_id: String,
    pub conversation_id: String,
    pub message: NormalizedMessage,
    pub phase: TaskPhase,
    pub started_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_response: Option<String>,
}

impl PersistedTask {
    pub fn new(id: impl Into<String>, message: NormalizedMessage) -> Self {
        let now = now_iso();
        Self {
            id: id.into(),
            channel_id: message.channel_id.clone(),
            conversation_id: message.conversation_id.clone(),
            message,
            phase: TaskPhase::Received,
            started_at: now.clone(),
            updated_at: now,
            error: None,
            pending_response: None,
        }
    }
}

/// Optional fields carried by a phase transition.
#[derive(Debug, Clone, Default)]
pub struct PhaseUpdate {
    pub pending_response: Option<String>,
    pub error: Option<String>,
}

/// File-backed task store rooted at `<data_root>/tasks`.
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn active_dir(&self) -> PathBuf {
        self.root.join("active")
    }

    fn active_path(&self, task_id: &str) -> PathBuf {
        self.active_dir().join(format!("{task_id}.json"))
    }

    /// Create the active file for a freshly-received task.
    pub fn persist(&self, task: &PersistedTask) -> Result<()> {
        write_json_atomic(&self.active_path(&task.id), task)
    }

    /// Read the active record for a task.
    pub fn read_active(&self, task_id: &str) -> Result<PersistedTask> {
        let path = self.active_path(task_id);
        let raw = std::fs::read_to_string(&path).map_err(|_| StorageError::TaskNotFound {
            id: task_id.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|error| {
            StorageError::Corrupt {
                path: path.display().to_string(),
                detail: error.to_string(),
            }
            .into()
        })
    }

    /// Advance the persisted phase, read-modify-write on the active
    /// file.
    pub fn update_phase(&self, task_id: &str, phase: TaskPhase, update: PhaseUpdate) -> Result<()> {
        let mut task = self.read_active(task_id)?;
        task.phase = phase;
        task.updated_at = now_iso();
        if update.pending_response.is_some() {
            task.pending_response = update.pending_response;
        }
        if update.error.is_some() {
            task.error = update.error;
        }
        write_json_atomic(&self.active_path(task_id), &task)
    }

    /// Move the task from `active/` to `completed/<YYYY-MM-DD>/`.
    pub fn complete(&self, task_id: &str) -> Result<()> {
        let mut task = self.read_active(task_id)?;
        if !matches!(task.phase, TaskPhase::Completed | TaskPhase::Failed) {
            task.phase = TaskPhase::Completed;
        }
        task.updated_at = now_iso();

        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let completed_path = self
            .root
            .join("completed")
            .join(date)
            .join(format!("{task_id}.json"));
        write_json_atomic(&completed_path, &task)?;

        let active = self.active_path(task_id);
        std::fs::remove_file(&active).map_err(|source| StorageError::Write {
            path: active.display().to_string(),
            source,
        })?;
        Ok(())
    }

    /// Mark the task failed with an error, then move it to completed.
    pub fn fail(&self, task_id: &str, error: &str) -> Result<()> {
        self.update_phase(
            task_id,
            TaskPhase::Failed,
            PhaseUpdate {
                error: Some(error.to_string()),
                ..PhaseUpdate::default()
            },
        )?;
        self.complete(task_id)
    }

    /// Every parseable record under `active/`. Unreadable files are
    /// skipped with a warning so recovery never aborts.
    pub fn list_active(&self) -> Vec<PersistedTask> {
        let dir = self.active_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };

        let mut tasks = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|extension| extension.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str::<PersistedTask>(&raw).map_err(Into::into));
            match parsed {
                Ok(task) => tasks.push(task),
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "skipping unreadable active task");
                }
            }
        }
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        tasks
    }

    /// Count of files under `active/` (dashboard surface).
    pub fn active_count(&self) -> usize {
        std::fs::read_dir(self.active_dir())
            .map(|entries| entries.flatten().count())
            .unwrap_or(0)
    }
}
