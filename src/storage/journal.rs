//! Append-only event journal.
//!
//! Same segment layout as the history store but with a simpler index
//! (`{segments: [{file, sizeBytes}]}`) whose tail size is cached in
//! memory and flushed only on rollover. Journal writes are
//! fire-and-forget: they log failures and never propagate errors to the
//! pipeline.

use crate::storage::{now_iso, path_component, write_json_atomic};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Pipeline lifecycle events recorded per task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalEvent {
    TaskReceived,
    PipelineStarted,
    HistoryAppended,
    LlmCallStarted,
    LlmCallCompleted,
    ToolCallStarted,
    ToolCallCompleted,
    VerificationStarted,
    VerificationResult,
    ResponseSent,
    TaskCompleted,
    TaskFailed,
    SkillDispatched,
}

/// One journal line. Every event carries enough identity to
/// reconstruct a task timeline from interleaved entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub ts: String,
    pub event: JournalEvent,
    pub task_id: String,
    pub channel_id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JournalIndex {
    segments: Vec<JournalSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JournalSegment {
    file: String,
    size_bytes: u64,
}

struct Tail {
    file: String,
    size_bytes: u64,
}

const INDEX_FILE: &str = "_index.json";

/// Journal rooted at `<data_root>/journal`.
pub struct Journal {
    root: PathBuf,
    enabled: bool,
    max_segment_size_bytes: u64,
    max_segments: usize,
    /// Cached tail segment per conversation key.
    tails: Mutex<HashMap<String, Tail>>,
}

impl Journal {
    pub fn new(
        root: impl Into<PathBuf>,
        enabled: bool,
        max_segment_size_bytes: u64,
        max_segments: usize,
    ) -> Self {
        Self {
            root: root.into(),
            enabled,
            max_segment_size_bytes,
            max_segments: max_segments.max(1),
            tails: Mutex::new(HashMap::new()),
        }
    }

    fn conversation_dir(&self, channel_id: &str, conversation_id: &str) -> PathBuf {
        self.root
            .join(path_component(channel_id))
            .join(path_component(conversation_id))
    }

    /// Record one event. Never fails: storage trouble is logged and
    /// swallowed so journaling can never take down a pipeline.
    pub async fn record(
        &self,
        event: JournalEvent,
        task_id: &str,
        channel_id: &str,
        conversation_id: &str,
        data: Value,
    ) {
        if !self.enabled {
            return;
        }

        let entry = JournalEntry {
            ts: now_iso(),
            event,
            task_id: task_id.to_string(),
            channel_id: channel_id.to_string(),
            conversation_id: conversation_id.to_string(),
            data,
        };

        if let Err(error) = self.append(&entry).await {
            tracing::warn!(%error, ?event, "journal write failed");
        }
    }

    async fn append(&self, entry: &JournalEntry) -> anyhow::Result<()> {
        let dir = self.conversation_dir(&entry.channel_id, &entry.conversation_id);
        std::fs::create_dir_all(&dir)?;

        let key = crate::conversation_key(&entry.channel_id, &entry.conversation_id);
        let line = serde_json::to_string(entry)?;
        let line_len = line.len() as u64 + 1;

        let mut tails = self.tails.lock().await;
        let tail = match tails.entry(key) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(self.load_tail(&dir)?)
            }
        };

        if tail.size_bytes >= self.max_segment_size_bytes {
            let rolled = self.rollover(&dir, tail)?;
            *tail = rolled;
        }

        let path = dir.join(&tail.file);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        tail.size_bytes += line_len;

        Ok(())
    }

    /// Resume the tail from the on-disk index, or start the first
    /// segment for a new conversation.
    fn load_tail(&self, dir: &Path) -> anyhow::Result<Tail> {
        let index = Self::read_index(dir);
        if let Some(last) = index.segments.last() {
            // The cached size may lag reality between rollovers; start
            // from the real file length when resuming.
            let size_bytes = std::fs::metadata(dir.join(&last.file))
                .map(|metadata| metadata.len())
                .unwrap_or(last.size_bytes);
            return Ok(Tail {
                file: last.file.clone(),
                size_bytes,
            });
        }

        let file = Self::new_segment_file(dir);
        let mut index = index;
        index.segments.push(JournalSegment {
            file: file.clone(),
            size_bytes: 0,
        });
        write_json_atomic(&dir.join(INDEX_FILE), &index)?;
        Ok(Tail {
            file,
            size_bytes: 0,
        })
    }

    /// Start a new segment: flush the finished tail's size into the
    /// index, evict the oldest segments past the cap, persist the index.
    fn rollover(&self, dir: &Path, finished: &Tail) -> anyhow::Result<Tail> {
        let mut index = Self::read_index(dir);
        if let Some(last) = index
            .segments
            .iter_mut()
            .find(|segment| segment.file == finished.file)
        {
            last.size_bytes = finished.size_bytes;
        }

        let file = Self::new_segment_file(dir);
        index.segments.push(JournalSegment {
            file: file.clone(),
            size_bytes: 0,
        });

        while index.segments.len() > self.max_segments {
            let evicted = index.segments.remove(0);
            let path = dir.join(&evicted.file);
            if let Err(error) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), %error, "failed to remove evicted journal segment");
            }
        }

        write_json_atomic(&dir.join(INDEX_FILE), &index)?;
        Ok(Tail {
            file,
            size_bytes: 0,
        })
    }

    fn read_index(dir: &Path) -> JournalIndex {
        match std::fs::read_to_string(dir.join(INDEX_FILE)) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|error| {
                tracing::warn!(dir = %dir.display(), %error, "corrupt journal index, starting fresh");
                JournalIndex::default()
            }),
            Err(_) => JournalIndex::default(),
        }
    }

    fn new_segment_file(dir: &Path) -> String {
        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%SZ");
        let base = format!("{stamp}.jsonl");
        if !dir.join(&base).exists() {
            return base;
        }
        for n in 1.. {
            let candidate = format!("{stamp}-{n}.jsonl");
            if !dir.join(&candidate).exists() {
                return candidate;
            }
        }
        unreachable!("suffix loop is unbounded");
    }

    /// Newest-first entries, optionally filtered by channel and
    /// conversation. Corrupt lines are skipped with a warning.
    pub async fn read_recent(
        &self,
        channel_id: Option<&str>,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Vec<JournalEntry> {
        let mut entries = Vec::new();

        let channel_dirs = match channel_id {
            Some(channel) => vec![self.root.join(path_component(channel))],
            None => list_dirs(&self.root),
        };

        for channel_dir in channel_dirs {
            let conversation_dirs = match conversation_id {
                Some(conversation) => vec![channel_dir.join(path_component(conversation))],
                None => list_dirs(&channel_dir),
            };

            for dir in conversation_dirs {
                let index = Self::read_index(&dir);
                for segment in &index.segments {
                    let path = dir.join(&segment.file);
                    let Ok(raw) = std::fs::read_to_string(&path) else {
                        continue;
                    };
                    for line in raw.lines() {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JournalEntry>(line) {
                            Ok(entry) => entries.push(entry),
                            Err(error) => {
                                tracing::warn!(path = %path.display(), %error, "skipping corrupt journal line");
                            }
                        }
                    }
                }
            }
        }

        // Stable ascending sort keeps append order for same-millisecond
        // entries, then reverse for newest-first.
        entries.sort_by(|a, b| a.ts.cmp(&b.ts));
        entries.reverse();
        entries.truncate(limit);
        entries
    }
}

fn list_dirs(root: &Path) -> Vec<PathBuf> {
    let Ok(read) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    read.flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn journal(dir: &Path, max_bytes: u64, max_segments: usize) -> Journal {
        Journal::new(dir.join("journal"), true, max_bytes, max_segments)
    }

    #[tokio::test]
    async fn records_and_reads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = journal(dir.path(), 4096, 4);

        journal
            .record(
                JournalEvent::PipelineStarted,
                "t1",
                "web",
                "c1",
                Value::Null,
            )
            .await;
        journal
            .record(
                JournalEvent::ResponseSent,
                "t1",
                "web",
                "c1",
                serde_json::json!({"length": 5}),
            )
            .await;

        let entries = journal.read_recent(Some("web"), Some("c1"), 10).await;
        assert_eq!(entries.len(), 2);
        // Newest first.
        assert_eq!(entries[0].event, JournalEvent::ResponseSent);
        assert_eq!(entries[0].data["length"], 5);
        assert_eq!(entries[1].task_id, "t1");
    }

    #[tokio::test]
    async fn rollover_caps_segments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = journal(dir.path(), 64, 2);

        for n in 0..40 {
            journal
                .record(
                    JournalEvent::ToolCallStarted,
                    &format!("task-{n}"),
                    "web",
                    "c1",
                    Value::Null,
                )
                .await;
        }

        let conversation_dir = dir.path().join("journal").join("web").join("c1");
        let segment_count = std::fs::read_dir(&conversation_dir)
            .expect("read dir")
            .flatten()
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .is_some_and(|extension| extension == "jsonl")
            })
            .count();
        assert!(segment_count <= 2, "found {segment_count} segments");
    }

    #[tokio::test]
    async fn disabled_journal_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = Journal::new(dir.path().join("journal"), false, 4096, 4);

        journal
            .record(JournalEvent::TaskReceived, "t1", "web", "c1", Value::Null)
            .await;

        assert!(!dir.path().join("journal").exists());
        assert!(journal.read_recent(None, None, 10).await.is_empty());
    }

    #[tokio::test]
    async fn filters_by_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = journal(dir.path(), 4096, 4);

        journal
            .record(JournalEvent::TaskReceived, "t1", "web", "c1", Value::Null)
            .await;
        journal
            .record(JournalEvent::TaskReceived, "t2", "telegram", "9", Value::Null)
            .await;

        let web_only = journal.read_recent(Some("web"), None, 10).await;
        assert_eq!(web_only.len(), 1);
        assert_eq!(web_only[0].channel_id, "web");

        let all = journal.read_recent(None, None, 10).await;
        assert_eq!(all.len(), 2);
    }
}
