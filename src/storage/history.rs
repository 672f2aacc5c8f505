//! Segmented JSONL conversation history.
//!
//! One directory per `(channelId, conversationId)` holding bounded-size
//! segment files plus an `_index.json` describing them. Entries carry a
//! contiguous 1-based `seq` per conversation; segments are appended in
//! place and the index is replaced atomically after every append.
//!
//! Appends for one conversation must be serialised by the caller (the
//! conversation mutex); the store itself keeps no locks.

use crate::error::{Result, StorageError};
use crate::llm::ChatRole;
use crate::storage::{path_component, write_json_atomic};

use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// One persisted history line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// 1-based, contiguous per conversation.
    pub seq: u64,
    /// ISO-8601 timestamp.
    pub ts: String,
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

/// Caller-supplied fields of a new entry; `seq` and `ts` are assigned
/// by the store.
#[derive(Debug, Clone, Default)]
pub struct HistoryAppend {
    pub role: ChatRole,
    pub content: String,
    pub tool_call_id: Option<String>,
    pub sender_id: Option<String>,
    pub platform_message_id: Option<String>,
    pub task_id: Option<String>,
}

impl HistoryAppend {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            ..Self::default()
        }
    }
}

/// Metadata for one segment file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentMeta {
    pub file: String,
    pub first_seq: u64,
    pub last_seq: u64,
    pub count: u64,
    pub size_bytes: u64,
    pub started_at: String,
    pub ended_at: String,
}

/// The per-conversation index: ordered segments with contiguous seq
/// ranges, and the next seq to assign.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentIndex {
    pub next_seq: u64,
    pub segments: Vec<SegmentMeta>,
}

impl Default for SegmentIndex {
    fn default() -> Self {
        Self {
            next_seq: 1,
            segments: Vec::new(),
        }
    }
}

const INDEX_FILE: &str = "_index.json";

/// Append-only history store rooted at `<data_root>/history`.
pub struct HistoryStore {
    root: PathBuf,
    max_segment_size_bytes: u64,
    max_segments: usize,
}

impl HistoryStore {
    pub fn new(root: impl Into<PathBuf>, max_segment_size_bytes: u64, max_segments: usize) -> Self {
        Self {
            root: root.into(),
            max_segment_size_bytes,
            max_segments: max_segments.max(1),
        }
    }

    fn conversation_dir(&self, channel_id: &str, conversation_id: &str) -> PathBuf {
        self.root
            .join(path_component(channel_id))
            .join(path_component(conversation_id))
    }

    fn read_index(dir: &Path) -> Result<SegmentIndex> {
        let path = dir.join(INDEX_FILE);
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|error| {
                StorageError::Corrupt {
                    path: path.display().to_string(),
                    detail: error.to_string(),
                }
                .into()
            }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Ok(SegmentIndex::default())
            }
            Err(source) => Err(StorageError::Write {
                path: path.display().to_string(),
                source,
            }
            .into()),
        }
    }

    /// Allocate a segment file name from the write timestamp,
    /// disambiguating same-second collisions with a numeric suffix.
    fn new_segment_file(dir: &Path, at: chrono::DateTime<chrono::Utc>) -> String {
        let stamp = at.format("%Y-%m-%dT%H-%M-%SZ");
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

    /// Append one entry, assigning its `seq` and `ts`. Returns the
    /// persisted entry.
    pub fn append(
        &self,
        channel_id: &str,
        conversation_id: &str,
        append: HistoryAppend,
    ) -> Result<HistoryEntry> {
        self.append_at(channel_id, conversation_id, append, chrono::Utc::now())
    }

    /// Append with an explicit timestamp. Normal writes stamp the wall
    /// clock; legacy migration stamps the source file's mtime.
    fn append_at(
        &self,
        channel_id: &str,
        conversation_id: &str,
        append: HistoryAppend,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<HistoryEntry> {
        let dir = self.conversation_dir(channel_id, conversation_id);
        std::fs::create_dir_all(&dir).map_err(|source| StorageError::Write {
            path: dir.display().to_string(),
            source,
        })?;

        let mut index = Self::read_index(&dir)?;
        let now = at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

        // Rollover decides on the last-persisted size, so bytes appended
        // after a crash-before-index-flush stay invisible but bounded.
        let needs_new_segment = index
            .segments
            .last()
            .map(|segment| segment.size_bytes >= self.max_segment_size_bytes)
            .unwrap_or(true);
        if needs_new_segment {
            let file = Self::new_segment_file(&dir, at);
            index.segments.push(SegmentMeta {
                file,
                first_seq: index.next_seq,
                last_seq: index.next_seq.saturating_sub(1),
                count: 0,
                size_bytes: 0,
                started_at: now.clone(),
                ended_at: now.clone(),
            });
        }

        let entry = HistoryEntry {
            seq: index.next_seq,
            ts: now.clone(),
            role: append.role,
            content: append.content,
            tool_call_id: append.tool_call_id,
            sender_id: append.sender_id,
            platform_message_id: append.platform_message_id,
            task_id: append.task_id,
        };

        let line = serde_json::to_string(&entry)
            .map_err(|error| StorageError::Other(error.into()))?;
        let segment = index
            .segments
            .last_mut()
            .ok_or_else(|| StorageError::Other(anyhow::anyhow!("segment list empty after rollover")))?;

        let segment_path = dir.join(&segment.file);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&segment_path)
            .map_err(|source| StorageError::Write {
                path: segment_path.display().to_string(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .map_err(|source| StorageError::Write {
                path: segment_path.display().to_string(),
                source,
            })?;

        segment.last_seq = entry.seq;
        segment.count += 1;
        segment.size_bytes += line.len() as u64 + 1;
        segment.ended_at = now;
        index.next_seq = entry.seq + 1;

        while index.segments.len() > self.max_segments {
            let evicted = index.segments.remove(0);
            let evicted_path = dir.join(&evicted.file);
            if let Err(error) = std::fs::remove_file(&evicted_path) {
                tracing::warn!(path = %evicted_path.display(), %error, "failed to remove evicted history segment");
            }
        }

        write_json_atomic(&dir.join(INDEX_FILE), &index)?;
        Ok(entry)
    }

    /// Return the trailing `limit` entries in sequence order. Walks
    /// segments newest-first, reading whole files until enough entries
    /// are collected. Corrupt lines are skipped with a warning.
    pub fn get_messages(
        &self,
        channel_id: &str,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        let dir = self.conversation_dir(channel_id, conversation_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let index = Self::read_index(&dir)?;

        let mut collected: Vec<HistoryEntry> = Vec::new();
        for segment in index.segments.iter().rev() {
            let path = dir.join(&segment.file);
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "failed to read history segment");
                    continue;
                }
            };

            for line in raw.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<HistoryEntry>(line) {
                    // Lines past the indexed range are crash orphans;
                    // readers trust the index.
                    Ok(entry) if entry.seq >= segment.first_seq && entry.seq <= segment.last_seq => {
                        collected.push(entry);
                    }
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(path = %path.display(), %error, "skipping corrupt history line");
                    }
                }
            }

            if collected.len() >= limit {
                break;
            }
        }

        collected.sort_by_key(|entry| entry.seq);
        if collected.len() > limit {
            collected.drain(..collected.len() - limit);
        }
        Ok(collected)
    }

    /// Remove every segment and the index for a conversation.
    pub fn clear(&self, channel_id: &str, conversation_id: &str) -> Result<()> {
        let dir = self.conversation_dir(channel_id, conversation_id);
        if !dir.exists() {
            return Ok(());
        }
        let index = Self::read_index(&dir).unwrap_or_default();
        for segment in &index.segments {
            let path = dir.join(&segment.file);
            if let Err(error) = std::fs::remove_file(&path)
                && error.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(path = %path.display(), %error, "failed to remove history segment");
            }
        }
        let index_path = dir.join(INDEX_FILE);
        if let Err(error) = std::fs::remove_file(&index_path)
            && error.kind() != std::io::ErrorKind::NotFound
        {
            return Err(StorageError::Write {
                path: index_path.display().to_string(),
                source: error,
            }
            .into());
        }
        Ok(())
    }

    /// Conversation ids (path components) known for a channel.
    pub fn list_conversations(&self, channel_id: &str) -> Result<Vec<String>> {
        let dir = self.root.join(path_component(channel_id));
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut conversations = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|source| StorageError::Write {
            path: dir.display().to_string(),
            source,
        })? {
            let Ok(entry) = entry else { continue };
            if entry.path().is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                conversations.push(name.to_string());
            }
        }
        conversations.sort();
        Ok(conversations)
    }

    /// Expose the index for invariant checks and the dashboard.
    pub fn index(&self, channel_id: &str, conversation_id: &str) -> Result<SegmentIndex> {
        Self::read_index(&self.conversation_dir(channel_id, conversation_id))
    }

    /// Replay a legacy flat-JSON history tree
    /// (`<legacy>/<channelId>/<conversationId>.json`) into the segment
    /// format, then rename the legacy directory to `<path>.bak`. Runs
    /// only when the new root is empty. Per-file errors are counted and
    /// logged, never aborting the migration.
    pub fn migrate_legacy(&self, legacy_root: &Path) -> Result<()> {
        if !legacy_root.exists() || self.root.exists() {
            return Ok(());
        }

        #[derive(Deserialize)]
        struct LegacyEntry {
            role: ChatRole,
            content: String,
            #[serde(default)]
            tool_call_id: Option<String>,
        }

        let mut migrated = 0usize;
        let mut failed = 0usize;

        for channel_entry in std::fs::read_dir(legacy_root).map_err(|source| StorageError::Write {
            path: legacy_root.display().to_string(),
            source,
        })? {
            let Ok(channel_entry) = channel_entry else {
                failed += 1;
                continue;
            };
            if !channel_entry.path().is_dir() {
                continue;
            }
            let channel_id = channel_entry.file_name().to_string_lossy().to_string();

            let files = match std::fs::read_dir(channel_entry.path()) {
                Ok(files) => files,
                Err(error) => {
                    tracing::warn!(channel = %channel_id, %error, "failed to list legacy channel directory");
                    failed += 1;
                    continue;
                }
            };

            for file_entry in files.flatten() {
                let path = file_entry.path();
                if path.extension().and_then(|extension| extension.to_str()) != Some("json") {
                    continue;
                }
                let conversation_id = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
                    .unwrap_or_default();

                // The legacy files carry no per-entry timestamps; the
                // file mtime stands in for every entry and for the
                // segment bounds.
                let outcome = (|| -> anyhow::Result<()> {
                    let modified = std::fs::metadata(&path)?.modified()?;
                    let mtime = chrono::DateTime::<chrono::Utc>::from(modified);

                    let raw = std::fs::read_to_string(&path)?;
                    let entries: Vec<LegacyEntry> = serde_json::from_str(&raw)?;
                    for legacy in entries {
                        self.append_at(
                            &channel_id,
                            &conversation_id,
                            HistoryAppend {
                                role: legacy.role,
                                content: legacy.content,
                                tool_call_id: legacy.tool_call_id,
                                ..HistoryAppend::default()
                            },
                            mtime,
                        )?;
                    }
                    Ok(())
                })();

                match outcome {
                    Ok(()) => migrated += 1,
                    Err(error) => {
                        tracing::warn!(path = %path.display(), %error, "failed to migrate legacy history file");
                        failed += 1;
                    }
                }
            }
        }

        let backup = legacy_root.with_extension("bak");
        if let Err(error) = std::fs::rename(legacy_root, &backup) {
            tracing::warn!(%error, "failed to rename legacy history directory");
        }
        tracing::info!(migrated, failed, "legacy history migration finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path, max_bytes: u64, max_segments: usize) -> HistoryStore {
        HistoryStore::new(dir.join("history"), max_bytes, max_segments)
    }

    fn append_text(store: &HistoryStore, text: &str) -> HistoryEntry {
        store
            .append("web", "c1", HistoryAppend::new(ChatRole::User, text))
            .expect("append")
    }

    #[test]
    fn add_then_get_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path(), 1024, 4);

        append_text(&store, "hello there");
        let messages = store.get_messages("web", "c1", 1).expect("read");

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello there");
        assert_eq!(messages[0].role, ChatRole::User);
        assert_eq!(messages[0].seq, 1);
    }

    #[test]
    fn seq_is_contiguous_and_index_consistent() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Segments roll over every couple of entries but nothing evicts.
        let store = store(dir.path(), 200, 10);

        for n in 0..12 {
            append_text(&store, &format!("message number {n}"));
        }

        let index = store.index("web", "c1").expect("index");
        assert!(index.segments.len() > 1, "small segments must roll over");
        assert_eq!(index.segments[0].first_seq, 1);
        for pair in index.segments.windows(2) {
            assert_eq!(pair[0].last_seq + 1, pair[1].first_seq);
        }
        assert_eq!(
            index.next_seq,
            index.segments.last().expect("segments").last_seq + 1
        );

        let messages = store.get_messages("web", "c1", 100).expect("read");
        let seqs: Vec<u64> = messages.iter().map(|entry| entry.seq).collect();
        assert_eq!(seqs, (1..=12).collect::<Vec<u64>>());
    }

    #[test]
    fn eviction_drops_oldest_segments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path(), 32, 2);

        for n in 0..9 {
            append_text(&store, &format!("evict me please {n}"));
        }

        let index = store.index("web", "c1").expect("index");
        assert!(index.segments.len() <= 2);
        // Oldest entries are gone but the tail survives in order.
        let messages = store.get_messages("web", "c1", 100).expect("read");
        assert!(messages.first().expect("entries").seq > 1);
        let seqs: Vec<u64> = messages.iter().map(|entry| entry.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
    }

    #[test]
    fn get_messages_returns_trailing_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path(), 4096, 4);

        for n in 0..5 {
            append_text(&store, &format!("m{n}"));
        }

        let tail = store.get_messages("web", "c1", 2).expect("read");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].content, "m3");
        assert_eq!(tail[1].content, "m4");
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path(), 4096, 4);

        append_text(&store, "good");
        let index = store.index("web", "c1").expect("index");
        let segment_path = dir
            .path()
            .join("history")
            .join("web")
            .join("c1")
            .join(&index.segments[0].file);

        // Orphan bytes past the indexed range must stay invisible.
        let mut raw = std::fs::read_to_string(&segment_path).expect("read segment");
        raw.push_str("{not json}\n");
        std::fs::write(&segment_path, raw).expect("rewrite segment");

        let messages = store.get_messages("web", "c1", 10).expect("read");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "good");
    }

    #[test]
    fn clear_empties_the_conversation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path(), 4096, 4);

        append_text(&store, "to be removed");
        store.clear("web", "c1").expect("clear");

        assert!(store.get_messages("web", "c1", 10).expect("read").is_empty());
        // A fresh conversation restarts at seq 1.
        let entry = append_text(&store, "fresh start");
        assert_eq!(entry.seq, 1);
    }

    #[test]
    fn list_conversations_names_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(dir.path(), 4096, 4);

        store
            .append("web", "alpha", HistoryAppend::new(ChatRole::User, "a"))
            .expect("append");
        store
            .append("web", "beta", HistoryAppend::new(ChatRole::User, "b"))
            .expect("append");

        assert_eq!(
            store.list_conversations("web").expect("list"),
            vec!["alpha".to_string(), "beta".to_string()]
        );
    }

    #[test]
    fn migrates_legacy_flat_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let legacy = dir.path().join("legacy");
        std::fs::create_dir_all(legacy.join("telegram")).expect("mkdir");
        let legacy_file = legacy.join("telegram").join("42.json");
        std::fs::write(
            &legacy_file,
            r#"[{"role":"user","content":"old question"},{"role":"assistant","content":"old answer"}]"#,
        )
        .expect("write legacy");

        // The migration stamps everything with the source file's mtime;
        // capture it before the directory is renamed away.
        let modified = std::fs::metadata(&legacy_file)
            .expect("metadata")
            .modified()
            .expect("mtime");
        let expected_ts = chrono::DateTime::<chrono::Utc>::from(modified)
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

        let store = store(dir.path(), 4096, 4);
        store.migrate_legacy(&legacy).expect("migrate");

        let messages = store.get_messages("telegram", "42", 10).expect("read");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].seq, 1);
        assert_eq!(messages[1].content, "old answer");
        assert!(messages.iter().all(|entry| entry.ts == expected_ts));

        let index = store.index("telegram", "42").expect("index");
        assert_eq!(index.segments[0].started_at, expected_ts);
        assert_eq!(index.segments[0].ended_at, expected_ts);

        assert!(!legacy.exists());
        assert!(dir.path().join("legacy.bak").exists());
    }
}
