//! Durable storage: append-only segmented history, the event journal,
//! and shared file primitives.
//!
//! Index and task files are written atomically (temp file + rename) so
//! an abrupt process death never leaves a half-written JSON document.
//! Segment files are plain JSONL appended in place.

pub mod history;
pub mod journal;

pub use history::{HistoryAppend, HistoryEntry, HistoryStore, SegmentIndex, SegmentMeta};
pub use journal::{Journal, JournalEntry, JournalEvent};

use crate::error::{Result, StorageError};
use serde::Serialize;
use std::path::Path;

/// Atomically replace `path` with the pretty-printed JSON of `value`.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().ok_or_else(|| StorageError::Write {
        path: path.display().to_string(),
        source: std::io::Error::other("path has no parent directory"),
    })?;
    std::fs::create_dir_all(dir).map_err(|source| StorageError::Write {
        path: dir.display().to_string(),
        source,
    })?;

    let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|source| StorageError::Write {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::to_writer_pretty(tmp.as_file(), value).map_err(|error| StorageError::Write {
        path: path.display().to_string(),
        source: std::io::Error::other(error),
    })?;
    tmp.persist(path).map_err(|error| StorageError::Write {
        path: path.display().to_string(),
        source: error.error,
    })?;

    Ok(())
}

/// Current time as ISO-8601 with millisecond precision.
pub(crate) fn now_iso() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Map an identifier onto a safe path component. Platform conversation
/// ids can contain separators and other hostile characters.
pub(crate) fn path_component(raw: &str) -> String {
    let component: String = raw
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '_' | '-') {
                character
            } else {
                '_'
            }
        })
        .collect();
    if component.is_empty() {
        "_".to_string()
    } else {
        component
    }
}
