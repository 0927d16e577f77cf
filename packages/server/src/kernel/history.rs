//! Per-actor session transcripts.
//!
//! Terminal replies are mirrored into `<data>/sessions/<role>/<actor>/` so
//! clients can list and reopen past conversations without replaying job
//! event logs. One JSONL transcript per session plus a capped `index.json`
//! ordered by recency.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::safe_fs_id;
use crate::kernel::fs_atomic::{atomic_write_json, read_json_opt};
use crate::kernel::jobs::Role;

const PREVIEW_MAX_CHARS: usize = 200;

/// One line in a session transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub ts: DateTime<Utc>,
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// One row in a per-actor session index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionIndexEntry {
    pub session_id: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub preview: String,
    #[serde(default)]
    pub message_count: u64,
}

pub struct SessionHistory {
    root: PathBuf,
    index_max_items: usize,
}

impl SessionHistory {
    pub fn new(root: PathBuf, index_max_items: usize) -> Self {
        Self {
            root,
            index_max_items: index_max_items.max(1),
        }
    }

    fn actor_dir(&self, role: Role, actor_id: &str) -> PathBuf {
        self.root
            .join(role.as_str())
            .join(safe_fs_id(actor_id, role.as_str()))
    }

    fn session_path(&self, role: Role, actor_id: &str, session_id: &str) -> PathBuf {
        self.actor_dir(role, actor_id)
            .join(format!("{}.jsonl", safe_fs_id(session_id, "session")))
    }

    fn index_path(&self, role: Role, actor_id: &str) -> PathBuf {
        self.actor_dir(role, actor_id).join("index.json")
    }

    /// Append one message to a session transcript.
    pub fn append_message(
        &self,
        role: Role,
        actor_id: &str,
        session_id: &str,
        message: &SessionMessage,
    ) -> Result<()> {
        let path = self.session_path(role, actor_id, session_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Touch the session index: bump recency, preview, and message count.
    pub fn update_index(
        &self,
        role: Role,
        actor_id: &str,
        session_id: &str,
        preview: &str,
        message_increment: u64,
    ) -> Result<()> {
        let path = self.index_path(role, actor_id);
        let mut items: Vec<SessionIndexEntry> = read_json_opt(&path).unwrap_or_default();

        let idx = match items.iter().position(|e| e.session_id == session_id) {
            Some(idx) => idx,
            None => {
                items.push(SessionIndexEntry {
                    session_id: session_id.to_string(),
                    updated_at: Utc::now(),
                    preview: String::new(),
                    message_count: 0,
                });
                items.len() - 1
            }
        };
        let entry = &mut items[idx];
        entry.updated_at = Utc::now();
        if !preview.is_empty() {
            entry.preview = truncate_chars(preview, PREVIEW_MAX_CHARS);
        }
        entry.message_count += message_increment;

        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        items.truncate(self.index_max_items);
        atomic_write_json(&path, &items)
    }

    /// Load a transcript, skipping malformed lines.
    pub fn load_session(
        &self,
        role: Role,
        actor_id: &str,
        session_id: &str,
    ) -> Vec<SessionMessage> {
        let path = self.session_path(role, actor_id, session_id);
        load_jsonl(&path)
    }

    pub fn load_index(&self, role: Role, actor_id: &str) -> Vec<SessionIndexEntry> {
        read_json_opt(&self.index_path(role, actor_id)).unwrap_or_default()
    }
}

fn load_jsonl(path: &Path) -> Vec<SessionMessage> {
    let Ok(text) = fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|line| serde_json::from_str(line.trim()).ok())
        .collect()
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> (tempfile::TempDir, SessionHistory) {
        let dir = tempfile::tempdir().unwrap();
        let history = SessionHistory::new(dir.path().join("sessions"), 500);
        (dir, history)
    }

    fn message(role: &str, content: &str) -> SessionMessage {
        SessionMessage {
            ts: Utc::now(),
            role: role.to_string(),
            content: content.to_string(),
            job_id: None,
        }
    }

    #[test]
    fn test_append_and_load() {
        let (_dir, history) = history();
        history
            .append_message(Role::Student, "s1", "sess", &message("user", "hi"))
            .unwrap();
        history
            .append_message(Role::Student, "s1", "sess", &message("assistant", "hello"))
            .unwrap();

        let messages = history.load_session(Role::Student, "s1", "sess");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, "assistant");
    }

    #[test]
    fn test_index_updates_and_sorts() {
        let (_dir, history) = history();
        history
            .update_index(Role::Teacher, "t1", "old-session", "first", 2)
            .unwrap();
        history
            .update_index(Role::Teacher, "t1", "new-session", "second", 2)
            .unwrap();
        history
            .update_index(Role::Teacher, "t1", "old-session", "third", 2)
            .unwrap();

        let index = history.load_index(Role::Teacher, "t1");
        assert_eq!(index.len(), 2);
        assert_eq!(index[0].session_id, "old-session");
        assert_eq!(index[0].message_count, 4);
        assert_eq!(index[0].preview, "third");
    }

    #[test]
    fn test_index_capped() {
        let (dir, _) = history();
        let history = SessionHistory::new(dir.path().join("sessions"), 3);
        for i in 0..6 {
            history
                .update_index(Role::Student, "s1", &format!("sess-{i}"), "p", 1)
                .unwrap();
        }
        assert_eq!(history.load_index(Role::Student, "s1").len(), 3);
    }

    #[test]
    fn test_preview_truncated() {
        let (_dir, history) = history();
        let long = "x".repeat(500);
        history
            .update_index(Role::Student, "s1", "sess", &long, 1)
            .unwrap();
        let index = history.load_index(Role::Student, "s1");
        assert_eq!(index[0].preview.chars().count(), 200);
    }

    #[test]
    fn test_actors_are_isolated() {
        let (_dir, history) = history();
        history
            .append_message(Role::Student, "s1", "sess", &message("user", "a"))
            .unwrap();
        assert!(history.load_session(Role::Student, "s2", "sess").is_empty());
        assert!(history.load_session(Role::Teacher, "s1", "sess").is_empty());
    }
}
