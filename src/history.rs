//! Bounded per-user message history on disk.
//!
//! One JSON file per sanitized [`UserKey`](crate::state::UserKey) under a
//! configured directory (default `$HOME/.openclaw/pwa-chat-history/`).
//! Reads never fail — a missing or malformed file yields an empty history.
//! Writes are read-modify-write of the whole file (not crash-atomic, per
//! spec §9 "History file atomicity": a crash mid-write can truncate a
//! history file; this is a known, preserved limitation).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::state::UserKey;

/// Maximum number of messages retained per user.
pub const MAX_HISTORY: usize = 500;

/// A single persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub has_images: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub image_count: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Summary row returned by [`HistoryStore::list_sessions`].
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub message_count: usize,
    pub last_timestamp: u64,
}

/// Persists per-user ordered message logs, one file per sanitized user key.
pub struct HistoryStore {
    root: PathBuf,
}

/// Replace any byte outside `[A-Za-z0-9_-]` with `_`, per spec §3.
pub fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl HistoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, user_key: &UserKey) -> PathBuf {
        self.root.join(format!("{}.json", sanitize(&user_key.as_str())))
    }

    /// Read the full ordered history for a user. Never fails: a missing file
    /// or malformed JSON both yield an empty vec.
    pub async fn read_history(&self, user_key: &UserKey) -> Vec<StoredMessage> {
        let path = self.path_for(user_key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("history file {path:?} is malformed, treating as empty: {e}");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }

    /// Append a message, evicting the oldest until the log is at most
    /// [`MAX_HISTORY`] entries long. Creates the data directory on demand.
    pub async fn append_message(
        &self,
        user_key: &UserKey,
        msg: StoredMessage,
    ) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let mut messages = self.read_history(user_key).await;
        messages.push(msg);
        if messages.len() > MAX_HISTORY {
            let excess = messages.len() - MAX_HISTORY;
            messages.drain(0..excess);
        }
        let path = self.path_for(user_key);
        let body = serde_json::to_vec(&messages).expect("StoredMessage is always serializable");
        tokio::fs::write(&path, body).await
    }

    /// Enumerate sessions for a base user id by scanning the directory for
    /// files whose sanitized name equals `base_user_id` or starts with
    /// `base_user_id + "_"`.
    pub async fn list_sessions(&self, base_user_id: &str) -> Vec<SessionSummary> {
        let sanitized_base = sanitize(base_user_id);
        let mut out = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(_) => return out,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_name = entry.file_name();
            let Some(stem) = Path::new(&file_name)
                .file_stem()
                .and_then(|s| s.to_str())
            else {
                continue;
            };
            let session_id = if stem == sanitized_base {
                "default".to_string()
            } else if let Some(rest) = stem.strip_prefix(&format!("{sanitized_base}_")) {
                rest.to_string()
            } else {
                continue;
            };

            let bytes = match tokio::fs::read(entry.path()).await {
                Ok(b) => b,
                Err(_) => continue,
            };
            let messages: Vec<StoredMessage> = serde_json::from_slice(&bytes).unwrap_or_default();
            let last_timestamp = messages.last().map_or(0, |m| m.timestamp);
            out.push(SessionSummary {
                session_id,
                message_count: messages.len(),
                last_timestamp,
            });
        }

        out.sort_by(|a, b| b.last_timestamp.cmp(&a.last_timestamp));
        out
    }

    /// Delete a session's history file. Returns whether it existed.
    pub async fn delete_session(&self, base_user_id: &str, session_id: &str) -> bool {
        let user_key = UserKey::new(base_user_id, session_id);
        let path = self.path_for(&user_key);
        tokio::fs::remove_file(&path).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, ts: u64, role: MessageRole) -> StoredMessage {
        StoredMessage {
            id: id.to_string(),
            text: "hi".to_string(),
            timestamp: ts,
            role,
            media_url: None,
            has_images: None,
            image_count: None,
        }
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize("alice:bob/../x"), "alice_bob___x");
        assert_eq!(sanitize("alice-bob_42"), "alice-bob_42");
    }

    #[tokio::test]
    async fn read_history_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        let key = UserKey::new("u1", "default");
        assert!(store.read_history(&key).await.is_empty());
    }

    #[tokio::test]
    async fn append_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        let key = UserKey::new("u1", "default");
        store
            .append_message(&key, msg("m1", 1, MessageRole::User))
            .await
            .unwrap();
        store
            .append_message(&key, msg("m2", 2, MessageRole::Assistant))
            .await
            .unwrap();
        let history = store.read_history(&key).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, "m1");
        assert_eq!(history[1].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn append_evicts_oldest_past_max_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        let key = UserKey::new("u1", "default");
        for i in 0..(MAX_HISTORY + 1) {
            store
                .append_message(
                    &key,
                    msg(&format!("msg-{i}"), i as u64, MessageRole::User),
                )
                .await
                .unwrap();
        }
        let history = store.read_history(&key).await;
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history.first().unwrap().id, "msg-1");
        assert_eq!(history.last().unwrap().id, format!("msg-{MAX_HISTORY}"));
    }

    #[tokio::test]
    async fn list_sessions_finds_default_and_named_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        store
            .append_message(&UserKey::new("u1", "default"), msg("a", 10, MessageRole::User))
            .await
            .unwrap();
        store
            .append_message(&UserKey::new("u1", "work"), msg("b", 20, MessageRole::User))
            .await
            .unwrap();

        let sessions = store.list_sessions("u1").await;
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, "work");
        assert_eq!(sessions[1].session_id, "default");
    }

    #[tokio::test]
    async fn delete_session_reports_existence() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        let key = UserKey::new("u1", "default");
        store
            .append_message(&key, msg("a", 1, MessageRole::User))
            .await
            .unwrap();
        assert!(store.delete_session("u1", "default").await);
        assert!(!store.delete_session("u1", "default").await);
    }
}
