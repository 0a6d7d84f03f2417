use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use lumen_types::{ChatMessage, ChatSession, MessageRole, NewMessage};

use crate::session_title::{
    derive_session_title_from_prompt, title_needs_derivation, SESSION_TITLE_MAX_CHARS,
};

const SESSIONS_FILE: &str = "sessions.json";

/// Durable append-only chat history.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_session(&self, title: Option<String>) -> anyhow::Result<ChatSession>;
    async fn get_session(&self, id: &str) -> Option<ChatSession>;
    async fn list_sessions(&self) -> Vec<ChatSession>;
    async fn append_message(
        &self,
        session_id: &str,
        message: NewMessage,
    ) -> anyhow::Result<ChatMessage>;
    /// Refreshes `updated_at`.
    async fn touch_session(&self, session_id: &str) -> anyhow::Result<ChatSession>;
    /// The newest `limit` messages, oldest first.
    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<ChatMessage>>;
    async fn count_messages_since(
        &self,
        role: MessageRole,
        since: DateTime<Utc>,
    ) -> anyhow::Result<usize>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSession {
    #[serde(flatten)]
    session: ChatSession,
    #[serde(default)]
    messages: Vec<ChatMessage>,
}

/// JSON-file store: an in-memory index flushed to `sessions.json` after every
/// write.
pub struct Storage {
    base: PathBuf,
    sessions: RwLock<HashMap<String, StoredSession>>,
}

impl Storage {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)
            .await
            .with_context(|| format!("failed to create storage dir {}", base.display()))?;
        let sessions_file = base.join(SESSIONS_FILE);
        let sessions = if sessions_file.exists() {
            let raw = fs::read_to_string(&sessions_file).await?;
            match serde_json::from_str::<HashMap<String, StoredSession>>(&raw) {
                Ok(parsed) => parsed,
                Err(err) => {
                    tracing::warn!(
                        path = %sessions_file.display(),
                        error = %err,
                        "sessions file is unreadable; starting with an empty index"
                    );
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        Ok(Self {
            base,
            sessions: RwLock::new(sessions),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub async fn message_count(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|s| s.messages.len())
            .unwrap_or(0)
    }

    /// Writes the index while the caller still holds the write lock, so a
    /// failed write can be undone before anyone observes it.
    async fn flush(&self, sessions: &HashMap<String, StoredSession>) -> anyhow::Result<()> {
        let payload = serde_json::to_string_pretty(sessions)?;
        fs::write(self.base.join(SESSIONS_FILE), payload).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for Storage {
    async fn create_session(&self, title: Option<String>) -> anyhow::Result<ChatSession> {
        let session = ChatSession::new(title);
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            session.id.clone(),
            StoredSession {
                session: session.clone(),
                messages: Vec::new(),
            },
        );
        if let Err(err) = self.flush(&sessions).await {
            sessions.remove(&session.id);
            return Err(err);
        }
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Option<ChatSession> {
        self.sessions.read().await.get(id).map(|s| s.session.clone())
    }

    async fn list_sessions(&self) -> Vec<ChatSession> {
        let mut sessions = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.session.clone())
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    async fn append_message(
        &self,
        session_id: &str,
        message: NewMessage,
    ) -> anyhow::Result<ChatMessage> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(session_id)
            .with_context(|| format!("session `{session_id}` not found for append_message"))?;
        let previous_title = stored.session.title.clone();
        let first_user_message = message.role == MessageRole::User
            && !stored.messages.iter().any(|m| m.role == MessageRole::User);
        if first_user_message && title_needs_derivation(&stored.session.title) {
            if let Some(title) =
                derive_session_title_from_prompt(&message.content, SESSION_TITLE_MAX_CHARS)
            {
                stored.session.title = title;
            }
        }
        // Keep creation order even if the wall clock steps backwards.
        let now = Utc::now();
        let created_at = stored
            .messages
            .last()
            .map(|last| last.created_at.max(now))
            .unwrap_or(now);
        let appended = message.into_message(created_at);
        stored.messages.push(appended.clone());
        if let Err(err) = self.flush(&sessions).await {
            if let Some(stored) = sessions.get_mut(session_id) {
                stored.messages.pop();
                stored.session.title = previous_title;
            }
            return Err(err);
        }
        Ok(appended)
    }

    async fn touch_session(&self, session_id: &str) -> anyhow::Result<ChatSession> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(session_id)
            .with_context(|| format!("session `{session_id}` not found for touch_session"))?;
        let previous = stored.session.updated_at;
        stored.session.updated_at = Utc::now().max(previous);
        let updated = stored.session.clone();
        if let Err(err) = self.flush(&sessions).await {
            if let Some(stored) = sessions.get_mut(session_id) {
                stored.session.updated_at = previous;
            }
            return Err(err);
        }
        Ok(updated)
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        let sessions = self.sessions.read().await;
        let stored = sessions
            .get(session_id)
            .with_context(|| format!("session `{session_id}` not found"))?;
        let skip = stored.messages.len().saturating_sub(limit);
        Ok(stored.messages[skip..].to_vec())
    }

    async fn count_messages_since(
        &self,
        role: MessageRole,
        since: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .flat_map(|s| s.messages.iter())
            .filter(|m| m.role == role && m.created_at >= since)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appended_messages_survive_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path()).await.expect("storage");
        let session = storage.create_session(None).await.expect("session");
        storage
            .append_message(&session.id, NewMessage::user("List common AD enumeration tools"))
            .await
            .expect("user message");
        storage
            .append_message(
                &session.id,
                NewMessage::assistant(
                    "BloodHound, PowerView, ...",
                    Some("OpenAI GPT-4o".to_string()),
                    Some(120),
                ),
            )
            .await
            .expect("assistant message");

        let reloaded = Storage::new(dir.path()).await.expect("reload");
        let messages = reloaded
            .recent_messages(&session.id, 20)
            .await
            .expect("messages");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].provider_name.as_deref(), Some("OpenAI GPT-4o"));
        assert_eq!(messages[1].tokens_used, Some(120));
        assert!(messages[0].created_at <= messages[1].created_at);
    }

    #[tokio::test]
    async fn title_is_derived_once_from_first_user_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path()).await.expect("storage");
        let session = storage.create_session(None).await.expect("session");
        assert_eq!(session.title, "New Chat");
        let long = "x".repeat(80);
        storage
            .append_message(&session.id, NewMessage::user(long))
            .await
            .expect("append");
        storage
            .append_message(&session.id, NewMessage::user("second question"))
            .await
            .expect("append");
        let title = storage.get_session(&session.id).await.expect("session").title;
        assert_eq!(title, format!("{}...", "x".repeat(50)));
    }

    #[tokio::test]
    async fn recent_messages_returns_newest_window_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path()).await.expect("storage");
        let session = storage.create_session(Some("ctx".to_string())).await.expect("session");
        for i in 0..25 {
            storage
                .append_message(&session.id, NewMessage::user(format!("m{i}")))
                .await
                .expect("append");
        }
        let window = storage.recent_messages(&session.id, 20).await.expect("window");
        assert_eq!(window.len(), 20);
        assert_eq!(window[0].content, "m5");
        assert_eq!(window[19].content, "m24");
    }

    #[tokio::test]
    async fn touch_refreshes_updated_at_and_unknown_session_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path()).await.expect("storage");
        let session = storage.create_session(None).await.expect("session");
        let touched = storage.touch_session(&session.id).await.expect("touch");
        assert!(touched.updated_at >= session.updated_at);
        assert!(storage.touch_session("ses-missing").await.is_err());
        assert!(storage
            .append_message("ses-missing", NewMessage::user("hi"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn counts_messages_by_role_since_a_point_in_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path()).await.expect("storage");
        let session = storage.create_session(None).await.expect("session");
        let before = Utc::now() - chrono::Duration::seconds(1);
        storage
            .append_message(&session.id, NewMessage::user("q"))
            .await
            .expect("append");
        storage
            .append_message(&session.id, NewMessage::assistant("a", None, None))
            .await
            .expect("append");
        let assistants = storage
            .count_messages_since(MessageRole::Assistant, before)
            .await
            .expect("count");
        assert_eq!(assistants, 1);
        let future = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(
            storage
                .count_messages_since(MessageRole::Assistant, future)
                .await
                .expect("count"),
            0
        );
    }

    #[tokio::test]
    async fn failed_write_leaves_no_message_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(dir.path()).await.expect("storage");
        let session = storage.create_session(None).await.expect("session");
        let sessions_file = dir.path().join(SESSIONS_FILE);
        std::fs::remove_file(&sessions_file).expect("remove");
        std::fs::create_dir(&sessions_file).expect("block file");

        assert!(storage
            .append_message(&session.id, NewMessage::user("lost on the way"))
            .await
            .is_err());
        assert_eq!(storage.message_count(&session.id).await, 0);
        let title = storage.get_session(&session.id).await.expect("session").title;
        assert_eq!(title, "New Chat");

        std::fs::remove_dir(&sessions_file).expect("unblock file");
        storage
            .append_message(&session.id, NewMessage::user("resubmitted"))
            .await
            .expect("append");
        let reloaded = Storage::new(dir.path()).await.expect("reload");
        let messages = reloaded.recent_messages(&session.id, 20).await.expect("messages");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "resubmitted");
    }

    #[tokio::test]
    async fn corrupt_sessions_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(SESSIONS_FILE), "{not json").expect("write");
        let storage = Storage::new(dir.path()).await.expect("storage");
        assert!(storage.list_sessions().await.is_empty());
        assert_eq!(storage.base_dir(), dir.path());
        assert_eq!(storage.message_count("ses-x").await, 0);
    }
}
