use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted chat message. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
}

/// Input for an append; id and timestamp are assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub provider_name: Option<String>,
    pub tokens_used: Option<u64>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            provider_name: None,
            tokens_used: None,
        }
    }

    pub fn assistant(
        content: impl Into<String>,
        provider_name: Option<String>,
        tokens_used: Option<u64>,
    ) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            provider_name,
            tokens_used,
        }
    }

    pub fn into_message(self, created_at: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id: format!("msg-{}", Uuid::new_v4()),
            role: self.role,
            content: self.content,
            created_at,
            provider_name: self.provider_name,
            tokens_used: self.tokens_used,
        }
    }
}
