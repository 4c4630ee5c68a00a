use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::ids::{MessageId, SessionId};

/// Title given to sessions created before any message has been sent.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One persisted conversation thread as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub created_at_unix_millis: u64,
    pub updated_at_unix_millis: u64,
    #[serde(default)]
    pub message_count: u64,
}

impl Session {
    pub fn new(id: SessionId, title: impl Into<String>, updated_at_unix_millis: u64) -> Self {
        Self {
            id,
            title: title.into(),
            created_at_unix_millis: updated_at_unix_millis,
            updated_at_unix_millis,
            message_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub created_at_unix_millis: u64,
}

impl Message {
    pub fn new(
        id: MessageId,
        role: MessageRole,
        content: impl Into<String>,
        created_at_unix_millis: u64,
    ) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            created_at_unix_millis,
        }
    }

    /// Builds the local stand-in for a user message that is still in flight.
    pub fn optimistic_user(content: impl Into<String>) -> Self {
        Self::new(
            MessageId::local(),
            MessageRole::User,
            content,
            current_unix_timestamp_millis(),
        )
    }

    pub fn is_optimistic(&self) -> bool {
        self.id.is_local()
    }
}

pub(crate) fn current_unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        })
}
