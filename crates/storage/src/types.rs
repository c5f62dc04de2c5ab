use chrono::{DateTime, FixedOffset, Local};

use super::attachment::Attachment;
use super::ids::{MessageId, SessionId};

/// Display name carried on persisted user turns.
pub const USER_DISPLAY_NAME: &str = "User";
/// Display name carried on persisted assistant turns.
pub const ASSISTANT_DISPLAY_NAME: &str = "AI Assistant";

/// Persisted speaker role. History never stores system turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::User => USER_DISPLAY_NAME,
            Self::Assistant => ASSISTANT_DISPLAY_NAME,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub name: String,
    pub created_at: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub name: String,
    pub created_at: Option<DateTime<FixedOffset>>,
}

impl NewSession {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created_at: None,
        }
    }

    pub fn created_at(mut self, created_at: DateTime<FixedOffset>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub session_id: SessionId,
    pub role: MessageRole,
    pub name: String,
    pub content: String,
    pub files: Vec<Attachment>,
    pub timestamp: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub name: String,
    pub content: String,
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub files: Vec<Attachment>,
}

impl NewMessage {
    /// Builds a message whose display name follows its role.
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            name: role.display_name().to_string(),
            content: content.into(),
            timestamp: None,
            files: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<FixedOffset>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_files(mut self, files: Vec<Attachment>) -> Self {
        self.files = files;
        self
    }
}

/// Current wall-clock time in the local offset.
pub fn local_now() -> DateTime<FixedOffset> {
    Local::now().fixed_offset()
}
