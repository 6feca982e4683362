//! Conversation entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Role {
    User = 1,
    Assistant = 2,
}

impl Role {
    /// Value of the `sender` field in stored documents.
    pub fn as_sender(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Parses a stored `sender` value. Older documents used other names for the bot side.
    pub fn from_sender(sender: &str) -> Option<Role> {
        match sender {
            "user" => Some(Role::User),
            "assistant" | "bot" | "ai" | "model" | "noor" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// Opaque message identifier, assigned by whoever creates the message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> MessageId {
        MessageId(Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> MessageId {
        MessageId(id.into())
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Whether the id can be used as a single document path segment.
    pub fn is_valid(&self) -> bool {
        is_path_segment(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies whose conversation is addressed. Used verbatim as a document path segment,
/// so the character set is restricted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(try_from = "String", into = "String")]
#[sqlx(transparent)]
pub struct UserId(String);

const MAX_ID_LEN: usize = 128;

/// Ids end up verbatim in document paths, so only `[A-Za-z0-9_-]` is allowed.
fn is_path_segment(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_ID_LEN
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid user id `{0}`")]
pub struct InvalidUserId(pub String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for UserId {
    type Err = InvalidUserId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if is_path_segment(s) {
            Ok(UserId(s.to_owned()))
        } else {
            Err(InvalidUserId(s.to_owned()))
        }
    }
}

impl TryFrom<String> for UserId {
    type Error = InvalidUserId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UserId> for String {
    fn from(user: UserId) -> Self {
        user.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored (or session-only) chat message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Whether the store holding this message survives a restart.
    pub persisted: bool,
}

/// What an append left in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Appended {
    pub message: Message,
    /// `false` when a record with the same id already existed and was returned as is.
    pub inserted: bool,
}

/// A message about to be appended. The store assigns the timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> NewMessage {
        NewMessage {
            id: MessageId::generate(),
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> NewMessage {
        NewMessage {
            id: MessageId::generate(),
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Replaces the generated id, e.g. with one supplied by a retrying client.
    pub fn with_id(mut self, id: Option<MessageId>) -> NewMessage {
        if let Some(id) = id.filter(|id| !id.is_blank()) {
            self.id = id;
        }
        self
    }

    pub fn into_message(self, created_at: DateTime<Utc>, persisted: bool) -> Message {
        Message {
            id: self.id,
            role: self.role,
            content: self.content,
            created_at,
            persisted,
        }
    }
}
