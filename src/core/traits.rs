//! DI "Interfaces"

use crate::core::prompt::PromptInput;
use crate::error::{ChatError, GenerationError};
use crate::infrastructure::entities::{Message, MessageId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};

/// One user message and the reply it produced.
#[derive(Debug, Clone)]
pub struct Turn {
    pub user_message: Message,
    pub reply: Message,
}

#[async_trait]
pub trait ChatService: Send + Sync {
    /// Starts (or resumes) the user's conversation and returns what should be shown.
    ///
    /// Returns `Err` while another open or turn is in flight, or when the welcome message
    /// could not be produced.
    async fn open(&self, user: &UserId) -> Result<Vec<Message>, ChatError>;

    /// The stored transcript, oldest first.
    async fn history(&self, user: &UserId) -> Result<Vec<Message>, ChatError>;

    /// Appends the user's message and generates the persona's reply.
    ///
    /// Blank input is rejected before anything is stored or generated. `client_id` makes
    /// a resubmission of the same message idempotent.
    async fn submit(
        &self,
        user: &UserId,
        text: &str,
        client_id: Option<MessageId>,
    ) -> Result<Turn, ChatError>;

    /// Deletes one message. A blank id is rejected without contacting the store.
    async fn delete(&self, user: &UserId, id: &MessageId) -> Result<(), ChatError>;
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// The conversation opener. Needs no message or history.
    async fn generate_welcome(&self, input: &PromptInput) -> Result<String, GenerationError>;

    /// Reply to the latest user message. `message` and `chat_history` must be non-empty.
    async fn generate_reply(&self, input: &PromptInput) -> Result<String, GenerationError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}
