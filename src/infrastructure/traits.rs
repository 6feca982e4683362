//! Infrastructure traits, used for DI on higher levels

use crate::error::{ModelError, StoreError};
use crate::infrastructure::entities::{Appended, Message, MessageId, NewMessage, UserId};
use crate::infrastructure::model::{ModelReply, ModelRequest};
use async_trait::async_trait;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// All messages of the user's conversation, oldest first. Ties keep insertion order.
    async fn fetch_history(&self, user: &UserId) -> Result<Vec<Message>, StoreError>;

    /// Appends a message and returns it with the store-assigned timestamp.
    ///
    /// Appending an id that already exists returns the stored record instead of a duplicate,
    /// with `inserted` set to `false`.
    async fn insert(&self, user: &UserId, message: NewMessage) -> Result<Appended, StoreError>;

    /// [`MessageStore::insert`] for callers that do not care whether the record is new.
    async fn append(&self, user: &UserId, message: NewMessage) -> Result<Message, StoreError> {
        Ok(self.insert(user, message).await?.message)
    }

    /// Deletes exactly one message. A blank id is rejected without contacting the backend;
    /// an unknown id is a no-op.
    async fn remove(&self, user: &UserId, id: &MessageId) -> Result<(), StoreError>;

    /// Drops the whole conversation. Only session stores support this.
    async fn clear(&self, _user: &UserId) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("clear"))
    }

    /// Whether messages survive a restart.
    fn is_durable(&self) -> bool;
}

/// The hosted model, seen as an opaque prompt in, text or tool call out.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<ModelReply, ModelError>;
}
