//! Message store backends: SQLite and per-process session memory.

use crate::error::StoreError;
use crate::infrastructure::database::DatabaseConnection;
use crate::infrastructure::entities::{Appended, Message, MessageId, NewMessage, Role, UserId};
use crate::infrastructure::traits::MessageStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use di::{Ref, inject, injectable};
use log::debug;
use sqlx::FromRow;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, FromRow)]
struct MessageRow {
    id: MessageId,
    sender: Role,
    text: String,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message {
            id: row.id,
            role: row.sender,
            content: row.text,
            created_at: row.created_at,
            persisted: true,
        }
    }
}

#[injectable(MessageStore)]
pub struct SqliteMessageStore {
    connection: Ref<DatabaseConnection>,
}

impl SqliteMessageStore {
    pub fn new(connection: Ref<DatabaseConnection>) -> SqliteMessageStore {
        SqliteMessageStore { connection }
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn fetch_history(&self, user: &UserId) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, sender, text, created_at FROM messages WHERE user_id = ? ORDER BY created_at ASC, seq ASC",
        )
        .bind(user)
        .fetch_all(&**self.connection)
        .await?;

        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn insert(&self, user: &UserId, message: NewMessage) -> Result<Appended, StoreError> {
        let result = sqlx::query(
            "INSERT INTO messages (id, user_id, sender, text, created_at) VALUES (?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(&message.id)
        .bind(user)
        .bind(message.role)
        .bind(&message.content)
        .bind(Utc::now())
        .execute(&**self.connection)
        .await?;

        let inserted = result.rows_affected() > 0;
        if !inserted {
            debug!("message {} already stored, returning existing record", message.id);
        }

        let stored: Option<MessageRow> = sqlx::query_as(
            "SELECT id, sender, text, created_at FROM messages WHERE id = ? AND user_id = ?",
        )
        .bind(&message.id)
        .bind(user)
        .fetch_optional(&**self.connection)
        .await?;

        let message = stored
            .map(Message::from)
            .ok_or_else(|| StoreError::Conflict(message.id.to_string()))?;

        Ok(Appended { message, inserted })
    }

    async fn remove(&self, user: &UserId, id: &MessageId) -> Result<(), StoreError> {
        if id.is_blank() {
            return Err(StoreError::MissingIdentifier);
        }

        let result = sqlx::query("DELETE FROM messages WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user)
            .execute(&**self.connection)
            .await?;

        if result.rows_affected() == 0 {
            debug!("no message {id} for {user}, nothing deleted");
        }

        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}

/// Keeps each user's transcript in process memory for the lifetime of the server.
#[derive(Default)]
pub struct MemoryMessageStore {
    conversations: Mutex<HashMap<UserId, Vec<Message>>>,
}

#[injectable(MessageStore)]
impl MemoryMessageStore {
    #[inject]
    pub fn create() -> MemoryMessageStore {
        MemoryMessageStore::default()
    }
}

impl MemoryMessageStore {
    fn conversations(&self) -> MutexGuard<'_, HashMap<UserId, Vec<Message>>> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn fetch_history(&self, user: &UserId) -> Result<Vec<Message>, StoreError> {
        Ok(self.conversations().get(user).cloned().unwrap_or_default())
    }

    async fn insert(&self, user: &UserId, message: NewMessage) -> Result<Appended, StoreError> {
        let mut conversations = self.conversations();
        let transcript = conversations.entry(user.clone()).or_default();

        if let Some(existing) = transcript.iter().find(|m| m.id == message.id) {
            return Ok(Appended {
                message: existing.clone(),
                inserted: false,
            });
        }

        // Keep timestamps monotonic so ordering by time and by insertion agree.
        let mut created_at = Utc::now();
        if let Some(last) = transcript.last() {
            created_at = created_at.max(last.created_at);
        }

        let stored = message.into_message(created_at, false);
        transcript.push(stored.clone());
        Ok(Appended {
            message: stored,
            inserted: true,
        })
    }

    async fn remove(&self, user: &UserId, id: &MessageId) -> Result<(), StoreError> {
        if id.is_blank() {
            return Err(StoreError::MissingIdentifier);
        }

        if let Some(transcript) = self.conversations().get_mut(user) {
            transcript.retain(|m| &m.id != id);
        }

        Ok(())
    }

    async fn clear(&self, user: &UserId) -> Result<(), StoreError> {
        self.conversations().remove(user);
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        "katyayani".parse().unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_keeps_insertion_order() {
        let store = MemoryMessageStore::create();
        store.append(&user(), NewMessage::user("one")).await.unwrap();
        store.append(&user(), NewMessage::assistant("two")).await.unwrap();
        store.append(&user(), NewMessage::user("three")).await.unwrap();

        let history = store.fetch_history(&user()).await.unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["one", "two", "three"]);
        assert!(history.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert!(history.iter().all(|m| !m.persisted));
    }

    #[tokio::test]
    async fn test_memory_store_append_is_idempotent() {
        let store = MemoryMessageStore::create();
        let id = MessageId::new("fixed");
        let first = store
            .insert(&user(), NewMessage::user("hello").with_id(Some(id.clone())))
            .await
            .unwrap();
        let second = store
            .insert(&user(), NewMessage::assistant("other").with_id(Some(id)))
            .await
            .unwrap();

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(first.message, second.message);
        assert_eq!(second.message.role, Role::User);
        assert_eq!(store.fetch_history(&user()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_remove_deletes_only_target() {
        let store = MemoryMessageStore::create();
        let keep = store.append(&user(), NewMessage::user("keep")).await.unwrap();
        let drop = store.append(&user(), NewMessage::user("drop")).await.unwrap();

        store.remove(&user(), &drop.id).await.unwrap();

        assert_eq!(store.fetch_history(&user()).await.unwrap(), vec![keep]);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_blank_id() {
        let store = MemoryMessageStore::create();
        let result = store.remove(&user(), &MessageId::new("")).await;
        assert!(matches!(result, Err(StoreError::MissingIdentifier)));
    }

    #[tokio::test]
    async fn test_memory_store_isolates_users() {
        let store = MemoryMessageStore::create();
        let other: UserId = "someone-else".parse().unwrap();
        store.append(&user(), NewMessage::user("mine")).await.unwrap();

        assert!(store.fetch_history(&other).await.unwrap().is_empty());

        store.clear(&user()).await.unwrap();
        assert!(store.fetch_history(&user()).await.unwrap().is_empty());
    }
}
