//! Firestore REST backend.
//!
//! Messages live under `users/{user}/messages/{id}` as `{sender, text, timestamp}` documents,
//! with `timestamp` set by the server at write time.

use crate::config::FirestoreSettings;
use crate::error::StoreError;
use crate::infrastructure::entities::{Appended, Message, MessageId, NewMessage, Role, UserId};
use crate::infrastructure::traits::MessageStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{Value, json};

const COLLECTION: &str = "messages";

pub struct FirestoreMessageStore {
    client: Client,
    settings: FirestoreSettings,
}

impl FirestoreMessageStore {
    pub fn new(settings: FirestoreSettings) -> FirestoreMessageStore {
        FirestoreMessageStore {
            client: Client::new(),
            settings,
        }
    }

    /// `projects/{p}/databases/{d}/documents`
    fn root(&self) -> String {
        format!(
            "projects/{}/databases/{}/documents",
            self.settings.project_id, self.settings.database
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    fn user_path(&self, user: &UserId) -> String {
        format!("{}/users/{}", self.root(), user)
    }

    fn document_path(&self, user: &UserId, id: &MessageId) -> Result<String, StoreError> {
        if !id.is_valid() {
            return Err(StoreError::Malformed(format!(
                "message id `{id}` is not a document name"
            )));
        }
        Ok(format!("{}/{}/{}", self.user_path(user), COLLECTION, id))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = match &self.settings.api_key {
            Some(key) => request.query(&[("key", key)]),
            None => request,
        };
        match &self.settings.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get(&self, user: &UserId, id: &MessageId) -> Result<Option<Message>, StoreError> {
        let response = self
            .authorize(self.client.get(self.url(&self.document_path(user, id)?)))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let document: Value = checked(response).await?.json().await?;
        decode_document(&document).map(Some)
    }
}

async fn checked(response: Response) -> Result<Response, StoreError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await?;
        Err(StoreError::Remote { status, body })
    }
}

#[async_trait]
impl MessageStore for FirestoreMessageStore {
    async fn fetch_history(&self, user: &UserId) -> Result<Vec<Message>, StoreError> {
        let response = self
            .authorize(
                self.client
                    .post(self.url(&format!("{}:runQuery", self.user_path(user))))
                    .json(&history_query()),
            )
            .send()
            .await?;

        let rows: Vec<Value> = checked(response).await?.json().await?;
        rows.iter()
            .filter_map(|row| row.get("document"))
            .map(decode_document)
            .collect()
    }

    async fn insert(&self, user: &UserId, message: NewMessage) -> Result<Appended, StoreError> {
        let name = self.document_path(user, &message.id)?;
        let response = self
            .authorize(
                self.client
                    .post(self.url(&format!("{}:commit", self.root())))
                    .json(&create_write(&name, &message)),
            )
            .send()
            .await?;

        // An existing document means this is a retry of an earlier append.
        if matches!(
            response.status(),
            StatusCode::CONFLICT | StatusCode::BAD_REQUEST
        ) {
            if let Some(existing) = self.get(user, &message.id).await? {
                debug!("message {} already stored, returning existing record", message.id);
                return Ok(Appended {
                    message: existing,
                    inserted: false,
                });
            }
        }

        let commit: Value = checked(response).await?.json().await?;
        let created_at = commit_timestamp(&commit)?;

        Ok(Appended {
            message: message.into_message(created_at, true),
            inserted: true,
        })
    }

    async fn remove(&self, user: &UserId, id: &MessageId) -> Result<(), StoreError> {
        if id.is_blank() {
            return Err(StoreError::MissingIdentifier);
        }

        let response = self
            .authorize(self.client.delete(self.url(&self.document_path(user, id)?)))
            .send()
            .await?;
        checked(response).await?;

        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}

fn history_query() -> Value {
    json!({
        "structuredQuery": {
            "from": [{ "collectionId": COLLECTION }],
            "orderBy": [{ "field": { "fieldPath": "timestamp" }, "direction": "ASCENDING" }],
        }
    })
}

fn create_write(name: &str, message: &NewMessage) -> Value {
    json!({
        "writes": [{
            "update": {
                "name": name,
                "fields": {
                    "sender": { "stringValue": message.role.as_sender() },
                    "text": { "stringValue": message.content },
                },
            },
            "updateTransforms": [{ "fieldPath": "timestamp", "setToServerValue": "REQUEST_TIME" }],
            "currentDocument": { "exists": false },
        }]
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Malformed(format!("timestamp `{value}`: {e}")))
}

fn commit_timestamp(commit: &Value) -> Result<DateTime<Utc>, StoreError> {
    let value = commit["writeResults"][0]["transformResults"][0]["timestampValue"]
        .as_str()
        .or_else(|| commit["commitTime"].as_str())
        .ok_or_else(|| StoreError::Malformed("commit response without a timestamp".to_owned()))?;

    parse_timestamp(value)
}

fn decode_document(document: &Value) -> Result<Message, StoreError> {
    let name = document["name"]
        .as_str()
        .ok_or_else(|| StoreError::Malformed("document without a name".to_owned()))?;
    let id = name.rsplit('/').next().unwrap_or(name);

    let fields = &document["fields"];
    let sender = fields["sender"]["stringValue"].as_str().unwrap_or_default();
    let role = Role::from_sender(sender)
        .ok_or_else(|| StoreError::Malformed(format!("{id}: unknown sender `{sender}`")))?;
    let text = fields["text"]["stringValue"]
        .as_str()
        .ok_or_else(|| StoreError::Malformed(format!("{id}: missing text")))?;

    // A pending server timestamp is absent from reads; fall back to the document's creation.
    let timestamp = fields["timestamp"]["timestampValue"]
        .as_str()
        .or_else(|| document["createTime"].as_str())
        .ok_or_else(|| StoreError::Malformed(format!("{id}: missing timestamp")))?;

    Ok(Message {
        id: MessageId::new(id),
        role,
        content: text.to_owned(),
        created_at: parse_timestamp(timestamp)?,
        persisted: true,
    })
}
