use crate::error::{ChatError, GenerationError, StoreError};
use crate::infrastructure::entities::UserId;
use async_trait::async_trait;
use axum::Json;
use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use log::warn;
use serde::Serialize;
use std::str::FromStr;

pub mod chat;

const X_USER_ID: &str = "X-User-ID";

const ERROR_TITLE: &str = "Uh oh! Something went wrong.";
pub const OPEN_FAILED: &str = "Could not start the conversation.";
pub const SEND_FAILED: &str = "There was a problem sending your message.";

#[derive(Debug)]
pub struct ExtractUser(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for ExtractUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Self, (StatusCode, &'static str)> {
        if let Some(user_id) = parts.headers.get(X_USER_ID) {
            let user_id = user_id
                .to_str()
                .map_err(|_| (StatusCode::BAD_REQUEST, "invalid user id"))?;
            let user_id = UserId::from_str(user_id)
                .map_err(|_| (StatusCode::BAD_REQUEST, "invalid user id"))?;
            Ok(ExtractUser(user_id))
        } else {
            Err((StatusCode::BAD_REQUEST, "`X-User-ID` header is missing"))
        }
    }
}

/// User-facing error notice.
#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub title: &'static str,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_message_kept: Option<schemas::Message>,
}

/// A [`ChatError`] together with the notice shown for it.
#[derive(Debug)]
pub struct ApiError {
    notice: &'static str,
    error: ChatError,
}

impl ApiError {
    pub fn new(notice: &'static str, error: ChatError) -> ApiError {
        ApiError { notice, error }
    }
}

fn status(error: &ChatError) -> StatusCode {
    match error {
        ChatError::EmptyMessage
        | ChatError::MissingIdentifier
        | ChatError::InvalidIdentifier(_)
        | ChatError::LastMessageNotFromUser
        | ChatError::Generation(GenerationError::MissingInput(_)) => StatusCode::BAD_REQUEST,
        ChatError::NotOpened
        | ChatError::TurnInFlight
        | ChatError::IdentifierInUse(_)
        | ChatError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
        ChatError::Store(_) | ChatError::Generation(_) => StatusCode::BAD_GATEWAY,
        ChatError::TurnFailed { source, .. } => status(source),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status(&self.error);
        warn!("{} ({status}): {}", self.notice, self.error);

        let (description, kept) = match self.error {
            ChatError::TurnFailed { kept, source } => (source.to_string(), kept),
            other => (other.to_string(), None),
        };
        let body = ErrorBody {
            title: ERROR_TITLE,
            description: format!("{} {description}", self.notice),
            user_message_kept: kept.map(schemas::Message::from),
        };

        (status, Json(body)).into_response()
    }
}

pub mod schemas {
    use crate::infrastructure::entities::{self, Role};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    pub struct Message {
        pub id: String,
        pub role: Role,
        pub content: String,
        pub created_at: DateTime<Utc>,
        pub persisted: bool,
    }

    impl From<entities::Message> for Message {
        fn from(message: entities::Message) -> Self {
            Message {
                id: message.id.as_str().to_owned(),
                role: message.role,
                content: message.content,
                created_at: message.created_at,
                persisted: message.persisted,
            }
        }
    }
}
