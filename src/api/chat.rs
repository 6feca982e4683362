//! Chat endpoints

use crate::api::schemas::Message;
use crate::api::{ApiError, ExtractUser, OPEN_FAILED, SEND_FAILED};
use crate::config::Settings;
use crate::core::persona::PersonaProfile;
use crate::core::traits::ChatService;
use crate::infrastructure::entities::MessageId;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use di_axum::Inject;
use schemas::{MessagesList, PostMessage, SessionInfo, TurnResult};

pub fn router() -> Router {
    Router::new()
        .route("/open", post(open_conversation))
        .route("/messages", get(list_messages).post(post_message))
        .route("/messages/:id", delete(delete_message))
}

/// Who the single-tenant page talks as, and to whom.
pub async fn session(
    Inject(settings): Inject<Settings>,
    Inject(persona): Inject<PersonaProfile>,
) -> Json<SessionInfo> {
    Json(SessionInfo {
        user_id: settings.default_user.to_string(),
        persona: persona.name.clone(),
        mode: settings.mode(),
        prompt_variant: settings.prompt_variant,
    })
}

async fn open_conversation(
    Inject(chat_service): Inject<dyn ChatService>,
    ExtractUser(current_user): ExtractUser,
) -> Result<Json<MessagesList>, ApiError> {
    let messages = chat_service
        .open(&current_user)
        .await
        .map_err(|e| ApiError::new(OPEN_FAILED, e))?;

    Ok(Json(MessagesList::from(messages)))
}

async fn list_messages(
    Inject(chat_service): Inject<dyn ChatService>,
    ExtractUser(current_user): ExtractUser,
) -> Result<Json<MessagesList>, ApiError> {
    let messages = chat_service
        .history(&current_user)
        .await
        .map_err(|e| ApiError::new(OPEN_FAILED, e))?;

    Ok(Json(MessagesList::from(messages)))
}

async fn post_message(
    Inject(chat_service): Inject<dyn ChatService>,
    ExtractUser(current_user): ExtractUser,
    Json(message): Json<PostMessage>,
) -> Result<Json<TurnResult>, ApiError> {
    let turn = chat_service
        .submit(
            &current_user,
            &message.text,
            message.client_id.map(MessageId::new),
        )
        .await
        .map_err(|e| ApiError::new(SEND_FAILED, e))?;

    Ok(Json(TurnResult {
        user_message: Message::from(turn.user_message),
        reply: Message::from(turn.reply),
    }))
}

async fn delete_message(
    Inject(chat_service): Inject<dyn ChatService>,
    ExtractUser(current_user): ExtractUser,
    Path(message_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    chat_service
        .delete(&current_user, &MessageId::new(message_id))
        .await
        .map_err(|e| ApiError::new(SEND_FAILED, e))?;

    Ok(StatusCode::NO_CONTENT)
}

pub mod schemas {
    use crate::api::schemas::Message;
    use crate::config::ConversationMode;
    use crate::core::prompt::PromptVariant;
    use crate::infrastructure::entities;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Debug)]
    pub struct SessionInfo {
        pub user_id: String,
        pub persona: String,
        pub mode: ConversationMode,
        pub prompt_variant: PromptVariant,
    }

    #[derive(Serialize, Debug, Default)]
    pub struct MessagesList {
        pub messages: Vec<Message>,
    }

    impl From<Vec<entities::Message>> for MessagesList {
        fn from(messages: Vec<entities::Message>) -> Self {
            MessagesList {
                messages: messages.into_iter().map(Message::from).collect(),
            }
        }
    }

    #[derive(Deserialize, Debug)]
    pub struct PostMessage {
        pub text: String,
        /// Lets a retried submit land on the same stored message.
        pub client_id: Option<String>,
    }

    #[derive(Serialize, Debug)]
    pub struct TurnResult {
        pub user_message: Message,
        pub reply: Message,
    }
}
