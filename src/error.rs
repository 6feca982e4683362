//! Error types for each layer.

use crate::infrastructure::entities::Message;
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("document store returned {status}: {body}")]
    Remote { status: StatusCode, body: String },

    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("message id must not be empty")]
    MissingIdentifier,

    #[error("message id `{0}` belongs to another conversation")]
    Conflict(String),

    #[error("{0} is not supported by this store")]
    Unsupported(&'static str),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model API returned {status}: {body}")]
    Api { status: StatusCode, body: String },

    #[error("model returned no candidates: {}", .0.as_deref().unwrap_or("no reason given"))]
    Empty(Option<String>),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("template: {0}")]
    Template(#[from] minijinja::Error),

    #[error("`{0}` is required for a reply")]
    MissingInput(&'static str),

    #[error("model output does not match the declared shape: {0}")]
    MalformedOutput(String),

    #[error("model kept calling tools after {0} lookups")]
    TooManyToolCalls(usize),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message is empty")]
    EmptyMessage,

    #[error("message id is missing")]
    MissingIdentifier,

    #[error("message id `{0}` may only use letters, digits, `-` and `_`")]
    InvalidIdentifier(String),

    #[error("message id `{0}` already names a different message")]
    IdentifierInUse(String),

    #[error("last message must be from the user")]
    LastMessageNotFromUser,

    #[error("conversation has not been opened")]
    NotOpened,

    #[error("a turn is already in flight")]
    TurnInFlight,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("turn failed: {source}")]
    TurnFailed {
        /// The user message still in the transcript, if the failure policy kept it.
        kept: Option<Message>,
        #[source]
        source: Box<ChatError>,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} must be set")]
    Missing { key: &'static str },

    #[error("{key} has invalid value `{value}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}
