//! Runtime settings, read from the environment (and `.env`) once at startup.

use crate::core::prompt::{PromptVariant, RoleLabels};
use crate::error::ConfigError;
use crate::infrastructure::entities::UserId;
use chrono::FixedOffset;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";
const DEFAULT_CORS_ORIGINS: &str = "http://localhost:3000,http://localhost:5173";
const DEFAULT_USER_ID: &str = "katyayani";
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_FIRESTORE_BASE_URL: &str = "https://firestore.googleapis.com/v1";
/// Indian Standard Time.
const DEFAULT_UTC_OFFSET_MINUTES: i32 = 330;

#[derive(Debug, Clone)]
pub struct FirestoreSettings {
    pub base_url: String,
    pub project_id: String,
    pub database: String,
    pub api_key: Option<String>,
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StoreBackend {
    Memory,
    Sqlite { database_url: String },
    Firestore(FirestoreSettings),
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

/// Whether the transcript outlives the process. Follows from the store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationMode {
    /// Session-only transcript; every open starts over with a fresh welcome.
    Ephemeral,
    /// Durable transcript; a welcome is generated and stored only for an empty history.
    Persistent,
}

/// What happens to the user's message when the reply could not be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnFailurePolicy {
    Rollback,
    Keep,
}

impl FromStr for TurnFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rollback" => Ok(TurnFailurePolicy::Rollback),
            "keep" => Ok(TurnFailurePolicy::Keep),
            other => Err(format!("expected `rollback` or `keep`, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_address: SocketAddr,
    pub allowed_origins: Vec<String>,
    pub default_user: UserId,
    pub store: StoreBackend,
    pub model: ModelSettings,
    pub persona_file: Option<PathBuf>,
    pub prompt_variant: PromptVariant,
    pub failure_policy: TurnFailurePolicy,
    pub utc_offset: FixedOffset,
    pub knowledge_lookup: bool,
    pub role_labels: RoleLabels,
}

impl Settings {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Settings, ConfigError> {
        dotenvy::dotenv().ok();
        Settings::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Settings, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_address = parse_or(
            "BIND_ADDRESS",
            var("BIND_ADDRESS"),
            DEFAULT_BIND_ADDRESS,
        )?;

        let allowed_origins = var("CORS_ORIGINS")
            .unwrap_or_else(|| DEFAULT_CORS_ORIGINS.to_owned())
            .split(',')
            .map(|origin| origin.trim().to_owned())
            .filter(|origin| !origin.is_empty())
            .collect();

        let default_user = parse_or("NOOR_USER_ID", var("NOOR_USER_ID"), DEFAULT_USER_ID)?;

        let store = match var("STORE_BACKEND").as_deref().unwrap_or("memory") {
            "memory" => StoreBackend::Memory,
            "sqlite" => StoreBackend::Sqlite {
                database_url: var("DATABASE_URL").ok_or(ConfigError::Missing {
                    key: "DATABASE_URL",
                })?,
            },
            "firestore" => {
                let api_key = var("FIRESTORE_API_KEY");
                let bearer_token = var("FIRESTORE_BEARER_TOKEN");
                if api_key.is_none() && bearer_token.is_none() {
                    return Err(ConfigError::Missing {
                        key: "FIRESTORE_API_KEY",
                    });
                }

                StoreBackend::Firestore(FirestoreSettings {
                    base_url: var("FIRESTORE_BASE_URL")
                        .unwrap_or_else(|| DEFAULT_FIRESTORE_BASE_URL.to_owned()),
                    project_id: var("FIRESTORE_PROJECT_ID").ok_or(ConfigError::Missing {
                        key: "FIRESTORE_PROJECT_ID",
                    })?,
                    database: var("FIRESTORE_DATABASE").unwrap_or_else(|| "(default)".to_owned()),
                    api_key,
                    bearer_token,
                })
            }
            other => {
                return Err(ConfigError::Invalid {
                    key: "STORE_BACKEND",
                    value: other.to_owned(),
                    reason: "expected `memory`, `sqlite` or `firestore`".to_owned(),
                });
            }
        };

        let model = ModelSettings {
            api_key: var("GEMINI_API_KEY")
                .or_else(|| var("GOOGLE_API_KEY"))
                .ok_or(ConfigError::Missing {
                    key: "GEMINI_API_KEY",
                })?,
            model: var("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_owned()),
            base_url: var("GEMINI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_owned()),
        };

        let prompt_variant = parse_or("PROMPT_VARIANT", var("PROMPT_VARIANT"), "time-aware")?;

        let mode = match store {
            StoreBackend::Memory => ConversationMode::Ephemeral,
            _ => ConversationMode::Persistent,
        };
        let failure_policy = match var("TURN_FAILURE_POLICY") {
            Some(value) => parse("TURN_FAILURE_POLICY", value)?,
            None => match mode {
                ConversationMode::Ephemeral => TurnFailurePolicy::Rollback,
                ConversationMode::Persistent => TurnFailurePolicy::Keep,
            },
        };

        let offset_minutes: i32 = parse_or(
            "UTC_OFFSET_MINUTES",
            var("UTC_OFFSET_MINUTES"),
            &DEFAULT_UTC_OFFSET_MINUTES.to_string(),
        )?;
        let utc_offset = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| ConfigError::Invalid {
                key: "UTC_OFFSET_MINUTES",
                value: offset_minutes.to_string(),
                reason: "offset must be within ±24 hours".to_owned(),
            })?;

        let knowledge_lookup = parse_or("KNOWLEDGE_LOOKUP", var("KNOWLEDGE_LOOKUP"), "false")?;

        let defaults = RoleLabels::default();
        let role_labels = RoleLabels {
            user: var("USER_LABEL").unwrap_or(defaults.user),
            assistant: var("ASSISTANT_LABEL").unwrap_or(defaults.assistant),
        };

        Ok(Settings {
            bind_address,
            allowed_origins,
            default_user,
            store,
            model,
            persona_file: var("PERSONA_FILE").map(PathBuf::from),
            prompt_variant,
            failure_policy,
            utc_offset,
            knowledge_lookup,
            role_labels,
        })
    }

    pub fn mode(&self) -> ConversationMode {
        match self.store {
            StoreBackend::Memory => ConversationMode::Ephemeral,
            _ => ConversationMode::Persistent,
        }
    }
}

fn parse<T>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value,
    })
}

fn parse_or<T>(key: &'static str, value: Option<String>, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    parse(key, value.unwrap_or_else(|| default.to_owned()))
}
