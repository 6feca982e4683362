//! Persona profile and its static knowledge table.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Returned by [`KnowledgeTable::lookup`] when no key matches.
pub const NO_MATCHING_FACT: &str = "No stored fact matches that question.";

const BUILTIN_PERSONA: &str = include_str!("../../persona/noor.json");

#[derive(Debug, thiserror::Error)]
pub enum PersonaError {
    #[error("cannot read persona file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse persona: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid persona: {0}")]
    Invalid(String),
}

/// Character, tone and memories the model is instructed to emulate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub name: String,
    pub creator: String,
    /// Whose way of talking the persona imitates.
    pub voice: String,
    /// The one person the persona talks to.
    pub companion: String,
    pub summary: String,
    #[serde(default)]
    pub tone: Vec<String>,
    #[serde(default)]
    pub memories: Vec<String>,
    #[serde(default)]
    pub behavior: Vec<String>,
    #[serde(default)]
    pub informative_answers: String,
    /// `HH:MM` at which the reply opens with `wish_opening`.
    #[serde(default)]
    pub wish_time: Option<String>,
    #[serde(default)]
    pub wish_opening: String,
    #[serde(default)]
    pub knowledge: KnowledgeTable,
}

impl PersonaProfile {
    pub fn builtin() -> Result<PersonaProfile, PersonaError> {
        PersonaProfile::from_json(BUILTIN_PERSONA)
    }

    pub async fn load(path: &Path) -> Result<PersonaProfile, PersonaError> {
        let json = tokio::fs::read_to_string(path).await?;
        PersonaProfile::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<PersonaProfile, PersonaError> {
        let persona: PersonaProfile = serde_json::from_str(json)?;
        persona.validate()?;
        Ok(persona)
    }

    fn validate(&self) -> Result<(), PersonaError> {
        if self.name.trim().is_empty() || self.companion.trim().is_empty() {
            return Err(PersonaError::Invalid(
                "name and companion must not be empty".to_owned(),
            ));
        }

        if let Some(entry) = self.knowledge.entries.iter().find(|e| e.key.trim().is_empty()) {
            return Err(PersonaError::Invalid(format!(
                "knowledge entry with empty key (fact: {})",
                entry.fact
            )));
        }

        if self.wish_time.is_some() && self.wish_opening.trim().is_empty() {
            return Err(PersonaError::Invalid(
                "wish_time needs a wish_opening".to_owned(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub key: String,
    pub fact: String,
}

/// Closed key → fact table. Keys are matched as substrings of the query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KnowledgeTable {
    entries: Vec<KnowledgeEntry>,
}

impl KnowledgeTable {
    pub fn new(entries: Vec<KnowledgeEntry>) -> KnowledgeTable {
        KnowledgeTable { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First fact whose key occurs in the query, ignoring case; [`NO_MATCHING_FACT`] otherwise.
    pub fn lookup(&self, query: &str) -> &str {
        let query = query.to_lowercase();

        self.entries
            .iter()
            .find(|e| query.contains(&e.key.to_lowercase()))
            .map(|e| e.fact.as_str())
            .unwrap_or(NO_MATCHING_FACT)
    }
}
