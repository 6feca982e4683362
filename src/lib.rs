//! Noor chat server - library exports for the binary and tests

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod infrastructure;

use crate::config::{Settings, StoreBackend};
use crate::core::assistant::PersonaAssistant;
use crate::core::persona::PersonaProfile;
use crate::core::prompt::PromptTemplates;
use crate::core::services::ChatController;
use crate::core::session::SessionRegistry;
use crate::core::traits::Clock;
use crate::error::StoreError;
use crate::infrastructure::database::DatabaseConnection;
use crate::infrastructure::firestore::FirestoreMessageStore;
use crate::infrastructure::repositories::{MemoryMessageStore, SqliteMessageStore};
use crate::infrastructure::traits::{LanguageModel, MessageStore};
use di::{Injectable, Ref, ServiceCollection, singleton_factory};

/// A connected message store backend, ready to be registered.
pub enum Backend {
    Memory,
    Sqlite(DatabaseConnection),
    Firestore(FirestoreMessageStore),
}

impl Backend {
    pub async fn connect(store: &StoreBackend) -> Result<Backend, StoreError> {
        Ok(match store {
            StoreBackend::Memory => Backend::Memory,
            StoreBackend::Sqlite { database_url } => {
                Backend::Sqlite(DatabaseConnection::connect(database_url).await?)
            }
            StoreBackend::Firestore(settings) => {
                Backend::Firestore(FirestoreMessageStore::new(settings.clone()))
            }
        })
    }
}

/// Everything the service collection is built from.
pub struct Components {
    pub settings: Settings,
    pub persona: PersonaProfile,
    pub model: Ref<dyn LanguageModel>,
    pub clock: Ref<dyn Clock>,
    pub backend: Backend,
}

impl Components {
    /// Registers the chat stack. Fails only when the prompt templates do not compile.
    pub fn into_services(self) -> Result<ServiceCollection, minijinja::Error> {
        let templates = Ref::new(PromptTemplates::new(
            self.settings.prompt_variant,
            &self.persona,
            self.settings.knowledge_lookup,
        )?);
        let settings = Ref::new(self.settings);
        let persona = Ref::new(self.persona);
        let model = self.model;
        let clock = self.clock;

        let mut services = ServiceCollection::new();
        services
            .add(singleton_factory::<Settings, _>(move |_| settings.clone()))
            .add(singleton_factory::<PersonaProfile, _>(move |_| persona.clone()))
            .add(singleton_factory::<PromptTemplates, _>(move |_| templates.clone()))
            .add(singleton_factory::<dyn LanguageModel, _>(move |_| model.clone()))
            .add(singleton_factory::<dyn Clock, _>(move |_| clock.clone()))
            .add(SessionRegistry::singleton())
            .add(PersonaAssistant::scoped())
            .add(ChatController::scoped());

        match self.backend {
            Backend::Memory => {
                services.add(MemoryMessageStore::singleton());
            }
            Backend::Sqlite(connection) => {
                let connection = Ref::new(connection);
                services
                    .add(singleton_factory::<DatabaseConnection, _>(move |_| {
                        connection.clone()
                    }))
                    .add(SqliteMessageStore::scoped());
            }
            Backend::Firestore(store) => {
                let store: Ref<dyn MessageStore> = Ref::new(store);
                services.add(singleton_factory::<dyn MessageStore, _>(move |_| store.clone()));
            }
        }

        Ok(services)
    }
}
