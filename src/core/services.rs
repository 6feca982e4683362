//! Implementations for the service the app needs.
//!

use crate::config::{ConversationMode, Settings, TurnFailurePolicy};
use crate::core::prompt::{Moment, PromptInput, PromptVariant, serialize_history};
use crate::core::session::{SessionPhase, SessionRegistry};
use crate::core::traits::{ChatService, Clock, ResponseGenerator, Turn};
use crate::error::ChatError;
use crate::infrastructure::entities::{Message, MessageId, NewMessage, Role, UserId};
use crate::infrastructure::traits::MessageStore;
use async_trait::async_trait;
use di::{Ref, injectable};
use log::{error, info, warn};

#[injectable(ChatService)]
pub struct ChatController {
    store: Ref<dyn MessageStore>,
    generator: Ref<dyn ResponseGenerator>,
    clock: Ref<dyn Clock>,
    sessions: Ref<SessionRegistry>,
    settings: Ref<Settings>,
}

impl ChatController {
    pub fn new(
        store: Ref<dyn MessageStore>,
        generator: Ref<dyn ResponseGenerator>,
        clock: Ref<dyn Clock>,
        sessions: Ref<SessionRegistry>,
        settings: Ref<Settings>,
    ) -> ChatController {
        ChatController {
            store,
            generator,
            clock,
            sessions,
            settings,
        }
    }

    fn moment(&self) -> Option<Moment> {
        match self.settings.prompt_variant {
            PromptVariant::TimeAware => Some(Moment::at(self.clock.now())),
            PromptVariant::TimeWithheld => None,
        }
    }

    async fn welcome(&self) -> Result<NewMessage, ChatError> {
        let text = self
            .generator
            .generate_welcome(&PromptInput::welcome(self.moment()))
            .await?;
        Ok(NewMessage::assistant(text))
    }

    async fn load(&self, user: &UserId) -> Result<Vec<Message>, ChatError> {
        match self.settings.mode() {
            ConversationMode::Ephemeral => {
                // Generate first so a failed welcome leaves the old session untouched.
                let welcome = self.welcome().await?;
                self.store.clear(user).await?;
                Ok(vec![self.store.append(user, welcome).await?])
            }
            ConversationMode::Persistent => {
                let history = self.store.fetch_history(user).await?;
                if !history.is_empty() {
                    return Ok(history);
                }

                info!("no history for {user}, starting the conversation");
                let welcome = self.welcome().await?;
                Ok(vec![self.store.append(user, welcome).await?])
            }
        }
    }

    async fn reply(&self, user: &UserId, user_message: &Message) -> Result<Message, ChatError> {
        let history = self.store.fetch_history(user).await?;

        // A resubmitted message that already got its reply.
        let answered = history
            .iter()
            .position(|m| m.id == user_message.id)
            .and_then(|i| history.get(i + 1))
            .filter(|m| m.role == Role::Assistant);
        if let Some(reply) = answered {
            info!("message {} was already answered", user_message.id);
            return Ok(reply.clone());
        }

        if history.last().map(|m| m.role) != Some(Role::User) {
            return Err(ChatError::LastMessageNotFromUser);
        }

        let input = PromptInput::reply(
            user_message.content.clone(),
            serialize_history(&history, &self.settings.role_labels),
            self.moment(),
        );
        let text = self.generator.generate_reply(&input).await?;

        Ok(self.store.append(user, NewMessage::assistant(text)).await?)
    }

    /// Applies the configured failure policy and wraps the cause.
    ///
    /// Only a message stored by this turn (`inserted`) is ever rolled back.
    async fn fail_turn(
        &self,
        user: &UserId,
        user_message: Message,
        inserted: bool,
        cause: ChatError,
    ) -> ChatError {
        error!("turn for {user} failed: {cause}");

        let kept = match self.settings.failure_policy {
            TurnFailurePolicy::Rollback if inserted => {
                match self.store.remove(user, &user_message.id).await {
                    Ok(()) => None,
                    Err(e) => {
                        warn!("could not roll back message {}: {e}", user_message.id);
                        Some(user_message)
                    }
                }
            }
            TurnFailurePolicy::Rollback | TurnFailurePolicy::Keep => Some(user_message),
        };

        ChatError::TurnFailed {
            kept,
            source: Box::new(cause),
        }
    }
}

#[async_trait]
impl ChatService for ChatController {
    async fn open(&self, user: &UserId) -> Result<Vec<Message>, ChatError> {
        let loading = self.sessions.begin_loading(user)?;

        match self.load(user).await {
            Ok(messages) => {
                loading.finish(SessionPhase::Ready);
                Ok(messages)
            }
            Err(e) => {
                error!("could not open conversation for {user}: {e}");
                Err(e)
            }
        }
    }

    async fn history(&self, user: &UserId) -> Result<Vec<Message>, ChatError> {
        Ok(self.store.fetch_history(user).await?)
    }

    async fn submit(
        &self,
        user: &UserId,
        text: &str,
        client_id: Option<MessageId>,
    ) -> Result<Turn, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        if let Some(id) = client_id
            .as_ref()
            .filter(|id| !id.is_blank() && !id.is_valid())
        {
            return Err(ChatError::InvalidIdentifier(id.to_string()));
        }

        let _turn = self.sessions.begin_turn(user)?;

        let appended = self
            .store
            .insert(user, NewMessage::user(text).with_id(client_id))
            .await?;
        let user_message = appended.message;

        // a reused id must name this same user message
        if !appended.inserted
            && (user_message.role != Role::User || user_message.content != text)
        {
            warn!("message id {} for {user} is already taken", user_message.id);
            return Err(ChatError::IdentifierInUse(user_message.id.to_string()));
        }

        match self.reply(user, &user_message).await {
            Ok(reply) => Ok(Turn {
                user_message,
                reply,
            }),
            Err(cause) => Err(self
                .fail_turn(user, user_message, appended.inserted, cause)
                .await),
        }
    }

    async fn delete(&self, user: &UserId, id: &MessageId) -> Result<(), ChatError> {
        if id.is_blank() {
            return Err(ChatError::MissingIdentifier);
        }
        if !id.is_valid() {
            return Err(ChatError::InvalidIdentifier(id.to_string()));
        }

        self.store.remove(user, id).await?;
        info!("deleted message {id} for {user}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::FixedClock;
    use crate::error::{GenerationError, ModelError, StoreError};
    use crate::infrastructure::entities::Appended;
    use crate::infrastructure::repositories::MemoryMessageStore;
    use chrono::{FixedOffset, TimeZone};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    /// Replies from a script and records every input it saw.
    #[derive(Default)]
    struct ScriptedGenerator {
        replies: Mutex<VecDeque<Result<String, GenerationError>>>,
        inputs: Mutex<Vec<PromptInput>>,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedGenerator {
        fn new(replies: Vec<Result<String, GenerationError>>) -> Arc<ScriptedGenerator> {
            Arc::new(ScriptedGenerator {
                replies: Mutex::new(replies.into()),
                ..ScriptedGenerator::default()
            })
        }

        fn inputs(&self) -> Vec<PromptInput> {
            self.inputs.lock().unwrap().clone()
        }

        async fn next(&self, input: &PromptInput) -> Result<String, GenerationError> {
            self.inputs.lock().unwrap().push(input.clone());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(GenerationError::Model(ModelError::Empty(None))))
        }
    }

    #[async_trait]
    impl ResponseGenerator for ScriptedGenerator {
        async fn generate_welcome(&self, input: &PromptInput) -> Result<String, GenerationError> {
            self.next(input).await
        }

        async fn generate_reply(&self, input: &PromptInput) -> Result<String, GenerationError> {
            self.next(input).await
        }
    }

    /// Counts calls that reach the backend.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryMessageStore,
        removes: AtomicUsize,
        durable: bool,
    }

    #[async_trait]
    impl MessageStore for CountingStore {
        async fn fetch_history(&self, user: &UserId) -> Result<Vec<Message>, StoreError> {
            let mut history = self.inner.fetch_history(user).await?;
            for message in &mut history {
                message.persisted = self.durable;
            }
            Ok(history)
        }

        async fn insert(&self, user: &UserId, message: NewMessage) -> Result<Appended, StoreError> {
            let mut appended = self.inner.insert(user, message).await?;
            appended.message.persisted = self.durable;
            Ok(appended)
        }

        async fn remove(&self, user: &UserId, id: &MessageId) -> Result<(), StoreError> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            self.inner.remove(user, id).await
        }

        async fn clear(&self, user: &UserId) -> Result<(), StoreError> {
            self.inner.clear(user).await
        }

        fn is_durable(&self) -> bool {
            self.durable
        }
    }

    fn settings(store: &str) -> Settings {
        Settings::from_lookup(|key| match key {
            "GEMINI_API_KEY" => Some("test".to_owned()),
            "STORE_BACKEND" => Some(store.to_owned()),
            "DATABASE_URL" => Some("sqlite::memory:".to_owned()),
            _ => None,
        })
        .unwrap()
    }

    fn user() -> UserId {
        "katyayani".parse().unwrap()
    }

    fn clock(hour: u32, minute: u32) -> Arc<FixedClock> {
        let ist = FixedOffset::east_opt(330 * 60).unwrap();
        Arc::new(FixedClock(
            ist.with_ymd_and_hms(2025, 6, 27, hour, minute, 0).unwrap(),
        ))
    }

    fn controller(
        store: Arc<CountingStore>,
        generator: Arc<ScriptedGenerator>,
        settings: Settings,
    ) -> ChatController {
        ChatController::new(
            store,
            generator,
            clock(18, 30),
            Arc::new(SessionRegistry::create()),
            Arc::new(settings),
        )
    }

    fn ephemeral(replies: Vec<Result<String, GenerationError>>) -> (ChatController, Arc<CountingStore>, Arc<ScriptedGenerator>) {
        let store = Arc::new(CountingStore::default());
        let generator = ScriptedGenerator::new(replies);
        (
            controller(store.clone(), generator.clone(), settings("memory")),
            store,
            generator,
        )
    }

    fn persistent(replies: Vec<Result<String, GenerationError>>) -> (ChatController, Arc<CountingStore>, Arc<ScriptedGenerator>) {
        let store = Arc::new(CountingStore {
            durable: true,
            ..CountingStore::default()
        });
        let generator = ScriptedGenerator::new(replies);
        (
            controller(store.clone(), generator.clone(), settings("sqlite")),
            store,
            generator,
        )
    }

    fn failure() -> Result<String, GenerationError> {
        Err(GenerationError::Model(ModelError::Empty(Some("SAFETY".to_owned()))))
    }

    #[tokio::test]
    async fn test_ephemeral_open_returns_one_unpersisted_welcome() {
        let (controller, store, generator) = ephemeral(vec![Ok("Hiii Katyayani...".to_owned())]);

        let messages = controller.open(&user()).await.unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].content, "Hiii Katyayani...");
        assert!(!messages[0].persisted);
        assert_eq!(store.fetch_history(&user()).await.unwrap(), messages);

        let input = &generator.inputs()[0];
        assert!(input.message.is_none());
        assert_eq!(input.moment.as_ref().unwrap().time, "18:30");
    }

    #[tokio::test]
    async fn test_ephemeral_reopen_starts_over() {
        let (controller, store, _) = ephemeral(vec![
            Ok("first welcome".to_owned()),
            Ok("reply".to_owned()),
            Ok("second welcome".to_owned()),
        ]);

        controller.open(&user()).await.unwrap();
        controller.submit(&user(), "hi", None).await.unwrap();
        let reopened = controller.open(&user()).await.unwrap();

        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened[0].content, "second welcome");
        assert_eq!(store.fetch_history(&user()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_persistent_open_stores_welcome_once() {
        let (controller, store, generator) = persistent(vec![Ok("welcome".to_owned())]);

        let first = controller.open(&user()).await.unwrap();
        let second = controller.open(&user()).await.unwrap();

        assert_eq!(first.len(), 1);
        assert!(first[0].persisted);
        assert_eq!(second, first);
        assert_eq!(generator.inputs().len(), 1);
        assert_eq!(store.fetch_history(&user()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_open_surfaces_error_and_stays_uninitialized() {
        let (controller, _, _) = persistent(vec![failure()]);

        assert!(matches!(
            controller.open(&user()).await,
            Err(ChatError::Generation(_))
        ));
        assert_eq!(
            controller.sessions.phase(&user()),
            SessionPhase::Uninitialized
        );
        assert!(matches!(
            controller.submit(&user(), "hi", None).await,
            Err(ChatError::NotOpened)
        ));
    }

    #[tokio::test]
    async fn test_submit_sends_serialized_history() {
        let (controller, _, generator) = ephemeral(vec![
            Ok("Hiii".to_owned()),
            Ok("achha... batao".to_owned()),
        ]);
        controller.open(&user()).await.unwrap();

        let turn = controller
            .submit(&user(), "  kaise ho?  ", None)
            .await
            .unwrap();

        assert_eq!(turn.user_message.content, "kaise ho?");
        assert_eq!(turn.user_message.role, Role::User);
        assert_eq!(turn.reply.content, "achha... batao");
        assert_eq!(turn.reply.role, Role::Assistant);

        let input = &generator.inputs()[1];
        assert_eq!(input.message.as_deref(), Some("kaise ho?"));
        assert_eq!(
            input.chat_history.as_deref(),
            Some("assistant: Hiii\nuser: kaise ho?")
        );
        assert_eq!(
            controller.sessions.phase(&user()),
            SessionPhase::Ready
        );
    }

    #[tokio::test]
    async fn test_blank_input_never_generates() {
        let (controller, store, generator) = ephemeral(vec![Ok("Hiii".to_owned())]);
        controller.open(&user()).await.unwrap();

        for text in ["", "   ", "\n\t"] {
            assert!(matches!(
                controller.submit(&user(), text, None).await,
                Err(ChatError::EmptyMessage)
            ));
        }

        assert_eq!(generator.inputs().len(), 1);
        assert_eq!(store.fetch_history(&user()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_policy_reverts_user_message() {
        let (controller, store, _) = ephemeral(vec![Ok("Hiii".to_owned()), failure()]);
        controller.open(&user()).await.unwrap();

        let err = controller.submit(&user(), "hello?", None).await.unwrap_err();

        assert!(matches!(err, ChatError::TurnFailed { kept: None, .. }));
        let history = store.fetch_history(&user()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "Hiii");
        assert_eq!(controller.sessions.phase(&user()), SessionPhase::Ready);
    }

    #[tokio::test]
    async fn test_keep_policy_leaves_user_message_without_reply() {
        let (controller, store, _) = persistent(vec![Ok("Hiii".to_owned()), failure()]);
        controller.open(&user()).await.unwrap();

        let err = controller.submit(&user(), "hello?", None).await.unwrap_err();

        let ChatError::TurnFailed { kept: Some(kept), .. } = err else {
            panic!("expected the user message to be kept");
        };
        let history = store.fetch_history(&user()).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1], kept);
        assert_eq!(store.removes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_retry_with_client_id_does_not_duplicate() {
        let (controller, store, _) = persistent(vec![
            Ok("Hiii".to_owned()),
            failure(),
            Ok("haan, mil gaya".to_owned()),
        ]);
        controller.open(&user()).await.unwrap();
        let id = MessageId::new("client-1");

        assert!(
            controller
                .submit(&user(), "suno", Some(id.clone()))
                .await
                .is_err()
        );
        let turn = controller.submit(&user(), "suno", Some(id.clone())).await.unwrap();

        assert_eq!(turn.user_message.id, id);
        let contents: Vec<_> = store
            .fetch_history(&user())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, ["Hiii", "suno", "haan, mil gaya"]);
    }

    #[tokio::test]
    async fn test_retry_of_answered_message_returns_stored_reply() {
        let (controller, store, generator) =
            ephemeral(vec![Ok("Hiii".to_owned()), Ok("haan".to_owned())]);
        controller.open(&user()).await.unwrap();
        let id = Some(MessageId::new("client-1"));

        let first = controller.submit(&user(), "suno", id.clone()).await.unwrap();
        let second = controller.submit(&user(), "suno", id).await.unwrap();

        assert_eq!(first.reply, second.reply);
        assert_eq!(generator.inputs().len(), 2);
        assert_eq!(store.fetch_history(&user()).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_second_submit_while_in_flight_is_rejected() {
        let gate = Arc::new(Notify::new());
        let store = Arc::new(CountingStore::default());
        let generator = Arc::new(ScriptedGenerator {
            replies: Mutex::new(vec![Ok("Hiii".to_owned()), Ok("reply".to_owned())].into()),
            gate: Some(gate.clone()),
            ..ScriptedGenerator::default()
        });
        let controller = Arc::new(controller(store, generator, settings("memory")));

        gate.notify_one();
        controller.open(&user()).await.unwrap();

        let running = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.submit(&user(), "first", None).await })
        };
        while controller.sessions.phase(&user()) != SessionPhase::AwaitingResponse {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            controller.submit(&user(), "second", None).await,
            Err(ChatError::TurnInFlight)
        ));

        gate.notify_one();
        let turn = running.await.unwrap().unwrap();
        assert_eq!(turn.reply.content, "reply");
    }

    #[tokio::test]
    async fn test_wish_time_reaches_generator() {
        let store = Arc::new(CountingStore::default());
        let generator = ScriptedGenerator::new(vec![Ok("welcome".to_owned())]);
        let controller = ChatController::new(
            store,
            generator.clone(),
            clock(11, 11),
            Arc::new(SessionRegistry::create()),
            Arc::new(settings("memory")),
        );

        controller.open(&user()).await.unwrap();

        assert_eq!(generator.inputs()[0].moment.as_ref().unwrap().time, "11:11");
    }

    #[tokio::test]
    async fn test_delete_removes_exactly_one() {
        let (controller, store, _) = ephemeral(vec![Ok("Hiii".to_owned()), Ok("reply".to_owned())]);
        controller.open(&user()).await.unwrap();
        let turn = controller.submit(&user(), "hi", None).await.unwrap();

        controller.delete(&user(), &turn.user_message.id).await.unwrap();

        let history = store.fetch_history(&user()).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|m| m.id != turn.user_message.id));
    }

    #[tokio::test]
    async fn test_delete_blank_id_never_reaches_store() {
        let (controller, store, _) = ephemeral(vec![]);

        for id in ["", "  "] {
            assert!(matches!(
                controller.delete(&user(), &MessageId::new(id)).await,
                Err(ChatError::MissingIdentifier)
            ));
        }

        assert_eq!(store.removes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_withheld_variant_sends_no_clock() {
        let store = Arc::new(CountingStore::default());
        let generator = ScriptedGenerator::new(vec![Ok("welcome".to_owned())]);
        let mut settings = settings("memory");
        settings.prompt_variant = PromptVariant::TimeWithheld;
        let controller = controller(store, generator.clone(), settings);

        controller.open(&user()).await.unwrap();

        assert!(generator.inputs()[0].moment.is_none());
    }

    #[tokio::test]
    async fn test_client_id_of_welcome_is_refused() {
        let (controller, store, generator) = ephemeral(vec![Ok("Hiii".to_owned())]);
        let welcome = controller.open(&user()).await.unwrap().remove(0);

        let err = controller
            .submit(&user(), "hello", Some(welcome.id.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, ChatError::IdentifierInUse(id) if id == welcome.id.as_str()));
        assert_eq!(store.fetch_history(&user()).await.unwrap(), [welcome]);
        assert_eq!(store.removes.load(Ordering::SeqCst), 0);
        assert_eq!(generator.inputs().len(), 1);
        assert_eq!(controller.sessions.phase(&user()), SessionPhase::Ready);
    }

    #[tokio::test]
    async fn test_client_id_reused_for_other_text_is_refused() {
        let (controller, store, generator) =
            persistent(vec![Ok("Hiii".to_owned()), Ok("haan".to_owned())]);
        controller.open(&user()).await.unwrap();
        let id = Some(MessageId::new("client-1"));
        controller.submit(&user(), "suno", id.clone()).await.unwrap();

        assert!(matches!(
            controller.submit(&user(), "kuch aur", id).await,
            Err(ChatError::IdentifierInUse(_))
        ));

        let contents: Vec<_> = store
            .fetch_history(&user())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, ["Hiii", "suno", "haan"]);
        assert_eq!(generator.inputs().len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_spares_message_stored_by_earlier_request() {
        let (controller, store, _) = ephemeral(vec![Ok("Hiii".to_owned()), failure()]);
        controller.open(&user()).await.unwrap();
        let id = Some(MessageId::new("client-1"));
        let earlier = store
            .append(&user(), NewMessage::user("suno").with_id(id.clone()))
            .await
            .unwrap();

        let err = controller.submit(&user(), "suno", id).await.unwrap_err();

        let ChatError::TurnFailed { kept: Some(kept), .. } = err else {
            panic!("expected the earlier message to be reported as kept");
        };
        assert_eq!(kept, earlier);
        assert_eq!(store.removes.load(Ordering::SeqCst), 0);
        assert_eq!(store.fetch_history(&user()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ids_outside_one_path_segment_are_rejected() {
        let (controller, store, generator) = ephemeral(vec![Ok("Hiii".to_owned())]);
        controller.open(&user()).await.unwrap();

        for id in ["../x", "a/b", "x y", "ü"] {
            assert!(matches!(
                controller.submit(&user(), "hi", Some(MessageId::new(id))).await,
                Err(ChatError::InvalidIdentifier(_))
            ));
            assert!(matches!(
                controller.delete(&user(), &MessageId::new(id)).await,
                Err(ChatError::InvalidIdentifier(_))
            ));
        }

        assert_eq!(generator.inputs().len(), 1);
        assert_eq!(store.removes.load(Ordering::SeqCst), 0);
        assert_eq!(store.fetch_history(&user()).await.unwrap().len(), 1);
        assert_eq!(controller.sessions.phase(&user()), SessionPhase::Ready);
    }
}
