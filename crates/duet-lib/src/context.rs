//! Conversation context and message persistence.
//!
//! The engine consumes both through traits; [`MemoryStore`] is the
//! in-process implementation the server ships with, seeded from the
//! `[[conversations]]` config section.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use duet_core::types::{ChatMessage, ConversationProfile, SenderType};

use crate::config::ConversationSeed;
use crate::error::{PipelineError, PipelineResult};

/// Appended to every persona so replies suit being read aloud.
const SPOKEN_REPLY_GUARD: &str = "You are speaking in a live voice conversation. \
Answer in plain sentences without markdown, lists, tables or code, and keep replies short.";

#[async_trait]
pub trait ConversationContextProvider: Send + Sync {
    /// Fails with a permission error when `user_id` may not use the
    /// conversation.
    async fn authorize(&self, user_id: &str, conversation_id: &str) -> PipelineResult<()>;

    async fn fetch(&self, conversation_id: &str) -> PipelineResult<ConversationProfile>;

    /// Up to `limit` most recent messages, oldest first.
    async fn history(&self, conversation_id: &str, limit: usize) -> PipelineResult<Vec<ChatMessage>>;
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Returns the new message id.
    async fn append(
        &self,
        conversation_id: &str,
        sender: SenderType,
        text: &str,
        metadata: MessageMetadata,
    ) -> PipelineResult<Uuid>;
}

/// Stored alongside each message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageMetadata {
    pub processing_timestamp: DateTime<Utc>,
    pub turn_id: Uuid,
    pub stt_provider: Option<String>,
    pub ai_provider: String,
    pub tts_provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub conversation_id: String,
    pub sender: SenderType,
    pub text: String,
    pub metadata: MessageMetadata,
    pub created_at: DateTime<Utc>,
}

/// Persona plus the spoken-reply guard.
pub fn build_system_prompt(profile: &ConversationProfile) -> String {
    let persona = profile.persona.trim();
    if persona.is_empty() {
        format!("You are {}. {SPOKEN_REPLY_GUARD}", profile.character_name)
    } else {
        format!("{persona}\n\n{SPOKEN_REPLY_GUARD}")
    }
}

struct Conversation {
    owner: String,
    profile: ConversationProfile,
}

impl From<&ConversationSeed> for Conversation {
    fn from(seed: &ConversationSeed) -> Self {
        let defaults = ConversationProfile::default();
        Self {
            owner: seed.owner.clone(),
            profile: ConversationProfile {
                persona: seed.persona.clone(),
                character_name: seed
                    .character_name
                    .clone()
                    .unwrap_or(defaults.character_name),
                context_window_size: seed.context_window,
                temperature: seed.temperature,
                voice_id: seed.voice_id.clone(),
                language: seed.language.clone(),
                model_name: seed.model.clone(),
                max_tokens: None,
            },
        }
    }
}

/// In-memory conversations and messages.
///
/// With no seeds every conversation id is open to every user and gets the
/// default profile. With seeds only seeded conversations exist, each
/// restricted to its owner.
#[derive(Default)]
pub struct MemoryStore {
    conversations: HashMap<String, Conversation>,
    messages: Mutex<Vec<StoredMessage>>,
    reject_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new(seeds: &[ConversationSeed]) -> Self {
        Self {
            conversations: seeds
                .iter()
                .map(|seed| (seed.id.clone(), Conversation::from(seed)))
                .collect(),
            ..Default::default()
        }
    }

    /// Messages of one conversation, oldest first.
    pub fn messages(&self, conversation_id: &str) -> Vec<StoredMessage> {
        self.lock()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    /// Make every following `append` fail, for exercising the error path.
    pub fn reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.conversations.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<StoredMessage>> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ConversationContextProvider for MemoryStore {
    async fn authorize(&self, user_id: &str, conversation_id: &str) -> PipelineResult<()> {
        if self.is_open() {
            return Ok(());
        }
        match self.conversations.get(conversation_id) {
            Some(c) if c.owner == user_id => Ok(()),
            Some(_) => Err(PipelineError::Permission(format!(
                "{user_id} does not own {conversation_id}"
            ))),
            None => Err(PipelineError::Permission(format!(
                "unknown conversation {conversation_id}"
            ))),
        }
    }

    async fn fetch(&self, conversation_id: &str) -> PipelineResult<ConversationProfile> {
        match self.conversations.get(conversation_id) {
            Some(c) => Ok(c.profile.clone()),
            None if self.is_open() => Ok(ConversationProfile::default()),
            None => Err(PipelineError::Permission(format!(
                "unknown conversation {conversation_id}"
            ))),
        }
    }

    async fn history(&self, conversation_id: &str, limit: usize) -> PipelineResult<Vec<ChatMessage>> {
        let messages = self.lock();
        let mut recent: Vec<ChatMessage> = messages
            .iter()
            .rev()
            .filter(|m| m.conversation_id == conversation_id)
            .take(limit)
            .map(|m| match m.sender {
                SenderType::User => ChatMessage::user(&m.text),
                SenderType::Assistant => ChatMessage::assistant(&m.text),
            })
            .collect();
        recent.reverse();
        Ok(recent)
    }
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn append(
        &self,
        conversation_id: &str,
        sender: SenderType,
        text: &str,
        metadata: MessageMetadata,
    ) -> PipelineResult<Uuid> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(PipelineError::Persistence("store is read-only".into()));
        }
        let id = Uuid::new_v4();
        self.lock().push(StoredMessage {
            id,
            conversation_id: conversation_id.to_string(),
            sender,
            text: text.to_string(),
            metadata,
            created_at: Utc::now(),
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> MessageMetadata {
        MessageMetadata {
            processing_timestamp: Utc::now(),
            turn_id: Uuid::new_v4(),
            stt_provider: None,
            ai_provider: "mock".into(),
            tts_provider: "mock".into(),
            confidence: None,
            finish_reason: Some("stop".into()),
        }
    }

    fn seeded() -> MemoryStore {
        MemoryStore::new(&[ConversationSeed {
            id: "c1".into(),
            owner: "alice".into(),
            persona: "You are Aria, a cheerful guide.".into(),
            temperature: Some(0.3),
            ..Default::default()
        }])
    }

    #[tokio::test]
    async fn open_store_accepts_anyone() {
        let store = MemoryStore::default();
        assert!(store.authorize("anyone", "whatever").await.is_ok());
        let profile = store.fetch("whatever").await.unwrap();
        assert_eq!(profile.character_name, "Assistant");
    }

    #[tokio::test]
    async fn seeded_store_checks_owner() {
        let store = seeded();
        assert!(store.authorize("alice", "c1").await.is_ok());
        assert!(matches!(
            store.authorize("bob", "c1").await,
            Err(PipelineError::Permission(_))
        ));
        assert!(matches!(
            store.authorize("alice", "c2").await,
            Err(PipelineError::Permission(_))
        ));
        assert_eq!(store.fetch("c1").await.unwrap().temperature, Some(0.3));
    }

    #[tokio::test]
    async fn history_is_recent_oldest_first() {
        let store = MemoryStore::default();
        for (i, sender) in [SenderType::User, SenderType::Assistant, SenderType::User]
            .into_iter()
            .enumerate()
        {
            store.append("c", sender, &format!("m{i}"), metadata()).await.unwrap();
        }
        store.append("other", SenderType::User, "x", metadata()).await.unwrap();

        let history = store.history("c", 2).await.unwrap();
        assert_eq!(
            history,
            vec![ChatMessage::assistant("m1"), ChatMessage::user("m2")]
        );
        assert_eq!(store.messages("c").len(), 3);
    }

    #[tokio::test]
    async fn rejected_writes_are_persistence_errors() {
        let store = MemoryStore::default();
        store.reject_writes(true);
        let err = store
            .append("c", SenderType::User, "hi", metadata())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Persistence(_)));
        assert!(store.messages("c").is_empty());
    }

    #[test]
    fn system_prompt_keeps_persona_first() {
        let profile = ConversationProfile {
            persona: "You are Aria.".into(),
            ..Default::default()
        };
        let prompt = build_system_prompt(&profile);
        assert!(prompt.starts_with("You are Aria."));
        assert!(prompt.contains("without markdown"));
        assert!(build_system_prompt(&ConversationProfile::default()).starts_with("You are Assistant."));
    }
}
