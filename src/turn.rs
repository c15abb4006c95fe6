use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::context::{self, HistoryWindows};
use crate::database::{CharacterDatabase, MessageRole, StoredMessage};
use crate::feed::MessageFeed;
use crate::llm::GenerationService;
use crate::summary;

/// Per-turn state machine: `Idle -> UserPersisted -> AwaitingModel -> Done`,
/// with `Failed` reachable from either persistence step or the generation
/// call. A turn that fails after `UserPersisted` leaves the user's message in
/// the log; the next turn's history naturally includes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    UserPersisted,
    AwaitingModel,
    Done,
    Failed,
}

#[derive(Debug)]
pub enum TurnError {
    EmptyInput,
    AlreadyInFlight,
    MissingCharacter(String),
    NotEnoughMessages { have: usize, need: usize },
    Storage(anyhow::Error),
    Generation(anyhow::Error),
    NoReplyProduced,
}

impl TurnError {
    /// Phase the turn ended in. Guard rejections never left `Idle`; anything
    /// after the user append is `Failed`.
    pub fn phase(&self) -> TurnPhase {
        match self {
            TurnError::EmptyInput
            | TurnError::AlreadyInFlight
            | TurnError::MissingCharacter(_)
            | TurnError::NotEnoughMessages { .. } => TurnPhase::Idle,
            TurnError::Storage(_) | TurnError::Generation(_) | TurnError::NoReplyProduced => {
                TurnPhase::Failed
            }
        }
    }
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnError::EmptyInput => write!(f, "message content cannot be empty"),
            TurnError::AlreadyInFlight => {
                write!(f, "a turn is already in flight for this conversation")
            }
            TurnError::MissingCharacter(id) => write!(f, "character '{}' not found", id),
            TurnError::NotEnoughMessages { have, need } => write!(
                f,
                "conversation has {} messages; at least {} are needed to summarize",
                have, need
            ),
            TurnError::Storage(e) => write!(f, "storage error: {}", e),
            TurnError::Generation(e) => write!(f, "generation failed: {}", e),
            TurnError::NoReplyProduced => write!(f, "the model produced no reply"),
        }
    }
}

impl std::error::Error for TurnError {}

/// Successful turn: exactly one user message and one model message were
/// appended, in that order.
#[derive(Debug, Clone)]
pub struct TurnReceipt {
    pub phase: TurnPhase,
    pub user_message: StoredMessage,
    pub model_message: StoredMessage,
}

/// Serializes sends per conversation. Turns on different conversations never
/// contend; a second send on the same conversation while one is in flight is
/// rejected, not queued.
struct TurnGuards {
    inflight: Mutex<HashSet<String>>,
}

impl TurnGuards {
    fn new() -> Self {
        Self {
            inflight: Mutex::new(HashSet::new()),
        }
    }

    fn acquire(&self, conversation_id: &str) -> Option<TurnPermit<'_>> {
        let mut inflight = self.inflight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !inflight.insert(conversation_id.to_string()) {
            return None;
        }
        Some(TurnPermit {
            guards: self,
            conversation_id: conversation_id.to_string(),
        })
    }
}

/// Released on drop, so the guard is cleaned up on every exit path.
struct TurnPermit<'a> {
    guards: &'a TurnGuards,
    conversation_id: String,
}

impl Drop for TurnPermit<'_> {
    fn drop(&mut self) {
        if let Ok(mut inflight) = self.guards.inflight.lock() {
            inflight.remove(&self.conversation_id);
        }
    }
}

pub struct TurnOrchestrator {
    db: Arc<CharacterDatabase>,
    feed: Arc<MessageFeed>,
    generation: Arc<dyn GenerationService>,
    windows: HistoryWindows,
    min_messages_for_summary: usize,
    summary_char_budget: usize,
    guards: TurnGuards,
}

impl TurnOrchestrator {
    pub fn new(
        db: Arc<CharacterDatabase>,
        feed: Arc<MessageFeed>,
        generation: Arc<dyn GenerationService>,
        windows: HistoryWindows,
        min_messages_for_summary: usize,
        summary_char_budget: usize,
    ) -> Self {
        Self {
            db,
            feed,
            generation,
            windows,
            min_messages_for_summary,
            summary_char_budget,
            guards: TurnGuards::new(),
        }
    }

    /// Drive one full conversational turn.
    ///
    /// The user append is the durability point: once it lands, every later
    /// failure still leaves the user's message visible on reload. No model
    /// message is ever written for a failed or empty generation.
    pub async fn run_turn(
        &self,
        character_id: &str,
        conversation_id: &str,
        input: &str,
    ) -> Result<TurnReceipt, TurnError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TurnError::EmptyInput);
        }
        let _permit = self
            .guards
            .acquire(conversation_id)
            .ok_or(TurnError::AlreadyInFlight)?;

        let character = self
            .db
            .get_character(character_id)
            .map_err(TurnError::Storage)?
            .ok_or_else(|| TurnError::MissingCharacter(character_id.to_string()))?;
        let profile = self.db.get_active_profile().map_err(TurnError::Storage)?;

        // History as it stood before this turn; the assembler appends the new
        // input itself, so it is included exactly once.
        let history = self
            .db
            .list_messages(conversation_id)
            .map_err(TurnError::Storage)?;

        // Metadata must exist before the first append so the listing path
        // never silently omits a conversation that has messages.
        self.db
            .ensure_conversation(conversation_id, character_id)
            .map_err(TurnError::Storage)?;
        let summary = self
            .db
            .get_conversation(conversation_id)
            .map_err(TurnError::Storage)?
            .and_then(|c| c.current_summary);

        let user_message = self
            .db
            .append_message(conversation_id, MessageRole::User, input)
            .map_err(TurnError::Storage)?;
        self.publish_snapshot(conversation_id);
        tracing::debug!(
            conversation_id,
            phase = ?TurnPhase::UserPersisted,
            "user message persisted"
        );

        let prompt = context::assemble(
            &character,
            &profile,
            &history,
            summary.as_deref(),
            input,
            self.windows,
        );

        tracing::debug!(
            conversation_id,
            phase = ?TurnPhase::AwaitingModel,
            history_len = prompt.messages.len(),
            "calling generation service"
        );
        let outcome = self
            .generation
            .chat(&prompt.system_instruction, &prompt.messages)
            .await
            .map_err(|e| {
                tracing::warn!(conversation_id, "generation failed: {}", e);
                TurnError::Generation(e)
            })?;

        let reply = outcome
            .into_text()
            .filter(|text| !text.trim().is_empty())
            .ok_or(TurnError::NoReplyProduced)?;

        let model_message = self
            .db
            .append_message(conversation_id, MessageRole::Model, &reply)
            .map_err(TurnError::Storage)?;
        self.publish_snapshot(conversation_id);
        tracing::info!(conversation_id, phase = ?TurnPhase::Done, "turn completed");

        Ok(TurnReceipt {
            phase: TurnPhase::Done,
            user_message,
            model_message,
        })
    }

    /// Produce a staged summary for review. Nothing is committed here; the
    /// caller saves it through the separate summary upsert.
    ///
    /// Holds the same per-conversation permit as `run_turn`, so a summary is
    /// never built from a log a concurrent send is mid-way through extending.
    pub async fn stage_summary(
        &self,
        character_id: &str,
        conversation_id: &str,
    ) -> Result<String, TurnError> {
        let _permit = self
            .guards
            .acquire(conversation_id)
            .ok_or(TurnError::AlreadyInFlight)?;

        let character = self
            .db
            .get_character(character_id)
            .map_err(TurnError::Storage)?
            .ok_or_else(|| TurnError::MissingCharacter(character_id.to_string()))?;
        let profile = self.db.get_active_profile().map_err(TurnError::Storage)?;
        let messages = self
            .db
            .list_messages(conversation_id)
            .map_err(TurnError::Storage)?;

        // Cost-control policy: too little history to be worth a call.
        if messages.len() < self.min_messages_for_summary {
            return Err(TurnError::NotEnoughMessages {
                have: messages.len(),
                need: self.min_messages_for_summary,
            });
        }

        summary::summarize(
            self.generation.as_ref(),
            &messages,
            &character.name,
            &profile.name,
            self.summary_char_budget,
        )
        .await
        .map_err(TurnError::Generation)
    }

    fn publish_snapshot(&self, conversation_id: &str) {
        match self.db.list_messages(conversation_id) {
            Ok(messages) => self.feed.publish(conversation_id, messages),
            Err(e) => tracing::warn!(conversation_id, "failed to publish snapshot: {}", e),
        }
    }
}
