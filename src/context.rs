use crate::database::{CharacterRecord, MessageRole, StoredMessage, UserProfile};
use crate::llm::PromptMessage;

/// History window caps. The reduced cap applies whenever a non-empty rolling
/// summary is present: the summary already carries the older context, so the
/// turn trades recency for a cheaper prompt.
#[derive(Debug, Clone, Copy)]
pub struct HistoryWindows {
    pub standard: usize,
    pub summarized: usize,
}

impl Default for HistoryWindows {
    fn default() -> Self {
        Self {
            standard: 40,
            summarized: 20,
        }
    }
}

/// The exact payload for one generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledPrompt {
    pub system_instruction: String,
    pub messages: Vec<PromptMessage>,
}

/// Build the `(system_instruction, message sequence)` pair for one user turn.
///
/// Pure function of its inputs. `history` is the persisted log as it stood
/// before the new input; `input` is appended exactly once as the final user
/// entry. Synthetic greetings are excluded unconditionally, store order is
/// preserved, and no content is mutated.
pub fn assemble(
    character: &CharacterRecord,
    profile: &UserProfile,
    history: &[StoredMessage],
    summary: Option<&str>,
    input: &str,
    windows: HistoryWindows,
) -> AssembledPrompt {
    let summary = summary.map(str::trim).filter(|s| !s.is_empty());

    let system_instruction = build_system_instruction(character, profile, summary);

    let window = if summary.is_some() {
        windows.summarized
    } else {
        windows.standard
    };

    let persisted: Vec<&StoredMessage> = history.iter().filter(|m| !m.is_synthetic()).collect();
    let start = persisted.len().saturating_sub(window);

    let mut messages: Vec<PromptMessage> = persisted[start..]
        .iter()
        .map(|m| PromptMessage {
            role: m.role,
            content: m.content.clone(),
        })
        .collect();
    messages.push(PromptMessage::user(input));

    AssembledPrompt {
        system_instruction,
        messages,
    }
}

/// Block order is an invariant: personas, then the optional summary, then
/// style. If prompt truncation is ever added it must drop from the top, so
/// the least-recent structural element goes last.
fn build_system_instruction(
    character: &CharacterRecord,
    profile: &UserProfile,
    summary: Option<&str>,
) -> String {
    let mut blocks = Vec::with_capacity(5);

    blocks.push(format!(
        "[Character Persona] {}",
        character.character_persona.trim()
    ));

    let user_persona = non_empty(&profile.user_persona)
        .or_else(|| non_empty(&character.user_persona))
        .unwrap_or("No particular persona provided.");
    blocks.push(format!(
        "[User Persona] The user's name is {}. Their persona: {}",
        profile.name.trim(),
        user_persona
    ));

    if let Some(summary) = summary {
        blocks.push(format!(
            "[Previous Conversation Summary] {}",
            summary
        ));
    }

    let style = non_empty(&character.style_prompt).unwrap_or("Use a natural conversational tone.");
    blocks.push(format!("[Output Style] {}", style));

    blocks.push("Stay fully in character and follow the settings above.".to_string());
    blocks.join("\n")
}

fn non_empty(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// The opening line shown (and used as priming) when a conversation has no
/// persisted messages yet. Carries no timestamp, which is what marks it as
/// synthetic; it must never be persisted or sent upstream.
pub fn greeting(character: &CharacterRecord, conversation_id: &str) -> StoredMessage {
    StoredMessage {
        id: format!("greeting-{}", conversation_id),
        conversation_id: conversation_id.to_string(),
        role: MessageRole::Model,
        content: format!(
            "{} has taken the stage! Say hello to start the conversation.",
            character.name
        ),
        created_at: None,
    }
}

/// What the read path hands to viewers: the persisted log, or the synthetic
/// greeting alone when nothing has been said yet.
pub fn prime_with_greeting(
    character: &CharacterRecord,
    conversation_id: &str,
    messages: Vec<StoredMessage>,
) -> Vec<StoredMessage> {
    if messages.iter().any(|m| !m.is_synthetic()) {
        messages
    } else {
        vec![greeting(character, conversation_id)]
    }
}
