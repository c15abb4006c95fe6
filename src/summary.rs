use anyhow::{Context, Result};

use crate::database::{MessageRole, StoredMessage};
use crate::llm::GenerationService;

/// Cost-control policy enforced by callers: don't bother summarizing a
/// conversation this short.
pub const MIN_MESSAGES_FOR_SUMMARY: usize = 5;

/// Upper bound (in characters) the synopsis prompt asks the model to respect.
pub const SUMMARY_CHAR_BUDGET: usize = 1000;

/// Compress a message log into a bounded natural-language synopsis.
///
/// The result is staged for review by the caller; nothing is written to
/// storage here. Failure to extract any text is an explicit error so callers
/// can tell "summarization failed" apart from a model that produced an empty
/// summary.
pub async fn summarize(
    service: &dyn GenerationService,
    messages: &[StoredMessage],
    character_name: &str,
    user_name: &str,
    char_budget: usize,
) -> Result<String> {
    let prompt = build_summary_prompt(messages, character_name, user_name, char_budget);
    let outcome = service
        .complete(&prompt)
        .await
        .context("Summarization call failed")?;
    outcome
        .into_text()
        .ok_or_else(|| anyhow::anyhow!("Summarizer produced no text"))
}

pub fn build_summary_prompt(
    messages: &[StoredMessage],
    character_name: &str,
    user_name: &str,
    char_budget: usize,
) -> String {
    format!(
        "The following is the conversation log between {user} and {character}.\n\
         Summarize its key events, important information, and any changes in the \
         relationship between the two, covering everything essential regardless of \
         length (at most {budget} characters).\n\
         The summary alone must be enough to reconstruct the flow of the conversation later.\n\n\
         [Conversation Log]\n\
         {transcript}",
        user = user_name,
        character = character_name,
        budget = char_budget,
        transcript = transcript(messages, character_name, user_name),
    )
}

/// `"{speaker}: {content}"` lines in original order, speaker resolved from
/// role. Synthetic greetings are display-only and stay out of the transcript.
pub fn transcript(messages: &[StoredMessage], character_name: &str, user_name: &str) -> String {
    messages
        .iter()
        .filter(|m| !m.is_synthetic())
        .map(|m| {
            let speaker = match m.role {
                MessageRole::User => user_name,
                MessageRole::Model => character_name,
            };
            format!("{}: {}", speaker, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{GenerationOutcome, PromptMessage};
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex;

    struct ScriptedService {
        outcome: GenerationOutcome,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GenerationService for ScriptedService {
        async fn chat(
            &self,
            _system_instruction: &str,
            _messages: &[PromptMessage],
        ) -> Result<GenerationOutcome> {
            unreachable!("summarizer must not use the chat call");
        }

        async fn complete(&self, prompt: &str) -> Result<GenerationOutcome> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.outcome.clone())
        }
    }

    fn message(role: MessageRole, content: &str, seconds: i64) -> StoredMessage {
        StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: "conv-1".to_string(),
            role,
            content: content.to_string(),
            created_at: Some(Utc.timestamp_opt(seconds, 0).unwrap()),
        }
    }

    #[test]
    fn transcript_resolves_speakers_in_order() {
        let messages = vec![
            message(MessageRole::User, "hi", 1),
            message(MessageRole::Model, "hello", 2),
            message(MessageRole::User, "how are you", 3),
        ];
        let text = transcript(&messages, "Aldric", "Mina");
        assert_eq!(text, "Mina: hi\nAldric: hello\nMina: how are you");
    }

    #[test]
    fn transcript_skips_synthetic_greeting() {
        let mut greeting = message(MessageRole::Model, "welcome!", 0);
        greeting.created_at = None;
        let messages = vec![greeting, message(MessageRole::User, "hi", 1)];
        assert_eq!(transcript(&messages, "Aldric", "Mina"), "Mina: hi");
    }

    #[test]
    fn prompt_carries_budget_names_and_transcript() {
        let messages = vec![message(MessageRole::User, "hi", 1)];
        let prompt = build_summary_prompt(&messages, "Aldric", "Mina", 1000);
        assert!(prompt.contains("at most 1000 characters"));
        assert!(prompt.contains("between Mina and Aldric"));
        assert!(prompt.contains("[Conversation Log]\nMina: hi"));
    }

    #[tokio::test]
    async fn summarize_returns_extracted_text() {
        let service = ScriptedService {
            outcome: GenerationOutcome::Text("They argued about pie.".to_string()),
            prompts: Mutex::new(Vec::new()),
        };
        let messages = vec![message(MessageRole::User, "pie?", 1)];
        let summary = summarize(&service, &messages, "Aldric", "Mina", 1000)
            .await
            .unwrap();
        assert_eq!(summary, "They argued about pie.");
        assert_eq!(service.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_text_is_an_error_not_an_empty_summary() {
        let service = ScriptedService {
            outcome: GenerationOutcome::NoTextProduced,
            prompts: Mutex::new(Vec::new()),
        };
        let messages = vec![message(MessageRole::User, "hi", 1)];
        let err = summarize(&service, &messages, "Aldric", "Mina", 1000)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no text"));
    }
}
