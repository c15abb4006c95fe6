use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::database::MessageRole;

/// One role-tagged entry of the message sequence sent upstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

impl PromptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn model(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Model,
            content: content.into(),
        }
    }
}

/// What the upstream call actually produced, decoded at the boundary so the
/// rest of the crate never inspects raw response JSON. An empty or missing
/// completion is `NoTextProduced`, never an empty `Text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Text(String),
    NoTextProduced,
}

impl GenerationOutcome {
    pub fn into_text(self) -> Option<String> {
        match self {
            GenerationOutcome::Text(text) => Some(text),
            GenerationOutcome::NoTextProduced => None,
        }
    }
}

/// Stateless text-generation collaborator.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Chat-style call: a system instruction plus a role-tagged history.
    async fn chat(
        &self,
        system_instruction: &str,
        messages: &[PromptMessage],
    ) -> Result<GenerationOutcome>;

    /// Single combined prompt with no system/user split (summarization path).
    async fn complete(&self, prompt: &str) -> Result<GenerationOutcome>;
}

#[derive(Clone)]
pub struct GeminiClient {
    api_url: String,
    api_key: Option<String>,
    chat_model: String,
    summary_model: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ContentPayload>,
    contents: Vec<ContentPayload>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct ContentPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TextPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    // Some SDK-shaped responses surface the completion directly; the REST
    // shape only carries candidates. Check the direct form first.
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<TextPart>,
}

impl GenerateContentResponse {
    fn extract_text(self) -> GenerationOutcome {
        if let Some(text) = self.text {
            if !text.trim().is_empty() {
                return GenerationOutcome::Text(text);
            }
        }
        let nested = self
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .and_then(|content| content.parts.into_iter().next())
            .map(|part| part.text);
        match nested {
            Some(text) if !text.trim().is_empty() => GenerationOutcome::Text(text),
            _ => GenerationOutcome::NoTextProduced,
        }
    }
}

impl GeminiClient {
    pub fn new(
        api_url: String,
        api_key: Option<String>,
        chat_model: String,
        summary_model: String,
    ) -> Self {
        Self {
            api_url,
            api_key,
            chat_model,
            summary_model,
            client: reqwest::Client::new(),
        }
    }

    fn require_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!("GEMINI_API_KEY is not configured; set it to enable generation")
            })
    }

    async fn generate(
        &self,
        model: &str,
        system_instruction: Option<&str>,
        messages: &[PromptMessage],
    ) -> Result<GenerationOutcome> {
        let key = self.require_key()?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.api_url.trim_end_matches('/'),
            model
        );

        let request = GenerateContentRequest {
            system_instruction: system_instruction.map(|text| ContentPayload {
                role: None,
                parts: vec![TextPart {
                    text: text.to_string(),
                }],
            }),
            contents: messages
                .iter()
                .map(|msg| ContentPayload {
                    role: Some(msg.role.as_db_str().to_string()),
                    parts: vec![TextPart {
                        text: msg.content.clone(),
                    }],
                })
                .collect(),
            generation_config: GenerationConfig { temperature: 0.7 },
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", key)
            .json(&request)
            .send()
            .await
            .context("Failed to send generation request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Generation API returned error {}: {}", status, body);
        }

        let completion: GenerateContentResponse = response
            .json()
            .await
            .context("Failed to parse generation response")?;

        Ok(completion.extract_text())
    }
}

#[async_trait]
impl GenerationService for GeminiClient {
    async fn chat(
        &self,
        system_instruction: &str,
        messages: &[PromptMessage],
    ) -> Result<GenerationOutcome> {
        self.generate(&self.chat_model, Some(system_instruction), messages)
            .await
    }

    async fn complete(&self, prompt: &str) -> Result<GenerationOutcome> {
        self.generate(&self.summary_model, None, &[PromptMessage::user(prompt)])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(value: serde_json::Value) -> GenerationOutcome {
        serde_json::from_value::<GenerateContentResponse>(value)
            .unwrap()
            .extract_text()
    }

    #[test]
    fn direct_text_field_wins() {
        let outcome = decode(serde_json::json!({
            "text": "direct",
            "candidates": [{"content": {"parts": [{"text": "nested"}]}}]
        }));
        assert_eq!(outcome, GenerationOutcome::Text("direct".to_string()));
    }

    #[test]
    fn falls_back_to_first_part_of_first_candidate() {
        let outcome = decode(serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "X"}, {"text": "ignored"}]}}]
        }));
        assert_eq!(outcome, GenerationOutcome::Text("X".to_string()));
    }

    #[test]
    fn blank_direct_text_still_checks_candidates() {
        let outcome = decode(serde_json::json!({
            "text": "   ",
            "candidates": [{"content": {"parts": [{"text": "nested"}]}}]
        }));
        assert_eq!(outcome, GenerationOutcome::Text("nested".to_string()));
    }

    #[test]
    fn empty_or_malformed_responses_yield_no_text() {
        assert_eq!(decode(serde_json::json!({})), GenerationOutcome::NoTextProduced);
        assert_eq!(
            decode(serde_json::json!({"candidates": []})),
            GenerationOutcome::NoTextProduced
        );
        assert_eq!(
            decode(serde_json::json!({"candidates": [{"content": {"parts": []}}]})),
            GenerationOutcome::NoTextProduced
        );
        assert_eq!(
            decode(serde_json::json!({"candidates": [{}]})),
            GenerationOutcome::NoTextProduced
        );
        assert_eq!(
            decode(serde_json::json!({"text": ""})),
            GenerationOutcome::NoTextProduced
        );
    }

    #[test]
    fn missing_key_fails_fast_with_clear_message() {
        let client = GeminiClient::new(
            "https://example.invalid".to_string(),
            None,
            "chat-model".to_string(),
            "summary-model".to_string(),
        );
        let err = client.require_key().unwrap_err();
        assert!(err.to_string().contains("GEMINI_API_KEY"));

        let blank = GeminiClient::new(
            "https://example.invalid".to_string(),
            Some("  ".to_string()),
            "chat-model".to_string(),
            "summary-model".to_string(),
        );
        assert!(blank.require_key().is_err());
    }
}
