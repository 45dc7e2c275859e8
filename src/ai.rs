//! Question-generation and chat collaborator client.
//!
//! The language model sits behind a single HTTP endpoint taking an
//! `{action, payload}` envelope and returning `{questionBank}` /
//! `{reply}` or `{error}`. The model is a black box here; only the
//! request/response contract is fixed.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::Difficulty;
use crate::config::AgentConfig;
use crate::coordinator::SlideQuestionBank;
use crate::error::{MeshError, Result};

/// Hard cap on generated questions per session, irrespective of slide count.
pub const MAX_BANK_QUESTIONS: usize = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlideInput {
    pub index: usize,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreGenerateRequest {
    pub slides: Vec<SlideInput>,
    pub difficulty: Difficulty,
    pub lesson_title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub slide_content: String,
    pub slide_title: String,
    pub lesson_title: String,
    pub conversation_history: Vec<ChatTurn>,
}

/// Generates the per-slide question bank once per session.
#[async_trait]
pub trait QuestionGenerator: Send + Sync {
    async fn pre_generate(&self, request: &PreGenerateRequest) -> Result<Vec<SlideQuestionBank>>;
}

/// Answers one free-form student chat turn.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<String>;
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    action: &'static str,
    payload: &'a T,
}

/// HTTP client for the hosted agent endpoint.
pub struct AgentClient {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl AgentClient {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MeshError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    async fn invoke<T: Serialize + Sync>(&self, action: &'static str, payload: &T) -> Result<Value> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&Envelope { action, payload });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MeshError::AgentRequestFailed(format!(
                "{action} failed with status {status}: {body}"
            )));
        }

        let value: Value = response.json().await?;
        if let Some(err) = value.get("error").and_then(Value::as_str) {
            return Err(MeshError::AgentRequestFailed(err.to_string()));
        }
        Ok(value)
    }
}

#[async_trait]
impl QuestionGenerator for AgentClient {
    async fn pre_generate(&self, request: &PreGenerateRequest) -> Result<Vec<SlideQuestionBank>> {
        let value = self.invoke("pre-generate", request).await?;
        let bank_value = value
            .get("questionBank")
            .ok_or_else(|| MeshError::AgentResponseInvalid("missing questionBank".to_string()))?;

        // The raw reply may arrive as a markdown-fenced JSON string
        let bank: Vec<SlideQuestionBank> = match bank_value {
            Value::String(raw) => serde_json::from_str(&strip_markdown_fences(raw))
                .map_err(|e| MeshError::AgentResponseInvalid(e.to_string()))?,
            other => serde_json::from_value(other.clone())
                .map_err(|e| MeshError::AgentResponseInvalid(e.to_string()))?,
        };

        let bank = cap_bank(bank, MAX_BANK_QUESTIONS);
        tracing::info!(slides = bank.len(), "Question bank generated");
        Ok(bank)
    }
}

#[async_trait]
impl ChatProvider for AgentClient {
    async fn chat(&self, request: &ChatRequest) -> Result<String> {
        let value = self.invoke("buddy-chat", request).await?;
        value
            .get("reply")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| MeshError::AgentResponseInvalid("missing reply".to_string()))
    }
}

pub(crate) fn strip_markdown_fences(raw: &str) -> String {
    raw.replace("```json", "").replace("```", "").trim().to_string()
}

/// Defensive cap: keep at most `cap` questions across all slides, in slide
/// order, dropping the tail.
fn cap_bank(mut bank: Vec<SlideQuestionBank>, cap: usize) -> Vec<SlideQuestionBank> {
    let mut remaining = cap;
    for slide in &mut bank {
        let keep = remaining.min(slide.questions.len());
        slide.questions.truncate(keep);
        remaining -= keep;
    }
    bank
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Question, QuestionKind};

    fn question(text: &str) -> Question {
        Question {
            highlight: "h".to_string(),
            question: text.to_string(),
            kind: QuestionKind::Choice,
            options: vec!["A".to_string(), "B".to_string()],
            answer: "A".to_string(),
            reinforcement: "yes".to_string(),
            correction: "no".to_string(),
            difficulty: Difficulty::Easy,
            topic: None,
        }
    }

    fn slide(idx: usize, n_questions: usize) -> SlideQuestionBank {
        SlideQuestionBank {
            slide_index: idx,
            slide_title: format!("Slide {idx}"),
            key_phrases: vec!["phrase".to_string()],
            questions: (0..n_questions).map(|i| question(&format!("q{i}"))).collect(),
        }
    }

    #[test]
    fn test_strip_markdown_fences() {
        let raw = "```json\n[{\"slideIndex\":0}]\n```";
        assert_eq!(strip_markdown_fences(raw), "[{\"slideIndex\":0}]");

        let plain = "[1, 2]";
        assert_eq!(strip_markdown_fences(plain), "[1, 2]");
    }

    #[test]
    fn test_fenced_bank_parses() {
        let raw = r#"```json
[{"slideIndex": 0, "slideTitle": "Intro", "keyPhrases": ["a", "b"], "questions": []}]
```"#;
        let bank: Vec<SlideQuestionBank> =
            serde_json::from_str(&strip_markdown_fences(raw)).unwrap();
        assert_eq!(bank.len(), 1);
        assert_eq!(bank[0].key_phrases, vec!["a", "b"]);
    }

    #[test]
    fn test_cap_bank_drops_tail_across_slides() {
        let bank = vec![slide(0, 10), slide(1, 10)];
        let capped = cap_bank(bank, MAX_BANK_QUESTIONS);

        assert_eq!(capped[0].questions.len(), 10);
        assert_eq!(capped[1].questions.len(), 5);
    }

    #[test]
    fn test_cap_bank_under_limit_is_untouched() {
        let bank = vec![slide(0, 3), slide(1, 2)];
        let capped = cap_bank(bank, MAX_BANK_QUESTIONS);

        assert_eq!(capped[0].questions.len(), 3);
        assert_eq!(capped[1].questions.len(), 2);
    }

    #[test]
    fn test_envelope_shape() {
        let request = ChatRequest {
            message: "what is this?".to_string(),
            slide_content: "content".to_string(),
            slide_title: "title".to_string(),
            lesson_title: "lesson".to_string(),
            conversation_history: vec![ChatTurn {
                role: ChatRole::User,
                content: "what is this?".to_string(),
            }],
        };

        let json = serde_json::to_value(Envelope {
            action: "buddy-chat",
            payload: &request,
        })
        .unwrap();

        assert_eq!(json["action"], "buddy-chat");
        assert_eq!(json["payload"]["slideTitle"], "title");
        assert_eq!(json["payload"]["conversationHistory"][0]["role"], "user");
    }
}
