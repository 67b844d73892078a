//! Ollama integration for the LLM-backed stages
//!
//! Calls the Ollama REST API for summaries, flashcards, topics and
//! embeddings. Each call races the task's cancellation token; failures are
//! mapped onto `BackendError` so the stage runner can retry or fall back.

use crate::config::OllamaConfig;
use crate::error::BackendError;
use crate::pipeline::artifact::{CardKind, Flashcard, Topic, TopicSet, TopicSource};
use crate::pipeline::backend::{Embedder, FlashcardGenerator, Summarizer, TopicModeler};
use crate::pipeline::text::{paragraphs, truncate_chars};
use crate::pipeline::topics::{MAX_TOPICS, MIN_PARAGRAPH_CHARS};
use crate::pipeline::{Stage, StageContext};
use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Prompts carry at most this much of the material.
const MAX_PROMPT_CHARS: usize = 12_000;

/// Ollama client for making API calls
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    embedding_model: Option<String>,
}

impl OllamaClient {
    pub fn new(config: &OllamaConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(config.timeout())
                .build()
                .unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
        }
    }

    pub fn has_embeddings(&self) -> bool {
        self.embedding_model.is_some()
    }

    /// Check if Ollama is running and the model is available
    pub async fn health_check(&self) -> Result<OllamaStatus, BackendError> {
        let tags_url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&tags_url).send().await?;
        check_status(response.status())?;

        let tags: TagsResponse = response.json().await.map_err(|e| {
            BackendError::Permanent(format!("Failed to parse Ollama response: {}", e))
        })?;

        let family = self.model.split(':').next().unwrap_or(&self.model);
        let model_available = tags.models.iter().any(|m| m.name.starts_with(family));

        Ok(OllamaStatus {
            running: true,
            model: self.model.clone(),
            model_available,
            available_models: tags.models.iter().map(|m| m.name.clone()).collect(),
        })
    }

    /// Generate a completion from Ollama
    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String, BackendError> {
        let url = format!("{}/api/generate", self.base_url);

        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            system: system.map(|s| s.to_string()),
            stream: false,
            options: Some(GenerateOptions {
                temperature: 0.3,
                num_predict: 2048,
            }),
        };

        log::info!(
            "Sending request to Ollama: model={}, prompt_len={}",
            self.model,
            prompt.len()
        );

        let response = self.client.post(&url).json(&request).send().await?;
        if let Err(e) = check_status(response.status()) {
            let body = response.text().await.unwrap_or_default();
            log::warn!("Ollama error body: {}", truncate_chars(&body, 300));
            return Err(e);
        }

        let result: GenerateResponse = response.json().await.map_err(|e| {
            BackendError::Transient(format!("Failed to parse Ollama response: {}", e))
        })?;

        log::info!(
            "Ollama response received: {} chars, eval_duration={:?}ms",
            result.response.len(),
            result.eval_duration.map(|d| d / 1_000_000)
        );

        Ok(result.response)
    }

    /// `generate`, abandoned as soon as the task is cancelled.
    async fn generate_for(
        &self,
        ctx: &StageContext<'_>,
        prompt: &str,
        system: &str,
    ) -> Result<String, BackendError> {
        ctx.checkpoint()?;
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(BackendError::Cancelled),
            result = self.generate(prompt, Some(system)) => result,
        }
    }

    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        let Some(model) = &self.embedding_model else {
            return Err(BackendError::Permanent(
                "No embedding model configured".to_string(),
            ));
        };
        let url = format!("{}/api/embed", self.base_url);
        let request = EmbedRequest {
            model: model.clone(),
            input: texts.to_vec(),
        };
        let response = self.client.post(&url).json(&request).send().await?;
        check_status(response.status())?;
        let result: EmbedResponse = response.json().await.map_err(|e| {
            BackendError::Transient(format!("Failed to parse Ollama embeddings: {}", e))
        })?;
        Ok(result.embeddings)
    }
}

/// 5xx and 429 are worth retrying; any other error status is not.
fn check_status(status: StatusCode) -> Result<(), BackendError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(BackendError::Transient(format!("Ollama returned {}", status)))
    } else {
        Err(BackendError::Permanent(format!("Ollama returned {}", status)))
    }
}

/// Extract JSON from LLM response (handles markdown code blocks)
fn extract_json_from_response(response: &str) -> Option<serde_json::Value> {
    let trimmed = response.trim();

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(json);
    }

    if let Some(start) = trimmed.find("```json") {
        let after_marker = &trimmed[start + 7..];
        if let Some(end) = after_marker.find("```") {
            let json_str = after_marker[..end].trim();
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(json_str) {
                return Some(json);
            }
        }
    }

    // First balanced object or array in the text
    let start = trimmed.find(['{', '['])?;
    let (open, close) = if trimmed[start..].starts_with('{') {
        ('{', '}')
    } else {
        ('[', ']')
    };
    let mut depth = 0;
    for (i, c) in trimmed[start..].char_indices() {
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                let candidate = &trimmed[start..start + i + c.len_utf8()];
                return serde_json::from_str(candidate).ok();
            }
        }
    }
    None
}

fn card_objects() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[^{}]*\}").unwrap())
}

fn str_field(value: &serde_json::Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| value.get(*n).and_then(|v| v.as_str()))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn card_from_json(value: &serde_json::Value) -> Option<Flashcard> {
    let question = str_field(value, &["q", "question"])?;
    let answer = str_field(value, &["a", "answer"])?;
    let kind = match str_field(value, &["type", "kind"]).as_deref() {
        Some("definition") => CardKind::Definition,
        Some("application") | Some("problem") => CardKind::Application,
        Some("keyword") => CardKind::Keyword,
        _ => CardKind::Concept,
    };
    let difficulty = value
        .get("difficulty")
        .and_then(|d| d.as_u64())
        .unwrap_or(2)
        .clamp(1, 3) as u8;

    let card = Flashcard::new(kind, question, answer, difficulty);
    Some(match str_field(value, &["hint"]) {
        Some(hint) => card.with_hint(hint),
        None => card,
    })
}

/// Cards from a model response. A malformed array is salvaged object by
/// object; an empty result means the response was unusable.
fn parse_flashcards(response: &str) -> Vec<Flashcard> {
    let items = match extract_json_from_response(response) {
        Some(serde_json::Value::Array(items)) => items,
        Some(serde_json::Value::Object(obj)) => obj
            .get("flashcards")
            .or_else(|| obj.get("cards"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    let mut cards: Vec<Flashcard> = items.iter().filter_map(card_from_json).collect();

    if cards.is_empty() {
        cards = card_objects()
            .find_iter(response)
            .filter_map(|m| serde_json::from_str::<serde_json::Value>(m.as_str()).ok())
            .filter_map(|v| card_from_json(&v))
            .collect();
        if !cards.is_empty() {
            log::info!("Salvaged {} flashcards from malformed response", cards.len());
        }
    }
    cards
}

fn parse_topics(response: &str) -> Vec<Topic> {
    let items = match extract_json_from_response(response) {
        Some(serde_json::Value::Object(obj)) => obj
            .get("topics")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default(),
        Some(serde_json::Value::Array(items)) => items,
        _ => Vec::new(),
    };
    items
        .iter()
        .filter_map(|t| {
            let title = t.get("title")?.as_str()?.trim();
            if title.is_empty() {
                return None;
            }
            Some(Topic {
                title: truncate_chars(title, 80),
                summary: t
                    .get("summary")
                    .and_then(|s| s.as_str())
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
                key_concepts: t
                    .get("key_concepts")
                    .and_then(|k| k.as_array())
                    .map(|k| {
                        k.iter()
                            .filter_map(|c| c.as_str().map(str::to_string))
                            .take(5)
                            .collect()
                    })
                    .unwrap_or_default(),
                source: TopicSource::Model,
            })
        })
        .take(MAX_TOPICS)
        .collect()
}

const SYSTEM_PROMPT: &str = "You help students study. Base every answer strictly on the material provided. Never add outside knowledge.";

#[async_trait]
impl Summarizer for OllamaClient {
    async fn summarize(&self, text: &str, ctx: &StageContext<'_>) -> Result<String, BackendError> {
        ctx.report(Stage::Summary, 0.2, "asking model for summary");
        let prompt = format!(
            "Write a concise study summary (5 to 8 sentences) of the following material.\n\n---\n{}\n---",
            truncate_chars(text, MAX_PROMPT_CHARS)
        );
        let summary = self.generate_for(ctx, &prompt, SYSTEM_PROMPT).await?;
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(BackendError::Transient("Model returned an empty summary".into()));
        }
        ctx.report(Stage::Summary, 1.0, "summary ready");
        Ok(summary.to_string())
    }
}

#[async_trait]
impl FlashcardGenerator for OllamaClient {
    async fn flashcards(
        &self,
        text: &str,
        topics: &TopicSet,
        ctx: &StageContext<'_>,
    ) -> Result<Vec<Flashcard>, BackendError> {
        ctx.report(Stage::Flashcards, 0.2, "asking model for flashcards");
        let prompt = format!(
            "Create up to 15 flashcards for the material below. Main topics: {}.\n\
             Respond with a JSON array only. Each item: \
             {{\"type\": \"definition|concept|application\", \"q\": \"question\", \"a\": \"answer\", \"hint\": \"hint\", \"difficulty\": 1-3}}\n\n---\n{}\n---",
            topics.titles().join("; "),
            truncate_chars(text, MAX_PROMPT_CHARS)
        );
        let response = self.generate_for(ctx, &prompt, SYSTEM_PROMPT).await?;
        let mut cards = parse_flashcards(&response);
        if cards.is_empty() {
            return Err(BackendError::Transient(
                "Model returned no usable flashcards".into(),
            ));
        }
        cards.truncate(15);
        ctx.report(Stage::Flashcards, 1.0, &format!("{} cards", cards.len()));
        Ok(cards)
    }
}

#[async_trait]
impl TopicModeler for OllamaClient {
    async fn topics(&self, text: &str, ctx: &StageContext<'_>) -> Result<TopicSet, BackendError> {
        let paragraph_count = paragraphs(text, MIN_PARAGRAPH_CHARS).len();
        ctx.report(Stage::Topics, 0.2, "asking model for topics");
        let prompt = format!(
            "List the main topics of the material below (at most {}). Respond with JSON only: \
             {{\"topics\": [{{\"title\": \"...\", \"summary\": \"...\", \"key_concepts\": [\"...\"]}}]}}\n\n---\n{}\n---",
            MAX_TOPICS,
            truncate_chars(text, MAX_PROMPT_CHARS)
        );
        let response = self.generate_for(ctx, &prompt, SYSTEM_PROMPT).await?;
        let topics = parse_topics(&response);
        if topics.is_empty() {
            return Err(BackendError::Transient("Model returned no topics".into()));
        }
        Ok(TopicSet {
            topics,
            paragraph_count,
        })
    }
}

#[async_trait]
impl Embedder for OllamaClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        self.embed_texts(texts).await
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaStatus {
    pub running: bool,
    pub model: String,
    pub model_available: bool,
    pub available_models: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_response() {
        // Direct JSON
        let json = extract_json_from_response(r#"{"name": "test"}"#);
        assert!(json.is_some());

        // Markdown code block
        let json = extract_json_from_response(
            r#"Here's the result:
```json
[{"q": "a", "a": "b"}]
```
"#,
        );
        assert!(json.unwrap().is_array());

        // JSON embedded in text, after multibyte characters
        let json = extract_json_from_response(r#"Ответ — {"value": 42} and that's it."#);
        assert_eq!(json.unwrap()["value"], 42);

        assert!(extract_json_from_response("no json here").is_none());
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_status(StatusCode::OK).is_ok());
        assert!(matches!(
            check_status(StatusCode::SERVICE_UNAVAILABLE),
            Err(BackendError::Transient(_))
        ));
        assert!(matches!(
            check_status(StatusCode::TOO_MANY_REQUESTS),
            Err(BackendError::Transient(_))
        ));
        assert!(matches!(
            check_status(StatusCode::NOT_FOUND),
            Err(BackendError::Permanent(_))
        ));
    }

    #[test]
    fn test_parse_flashcards_array() {
        let cards = parse_flashcards(
            r#"[{"type": "definition", "q": "What is ATP?", "a": "The cell's energy currency", "difficulty": 1},
                {"q": "", "a": "dropped"}]"#,
        );
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].kind, CardKind::Definition);
        assert_eq!(cards[0].difficulty, 1);
    }

    #[test]
    fn test_parse_flashcards_salvages_truncated_response() {
        // Output cut off mid-array by the token limit
        let response = r#"[{"q": "One?", "a": "First", "difficulty": 5},
                           {"q": "Two?", "a": "Second", "hint": "h"},
                           {"q": "Thr"#;
        let cards = parse_flashcards(response);
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].difficulty, 3);
        assert_eq!(cards[1].hint.as_deref(), Some("h"));
    }

    #[test]
    fn test_parse_topics() {
        let topics = parse_topics(
            r#"{"topics": [{"title": "Photosynthesis", "summary": "Light to sugar", "key_concepts": ["chlorophyll"]}, {"title": ""}]}"#,
        );
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].source, TopicSource::Model);
        assert_eq!(topics[0].key_concepts, vec!["chlorophyll"]);
    }
}
