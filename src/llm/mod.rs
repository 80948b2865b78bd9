//! # External LLM Service
//!
//! Thin adapter over the HTTPS chat-completions service that powers both
//! pipeline stages. The core treats the service as a function from
//! `(stage, payload)` to a response or a categorized error:
//! - `401`/`403` are permanent and critical (bad credentials)
//! - `400`/`422` are permanent (the request will never succeed)
//! - `429` is transient and carries the `Retry-After` hint
//! - `5xx` and network failures are transient
//!
//! Response parsing beyond content and token usage is out of the core's
//! hands; flashcard row extraction lives here with the other edge code.

use crate::error::{ErrorKind, PipelineError, Result};
use crate::models::{Flashcard, TokenUsage, VocabularyItem};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

/// Pipeline stage of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Linguistic analysis
    One,
    /// Flashcard row generation
    Two,
}

impl Stage {
    /// Stage number for persistence
    pub fn number(&self) -> u32 {
        match self {
            Stage::One => 1,
            Stage::Two => 2,
        }
    }
}

/// One successful service response
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Response content
    pub content: String,

    /// Token usage for quota accounting
    pub usage: TokenUsage,

    /// Client-generated request id
    pub request_id: String,
}

/// The external LLM service seam
///
/// The production client speaks HTTPS; tests substitute scripted
/// implementations.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Execute one stage call
    async fn call(&self, stage: Stage, payload: &str) -> Result<LlmResponse>;
}

/// API configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bearer credential
    pub api_key: String,

    /// Service base URL
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// Per-request timeout
    pub timeout: Duration,

    /// Response token cap
    pub max_tokens: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "anthropic/claude-3.5-sonnet".to_string(),
            timeout: Duration::from_secs(60),
            max_tokens: 2000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// HTTPS chat-completions client
pub struct OpenRouterClient {
    http: reqwest::Client,
    config: ApiConfig,
}

impl OpenRouterClient {
    /// Create a client
    pub fn new(config: ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                PipelineError::system(
                    ErrorKind::Internal,
                    format!("http client construction failed: {}", e),
                    "llm",
                )
            })?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl LlmService for OpenRouterClient {
    async fn call(&self, stage: Stage, payload: &str) -> Result<LlmResponse> {
        let request_id = Uuid::new_v4().to_string();
        let url = format!("{}/chat/completions", self.config.base_url);
        let body = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": payload}],
            "temperature": 0.3,
            "max_tokens": self.config.max_tokens,
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(e, stage))?;

        let status = response.status().as_u16();
        if status != 200 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text, stage, retry_after));
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(|e| {
            PipelineError::permanent(
                ErrorKind::ParseFailed,
                format!("response body unparseable: {}", e),
                "llm",
            )
            .with_context("stage", stage.number().to_string())
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| {
                PipelineError::permanent(
                    ErrorKind::ParseFailed,
                    "response carried no choices",
                    "llm",
                )
                .with_context("stage", stage.number().to_string())
            })?;

        let usage = parsed.usage.unwrap_or_default();
        Ok(LlmResponse {
            content,
            usage: TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
            request_id,
        })
    }
}

/// Map an HTTP status to the error taxonomy
pub fn classify_status(
    status: u16,
    body: &str,
    stage: Stage,
    retry_after: Option<Duration>,
) -> PipelineError {
    let summary: String = body.chars().take(200).collect();
    let error = match status {
        401 | 403 => PipelineError::permanent(
            ErrorKind::AuthFailed,
            format!("authentication failed ({}): {}", status, summary),
            "llm",
        ),
        400 | 422 => PipelineError::permanent(
            ErrorKind::ApiRejected,
            format!("request rejected ({}): {}", status, summary),
            "llm",
        ),
        429 => {
            let mut error = PipelineError::transient(
                ErrorKind::RateLimited,
                format!("service rate limited ({})", status),
                "llm",
            );
            if let Some(hint) = retry_after {
                error = error.with_retry_after(hint);
            }
            error
        }
        500..=599 => PipelineError::transient(
            ErrorKind::ApiServerError,
            format!("service failure ({}): {}", status, summary),
            "llm",
        ),
        _ => PipelineError::transient(
            ErrorKind::Network,
            format!("unexpected status {}: {}", status, summary),
            "llm",
        ),
    };
    error.with_context("stage", stage.number().to_string())
}

fn classify_transport_error(error: reqwest::Error, stage: Stage) -> PipelineError {
    let kind = if error.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::Network
    };
    PipelineError::transient(kind, error.to_string(), "llm")
        .with_context("stage", stage.number().to_string())
}

// ============================================================================
// Prompts and output parsing
// ============================================================================

/// Stage-1 prompt: linguistic analysis of one term
pub fn stage1_prompt(item: &VocabularyItem) -> String {
    format!(
        "Analyze this Korean term and provide detailed linguistic information:\n\
         Term: {term}\n\
         Type: {item_type}\n\n\
         Provide a JSON response with:\n\
         - term_number: {position}\n\
         - term: the Korean term with IPA pronunciation\n\
         - ipa: IPA pronunciation\n\
         - pos: part of speech\n\
         - primary_meaning: main definition\n\
         - other_meanings: other definitions\n\
         - usage_notes: how it's used\n",
        term = item.term,
        item_type = item.item_type,
        position = item.position,
    )
}

/// Stage-2 prompt: flashcard rows from the stage-1 analysis
pub fn stage2_prompt(analysis: &str) -> String {
    format!(
        "Create memory palace flashcards for this Korean term:\n{analysis}\n\n\
         Create 2-3 flashcards using vivid imagery and metaphors. Include:\n\
         - Scene cards with architectural metaphors\n\
         - Usage comparison cards\n\
         - Etymology/Hanja cards if applicable\n\n\
         Format as TSV with columns: position, term, term_number, tab_name, \
         primer, front, back, tags, honorific_level",
    )
}

/// Parse TSV flashcard rows out of a stage-2 response
///
/// Rows with fewer than nine columns are skipped; positions fall back to
/// the source item's when unparseable.
pub fn parse_flashcards(content: &str, item: &VocabularyItem) -> Vec<Flashcard> {
    content
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 9 {
                return None;
            }
            Some(Flashcard {
                position: parts[0].trim().parse().unwrap_or(item.position),
                term: if parts[1].trim().is_empty() {
                    item.term.clone()
                } else {
                    parts[1].trim().to_string()
                },
                term_number: parts[2].trim().parse().unwrap_or(1),
                tab_name: parts[3].trim().to_string(),
                primer: parts[4].trim().to_string(),
                front: parts[5].trim().to_string(),
                back: parts[6].trim().to_string(),
                tags: parts[7].trim().to_string(),
                honorific_level: parts[8].trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    fn item() -> VocabularyItem {
        VocabularyItem::new(3, "사과", "noun")
    }

    #[test]
    fn test_status_classification() {
        let auth = classify_status(401, "unauthorized", Stage::One, None);
        assert_eq!(auth.category, ErrorCategory::Permanent);
        assert_eq!(auth.severity, crate::error::Severity::Critical);

        let rejected = classify_status(422, "bad payload", Stage::One, None);
        assert_eq!(rejected.kind, ErrorKind::ApiRejected);
        assert!(!rejected.is_retryable());

        let throttled = classify_status(429, "", Stage::Two, Some(Duration::from_secs(7)));
        assert_eq!(throttled.category, ErrorCategory::Transient);
        assert_eq!(throttled.retry_after, Some(Duration::from_secs(7)));
        assert!(throttled.is_retryable());

        let server = classify_status(503, "overloaded", Stage::Two, None);
        assert_eq!(server.kind, ErrorKind::ApiServerError);
        assert!(server.is_retryable());
    }

    #[test]
    fn test_stage_context_attached() {
        let err = classify_status(500, "", Stage::Two, None);
        assert_eq!(err.context.get("stage").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_stage1_prompt_mentions_term() {
        let prompt = stage1_prompt(&item());
        assert!(prompt.contains("사과"));
        assert!(prompt.contains("noun"));
        assert!(prompt.contains("term_number: 3"));
    }

    #[test]
    fn test_parse_flashcards_skips_header_and_short_rows() {
        let content = "position\tterm\tterm_number\ttab_name\tprimer\tfront\tback\ttags\thonorific_level\n\
                       3\t사과\t1\tScene\tprimer text\tfront text\tback text\tnoun,food\tcasual\n\
                       malformed row\n\
                       3\t사과\t2\tUsage\t\tf2\tb2\tnoun\t";

        let cards = parse_flashcards(content, &item());
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].position, 3);
        assert_eq!(cards[0].tab_name, "Scene");
        assert_eq!(cards[0].tags, "noun,food");
        assert_eq!(cards[1].term_number, 2);
    }

    #[test]
    fn test_parse_flashcards_falls_back_to_item_fields() {
        let content = "header\nx\t\ty\tTab\tp\tf\tb\tt\th";
        let cards = parse_flashcards(content, &item());
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].position, 3);
        assert_eq!(cards[0].term, "사과");
        assert_eq!(cards[0].term_number, 1);
    }
}
