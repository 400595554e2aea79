use crate::config::LlmConfig;
use crate::services::context::SearchContext;
use crate::services::conversation::stages::FilterExtractor;
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

const FILTER_SYSTEM_PROMPT: &str = r#"You extract apartment search filters from a renter's message.
Reply with a single JSON object and nothing else. Allowed keys:
neighborhood (string), borough (string), propertyType (one of condo, rental, townhouse, house, coop, multi-family, condop),
address (string), zipcode (string), minPrice (integer dollars), maxPrice (integer dollars), bedrooms (integer),
minBathrooms (number), minSqft (integer), maxSqft (integer), noFee (boolean),
tags (array of strings), amenities (array of strings).
Only include keys the message mentions. To drop previously chosen tags or amenities use {"replace": [...]}."#;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: usize,
    pub temperature: f32,
    pub stream: bool,
}

/// Extract first JSON object substring from a possibly noisy LLM output.
/// Handles nested braces and braces inside JSON strings (with escapes).
pub fn extract_first_json_object(s: &str) -> Option<&str> {
    let mut start: Option<usize> = None;
    let mut depth: i32 = 0;

    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in s.char_indices() {
        if start.is_none() {
            if ch == '{' {
                start = Some(i);
                depth = 1;
            }
            continue;
        }

        if in_string {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let st = start?;
                    return Some(&s[st..=i]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Filter extractor backed by an OpenAI-compatible chat completion endpoint.
#[derive(Clone)]
pub struct LlmFilterExtractor {
    client: Client,
    config: LlmConfig,
    limiters: Arc<Limiters>,
}

impl LlmFilterExtractor {
    pub fn new(config: LlmConfig, limiters: Arc<Limiters>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            config,
            limiters,
        })
    }

    /// Generate completion without streaming (wait for full response)
    async fn generate_chat(&self, messages: Vec<ChatMessage>) -> Result<String, ApiError> {
        debug!("Starting filter extraction with {} messages", messages.len());

        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages,
            max_tokens: self.config.max_tokens,
            temperature: 0.0,
            stream: false,
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ApiError::LlmError(format!("Failed to call LLM API: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::LlmError(format!(
                "LLM API error: {} - {}",
                status, body
            )));
        }

        #[derive(Deserialize)]
        struct ChatCompletionResponse {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize)]
        struct Message {
            content: String,
        }

        let chat_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ApiError::LlmError(format!("Failed to parse LLM response: {}", e)))?;

        chat_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| ApiError::LlmError("No choices returned from LLM".to_string()))
    }

    async fn call_llm_with_retry(&self, messages: &[ChatMessage]) -> Result<String> {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let (_permit, _) = Limiters::acquire_timed(
                self.limiters.llm_generate.clone(),
                self.limiters.acquire_timeout,
                "llm_extract",
            )
            .await?;

            match self.generate_chat(messages.to_vec()).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < max_attempts => {
                    warn!("LLM attempt {}/{} failed: {}", attempt, max_attempts, e);
                    tokio::time::sleep(tokio::time::Duration::from_millis(250 * attempt as u64))
                        .await;
                }
                Err(e) => {
                    error!("LLM call failed after {} attempts: {}", max_attempts, e);
                    return Err(e.into());
                }
            }
        }

        anyhow::bail!("LLM extraction made no attempts")
    }

    fn build_messages(message: &str, current: &SearchContext, hint: Option<&str>) -> Vec<ChatMessage> {
        let mut user = format!(
            "Current filters: {}\nMessage: {}",
            current.to_value(),
            message
        );
        if let Some(hint) = hint {
            user.push_str(&format!(
                "\nYour previous answer was rejected: {}. Correct it.",
                hint
            ));
        }
        vec![ChatMessage::system(FILTER_SYSTEM_PROMPT), ChatMessage::user(user)]
    }

    fn parse_filters(raw: &str) -> Result<SearchContext> {
        let json = extract_first_json_object(raw)
            .ok_or_else(|| anyhow::anyhow!("LLM reply contained no JSON object"))?;
        let mut value: serde_json::Value = serde_json::from_str(json)?;
        // The model writes null for "not mentioned"; that must not erase anything.
        if let Some(map) = value.as_object_mut() {
            map.retain(|_, v| !v.is_null());
        }
        // Range problems are left to the validation stage so it can retry.
        let ctx: SearchContext = serde_json::from_value(value)?;
        Ok(ctx)
    }
}

#[async_trait]
impl FilterExtractor for LlmFilterExtractor {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn extract(
        &self,
        message: &str,
        current: &SearchContext,
        hint: Option<&str>,
    ) -> Result<SearchContext> {
        let messages = Self::build_messages(message, current, hint);
        let raw = self.call_llm_with_retry(&messages).await?;
        Self::parse_filters(&raw)
    }
}
