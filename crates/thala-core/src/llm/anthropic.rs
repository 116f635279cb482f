//! LLM provider client (Messages API)
//!
//! Wire types and the async client for single completions and the
//! message-batches endpoints. System prompts are block lists so a stable
//! prefix can carry a cache-control marker and amortize cost across
//! related calls.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{LlmError, ModelTier, Result};

const DEFAULT_API_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
/// Long completions (extended thinking, big summaries) need patience
const REQUEST_TIMEOUT_SECS: u64 = 600;
/// Default polling interval for batch results
pub const BATCH_POLL_INTERVAL_SECS: u64 = 30;
/// Give up polling a batch after this long
const BATCH_POLL_TIMEOUT_SECS: u64 = 24 * 60 * 60;

// ============================================================================
// WIRE TYPES
// ============================================================================

/// Cache-control marker for prompt caching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub control_type: String,
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self {
            control_type: "ephemeral".to_string(),
        }
    }
}

/// One block of a system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl SystemBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            block_type: "text".to_string(),
            text: text.into(),
            cache_control: None,
        }
    }

    /// A stable prefix block marked for prompt caching.
    pub fn cached(text: impl Into<String>) -> Self {
        Self {
            block_type: "text".to_string(),
            text: text.into(),
            cache_control: Some(CacheControl::ephemeral()),
        }
    }
}

/// Message roles. System content travels separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One content block inside a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant_blocks(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// A user message carrying tool results.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: results,
        }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Approximate character size of the message, for token estimates.
    pub fn char_len(&self) -> usize {
        self.content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.len(),
                ContentBlock::Thinking { thinking, .. } => thinking.len(),
                ContentBlock::ToolUse { input, .. } => input.to_string().len(),
                ContentBlock::ToolResult { content, .. } => content.len(),
            })
            .sum()
    }

    /// Whether any block is a tool_use.
    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolUse { .. }))
    }

    /// Whether any block is a tool_result.
    pub fn has_tool_result(&self) -> bool {
        self.content
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolResult { .. }))
    }
}

/// Tool definition sent to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Tool-choice directive.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Tool { name: String },
}

/// Extended-thinking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub thinking_type: String,
    pub budget_tokens: u32,
}

impl ThinkingConfig {
    pub fn enabled(budget_tokens: u32) -> Self {
        Self {
            thinking_type: "enabled".to_string(),
            budget_tokens,
        }
    }
}

/// Request body for the messages endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub system: Vec<SystemBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    /// Beta header required by the tier; not part of the body
    #[serde(skip_serializing)]
    pub beta: Option<&'static str>,
}

impl MessagesRequest {
    /// A request against a tier with sane defaults.
    pub fn new(tier: ModelTier, messages: Vec<ChatMessage>, max_tokens: u32) -> Self {
        Self {
            model: tier.model_id().to_string(),
            max_tokens,
            messages,
            system: vec![],
            temperature: None,
            tools: None,
            tool_choice: None,
            thinking: None,
            beta: tier.beta_header(),
        }
    }

    pub fn with_system(mut self, system: Vec<SystemBlock>) -> Self {
        self.system = system;
        self
    }

    pub fn with_thinking(mut self, budget_tokens: u32) -> Self {
        if budget_tokens > 0 {
            self.thinking = Some(ThinkingConfig::enabled(budget_tokens));
        }
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = Some(tools);
        self
    }
}

/// Token usage from a completion.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Response from the messages endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Usage,
}

impl MessagesResponse {
    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Concatenated thinking blocks, if any.
    pub fn thinking(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Thinking { thinking, .. } => Some(thinking.as_str()),
                _ => None,
            })
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n"))
    }

    /// All tool calls in the response, in order.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

// ============================================================================
// BATCH WIRE TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct BatchRequestItem<'a> {
    custom_id: &'a str,
    params: &'a MessagesRequest,
}

#[derive(Debug, Deserialize)]
struct BatchHandle {
    id: String,
    #[serde(default)]
    processing_status: String,
    #[serde(default)]
    results_url: Option<String>,
}

/// Outcome for one batch entry.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub success: bool,
    pub content: String,
    pub thinking: Option<String>,
    pub error: Option<String>,
}

// ============================================================================
// CLIENT
// ============================================================================

/// Async client for the LLM provider.
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_base_url(DEFAULT_API_URL, api_key)
    }

    pub fn with_base_url(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }

    /// Run a single completion.
    pub async fn complete(&self, request: &MessagesRequest) -> Result<MessagesResponse> {
        let mut builder = self.request(reqwest::Method::POST, "/v1/messages");
        if let Some(beta) = request.beta {
            builder = builder.header("anthropic-beta", beta);
        }
        let response = builder.json(request).send().await?;
        Self::parse(response).await
    }

    /// Submit a batch of requests; returns the batch id for polling.
    pub async fn submit_batch(&self, requests: &[(String, MessagesRequest)]) -> Result<String> {
        let items: Vec<BatchRequestItem<'_>> = requests
            .iter()
            .map(|(custom_id, params)| BatchRequestItem { custom_id, params })
            .collect();
        let response = self
            .request(reqwest::Method::POST, "/v1/messages/batches")
            .json(&serde_json::json!({"requests": items}))
            .send()
            .await?;
        let handle: BatchHandle = Self::parse_json(response).await?;
        debug!(batch_id = %handle.id, count = requests.len(), "submitted message batch");
        Ok(handle.id)
    }

    /// Poll a batch until it ends, then collect per-request outcomes.
    pub async fn collect_batch(
        &self,
        batch_id: &str,
        poll_interval: Duration,
    ) -> Result<HashMap<String, BatchOutcome>> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(BATCH_POLL_TIMEOUT_SECS);

        let results_url = loop {
            let response = self
                .request(
                    reqwest::Method::GET,
                    &format!("/v1/messages/batches/{batch_id}"),
                )
                .send()
                .await?;
            let handle: BatchHandle = Self::parse_json(response).await?;

            if handle.processing_status == "ended" {
                break handle.results_url.ok_or_else(|| {
                    LlmError::Batch(format!("batch {batch_id} ended without results"))
                })?;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LlmError::Batch(format!(
                    "batch {batch_id} did not finish in time"
                )));
            }
            debug!(batch_id, status = %handle.processing_status, "batch still processing");
            tokio::time::sleep(poll_interval).await;
        };

        // Result files are JSONL, one outcome per line
        let url = if results_url.starts_with("http") {
            results_url
        } else {
            format!("{}{}", self.base_url, results_url)
        };
        let response = self
            .http
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .send()
            .await?;
        let body = response.text().await?;

        let mut outcomes = HashMap::new();
        for line in body.lines().filter(|line| !line.trim().is_empty()) {
            let entry: Value = match serde_json::from_str(line) {
                Ok(value) => value,
                Err(e) => {
                    warn!("skipping unparseable batch result line: {e}");
                    continue;
                }
            };
            let Some(custom_id) = entry.get("custom_id").and_then(Value::as_str) else {
                continue;
            };
            let outcome = match entry.pointer("/result/type").and_then(Value::as_str) {
                Some("succeeded") => {
                    let message: Option<MessagesResponse> = entry
                        .pointer("/result/message")
                        .cloned()
                        .and_then(|m| serde_json::from_value(m).ok());
                    match message {
                        Some(message) => BatchOutcome {
                            success: true,
                            content: message.text(),
                            thinking: message.thinking(),
                            error: None,
                        },
                        None => BatchOutcome {
                            success: false,
                            content: String::new(),
                            thinking: None,
                            error: Some("unparseable result message".to_string()),
                        },
                    }
                }
                other => BatchOutcome {
                    success: false,
                    content: String::new(),
                    thinking: None,
                    error: Some(
                        entry
                            .pointer("/result/error/message")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| {
                                format!("batch result type {:?}", other.unwrap_or("missing"))
                            }),
                    ),
                },
            };
            outcomes.insert(custom_id.to_string(), outcome);
        }
        Ok(outcomes)
    }

    async fn parse(response: reqwest::Response) -> Result<MessagesResponse> {
        Self::parse_json(response).await
    }

    async fn parse_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&body)
                .map(|envelope| format!("{}: {}", envelope.error.error_type, envelope.error.message))
                .unwrap_or(body);
            Err(LlmError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}
