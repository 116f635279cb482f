//! LLM gateway
//!
//! Tiered model selection, single and batch completions, structured output
//! with schema validation and retry, and a budgeted tool-agent loop.

mod agent;
mod anthropic;
mod structured;
mod tiers;
mod tokens;

pub use agent::{
    AgentBudget, MAX_MESSAGE_HISTORY, Tool, prune_message_history, run_tool_agent,
    tool_definition,
};
pub use anthropic::{
    AnthropicClient, BatchOutcome, CacheControl, ChatMessage, ContentBlock, MessagesRequest,
    MessagesResponse, Role, SystemBlock, ThinkingConfig, ToolChoice, ToolDefinition, Usage,
};
pub use structured::{
    BATCH_THRESHOLD, LlmGateway, SUBMIT_RESULT_TOOL, StructuredOptions, StructuredSchema,
    parse_json_payload, submit_tool_definition,
};
pub use tiers::{
    CHECKING_SONNET_THRESHOLD, HAIKU_SAFE_LIMIT, ModelTier, SONNET_1M_SAFE_LIMIT,
    select_checking_tier, select_tier_for_context,
};
pub use tokens::{
    CHARS_PER_TOKEN, DEFAULT_RESPONSE_BUFFER, check_token_budget, estimate_request_tokens,
    estimate_tokens_fast,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// LLM gateway error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Provider returned an API error
    #[error("LLM API error {status}: {message}")]
    Api { status: u16, message: String },
    /// Transport-level failure
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
    /// Pre-flight estimate exceeded the tier limit
    #[error("token budget exceeded: estimated {estimated} > limit {limit}")]
    TokenBudgetExceeded { estimated: usize, limit: usize },
    /// The model produced unparseable or schema-invalid content after retries
    #[error("structured output failure: {0}")]
    StructuredOutput(String),
    /// Batch submission or collection failed
    #[error("batch failure: {0}")]
    Batch(String),
}

/// LLM result type
pub type Result<T> = std::result::Result<T, LlmError>;
