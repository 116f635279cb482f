//! Tool-using agent loop
//!
//! Runs a model with a set of tools until it packages its final answer
//! through the sentinel `submit_result` tool. The loop enforces a
//! two-dimensional budget (tool calls and retrieved characters), prunes
//! message history at exchange boundaries only (a tool_use and its
//! tool_results are an atomic unit), and pre-flight-checks token usage so a
//! request never goes out past 90% of the tier's safe limit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::anthropic::{
    AnthropicClient, ChatMessage, ContentBlock, MessagesRequest, SystemBlock, ToolDefinition,
};
use super::structured::{
    SUBMIT_RESULT_TOOL, StructuredSchema, parse_json_payload, submit_tool_definition,
};
use super::tokens::check_token_budget;
use super::{LlmError, ModelTier, Result};

/// Maximum messages retained in the working history
pub const MAX_MESSAGE_HISTORY: usize = 12;
/// Pre-flight threshold as per-mille of the tier safe limit
const PREFLIGHT_THRESHOLD_PER_MILLE: usize = 900;
/// Forced-structured fallback retries after the loop gives up
const FALLBACK_RETRIES: u32 = 2;

// ============================================================================
// TOOLS
// ============================================================================

/// A tool an agent may call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the tool input
    fn input_schema(&self) -> Value;
    /// Execute the tool. Errors become error tool-results, not loop failures.
    async fn invoke(&self, args: Value) -> std::result::Result<Value, String>;
}

/// Provider-facing definition for a tool object.
pub fn tool_definition(tool: &dyn Tool) -> ToolDefinition {
    ToolDefinition {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        input_schema: tool.input_schema(),
    }
}

// ============================================================================
// BUDGET
// ============================================================================

/// Two-dimensional budget for a tool-agent run.
#[derive(Debug, Clone)]
pub struct AgentBudget {
    pub max_tool_calls: usize,
    pub max_total_chars: usize,
    pub tool_calls_made: usize,
    pub chars_retrieved: usize,
}

impl Default for AgentBudget {
    fn default() -> Self {
        Self::new(12, 100_000)
    }
}

impl AgentBudget {
    pub fn new(max_tool_calls: usize, max_total_chars: usize) -> Self {
        Self {
            max_tool_calls,
            max_total_chars,
            tool_calls_made: 0,
            chars_retrieved: 0,
        }
    }

    /// Both dimensions are hard limits.
    pub fn can_continue(&self) -> bool {
        self.tool_calls_made < self.max_tool_calls && self.chars_retrieved < self.max_total_chars
    }

    pub fn char_budget_exceeded(&self) -> bool {
        self.chars_retrieved >= self.max_total_chars
    }

    pub fn record_tool_call(&mut self, result_chars: usize) {
        self.tool_calls_made += 1;
        self.chars_retrieved += result_chars;
    }

    pub fn status(&self) -> String {
        format!(
            "[Budget: {}/{} calls, {}/{} chars]",
            self.tool_calls_made, self.max_tool_calls, self.chars_retrieved, self.max_total_chars
        )
    }
}

// ============================================================================
// HISTORY PRUNING
// ============================================================================

/// Prune message history while preserving tool_use/tool_result pairs.
///
/// The provider requires every tool_result to follow its tool_use in the
/// immediately preceding assistant message, so pruning only ever drops
/// whole exchanges (one assistant-with-tool-calls message plus its result
/// message), oldest first. The first user message is always preserved.
pub fn prune_message_history(messages: Vec<ChatMessage>, max_history: usize) -> Vec<ChatMessage> {
    if messages.len() <= max_history {
        return messages;
    }

    let preserved_count = 1.min(messages.len());
    let preserved: Vec<ChatMessage> = messages[..preserved_count].to_vec();
    let remaining = &messages[preserved_count..];

    // Group into exchanges: an assistant message opens one and its
    // tool-result messages attach to it; bare user messages stand alone.
    let mut exchanges: Vec<Vec<ChatMessage>> = Vec::new();
    let mut current: Vec<ChatMessage> = Vec::new();

    for message in remaining {
        match message.role {
            super::anthropic::Role::Assistant => {
                if !current.is_empty() {
                    exchanges.push(std::mem::take(&mut current));
                }
                current.push(message.clone());
            }
            super::anthropic::Role::User if message.has_tool_result() => {
                current.push(message.clone());
            }
            super::anthropic::Role::User => {
                if !current.is_empty() {
                    exchanges.push(std::mem::take(&mut current));
                }
                exchanges.push(vec![message.clone()]);
            }
        }
    }
    if !current.is_empty() {
        exchanges.push(current);
    }

    // Keep the most recent exchanges that fit; always keep at least one
    let target = max_history.saturating_sub(preserved.len());
    let mut kept: Vec<Vec<ChatMessage>> = Vec::new();
    let mut message_count = 0;

    for exchange in exchanges.into_iter().rev() {
        if message_count + exchange.len() <= target || kept.is_empty() {
            message_count += exchange.len();
            kept.push(exchange);
        } else {
            break;
        }
    }
    kept.reverse();

    let recent: Vec<ChatMessage> = kept.into_iter().flatten().collect();
    let pruned = messages.len() - preserved.len() - recent.len();
    if pruned > 0 {
        debug!(pruned, kept = recent.len(), "pruned agent message history");
    }

    preserved.into_iter().chain(recent).collect()
}

fn estimate_history_tokens(system: &[SystemBlock], messages: &[ChatMessage]) -> usize {
    let system_chars: usize = system.iter().map(|block| block.text.len()).sum();
    let message_chars: usize = messages.iter().map(ChatMessage::char_len).sum();
    // chars/4 with the same safety margin the fast estimator applies
    (system_chars + message_chars) / 4 * 1_150 / 1_000 + messages.len() * 12
}

// ============================================================================
// AGENT LOOP
// ============================================================================

/// Run a tool agent until it submits a result matching `T`.
#[allow(clippy::too_many_arguments)]
pub async fn run_tool_agent<T: StructuredSchema>(
    client: &Arc<AnthropicClient>,
    tier: ModelTier,
    system: Vec<SystemBlock>,
    mut messages: Vec<ChatMessage>,
    tools: &[Arc<dyn Tool>],
    mut budget: AgentBudget,
    max_tokens: u32,
) -> Result<T> {
    let tools_by_name: HashMap<String, Arc<dyn Tool>> = tools
        .iter()
        .map(|tool| (tool.name().to_string(), tool.clone()))
        .collect();

    let mut definitions: Vec<ToolDefinition> = tools.iter().map(|t| tool_definition(t.as_ref())).collect();
    definitions.push(submit_tool_definition::<T>());

    // Fold the submit instruction into the trailing user message
    if let Some(last) = messages.last_mut() {
        if last.role == super::anthropic::Role::User && !last.has_tool_result() {
            last.content.push(ContentBlock::Text {
                text: "\nWhen you have completed your analysis, you MUST call the \
                       submit_result tool to provide your final output."
                    .to_string(),
            });
        }
    }

    // Hard cap on iterations so a non-compliant model cannot spin forever
    let max_rounds = budget.max_tool_calls + 4;

    for _round in 0..max_rounds {
        messages = prune_message_history(messages, MAX_MESSAGE_HISTORY);

        // Pre-flight: past 90% of the tier limit, force an immediate submit
        let estimated = estimate_history_tokens(&system, &messages);
        if check_token_budget(estimated, tier.safe_limit(), PREFLIGHT_THRESHOLD_PER_MILLE).is_err()
        {
            warn!(estimated, "agent context near token limit, forcing submit");
            messages.push(ChatMessage::user(
                "CRITICAL: Context is approaching token limits. You MUST call \
                 submit_result NOW with your best current analysis. Do not make \
                 any more tool calls.",
            ));
        }

        let request = MessagesRequest::new(tier, messages.clone(), max_tokens)
            .with_system(system.clone())
            .with_tools(definitions.clone());
        let response = client.complete(&request).await?;

        messages.push(ChatMessage::assistant_blocks(response.content.clone()));

        let tool_calls = response.tool_calls();
        if tool_calls.is_empty() {
            warn!("agent returned without tool calls, prompting for submit_result");
            if !budget.can_continue() {
                break;
            }
            messages.push(ChatMessage::user(
                "You must call the submit_result tool to provide your final output.",
            ));
            continue;
        }

        let mut result_blocks: Vec<ContentBlock> = Vec::new();
        let calls: Vec<(String, String, Value)> = tool_calls
            .into_iter()
            .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
            .collect();

        for (call_id, call_name, call_input) in calls {
            if call_name == SUBMIT_RESULT_TOOL {
                match serde_json::from_value::<T>(call_input) {
                    Ok(value) => {
                        info!("agent submitted result {}", budget.status());
                        return Ok(value);
                    }
                    Err(e) => {
                        warn!("submit_result arguments failed validation: {e}");
                        result_blocks.push(ContentBlock::ToolResult {
                            tool_use_id: call_id,
                            content: json!({
                                "error": format!("Invalid output: {e}. Please try again.")
                            })
                            .to_string(),
                            is_error: Some(true),
                        });
                        continue;
                    }
                }
            }

            let result = match tools_by_name.get(&call_name) {
                Some(tool) => {
                    debug!(tool = call_name, "executing agent tool");
                    match tool.invoke(call_input).await {
                        Ok(value) => value.to_string(),
                        Err(e) => {
                            warn!(tool = call_name, "tool failed: {e}");
                            json!({"error": e}).to_string()
                        }
                    }
                }
                None => json!({"error": format!("Unknown tool: {call_name}")}).to_string(),
            };

            budget.record_tool_call(result.len());
            result_blocks.push(ContentBlock::ToolResult {
                tool_use_id: call_id,
                content: result,
                is_error: None,
            });
        }

        if !result_blocks.is_empty() {
            messages.push(ChatMessage::tool_results(result_blocks));
        }

        if !budget.can_continue() {
            let reason = if budget.char_budget_exceeded() {
                format!(
                    "Character budget exceeded ({}/{} chars)",
                    budget.chars_retrieved, budget.max_total_chars
                )
            } else {
                format!(
                    "Tool call limit reached ({}/{} calls)",
                    budget.tool_calls_made, budget.max_tool_calls
                )
            };
            info!("budget exhausted: {reason} {}", budget.status());
            messages.push(ChatMessage::user(format!(
                "Budget limit reached: {reason}. You must call submit_result now to \
                 provide your final output. Do not make any more tool calls except \
                 submit_result."
            )));
        }
    }

    // The model never submitted; force one structured answer off the
    // accumulated conversation.
    info!("forcing final output via structured fallback {}", budget.status());

    let mut last_error: Option<LlmError> = None;
    for attempt in 0..FALLBACK_RETRIES {
        let mut fallback_system = system.clone();
        fallback_system.push(SystemBlock::text(format!(
            "Respond with a single JSON object matching this schema, and nothing else:\n{}",
            T::schema()
        )));
        let mut fallback_messages = messages.clone();
        fallback_messages.push(ChatMessage::user(
            "Produce your final structured output now as a single JSON object.",
        ));

        let request = MessagesRequest::new(tier, fallback_messages, max_tokens)
            .with_system(fallback_system);
        match client.complete(&request).await {
            Ok(response) => match parse_json_payload::<T>(&response.text()) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(attempt, "structured fallback failed to parse: {e}");
                    last_error = Some(LlmError::StructuredOutput(e));
                }
            },
            Err(e) => {
                warn!(attempt, "structured fallback request failed: {e}");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        LlmError::StructuredOutput(format!(
            "agent produced no {} before exhausting its budget",
            T::schema_name()
        ))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::anthropic::Role;
    use serde::Deserialize;

    fn user(text: &str) -> ChatMessage {
        ChatMessage::user(text)
    }

    fn assistant_with_tool(id: &str) -> ChatMessage {
        ChatMessage::assistant_blocks(vec![ContentBlock::ToolUse {
            id: id.to_string(),
            name: "search".to_string(),
            input: json!({"q": id}),
        }])
    }

    fn tool_result_for(id: &str) -> ChatMessage {
        ChatMessage::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: id.to_string(),
            content: "result".to_string(),
            is_error: None,
        }])
    }

    #[test]
    fn test_budget_dimensions_are_both_hard() {
        let mut budget = AgentBudget::new(2, 100);
        assert!(budget.can_continue());
        budget.record_tool_call(50);
        assert!(budget.can_continue());
        budget.record_tool_call(60);
        // chars exceeded even though one call remains? no - both consumed
        assert!(!budget.can_continue());
        assert!(budget.char_budget_exceeded());
    }

    #[test]
    fn test_prune_keeps_short_histories_intact() {
        let messages = vec![user("start"), assistant_with_tool("a"), tool_result_for("a")];
        let pruned = prune_message_history(messages.clone(), 12);
        assert_eq!(pruned.len(), messages.len());
    }

    #[test]
    fn test_prune_never_splits_exchanges() {
        // First user message + 8 exchanges of 2 messages each = 17 messages
        let mut messages = vec![user("the task")];
        for i in 0..8 {
            let id = format!("call{i}");
            messages.push(assistant_with_tool(&id));
            messages.push(tool_result_for(&id));
        }

        let pruned = prune_message_history(messages, 8);
        assert!(pruned.len() <= 8);

        // The first message survives
        assert_eq!(pruned[0].text(), "the task");

        // Every tool_result is directly preceded by the assistant message
        // carrying the matching tool_use
        for (i, message) in pruned.iter().enumerate() {
            if message.has_tool_result() {
                assert!(i > 0, "tool result with no preceding message");
                let previous = &pruned[i - 1];
                assert_eq!(previous.role, Role::Assistant);
                assert!(previous.has_tool_use(), "exchange split by pruning");
            }
        }
    }

    #[test]
    fn test_prune_drops_oldest_exchanges_first() {
        let mut messages = vec![user("task")];
        for i in 0..6 {
            let id = format!("c{i}");
            messages.push(assistant_with_tool(&id));
            messages.push(tool_result_for(&id));
        }

        let pruned = prune_message_history(messages, 5);
        // The newest exchange must be present
        let has_newest = pruned.iter().any(|m| {
            m.content.iter().any(|block| {
                matches!(block, ContentBlock::ToolUse { id, .. } if id == "c5")
            })
        });
        assert!(has_newest);
        // The oldest must be gone
        let has_oldest = pruned.iter().any(|m| {
            m.content.iter().any(|block| {
                matches!(block, ContentBlock::ToolUse { id, .. } if id == "c0")
            })
        });
        assert!(!has_oldest);
    }

    #[derive(Debug, Deserialize)]
    struct Outcome {
        done: bool,
    }

    impl StructuredSchema for Outcome {
        fn schema_name() -> &'static str {
            "Outcome"
        }

        fn schema() -> Value {
            json!({"type": "object", "properties": {"done": {"type": "boolean"}}, "required": ["done"]})
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the input back"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }

        async fn invoke(&self, args: Value) -> std::result::Result<Value, String> {
            Ok(args)
        }
    }

    #[tokio::test]
    async fn test_agent_submits_after_tool_use() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        // First call: use the echo tool; second call: submit
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "m1",
                "content": [{"type": "tool_use", "id": "t1", "name": "echo", "input": {"text": "hi"}}],
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "m2",
                "content": [{"type": "tool_use", "id": "t2", "name": "submit_result", "input": {"done": true}}],
            })))
            .mount(&server)
            .await;

        let client = Arc::new(AnthropicClient::with_base_url(server.uri(), "k").unwrap());
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(EchoTool)];
        let outcome: Outcome = run_tool_agent(
            &client,
            ModelTier::Haiku,
            vec![SystemBlock::text("You are a test agent.")],
            vec![ChatMessage::user("do the thing")],
            &tools,
            AgentBudget::new(4, 10_000),
            1024,
        )
        .await
        .unwrap();
        assert!(outcome.done);
    }
}
