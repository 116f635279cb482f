//! Structured output over the LLM provider
//!
//! A single contract for "ask the model, get a validated value back".
//! Output types declare their name and JSON schema; requests go out either
//! via JSON-schema coercion or via a forced `submit_result` tool call, and
//! schema-invalid responses are retried with the failure appended.
//!
//! The same contract covers batches: five or more prompts (with batching
//! enabled) dispatch through the provider batch API; fewer run concurrently
//! under a small semaphore. Callers are agnostic to the path taken.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::anthropic::{
    AnthropicClient, BATCH_POLL_INTERVAL_SECS, ChatMessage, MessagesRequest, SystemBlock,
    ToolChoice, ToolDefinition,
};
use super::{LlmError, ModelTier, Result};

/// Minimum batch size before the provider batch API is preferred
pub const BATCH_THRESHOLD: usize = 5;
/// Concurrent requests on the non-batch path
const NON_BATCH_CONCURRENCY: usize = 3;
/// Name of the sentinel tool that carries the final structured answer
pub const SUBMIT_RESULT_TOOL: &str = "submit_result";

/// A type the model can be asked to produce.
///
/// Schemas are written by hand as `serde_json::Value` so the wire shape is
/// explicit and reviewable next to the type.
pub trait StructuredSchema: DeserializeOwned {
    /// Short name used in tool definitions and error messages
    fn schema_name() -> &'static str;
    /// JSON schema for the type
    fn schema() -> Value;
}

/// Options for a structured-output call.
#[derive(Debug, Clone)]
pub struct StructuredOptions {
    /// Non-zero enables extended thinking where the tier supports it
    pub thinking_budget: u32,
    pub max_tokens: u32,
    /// JSON-schema coercion instead of the submit_result tool
    pub use_json_schema_method: bool,
    /// Retries on schema-validation failure
    pub max_retries: u32,
}

impl Default for StructuredOptions {
    fn default() -> Self {
        Self {
            thinking_budget: 0,
            max_tokens: 4096,
            use_json_schema_method: false,
            max_retries: 2,
        }
    }
}

impl StructuredOptions {
    pub fn with_thinking(mut self, budget: u32) -> Self {
        self.thinking_budget = budget;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn json_schema_method(mut self) -> Self {
        self.use_json_schema_method = true;
        self
    }
}

/// Gateway over the provider for structured and plain completions.
pub struct LlmGateway {
    client: Arc<AnthropicClient>,
    batch_enabled: bool,
    batch_poll_interval: Duration,
}

impl LlmGateway {
    pub fn new(client: Arc<AnthropicClient>) -> Self {
        Self {
            client,
            batch_enabled: true,
            batch_poll_interval: Duration::from_secs(BATCH_POLL_INTERVAL_SECS),
        }
    }

    /// Disable provider batching (rapid iteration, tests).
    pub fn without_batching(mut self) -> Self {
        self.batch_enabled = false;
        self
    }

    pub fn with_batch_poll_interval(mut self, interval: Duration) -> Self {
        self.batch_poll_interval = interval;
        self
    }

    pub fn client(&self) -> &Arc<AnthropicClient> {
        &self.client
    }

    /// Plain text completion.
    pub async fn complete_text(
        &self,
        tier: ModelTier,
        system: Option<&str>,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String> {
        let mut request =
            MessagesRequest::new(tier, vec![ChatMessage::user(prompt)], max_tokens);
        if let Some(system) = system {
            request = request.with_system(vec![SystemBlock::cached(system)]);
        }
        let response = self.client.complete(&request).await?;
        Ok(response.text().trim().to_string())
    }

    /// Single structured-output call.
    pub async fn structured<T: StructuredSchema>(
        &self,
        tier: ModelTier,
        system: Option<&str>,
        prompt: &str,
        options: &StructuredOptions,
    ) -> Result<T> {
        let mut last_failure: Option<String> = None;

        for attempt in 0..=options.max_retries {
            let augmented_prompt = match &last_failure {
                None => prompt.to_string(),
                Some(failure) => format!(
                    "{prompt}\n\nYour previous response was invalid: {failure}\nReturn a corrected response."
                ),
            };

            let request = self.build_structured_request::<T>(tier, system, &augmented_prompt, options);
            let response = self.client.complete(&request).await?;

            let parsed = if options.use_json_schema_method {
                parse_json_payload::<T>(&response.text())
            } else {
                match response
                    .tool_calls()
                    .into_iter()
                    .find(|(_, name, _)| *name == SUBMIT_RESULT_TOOL)
                {
                    Some((_, _, input)) => serde_json::from_value::<T>(input.clone())
                        .map_err(|e| format!("schema validation failed: {e}")),
                    // Some responses answer in text even when a tool is forced
                    None => parse_json_payload::<T>(&response.text()),
                }
            };

            match parsed {
                Ok(value) => return Ok(value),
                Err(failure) => {
                    warn!(
                        schema = T::schema_name(),
                        attempt, "structured output failed validation: {failure}"
                    );
                    last_failure = Some(failure);
                }
            }
        }

        Err(LlmError::StructuredOutput(format!(
            "failed to produce {} after {} attempts: {}",
            T::schema_name(),
            options.max_retries + 1,
            last_failure.unwrap_or_default()
        )))
    }

    /// Batch structured output keyed by caller-chosen id.
    ///
    /// Five or more prompts (with batching enabled) go through the provider
    /// batch API in one submit; fewer run concurrently.
    pub async fn structured_batch<T: StructuredSchema>(
        &self,
        tier: ModelTier,
        system: Option<&str>,
        prompts: Vec<(String, String)>,
        options: &StructuredOptions,
    ) -> HashMap<String, Result<T>> {
        if prompts.is_empty() {
            return HashMap::new();
        }

        if self.batch_enabled && prompts.len() >= BATCH_THRESHOLD {
            self.structured_batch_provider(tier, system, prompts, options)
                .await
        } else {
            self.structured_batch_concurrent(tier, system, prompts, options)
                .await
        }
    }

    async fn structured_batch_provider<T: StructuredSchema>(
        &self,
        tier: ModelTier,
        system: Option<&str>,
        prompts: Vec<(String, String)>,
        options: &StructuredOptions,
    ) -> HashMap<String, Result<T>> {
        debug!(
            count = prompts.len(),
            schema = T::schema_name(),
            "dispatching structured batch via provider batch API"
        );

        let requests: Vec<(String, MessagesRequest)> = prompts
            .iter()
            .map(|(id, prompt)| {
                // Batch entries parse from text, so coerce via JSON schema
                let json_options = StructuredOptions {
                    use_json_schema_method: true,
                    ..options.clone()
                };
                (
                    id.clone(),
                    self.build_structured_request::<T>(tier, system, prompt, &json_options),
                )
            })
            .collect();

        let outcomes = match self.client.submit_batch(&requests).await {
            Ok(batch_id) => {
                match self
                    .client
                    .collect_batch(&batch_id, self.batch_poll_interval)
                    .await
                {
                    Ok(outcomes) => outcomes,
                    Err(e) => {
                        let message = e.to_string();
                        return prompts
                            .into_iter()
                            .map(|(id, _)| (id, Err(LlmError::Batch(message.clone()))))
                            .collect();
                    }
                }
            }
            Err(e) => {
                let message = e.to_string();
                return prompts
                    .into_iter()
                    .map(|(id, _)| (id, Err(LlmError::Batch(message.clone()))))
                    .collect();
            }
        };

        prompts
            .into_iter()
            .map(|(id, _)| {
                let result = match outcomes.get(&id) {
                    Some(outcome) if outcome.success => parse_json_payload::<T>(&outcome.content)
                        .map_err(LlmError::StructuredOutput),
                    Some(outcome) => Err(LlmError::Batch(
                        outcome.error.clone().unwrap_or_else(|| "unknown".into()),
                    )),
                    None => Err(LlmError::Batch("no result returned".to_string())),
                };
                (id, result)
            })
            .collect()
    }

    async fn structured_batch_concurrent<T: StructuredSchema>(
        &self,
        tier: ModelTier,
        system: Option<&str>,
        prompts: Vec<(String, String)>,
        options: &StructuredOptions,
    ) -> HashMap<String, Result<T>> {
        let semaphore = Arc::new(Semaphore::new(NON_BATCH_CONCURRENCY));

        let tasks = prompts.into_iter().map(|(id, prompt)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                let result = self.structured::<T>(tier, system, &prompt, options).await;
                (id, result)
            }
        });

        futures::future::join_all(tasks).await.into_iter().collect()
    }

    fn build_structured_request<T: StructuredSchema>(
        &self,
        tier: ModelTier,
        system: Option<&str>,
        prompt: &str,
        options: &StructuredOptions,
    ) -> MessagesRequest {
        let mut request =
            MessagesRequest::new(tier, vec![ChatMessage::user(prompt)], options.max_tokens);

        let mut system_blocks = Vec::new();
        if let Some(system) = system {
            system_blocks.push(SystemBlock::cached(system));
        }

        if options.use_json_schema_method {
            system_blocks.push(SystemBlock::text(format!(
                "Respond with a single JSON object matching this schema, and nothing else:\n{}",
                T::schema()
            )));
        } else {
            request = request.with_tools(vec![submit_tool_definition::<T>()]);
            request.tool_choice = Some(ToolChoice::Tool {
                name: SUBMIT_RESULT_TOOL.to_string(),
            });
        }

        if !system_blocks.is_empty() {
            request = request.with_system(system_blocks);
        }
        if options.thinking_budget > 0 && tier.supports_thinking() {
            // Thinking is incompatible with a forced tool choice
            if options.use_json_schema_method {
                request = request.with_thinking(options.thinking_budget);
            }
        }
        request
    }
}

/// The sentinel tool definition wrapping a schema.
pub fn submit_tool_definition<T: StructuredSchema>() -> ToolDefinition {
    ToolDefinition {
        name: SUBMIT_RESULT_TOOL.to_string(),
        description: format!(
            "Submit your final {} result. Call this tool when you have completed \
             your analysis and are ready to provide your structured output.",
            T::schema_name()
        ),
        input_schema: T::schema(),
    }
}

/// Parse a structured value out of model text, tolerating code fences and
/// surrounding prose.
pub fn parse_json_payload<T: DeserializeOwned>(text: &str) -> std::result::Result<T, String> {
    let trimmed = text.trim();

    let candidate = if trimmed.starts_with("```") {
        trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
    } else {
        trimmed
    };

    match serde_json::from_str::<T>(candidate) {
        Ok(value) => Ok(value),
        Err(first_error) => {
            // Fall back to the outermost JSON object in the text
            let start = candidate.find('{');
            let end = candidate.rfind('}');
            if let (Some(start), Some(end)) = (start, end) {
                if end > start {
                    return serde_json::from_str::<T>(&candidate[start..=end])
                        .map_err(|e| format!("invalid JSON payload: {e}"));
                }
            }
            Err(format!("invalid JSON payload: {first_error}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Verdict {
        ok: bool,
        score: f64,
    }

    impl StructuredSchema for Verdict {
        fn schema_name() -> &'static str {
            "Verdict"
        }

        fn schema() -> Value {
            json!({
                "type": "object",
                "properties": {
                    "ok": {"type": "boolean"},
                    "score": {"type": "number"},
                },
                "required": ["ok", "score"],
            })
        }
    }

    #[test]
    fn test_parse_json_payload_variants() {
        let plain: Verdict = parse_json_payload(r#"{"ok": true, "score": 0.9}"#).unwrap();
        assert!(plain.ok);

        let fenced: Verdict =
            parse_json_payload("```json\n{\"ok\": false, \"score\": 0.1}\n```").unwrap();
        assert!(!fenced.ok);

        let embedded: Verdict =
            parse_json_payload("Here you go: {\"ok\": true, \"score\": 1.0} done").unwrap();
        assert_eq!(embedded.score, 1.0);

        assert!(parse_json_payload::<Verdict>("not json at all").is_err());
    }

    #[tokio::test]
    async fn test_structured_via_submit_tool() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "content": [{
                    "type": "tool_use",
                    "id": "tu_1",
                    "name": "submit_result",
                    "input": {"ok": true, "score": 0.8},
                }],
            })))
            .mount(&server)
            .await;

        let client =
            Arc::new(AnthropicClient::with_base_url(server.uri(), "k").unwrap());
        let gateway = LlmGateway::new(client);
        let verdict: Verdict = gateway
            .structured(
                ModelTier::Haiku,
                None,
                "judge this",
                &StructuredOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            verdict,
            Verdict {
                ok: true,
                score: 0.8
            }
        );
    }

    #[tokio::test]
    async fn test_structured_retries_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "content": [{"type": "text", "text": "I refuse to answer in JSON"}],
            })))
            .expect(3) // initial + 2 retries
            .mount(&server)
            .await;

        let client =
            Arc::new(AnthropicClient::with_base_url(server.uri(), "k").unwrap());
        let gateway = LlmGateway::new(client);
        let error = gateway
            .structured::<Verdict>(
                ModelTier::Haiku,
                None,
                "judge this",
                &StructuredOptions::default().json_schema_method(),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, LlmError::StructuredOutput(_)));
    }

    #[tokio::test]
    async fn test_small_batch_uses_concurrent_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "content": [{"type": "text", "text": "{\"ok\": true, \"score\": 0.5}"}],
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client =
            Arc::new(AnthropicClient::with_base_url(server.uri(), "k").unwrap());
        let gateway = LlmGateway::new(client);
        let results: HashMap<String, Result<Verdict>> = gateway
            .structured_batch(
                ModelTier::Haiku,
                None,
                vec![
                    ("a".to_string(), "one".to_string()),
                    ("b".to_string(), "two".to_string()),
                ],
                &StructuredOptions::default().json_schema_method(),
            )
            .await;
        assert_eq!(results.len(), 2);
        assert!(results["a"].is_ok());
        assert!(results["b"].is_ok());
    }
}
