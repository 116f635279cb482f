//! Web search and fact checking
//!
//! Bearer-authenticated search over the external web-search service, plus
//! a fact-check helper that synthesizes a verdict from the returned
//! snippets with a Haiku call.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use thala_core::llm::{LlmGateway, ModelTier, parse_json_payload};

use crate::error::{Result, WorkflowError};

const DEFAULT_API_URL: &str = "https://api.perplexity.ai";
const MAX_RESULTS: usize = 20;

/// One web search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchResult {
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// Verdict on a factual claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactVerdict {
    Supported,
    Refuted,
    PartiallySupported,
    Unverifiable,
}

impl FactVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactVerdict::Supported => "supported",
            FactVerdict::Refuted => "refuted",
            FactVerdict::PartiallySupported => "partially_supported",
            FactVerdict::Unverifiable => "unverifiable",
        }
    }
}

/// Outcome of a fact check.
#[derive(Debug, Clone, Serialize)]
pub struct FactCheckOutcome {
    pub claim: String,
    pub verdict: FactVerdict,
    pub confidence: f64,
    pub explanation: String,
    pub sources: Vec<WebSearchResult>,
}

#[derive(Debug, Deserialize)]
struct VerdictSynthesis {
    verdict: String,
    confidence: f64,
    explanation: String,
}

/// Client for the web-search service.
pub struct WebSearchClient {
    http: reqwest::Client,
    base_url: String,
    gateway: Arc<LlmGateway>,
}

impl WebSearchClient {
    pub fn new(api_key: &str, gateway: Arc<LlmGateway>) -> Result<Self> {
        Self::with_base_url(DEFAULT_API_URL, api_key, gateway)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: &str,
        gateway: Arc<LlmGateway>,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| WorkflowError::Validation("API key is not a valid header".into()))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .default_headers(headers)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            gateway,
        })
    }

    /// Search the web.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        domain_filter: Option<&[String]>,
    ) -> Result<Vec<WebSearchResult>> {
        let limit = limit.clamp(1, MAX_RESULTS);
        let mut body = json!({"query": query, "max_results": limit});
        if let Some(domains) = domain_filter {
            body["search_domain_filter"] = json!(domains);
        }

        let response = self
            .http
            .post(format!("{}/search", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(WorkflowError::Service(format!(
                "web search returned {status}: {text}"
            )));
        }

        let payload: Value = response.json().await?;
        let results = payload
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        debug!(query, count = results.len(), "web search complete");
        Ok(results
            .into_iter()
            .take(limit)
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect())
    }

    /// Verify a factual claim against web evidence.
    ///
    /// Searches for the claim, then synthesizes a verdict from the top
    /// snippets. Failures degrade to an unverifiable verdict rather than
    /// erroring, so checking never sinks a loop iteration.
    pub async fn check_fact(&self, claim: &str, context: Option<&str>) -> FactCheckOutcome {
        let mut query = format!("Is this claim accurate? Provide evidence: '{claim}'");
        if let Some(context) = context {
            query.push_str(&format!(" Context: {context}"));
        }

        let sources = match self.search(&query, 10, None).await {
            Ok(sources) => sources,
            Err(e) => {
                warn!("fact-check search failed: {e}");
                return FactCheckOutcome {
                    claim: claim.to_string(),
                    verdict: FactVerdict::Unverifiable,
                    confidence: 0.0,
                    explanation: format!("Fact-check failed: {e}"),
                    sources: vec![],
                };
            }
        };

        let evidence: String = sources
            .iter()
            .take(5)
            .map(|result| {
                let snippet = result.snippet.as_deref().unwrap_or("No snippet");
                let snippet = if snippet.len() > 300 {
                    let mut end = 300;
                    while !snippet.is_char_boundary(end) {
                        end -= 1;
                    }
                    &snippet[..end]
                } else {
                    snippet
                };
                format!("- {}: {}", result.title, snippet)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let synthesis_prompt = format!(
            "Analyze these search results to fact-check the claim.\n\n\
             Claim: {claim}\n\n\
             Evidence from search:\n{evidence}\n\n\
             Respond with ONLY valid JSON (no markdown):\n\
             {{\"verdict\": \"supported\" or \"refuted\" or \"partially_supported\" or \
             \"unverifiable\", \"confidence\": 0.0-1.0, \"explanation\": \"Brief \
             explanation of the verdict based on evidence\"}}"
        );

        let synthesis = self
            .gateway
            .complete_text(ModelTier::Haiku, None, &synthesis_prompt, 1024)
            .await
            .ok()
            .and_then(|text| parse_json_payload::<VerdictSynthesis>(&text).ok());

        let (verdict, confidence, explanation) = match synthesis {
            Some(synthesis) => {
                let verdict = match synthesis.verdict.as_str() {
                    "supported" => FactVerdict::Supported,
                    "refuted" => FactVerdict::Refuted,
                    "partially_supported" => FactVerdict::PartiallySupported,
                    _ => FactVerdict::Unverifiable,
                };
                (verdict, synthesis.confidence, synthesis.explanation)
            }
            None => (
                FactVerdict::Unverifiable,
                0.5,
                "Could not synthesize a verdict from the evidence".to_string(),
            ),
        };

        info!(
            verdict = verdict.as_str(),
            confidence, "fact-check complete for claim"
        );

        FactCheckOutcome {
            claim: claim.to_string(),
            verdict,
            confidence,
            explanation,
            sources: sources.into_iter().take(5).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thala_core::llm::AnthropicClient;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn gateway_stub(server: &MockServer) -> Arc<LlmGateway> {
        Arc::new(LlmGateway::new(Arc::new(
            AnthropicClient::with_base_url(server.uri(), "k").unwrap(),
        )))
    }

    #[tokio::test]
    async fn test_search_parses_results() {
        let search_server = MockServer::start().await;
        let llm_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_partial_json(json!({"max_results": 3})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"title": "A", "url": "https://a", "snippet": "aa", "date": "2024-01-01"},
                    {"title": "B", "url": "https://b"},
                ]
            })))
            .mount(&search_server)
            .await;

        let client = WebSearchClient::with_base_url(
            search_server.uri(),
            "key",
            gateway_stub(&llm_server).await,
        )
        .unwrap();
        let results = client.search("test query", 3, None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "A");
        assert_eq!(results[1].snippet, None);
    }

    #[tokio::test]
    async fn test_check_fact_synthesizes_verdict() {
        let search_server = MockServer::start().await;
        let llm_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"title": "Evidence", "url": "https://e", "snippet": "it is true"}]
            })))
            .mount(&search_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "m",
                "content": [{"type": "text", "text":
                    "{\"verdict\": \"supported\", \"confidence\": 0.9, \"explanation\": \"clear\"}"}],
            })))
            .mount(&llm_server)
            .await;

        let client = WebSearchClient::with_base_url(
            search_server.uri(),
            "key",
            gateway_stub(&llm_server).await,
        )
        .unwrap();
        let outcome = client.check_fact("water is wet", None).await;
        assert_eq!(outcome.verdict, FactVerdict::Supported);
        assert!(outcome.confidence > 0.8);
        assert_eq!(outcome.sources.len(), 1);
    }

    #[tokio::test]
    async fn test_check_fact_degrades_on_search_failure() {
        let search_server = MockServer::start().await;
        let llm_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&search_server)
            .await;

        let client = WebSearchClient::with_base_url(
            search_server.uri(),
            "key",
            gateway_stub(&llm_server).await,
        )
        .unwrap();
        let outcome = client.check_fact("anything", None).await;
        assert_eq!(outcome.verdict, FactVerdict::Unverifiable);
        assert_eq!(outcome.confidence, 0.0);
    }
}
