//! Agent tools scoped to the paper corpus
//!
//! `search_papers`: hybrid semantic + keyword search over the corpus,
//! fused with reciprocal-rank fusion and floored on relevance to prevent
//! citation drift. `get_paper_content`: fetch by bibliographic key or DOI,
//! preferring the 10:1 summary. `check_fact`: web verification.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, warn};

use thala_core::llm::Tool;
use thala_core::search::{RRF_K, reciprocal_rank_fusion};
use thala_core::stores::StoreManager;

use super::store_query::{DEFAULT_CONTENT_CHARS, MAX_CONTENT_CHARS, StoreQuery};
use super::types::PaperSummary;
use crate::web::WebSearchClient;

/// Hard cap on search results
const SEARCH_LIMIT_CAP: usize = 20;
/// Minimum normalized relevance for a result to surface
const MINIMUM_RELEVANCE: f32 = 0.5;

/// Shared, read-only corpus view handed to the tools.
pub struct PaperCorpus {
    /// DOI -> summary
    pub summaries: HashMap<String, PaperSummary>,
    /// DOI -> bibliographic key
    pub bib_keys: HashMap<String, String>,
}

impl PaperCorpus {
    pub fn new(
        summaries: HashMap<String, PaperSummary>,
        bib_keys: HashMap<String, String>,
    ) -> Self {
        Self { summaries, bib_keys }
    }

    /// All keys considered part of the corpus.
    pub fn key_set(&self) -> HashSet<String> {
        let mut keys: HashSet<String> = self.bib_keys.values().cloned().collect();
        keys.extend(
            self.summaries
                .values()
                .filter_map(|summary| summary.bib_key.clone()),
        );
        keys
    }

    fn summary_for_key(&self, bib_key: &str) -> Option<(&String, &PaperSummary)> {
        self.summaries.iter().find(|(doi, summary)| {
            summary.bib_key.as_deref() == Some(bib_key)
                || self.bib_keys.get(*doi).map(String::as_str) == Some(bib_key)
        })
    }

    fn key_for_doi(&self, doi: &str) -> Option<String> {
        self.bib_keys.get(doi).cloned().or_else(|| {
            self.summaries
                .get(doi)
                .and_then(|summary| summary.bib_key.clone())
        })
    }
}

// ============================================================================
// SEARCH TOOL
// ============================================================================

/// Hybrid paper search over the corpus.
pub struct PaperSearchTool {
    stores: Arc<StoreManager>,
    corpus: Arc<PaperCorpus>,
}

impl PaperSearchTool {
    pub fn new(stores: Arc<StoreManager>, corpus: Arc<PaperCorpus>) -> Self {
        Self { stores, corpus }
    }

    /// Semantic leg: query embedding against the vector index.
    async fn semantic_search(&self, query: &str, limit: usize) -> Vec<(String, f32)> {
        let embedding = match self.stores.embedding.embed_query(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!("semantic search embedding failed: {e}");
                return vec![];
            }
        };

        let matches = match self.stores.vectors.search(&embedding, limit * 2, None).await {
            Ok(matches) => matches,
            Err(e) => {
                warn!("vector search failed: {e}");
                return vec![];
            }
        };

        let mut seen = HashSet::new();
        matches
            .into_iter()
            .filter_map(|hit| {
                let bib_key = hit
                    .metadata
                    .as_ref()?
                    .get("bib_key")?
                    .as_str()?
                    .to_string();
                seen.insert(bib_key.clone()).then(|| {
                    let similarity = (1.0 - hit.distance).max(0.0) as f32;
                    (bib_key, similarity)
                })
            })
            .collect()
    }

    /// Keyword leg: text-index match on content.
    async fn keyword_search(&self, query: &str, limit: usize) -> Vec<(String, f32)> {
        let records = match self
            .stores
            .main
            .search(&json!({"match": {"content": query}}), limit * 2, None)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!("keyword search failed: {e}");
                return vec![];
            }
        };

        let mut seen = HashSet::new();
        records
            .into_iter()
            .filter_map(|record| {
                let bib_key = record.bib_key?;
                seen.insert(bib_key.clone()).then_some((bib_key, 1.0))
            })
            .collect()
    }
}

#[async_trait]
impl Tool for PaperSearchTool {
    fn name(&self) -> &str {
        "search_papers"
    }

    fn description(&self) -> &str {
        "Search available papers by topic using hybrid semantic + keyword \
         search. Returns brief metadata with bib_key citation keys; use \
         get_paper_content for details."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Topic, keyword, or concept"},
                "limit": {"type": "integer", "description": "Max papers (default 10, max 20)"},
            },
            "required": ["query"],
        })
    }

    async fn invoke(&self, args: Value) -> std::result::Result<Value, String> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or("query is required")?;
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(10)
            .clamp(1, SEARCH_LIMIT_CAP);

        let (semantic, keyword) =
            tokio::join!(self.semantic_search(query, limit), self.keyword_search(query, limit));

        let fused = reciprocal_rank_fusion(&[&semantic, &keyword], RRF_K);

        // Normalize against the best fused score so the relevance floor is
        // meaningful across corpus sizes
        let top_score = fused.first().map(|(_, s)| *s).unwrap_or(0.0).max(f32::MIN_POSITIVE);

        let papers: Vec<Value> = fused
            .into_iter()
            .map(|(key, score)| (key, score / top_score))
            .filter(|(_, relevance)| *relevance >= MINIMUM_RELEVANCE)
            .take(limit)
            .filter_map(|(key, relevance)| {
                let (doi, summary) = self.corpus.summary_for_key(&key)?;
                Some(json!({
                    "doi": doi,
                    "title": summary.title.chars().take(100).collect::<String>(),
                    "year": summary.year,
                    "authors": summary.author_label(),
                    "relevance": (relevance * 1000.0).round() / 1000.0,
                    "bib_key": key,
                }))
            })
            .collect();

        info!(query = query.chars().take(30).collect::<String>(), results = papers.len(), "search_papers");

        Ok(json!({
            "query": query,
            "total_found": papers.len(),
            "papers": papers,
        }))
    }
}

// ============================================================================
// CONTENT TOOL
// ============================================================================

/// Fetch detailed paper content by bibliographic key or DOI.
pub struct PaperContentTool {
    query: Arc<StoreQuery>,
    corpus: Arc<PaperCorpus>,
}

impl PaperContentTool {
    pub fn new(query: Arc<StoreQuery>, corpus: Arc<PaperCorpus>) -> Self {
        Self { query, corpus }
    }
}

#[async_trait]
impl Tool for PaperContentTool {
    fn name(&self) -> &str {
        "get_paper_content"
    }

    fn description(&self) -> &str {
        "Fetch detailed content for one paper by bib_key or DOI. Returns \
         the 10:1 compressed summary where available, falling back to the \
         original text."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "bib_key": {"type": "string", "description": "8-char citation key"},
                "doi": {"type": "string", "description": "DOI, when the key is unknown"},
                "max_chars": {"type": "integer", "description": "Content cap (default 10000, max 20000)"},
            },
        })
    }

    async fn invoke(&self, args: Value) -> std::result::Result<Value, String> {
        let max_chars = args
            .get("max_chars")
            .and_then(Value::as_u64)
            .map(|c| c as usize)
            .unwrap_or(DEFAULT_CONTENT_CHARS)
            .clamp(1, MAX_CONTENT_CHARS);

        let bib_key = match args.get("bib_key").and_then(Value::as_str) {
            Some(key) => key.to_string(),
            None => {
                let doi = args
                    .get("doi")
                    .and_then(Value::as_str)
                    .ok_or("either bib_key or doi is required")?;
                self.corpus
                    .key_for_doi(doi)
                    .ok_or_else(|| format!("no citation key known for DOI {doi}"))?
            }
        };

        let fetched = self
            .query
            .get_paper_content(&bib_key, max_chars)
            .await
            .map_err(|e| e.to_string())?;

        let summary = self.corpus.summary_for_key(&bib_key);
        match fetched {
            Some(content) => Ok(json!({
                "bib_key": bib_key,
                "title": summary.map(|(_, s)| s.title.clone()).unwrap_or_else(|| "Unknown".into()),
                "content": content.content,
                "compression_level": content.compression_level,
                "key_findings": summary
                    .map(|(_, s)| s.key_findings.iter().take(5).cloned().collect::<Vec<_>>())
                    .unwrap_or_default(),
                "truncated": content.truncated,
            })),
            None => {
                // Fall back to whatever the corpus summary knows
                let fallback = summary
                    .map(|(_, s)| {
                        format!(
                            "No detailed content available.\n\nShort summary: {}\nMethodology: {}",
                            s.short_summary,
                            s.methodology.as_deref().unwrap_or("N/A"),
                        )
                    })
                    .unwrap_or_else(|| format!("Paper with key {bib_key} not found."));
                Ok(json!({
                    "bib_key": bib_key,
                    "content": fallback,
                    "truncated": false,
                }))
            }
        }
    }
}

// ============================================================================
// FACT CHECK TOOL
// ============================================================================

/// Web fact-check tool for checking agents.
pub struct FactCheckTool {
    web: Arc<WebSearchClient>,
}

impl FactCheckTool {
    pub fn new(web: Arc<WebSearchClient>) -> Self {
        Self { web }
    }
}

#[async_trait]
impl Tool for FactCheckTool {
    fn name(&self) -> &str {
        "check_fact"
    }

    fn description(&self) -> &str {
        "Verify a factual claim against the web. Returns a verdict \
         (supported/refuted/partially_supported/unverifiable) with \
         confidence and sources."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "claim": {"type": "string"},
                "context": {"type": "string", "description": "Where the claim came from"},
            },
            "required": ["claim"],
        })
    }

    async fn invoke(&self, args: Value) -> std::result::Result<Value, String> {
        let claim = args
            .get("claim")
            .and_then(Value::as_str)
            .ok_or("claim is required")?;
        let context = args.get("context").and_then(Value::as_str);

        let outcome = self.web.check_fact(claim, context).await;
        serde_json::to_value(&outcome).map_err(|e| e.to_string())
    }
}

/// Standard tool set for the editing and checking loops.
pub fn paper_tools(
    stores: Arc<StoreManager>,
    query: Arc<StoreQuery>,
    corpus: Arc<PaperCorpus>,
) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(PaperSearchTool::new(stores, corpus.clone())),
        Arc::new(PaperContentTool::new(query, corpus)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus_with(doi: &str, key: &str, title: &str) -> PaperCorpus {
        let mut summaries = HashMap::new();
        summaries.insert(
            doi.to_string(),
            PaperSummary {
                doi: doi.to_string(),
                title: title.to_string(),
                bib_key: Some(key.to_string()),
                ..Default::default()
            },
        );
        let mut bib_keys = HashMap::new();
        bib_keys.insert(doi.to_string(), key.to_string());
        PaperCorpus::new(summaries, bib_keys)
    }

    #[test]
    fn test_corpus_key_lookups() {
        let corpus = corpus_with("10.1/x", "ABCD1234", "A Paper");
        assert_eq!(corpus.key_for_doi("10.1/x").as_deref(), Some("ABCD1234"));
        assert!(corpus.key_for_doi("10.9/none").is_none());

        let (doi, summary) = corpus.summary_for_key("ABCD1234").unwrap();
        assert_eq!(doi, "10.1/x");
        assert_eq!(summary.title, "A Paper");

        assert!(corpus.key_set().contains("ABCD1234"));
    }
}
