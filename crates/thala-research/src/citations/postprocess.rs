//! Citation post-processing
//!
//! Resolves every numeric citation in a final review to a bibliographic
//! record and rewrites the text to stable keys: `[N]` becomes `[@KEY]`
//! inline, and `[N] Title: URL` reference lines become `[@KEY] Title`.
//! Existing items are reused (search by URL), new metadata comes from the
//! translation server enhanced by an LLM over any scraped page content,
//! and identical URLs resolve exactly once.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use thala_core::llm::{LlmGateway, ModelTier, StructuredOptions, StructuredSchema};
use thala_core::stores::{
    StoreManager, ZoteroCreator, ZoteroItemCreate, ZoteroSearchCondition, ZoteroTag,
};

use crate::translation::{TranslationClient, TranslationResult};

/// Concurrent citation resolutions
const RESOLUTION_CONCURRENCY: usize = 3;
/// Polite delay before each translation-server call
const TRANSLATION_DELAY_MS: u64 = 300;
/// Scraped content passed to the enhancement model
const ENHANCEMENT_CONTENT_CHARS: usize = 6_000;

/// One numeric citation found in the references section.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericCitation {
    pub index: usize,
    pub title: String,
    pub url: String,
}

/// Result of a post-processing run.
#[derive(Debug, Clone)]
pub struct PostProcessOutcome {
    pub report: String,
    /// Normalized URL -> bibliographic key
    pub url_to_key: HashMap<String, String>,
    pub created_keys: Vec<String>,
}

/// Metadata after LLM enhancement of a translation result.
#[derive(Debug, Clone, Default, Deserialize)]
struct EnhancedMetadata {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    authors: Vec<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    publication_title: Option<String>,
    #[serde(default)]
    abstract_text: Option<String>,
    #[serde(default)]
    doi: Option<String>,
    #[serde(default)]
    item_type: Option<String>,
}

impl StructuredSchema for EnhancedMetadata {
    fn schema_name() -> &'static str {
        "EnhancedMetadata"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": ["string", "null"]},
                "authors": {"type": "array", "items": {"type": "string"}},
                "date": {"type": ["string", "null"], "description": "YYYY or YYYY-MM-DD"},
                "publication_title": {"type": ["string", "null"]},
                "abstract_text": {"type": ["string", "null"], "description": "1-2 sentences"},
                "doi": {"type": ["string", "null"]},
                "item_type": {
                    "type": ["string", "null"],
                    "description": "webpage, journalArticle, blogPost, report, newspaperArticle, magazineArticle",
                },
            },
            "required": ["authors"],
        })
    }
}

fn reference_line_re() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^\[(\d+)\]\s+(.+?):\s+(https?://\S+)\s*$").expect("static regex")
    })
}

fn inline_citation_re() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[(\d+)\]").expect("static regex"))
}

/// Normalize a URL for deduplication: lowercase host, trailing slash gone.
pub fn normalize_url(url: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some(parts) => parts,
        None => return url.trim_end_matches('/').to_string(),
    };
    let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        format!("{scheme}://{}", host.to_lowercase())
    } else {
        format!("{scheme}://{}/{path}", host.to_lowercase())
    }
}

/// Extract `[N] Title: URL` reference lines.
pub fn extract_numeric_citations(report: &str) -> Vec<NumericCitation> {
    reference_line_re()
        .captures_iter(report)
        .filter_map(|captures| {
            Some(NumericCitation {
                index: captures.get(1)?.as_str().parse().ok()?,
                title: captures.get(2)?.as_str().trim().to_string(),
                url: captures.get(3)?.as_str().to_string(),
            })
        })
        .collect()
}

/// Citation post-processor over the final review.
pub struct CitationPostProcessor {
    stores: Arc<StoreManager>,
    translation: Arc<TranslationClient>,
    gateway: Arc<LlmGateway>,
}

impl CitationPostProcessor {
    pub fn new(
        stores: Arc<StoreManager>,
        translation: Arc<TranslationClient>,
        gateway: Arc<LlmGateway>,
    ) -> Self {
        Self {
            stores,
            translation,
            gateway,
        }
    }

    /// Resolve and rewrite all numeric citations in the report.
    ///
    /// `scraped_content` maps URLs to page content gathered during
    /// research, used to enhance thin translation metadata.
    pub async fn process(
        &self,
        report: &str,
        scraped_content: &HashMap<String, String>,
    ) -> PostProcessOutcome {
        let citations = extract_numeric_citations(report);
        if citations.is_empty() {
            info!("no numeric citations to process");
            return PostProcessOutcome {
                report: report.to_string(),
                url_to_key: HashMap::new(),
                created_keys: vec![],
            };
        }
        info!(count = citations.len(), "processing numeric citations");

        // Identical URLs resolve once
        let mut unique_urls: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for citation in &citations {
            let normalized = normalize_url(&citation.url);
            if seen.insert(normalized.clone()) {
                unique_urls.push(citation.url.clone());
            }
        }

        let semaphore = Arc::new(Semaphore::new(RESOLUTION_CONCURRENCY));
        let tasks = unique_urls.iter().map(|url| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                let key = self.resolve_one(url, scraped_content).await;
                (normalize_url(url), key)
            }
        });

        let results = futures::future::join_all(tasks).await;

        let mut url_to_key = HashMap::new();
        let mut created_keys = Vec::new();
        for (url, key) in results {
            if let Some(key) = key {
                created_keys.push(key.clone());
                url_to_key.insert(url, key);
            }
        }

        info!(
            resolved = url_to_key.len(),
            total = unique_urls.len(),
            "citation resolution complete"
        );

        let report = rewrite_citations(report, &citations, &url_to_key);
        PostProcessOutcome {
            report,
            url_to_key,
            created_keys,
        }
    }

    /// Resolve one URL to a bibliographic key.
    async fn resolve_one(
        &self,
        url: &str,
        scraped_content: &HashMap<String, String>,
    ) -> Option<String> {
        // Reuse an existing item when one is already linked to this URL
        match self.find_existing(url).await {
            Some(key) => {
                info!(key, url = preview(url), "reusing existing bibliographic item");
                return Some(key);
            }
            None => debug!(url = preview(url), "no existing item for URL"),
        }

        // Be polite to the translation server
        tokio::time::sleep(Duration::from_millis(TRANSLATION_DELAY_MS)).await;
        let translation = self.translation.translate_url(url).await;

        let scraped = scraped_content
            .get(url)
            .or_else(|| scraped_content.get(&normalize_url(url)));
        let enhanced = self.enhance_metadata(translation.as_ref(), url, scraped).await;

        match self.create_item(url, &enhanced).await {
            Some(key) => {
                info!(key, url = preview(url), "created bibliographic item");
                Some(key)
            }
            None => {
                warn!(url = preview(url), "failed to create bibliographic item");
                None
            }
        }
    }

    async fn find_existing(&self, url: &str) -> Option<String> {
        let results = self
            .stores
            .zotero
            .search(&[ZoteroSearchCondition::is("url", url)], 1)
            .await
            .ok()?;
        results.first().map(|item| item.key.clone())
    }

    /// Fill and correct translation metadata with the page content.
    async fn enhance_metadata(
        &self,
        translation: Option<&TranslationResult>,
        url: &str,
        scraped: Option<&String>,
    ) -> EnhancedMetadata {
        let translation_json = translation
            .map(|t| t.to_value_for_enhancement())
            .unwrap_or_else(|| json!({"itemType": "webpage", "url": url}));

        let content = scraped
            .map(|content| {
                let mut end = ENHANCEMENT_CONTENT_CHARS.min(content.len());
                while end > 0 && !content.is_char_boundary(end) {
                    end -= 1;
                }
                &content[..end]
            })
            .unwrap_or("No content available.");

        let prompt = format!(
            "You are improving bibliographic metadata for a web source.\n\n\
             The translation server provided this metadata (fields may be empty):\n\
             {translation}\n\n\
             Content from the source page:\n{content}\n\n\
             Fill in empty fields from the page content, correct obvious errors, \
             determine the publication date if possible, and format author names \
             as \"First Last\". Use null for fields you cannot determine; be \
             accurate, don't guess.",
            translation = serde_json::to_string_pretty(&translation_json).unwrap_or_default(),
        );

        match self
            .gateway
            .structured::<EnhancedMetadata>(
                ModelTier::Haiku,
                None,
                &prompt,
                &StructuredOptions::default().json_schema_method(),
            )
            .await
        {
            Ok(enhanced) => enhanced,
            Err(e) => {
                warn!("metadata enhancement failed: {e}");
                // Fall back to whatever the translation carried
                match translation {
                    Some(t) => EnhancedMetadata {
                        title: t.title.clone(),
                        authors: t.creators.iter().map(|c| c.full_name()).collect(),
                        date: t.date.clone(),
                        publication_title: t
                            .publication_title
                            .clone()
                            .or_else(|| t.website_title.clone()),
                        abstract_text: t.abstract_note.clone(),
                        doi: t.doi.clone(),
                        item_type: Some(t.item_type.clone()),
                    },
                    None => EnhancedMetadata {
                        title: Some(url.to_string()),
                        item_type: Some("webpage".to_string()),
                        ..Default::default()
                    },
                }
            }
        }
    }

    async fn create_item(&self, url: &str, metadata: &EnhancedMetadata) -> Option<String> {
        let item_type = map_item_type(metadata.item_type.as_deref());

        let mut fields: BTreeMap<String, Value> = BTreeMap::new();
        fields.insert(
            "title".to_string(),
            json!(metadata.title.clone().unwrap_or_else(|| url.to_string())),
        );
        fields.insert("url".to_string(), json!(url));
        if let Some(date) = &metadata.date {
            fields.insert("date".to_string(), json!(date));
        }
        if let Some(publication) = &metadata.publication_title {
            let field = if item_type == "webpage" {
                "websiteTitle"
            } else {
                "publicationTitle"
            };
            fields.insert(field.to_string(), json!(publication));
        }
        if let Some(abstract_text) = &metadata.abstract_text {
            fields.insert("abstractNote".to_string(), json!(abstract_text));
        }
        if let Some(doi) = &metadata.doi {
            fields.insert("DOI".to_string(), json!(doi));
        }

        let creators: Vec<ZoteroCreator> = metadata
            .authors
            .iter()
            .filter(|name| !name.trim().is_empty())
            .map(|name| ZoteroCreator::from_name(name))
            .collect();

        match self
            .stores
            .zotero
            .add(&ZoteroItemCreate {
                item_type: item_type.to_string(),
                fields,
                creators,
                tags: vec![
                    ZoteroTag::user("thala-research"),
                    ZoteroTag::user("auto-citation"),
                ],
                collections: vec![],
            })
            .await
        {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("item creation failed: {e}");
                None
            }
        }
    }
}

fn map_item_type(item_type: Option<&str>) -> &'static str {
    match item_type {
        Some("journalArticle") => "journalArticle",
        Some("blogPost") => "blogPost",
        Some("report") => "report",
        Some("newspaperArticle") => "newspaperArticle",
        Some("magazineArticle") => "magazineArticle",
        Some("book") => "book",
        Some("bookSection") => "bookSection",
        Some("conferencePaper") => "conferencePaper",
        Some("thesis") => "thesis",
        Some("document") => "document",
        _ => "webpage",
    }
}

/// Rewrite numeric citations to stable keys.
fn rewrite_citations(
    report: &str,
    citations: &[NumericCitation],
    url_to_key: &HashMap<String, String>,
) -> String {
    let index_to_key: HashMap<usize, &String> = citations
        .iter()
        .filter_map(|citation| {
            url_to_key
                .get(&normalize_url(&citation.url))
                .map(|key| (citation.index, key))
        })
        .collect();

    if index_to_key.is_empty() {
        return report.to_string();
    }

    // References section first: [N] Title: URL -> [@KEY] Title
    let updated = reference_line_re().replace_all(report, |captures: &regex::Captures<'_>| {
        let index: usize = captures[1].parse().unwrap_or(0);
        match index_to_key.get(&index) {
            Some(key) => format!("[@{key}] {}", &captures[2]),
            None => captures[0].to_string(),
        }
    });

    // Then inline markers: [N] -> [@KEY]
    inline_citation_re()
        .replace_all(&updated, |captures: &regex::Captures<'_>| {
            let index: usize = captures[1].parse().unwrap_or(0);
            match index_to_key.get(&index) {
                Some(key) => format!("[@{key}]"),
                None => captures[0].to_string(),
            }
        })
        .to_string()
}

fn preview(url: &str) -> String {
    url.chars().take(50).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url("https://Example.ORG/Path/"),
            "https://example.org/Path"
        );
        assert_eq!(normalize_url("https://example.org/"), "https://example.org");
        assert_eq!(
            normalize_url("https://example.org"),
            normalize_url("https://EXAMPLE.org/")
        );
    }

    #[test]
    fn test_extract_numeric_citations() {
        let report = "Body text [1] and [2].\n\n## References\n\n\
                      [1] First Paper: https://example.org/one\n\
                      [2] Second Paper: https://example.org/two\n\
                      Not a reference line\n";
        let citations = extract_numeric_citations(report);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].index, 1);
        assert_eq!(citations[0].title, "First Paper");
        assert_eq!(citations[1].url, "https://example.org/two");
    }

    #[test]
    fn test_rewrite_citations() {
        let report = "A claim [1] and another [2], plus unresolved [3].\n\n\
                      [1] First Paper: https://example.org/one\n\
                      [2] Second Paper: https://example.org/two\n\
                      [3] Third Paper: https://example.org/three\n";
        let citations = extract_numeric_citations(report);
        let mut url_to_key = HashMap::new();
        url_to_key.insert(
            normalize_url("https://example.org/one"),
            "AAAA1111".to_string(),
        );
        url_to_key.insert(
            normalize_url("https://example.org/two"),
            "BBBB2222".to_string(),
        );

        let rewritten = rewrite_citations(report, &citations, &url_to_key);
        assert!(rewritten.contains("A claim [@AAAA1111] and another [@BBBB2222]"));
        assert!(rewritten.contains("[@AAAA1111] First Paper"));
        assert!(!rewritten.contains("https://example.org/one"));
        // Unresolved citations keep their numeric form
        assert!(rewritten.contains("[3] Third Paper: https://example.org/three"));
        assert!(rewritten.contains("unresolved [3]"));
    }

    #[test]
    fn test_duplicate_urls_map_to_same_key() {
        let report = "See [1] and again [2].\n\n\
                      [1] Same Paper: https://example.org/same\n\
                      [2] Same Paper: https://example.org/same/\n";
        let citations = extract_numeric_citations(report);
        let mut url_to_key = HashMap::new();
        url_to_key.insert(
            normalize_url("https://example.org/same"),
            "SAME0001".to_string(),
        );

        let rewritten = rewrite_citations(report, &citations, &url_to_key);
        assert!(rewritten.contains("See [@SAME0001] and again [@SAME0001]"));
    }

    #[test]
    fn test_map_item_type() {
        assert_eq!(map_item_type(Some("journalArticle")), "journalArticle");
        assert_eq!(map_item_type(Some("unknown_kind")), "webpage");
        assert_eq!(map_item_type(None), "webpage");
    }
}
