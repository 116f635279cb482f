//! Content/metadata cross-validation
//!
//! Lightweight check that extracted content matches the claimed
//! bibliographic metadata. Heuristics first (ISBN literal, author surname,
//! year); only when those are inconclusive does an LLM decide, with a
//! strict lenient bias. A mismatch never aborts processing.

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use thala_core::llm::{LlmGateway, ModelTier, StructuredOptions, StructuredSchema};
use thala_core::text::{first_n_pages, last_n_pages};

use super::prompts::metadata_match_user;
use super::state::DocumentMetadata;

/// Outcome of the content/metadata check.
#[derive(Debug, Clone)]
pub struct MetadataValidation {
    pub matched: bool,
    /// "heuristic_isbn", "heuristic_author", "heuristic_year", "llm",
    /// "no_metadata"
    pub method: &'static str,
    pub notes: String,
}

#[derive(Debug, Deserialize)]
struct MetadataMatchVerdict {
    matches: bool,
    #[serde(default)]
    reason: String,
}

impl StructuredSchema for MetadataMatchVerdict {
    fn schema_name() -> &'static str {
        "MetadataMatchVerdict"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "matches": {"type": "boolean"},
                "reason": {"type": "string"},
            },
            "required": ["matches"],
        })
    }
}

fn surname(full_name: &str) -> Option<&str> {
    full_name.split_whitespace().last().filter(|s| s.len() > 2)
}

fn year_of(date: &str) -> Option<&str> {
    let digits: &str = date.get(..4)?;
    digits.chars().all(|c| c.is_ascii_digit()).then_some(digits)
}

/// Check extracted content against bibliographic metadata.
pub async fn validate_content_metadata(
    gateway: &LlmGateway,
    markdown: &str,
    metadata: &DocumentMetadata,
) -> MetadataValidation {
    let has_signal = metadata.isbn.is_some()
        || !metadata.authors.is_empty()
        || metadata.date.is_some()
        || metadata.title.is_some();
    if !has_signal {
        return MetadataValidation {
            matched: true,
            method: "no_metadata",
            notes: "no metadata to validate against".to_string(),
        };
    }

    // ISBN literal match is decisive
    if let Some(isbn) = &metadata.isbn {
        let normalized: String = isbn.chars().filter(|c| c.is_ascii_digit()).collect();
        if normalized.len() >= 10 {
            let content_digits: String =
                markdown.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
            if content_digits.contains(&normalized) {
                debug!("metadata validated by ISBN literal match");
                return MetadataValidation {
                    matched: true,
                    method: "heuristic_isbn",
                    notes: format!("ISBN {isbn} found in content"),
                };
            }
        }
    }

    // Author surname appearing in the front or back matter
    let sample = format!("{}\n{}", first_n_pages(markdown, 10), last_n_pages(markdown, 10));
    let sample_lower = sample.to_lowercase();
    for author in &metadata.authors {
        if let Some(surname) = surname(author) {
            if sample_lower.contains(&surname.to_lowercase()) {
                debug!(author, "metadata validated by author surname");
                return MetadataValidation {
                    matched: true,
                    method: "heuristic_author",
                    notes: format!("author surname {surname:?} found in content"),
                };
            }
        }
    }

    // Publication year appearing in the sample
    if let Some(year) = metadata.date.as_deref().and_then(year_of) {
        if sample.contains(year) {
            debug!(year, "metadata validated by year match");
            return MetadataValidation {
                matched: true,
                method: "heuristic_year",
                notes: format!("year {year} found in content"),
            };
        }
    }

    // Heuristics inconclusive: ask the model, leniently
    let metadata_json = serde_json::to_string_pretty(metadata).unwrap_or_default();
    let verdict = gateway
        .structured::<MetadataMatchVerdict>(
            ModelTier::Haiku,
            None,
            &metadata_match_user(first_n_pages(markdown, 5), &metadata_json),
            &StructuredOptions::default().json_schema_method(),
        )
        .await;

    match verdict {
        Ok(verdict) => {
            if !verdict.matches {
                info!("content/metadata mismatch flagged: {}", verdict.reason);
            }
            MetadataValidation {
                matched: verdict.matches,
                method: "llm",
                notes: verdict.reason,
            }
        }
        // The check is informational; an unavailable model never blocks
        Err(e) => MetadataValidation {
            matched: true,
            method: "llm",
            notes: format!("validation unavailable: {e}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use thala_core::llm::AnthropicClient;

    fn offline_gateway() -> LlmGateway {
        LlmGateway::new(Arc::new(
            AnthropicClient::with_base_url("http://127.0.0.1:1", "k").unwrap(),
        ))
    }

    #[tokio::test]
    async fn test_isbn_heuristic_short_circuits() {
        let metadata = DocumentMetadata {
            isbn: Some("978-0-306-40615-7".to_string()),
            ..Default::default()
        };
        let markdown = "Front matter\nISBN 978-0-306-40615-7\nBody text";
        let validation =
            validate_content_metadata(&offline_gateway(), markdown, &metadata).await;
        assert!(validation.matched);
        assert_eq!(validation.method, "heuristic_isbn");
    }

    #[tokio::test]
    async fn test_author_surname_heuristic() {
        let metadata = DocumentMetadata {
            authors: vec!["Ada Lovelace".to_string()],
            ..Default::default()
        };
        let markdown = "A treatise by LOVELACE on analytical engines.";
        let validation =
            validate_content_metadata(&offline_gateway(), markdown, &metadata).await;
        assert!(validation.matched);
        assert_eq!(validation.method, "heuristic_author");
    }

    #[tokio::test]
    async fn test_no_metadata_is_trivially_valid() {
        let validation = validate_content_metadata(
            &offline_gateway(),
            "any content",
            &DocumentMetadata::default(),
        )
        .await;
        assert!(validation.matched);
        assert_eq!(validation.method, "no_metadata");
    }

    #[tokio::test]
    async fn test_llm_unavailable_defaults_to_match() {
        // Heuristics fail and the model endpoint is unreachable
        let metadata = DocumentMetadata {
            title: Some("Unrelated Title".to_string()),
            authors: vec!["Q Zyx".to_string()],
            ..Default::default()
        };
        let validation =
            validate_content_metadata(&offline_gateway(), "different text entirely", &metadata)
                .await;
        assert!(validation.matched);
    }
}
