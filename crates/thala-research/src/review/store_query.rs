//! Store queries for the review loops
//!
//! Fetches paper content at the right compression level: the 10:1 summary
//! when one exists, the original otherwise. Oversized originals get their
//! 10:1 summary generated on first use and persisted for future calls.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use thala_core::llm::LlmGateway;
use thala_core::records::StoreRecord;
use thala_core::stores::StoreManager;
use thala_core::text::count_words;

use crate::citations::extract_citation_keys;
use crate::error::Result;

/// Originals above this size get a lazily generated 10:1 summary
pub const LAZY_TENTH_THRESHOLD_CHARS: usize = 150_000;
/// Default cap on returned content
pub const DEFAULT_CONTENT_CHARS: usize = 10_000;
/// Hard cap on returned content
pub const MAX_CONTENT_CHARS: usize = 20_000;

/// Paper content fetched for a loop or tool.
#[derive(Debug, Clone)]
pub struct PaperContent {
    pub bib_key: String,
    pub content: String,
    pub compression_level: u8,
    pub truncated: bool,
}

/// Query service over the tiered store for the review loops.
pub struct StoreQuery {
    stores: Arc<StoreManager>,
    gateway: Arc<LlmGateway>,
}

impl StoreQuery {
    pub fn new(stores: Arc<StoreManager>, gateway: Arc<LlmGateway>) -> Self {
        Self { stores, gateway }
    }

    pub fn stores(&self) -> &Arc<StoreManager> {
        &self.stores
    }

    /// Fetch content for a bibliographic key, preferring the 10:1 level.
    pub async fn get_paper_content(
        &self,
        bib_key: &str,
        max_chars: usize,
    ) -> Result<Option<PaperContent>> {
        let max_chars = max_chars.clamp(1, MAX_CONTENT_CHARS);

        let l0 = self.stores.main.get_by_bib_key(bib_key, 0).await?;

        if let Some(l0) = &l0 {
            // Prefer the derivative located through lineage
            if let Some(l2) = self.stores.main.get_by_source_id(l0.id, 2).await? {
                return Ok(Some(clamp(bib_key, &l2.content, 2, max_chars)));
            }

            if l0.content.len() > LAZY_TENTH_THRESHOLD_CHARS {
                info!(
                    bib_key,
                    chars = l0.content.len(),
                    "original too large, generating 10:1 summary on the fly"
                );
                match self.generate_and_persist_tenth(l0).await {
                    Ok(summary) => return Ok(Some(clamp(bib_key, &summary, 2, max_chars))),
                    Err(e) => {
                        warn!(bib_key, "lazy 10:1 generation failed: {e}");
                        // fall through to the raw original
                    }
                }
            }

            return Ok(Some(clamp(bib_key, &l0.content, 0, max_chars)));
        }

        // No original under this key; a summary may still be indexed
        if let Some(l2) = self.stores.main.get_by_bib_key(bib_key, 2).await? {
            return Ok(Some(clamp(bib_key, &l2.content, 2, max_chars)));
        }
        if let Some(l1) = self.stores.main.get_by_bib_key(bib_key, 1).await? {
            return Ok(Some(clamp(bib_key, &l1.content, 1, max_chars)));
        }

        debug!(bib_key, "no record found for key");
        Ok(None)
    }

    /// Generate the 10:1 summary for an oversized original and persist it
    /// so the next request finds it through lineage.
    async fn generate_and_persist_tenth(&self, l0: &StoreRecord) -> Result<String> {
        let summary =
            crate::document::generate_tenth_summary(&self.gateway, &l0.content).await?;

        let mut record = StoreRecord::derived_from(l0, 2, summary.clone());
        record
            .metadata
            .insert("type".to_string(), json!("tenth_summary"));
        record
            .metadata
            .insert("word_count".to_string(), json!(count_words(&summary)));
        record
            .metadata
            .insert("derivation".to_string(), json!("lazy_on_first_use"));

        match self.stores.embedding.embed_long(&summary).await {
            Ok(embedding) => {
                record.embedding = Some(embedding);
                record.embedding_model = Some(self.stores.embedding.model().to_string());
            }
            Err(e) => warn!("embedding for lazy summary failed: {e}"),
        }

        self.stores.main.add(&record).await?;
        info!(id = %record.id, "persisted lazily generated 10:1 summary");
        Ok(summary)
    }

    /// Detailed content for the papers cited in a section, within a total
    /// character budget.
    pub async fn get_papers_for_section(
        &self,
        section_content: &str,
        max_papers: usize,
        max_total_chars: usize,
    ) -> HashMap<String, String> {
        let cited = extract_citation_keys(section_content);
        let mut detailed = HashMap::new();
        let mut budget = max_total_chars;

        for key in cited.into_iter().take(max_papers) {
            if budget < 500 {
                break;
            }
            match self.get_paper_content(&key, budget.min(MAX_CONTENT_CHARS)).await {
                Ok(Some(content)) => {
                    budget = budget.saturating_sub(content.content.len());
                    detailed.insert(key, content.content);
                }
                Ok(None) => {}
                Err(e) => warn!(key, "content fetch failed: {e}"),
            }
        }
        detailed
    }
}

fn clamp(bib_key: &str, content: &str, level: u8, max_chars: usize) -> PaperContent {
    if content.len() <= max_chars {
        return PaperContent {
            bib_key: bib_key.to_string(),
            content: content.to_string(),
            compression_level: level,
            truncated: false,
        };
    }
    let mut end = max_chars;
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    PaperContent {
        bib_key: bib_key.to_string(),
        content: format!("{}\n\n[... content truncated ...]", &content[..end]),
        compression_level: level,
        truncated: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_marks_truncation() {
        let short = clamp("K", "small", 2, 100);
        assert!(!short.truncated);
        assert_eq!(short.content, "small");

        let long = clamp("K", &"x".repeat(200), 0, 100);
        assert!(long.truncated);
        assert!(long.content.contains("[... content truncated ...]"));
    }
}
