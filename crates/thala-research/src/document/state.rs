//! State and result types for the document pipeline

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use thala_core::llm::StructuredSchema;
use thala_core::text::{ChapterSpan, MarkdownChunk};

use crate::scrape::PdfQuality;

/// Word count above which the 10:1 summary stage runs
pub const TENTH_SUMMARY_WORD_THRESHOLD: usize = 2_000;
/// Word count below which chapter detection skips entirely
pub const CHAPTER_DETECTION_MIN_WORDS: usize = 3_000;

/// Input specification for processing one document.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    /// URL or raw markdown text
    pub source: String,
    pub title: Option<String>,
    /// Bibliographic item type ("document", "book", "journalArticle", ...)
    pub item_type: String,
    pub quality: PdfQuality,
    /// OCR languages
    pub langs: Vec<String>,
    pub extra_metadata: BTreeMap<String, Value>,
    pub tags: Vec<String>,
    /// Disable the provider batch API for rapid iteration
    pub use_batch_api: bool,
}

impl Default for DocumentInput {
    fn default() -> Self {
        Self {
            source: String::new(),
            title: None,
            item_type: "document".to_string(),
            quality: PdfQuality::Balanced,
            langs: vec!["English".to_string()],
            extra_metadata: BTreeMap::new(),
            tags: vec![],
            use_batch_api: true,
        }
    }
}

impl DocumentInput {
    pub fn markdown(source: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn url(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }
}

/// Output of input resolution / extraction.
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub markdown: String,
    pub chunks: Vec<MarkdownChunk>,
    pub page_count: usize,
    pub word_count: usize,
    /// Which conversion path produced the markdown
    pub ocr_method: String,
}

/// Reference to a created store record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRecordRef {
    pub id: Uuid,
    pub compression_level: u8,
    pub content_preview: String,
}

/// A per-stage error tolerated by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageError {
    pub node: String,
    pub error: String,
}

/// Bilingual text pair for non-English documents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BilingualText {
    /// Text in the document's original language
    pub original: String,
    /// English translation (same as original for English documents)
    pub english: String,
}

/// Final state of one document run.
#[derive(Debug, Clone, Default)]
pub struct DocumentOutcome {
    /// "completed", "completed_with_errors", or "failed"
    pub status: String,
    pub bib_key: Option<String>,
    pub records: Vec<StoreRecordRef>,
    pub short_summary: Option<BilingualText>,
    pub tenth_summary: Option<BilingualText>,
    pub chapters: Vec<ChapterSpan>,
    pub original_language: Option<String>,
    pub metadata: Option<DocumentMetadata>,
    pub validation_error: Option<String>,
    pub errors: Vec<StageError>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DocumentOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: "failed".to_string(),
            errors: vec![StageError {
                node: "pipeline".to_string(),
                error: error.into(),
            }],
            ..Default::default()
        }
    }

    pub fn record_at_level(&self, level: u8) -> Option<&StoreRecordRef> {
        self.records
            .iter()
            .find(|r| r.compression_level == level)
    }
}

/// Bibliographic metadata extracted from document content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default)]
    pub is_multi_author: bool,
    #[serde(default)]
    pub chapter_authors: BTreeMap<String, String>,
}

impl StructuredSchema for DocumentMetadata {
    fn schema_name() -> &'static str {
        "DocumentMetadata"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": ["string", "null"]},
                "authors": {"type": "array", "items": {"type": "string"}},
                "date": {"type": ["string", "null"]},
                "publisher": {"type": ["string", "null"]},
                "isbn": {"type": ["string", "null"]},
                "is_multi_author": {"type": "boolean"},
                "chapter_authors": {
                    "type": "object",
                    "additionalProperties": {"type": "string"},
                },
            },
            "required": ["authors", "is_multi_author"],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_input_defaults() {
        let input = DocumentInput::markdown("# Doc", "A Title");
        assert_eq!(input.item_type, "document");
        assert!(input.use_batch_api);
        assert_eq!(input.langs, vec!["English"]);
    }

    #[test]
    fn test_metadata_parses_with_missing_fields() {
        let metadata: DocumentMetadata = serde_json::from_value(json!({
            "title": "A Book",
            "authors": [],
            "is_multi_author": false,
        }))
        .unwrap();
        assert_eq!(metadata.title.as_deref(), Some("A Book"));
        assert!(metadata.publisher.is_none());
        assert!(metadata.chapter_authors.is_empty());
    }

    #[test]
    fn test_outcome_record_lookup() {
        let mut outcome = DocumentOutcome::default();
        outcome.records.push(StoreRecordRef {
            id: Uuid::new_v4(),
            compression_level: 0,
            content_preview: "body".to_string(),
        });
        outcome.records.push(StoreRecordRef {
            id: Uuid::new_v4(),
            compression_level: 1,
            content_preview: "summary".to_string(),
        });

        assert!(outcome.record_at_level(0).is_some());
        assert!(outcome.record_at_level(2).is_none());
    }
}
