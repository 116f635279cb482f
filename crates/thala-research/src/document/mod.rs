//! Document processing
//!
//! Staged ingestion of source documents into the tiered store: resolution,
//! stub creation, extraction, parallel summary/metadata agents, chapter
//! detection, 10:1 map-reduce summarization, and bibliographic updates.

mod chapters;
mod pipeline;
mod prompts;
mod state;
mod validate;

pub use chapters::{
    ChapterAnalysis, ChapterDetection, ChapterSummary, MAX_CONCURRENT_CHAPTER_SUMMARIES,
    aggregate_summaries, detect_chapters, generate_tenth_summary, summarize_chapters,
};
pub use pipeline::{DOCUMENT_BATCH_CONCURRENCY, DocumentPipeline};
pub use prompts::{CHAPTER_SUMMARIZATION_SYSTEM, DOCUMENT_ANALYSIS_SYSTEM, TRANSLATION_SYSTEM};
pub use state::{
    BilingualText, CHAPTER_DETECTION_MIN_WORDS, DocumentInput, DocumentMetadata, DocumentOutcome,
    ProcessingResult, StageError, StoreRecordRef, TENTH_SUMMARY_WORD_THRESHOLD,
};
pub use validate::{MetadataValidation, validate_content_metadata};
