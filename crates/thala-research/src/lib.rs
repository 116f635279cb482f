//! # Thala Research
//!
//! Workflows of the Thala research pipeline, built over `thala-core`:
//!
//! - **Document processing**: staged ingestion of PDFs, URLs and markdown
//!   into the tiered store, with parallel summary/metadata agents, chapter
//!   detection and 10:1 map-reduce summarization
//! - **Supervised review loops**: theoretical depth, literature expansion,
//!   structural rewriting, parallel section editing, a cohesion gate, and
//!   fact/reference checking, sequenced by an orchestrator
//! - **Citation tooling**: key extraction and validation, find-string edit
//!   application, duplicate handling, and the numeric-citation
//!   post-processor
//! - **Agent tools**: corpus-scoped hybrid paper search, content fetch
//!   with lazy 10:1 generation, and web fact checking
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use thala_core::{ThalaConfig, StoreManager, AnthropicClient, LlmGateway};
//! use thala_research::document::{DocumentInput, DocumentPipeline};
//!
//! let config = ThalaConfig::from_env();
//! let stores = Arc::new(StoreManager::from_config(&config)?);
//! let client = Arc::new(AnthropicClient::new(config.anthropic_api_key.clone().unwrap())?);
//! let gateway = Arc::new(LlmGateway::new(client));
//!
//! let pipeline = DocumentPipeline::new(stores, gateway, None, config.staging_dir.clone());
//! let outcome = pipeline
//!     .process_document(DocumentInput::markdown("# Notes\n\n...", "Note A"))
//!     .await;
//! assert_eq!(outcome.status, "completed");
//! ```

pub mod citations;
pub mod document;
pub mod error;
pub mod review;
pub mod scrape;
pub mod similarity;
pub mod state_dump;
pub mod translation;
pub mod web;

pub use citations::{
    CitationPostProcessor, Edit, EditType, apply_edits, extract_citation_keys,
    strip_invalid_citations, validate_edits,
};
pub use document::{DocumentInput, DocumentOutcome, DocumentPipeline};
pub use error::{Result, WorkflowError};
pub use review::{
    LoopSelection, PaperCorpus, PaperSummary, QualitySettings, ReviewContext, StoreQuery,
    SupervisionOutcome, run_supervision,
};
pub use scrape::{GetUrlOptions, PdfQuality, UrlFetchClient};
pub use translation::TranslationClient;
pub use web::WebSearchClient;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
