//! # Thala Core
//!
//! Core engine of the Thala research pipeline:
//!
//! - **Record model**: content records at three compression levels with
//!   mandatory lineage and bibliographic linkage
//! - **Tiered store**: text/metadata index, vector index and bibliographic
//!   system behind one manager, with history written before every tracked
//!   mutation and an archive written before every deletion
//! - **Embedding & LLM gateway**: provider-abstracted embeddings, tiered
//!   completion models, structured output with schema validation, and a
//!   budgeted tool-agent loop
//! - **Text utilities**: heading parsing, word-boundary chunking, chapter
//!   detection fallbacks, language identification
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use thala_core::{ThalaConfig, StoreManager, StoreRecord};
//!
//! let config = ThalaConfig::from_env();
//! let stores = StoreManager::from_config(&config)?;
//!
//! let record = StoreRecord::new("# A document\n\nIts content.");
//! stores.main.add(&record).await?;
//!
//! let health = stores.health().await;
//! assert!(health.healthy);
//! ```

pub mod config;
pub mod embeddings;
pub mod llm;
pub mod records;
pub mod search;
pub mod stores;
pub mod text;

// Configuration
pub use config::{EmbeddingProviderKind, ThalaConfig};

// Record model
pub use records::{
    CoherenceRecord, ForgottenRecord, SourceType, StoreRecord, WhoIWasRecord, is_valid_bib_key,
    require_reason, utc_now,
};

// Store layer
pub use stores::{
    ChromaStore, CoherenceStore, ElasticClient, ForgottenStore, HealthReport, KeyVerification,
    MainStore, StoreError, StoreManager, WhoIWasStore, ZoteroCreator, ZoteroItem,
    ZoteroItemCreate, ZoteroItemUpdate, ZoteroSearchCondition, ZoteroStore, ZoteroTag,
    verify_bib_keys,
};

// Embeddings
pub use embeddings::{EmbeddingError, EmbeddingProvider, EmbeddingService, cosine_similarity};

// LLM gateway
pub use llm::{
    AgentBudget, AnthropicClient, ChatMessage, ContentBlock, LlmError, LlmGateway, ModelTier,
    StructuredOptions, StructuredSchema, SystemBlock, Tool, run_tool_agent,
};

// Search fusion
pub use search::{RRF_K, reciprocal_rank_fusion};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
