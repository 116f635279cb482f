//! Workflow error type
//!
//! One taxonomy across the document pipeline and review loops. Loop-level
//! failures are data (`LoopFailure` entries in loop state), not errors;
//! this type covers the failures that abort an operation.

use thala_core::embeddings::EmbeddingError;
use thala_core::llm::LlmError;
use thala_core::stores::StoreError;

/// Workflow error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Store layer failure
    #[error(transparent)]
    Store(#[from] StoreError),
    /// LLM gateway failure
    #[error(transparent)]
    Llm(#[from] LlmError),
    /// Embedding failure
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    /// External HTTP service failure (PDF service, translation, web search)
    #[error("external service failure: {0}")]
    Service(String),
    /// Transport-level failure
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
    /// Malformed input or state
    #[error("validation error: {0}")]
    Validation(String),
    /// Staging-file I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization failure
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Workflow result type
pub type Result<T> = std::result::Result<T, WorkflowError>;
