//! Tiered persistent store
//!
//! A logical front over three backends: the text/metadata index (two
//! instances), the vector index, and the bibliographic system. All
//! mutations of tracked records write history first; all main-store
//! deletions archive first.

mod chroma;
mod coherence;
mod elastic;
mod forgotten;
mod history;
mod main;
mod verify;
mod zotero;

pub use chroma::{ChromaStore, VectorEntry, VectorMatch, sanitize_metadata, sanitize_metadata_map};
pub use coherence::CoherenceStore;
pub use elastic::{ElasticClient, SearchHit};
pub use forgotten::ForgottenStore;
pub use history::WhoIWasStore;
pub use main::{MainStore, index_for_level};
pub use verify::{KeyVerification, VERIFY_CONCURRENCY, verify_bib_keys, verify_bib_keys_batch};
pub use zotero::{
    ZoteroCreator, ZoteroHealth, ZoteroItem, ZoteroItemCreate, ZoteroItemUpdate,
    ZoteroSearchCondition, ZoteroSearchResult, ZoteroStore, ZoteroTag,
};

use std::sync::Arc;

use tracing::error;

use crate::config::ThalaConfig;
use crate::embeddings::EmbeddingService;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Store error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend refused, timed out, or misbehaved
    #[error("backend unavailable: {0}")]
    Backend(String),
    /// Backend returned a non-success HTTP status
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    /// Transport-level failure
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
    /// Malformed input or record invariant violation
    #[error("validation error: {0}")]
    Validation(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether a retry of an idempotent operation could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Http(e) => e.is_timeout() || e.is_connect(),
            StoreError::Status { status, .. } => *status >= 500,
            StoreError::Backend(_) => true,
            _ => false,
        }
    }
}

/// Store result type
pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// COMPOSITE MANAGER
// ============================================================================

/// Per-backend health, plus the overall verdict.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Cluster status of the coherence-side text index ("green"/"yellow"/"red")
    pub coherence_index: String,
    /// Cluster status of the forgotten-side text index
    pub forgotten_index: String,
    pub vector_index: bool,
    pub bib_system: bool,
    /// All backends reachable and not red
    pub healthy: bool,
}

/// One long-lived container over every store, constructed at process start
/// and injected into the workflows.
pub struct StoreManager {
    pub main: Arc<MainStore>,
    pub coherence: Arc<CoherenceStore>,
    pub who_i_was: Arc<WhoIWasStore>,
    pub forgotten: Arc<ForgottenStore>,
    pub vectors: Arc<ChromaStore>,
    pub zotero: Arc<ZoteroStore>,
    pub embedding: Arc<EmbeddingService>,
    coherence_client: Arc<ElasticClient>,
    forgotten_client: Arc<ElasticClient>,
}

impl StoreManager {
    /// Wire up all backends from configuration.
    pub fn from_config(config: &ThalaConfig) -> Result<Self> {
        let embedding = Arc::new(
            EmbeddingService::from_config(config)
                .map_err(|e| StoreError::Validation(e.to_string()))?,
        );
        Self::with_embedding(config, embedding)
    }

    /// Wire up all backends, reusing an existing embedding service.
    pub fn with_embedding(
        config: &ThalaConfig,
        embedding: Arc<EmbeddingService>,
    ) -> Result<Self> {
        let coherence_client = Arc::new(ElasticClient::new(&config.es_coherence_host)?);
        let forgotten_client = Arc::new(ElasticClient::new(&config.es_forgotten_host)?);

        let who_i_was = Arc::new(WhoIWasStore::new(forgotten_client.clone()));
        let forgotten = Arc::new(ForgottenStore::new(forgotten_client.clone()));
        let main = Arc::new(MainStore::new(coherence_client.clone(), forgotten.clone()));
        let coherence = Arc::new(CoherenceStore::new(
            coherence_client.clone(),
            who_i_was.clone(),
        ));
        let vectors = Arc::new(ChromaStore::new(
            config.chroma_url(),
            Some(who_i_was.clone()),
        )?);
        let zotero = Arc::new(ZoteroStore::new(config.zotero_url())?);

        Ok(Self {
            main,
            coherence,
            who_i_was,
            forgotten,
            vectors,
            zotero,
            embedding,
            coherence_client,
            forgotten_client,
        })
    }

    /// Composite non-blocking health check across every backend.
    pub async fn health(&self) -> HealthReport {
        let coherence_index = match self.coherence_client.cluster_health().await {
            Ok(status) => status,
            Err(e) => {
                error!("coherence index health check failed: {e}");
                "unreachable".to_string()
            }
        };
        let forgotten_index = match self.forgotten_client.cluster_health().await {
            Ok(status) => status,
            Err(e) => {
                error!("forgotten index health check failed: {e}");
                "unreachable".to_string()
            }
        };
        let vector_index = self.vectors.health_check().await;
        let bib_system = self.zotero.health_check().await.healthy;

        let index_ok =
            |status: &str| -> bool { matches!(status, "green" | "yellow") };

        HealthReport {
            healthy: index_ok(&coherence_index)
                && index_ok(&forgotten_index)
                && vector_index
                && bib_system,
            coherence_index,
            forgotten_index,
            vector_index,
            bib_system,
        }
    }
}
