//! Embedding generation service
//!
//! Abstracted single/batch embedding over two provider families: an
//! OpenAI-compatible HTTP API and a local Ollama instance. Long texts are
//! chunked on word boundaries and their vectors averaged. Repeated query
//! embeddings are served from an LRU cache.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::{EmbeddingProviderKind, ThalaConfig};

/// Chunk size (chars) for long-text embedding
const LONG_TEXT_CHUNK_CHARS: usize = 8000;
/// Query embeddings kept in the LRU cache
const QUERY_CACHE_SIZE: usize = 256;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Embedding error type, tagged with the provider that failed.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding provider {provider} failed: {message}")]
    Provider { provider: &'static str, message: String },
    #[error("embedding configuration error: {0}")]
    Config(String),
}

/// Embedding result type
pub type Result<T> = std::result::Result<T, EmbeddingError>;

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// A backend capable of turning text into vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider tag for error reporting
    fn provider_name(&self) -> &'static str;

    /// Generate an embedding for one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ============================================================================
// OPENAI-COMPATIBLE PROVIDER
// ============================================================================

/// OpenAI-compatible embeddings over bearer-authenticated HTTP.
pub struct OpenAiEmbeddings {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl OpenAiEmbeddings {
    pub const DEFAULT_MODEL: &'static str = "text-embedding-3-small";

    pub fn new(api_key: &str, model: impl Into<String>) -> Result<Self> {
        Self::with_base_url("https://api.openai.com/v1", api_key, model)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: &str,
        model: impl Into<String>,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| EmbeddingError::Config("API key is not a valid header value".into()))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .default_headers(headers)
            .build()
            .map_err(|e| EmbeddingError::Config(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    fn provider_name(&self) -> &'static str {
        "openai"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| EmbeddingError::Provider {
            provider: "openai",
            message: "empty response".to_string(),
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let failure = |message: String| EmbeddingError::Provider {
            provider: "openai",
            message,
        };

        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .json(&json!({"input": texts, "model": self.model}))
            .send()
            .await
            .map_err(|e| failure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failure(format!("HTTP {status}: {body}")));
        }

        let body: Value = response.json().await.map_err(|e| failure(e.to_string()))?;
        let mut entries: Vec<(usize, Vec<f32>)> = body
            .get("data")
            .and_then(Value::as_array)
            .map(|data| {
                data.iter()
                    .filter_map(|entry| {
                        let index = entry.get("index")?.as_u64()? as usize;
                        let vector = entry
                            .get("embedding")?
                            .as_array()?
                            .iter()
                            .filter_map(|v| v.as_f64().map(|f| f as f32))
                            .collect();
                        Some((index, vector))
                    })
                    .collect()
            })
            .unwrap_or_default();

        if entries.len() != texts.len() {
            return Err(failure(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                entries.len()
            )));
        }

        // The API may return out of order; sort by index to restore input order
        entries.sort_by_key(|(index, _)| *index);
        Ok(entries.into_iter().map(|(_, vector)| vector).collect())
    }
}

// ============================================================================
// OLLAMA PROVIDER
// ============================================================================

/// Local Ollama embeddings.
pub struct OllamaEmbeddings {
    http: reqwest::Client,
    host: String,
    model: String,
}

impl OllamaEmbeddings {
    pub const DEFAULT_MODEL: &'static str = "nomic-embed-text";

    pub fn new(host: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        // Local model inference can be slow on first load
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| EmbeddingError::Config(e.to_string()))?;
        Ok(Self {
            http,
            host: host.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddings {
    fn provider_name(&self) -> &'static str {
        "ollama"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let failure = |message: String| EmbeddingError::Provider {
            provider: "ollama",
            message,
        };

        let response = self
            .http
            .post(format!("{}/api/embeddings", self.host))
            .json(&json!({"model": self.model, "prompt": text}))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    failure(format!("cannot connect to Ollama at {}", self.host))
                } else {
                    failure(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(failure(format!("HTTP {status}")));
        }

        let body: Value = response.json().await.map_err(|e| failure(e.to_string()))?;
        body.get("embedding")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            })
            .ok_or_else(|| failure("response carried no embedding".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // Ollama has no batch endpoint; embed sequentially
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

// ============================================================================
// SERVICE
// ============================================================================

/// Configurable embedding service fronting the selected provider.
pub struct EmbeddingService {
    provider: Box<dyn EmbeddingProvider>,
    model: String,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl EmbeddingService {
    /// Build the provider selected by configuration.
    pub fn from_config(config: &ThalaConfig) -> Result<Self> {
        match config.embedding_provider {
            EmbeddingProviderKind::OpenAi => {
                let api_key = config.openai_api_key.as_deref().ok_or_else(|| {
                    EmbeddingError::Config(
                        "OPENAI_API_KEY not set for the openai embedding provider".to_string(),
                    )
                })?;
                let model = config
                    .embedding_model
                    .clone()
                    .unwrap_or_else(|| OpenAiEmbeddings::DEFAULT_MODEL.to_string());
                Ok(Self::new(
                    Box::new(OpenAiEmbeddings::new(api_key, model.clone())?),
                    model,
                ))
            }
            EmbeddingProviderKind::Ollama => {
                let model = config
                    .embedding_model
                    .clone()
                    .unwrap_or_else(|| OllamaEmbeddings::DEFAULT_MODEL.to_string());
                Ok(Self::new(
                    Box::new(OllamaEmbeddings::new(&config.ollama_host, model.clone())?),
                    model,
                ))
            }
        }
    }

    pub fn new(provider: Box<dyn EmbeddingProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_SIZE).expect("nonzero cache size"),
            )),
        }
    }

    /// Model identifier, recorded on every embedded record.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.provider_name()
    }

    /// Generate an embedding for one text.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.provider.embed(text).await
    }

    /// Generate embeddings for multiple texts, preserving order.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.provider.embed_batch(texts).await
    }

    /// Embed a search query, serving repeats from the LRU cache.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self
            .query_cache
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(query).cloned())
        {
            debug!("query embedding cache hit");
            return Ok(cached);
        }
        let vector = self.embed(query).await?;
        if let Ok(mut cache) = self.query_cache.lock() {
            cache.put(query.to_string(), vector.clone());
        }
        Ok(vector)
    }

    /// Embed a long text by chunking on word boundaries and averaging the
    /// chunk vectors.
    pub async fn embed_long(&self, text: &str) -> Result<Vec<f32>> {
        if text.len() <= LONG_TEXT_CHUNK_CHARS {
            return self.embed(text).await;
        }

        let chunks = split_on_word_boundaries(text, LONG_TEXT_CHUNK_CHARS);
        let vectors = self.embed_batch(&chunks).await?;
        average_vectors(&vectors).ok_or_else(|| EmbeddingError::Provider {
            provider: self.provider.provider_name(),
            message: "no vectors to average".to_string(),
        })
    }
}

/// Split text into chunks of at most `max_chars`, breaking on whitespace.
fn split_on_word_boundaries(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.len() + word.len() + 1 > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Element-wise mean of equal-length vectors.
fn average_vectors(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let mut sum = vec![0.0f32; first.len()];
    for vector in vectors {
        for (accumulator, value) in sum.iter_mut().zip(vector) {
            *accumulator += value;
        }
    }
    let count = vectors.len() as f32;
    Some(sum.into_iter().map(|v| v / count).collect())
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
