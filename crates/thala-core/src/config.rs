//! Environment configuration
//!
//! All backends are addressed through `THALA_*` environment variables with
//! localhost defaults matching the development docker-compose layout.
//! Configuration is read once at startup and injected into constructors.

use std::env;
use std::path::PathBuf;

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingProviderKind {
    /// OpenAI-compatible HTTP API, needs `OPENAI_API_KEY`
    #[default]
    OpenAi,
    /// Local Ollama instance, needs `THALA_OLLAMA_HOST`
    Ollama,
}

impl EmbeddingProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingProviderKind::OpenAi => "openai",
            EmbeddingProviderKind::Ollama => "ollama",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(EmbeddingProviderKind::OpenAi),
            "ollama" => Some(EmbeddingProviderKind::Ollama),
            _ => None,
        }
    }
}

/// Process-wide configuration, resolved from the environment once.
#[derive(Debug, Clone)]
pub struct ThalaConfig {
    /// Text index instance holding store_l0/l1/l2 + coherence
    pub es_coherence_host: String,
    /// Text index instance holding who_i_was + forgotten
    pub es_forgotten_host: String,
    /// Vector index endpoint
    pub chroma_host: String,
    pub chroma_port: u16,
    /// Bibliographic system endpoint (localhost-only plugin)
    pub zotero_host: String,
    pub zotero_port: u16,
    /// Citation metadata translation server
    pub translation_host: String,
    pub translation_port: u16,
    /// Embedding provider selection and model override
    pub embedding_provider: EmbeddingProviderKind,
    pub embedding_model: Option<String>,
    pub ollama_host: String,
    pub openai_api_key: Option<String>,
    /// LLM and web-search credentials
    pub anthropic_api_key: Option<String>,
    pub perplexity_api_key: Option<String>,
    /// Staging directory for resolved markdown
    pub staging_dir: PathBuf,
    /// THALA_MODE=dev enables workflow state dumps and extra tracing
    pub dev_mode: bool,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_port(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ThalaConfig {
    /// Resolve configuration from the environment.
    pub fn from_env() -> Self {
        let provider = env::var("THALA_EMBEDDING_PROVIDER")
            .ok()
            .and_then(|v| EmbeddingProviderKind::parse_name(&v))
            .unwrap_or_default();

        let staging_dir = env::var("THALA_STAGING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir().join("thala-staging"));

        Self {
            es_coherence_host: env_or("THALA_ES_COHERENCE_HOST", "http://localhost:9201"),
            es_forgotten_host: env_or("THALA_ES_FORGOTTEN_HOST", "http://localhost:9200"),
            chroma_host: env_or("THALA_CHROMA_HOST", "localhost"),
            chroma_port: env_port("THALA_CHROMA_PORT", 8000),
            zotero_host: env_or("THALA_ZOTERO_HOST", "localhost"),
            zotero_port: env_port("THALA_ZOTERO_PORT", 23119),
            translation_host: env_or("THALA_TRANSLATION_HOST", "localhost"),
            translation_port: env_port("THALA_TRANSLATION_PORT", 1969),
            embedding_provider: provider,
            embedding_model: env::var("THALA_EMBEDDING_MODEL").ok(),
            ollama_host: env_or("THALA_OLLAMA_HOST", "http://localhost:11434"),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            anthropic_api_key: env::var("ANTHROPIC_API_KEY").ok(),
            perplexity_api_key: env::var("PERPLEXITY_API_KEY").ok(),
            staging_dir,
            dev_mode: env::var("THALA_MODE").map(|m| m == "dev").unwrap_or(false),
        }
    }

    /// Vector index base URL
    pub fn chroma_url(&self) -> String {
        format!("http://{}:{}", self.chroma_host, self.chroma_port)
    }

    /// Bibliographic system base URL
    pub fn zotero_url(&self) -> String {
        format!("http://{}:{}", self.zotero_host, self.zotero_port)
    }

    /// Translation server base URL
    pub fn translation_url(&self) -> String {
        format!("http://{}:{}", self.translation_host, self.translation_port)
    }
}

impl Default for ThalaConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse() {
        assert_eq!(
            EmbeddingProviderKind::parse_name("OpenAI"),
            Some(EmbeddingProviderKind::OpenAi)
        );
        assert_eq!(
            EmbeddingProviderKind::parse_name("ollama"),
            Some(EmbeddingProviderKind::Ollama)
        );
        assert_eq!(EmbeddingProviderKind::parse_name("other"), None);
    }

    #[test]
    fn test_urls() {
        let config = ThalaConfig {
            es_coherence_host: "http://localhost:9201".into(),
            es_forgotten_host: "http://localhost:9200".into(),
            chroma_host: "vectors".into(),
            chroma_port: 8000,
            zotero_host: "localhost".into(),
            zotero_port: 23119,
            translation_host: "localhost".into(),
            translation_port: 1969,
            embedding_provider: EmbeddingProviderKind::OpenAi,
            embedding_model: None,
            ollama_host: "http://localhost:11434".into(),
            openai_api_key: None,
            anthropic_api_key: None,
            perplexity_api_key: None,
            staging_dir: std::env::temp_dir(),
            dev_mode: false,
        };
        assert_eq!(config.chroma_url(), "http://vectors:8000");
        assert_eq!(config.zotero_url(), "http://localhost:23119");
        assert_eq!(config.translation_url(), "http://localhost:1969");
    }
}
