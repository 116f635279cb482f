//! Shared harness for end-to-end tests
//!
//! Builds a fully mock-backed environment: one wiremock server per
//! external backend (two text-index hosts, vector index, bibliographic
//! system, embedding provider, LLM provider), wired into a real
//! `StoreManager` and `LlmGateway`.

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use thala_core::config::{EmbeddingProviderKind, ThalaConfig};
use thala_core::embeddings::{EmbeddingService, OpenAiEmbeddings};
use thala_core::llm::{AnthropicClient, LlmGateway};
use thala_core::stores::StoreManager;

/// All mock backends plus the assembled clients.
pub struct TestEnv {
    pub es_coherence: MockServer,
    pub es_forgotten: MockServer,
    pub chroma: MockServer,
    pub zotero: MockServer,
    pub embeddings: MockServer,
    pub llm: MockServer,
    pub stores: Arc<StoreManager>,
    pub gateway: Arc<LlmGateway>,
}

impl TestEnv {
    /// Stand up every backend with baseline happy-path responses.
    pub async fn start() -> Self {
        let es_coherence = MockServer::start().await;
        let es_forgotten = MockServer::start().await;
        let chroma = MockServer::start().await;
        let zotero = MockServer::start().await;
        let embeddings = MockServer::start().await;
        let llm = MockServer::start().await;

        mount_embedding_defaults(&embeddings).await;
        mount_chroma_defaults(&chroma).await;
        mount_index_defaults(&es_coherence).await;
        mount_index_defaults(&es_forgotten).await;

        let config = ThalaConfig {
            es_coherence_host: es_coherence.uri(),
            es_forgotten_host: es_forgotten.uri(),
            chroma_host: "127.0.0.1".to_string(),
            chroma_port: chroma.address().port(),
            zotero_host: "127.0.0.1".to_string(),
            zotero_port: zotero.address().port(),
            translation_host: "127.0.0.1".to_string(),
            translation_port: 1,
            embedding_provider: EmbeddingProviderKind::OpenAi,
            embedding_model: None,
            ollama_host: "http://127.0.0.1:1".to_string(),
            openai_api_key: Some("test-key".to_string()),
            anthropic_api_key: Some("test-key".to_string()),
            perplexity_api_key: None,
            staging_dir: std::env::temp_dir().join("thala-e2e-staging"),
            dev_mode: false,
        };

        let embedding_service = Arc::new(EmbeddingService::new(
            Box::new(
                OpenAiEmbeddings::with_base_url(embeddings.uri(), "test-key", "test-embed")
                    .expect("embedding client"),
            ),
            "test-embed",
        ));
        let stores = Arc::new(
            StoreManager::with_embedding(&config, embedding_service).expect("store manager"),
        );
        let gateway = Arc::new(LlmGateway::new(Arc::new(
            AnthropicClient::with_base_url(llm.uri(), "test-key").expect("llm client"),
        )));

        Self {
            es_coherence,
            es_forgotten,
            chroma,
            zotero,
            embeddings,
            llm,
            stores,
            gateway,
        }
    }
}

/// Default mocks mount at low priority so test-specific mocks win.
const DEFAULT_PRIORITY: u8 = 10;

async fn mount_embedding_defaults(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"index": 0, "embedding": [0.1, 0.2, 0.3]}],
        })))
        .with_priority(DEFAULT_PRIORITY)
        .mount(server)
        .await;
}

async fn mount_chroma_defaults(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/v1/collections"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "col-1", "name": "knowledge"})),
        )
        .with_priority(DEFAULT_PRIORITY)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/api/v1/collections/.+/upsert$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .with_priority(DEFAULT_PRIORITY)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/api/v1/collections/.+/(get|query|delete)$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ids": [], "embeddings": [], "metadatas": [], "documents": [], "distances": [],
        })))
        .with_priority(DEFAULT_PRIORITY)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/heartbeat"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"nanosecond heartbeat": 1})),
        )
        .with_priority(DEFAULT_PRIORITY)
        .mount(server)
        .await;
}

async fn mount_index_defaults(server: &MockServer) {
    Mock::given(method("PUT"))
        .and(path_regex(r"^/[^/]+/_doc/.+$"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"result": "created"})))
        .with_priority(DEFAULT_PRIORITY)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/[^/]+/_doc/.+$"))
        .respond_with(ResponseTemplate::new(404))
        .with_priority(DEFAULT_PRIORITY)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/[^/]+/_update/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "updated"})))
        .with_priority(DEFAULT_PRIORITY)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/[^,/]+(,[^/]+)*/_search$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hits": {"hits": []}})))
        .with_priority(DEFAULT_PRIORITY)
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/_cluster/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "green"})))
        .with_priority(DEFAULT_PRIORITY)
        .mount(server)
        .await;
}
