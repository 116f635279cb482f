//! Short-markdown ingestion journey
//!
//! A ~400-word markdown note flows through the full pipeline: stub
//! creation (pending tag), content persistence, parallel summary and
//! metadata agents, bibliographic update (processed tag), and finalize.
//! Below the 10:1 threshold no chapter stage runs and no L2 is created.

use serde_json::json;
use thala_e2e_tests::TestEnv;
use thala_research::document::{DocumentInput, DocumentPipeline};
use wiremock::matchers::{body_partial_json, body_string_contains, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BIB_KEY: &str = "NOTEA001";

fn note_markdown() -> String {
    let sentence = "Lovelace argues that analytical engines can weave algebraic patterns \
                    just as looms weave flowers and leaves. ";
    sentence.repeat(25) // ~400 words, no headings
}

async fn mount_scenario(env: &TestEnv) {
    // Bibliographic system: item creation, retrieval, update
    Mock::given(method("POST"))
        .and(path("/local-crud/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"key": BIB_KEY})))
        .expect(1)
        .mount(&env.zotero)
        .await;
    Mock::given(method("POST"))
        .and(path("/local-crud/item"))
        .and(body_partial_json(json!({"action": "get"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "key": BIB_KEY,
            "itemType": "document",
            "version": 1,
            "fields": {"title": "Note A"},
            "tags": [{"tag": "pending", "type": 1}],
        })))
        .mount(&env.zotero)
        .await;
    Mock::given(method("POST"))
        .and(path("/local-crud/item"))
        .and(body_partial_json(json!({"action": "update"})))
        .and(body_string_contains("processed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&env.zotero)
        .await;

    // The post-update read returns the populated L0
    let stored = json!({
        "id": uuid::Uuid::new_v4(),
        "source_type": "external",
        "content": note_markdown(),
        "compression_level": 0,
        "source_ids": [],
        "bib_key": BIB_KEY,
        "metadata": {},
        "created_at": "2026-01-01T00:00:00Z",
        "updated_at": "2026-01-01T00:00:00Z",
    });
    Mock::given(method("GET"))
        .and(path_regex(r"^/store_l0/_doc/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"_source": stored})))
        .mount(&env.es_coherence)
        .await;

    mount_llm(&env.llm).await;
}

async fn mount_llm(llm: &MockServer) {
    // Structured metadata extraction arrives as a forced submit_result call
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(body_string_contains("submit_result"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_meta",
            "content": [{
                "type": "tool_use",
                "id": "tu_1",
                "name": "submit_result",
                "input": {
                    "title": "Note A",
                    "authors": ["Ada Lovelace"],
                    "date": null,
                    "publisher": null,
                    "isbn": null,
                    "is_multi_author": false,
                    "chapter_authors": {},
                },
            }],
        })))
        .mount(llm)
        .await;

    // Everything else (the summary call) is plain text
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_sum",
            "content": [{"type": "text", "text":
                "A short note in which Lovelace argues that analytical engines weave \
                 algebraic patterns, drawing an analogy to mechanical looms and \
                 anticipating general-purpose computation."}],
        })))
        .with_priority(8)
        .mount(llm)
        .await;
}

#[tokio::test]
async fn test_short_markdown_ingestion_completes_without_errors() {
    let env = TestEnv::start().await;
    mount_scenario(&env).await;

    let staging = tempfile::tempdir().unwrap();
    let pipeline = DocumentPipeline::new(
        env.stores.clone(),
        env.gateway.clone(),
        None,
        staging.path().to_path_buf(),
    );

    let outcome = pipeline
        .process_document(DocumentInput::markdown(note_markdown(), "Note A"))
        .await;

    assert_eq!(outcome.status, "completed", "errors: {:?}", outcome.errors);
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.bib_key.as_deref(), Some(BIB_KEY));

    // One original, one short summary, no 10:1 record below the threshold
    assert!(outcome.record_at_level(0).is_some());
    assert!(outcome.record_at_level(1).is_some());
    assert!(outcome.record_at_level(2).is_none());
    assert!(outcome.chapters.is_empty());

    let summary = outcome.short_summary.expect("short summary present");
    assert!(summary.original.contains("Lovelace"));
    // English document: both variants identical
    assert_eq!(summary.original, summary.english);

    // The resolved markdown landed in staging
    let staged: Vec<_> = std::fs::read_dir(staging.path()).unwrap().collect();
    assert_eq!(staged.len(), 1);
}

#[tokio::test]
async fn test_batch_ingestion_tolerates_per_document_failure() {
    let env = TestEnv::start().await;
    mount_scenario(&env).await;

    let staging = tempfile::tempdir().unwrap();
    let pipeline = DocumentPipeline::new(
        env.stores.clone(),
        env.gateway.clone(),
        None, // no conversion client: URL inputs fail at resolve
        staging.path().to_path_buf(),
    );

    let outcomes = pipeline
        .process_documents_batch(
            vec![
                DocumentInput::markdown(note_markdown(), "Note A"),
                DocumentInput::url("https://example.org/unreachable.pdf"),
            ],
            5,
        )
        .await;

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].status, "completed");
    // The URL document failed without sinking the batch
    assert_eq!(outcomes[1].status, "failed");
    assert!(!outcomes[1].errors.is_empty());
}
