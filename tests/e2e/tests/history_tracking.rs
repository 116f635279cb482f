//! History tracking journey
//!
//! Updating a coherence record writes a WhoIWasRecord first, carrying the
//! full prior serialization; deleting a main-store record archives it to
//! the forgotten partition first. History and archive live on the
//! forgotten-side index host, separate from the store host.

use serde_json::json;
use thala_core::records::{CoherenceRecord, StoreRecord};
use thala_e2e_tests::TestEnv;
use wiremock::matchers::{body_partial_json, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_coherence_update_snapshots_prior_state() {
    let env = TestEnv::start().await;

    let record = CoherenceRecord {
        content: "prefers long-form reading".to_string(),
        category: "preference".to_string(),
        confidence: 0.6,
        ..Default::default()
    };
    let id = record.id;
    let prior = serde_json::to_value(&record).unwrap();

    Mock::given(method("GET"))
        .and(path(format!("/coherence/_doc/{id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"_source": prior})))
        .mount(&env.es_coherence)
        .await;

    // Snapshot lands on the forgotten host with the full prior state
    Mock::given(method("PUT"))
        .and(path_regex(r"^/who_i_was/_doc/.+$"))
        .and(body_partial_json(json!({
            "supersedes": id.to_string(),
            "reason": "refined by user",
            "original_store": "coherence",
            "previous_data": {"content": "prefers long-form reading", "confidence": 0.6},
        })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&env.es_forgotten)
        .await;

    let updated = env
        .stores
        .coherence
        .update(id, json!({"confidence": 0.9}), "refined by user")
        .await
        .unwrap();
    assert!(updated);
}

#[tokio::test]
async fn test_main_store_delete_archives_to_forgotten_first() {
    let env = TestEnv::start().await;

    let record = StoreRecord::new("content about to be forgotten");
    let id = record.id;

    Mock::given(method("GET"))
        .and(path(format!("/store_l0/_doc/{id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"_source": serde_json::to_value(&record).unwrap()}),
        ))
        .mount(&env.es_coherence)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/forgotten/_doc/.+$"))
        .and(body_partial_json(json!({
            "forgotten_reason": "superseded by a newer edition",
            "original_store": "store_l0",
        })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&env.es_forgotten)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("/store_l0/_doc/{id}")))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&env.es_coherence)
        .await;

    let deleted = env
        .stores
        .main
        .delete(id, "superseded by a newer edition", Some(0))
        .await
        .unwrap();
    assert!(deleted);
}

#[tokio::test]
async fn test_health_reports_all_backends() {
    let env = TestEnv::start().await;

    Mock::given(method("GET"))
        .and(path("/local-crud/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .mount(&env.zotero)
        .await;

    let health = env.stores.health().await;
    assert_eq!(health.coherence_index, "green");
    assert_eq!(health.forgotten_index, "green");
    assert!(health.vector_index);
    assert!(health.bib_system);
    assert!(health.healthy);
}

#[tokio::test]
async fn test_health_degrades_when_bib_system_is_down() {
    let env = TestEnv::start().await;
    // No ping mock mounted: the bibliographic system 404s
    let health = env.stores.health().await;
    assert!(!health.bib_system);
    assert!(!health.healthy);
}

#[tokio::test]
async fn test_history_retrieval_orders_snapshots() {
    let env = TestEnv::start().await;
    let target = uuid::Uuid::new_v4();
    let record = StoreRecord::new("x");

    let mut older = thala_core::records::WhoIWasRecord::snapshot(
        target,
        "first edit",
        serde_json::to_value(&record).unwrap(),
        "coherence",
    );
    older.created_at -= chrono::Duration::hours(3);
    let newer = thala_core::records::WhoIWasRecord::snapshot(
        target,
        "second edit",
        serde_json::to_value(&record).unwrap(),
        "coherence",
    );

    Mock::given(method("POST"))
        .and(path("/who_i_was/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "hits": {"hits": [
                {"_score": 1.0, "_source": serde_json::to_value(&newer).unwrap()},
                {"_score": 1.0, "_source": serde_json::to_value(&older).unwrap()},
            ]}
        })))
        .mount(&env.es_forgotten)
        .await;

    let history = env.stores.who_i_was.get_history(target).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].reason, "first edit");
    assert_eq!(history[1].reason, "second edit");
}
