//! Cross-store bibliographic key verification
//!
//! Checks citation keys against the bibliographic system and resolves the
//! matching L0 record for each, bounded by a semaphore.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::warn;
use uuid::Uuid;

use super::main::MainStore;
use super::zotero::ZoteroStore;

/// Default concurrent verification requests
pub const VERIFY_CONCURRENCY: usize = 10;

/// Outcome of verifying a single key.
#[derive(Debug, Clone)]
pub struct KeyVerification {
    pub bib_key: String,
    pub exists_in_bib_system: bool,
    /// Matching L0 record, if one is indexed under this key
    pub record_id: Option<Uuid>,
}

/// Verify a list of keys, looking up the corresponding L0 record for each.
pub async fn verify_bib_keys(
    keys: &[String],
    zotero: &ZoteroStore,
    main: &MainStore,
    concurrency: usize,
) -> Vec<KeyVerification> {
    if keys.is_empty() {
        return vec![];
    }

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    let tasks = keys.iter().map(|key| {
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");

            let exists = zotero.exists(key).await.unwrap_or(false);

            let record_id = match main
                .search(&json!({"term": {"bib_key": key}}), 1, Some(0))
                .await
            {
                Ok(records) => records.first().map(|r| r.id),
                Err(e) => {
                    warn!(key, "L0 lookup failed during key verification: {e}");
                    None
                }
            };

            KeyVerification {
                bib_key: key.clone(),
                exists_in_bib_system: exists,
                record_id,
            }
        }
    });

    join_all(tasks).await
}

/// Convenience wrapper returning results keyed by bib key.
pub async fn verify_bib_keys_batch(
    keys: &HashSet<String>,
    zotero: &ZoteroStore,
    main: &MainStore,
) -> HashMap<String, KeyVerification> {
    let key_list: Vec<String> = keys.iter().cloned().collect();
    verify_bib_keys(&key_list, zotero, main, VERIFY_CONCURRENCY)
        .await
        .into_iter()
        .map(|v| (v.bib_key.clone(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::StoreRecord;
    use crate::stores::elastic::ElasticClient;
    use crate::stores::forgotten::ForgottenStore;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_verification_combines_bib_and_index_lookups() {
        let bib_server = MockServer::start().await;
        let es_server = MockServer::start().await;

        let mut record = StoreRecord::new("paper body");
        record.bib_key = Some("GOOD1234".to_string());

        // GOOD1234 exists in both systems; MISS5678 in neither
        Mock::given(method("POST"))
            .and(path("/local-crud/item"))
            .and(body_partial_json(serde_json::json!({"key": "GOOD1234"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "key": "GOOD1234", "itemType": "book", "version": 1,
            })))
            .mount(&bib_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/local-crud/item"))
            .and(body_partial_json(serde_json::json!({"key": "MISS5678"})))
            .respond_with(ResponseTemplate::new(404))
            .mount(&bib_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/store_l0/_search"))
            .and(body_partial_json(
                serde_json::json!({"query": {"term": {"bib_key": "GOOD1234"}}}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "hits": {"hits": [{"_score": 1.0, "_source": serde_json::to_value(&record).unwrap()}]}
            })))
            .mount(&es_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/store_l0/_search"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"hits": {"hits": []}})),
            )
            .mount(&es_server)
            .await;

        let zotero = ZoteroStore::new(bib_server.uri()).unwrap();
        let client = Arc::new(ElasticClient::new(es_server.uri()).unwrap());
        let main = MainStore::new(client.clone(), Arc::new(ForgottenStore::new(client)));

        let results = verify_bib_keys(
            &["GOOD1234".to_string(), "MISS5678".to_string()],
            &zotero,
            &main,
            4,
        )
        .await;

        let by_key: HashMap<_, _> = results
            .into_iter()
            .map(|v| (v.bib_key.clone(), v))
            .collect();
        assert!(by_key["GOOD1234"].exists_in_bib_system);
        assert_eq!(by_key["GOOD1234"].record_id, Some(record.id));
        assert!(!by_key["MISS5678"].exists_in_bib_system);
        assert!(by_key["MISS5678"].record_id.is_none());
    }

    #[tokio::test]
    async fn test_empty_keys_short_circuits() {
        let server = MockServer::start().await;
        let zotero = ZoteroStore::new(server.uri()).unwrap();
        let client = Arc::new(ElasticClient::new(server.uri()).unwrap());
        let main = MainStore::new(client.clone(), Arc::new(ForgottenStore::new(client)));

        let results = verify_bib_keys(&[], &zotero, &main, 4).await;
        assert!(results.is_empty());
    }
}
