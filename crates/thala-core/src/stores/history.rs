//! WhoIWas store - append-only edit history
//!
//! Temporal snapshots of superseded state, written before every tracked
//! mutation or deletion.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::records::WhoIWasRecord;

use super::Result;
use super::elastic::ElasticClient;

const INDEX: &str = "who_i_was";

/// Append-only store for pre-mutation snapshots.
pub struct WhoIWasStore {
    client: Arc<ElasticClient>,
}

impl WhoIWasStore {
    pub fn new(client: Arc<ElasticClient>) -> Self {
        Self { client }
    }

    /// Append a snapshot.
    pub async fn add(&self, record: &WhoIWasRecord) -> Result<Uuid> {
        let document = serde_json::to_value(record)?;
        self.client
            .index_doc(INDEX, &record.id.to_string(), &document)
            .await?;
        Ok(record.id)
    }

    /// All historical snapshots that superseded the given record id.
    pub async fn get_history(&self, record_id: Uuid) -> Result<Vec<WhoIWasRecord>> {
        let query = json!({"term": {"supersedes": record_id.to_string()}});
        let hits = self.client.search(INDEX, &query, 100).await?;
        let mut snapshots: Vec<WhoIWasRecord> = hits
            .into_iter()
            .filter_map(|hit| serde_json::from_value(hit.source).ok())
            .collect();
        snapshots.sort_by_key(|s| s.created_at);
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::StoreRecord;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_history_is_sorted_by_time() {
        let server = MockServer::start().await;
        let target = Uuid::new_v4();
        let record = StoreRecord::new("x");

        let mut older = WhoIWasRecord::snapshot(
            target,
            "first",
            serde_json::to_value(&record).unwrap(),
            "coherence",
        );
        older.created_at -= chrono::Duration::hours(2);
        let newer = WhoIWasRecord::snapshot(
            target,
            "second",
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
            .mount(&server)
            .await;

        let store = WhoIWasStore::new(Arc::new(ElasticClient::new(server.uri()).unwrap()));
        let history = store.get_history(target).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].reason, "first");
        assert_eq!(history[1].reason, "second");
    }

    #[tokio::test]
    async fn test_add_writes_to_history_index() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/who_i_was/_doc/.+$"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let store = WhoIWasStore::new(Arc::new(ElasticClient::new(server.uri()).unwrap()));
        let snapshot =
            WhoIWasRecord::snapshot(Uuid::new_v4(), "edit", json!({"content": "old"}), "store_l0");
        store.add(&snapshot).await.unwrap();
    }
}
