//! Coherence store - identity, beliefs, preferences
//!
//! Auto-versioning: `update` and `delete` write a WhoIWasRecord carrying
//! the full prior serialization before touching the record.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::records::{CoherenceRecord, WhoIWasRecord, require_reason, utc_now};

use super::elastic::ElasticClient;
use super::history::WhoIWasStore;
use super::{Result, StoreError};

const INDEX: &str = "coherence";

/// Store for coherence-class records with mandatory history on mutation.
pub struct CoherenceStore {
    client: Arc<ElasticClient>,
    history: Arc<WhoIWasStore>,
}

impl CoherenceStore {
    pub fn new(client: Arc<ElasticClient>, history: Arc<WhoIWasStore>) -> Self {
        Self { client, history }
    }

    pub async fn add(&self, record: &CoherenceRecord) -> Result<Uuid> {
        let document = serde_json::to_value(record)?;
        self.client
            .index_doc(INDEX, &record.id.to_string(), &document)
            .await?;
        Ok(record.id)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<CoherenceRecord>> {
        match self.client.get_doc(INDEX, &id.to_string()).await? {
            Some(source) => Ok(Some(serde_json::from_value(source)?)),
            None => Ok(None),
        }
    }

    /// Update with automatic versioning.
    ///
    /// The snapshot write completes before the update is sent, so history
    /// can never miss a superseded state.
    pub async fn update(&self, id: Uuid, mut updates: Value, reason: &str) -> Result<bool> {
        require_reason(reason).map_err(StoreError::Validation)?;

        let Some(current) = self.get(id).await? else {
            return Ok(false);
        };

        let snapshot =
            WhoIWasRecord::snapshot(id, reason, serde_json::to_value(&current)?, INDEX);
        self.history.add(&snapshot).await?;

        match updates.as_object_mut() {
            Some(object) => {
                object.insert("updated_at".to_string(), json!(utc_now()));
            }
            None => {
                return Err(StoreError::Validation(
                    "update payload must be a JSON object".to_string(),
                ));
            }
        }

        let updated = self.client.update_doc(INDEX, &id.to_string(), &updates).await?;
        debug!(%id, version = %snapshot.id, "updated coherence record");
        Ok(updated)
    }

    /// Delete with history preservation.
    pub async fn delete(&self, id: Uuid, reason: &str) -> Result<bool> {
        require_reason(reason).map_err(StoreError::Validation)?;

        let Some(current) = self.get(id).await? else {
            return Ok(false);
        };

        let snapshot =
            WhoIWasRecord::snapshot(id, reason, serde_json::to_value(&current)?, INDEX);
        self.history.add(&snapshot).await?;

        let deleted = self.client.delete_doc(INDEX, &id.to_string()).await?;
        debug!(%id, snapshot = %snapshot.id, "deleted coherence record");
        Ok(deleted)
    }

    pub async fn search(&self, query: &Value, size: usize) -> Result<Vec<CoherenceRecord>> {
        let hits = self.client.search(INDEX, query, size).await?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| serde_json::from_value(hit.source).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn coherence_for(uri: &str) -> CoherenceStore {
        let client = Arc::new(ElasticClient::new(uri).unwrap());
        let history = Arc::new(WhoIWasStore::new(client.clone()));
        CoherenceStore::new(client, history)
    }

    #[tokio::test]
    async fn test_update_writes_history_first() {
        let server = MockServer::start().await;
        let record = CoherenceRecord {
            content: "values long walks".to_string(),
            ..Default::default()
        };
        let id = record.id;

        Mock::given(method("GET"))
            .and(path(format!("/coherence/_doc/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"_source": serde_json::to_value(&record).unwrap()}),
            ))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/who_i_was/_doc/.+$"))
            .and(body_partial_json(json!({
                "supersedes": id.to_string(),
                "reason": "refined by user",
                "original_store": "coherence",
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/coherence/_update/{id}")))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = coherence_for(&server.uri());
        let updated = store
            .update(id, json!({"confidence": 0.9}), "refined by user")
            .await
            .unwrap();
        assert!(updated);
    }

    #[tokio::test]
    async fn test_update_missing_record_is_noop() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path(format!("/coherence/_doc/{id}")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = coherence_for(&server.uri());
        let updated = store
            .update(id, json!({"confidence": 0.1}), "no matter")
            .await
            .unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn test_delete_requires_reason() {
        let server = MockServer::start().await;
        let store = coherence_for(&server.uri());
        let error = store.delete(Uuid::new_v4(), "").await.unwrap_err();
        assert!(matches!(error, StoreError::Validation(_)));
    }
}
