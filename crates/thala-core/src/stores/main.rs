//! Main store - originals and compressions, partitioned by level
//!
//! Routes to one of three indices based on `compression_level`:
//! store_l0 (originals), store_l1 (short summaries), store_l2 (10:1).

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;
use uuid::Uuid;

use crate::records::{StoreRecord, require_reason, utc_now};

use super::elastic::ElasticClient;
use super::forgotten::ForgottenStore;
use super::{Result, StoreError};

/// Index pattern matching all three levels
const ALL_LEVELS: &str = "store_l*";
/// Indices that carry embeddings
const EMBEDDED_LEVELS: &str = "store_l1,store_l2";

/// Index name for a compression level.
pub fn index_for_level(level: u8) -> &'static str {
    match level {
        1 => "store_l1",
        2 => "store_l2",
        _ => "store_l0",
    }
}

/// Store for all relevant content, level-routed across three indices.
pub struct MainStore {
    client: Arc<ElasticClient>,
    forgotten: Arc<ForgottenStore>,
}

impl MainStore {
    pub fn new(client: Arc<ElasticClient>, forgotten: Arc<ForgottenStore>) -> Self {
        Self { client, forgotten }
    }

    /// Add a record to the index for its compression level.
    pub async fn add(&self, record: &StoreRecord) -> Result<Uuid> {
        record.validate().map_err(StoreError::Validation)?;
        let index = index_for_level(record.compression_level);
        let document = serde_json::to_value(record)?;
        self.client
            .index_doc(index, &record.id.to_string(), &document)
            .await?;
        Ok(record.id)
    }

    /// Get a record by id.
    ///
    /// With a level hint this is a single lookup; without one all three
    /// indices are probed in order.
    pub async fn get(&self, id: Uuid, level: Option<u8>) -> Result<Option<StoreRecord>> {
        let id_str = id.to_string();
        match level {
            Some(level) => self.fetch(index_for_level(level), &id_str).await,
            None => {
                for level in 0..=2u8 {
                    if let Some(record) = self.fetch(index_for_level(level), &id_str).await? {
                        return Ok(Some(record));
                    }
                }
                Ok(None)
            }
        }
    }

    async fn fetch(&self, index: &str, id: &str) -> Result<Option<StoreRecord>> {
        match self.client.get_doc(index, id).await? {
            Some(source) => Ok(Some(serde_json::from_value(source)?)),
            None => Ok(None),
        }
    }

    /// Locate a derivative record given its parent (L0) id.
    pub async fn get_by_source_id(
        &self,
        source_id: Uuid,
        level: u8,
    ) -> Result<Option<StoreRecord>> {
        if level == 0 {
            return self.get(source_id, Some(0)).await;
        }
        let query = json!({
            "bool": {
                "must": [
                    {"term": {"source_ids": source_id.to_string()}},
                    {"term": {"compression_level": level}},
                ]
            }
        });
        let mut records = self.search(&query, 1, Some(level)).await?;
        Ok(records.drain(..).next())
    }

    /// Locate a record by bibliographic key at the given level.
    pub async fn get_by_bib_key(&self, bib_key: &str, level: u8) -> Result<Option<StoreRecord>> {
        let query = json!({"term": {"bib_key": bib_key}});
        let mut records = self.search(&query, 1, Some(level)).await?;
        Ok(records.drain(..).next())
    }

    /// Partially update a record; sets `updated_at`. Returns false on miss.
    pub async fn update(&self, id: Uuid, mut updates: Value, level: u8) -> Result<bool> {
        if let Some(object) = updates.as_object_mut() {
            object.insert("updated_at".to_string(), json!(utc_now()));
        } else {
            return Err(StoreError::Validation(
                "update payload must be a JSON object".to_string(),
            ));
        }
        self.client
            .update_doc(index_for_level(level), &id.to_string(), &updates)
            .await
    }

    /// Delete a record with a required reason, archiving it first.
    ///
    /// The forgotten write strictly precedes the delete: a crash in between
    /// duplicates a snapshot but never loses one.
    pub async fn delete(&self, id: Uuid, reason: &str, level: Option<u8>) -> Result<bool> {
        require_reason(reason).map_err(StoreError::Validation)?;

        let Some(current) = self.get(id, level).await? else {
            return Ok(false);
        };
        let index = index_for_level(current.compression_level);

        self.forgotten.forget_record(&current, reason, index).await?;

        let deleted = self.client.delete_doc(index, &id.to_string()).await?;
        if deleted {
            debug!(%id, index, "deleted store record, archived to forgotten");
        }
        Ok(deleted)
    }

    /// Search with the vendor query DSL. Without a level hint, all three
    /// indices are searched.
    pub async fn search(
        &self,
        query: &Value,
        size: usize,
        level: Option<u8>,
    ) -> Result<Vec<StoreRecord>> {
        let index = match level {
            Some(level) => index_for_level(level),
            None => ALL_LEVELS,
        };
        let hits = self.client.search(index, query, size).await?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| serde_json::from_value(hit.source).ok())
            .collect())
    }

    /// kNN vector search over the summary levels.
    ///
    /// L0 carries no embeddings; asking for it is a programmer error.
    pub async fn knn_search(
        &self,
        embedding: &[f32],
        k: usize,
        level: Option<u8>,
    ) -> Result<Vec<(StoreRecord, f64)>> {
        let index = match level {
            Some(0) => {
                return Err(StoreError::Validation(
                    "store_l0 has no embeddings - use text search".to_string(),
                ));
            }
            Some(level) => index_for_level(level),
            None => EMBEDDED_LEVELS,
        };
        let hits = self
            .client
            .knn_search(index, "embedding", embedding, k, k.max(10) * 10)
            .await?;
        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                serde_json::from_value(hit.source)
                    .ok()
                    .map(|record| (record, hit.score))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::forgotten::ForgottenStore;
    use wiremock::matchers::{body_partial_json, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server_uri: &str) -> MainStore {
        let client = Arc::new(ElasticClient::new(server_uri).unwrap());
        let forgotten = Arc::new(ForgottenStore::new(client.clone()));
        MainStore::new(client, forgotten)
    }

    #[test]
    fn test_level_routing() {
        assert_eq!(index_for_level(0), "store_l0");
        assert_eq!(index_for_level(1), "store_l1");
        assert_eq!(index_for_level(2), "store_l2");
        // Out of range falls back to l0, matching legacy documents
        assert_eq!(index_for_level(7), "store_l0");
    }

    #[tokio::test]
    async fn test_add_routes_by_level() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path_regex(r"^/store_l1/_doc/.+$"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server.uri());
        let parent = StoreRecord::new("original");
        let summary = StoreRecord::derived_from(&parent, 1, "a summary");
        store.add(&summary).await.unwrap();
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_record() {
        let server = MockServer::start().await;
        let store = store_for(&server.uri());

        let mut record = StoreRecord::new("summary with no lineage");
        record.compression_level = 2;
        let error = store.add(&record).await.unwrap_err();
        assert!(matches!(error, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_knn_on_l0_is_programmer_error() {
        let server = MockServer::start().await;
        let store = store_for(&server.uri());
        let error = store.knn_search(&[0.1, 0.2], 5, Some(0)).await.unwrap_err();
        assert!(matches!(error, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_requires_reason() {
        let server = MockServer::start().await;
        let store = store_for(&server.uri());
        let error = store
            .delete(Uuid::new_v4(), "  ", None)
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_archives_before_removal() {
        let server = MockServer::start().await;
        let record = StoreRecord::new("to forget");
        let id = record.id.to_string();
        let source = serde_json::to_value(&record).unwrap();

        Mock::given(method("GET"))
            .and(path(format!("/store_l0/_doc/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"_source": source})))
            .mount(&server)
            .await;
        // Archive write must land in the forgotten index
        Mock::given(method("PUT"))
            .and(path_regex(r"^/forgotten/_doc/.+$"))
            .and(body_partial_json(json!({"forgotten_reason": "stale"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("/store_l0/_doc/{id}")))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server.uri());
        let deleted = store.delete(record.id, "stale", Some(0)).await.unwrap();
        assert!(deleted);
    }
}
