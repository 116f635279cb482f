//! Vector index wrapper (Chroma-compatible)
//!
//! One collection (`knowledge`) with cosine distance over HNSW. Metadata is
//! flattened to scalars before storage: strings/numbers/booleans pass
//! through, lists and maps are JSON-serialized, nulls are dropped.
//!
//! `update` and `delete` write a WhoIWasRecord snapshot of the prior
//! `{metadata, document}` pair before touching the index.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::OnceCell;
use tracing::{debug, error};
use uuid::Uuid;

use crate::records::{StoreRecord, WhoIWasRecord};

use super::history::WhoIWasStore;
use super::{Result, StoreError};

const DEFAULT_COLLECTION: &str = "knowledge";
/// Logical store name recorded in history snapshots for vector entries
const VECTOR_STORE_NAME: &str = "knowledge_vectors";

/// A stored vector entry.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub id: Uuid,
    pub embedding: Option<Vec<f32>>,
    pub metadata: Option<Value>,
    pub document: Option<String>,
}

/// A similarity match from a vector query.
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: Uuid,
    pub distance: f64,
    pub metadata: Option<Value>,
    pub document: Option<String>,
}

/// Async client for the vector index.
pub struct ChromaStore {
    http: reqwest::Client,
    base_url: String,
    collection_name: String,
    collection_id: OnceCell<String>,
    history: Option<Arc<WhoIWasStore>>,
}

impl ChromaStore {
    /// Create a store for the default `knowledge` collection.
    ///
    /// `history` is required for `update`/`delete`; passing `None` restricts
    /// the store to add/query usage.
    pub fn new(base_url: impl Into<String>, history: Option<Arc<WhoIWasStore>>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(StoreError::Http)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collection_name: DEFAULT_COLLECTION.to_string(),
            collection_id: OnceCell::new(),
            history,
        })
    }

    async fn collection_id(&self) -> Result<&str> {
        self.collection_id
            .get_or_try_init(|| async {
                let url = format!("{}/api/v1/collections", self.base_url);
                let response = self
                    .http
                    .post(&url)
                    .json(&json!({
                        "name": self.collection_name,
                        "metadata": {"hnsw:space": "cosine"},
                        "get_or_create": true,
                    }))
                    .send()
                    .await?;
                let body: Value = Self::check(response).await?.json().await?;
                body.get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        StoreError::Backend("vector index returned no collection id".to_string())
                    })
            })
            .await
            .map(String::as_str)
    }

    /// Add (upsert) a record with its embedding and document text.
    pub async fn add(
        &self,
        record: &StoreRecord,
        embedding: &[f32],
        document: &str,
    ) -> Result<Uuid> {
        let collection = self.collection_id().await?.to_string();
        let metadata = sanitize_metadata(serde_json::to_value(record)?);

        let url = format!(
            "{}/api/v1/collections/{}/upsert",
            self.base_url, collection
        );
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "ids": [record.id.to_string()],
                "embeddings": [embedding],
                "metadatas": [metadata],
                "documents": [document],
            }))
            .send()
            .await?;
        Self::check(response).await?;
        debug!(id = %record.id, "upserted vector record");
        Ok(record.id)
    }

    /// Update with mandatory history tracking.
    pub async fn update(
        &self,
        record: &StoreRecord,
        embedding: &[f32],
        document: &str,
        reason: &str,
    ) -> Result<Uuid> {
        let history = self.history.as_ref().ok_or_else(|| {
            StoreError::Validation(
                "vector update requires a history store for mandatory archiving".to_string(),
            )
        })?;

        if let Some(existing) = self.get(record.id).await? {
            let snapshot = WhoIWasRecord::snapshot(
                record.id,
                reason,
                json!({
                    "metadata": existing.metadata,
                    "document": existing.document,
                }),
                VECTOR_STORE_NAME,
            );
            history.add(&snapshot).await?;
        }

        self.add(record, embedding, document).await
    }

    /// Fetch one entry by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<VectorEntry>> {
        let collection = self.collection_id().await?.to_string();
        let url = format!("{}/api/v1/collections/{}/get", self.base_url, collection);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "ids": [id.to_string()],
                "include": ["embeddings", "metadatas", "documents"],
            }))
            .send()
            .await?;
        let body: Value = Self::check(response).await?.json().await?;

        let ids = body.get("ids").and_then(Value::as_array);
        if ids.map(Vec::len).unwrap_or(0) == 0 {
            return Ok(None);
        }

        let embedding = body
            .pointer("/embeddings/0")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            });
        let metadata = body.pointer("/metadatas/0").cloned().filter(|m| !m.is_null());
        let document = body
            .pointer("/documents/0")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Some(VectorEntry {
            id,
            embedding,
            metadata,
            document,
        }))
    }

    /// Query for similar documents, optionally filtered on scalar metadata
    /// equality.
    pub async fn search(
        &self,
        query_embedding: &[f32],
        n_results: usize,
        where_filter: Option<Value>,
    ) -> Result<Vec<VectorMatch>> {
        let collection = self.collection_id().await?.to_string();
        let url = format!("{}/api/v1/collections/{}/query", self.base_url, collection);

        let mut body = json!({
            "query_embeddings": [query_embedding],
            "n_results": n_results,
            "include": ["metadatas", "documents", "distances"],
        });
        if let Some(filter) = where_filter {
            body["where"] = filter;
        }

        let response = self.http.post(&url).json(&body).send().await?;
        let result: Value = Self::check(response).await?.json().await?;

        // The index nests results per query even for a single embedding
        let ids = result
            .pointer("/ids/0")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut matches = Vec::with_capacity(ids.len());
        for (i, id_value) in ids.iter().enumerate() {
            let Some(id) = id_value.as_str().and_then(|s| Uuid::parse_str(s).ok()) else {
                continue;
            };
            matches.push(VectorMatch {
                id,
                distance: result
                    .pointer(&format!("/distances/0/{i}"))
                    .and_then(Value::as_f64)
                    .unwrap_or(1.0),
                metadata: result
                    .pointer(&format!("/metadatas/0/{i}"))
                    .cloned()
                    .filter(|m| !m.is_null()),
                document: result
                    .pointer(&format!("/documents/0/{i}"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }
        Ok(matches)
    }

    /// Delete by id with mandatory history tracking. Returns false on miss.
    pub async fn delete(&self, id: Uuid, reason: &str) -> Result<bool> {
        let history = self.history.as_ref().ok_or_else(|| {
            StoreError::Validation(
                "vector delete requires a history store for mandatory archiving".to_string(),
            )
        })?;

        let Some(existing) = self.get(id).await? else {
            return Ok(false);
        };

        let snapshot = WhoIWasRecord::snapshot(
            id,
            reason,
            json!({
                "metadata": existing.metadata,
                "document": existing.document,
            }),
            VECTOR_STORE_NAME,
        );
        history.add(&snapshot).await?;

        let collection = self.collection_id().await?.to_string();
        let url = format!(
            "{}/api/v1/collections/{}/delete",
            self.base_url, collection
        );
        let response = self
            .http
            .post(&url)
            .json(&json!({"ids": [id.to_string()]}))
            .send()
            .await?;
        Self::check(response).await?;
        debug!(%id, "deleted vector record");
        Ok(true)
    }

    /// Non-blocking liveness check.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/api/v1/heartbeat", self.base_url);
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                error!("vector index health check failed: {e}");
                false
            }
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(StoreError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Flatten metadata for the vector index, which only stores scalars.
///
/// Strings, numbers and booleans pass through; lists and maps become JSON
/// strings; nulls are dropped.
pub fn sanitize_metadata(metadata: Value) -> Map<String, Value> {
    let mut clean = Map::new();
    let Value::Object(object) = metadata else {
        return clean;
    };
    for (key, value) in object {
        match value {
            Value::Null => {}
            Value::String(_) | Value::Number(_) | Value::Bool(_) => {
                clean.insert(key, value);
            }
            Value::Array(_) | Value::Object(_) => {
                clean.insert(key, Value::String(value.to_string()));
            }
        }
    }
    clean
}

/// Flatten an arbitrary string/value map the same way.
pub fn sanitize_metadata_map(metadata: &BTreeMap<String, Value>) -> Map<String, Value> {
    sanitize_metadata(Value::Object(metadata.clone().into_iter().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_metadata_flattens_complex_values() {
        let input = json!({
            "title": "A Book",
            "word_count": 1234,
            "multi_author": true,
            "authors": ["A. One", "B. Two"],
            "nested": {"key": "value"},
            "absent": null,
        });
        let clean = sanitize_metadata(input);

        assert_eq!(clean["title"], "A Book");
        assert_eq!(clean["word_count"], 1234);
        assert_eq!(clean["multi_author"], true);
        // Collections become JSON strings
        assert_eq!(clean["authors"], json!(r#"["A. One","B. Two"]"#));
        assert_eq!(clean["nested"], json!(r#"{"key":"value"}"#));
        // Nulls are dropped entirely
        assert!(!clean.contains_key("absent"));
    }

    #[tokio::test]
    async fn test_update_without_history_is_rejected() {
        let store = ChromaStore::new("http://localhost:8000", None).unwrap();
        let record = StoreRecord::new("x");
        let error = store
            .update(&record, &[0.1], "doc", "edit")
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::Validation(_)));
    }
}
