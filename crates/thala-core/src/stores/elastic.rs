//! Text/metadata index client (Elasticsearch-compatible)
//!
//! Thin async wrapper over the vendor HTTP API. Two instances back the
//! system: the coherence host (store_l0/l1/l2, coherence) and the forgotten
//! host (who_i_was, forgotten). Query DSL bodies pass through verbatim.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::debug;

use super::{Result, StoreError};

/// Default per-request timeout for index operations
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Retries for idempotent operations (reads, searches)
const MAX_RETRIES: u32 = 3;
/// Initial backoff between retries, doubled each attempt
const RETRY_BASE_MS: u64 = 250;

/// One ranked hit from a search
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub source: Value,
    pub score: f64,
}

/// Async client for one text-index instance.
#[derive(Debug, Clone)]
pub struct ElasticClient {
    http: reqwest::Client,
    base_url: String,
}

impl ElasticClient {
    /// Create a client for `base_url` with the default timeout.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a client with an explicit request timeout.
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(StoreError::Http)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Index (upsert) a document under an explicit id.
    pub async fn index_doc(&self, index: &str, id: &str, document: &Value) -> Result<()> {
        let url = self.url(&format!("{index}/_doc/{id}"));
        let response = self.http.put(&url).json(document).send().await?;
        Self::check(response).await?;
        debug!(index, id, "indexed document");
        Ok(())
    }

    /// Fetch a document's `_source` by id. Returns `None` on 404.
    pub async fn get_doc(&self, index: &str, id: &str) -> Result<Option<Value>> {
        let url = self.url(&format!("{index}/_doc/{id}"));
        let body = self
            .with_retry(|| async {
                let response = self.http.get(&url).send().await?;
                if response.status().as_u16() == 404 {
                    return Ok(None);
                }
                let body: Value = Self::check(response).await?.json().await?;
                Ok(Some(body))
            })
            .await?;
        Ok(body.and_then(|mut b| {
            b.get_mut("_source").map(Value::take)
        }))
    }

    /// Partially update a document. Returns `false` on 404.
    pub async fn update_doc(&self, index: &str, id: &str, partial: &Value) -> Result<bool> {
        let url = self.url(&format!("{index}/_update/{id}"));
        let response = self
            .http
            .post(&url)
            .json(&json!({ "doc": partial }))
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Ok(false);
        }
        Self::check(response).await?;
        debug!(index, id, "updated document");
        Ok(true)
    }

    /// Delete a document by id. Returns `false` on 404.
    pub async fn delete_doc(&self, index: &str, id: &str) -> Result<bool> {
        let url = self.url(&format!("{index}/_doc/{id}"));
        let response = self.http.delete(&url).send().await?;
        if response.status().as_u16() == 404 {
            return Ok(false);
        }
        Self::check(response).await?;
        debug!(index, id, "deleted document");
        Ok(true)
    }

    /// Run a query-DSL search against `index` (may be a pattern or list).
    pub async fn search(&self, index: &str, query: &Value, size: usize) -> Result<Vec<SearchHit>> {
        let body = json!({ "query": query, "size": size });
        self.search_body(index, &body).await
    }

    /// kNN search over a dense-vector field.
    pub async fn knn_search(
        &self,
        index: &str,
        field: &str,
        embedding: &[f32],
        k: usize,
        num_candidates: usize,
    ) -> Result<Vec<SearchHit>> {
        let body = json!({
            "knn": {
                "field": field,
                "query_vector": embedding,
                "k": k,
                "num_candidates": num_candidates,
            }
        });
        self.search_body(index, &body).await
    }

    async fn search_body(&self, index: &str, body: &Value) -> Result<Vec<SearchHit>> {
        let url = self.url(&format!("{index}/_search"));
        let response: Value = self
            .with_retry(|| async {
                let response = self.http.post(&url).json(body).send().await?;
                Ok(Self::check(response).await?.json().await?)
            })
            .await?;

        let hits = response
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(hits
            .into_iter()
            .filter_map(|mut hit| {
                let score = hit.get("_score").and_then(Value::as_f64).unwrap_or(0.0);
                hit.get_mut("_source")
                    .map(Value::take)
                    .map(|source| SearchHit { source, score })
            })
            .collect())
    }

    /// Check whether a document exists.
    pub async fn exists(&self, index: &str, id: &str) -> Result<bool> {
        let url = self.url(&format!("{index}/_doc/{id}"));
        self.with_retry(|| async {
            let response = self.http.head(&url).send().await?;
            Ok(response.status().is_success())
        })
        .await
    }

    /// Cluster health status string ("green", "yellow", "red").
    pub async fn cluster_health(&self) -> Result<String> {
        let url = self.url("_cluster/health");
        let body: Value = self
            .with_retry(|| async {
                let response = self.http.get(&url).send().await?;
                Ok(Self::check(response).await?.json().await?)
            })
            .await?;
        Ok(body
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("red")
            .to_string())
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

    /// Retry idempotent operations on transport/5xx failures with
    /// exponential backoff.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_error = None;
        for attempt in 0..MAX_RETRIES {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    debug!(attempt, error = %e, "retrying index request");
                    last_error = Some(e);
                    tokio::time::sleep(Duration::from_millis(RETRY_BASE_MS << attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| StoreError::Backend("retries exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_get_doc_found_and_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/store_l0/_doc/abc"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"_source": {"content": "hi"}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/store_l0/_doc/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = ElasticClient::new(server.uri()).unwrap();
        let found = client.get_doc("store_l0", "abc").await.unwrap();
        assert_eq!(found.unwrap()["content"], "hi");
        let missing = client.get_doc("store_l0", "missing").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_search_parses_hits_and_scores() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/store_l1/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"hits": [
                    {"_score": 2.5, "_source": {"content": "first"}},
                    {"_score": 1.0, "_source": {"content": "second"}},
                ]}
            })))
            .mount(&server)
            .await;

        let client = ElasticClient::new(server.uri()).unwrap();
        let hits = client
            .search("store_l1", &json!({"match_all": {}}), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].score, 2.5);
        assert_eq!(hits[0].source["content"], "first");
    }

    #[tokio::test]
    async fn test_update_missing_returns_false() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/coherence/_update/nope"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = ElasticClient::new(server.uri()).unwrap();
        let updated = client
            .update_doc("coherence", "nope", &json!({"content": "x"}))
            .await
            .unwrap();
        assert!(!updated);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds_on_5xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_cluster/health"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_cluster/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "yellow"})))
            .mount(&server)
            .await;

        let client = ElasticClient::new(server.uri()).unwrap();
        assert_eq!(client.cluster_health().await.unwrap(), "yellow");
    }
}
