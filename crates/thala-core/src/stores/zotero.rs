//! Bibliographic system client (Zotero local-crud plugin)
//!
//! Action-verbed CRUD over localhost HTTP. Item keys are 8-char
//! alphanumeric identifiers, the `bib_key` every external record carries.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::records::{SourceType, StoreRecord, is_valid_bib_key, utc_now};

use super::{Result, StoreError};

// ============================================================================
// SCHEMAS
// ============================================================================

/// Creator (author, editor, ...) attached to an item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoteroCreator {
    #[serde(rename = "firstName", skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(rename = "lastName", skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// Single-field name (organizations, mononyms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "creatorType", default = "default_creator_type")]
    pub creator_type: String,
}

fn default_creator_type() -> String {
    "author".to_string()
}

impl ZoteroCreator {
    /// Parse "First Last" into a two-field creator; anything else becomes a
    /// single-field name.
    pub fn from_name(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.split_once(' ') {
            Some((first, last)) if !last.trim().is_empty() => Self {
                first_name: Some(first.to_string()),
                last_name: Some(last.trim().to_string()),
                name: None,
                creator_type: default_creator_type(),
            },
            _ => Self {
                first_name: None,
                last_name: None,
                name: Some(trimmed.to_string()),
                creator_type: default_creator_type(),
            },
        }
    }

    /// Full display name.
    pub fn full_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Tag on an item. Type 1 marks automatic tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoteroTag {
    pub tag: String,
    #[serde(rename = "type", default)]
    pub tag_type: u8,
}

impl ZoteroTag {
    pub fn user(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            tag_type: 0,
        }
    }

    pub fn automatic(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            tag_type: 1,
        }
    }
}

/// Full item returned from the API.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoteroItem {
    pub key: String,
    #[serde(rename = "itemType")]
    pub item_type: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub creators: Vec<Value>,
    #[serde(default)]
    pub tags: Vec<Value>,
}

impl ZoteroItem {
    /// Tag strings, regardless of whether the API returned strings or
    /// `{tag, type}` objects.
    pub fn tag_names(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter_map(|t| match t {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => o.get("tag").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect()
    }

    /// Creator display names from the raw creator objects.
    pub fn creator_names(&self) -> Vec<String> {
        self.creators
            .iter()
            .filter_map(|c| {
                let object = c.as_object()?;
                if let Some(name) = object.get("name").and_then(Value::as_str) {
                    return Some(name.to_string());
                }
                let first = object.get("firstName").and_then(Value::as_str).unwrap_or("");
                let last = object.get("lastName").and_then(Value::as_str).unwrap_or("");
                let full = format!("{first} {last}").trim().to_string();
                (!full.is_empty()).then_some(full)
            })
            .collect()
    }
}

/// Payload for creating an item.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ZoteroItemCreate {
    #[serde(rename = "itemType")]
    pub item_type: String,
    pub fields: BTreeMap<String, Value>,
    pub creators: Vec<ZoteroCreator>,
    pub tags: Vec<ZoteroTag>,
    pub collections: Vec<String>,
}

/// Partial update payload; only present fields are sent.
#[derive(Debug, Clone, Default)]
pub struct ZoteroItemUpdate {
    pub fields: Option<BTreeMap<String, Value>>,
    pub creators: Option<Vec<ZoteroCreator>>,
    pub tags: Option<Vec<ZoteroTag>>,
    pub collections: Option<Vec<String>>,
}

/// One search condition (`condition`/`operator`/`value`).
#[derive(Debug, Clone, Serialize)]
pub struct ZoteroSearchCondition {
    pub condition: String,
    pub operator: String,
    pub value: String,
    #[serde(default)]
    pub required: bool,
}

impl ZoteroSearchCondition {
    pub fn contains(condition: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            operator: "contains".to_string(),
            value: value.into(),
            required: true,
        }
    }

    pub fn is(condition: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            operator: "is".to_string(),
            value: value.into(),
            required: true,
        }
    }
}

/// Lightweight search result.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoteroSearchResult {
    pub key: String,
    #[serde(rename = "itemType", default)]
    pub item_type: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Health report from the plugin ping.
#[derive(Debug, Clone, Default)]
pub struct ZoteroHealth {
    pub healthy: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

// ============================================================================
// CLIENT
// ============================================================================

/// Async client for the local bibliographic system.
pub struct ZoteroStore {
    http: reqwest::Client,
    base_url: String,
}

impl ZoteroStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(StoreError::Http)?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Create a new item, returning its 8-char key.
    pub async fn add(&self, item: &ZoteroItemCreate) -> Result<String> {
        let url = format!("{}/local-crud/items", self.base_url);
        let response = self.http.post(&url).json(item).send().await?;
        let body: Value = Self::check(response).await?.json().await?;
        let key = body
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| StoreError::Backend("item create returned no key".to_string()))?;
        if !is_valid_bib_key(key) {
            return Err(StoreError::Backend(format!(
                "bibliographic system returned malformed key {key:?}"
            )));
        }
        debug!(key, "created bibliographic item");
        Ok(key.to_string())
    }

    /// Get an item by key. Returns `None` when missing.
    pub async fn get(&self, key: &str) -> Result<Option<ZoteroItem>> {
        let url = format!("{}/local-crud/item", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({"action": "get", "key": key}))
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let body: Value = Self::check(response).await?.json().await?;
        if Self::is_not_found(&body) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(body)?))
    }

    /// Update an item. Returns false when missing.
    pub async fn update(&self, key: &str, updates: &ZoteroItemUpdate) -> Result<bool> {
        let url = format!("{}/local-crud/item", self.base_url);

        let mut payload = json!({"action": "update", "key": key});
        if let Some(fields) = &updates.fields {
            payload["fields"] = json!(fields);
        }
        if let Some(creators) = &updates.creators {
            payload["creators"] = json!(creators);
        }
        if let Some(tags) = &updates.tags {
            payload["tags"] = json!(tags);
        }
        if let Some(collections) = &updates.collections {
            payload["collections"] = json!(collections);
        }

        let response = self.http.post(&url).json(&payload).send().await?;
        if response.status().as_u16() == 404 {
            return Ok(false);
        }
        let body: Value = Self::check(response).await?.json().await.unwrap_or(Value::Null);
        if Self::is_not_found(&body) {
            return Ok(false);
        }
        debug!(key, "updated bibliographic item");
        Ok(true)
    }

    /// Delete an item. Returns false when missing.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let url = format!("{}/local-crud/item", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({"action": "delete", "key": key}))
            .send()
            .await?;

        match response.status().as_u16() {
            404 => Ok(false),
            204 => Ok(true),
            200 => {
                let body: Value = response.json().await.unwrap_or(Value::Null);
                Ok(!Self::is_not_found(&body))
            }
            _ => {
                Self::check(response).await?;
                Ok(true)
            }
        }
    }

    /// Check whether an item exists.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Search with explicit conditions.
    pub async fn search(
        &self,
        conditions: &[ZoteroSearchCondition],
        limit: usize,
    ) -> Result<Vec<ZoteroSearchResult>> {
        let body = self.search_raw(conditions, limit, false).await?;
        let items = body
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect())
    }

    /// Search returning full item data.
    pub async fn search_full(
        &self,
        conditions: &[ZoteroSearchCondition],
        limit: usize,
    ) -> Result<Vec<ZoteroItem>> {
        let body = self.search_raw(conditions, limit, true).await?;
        let items = body
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect())
    }

    async fn search_raw(
        &self,
        conditions: &[ZoteroSearchCondition],
        limit: usize,
        include_full_data: bool,
    ) -> Result<Value> {
        let url = format!("{}/local-crud/search", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "conditions": conditions,
                "limit": limit,
                "includeFullData": include_full_data,
            }))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn search_by_title(&self, title: &str, limit: usize) -> Result<Vec<ZoteroSearchResult>> {
        self.search(&[ZoteroSearchCondition::contains("title", title)], limit)
            .await
    }

    pub async fn search_by_tag(&self, tag: &str, limit: usize) -> Result<Vec<ZoteroSearchResult>> {
        self.search(&[ZoteroSearchCondition::is("tag", tag)], limit)
            .await
    }

    /// Quicksearch across all fields, like the search bar.
    pub async fn quicksearch(&self, query: &str, limit: usize) -> Result<Vec<ZoteroSearchResult>> {
        self.search(
            &[ZoteroSearchCondition::contains(
                "quicksearch-everything",
                query,
            )],
            limit,
        )
        .await
    }

    /// All items in the library (excluding attachments and notes).
    pub async fn get_all(&self, limit: usize) -> Result<Vec<ZoteroSearchResult>> {
        self.search(&[], limit).await
    }

    /// Non-blocking liveness check via the plugin ping endpoint.
    pub async fn health_check(&self) -> ZoteroHealth {
        let url = format!("{}/local-crud/ping", self.base_url);
        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                let body: Value = response.json().await.unwrap_or(Value::Null);
                ZoteroHealth {
                    healthy: true,
                    version: body
                        .get("version")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    error: None,
                }
            }
            Ok(response) => ZoteroHealth {
                healthy: false,
                version: None,
                error: Some(format!("HTTP {}", response.status())),
            },
            Err(e) => {
                error!("bibliographic system health check failed: {e}");
                ZoteroHealth {
                    healthy: false,
                    version: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Link a record to an existing item, marking it external.
    pub async fn link_record(&self, record: &mut StoreRecord, key: &str) -> Result<()> {
        if !self.exists(key).await? {
            return Err(StoreError::Validation(format!(
                "bibliographic item {key:?} not found"
            )));
        }
        record.bib_key = Some(key.to_string());
        record.source_type = SourceType::External;
        record.updated_at = utc_now();
        Ok(())
    }

    /// Create an item for a record and link them, stamping the record id
    /// into the item's extra field for traceability.
    pub async fn create_from_record(
        &self,
        record: &mut StoreRecord,
        item_type: &str,
        title: Option<&str>,
        extra_fields: BTreeMap<String, Value>,
    ) -> Result<String> {
        let mut fields = extra_fields;
        if let Some(title) = title {
            fields.insert("title".to_string(), json!(title));
        }

        let mut extra = fields
            .get("extra")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if !extra.is_empty() {
            extra.push('\n');
        }
        extra.push_str(&format!("thala-id: {}", record.id));
        fields.insert("extra".to_string(), json!(extra));

        let key = self
            .add(&ZoteroItemCreate {
                item_type: item_type.to_string(),
                fields,
                ..Default::default()
            })
            .await?;

        record.bib_key = Some(key.clone());
        record.source_type = SourceType::External;
        record.updated_at = utc_now();
        Ok(key)
    }

    fn is_not_found(body: &Value) -> bool {
        body.get("error").and_then(Value::as_str) == Some("Item not found")
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

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_creator_name_parsing() {
        let two_part = ZoteroCreator::from_name("Ada Lovelace");
        assert_eq!(two_part.first_name.as_deref(), Some("Ada"));
        assert_eq!(two_part.last_name.as_deref(), Some("Lovelace"));
        assert_eq!(two_part.full_name(), "Ada Lovelace");

        let single = ZoteroCreator::from_name("UNESCO");
        assert_eq!(single.name.as_deref(), Some("UNESCO"));
        assert!(single.first_name.is_none());
    }

    #[test]
    fn test_item_tag_names_handles_both_shapes() {
        let item = ZoteroItem {
            key: "ABCD1234".into(),
            item_type: "book".into(),
            version: 1,
            fields: BTreeMap::new(),
            creators: vec![],
            tags: vec![json!("plain"), json!({"tag": "structured", "type": 1})],
        };
        assert_eq!(item.tag_names(), vec!["plain", "structured"]);
    }

    #[tokio::test]
    async fn test_add_returns_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/local-crud/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"key": "QWER5678"})))
            .mount(&server)
            .await;

        let store = ZoteroStore::new(server.uri()).unwrap();
        let key = store
            .add(&ZoteroItemCreate {
                item_type: "document".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(key, "QWER5678");
    }

    #[tokio::test]
    async fn test_add_rejects_malformed_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/local-crud/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"key": "bad"})))
            .mount(&server)
            .await;

        let store = ZoteroStore::new(server.uri()).unwrap();
        let error = store.add(&ZoteroItemCreate::default()).await.unwrap_err();
        assert!(matches!(error, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn test_get_handles_error_body_as_missing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/local-crud/item"))
            .and(body_partial_json(json!({"action": "get"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"error": "Item not found"})),
            )
            .mount(&server)
            .await;

        let store = ZoteroStore::new(server.uri()).unwrap();
        let item = store.get("ZZZZ9999").await.unwrap();
        assert!(item.is_none());
    }

    #[tokio::test]
    async fn test_create_from_record_links_and_stamps_extra() {
        let server = MockServer::start().await;
        let mut record = StoreRecord::new("text");
        let expected_extra = format!("thala-id: {}", record.id);

        Mock::given(method("POST"))
            .and(path("/local-crud/items"))
            .and(body_partial_json(json!({
                "itemType": "book",
                "fields": {"extra": expected_extra},
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"key": "LINK0001"})))
            .expect(1)
            .mount(&server)
            .await;

        let store = ZoteroStore::new(server.uri()).unwrap();
        let key = store
            .create_from_record(&mut record, "book", Some("A Title"), BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(key, "LINK0001");
        assert_eq!(record.bib_key.as_deref(), Some("LINK0001"));
        assert_eq!(record.source_type, SourceType::External);
    }
}
