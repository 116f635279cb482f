//! Citation metadata translation-server client
//!
//! Extracts bibliographic metadata from URLs via the translation server.
//! Status codes carry meaning: 200 = item array, 300 = multiple matches,
//! 400 = bad request, 501 = no translator for the URL. Results are cached
//! in-memory with a TTL since the same URL recurs across citation passes.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::Result;

const CACHE_SIZE: usize = 512;
/// Cached translations stay valid this long
const CACHE_TTL_HOURS: i64 = 24 * 30;

/// Creator from a translation result.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranslationCreator {
    #[serde(rename = "firstName")]
    pub first_name: Option<String>,
    #[serde(rename = "lastName")]
    pub last_name: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "creatorType", default)]
    pub creator_type: Option<String>,
}

impl TranslationCreator {
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

/// Bibliographic metadata extracted from a URL.
#[derive(Debug, Clone, Deserialize)]
pub struct TranslationResult {
    #[serde(rename = "itemType", default = "default_item_type")]
    pub item_type: String,
    pub title: Option<String>,
    #[serde(default)]
    pub creators: Vec<TranslationCreator>,
    pub date: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "abstractNote")]
    pub abstract_note: Option<String>,
    #[serde(rename = "publicationTitle")]
    pub publication_title: Option<String>,
    #[serde(rename = "websiteTitle")]
    pub website_title: Option<String>,
    #[serde(rename = "DOI")]
    pub doi: Option<String>,
    #[serde(rename = "ISBN")]
    pub isbn: Option<String>,
    pub publisher: Option<String>,
    pub language: Option<String>,
}

fn default_item_type() -> String {
    "webpage".to_string()
}

impl TranslationResult {
    fn basic(url: &str) -> Self {
        Self {
            item_type: default_item_type(),
            title: None,
            creators: vec![],
            date: None,
            url: Some(url.to_string()),
            abstract_note: None,
            publication_title: None,
            website_title: None,
            doi: None,
            isbn: None,
            publisher: None,
            language: None,
        }
    }

    /// All fields as a JSON object, including empty ones, so an enhancement
    /// pass can see what still needs filling.
    pub fn to_value_for_enhancement(&self) -> Value {
        json!({
            "itemType": self.item_type,
            "title": self.title,
            "authors": self.creators.iter().map(|c| c.full_name()).collect::<Vec<_>>(),
            "date": self.date,
            "url": self.url,
            "abstractNote": self.abstract_note,
            "publicationTitle": self.publication_title.clone().or_else(|| self.website_title.clone()),
            "DOI": self.doi,
            "ISBN": self.isbn,
            "publisher": self.publisher,
            "language": self.language,
        })
    }
}

struct CachedTranslation {
    result: Option<TranslationResult>,
    cached_at: DateTime<Utc>,
}

/// Async client for the translation server.
pub struct TranslationClient {
    http: reqwest::Client,
    base_url: String,
    cache: Mutex<LruCache<String, CachedTranslation>>,
}

impl TranslationClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_SIZE).expect("nonzero cache size"),
            )),
        })
    }

    /// Translate a URL into bibliographic metadata.
    ///
    /// Returns `None` when no translator exists for the URL or the server
    /// is unreachable; callers fall back to LLM enhancement over scraped
    /// content.
    pub async fn translate_url(&self, url: &str) -> Option<TranslationResult> {
        if let Some(cached) = self.cache_get(url) {
            debug!(url, "translation cache hit");
            return cached;
        }

        let response = match self
            .http
            .post(format!("{}/web", self.base_url))
            .json(&json!({"url": url, "sessionid": "thala"}))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(url, "translation server unreachable: {e}");
                return None;
            }
        };

        let result = match response.status().as_u16() {
            200 => {
                let items: Value = response.json().await.ok()?;
                items
                    .as_array()
                    .and_then(|array| array.first())
                    .cloned()
                    .and_then(|item| serde_json::from_value::<TranslationResult>(item).ok())
            }
            300 => {
                // Multiple matches: the server wants a selection dialog.
                // Fall back to a bare webpage item for this URL.
                debug!(url, "multiple translation matches, using basic result");
                Some(TranslationResult::basic(url))
            }
            501 => {
                debug!(url, "no translator available");
                None
            }
            400 => {
                debug!(url, "translation server rejected request");
                None
            }
            status => {
                warn!(url, status, "translation failed");
                None
            }
        };

        self.cache_put(url, result.clone());
        result
    }

    /// Look up by identifier (DOI, ISBN, arXiv id).
    pub async fn search_identifier(&self, identifier: &str) -> Option<TranslationResult> {
        let response = self
            .http
            .post(format!("{}/search", self.base_url))
            .header("Content-Type", "text/plain")
            .body(identifier.to_string())
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            debug!(identifier, status = %response.status(), "identifier lookup failed");
            return None;
        }

        let items: Value = response.json().await.ok()?;
        items
            .as_array()
            .and_then(|array| array.first())
            .cloned()
            .and_then(|item| serde_json::from_value(item).ok())
    }

    fn cache_get(&self, url: &str) -> Option<Option<TranslationResult>> {
        let mut cache = self.cache.lock().ok()?;
        let entry = cache.get(url)?;
        let age = Utc::now() - entry.cached_at;
        if age > chrono::Duration::hours(CACHE_TTL_HOURS) {
            cache.pop(url);
            return None;
        }
        Some(entry.result.clone())
    }

    fn cache_put(&self, url: &str, result: Option<TranslationResult>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(
                url.to_string(),
                CachedTranslation {
                    result,
                    cached_at: Utc::now(),
                },
            );
        }
    }
}
