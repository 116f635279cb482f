//! URL/PDF-to-markdown service client
//!
//! Resolves URLs (HTML or PDF) to markdown through the external conversion
//! service. PDF conversion accepts a quality preset and OCR language list.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{Result, WorkflowError};

/// Conversion attempts before giving up
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 500;

/// PDF conversion quality preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PdfQuality {
    Fast,
    #[default]
    Balanced,
    Quality,
}

impl PdfQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            PdfQuality::Fast => "fast",
            PdfQuality::Balanced => "balanced",
            PdfQuality::Quality => "quality",
        }
    }
}

/// Options for a fetch.
#[derive(Debug, Clone)]
pub struct GetUrlOptions {
    pub pdf_quality: PdfQuality,
    /// OCR languages for scanned PDFs
    pub pdf_langs: Vec<String>,
}

impl Default for GetUrlOptions {
    fn default() -> Self {
        Self {
            pdf_quality: PdfQuality::Balanced,
            pdf_langs: vec!["English".to_string()],
        }
    }
}

/// Resolved markdown plus which provider produced it.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub content: String,
    pub provider: Option<String>,
}

/// Client for the URL/HTML/PDF-to-markdown service.
pub struct UrlFetchClient {
    http: reqwest::Client,
    base_url: String,
}

impl UrlFetchClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            // PDF OCR on large documents is slow
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Fetch a URL and convert it to markdown.
    pub async fn get_url(&self, url: &str, options: &GetUrlOptions) -> Result<FetchedDocument> {
        let body = json!({
            "url": url,
            "pdf_quality": options.pdf_quality.as_str(),
            "pdf_langs": options.pdf_langs,
        });

        let mut last_error: Option<WorkflowError> = None;
        for attempt in 0..MAX_ATTEMPTS {
            match self.fetch_once(&body).await {
                Ok(document) => return Ok(document),
                Err(e) => {
                    debug!(attempt, url, "url fetch failed: {e}");
                    last_error = Some(e);
                    tokio::time::sleep(Duration::from_millis(RETRY_BASE_MS << attempt)).await;
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| WorkflowError::Service("url fetch retries exhausted".to_string())))
    }

    async fn fetch_once(&self, body: &serde_json::Value) -> Result<FetchedDocument> {
        let response = self
            .http
            .post(format!("{}/get_url", self.base_url))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(WorkflowError::Service(format!(
                "conversion service returned {status}: {text}"
            )));
        }

        let payload: serde_json::Value = response.json().await?;
        let content = payload
            .get("content")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                WorkflowError::Service("conversion response carried no content".to_string())
            })?
            .to_string();

        Ok(FetchedDocument {
            content,
            provider: payload
                .get("provider")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
        })
    }
}

/// Whether a source string is a URL (vs raw markdown text).
pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.org/paper.pdf"));
        assert!(is_url("http://example.org"));
        assert!(!is_url("# A markdown document"));
        assert!(!is_url("ftp://example.org"));
    }

    #[tokio::test]
    async fn test_get_url_passes_quality_preset() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get_url"))
            .and(body_partial_json(
                serde_json::json!({"pdf_quality": "quality", "pdf_langs": ["German"]}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"content": "# Converted\n\ntext", "provider": "marker"}),
            ))
            .mount(&server)
            .await;

        let client = UrlFetchClient::new(server.uri()).unwrap();
        let document = client
            .get_url(
                "https://example.org/doc.pdf",
                &GetUrlOptions {
                    pdf_quality: PdfQuality::Quality,
                    pdf_langs: vec!["German".to_string()],
                },
            )
            .await
            .unwrap();
        assert!(document.content.starts_with("# Converted"));
        assert_eq!(document.provider.as_deref(), Some("marker"));
    }

    #[tokio::test]
    async fn test_get_url_retries_on_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/get_url"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/get_url"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"content": "recovered"})),
            )
            .mount(&server)
            .await;

        let client = UrlFetchClient::new(server.uri()).unwrap();
        let document = client
            .get_url("https://example.org", &GetUrlOptions::default())
            .await
            .unwrap();
        assert_eq!(document.content, "recovered");
    }
}
