//! The document processing pipeline
//!
//! Staged ingestion of one source document: resolve input, create tracking
//! stubs, extract and chunk text, fan out into parallel summary and
//! metadata agents, detect chapters, produce the 10:1 summary, persist
//! every derivative. Partial failures annotate the outcome instead of
//! aborting; a traceable stub exists before any expensive work starts.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use thala_core::llm::{LlmGateway, ModelTier};
use thala_core::records::{SourceType, StoreRecord};
use thala_core::stores::{
    StoreManager, ZoteroCreator, ZoteroItemCreate, ZoteroItemUpdate, ZoteroTag,
};
use thala_core::text::{
    DEFAULT_CHUNK_SIZE, chunk_by_headings, count_words, detect_language, estimate_pages,
    first_n_pages, last_n_pages,
};

use super::chapters::{aggregate_summaries, detect_chapters, summarize_chapters};
use super::prompts::{
    DOCUMENT_ANALYSIS_SYSTEM, TRANSLATION_SYSTEM, metadata_user, summary_user,
};
use super::state::{
    BilingualText, DocumentInput, DocumentMetadata, DocumentOutcome, ProcessingResult,
    StageError, StoreRecordRef, TENTH_SUMMARY_WORD_THRESHOLD,
};
use super::validate::validate_content_metadata;
use crate::error::{Result, WorkflowError};
use crate::scrape::{GetUrlOptions, UrlFetchClient, is_url};

/// Default concurrent documents in batch ingestion
pub const DOCUMENT_BATCH_CONCURRENCY: usize = 5;
/// Documents above this size summarize from first+last pages only
const LONG_DOCUMENT_CHARS: usize = 50_000;
/// Pages taken from each end for summary/metadata on long documents
const CONDENSE_PAGES: usize = 10;
/// Sample size for language detection
const LANGUAGE_SAMPLE_CHARS: usize = 5_000;
/// Target length of the short summary
const SHORT_SUMMARY_WORDS: usize = 100;

/// The staged document-processing pipeline.
pub struct DocumentPipeline {
    stores: Arc<StoreManager>,
    gateway: Arc<LlmGateway>,
    fetcher: Option<Arc<UrlFetchClient>>,
    staging_dir: PathBuf,
}

impl DocumentPipeline {
    pub fn new(
        stores: Arc<StoreManager>,
        gateway: Arc<LlmGateway>,
        fetcher: Option<Arc<UrlFetchClient>>,
        staging_dir: PathBuf,
    ) -> Self {
        Self {
            stores,
            gateway,
            fetcher,
            staging_dir,
        }
    }

    /// Process one document through the full pipeline.
    ///
    /// Never panics or errors out of the stub stage: once the tracking stub
    /// exists, later failures are recorded on the outcome.
    pub async fn process_document(&self, input: DocumentInput) -> DocumentOutcome {
        let mut outcome = DocumentOutcome {
            status: "starting".to_string(),
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        info!(source = preview(&input.source), "starting document processing");

        // ---- resolve_input ----
        let processing = match self.resolve_input(&input).await {
            Ok(processing) => processing,
            Err(e) => return DocumentOutcome::failed(format!("resolve_input: {e}")),
        };
        let needs_tenth = processing.word_count > TENTH_SUMMARY_WORD_THRESHOLD;
        info!(
            words = processing.word_count,
            pages = processing.page_count,
            chunks = processing.chunks.len(),
            "input resolved"
        );

        // ---- create_stub ----
        let (bib_key, l0_id) = match self.create_stub(&input, &processing).await {
            Ok(stub) => stub,
            Err(e) => return DocumentOutcome::failed(format!("create_stub: {e}")),
        };
        outcome.bib_key = Some(bib_key.clone());
        outcome.records.push(StoreRecordRef {
            id: l0_id,
            compression_level: 0,
            content_preview: String::new(),
        });
        outcome.status = "stub_created".to_string();

        // ---- update_store_with_content ----
        if let Err(e) = self.update_store_with_content(l0_id, &processing).await {
            warn!("store update failed: {e}");
            outcome.errors.push(StageError {
                node: "update_store_with_content".to_string(),
                error: e.to_string(),
            });
        } else if let Some(l0) = outcome.records.first_mut() {
            l0.content_preview = preview(&processing.markdown);
        }

        // ---- language detection ----
        let language = self.detect_document_language(l0_id, &processing).await;
        outcome.original_language = language.clone();
        let is_english = language.as_deref().map(|l| l == "en").unwrap_or(true);

        // ---- parallel summary + metadata agents ----
        let (summary_result, metadata_result) = tokio::join!(
            self.summary_agent(&processing),
            self.metadata_agent(&processing),
        );

        let short_original = match summary_result {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("summary agent failed: {e}");
                outcome.errors.push(StageError {
                    node: "summary_agent".to_string(),
                    error: e.to_string(),
                });
                None
            }
        };
        let metadata = match metadata_result {
            Ok(metadata) => {
                debug!(
                    title = ?metadata.title,
                    authors = metadata.authors.len(),
                    "metadata extracted"
                );
                Some(metadata)
            }
            Err(e) => {
                warn!("metadata agent failed: {e}");
                outcome.errors.push(StageError {
                    node: "metadata_agent".to_string(),
                    error: e.to_string(),
                });
                None
            }
        };

        // ---- save_short_summary ----
        let short_summary = match &short_original {
            Some(original) => {
                let english = if is_english {
                    original.clone()
                } else {
                    self.translate_to_english(original).await.unwrap_or_else(|e| {
                        warn!("summary translation failed: {e}");
                        original.clone()
                    })
                };
                Some(BilingualText {
                    original: original.clone(),
                    english,
                })
            }
            None => None,
        };

        if let Some(summary) = &short_summary {
            match self
                .save_summary_record(l0_id, &bib_key, summary, 1, language.as_deref(), None)
                .await
            {
                Ok(reference) => outcome.records.push(reference),
                Err(e) => {
                    warn!("failed to save short summary: {e}");
                    outcome.errors.push(StageError {
                        node: "save_short_summary".to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        outcome.short_summary = short_summary.clone();

        // ---- update_bib_item ----
        if let Err(e) = self
            .update_bib_item(&bib_key, short_summary.as_ref(), metadata.as_ref())
            .await
        {
            warn!("bibliographic update failed: {e}");
            outcome.errors.push(StageError {
                node: "update_bib_item".to_string(),
                error: e.to_string(),
            });
        }

        // ---- content/metadata validation ----
        if let Some(metadata) = &metadata {
            let validation =
                validate_content_metadata(&self.gateway, &processing.markdown, metadata).await;
            if !validation.matched {
                outcome.validation_error = Some(validation.notes.clone());
            }
        }
        outcome.metadata = metadata.clone();

        // ---- detect_chapters + 10:1 summary ----
        if needs_tenth {
            let detection = detect_chapters(
                &self.gateway,
                &processing.markdown,
                processing.word_count,
                metadata.as_ref(),
            )
            .await;
            outcome.chapters = detection.chapters.clone();

            if detection.needs_tenth_summary && !detection.chapters.is_empty() {
                let summaries = summarize_chapters(
                    &self.gateway,
                    &processing.markdown,
                    &detection.chapters,
                    input.use_batch_api,
                )
                .await;
                let tenth_original = aggregate_summaries(&summaries);

                let tenth_english = if is_english {
                    tenth_original.clone()
                } else {
                    self.translate_to_english(&tenth_original)
                        .await
                        .unwrap_or_else(|e| {
                            warn!("tenth summary translation failed: {e}");
                            tenth_original.clone()
                        })
                };
                let tenth = BilingualText {
                    original: tenth_original,
                    english: tenth_english,
                };

                match self
                    .save_summary_record(
                        l0_id,
                        &bib_key,
                        &tenth,
                        2,
                        language.as_deref(),
                        Some(detection.chapters.len()),
                    )
                    .await
                {
                    Ok(reference) => outcome.records.push(reference),
                    Err(e) => {
                        warn!("failed to save tenth summary: {e}");
                        outcome.errors.push(StageError {
                            node: "save_tenth_summary".to_string(),
                            error: e.to_string(),
                        });
                    }
                }
                outcome.tenth_summary = Some(tenth);
            }
        }

        // ---- finalize ----
        outcome.completed_at = Some(Utc::now());
        outcome.status = if outcome.errors.is_empty() {
            "completed".to_string()
        } else {
            "completed_with_errors".to_string()
        };
        info!(
            status = outcome.status,
            records = outcome.records.len(),
            errors = outcome.errors.len(),
            bib_key,
            "document processing finished"
        );
        outcome
    }

    /// Fan out batch ingestion under a semaphore. Per-document failures
    /// become failed outcomes; the batch always completes.
    pub async fn process_documents_batch(
        &self,
        inputs: Vec<DocumentInput>,
        concurrency: usize,
    ) -> Vec<DocumentOutcome> {
        info!(
            count = inputs.len(),
            concurrency, "starting batch document processing"
        );
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        let tasks = inputs.into_iter().map(|input| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                self.process_document(input).await
            }
        });

        let outcomes = futures::future::join_all(tasks).await;
        let succeeded = outcomes.iter().filter(|o| o.status != "failed").count();
        info!(
            succeeded,
            total = outcomes.len(),
            "batch processing complete"
        );
        outcomes
    }

    // ------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------

    async fn resolve_input(&self, input: &DocumentInput) -> Result<ProcessingResult> {
        let (markdown, ocr_method) = if is_url(&input.source) {
            let fetcher = self.fetcher.as_ref().ok_or_else(|| {
                WorkflowError::Validation(
                    "URL input requires a conversion service client".to_string(),
                )
            })?;
            let fetched = fetcher
                .get_url(
                    &input.source,
                    &GetUrlOptions {
                        pdf_quality: input.quality,
                        pdf_langs: input.langs.clone(),
                    },
                )
                .await?;
            let method = format!(
                "get_url:{}",
                fetched.provider.as_deref().unwrap_or("unknown")
            );
            (fetched.content, method)
        } else {
            (input.source.clone(), "n/a".to_string())
        };

        self.write_staging_file(input, &markdown)?;

        let chunks = chunk_by_headings(&markdown, DEFAULT_CHUNK_SIZE);
        let word_count = count_words(&markdown);
        Ok(ProcessingResult {
            page_count: estimate_pages(&markdown),
            word_count,
            chunks,
            ocr_method,
            markdown,
        })
    }

    fn write_staging_file(&self, input: &DocumentInput, markdown: &str) -> Result<()> {
        std::fs::create_dir_all(&self.staging_dir)?;
        let base = input
            .title
            .as_deref()
            .unwrap_or("input")
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .take(100)
            .collect::<String>();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = self.staging_dir.join(format!("{base}_{timestamp}.md"));
        std::fs::write(&path, markdown)?;
        debug!(path = %path.display(), "wrote resolved markdown to staging");
        Ok(())
    }

    /// Create the bibliographic item (tagged pending) and the placeholder
    /// L0 record. Both exist before any expensive processing.
    async fn create_stub(
        &self,
        input: &DocumentInput,
        processing: &ProcessingResult,
    ) -> Result<(String, uuid::Uuid)> {
        let title = input
            .title
            .clone()
            .or_else(|| {
                processing
                    .chunks
                    .iter()
                    .find_map(|chunk| chunk.heading.clone())
            })
            .unwrap_or_else(|| "Untitled Document".to_string());

        let mut tags: Vec<ZoteroTag> = input.tags.iter().map(ZoteroTag::user).collect();
        tags.push(ZoteroTag::automatic("pending"));

        let mut fields = input.extra_metadata.clone();
        fields.insert("title".to_string(), json!(title));

        let bib_key = self
            .stores
            .zotero
            .add(&ZoteroItemCreate {
                item_type: input.item_type.clone(),
                fields,
                creators: vec![],
                tags,
                collections: vec![],
            })
            .await?;

        let mut record = StoreRecord::new("");
        record.source_type = SourceType::External;
        record.bib_key = Some(bib_key.clone());
        record.metadata.insert("title".to_string(), json!(title));
        record
            .metadata
            .insert("processing_status".to_string(), json!("pending"));
        record
            .metadata
            .insert("source".to_string(), json!(preview(&input.source)));
        if let Some(doi) = input.extra_metadata.get("DOI") {
            record.metadata.insert("doi".to_string(), doi.clone());
        }

        let l0_id = self.stores.main.add(&record).await?;
        debug!(%l0_id, bib_key, "created tracking stub");
        Ok((bib_key, l0_id))
    }

    /// Replace the placeholder content, embed the full text and each
    /// heading chunk, and mirror them into the vector index.
    async fn update_store_with_content(
        &self,
        l0_id: uuid::Uuid,
        processing: &ProcessingResult,
    ) -> Result<()> {
        self.stores
            .main
            .update(
                l0_id,
                json!({
                    "content": processing.markdown,
                    "metadata": {
                        "word_count": processing.word_count,
                        "page_count": processing.page_count,
                        "ocr_method": processing.ocr_method,
                        "processing_status": "completed",
                    },
                }),
                0,
            )
            .await?;

        let updated = self
            .stores
            .main
            .get(l0_id, Some(0))
            .await?
            .ok_or_else(|| {
                WorkflowError::Validation(format!("record {l0_id} missing after update"))
            })?;

        // Full-text vector for the document itself
        let embedding = self.stores.embedding.embed_long(&processing.markdown).await?;
        self.stores
            .vectors
            .add(&updated, &embedding, &processing.markdown)
            .await?;

        // One vector record per heading-delimited chunk
        for chunk in &processing.chunks {
            if chunk.text.is_empty() {
                continue;
            }
            let chunk_embedding = self.stores.embedding.embed_long(&chunk.text).await?;

            let mut chunk_record = StoreRecord::new(chunk.text.clone());
            chunk_record.source_ids = vec![l0_id];
            chunk_record.bib_key = updated.bib_key.clone();
            chunk_record
                .metadata
                .insert("parent_id".to_string(), json!(l0_id.to_string()));
            chunk_record
                .metadata
                .insert("heading".to_string(), json!(chunk.heading));
            chunk_record
                .metadata
                .insert("level".to_string(), json!(chunk.level));
            chunk_record
                .metadata
                .insert("chunk_type".to_string(), json!("heading_section"));

            self.stores
                .vectors
                .add(&chunk_record, &chunk_embedding, &chunk.text)
                .await?;
        }

        debug!(chunks = processing.chunks.len(), "store updated with content");
        Ok(())
    }

    async fn detect_document_language(
        &self,
        l0_id: uuid::Uuid,
        processing: &ProcessingResult,
    ) -> Option<String> {
        let mut sample_end = LANGUAGE_SAMPLE_CHARS.min(processing.markdown.len());
        while sample_end > 0 && !processing.markdown.is_char_boundary(sample_end) {
            sample_end -= 1;
        }
        let detected = detect_language(&processing.markdown[..sample_end])?;

        info!(
            code = detected.code,
            confidence = detected.confidence,
            "detected document language"
        );
        if let Err(e) = self
            .stores
            .main
            .update(l0_id, json!({"language_code": detected.code}), 0)
            .await
        {
            warn!("failed to record language on L0: {e}");
        }
        Some(detected.code)
    }

    /// Condense very long documents to first+last pages, then summarize.
    async fn summary_agent(&self, processing: &ProcessingResult) -> Result<String> {
        let content = if processing.markdown.len() > LONG_DOCUMENT_CHARS {
            info!("document is long, summarizing from first and last pages");
            format!(
                "{}\n\n[... middle section omitted ...]\n\n{}",
                first_n_pages(&processing.markdown, CONDENSE_PAGES),
                last_n_pages(&processing.markdown, CONDENSE_PAGES),
            )
        } else {
            processing.markdown.clone()
        };

        let summary = self
            .gateway
            .complete_text(
                ModelTier::Sonnet,
                Some(DOCUMENT_ANALYSIS_SYSTEM),
                &summary_user(&content, SHORT_SUMMARY_WORDS),
                2048,
            )
            .await?;
        info!(words = summary.split_whitespace().count(), "generated short summary");
        Ok(summary)
    }

    async fn metadata_agent(&self, processing: &ProcessingResult) -> Result<DocumentMetadata> {
        let content = format!(
            "{}\n\n--- END OF FRONT MATTER ---\n\n{}",
            first_n_pages(&processing.markdown, CONDENSE_PAGES),
            last_n_pages(&processing.markdown, CONDENSE_PAGES),
        );

        let metadata = self
            .gateway
            .structured::<DocumentMetadata>(
                ModelTier::Sonnet,
                Some(DOCUMENT_ANALYSIS_SYSTEM),
                &metadata_user(&content),
                &Default::default(),
            )
            .await?;
        Ok(metadata)
    }

    async fn translate_to_english(&self, text: &str) -> Result<String> {
        let translation = self
            .gateway
            .complete_text(
                ModelTier::Sonnet,
                Some(TRANSLATION_SYSTEM),
                &format!("Translate this text to English:\n\n{text}"),
                8_192,
            )
            .await?;
        Ok(translation)
    }

    /// Persist a summary derivative (L1 or L2) with its embedding.
    ///
    /// Record content is the original-language text; the English variant
    /// rides in metadata so both are stored side by side.
    async fn save_summary_record(
        &self,
        l0_id: uuid::Uuid,
        bib_key: &str,
        summary: &BilingualText,
        level: u8,
        language: Option<&str>,
        chapter_count: Option<usize>,
    ) -> Result<StoreRecordRef> {
        let mut record = StoreRecord {
            content: summary.original.clone(),
            compression_level: level,
            source_ids: vec![l0_id],
            bib_key: Some(bib_key.to_string()),
            language_code: language.map(str::to_string),
            ..Default::default()
        };

        let kind = if level == 1 { "short_summary" } else { "tenth_summary" };
        record.metadata.insert("type".to_string(), json!(kind));
        record.metadata.insert(
            "word_count".to_string(),
            json!(count_words(&summary.original)),
        );
        if summary.english != summary.original {
            record
                .metadata
                .insert("summary_english".to_string(), json!(summary.english));
        }
        if let Some(count) = chapter_count {
            record
                .metadata
                .insert("chapter_count".to_string(), json!(count));
        }

        let embedding = self.stores.embedding.embed_long(&summary.original).await?;
        record.embedding = Some(embedding);
        record.embedding_model = Some(self.stores.embedding.model().to_string());

        let id = self.stores.main.add(&record).await?;
        info!(%id, level, "saved summary record");
        Ok(StoreRecordRef {
            id,
            compression_level: level,
            content_preview: preview(&summary.original),
        })
    }

    /// Write summary + metadata to the bibliographic item and flip its
    /// tag from pending to processed.
    async fn update_bib_item(
        &self,
        bib_key: &str,
        summary: Option<&BilingualText>,
        metadata: Option<&DocumentMetadata>,
    ) -> Result<()> {
        let mut fields: BTreeMap<String, Value> = BTreeMap::new();
        if let Some(summary) = summary {
            fields.insert("abstractNote".to_string(), json!(summary.english));
        }
        if let Some(metadata) = metadata {
            if let Some(title) = &metadata.title {
                fields.insert("title".to_string(), json!(title));
            }
            if let Some(date) = &metadata.date {
                fields.insert("date".to_string(), json!(date));
            }
            if let Some(publisher) = &metadata.publisher {
                fields.insert("publisher".to_string(), json!(publisher));
            }
            if let Some(isbn) = &metadata.isbn {
                fields.insert("ISBN".to_string(), json!(isbn));
            }
        }

        let creators: Option<Vec<ZoteroCreator>> = metadata.and_then(|metadata| {
            (!metadata.authors.is_empty()).then(|| {
                metadata
                    .authors
                    .iter()
                    .map(|name| ZoteroCreator::from_name(name))
                    .collect()
            })
        });

        // Preserve existing tags while flipping pending -> processed
        let tags = match self.stores.zotero.get(bib_key).await? {
            Some(item) => {
                let mut names: Vec<String> = item
                    .tag_names()
                    .into_iter()
                    .filter(|tag| !tag.eq_ignore_ascii_case("pending"))
                    .collect();
                if !names.iter().any(|tag| tag.eq_ignore_ascii_case("processed")) {
                    names.push("processed".to_string());
                }
                names.into_iter().map(ZoteroTag::user).collect()
            }
            None => vec![ZoteroTag::user("processed")],
        };

        let updated = self
            .stores
            .zotero
            .update(
                bib_key,
                &ZoteroItemUpdate {
                    fields: (!fields.is_empty()).then_some(fields),
                    creators,
                    tags: Some(tags),
                    collections: None,
                },
            )
            .await?;

        if updated {
            info!(bib_key, "bibliographic item updated");
        } else {
            warn!(bib_key, "bibliographic item vanished before update");
        }
        Ok(())
    }
}

fn preview(text: &str) -> String {
    let mut end = 200.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_safely() {
        assert_eq!(preview("short"), "short");
        let long = "é".repeat(300);
        let cut = preview(&long);
        assert!(cut.len() <= 200);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
