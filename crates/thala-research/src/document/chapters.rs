//! Chapter detection and 10:1 summarization (map-reduce)
//!
//! Detection: extract headings, ask the model which are chapter-level,
//! fall back to the densest heading level, then to size-based chunks.
//! Summarization: each chapter condenses to ~10% of its word count;
//! oversized chapters are sub-chunked and their summaries concatenated.
//! The map phase is unordered (bounded concurrency or provider batch);
//! the reduce preserves declared chapter order.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use thala_core::llm::{
    HAIKU_SAFE_LIMIT, LlmGateway, ModelTier, StructuredOptions, StructuredSchema,
    estimate_tokens_fast,
};
use thala_core::text::{
    ChapterSpan, MAX_CHAPTER_CHARS, chunk_large_content, count_words, extract_headings,
    fallback_chunks, heading_level_chapters,
};

use super::prompts::{CHAPTER_SUMMARIZATION_SYSTEM, chapter_analysis_user, chapter_chunk_user};
use super::state::{CHAPTER_DETECTION_MIN_WORDS, DocumentMetadata};
use crate::error::Result;

/// Concurrent chapter summaries on the non-batch path
pub const MAX_CONCURRENT_CHAPTER_SUMMARIES: usize = 4;
/// Extended-thinking budget for chapter summarization
const CHAPTER_THINKING_BUDGET: u32 = 8_000;
const CHAPTER_MAX_TOKENS: u32 = 8_000 + 4_096;

// ============================================================================
// DETECTION
// ============================================================================

/// Per-heading chapter analysis from the model.
#[derive(Debug, Clone, Deserialize)]
pub struct HeadingAnalysis {
    pub heading: String,
    pub is_chapter: bool,
    #[serde(default)]
    pub chapter_author: Option<String>,
}

/// Full analysis over the heading list.
#[derive(Debug, Clone, Deserialize)]
pub struct ChapterAnalysis {
    #[serde(default)]
    pub headings: Vec<HeadingAnalysis>,
}

impl StructuredSchema for ChapterAnalysis {
    fn schema_name() -> &'static str {
        "ChapterAnalysis"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "headings": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "heading": {"type": "string", "description": "Exact heading text"},
                            "is_chapter": {"type": "boolean"},
                            "chapter_author": {"type": ["string", "null"]},
                        },
                        "required": ["heading", "is_chapter"],
                    },
                },
            },
            "required": ["headings"],
        })
    }
}

/// Detected chapters plus whether the 10:1 stage should run.
#[derive(Debug, Clone)]
pub struct ChapterDetection {
    pub chapters: Vec<ChapterSpan>,
    pub needs_tenth_summary: bool,
    /// "llm", "heading_fallback", "size_fallback", or "skipped"
    pub method: &'static str,
}

/// Build chapter spans from headings the model marked as chapter-level.
fn chapters_from_analysis(
    markdown: &str,
    analysis: &ChapterAnalysis,
) -> Vec<ChapterSpan> {
    let headings = extract_headings(markdown);
    let marks: HashMap<&str, &HeadingAnalysis> = analysis
        .headings
        .iter()
        .map(|h| (h.heading.as_str(), h))
        .collect();

    let chapter_headings: Vec<(&str, usize, Option<String>)> = headings
        .iter()
        .filter_map(|heading| {
            marks.get(heading.text.as_str()).and_then(|mark| {
                mark.is_chapter.then(|| {
                    (
                        heading.text.as_str(),
                        heading.position,
                        mark.chapter_author.clone(),
                    )
                })
            })
        })
        .collect();

    chapter_headings
        .iter()
        .enumerate()
        .map(|(i, (title, position, author))| {
            let end = chapter_headings
                .get(i + 1)
                .map(|(_, next, _)| *next)
                .unwrap_or(markdown.len());
            ChapterSpan {
                title: title.to_string(),
                start_position: *position,
                end_position: end,
                author: author.clone(),
                word_count: count_words(&markdown[*position..end]),
            }
        })
        .collect()
}

/// Detect logical chapter divisions for the 10:1 summary.
pub async fn detect_chapters(
    gateway: &LlmGateway,
    markdown: &str,
    word_count: usize,
    metadata: Option<&DocumentMetadata>,
) -> ChapterDetection {
    if word_count < CHAPTER_DETECTION_MIN_WORDS {
        info!(word_count, "document too short, skipping 10:1 summary");
        return ChapterDetection {
            chapters: vec![],
            needs_tenth_summary: false,
            method: "skipped",
        };
    }

    let headings = extract_headings(markdown);
    if headings.is_empty() {
        info!("no headings found, using fallback chunking");
        return ChapterDetection {
            chapters: fallback_chunks(markdown, word_count),
            needs_tenth_summary: true,
            method: "size_fallback",
        };
    }

    let is_multi_author = metadata.map(|m| m.is_multi_author).unwrap_or(false);
    let heading_list: String = headings
        .iter()
        .map(|h| format!("{} {}", "#".repeat(h.level as usize), h.text))
        .collect::<Vec<_>>()
        .join("\n");

    let analysis = gateway
        .structured::<ChapterAnalysis>(
            ModelTier::Sonnet,
            None,
            &chapter_analysis_user(&heading_list, is_multi_author),
            &StructuredOptions::default().json_schema_method(),
        )
        .await;

    match analysis {
        Ok(analysis) => {
            let chapters = chapters_from_analysis(markdown, &analysis);
            if !chapters.is_empty() {
                info!(count = chapters.len(), "detected chapters for 10:1 summary");
                return ChapterDetection {
                    chapters,
                    needs_tenth_summary: true,
                    method: "llm",
                };
            }
            warn!("chapter analysis returned nothing usable, falling back");
        }
        Err(e) => {
            warn!("chapter analysis failed: {e}, falling back");
        }
    }

    let chapters = heading_level_chapters(markdown, &headings, 2);
    if !chapters.is_empty() {
        return ChapterDetection {
            chapters,
            needs_tenth_summary: true,
            method: "heading_fallback",
        };
    }

    ChapterDetection {
        chapters: fallback_chunks(markdown, word_count),
        needs_tenth_summary: true,
        method: "size_fallback",
    }
}

// ============================================================================
// SUMMARIZATION
// ============================================================================

/// One summarized chapter.
#[derive(Debug, Clone)]
pub struct ChapterSummary {
    pub title: String,
    pub author: Option<String>,
    pub summary: String,
}

fn chapter_context(chapter: &ChapterSpan) -> String {
    match &chapter.author {
        Some(author) => format!("Chapter: {} (by {author})", chapter.title),
        None => format!("Chapter: {}", chapter.title),
    }
}

fn target_words(chapter: &ChapterSpan) -> usize {
    (chapter.word_count / 10).max(50)
}

/// Summarize one content chunk, upgrading tier past the safe token limit.
async fn summarize_chunk(
    gateway: &LlmGateway,
    content: &str,
    words: usize,
    context: &str,
    chunk: Option<(usize, usize)>,
) -> Result<String> {
    let prompt = chapter_chunk_user(content, words, context, chunk);
    let estimated = estimate_tokens_fast(&prompt, true)
        + estimate_tokens_fast(CHAPTER_SUMMARIZATION_SYSTEM, true);

    let tier = if estimated > HAIKU_SAFE_LIMIT {
        info!(
            estimated,
            "content exceeds safe token limit, using long-context tier"
        );
        ModelTier::Sonnet1M
    } else {
        ModelTier::Opus
    };

    let summary = gateway
        .complete_text(
            tier,
            Some(CHAPTER_SUMMARIZATION_SYSTEM),
            &prompt,
            CHAPTER_MAX_TOKENS,
        )
        .await?;
    Ok(summary)
}

/// Summarize one chapter, sub-chunking when it is too large for a single
/// request.
async fn summarize_single_chapter(
    gateway: &LlmGateway,
    chapter: &ChapterSpan,
    content: &str,
) -> ChapterSummary {
    let context = chapter_context(chapter);
    let words = target_words(chapter);

    let chunks = chunk_large_content(content);
    let summary = if chunks.len() == 1 {
        summarize_chunk(gateway, content, words, &context, None).await
    } else {
        info!(
            title = chapter.title,
            chunks = chunks.len(),
            "chapter too large, summarizing in windows"
        );
        let chunk_words = (words / chunks.len()).max(50);
        let total = chunks.len();
        let mut parts = Vec::with_capacity(total);
        let mut failure = None;
        for (i, chunk) in chunks.iter().enumerate() {
            match summarize_chunk(gateway, chunk, chunk_words, &context, Some((i + 1, total))).await
            {
                Ok(part) => parts.push(part),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        match failure {
            None => Ok(parts.join("\n\n")),
            Some(e) => Err(e),
        }
    };

    match summary {
        Ok(summary) => {
            debug!(
                title = chapter.title,
                words = summary.split_whitespace().count(),
                "summarized chapter"
            );
            ChapterSummary {
                title: chapter.title.clone(),
                author: chapter.author.clone(),
                summary,
            }
        }
        Err(e) => {
            warn!(title = chapter.title, "chapter summarization failed: {e}");
            ChapterSummary {
                title: chapter.title.clone(),
                author: chapter.author.clone(),
                summary: format!("[Error: {e}]"),
            }
        }
    }
}

/// Summarize all chapters, preserving their declared order in the result.
///
/// Five or more chapters prefer the provider batch API (one submit, later
/// collect); oversized chapters are carved out and processed alone with
/// chunking. Smaller documents fan out under a bound of four.
pub async fn summarize_chapters(
    gateway: &LlmGateway,
    markdown: &str,
    chapters: &[ChapterSpan],
    use_batch_api: bool,
) -> Vec<ChapterSummary> {
    if chapters.is_empty() {
        warn!("no chapters to summarize");
        return vec![];
    }

    if use_batch_api && chapters.len() >= 5 {
        summarize_chapters_batched(gateway, markdown, chapters).await
    } else {
        summarize_chapters_concurrent(gateway, markdown, chapters).await
    }
}

async fn summarize_chapters_concurrent(
    gateway: &LlmGateway,
    markdown: &str,
    chapters: &[ChapterSpan],
) -> Vec<ChapterSummary> {
    info!(
        count = chapters.len(),
        "starting concurrent chapter summarization"
    );
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_CHAPTER_SUMMARIES));

    let tasks = chapters.iter().map(|chapter| {
        let semaphore = semaphore.clone();
        let content = &markdown[chapter.start_position..chapter.end_position];
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            summarize_single_chapter(gateway, chapter, content).await
        }
    });

    futures::future::join_all(tasks).await
}

async fn summarize_chapters_batched(
    gateway: &LlmGateway,
    markdown: &str,
    chapters: &[ChapterSpan],
) -> Vec<ChapterSummary> {
    // Oversized chapters cannot ride the batch; they run alone with chunking
    let mut batch_prompts: Vec<(String, String)> = Vec::new();
    let mut oversized: Vec<usize> = Vec::new();

    for (i, chapter) in chapters.iter().enumerate() {
        let content = &markdown[chapter.start_position..chapter.end_position];
        let prompt =
            chapter_chunk_user(content, target_words(chapter), &chapter_context(chapter), None);
        let estimated = estimate_tokens_fast(&prompt, true);

        if content.len() > MAX_CHAPTER_CHARS || estimated > HAIKU_SAFE_LIMIT {
            info!(
                title = chapter.title,
                chars = content.len(),
                "chapter too large for batch, processing individually"
            );
            oversized.push(i);
        } else {
            batch_prompts.push((format!("chapter-{i}"), prompt));
        }
    }

    #[derive(Debug, Deserialize)]
    struct PlainSummary {
        summary: String,
    }

    impl StructuredSchema for PlainSummary {
        fn schema_name() -> &'static str {
            "ChapterSummaryText"
        }

        fn schema() -> Value {
            json!({
                "type": "object",
                "properties": {"summary": {"type": "string"}},
                "required": ["summary"],
            })
        }
    }

    info!(
        batched = batch_prompts.len(),
        individual = oversized.len(),
        "submitting chapter summarization batch"
    );

    let options = StructuredOptions::default()
        .json_schema_method()
        .with_thinking(CHAPTER_THINKING_BUDGET)
        .with_max_tokens(CHAPTER_MAX_TOKENS);
    let batch_results = gateway
        .structured_batch::<PlainSummary>(ModelTier::Opus, Some(CHAPTER_SUMMARIZATION_SYSTEM), batch_prompts, &options)
        .await;

    // Oversized chapters run concurrently with the usual bound
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_CHAPTER_SUMMARIES));
    let oversized_tasks = oversized.iter().map(|&i| {
        let semaphore = semaphore.clone();
        let chapter = &chapters[i];
        let content = &markdown[chapter.start_position..chapter.end_position];
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            (i, summarize_single_chapter(gateway, chapter, content).await)
        }
    });
    let oversized_results: HashMap<usize, ChapterSummary> =
        futures::future::join_all(oversized_tasks)
            .await
            .into_iter()
            .collect();

    // Reduce in declared chapter order
    chapters
        .iter()
        .enumerate()
        .map(|(i, chapter)| {
            if let Some(summary) = oversized_results.get(&i) {
                return summary.clone();
            }
            match batch_results.get(&format!("chapter-{i}")) {
                Some(Ok(result)) => ChapterSummary {
                    title: chapter.title.clone(),
                    author: chapter.author.clone(),
                    summary: result.summary.clone(),
                },
                Some(Err(e)) => {
                    warn!(title = chapter.title, "batched summary failed: {e}");
                    ChapterSummary {
                        title: chapter.title.clone(),
                        author: chapter.author.clone(),
                        summary: format!("[Error: {e}]"),
                    }
                }
                None => ChapterSummary {
                    title: chapter.title.clone(),
                    author: chapter.author.clone(),
                    summary: "[Error: no result returned]".to_string(),
                },
            }
        })
        .collect()
}

/// Combine chapter summaries into the 10:1 document summary.
///
/// Order follows the input; each part is headed `## title (by author)`.
pub fn aggregate_summaries(summaries: &[ChapterSummary]) -> String {
    summaries
        .iter()
        .map(|item| {
            let header = match &item.author {
                Some(author) => format!("## {} (by {author})", item.title),
                None => format!("## {}", item.title),
            };
            format!("{header}\n\n{}", item.summary)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Full detect-and-summarize pass over raw markdown.
///
/// Used for lazy 10:1 generation when an oversized original is first
/// requested by the paper tools.
pub async fn generate_tenth_summary(gateway: &LlmGateway, markdown: &str) -> Result<String> {
    let word_count = count_words(markdown);
    let detection = detect_chapters(gateway, markdown, word_count, None).await;

    let chapters = if detection.chapters.is_empty() {
        fallback_chunks(markdown, word_count)
    } else {
        detection.chapters
    };

    let summaries = summarize_chapters(gateway, markdown, &chapters, false).await;
    Ok(aggregate_summaries(&summaries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chapters_from_analysis_preserves_order_and_bounds() {
        let markdown = "# Intro\n\nabc\n\n# Chapter One\n\nbody one\n\n## sub\n\nx\n\n# Chapter Two\n\nbody two\n";
        let analysis = ChapterAnalysis {
            headings: vec![
                HeadingAnalysis {
                    heading: "Intro".to_string(),
                    is_chapter: false,
                    chapter_author: None,
                },
                HeadingAnalysis {
                    heading: "Chapter One".to_string(),
                    is_chapter: true,
                    chapter_author: Some("A. Author".to_string()),
                },
                HeadingAnalysis {
                    heading: "sub".to_string(),
                    is_chapter: false,
                    chapter_author: None,
                },
                HeadingAnalysis {
                    heading: "Chapter Two".to_string(),
                    is_chapter: true,
                    chapter_author: None,
                },
            ],
        };

        let chapters = chapters_from_analysis(markdown, &analysis);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].title, "Chapter One");
        assert_eq!(chapters[0].author.as_deref(), Some("A. Author"));
        // First chapter ends where the second begins
        assert_eq!(chapters[0].end_position, chapters[1].start_position);
        assert_eq!(chapters[1].end_position, markdown.len());
    }

    #[test]
    fn test_aggregate_preserves_order_and_headers() {
        let summaries = vec![
            ChapterSummary {
                title: "One".to_string(),
                author: Some("Ada".to_string()),
                summary: "first summary".to_string(),
            },
            ChapterSummary {
                title: "Two".to_string(),
                author: None,
                summary: "second summary".to_string(),
            },
        ];
        let aggregated = aggregate_summaries(&summaries);
        let one_pos = aggregated.find("## One (by Ada)").unwrap();
        let two_pos = aggregated.find("## Two").unwrap();
        assert!(one_pos < two_pos);
        assert!(aggregated.contains("first summary"));
    }

    #[test]
    fn test_target_words_is_tenth_with_floor() {
        let mut chapter = ChapterSpan {
            title: "t".to_string(),
            start_position: 0,
            end_position: 0,
            author: None,
            word_count: 4_000,
        };
        assert_eq!(target_words(&chapter), 400);
        chapter.word_count = 100;
        assert_eq!(target_words(&chapter), 50);
    }
}
