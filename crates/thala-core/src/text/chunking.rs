//! Chapter and fallback chunking for long documents

use tracing::debug;

use super::markdown::{Heading, find_word_boundary};
use super::{count_words, floor_char_boundary};

/// Target fallback chunk size in words
pub const FALLBACK_CHUNK_WORDS: usize = 30_000;
/// Overlap between fallback chunks in words, for context continuity
pub const CHUNK_OVERLAP_WORDS: usize = 500;
/// Content above this size is sub-chunked before summarization
pub const MAX_CHAPTER_CHARS: usize = 600_000;
/// Window size when sub-chunking an oversized chapter
const SUB_CHUNK_CHARS: usize = 500_000;
/// Overlap between sub-chunks
const SUB_CHUNK_OVERLAP_CHARS: usize = 2_000;

/// A chapter (or pseudo-chapter) span within a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterSpan {
    pub title: String,
    pub start_position: usize,
    pub end_position: usize,
    pub author: Option<String>,
    pub word_count: usize,
}

/// Create pseudo-chapters by splitting the document into ~30k-word chunks
/// with ~500 words of overlap.
///
/// Used when heading-based chapter detection fails. Splits prefer paragraph
/// boundaries, falling back to word boundaries.
pub fn fallback_chunks(markdown: &str, word_count: usize) -> Vec<ChapterSpan> {
    let num_chunks = (word_count.max(1)).div_ceil(FALLBACK_CHUNK_WORDS).max(1);

    let avg_chars_per_word = markdown.len() as f64 / word_count.max(1) as f64;
    let overlap_chars = (CHUNK_OVERLAP_WORDS as f64 * avg_chars_per_word) as usize;
    let target_chunk_size = markdown.len() / num_chunks;

    let mut chunks = Vec::with_capacity(num_chunks);
    let mut current_pos = 0usize;
    let mut overlap_start = 0usize;

    for i in 0..num_chunks {
        let start_pos = if i == 0 { 0 } else { overlap_start };

        let end_pos = if i == num_chunks - 1 {
            markdown.len()
        } else {
            // Look for a paragraph break near the target position
            let target_pos = (current_pos + target_chunk_size).min(markdown.len());
            let search_start = floor_char_boundary(markdown, target_pos.saturating_sub(2000).max(current_pos));
            let search_end = floor_char_boundary(markdown, (target_pos + 2000).min(markdown.len()));
            let search_region = &markdown[search_start..search_end];

            match search_region.rfind("\n\n") {
                Some(para_break) => search_start + para_break + 2,
                None => find_word_boundary(markdown, target_pos, -1),
            }
        };

        let chunk_text = &markdown[floor_char_boundary(markdown, start_pos)..end_pos];
        chunks.push(ChapterSpan {
            title: format!("Section {}", i + 1),
            start_position: start_pos,
            end_position: end_pos,
            author: None,
            word_count: count_words(chunk_text),
        });

        current_pos = end_pos;
        overlap_start = end_pos.saturating_sub(overlap_chars);
        if overlap_start > 0 && i < num_chunks - 1 {
            overlap_start = find_word_boundary(markdown, overlap_start, 1);
        }
    }

    debug!(
        chunks = chunks.len(),
        "created fallback chunks (~{FALLBACK_CHUNK_WORDS} words each, {CHUNK_OVERLAP_WORDS} word overlap)"
    );
    chunks
}

/// Build chapters from the highest heading level that occurs at least
/// `min_chapters` times.
///
/// Used when the LLM chapter analysis fails or returns nothing usable.
/// Returns an empty list when no level has enough headings.
pub fn heading_level_chapters(
    markdown: &str,
    headings: &[Heading],
    min_chapters: usize,
) -> Vec<ChapterSpan> {
    if headings.is_empty() {
        return vec![];
    }

    for level in 1..=6u8 {
        let level_headings: Vec<&Heading> =
            headings.iter().filter(|h| h.level == level).collect();
        if level_headings.len() < min_chapters {
            continue;
        }

        debug!(
            level,
            count = level_headings.len(),
            "using heading level as chapter boundaries"
        );

        return level_headings
            .iter()
            .enumerate()
            .map(|(i, heading)| {
                let start = heading.position;
                let end = level_headings
                    .get(i + 1)
                    .map(|next| next.position)
                    .unwrap_or(markdown.len());
                ChapterSpan {
                    title: heading.text.clone(),
                    start_position: start,
                    end_position: end,
                    author: None,
                    word_count: count_words(&markdown[start..end]),
                }
            })
            .collect();
    }

    debug!(min_chapters, "no heading level has enough headings for chapters");
    vec![]
}

/// Split oversized content into windows that fit a context, with overlap
/// for continuity. Content at or under the threshold passes through whole.
pub fn chunk_large_content(content: &str) -> Vec<&str> {
    if content.len() <= MAX_CHAPTER_CHARS {
        return vec![content];
    }

    let mut chunks = Vec::new();
    let mut current_pos = 0usize;

    while current_pos < content.len() {
        let mut end_pos = (current_pos + SUB_CHUNK_CHARS).min(content.len());

        if end_pos < content.len() {
            let search_start =
                floor_char_boundary(content, end_pos.saturating_sub(5000).max(current_pos));
            let bounded_end = floor_char_boundary(content, end_pos);
            let search_region = &content[search_start..bounded_end];

            end_pos = match search_region.rfind("\n\n") {
                Some(para_break) => search_start + para_break + 2,
                None => find_word_boundary(content, end_pos, -1).max(current_pos + 1),
            };
        }

        chunks.push(&content[floor_char_boundary(content, current_pos)..end_pos]);

        if end_pos >= content.len() {
            break;
        }
        let overlapped = end_pos.saturating_sub(SUB_CHUNK_OVERLAP_CHARS);
        current_pos = find_word_boundary(content, overlapped.max(current_pos + 1), 1);
    }

    debug!(chunks = chunks.len(), "split oversized content into windows");
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::extract_headings;

    #[test]
    fn test_fallback_chunks_cover_document_with_overlap() {
        // ~70k words → 3 chunks
        let markdown = "lorem ipsum dolor sit amet\n\n".repeat(14_000);
        let word_count = count_words(&markdown);
        let chunks = fallback_chunks(&markdown, word_count);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].start_position, 0);
        assert_eq!(chunks.last().unwrap().end_position, markdown.len());

        // Later chunks start before the previous chunk's end (overlap)
        for window in chunks.windows(2) {
            assert!(window[1].start_position < window[0].end_position);
            let overlap_words = count_words(
                &markdown[window[1].start_position..window[0].end_position],
            );
            assert!(overlap_words >= 400, "overlap too small: {overlap_words}");
        }
    }

    #[test]
    fn test_fallback_single_chunk_for_small_documents() {
        let markdown = "short document with a few words".to_string();
        let chunks = fallback_chunks(&markdown, count_words(&markdown));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].title, "Section 1");
        assert_eq!(chunks[0].end_position, markdown.len());
    }

    #[test]
    fn test_heading_level_chapters_picks_highest_viable_level() {
        let markdown = "# Only One Top\n\ntext\n\n## Chapter A\n\naaa\n\n## Chapter B\n\nbbb\n\n### sub\n\nccc\n";
        let headings = extract_headings(markdown);

        // H1 appears once, H2 twice: H2 wins
        let chapters = heading_level_chapters(markdown, &headings, 2);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].title, "Chapter A");
        assert_eq!(chapters[1].title, "Chapter B");
        assert_eq!(chapters[1].end_position, markdown.len());
    }

    #[test]
    fn test_heading_level_chapters_empty_when_no_structure() {
        let markdown = "# Single\n\nbody\n";
        let headings = extract_headings(markdown);
        assert!(heading_level_chapters(markdown, &headings, 2).is_empty());
    }

    #[test]
    fn test_chunk_large_content_passthrough() {
        let content = "small content";
        assert_eq!(chunk_large_content(content), vec![content]);
    }

    #[test]
    fn test_chunk_large_content_windows_with_overlap() {
        let content = "paragraph text here\n\n".repeat(40_000); // ~840k chars
        let chunks = chunk_large_content(&content);

        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.len() <= SUB_CHUNK_CHARS + 1);
        }
        // Every chunk carries real content
        assert!(chunks.iter().all(|c| !c.trim().is_empty()));
    }
}
