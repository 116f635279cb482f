//! Text processing utilities for document workflows

mod chunking;
mod language;
mod markdown;

pub use chunking::{
    CHUNK_OVERLAP_WORDS, ChapterSpan, FALLBACK_CHUNK_WORDS, MAX_CHAPTER_CHARS,
    chunk_large_content, fallback_chunks, heading_level_chapters,
};
pub use language::{DetectedLanguage, detect_language, detection_sample, verify_language_match};
pub use markdown::{Heading, extract_headings, find_word_boundary};

/// Assumed characters per printed page
pub const CHARS_PER_PAGE: usize = 3000;
/// Default maximum size of a heading-delimited chunk
pub const DEFAULT_CHUNK_SIZE: usize = 2000;

/// Count words in text (whitespace split).
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Estimate page count from character count.
pub fn estimate_pages(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_PAGE).max(1)
}

/// Largest index <= `index` that lands on a char boundary.
pub(crate) fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut index = index;
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// First `n` pages of text.
pub fn first_n_pages(markdown: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let limit = floor_char_boundary(markdown, n * CHARS_PER_PAGE);
    &markdown[..limit]
}

/// Last `n` pages of text.
pub fn last_n_pages(markdown: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let chars = n * CHARS_PER_PAGE;
    if chars >= markdown.len() {
        return markdown;
    }
    let mut start = markdown.len() - chars;
    while !markdown.is_char_boundary(start) {
        start += 1;
    }
    &markdown[start..]
}

/// A heading-delimited chunk of markdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkdownChunk {
    pub text: String,
    pub heading: Option<String>,
    /// 0 for preamble text before any heading
    pub level: u8,
}

/// Split markdown into chunks on heading boundaries, preserving heading
/// context. Sections larger than `max_chunk_size` are split further on
/// paragraph boundaries.
pub fn chunk_by_headings(markdown: &str, max_chunk_size: usize) -> Vec<MarkdownChunk> {
    let headings = extract_headings(markdown);
    let mut sections: Vec<(Option<String>, u8, String)> = Vec::new();

    if headings.is_empty() {
        let text = markdown.trim();
        if !text.is_empty() {
            sections.push((None, 0, text.to_string()));
        }
    } else {
        // Preamble before the first heading
        let preamble = markdown[..headings[0].position].trim();
        if !preamble.is_empty() {
            sections.push((None, 0, preamble.to_string()));
        }

        for (i, heading) in headings.iter().enumerate() {
            let body_start = markdown[heading.position..]
                .find('\n')
                .map(|offset| heading.position + offset + 1)
                .unwrap_or(markdown.len());
            let end = headings
                .get(i + 1)
                .map(|next| next.position)
                .unwrap_or(markdown.len());
            let body = markdown[body_start.min(end)..end].trim();
            sections.push((Some(heading.text.clone()), heading.level, body.to_string()));
        }
    }

    let mut chunks = Vec::new();
    for (heading, level, text) in sections {
        if text.len() <= max_chunk_size {
            chunks.push(MarkdownChunk {
                text,
                heading,
                level,
            });
            continue;
        }

        // Split an oversized section on paragraph boundaries
        let mut current = String::new();
        for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            if !current.is_empty() && current.len() + paragraph.len() + 2 > max_chunk_size {
                chunks.push(MarkdownChunk {
                    text: std::mem::take(&mut current),
                    heading: heading.clone(),
                    level,
                });
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
        }
        if !current.is_empty() {
            chunks.push(MarkdownChunk {
                text: current,
                heading,
                level,
            });
        }
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_words() {
        assert_eq!(count_words("one two  three\nfour"), 4);
        assert_eq!(count_words(""), 0);
    }

    #[test]
    fn test_estimate_pages() {
        assert_eq!(estimate_pages("x"), 1);
        assert_eq!(estimate_pages(&"x".repeat(3000)), 1);
        assert_eq!(estimate_pages(&"x".repeat(3001)), 2);
    }

    #[test]
    fn test_first_and_last_pages() {
        let text = "a".repeat(10_000);
        assert_eq!(first_n_pages(&text, 1).len(), 3000);
        assert_eq!(last_n_pages(&text, 1).len(), 3000);
        assert_eq!(first_n_pages(&text, 0), "");
        // More pages than content returns everything
        assert_eq!(last_n_pages(&text, 10).len(), 10_000);
    }

    #[test]
    fn test_page_slicing_respects_utf8() {
        let text = "é".repeat(4000);
        let first = first_n_pages(&text, 1);
        assert!(first.len() <= 3000);
        let last = last_n_pages(&text, 1);
        assert!(last.len() <= 3000);
        // No panic means boundaries were respected; sanity-check content
        assert!(first.chars().all(|c| c == 'é'));
        assert!(last.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_chunk_by_headings_preserves_structure() {
        let markdown =
            "intro paragraph\n\n# One\n\nfirst body\n\n## One-A\n\nnested body\n\n# Two\n\nsecond body\n";
        let chunks = chunk_by_headings(markdown, 2000);

        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].heading, None);
        assert_eq!(chunks[0].level, 0);
        assert_eq!(chunks[1].heading.as_deref(), Some("One"));
        assert_eq!(chunks[1].text, "first body");
        assert_eq!(chunks[2].heading.as_deref(), Some("One-A"));
        assert_eq!(chunks[2].level, 2);
        assert_eq!(chunks[3].heading.as_deref(), Some("Two"));
    }

    #[test]
    fn test_chunk_by_headings_splits_large_sections() {
        let paragraph = "word ".repeat(100).trim().to_string();
        let markdown = format!("# Big\n\n{paragraph}\n\n{paragraph}\n\n{paragraph}");
        let chunks = chunk_by_headings(&markdown, 600);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(chunk.heading.as_deref(), Some("Big"));
            assert!(chunk.text.len() <= 700);
        }
    }

    #[test]
    fn test_chunk_headingless_document() {
        let chunks = chunk_by_headings("just some plain text", 2000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].heading, None);
    }
}
