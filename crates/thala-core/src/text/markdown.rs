//! Markdown parsing utilities

use std::sync::OnceLock;

use regex::Regex;

/// A heading with its position in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    /// 1-6, the number of hashes
    pub level: u8,
    pub text: String,
    /// Byte offset of the heading line start
    pub position: usize,
}

fn heading_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?m)^(#{1,6})\s+(.+)$").expect("static regex"))
}

/// Extract all headings from markdown with their positions.
pub fn extract_headings(markdown: &str) -> Vec<Heading> {
    heading_pattern()
        .captures_iter(markdown)
        .filter_map(|captures| {
            let whole = captures.get(0)?;
            let hashes = captures.get(1)?;
            let text = captures.get(2)?;
            Some(Heading {
                level: hashes.as_str().len() as u8,
                text: text.as_str().trim().to_string(),
                position: whole.start(),
            })
        })
        .collect()
}

/// Find the nearest word boundary to `target_pos`, scanning backward
/// (`direction < 0`) or forward.
pub fn find_word_boundary(text: &str, target_pos: usize, direction: i32) -> usize {
    let bytes = text.as_bytes();
    let mut pos = target_pos.min(bytes.len());

    if direction < 0 {
        while pos > 0 && pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
            pos -= 1;
        }
        pos
    } else {
        while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_headings_levels_and_positions() {
        let markdown = "# Title\n\nintro text\n\n## Section One\n\nbody\n\n### Sub\n";
        let headings = extract_headings(markdown);
        assert_eq!(headings.len(), 3);
        assert_eq!(headings[0].level, 1);
        assert_eq!(headings[0].text, "Title");
        assert_eq!(headings[0].position, 0);
        assert_eq!(headings[1].level, 2);
        assert_eq!(headings[1].text, "Section One");
        assert_eq!(&markdown[headings[1].position..headings[1].position + 2], "##");
        assert_eq!(headings[2].level, 3);
    }

    #[test]
    fn test_extract_headings_ignores_inline_hashes() {
        let markdown = "some text with a # inline\nand #hashtag\n";
        assert!(extract_headings(markdown).is_empty());
    }

    #[test]
    fn test_find_word_boundary() {
        let text = "alpha beta gamma";
        // Inside "beta": backward lands on the space before it
        assert_eq!(find_word_boundary(text, 8, -1), 5);
        // Forward lands on the space after it
        assert_eq!(find_word_boundary(text, 8, 1), 10);
        // Already at whitespace stays put
        assert_eq!(find_word_boundary(text, 5, -1), 5);
        // Clamped at the ends
        assert_eq!(find_word_boundary(text, 100, 1), text.len());
    }
}
