//! Duplicate section and header handling
//!
//! Parallel edits can duplicate material: two sections editing overlapping
//! content, or a reassembled document repeating a header. Detection is
//! similarity-based; removal only collapses bodies that actually repeat.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::review::types::SectionEditResult;
use crate::similarity::similarity_ratio;

/// Sections whose prefixes match above this are considered duplicates
const SECTION_SIMILARITY_THRESHOLD: f64 = 0.7;
/// Duplicate header bodies above this are collapsed wholesale
const BODY_SIMILARITY_THRESHOLD: f64 = 0.5;

fn header_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(#{1,6})\s+(.+)$").expect("static regex"))
}

fn prefix(text: &str, limit: usize) -> &str {
    let mut end = limit.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Detect pairs of section ids with overlapping content.
pub fn detect_duplicate_sections(sections: &[(String, String)]) -> Vec<(String, String)> {
    let mut duplicates = Vec::new();
    for (i, (id_a, content_a)) in sections.iter().enumerate() {
        for (id_b, content_b) in &sections[i + 1..] {
            let ratio = similarity_ratio(prefix(content_a, 500), prefix(content_b, 500));
            if ratio > SECTION_SIMILARITY_THRESHOLD {
                duplicates.push((id_a.clone(), id_b.clone()));
            }
        }
    }
    duplicates
}

/// Detect repeated headers: (first_line, second_line, header_text) triples.
pub fn detect_duplicate_headers(document: &str) -> Vec<(usize, usize, String)> {
    let lines: Vec<&str> = document.split('\n').collect();
    let mut positions: HashMap<String, Vec<usize>> = HashMap::new();

    for (i, line) in lines.iter().enumerate() {
        if let Some(captures) = header_pattern().captures(line.trim()) {
            let header_text = captures.get(0).map(|m| m.as_str().to_lowercase());
            if let Some(header_text) = header_text {
                positions.entry(header_text).or_default().push(i);
            }
        }
    }

    let mut duplicates = Vec::new();
    for (header_text, occurrences) in positions {
        if occurrences.len() > 1 {
            for pair in occurrences.windows(2) {
                warn!(
                    header = header_text,
                    first = pair[0] + 1,
                    second = pair[1] + 1,
                    "duplicate header found"
                );
                duplicates.push((pair[0], pair[1], header_text.clone()));
            }
        }
    }
    duplicates
}

/// Remove duplicate headers; bodies that repeat their original go with them.
pub fn remove_duplicate_headers(
    document: &str,
    duplicates: &[(usize, usize, String)],
) -> String {
    if duplicates.is_empty() {
        return document.to_string();
    }

    let mut lines: Vec<String> = document.split('\n').map(str::to_string).collect();
    let mut sorted: Vec<&(usize, usize, String)> = duplicates.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1));

    for (first_line, second_line, _header) in sorted {
        if *second_line >= lines.len() {
            continue;
        }

        // Extent of the duplicate's body: up to the next header or EOF
        let mut end_line = *second_line;
        for (offset, line) in lines[*second_line + 1..].iter().enumerate() {
            if header_pattern().is_match(line.trim()) {
                break;
            }
            end_line = second_line + 1 + offset;
        }

        let original_body = lines
            [first_line + 1..(*second_line).min(lines.len())]
            .join("\n");
        let duplicate_body = lines[(*second_line + 1).min(lines.len())..=end_line].join("\n");

        let similarity = similarity_ratio(
            prefix(original_body.trim(), 500),
            prefix(duplicate_body.trim(), 500),
        );

        if similarity > BODY_SIMILARITY_THRESHOLD {
            info!(
                line = second_line + 1,
                similarity, "removing duplicate section"
            );
            lines.drain(*second_line..=end_line);
        } else {
            info!(
                line = second_line + 1,
                similarity, "removing duplicate header only"
            );
            lines.remove(*second_line);
        }
    }

    lines.join("\n")
}

/// Merge edit results for duplicate sections, keeping the higher-confidence
/// edit and concatenating notes.
pub fn merge_duplicate_edits(
    mut results: HashMap<String, SectionEditResult>,
    duplicates: &[(String, String)],
) -> HashMap<String, SectionEditResult> {
    for (id_a, id_b) in duplicates {
        let (Some(a), Some(b)) = (results.get(id_a), results.get(id_b)) else {
            continue;
        };

        let winner = if b.confidence > a.confidence { b } else { a };
        let merged = SectionEditResult {
            section_id: id_a.clone(),
            edited_content: winner.edited_content.clone(),
            notes: format!("{}\n{}", a.notes, b.notes).trim().to_string(),
            new_paper_todos: a
                .new_paper_todos
                .iter()
                .chain(&b.new_paper_todos)
                .cloned()
                .collect(),
            confidence: winner.confidence,
        };
        debug!(kept = id_a, dropped = id_b, "merged duplicate section edits");
        results.insert(id_a.clone(), merged);
        results.remove(id_b);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_duplicate_sections() {
        let body = "This exact paragraph appears twice in the document with minor tail changes.";
        let sections = vec![
            ("intro".to_string(), body.to_string()),
            ("intro_2".to_string(), format!("{body} Slightly extended.")),
            ("other".to_string(), "Entirely different content here.".to_string()),
        ];
        let duplicates = detect_duplicate_sections(&sections);
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0], ("intro".to_string(), "intro_2".to_string()));
    }

    #[test]
    fn test_detect_and_remove_duplicate_headers_with_same_body() {
        let document = "## Results\n\nThe findings were clear.\n\n## Results\n\nThe findings were clear.\n";
        let duplicates = detect_duplicate_headers(document);
        assert_eq!(duplicates.len(), 1);

        let cleaned = remove_duplicate_headers(document, &duplicates);
        assert_eq!(cleaned.matches("## Results").count(), 1);
        assert_eq!(cleaned.matches("The findings were clear.").count(), 1);
    }

    #[test]
    fn test_duplicate_header_with_different_body_keeps_content() {
        let document =
            "## Results\n\nFirst set of findings.\n\n## Results\n\nCompletely different second discussion that shares nothing.\n";
        let duplicates = detect_duplicate_headers(document);
        let cleaned = remove_duplicate_headers(document, &duplicates);

        assert_eq!(cleaned.matches("## Results").count(), 1);
        assert!(cleaned.contains("First set of findings."));
        assert!(cleaned.contains("Completely different second discussion"));
    }

    #[test]
    fn test_merge_keeps_higher_confidence() {
        let mut results = HashMap::new();
        results.insert(
            "a".to_string(),
            SectionEditResult {
                section_id: "a".to_string(),
                edited_content: "low".to_string(),
                notes: "first".to_string(),
                new_paper_todos: vec![],
                confidence: 0.4,
            },
        );
        results.insert(
            "b".to_string(),
            SectionEditResult {
                section_id: "b".to_string(),
                edited_content: "high".to_string(),
                notes: "second".to_string(),
                new_paper_todos: vec!["todo".to_string()],
                confidence: 0.9,
            },
        );

        let merged = merge_duplicate_edits(results, &[("a".to_string(), "b".to_string())]);
        assert_eq!(merged.len(), 1);
        let kept = &merged["a"];
        assert_eq!(kept.edited_content, "high");
        assert!(kept.notes.contains("first") && kept.notes.contains("second"));
        assert_eq!(kept.confidence, 0.9);
    }
}
