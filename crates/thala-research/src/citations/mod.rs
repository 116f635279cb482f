//! Citation utilities
//!
//! Citation-key extraction and stripping, find-string edit application,
//! bibliographic verification, duplicate handling, and the numeric-citation
//! post-processor.

mod duplicates;
mod edits;
mod postprocess;
mod validate;

pub use duplicates::{
    detect_duplicate_headers, detect_duplicate_sections, merge_duplicate_edits,
    remove_duplicate_headers,
};
pub use edits::{Edit, EditType, EditValidation, apply_edits, validate_edits};
pub use postprocess::{CitationPostProcessor, PostProcessOutcome};
pub use validate::{
    CitationValidation, corpus_key_set, validate_citations_against_bib,
    validate_edit_citations, validate_edit_citations_with_bib, verify_keys_batch,
};

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

/// Regex for `[@KEY]` citations.
fn citation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[@([A-Za-z0-9_:.\-]+)\]").expect("static regex"))
}

/// Regex for `<!-- TODO: ... -->` markers.
pub fn todo_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)<!-- TODO:.*?-->").expect("static regex"))
}

/// Extract all citation keys appearing as `[@KEY]`.
pub fn extract_citation_keys(text: &str) -> HashSet<String> {
    citation_pattern()
        .captures_iter(text)
        .filter_map(|captures| captures.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Whether an unknown key is plausibly a casing variant of a known key.
pub fn is_plausible_citation_key(key: &str, valid_keys: &HashSet<String>) -> bool {
    valid_keys
        .iter()
        .any(|valid| valid.eq_ignore_ascii_case(key))
}

/// Alternate key form derived from a DOI (used when summaries cite by DOI).
pub fn doi_key(doi: &str) -> String {
    doi.replace(['/', '.'], "_")
        .to_uppercase()
        .chars()
        .take(12)
        .collect()
}

/// Deterministic 8-char fallback key for a corpus paper without one.
pub fn generate_fallback_key(doi: &str) -> String {
    let mut key: String = doi
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .take(8)
        .collect();
    while key.len() < 8 {
        key.push('X');
    }
    key
}

/// Strip invalid citations from text.
///
/// Each `[@KEY]` for a key in `invalid_keys` is removed; with `add_todo`
/// set, a TODO marker takes its place so a later resolution pass can find
/// a replacement.
pub fn strip_invalid_citations(
    text: &str,
    invalid_keys: &HashSet<String>,
    add_todo: bool,
) -> String {
    let mut result = text.to_string();
    for key in invalid_keys {
        let marker = format!("[@{key}]");
        let replacement = if add_todo {
            format!("<!-- TODO: citation needed ({key} unverified) -->")
        } else {
            String::new()
        };
        result = result.replace(&marker, &replacement);
    }
    // Collapse whitespace runs left behind by bare removals
    if !add_todo {
        let squeeze = Regex::new(r"  +").expect("static regex");
        result = squeeze.replace_all(&result, " ").to_string();
    }
    result
}

/// Extract every TODO marker from text, in order.
pub fn extract_todo_markers(text: &str) -> Vec<String> {
    todo_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Remove all TODO markers, collapsing the blank runs they leave behind.
pub fn strip_todo_markers(text: &str) -> (String, usize) {
    let markers = todo_pattern().find_iter(text).count();
    if markers == 0 {
        return (text.to_string(), 0);
    }
    let stripped = todo_pattern().replace_all(text, "").to_string();
    let collapse = Regex::new(r"\n{3,}").expect("static regex");
    (collapse.replace_all(&stripped, "\n\n").to_string(), markers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_citation_keys() {
        let text = "As shown [@ABCD1234] and later [@wxyz5678]; see also [@ABCD1234].";
        let keys = extract_citation_keys(text);
        assert_eq!(keys.len(), 2);
        assert!(keys.contains("ABCD1234"));
        assert!(keys.contains("wxyz5678"));
    }

    #[test]
    fn test_extract_ignores_non_citations() {
        let text = "an email @example and [bracketed] text and [@] empty";
        assert!(extract_citation_keys(text).is_empty());
    }

    #[test]
    fn test_plausible_key_is_case_variant() {
        let valid: HashSet<String> = ["ABCD1234".to_string()].into();
        assert!(is_plausible_citation_key("abcd1234", &valid));
        assert!(!is_plausible_citation_key("ZZZZ9999", &valid));
    }

    #[test]
    fn test_doi_and_fallback_keys() {
        assert_eq!(doi_key("10.1000/j.x.2020"), "10_1000_J_X_");
        let fallback = generate_fallback_key("10.1/ab");
        assert_eq!(fallback.len(), 8);
        assert!(fallback.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(generate_fallback_key(""), "XXXXXXXX");
    }

    #[test]
    fn test_strip_invalid_citations_with_todo() {
        let invalid: HashSet<String> = ["ZZZZZZZZ".to_string()].into();
        let text = "A claim [@ZZZZZZZZ] and a good one [@GOOD1234].";
        let stripped = strip_invalid_citations(text, &invalid, true);
        assert!(!stripped.contains("[@ZZZZZZZZ]"));
        assert!(stripped.contains("<!-- TODO: citation needed (ZZZZZZZZ unverified) -->"));
        assert!(stripped.contains("[@GOOD1234]"));
        // The marker itself must not parse as a citation
        assert!(!extract_citation_keys(&stripped).contains("ZZZZZZZZ"));
    }

    #[test]
    fn test_todo_extraction_and_stripping() {
        let text = "start\n\n<!-- TODO: one -->\n\nmiddle\n\n<!-- TODO:\nmultiline -->\n\nend";
        let markers = extract_todo_markers(text);
        assert_eq!(markers.len(), 2);

        let (stripped, count) = strip_todo_markers(text);
        assert_eq!(count, 2);
        assert!(!stripped.contains("TODO"));
        assert!(stripped.contains("start"));
        assert!(stripped.contains("end"));
        assert!(!stripped.contains("\n\n\n"));
    }
}
