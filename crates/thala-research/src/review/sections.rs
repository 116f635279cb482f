//! Section splitting for parallel editing and sequential checking
//!
//! Splits a document on headings into sections of bounded token size, with
//! unique section ids and a coarse type classification driving per-type
//! editing policy. Also numbers paragraphs for the structural loop.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tiktoken_rs::{CoreBPE, cl100k_base};

/// Default maximum tokens per section
pub const DEFAULT_SECTION_TOKENS: usize = 5_000;

/// Coarse classification of a section, selecting its word-count policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionType {
    Abstract,
    Introduction,
    Methodology,
    Conclusion,
    Content,
}

/// One document section with location metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionInfo {
    pub section_id: String,
    pub section_content: String,
    /// 0 when the document had no headings
    pub heading_level: u8,
    pub start_line: usize,
    pub end_line: usize,
    pub section_type: SectionType,
}

fn encoder() -> &'static CoreBPE {
    static ENCODER: OnceLock<CoreBPE> = OnceLock::new();
    ENCODER.get_or_init(|| cl100k_base().expect("cl100k_base tables ship with the crate"))
}

fn header_re() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(#{1,6})\s+(.+)$").expect("static regex"))
}

fn slug_re() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("static regex"))
}

/// Classify a section from its id and heading level.
pub fn detect_section_type(section_id: &str, heading_level: u8) -> SectionType {
    let id = section_id.to_lowercase();

    if matches!(id.as_str(), "abstract" | "summary" | "executive_summary")
        || (id.contains("abstract") && heading_level <= 2)
    {
        return SectionType::Abstract;
    }
    if matches!(id.as_str(), "introduction" | "intro" | "background")
        || id.contains("introduction")
        || id.contains("background")
    {
        return SectionType::Introduction;
    }
    if matches!(id.as_str(), "methods" | "methodology" | "method")
        || id.contains("method")
        || id.contains("approach")
    {
        return SectionType::Methodology;
    }
    if id.contains("conclusion") {
        return SectionType::Conclusion;
    }
    SectionType::Content
}

fn unique_id(base: &str, used: &mut HashMap<String, usize>) -> String {
    let count = used.entry(base.to_string()).or_insert(0);
    *count += 1;
    if *count == 1 {
        base.to_string()
    } else {
        format!("{base}_{count}")
    }
}

fn slugify(title: &str) -> String {
    slug_re()
        .replace_all(&title.to_lowercase(), "_")
        .trim_matches('_')
        .to_string()
}

/// Split a document into sections of at most `max_tokens` tokens.
///
/// Splits on headings; sections past the budget are split again on their
/// subheadings. Ids derive from heading text, with numeric suffixes
/// resolving collisions deterministically.
pub fn split_into_sections(document: &str, max_tokens: usize) -> Vec<SectionInfo> {
    let lines: Vec<&str> = document.split('\n').collect();

    let mut heading_positions: Vec<(usize, u8, String)> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if let Some(captures) = header_re().captures(line.trim()) {
            let level = captures[1].len() as u8;
            let title = captures[2].trim().to_string();
            heading_positions.push((i, level, title));
        }
    }

    if heading_positions.is_empty() {
        return vec![SectionInfo {
            section_id: "full_document".to_string(),
            section_content: document.to_string(),
            heading_level: 0,
            start_line: 0,
            end_line: lines.len().saturating_sub(1),
            section_type: SectionType::Content,
        }];
    }

    let mut used_ids: HashMap<String, usize> = HashMap::new();
    let mut sections = Vec::new();

    for (idx, (line_num, level, title)) in heading_positions.iter().enumerate() {
        let end_line = heading_positions
            .get(idx + 1)
            .map(|(next_line, _, _)| next_line - 1)
            .unwrap_or(lines.len() - 1);

        let content = lines[*line_num..=end_line].join("\n");
        let token_count = encoder().encode_with_special_tokens(&content).len();
        let section_id = unique_id(&slugify(title), &mut used_ids);

        if token_count > max_tokens && *level < 3 {
            sections.extend(split_large_section(
                &lines[*line_num..=end_line],
                *line_num,
                &section_id,
                *level,
                &mut used_ids,
            ));
        } else {
            let section_type = detect_section_type(&section_id, *level);
            sections.push(SectionInfo {
                section_id,
                section_content: content,
                heading_level: *level,
                start_line: *line_num,
                end_line,
                section_type,
            });
        }
    }

    sections
}

fn split_large_section(
    section_lines: &[&str],
    base_line: usize,
    parent_id: &str,
    parent_level: u8,
    used_ids: &mut HashMap<String, usize>,
) -> Vec<SectionInfo> {
    let mut subheadings: Vec<(usize, u8, String)> = Vec::new();
    for (i, line) in section_lines.iter().enumerate() {
        if let Some(captures) = header_re().captures(line.trim()) {
            let level = captures[1].len() as u8;
            if level > parent_level {
                subheadings.push((i, level, captures[2].trim().to_string()));
            }
        }
    }

    if subheadings.is_empty() {
        // Nothing to split on; keep the oversized section whole
        let section_type = detect_section_type(parent_id, parent_level);
        return vec![SectionInfo {
            section_id: parent_id.to_string(),
            section_content: section_lines.join("\n"),
            heading_level: parent_level,
            start_line: base_line,
            end_line: base_line + section_lines.len() - 1,
            section_type,
        }];
    }

    let mut subsections = Vec::new();
    for (idx, (offset, level, title)) in subheadings.iter().enumerate() {
        let end_offset = subheadings
            .get(idx + 1)
            .map(|(next_offset, _, _)| next_offset - 1)
            .unwrap_or(section_lines.len() - 1);

        let section_id = unique_id(&format!("{parent_id}_{}", slugify(title)), used_ids);
        let section_type = detect_section_type(&section_id, *level);
        subsections.push(SectionInfo {
            section_id,
            section_content: section_lines[*offset..=end_offset].join("\n"),
            heading_level: *level,
            start_line: base_line + offset,
            end_line: base_line + end_offset,
            section_type,
        });
    }
    subsections
}

/// Context window: the current section plus `surrounding` neighbors on each
/// side, with the current one marked.
pub fn section_context_window(
    sections: &[SectionInfo],
    current_idx: usize,
    surrounding: usize,
) -> String {
    let start = current_idx.saturating_sub(surrounding);
    let end = (current_idx + surrounding + 1).min(sections.len());

    (start..end)
        .map(|i| {
            if i == current_idx {
                format!(">>> CURRENT SECTION <<<\n{}", sections[i].section_content)
            } else {
                sections[i].section_content.clone()
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

// ============================================================================
// PARAGRAPH NUMBERING (structural loop)
// ============================================================================

/// Split on blank lines and number paragraphs from 1.
pub fn number_paragraphs(document: &str) -> HashMap<usize, String> {
    document
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .enumerate()
        .map(|(i, p)| (i + 1, p.to_string()))
        .collect()
}

/// Render a paragraph mapping with P-number prefixes for diagnosis.
pub fn render_numbered(paragraphs: &HashMap<usize, String>) -> String {
    let mut numbers: Vec<&usize> = paragraphs.keys().collect();
    numbers.sort();
    numbers
        .into_iter()
        .map(|n| format!("[P{n}] {}", paragraphs[n]))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Rebuild document text from a paragraph mapping, in number order.
pub fn rebuild_from_paragraphs(paragraphs: &HashMap<usize, String>) -> String {
    let mut numbers: Vec<&usize> = paragraphs.keys().collect();
    numbers.sort();
    numbers
        .into_iter()
        .map(|n| paragraphs[n].clone())
        .collect::<Vec<_>>()
        .join("\n\n")
}
