//! Find-string edit validation and application
//!
//! Edits are applied programmatically: a `find` string must occur exactly
//! once in the current document. Missing strings and duplicates are
//! invalid, never guessed at.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// What an edit corrects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditType {
    FactCorrection,
    CitationFix,
    Clarity,
}

impl EditType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditType::FactCorrection => "fact_correction",
            EditType::CitationFix => "citation_fix",
            EditType::Clarity => "clarity",
        }
    }
}

/// One find/replace edit from a checking pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edit {
    /// Exact text to replace; must occur exactly once
    pub find: String,
    pub replace: String,
    pub edit_type: EditType,
}

/// Partitioned validation outcome.
#[derive(Debug, Default)]
pub struct EditValidation {
    pub valid: Vec<Edit>,
    /// Rejected edits with the reason
    pub invalid: Vec<(Edit, String)>,
}

/// Validate that every edit's find string exists and is unambiguous.
pub fn validate_edits(document: &str, edits: &[Edit]) -> EditValidation {
    let mut validation = EditValidation::default();

    for edit in edits {
        if edit.find.trim().is_empty() {
            validation
                .invalid
                .push((edit.clone(), "empty find string".to_string()));
            continue;
        }

        match document.matches(&edit.find).count() {
            0 => validation
                .invalid
                .push((edit.clone(), "find string not present".to_string())),
            1 => validation.valid.push(edit.clone()),
            n => validation
                .invalid
                .push((edit.clone(), format!("find string occurs {n} times"))),
        }
    }

    info!(
        valid = validation.valid.len(),
        invalid = validation.invalid.len(),
        "edit validation complete"
    );
    validation
}

/// Apply validated edits sequentially.
///
/// Each replacement touches the single occurrence its validation found;
/// overlapping replacements within a section are assumed absent.
pub fn apply_edits(document: &str, edits: &[Edit]) -> String {
    let mut result = document.to_string();
    for edit in edits {
        if let Some(position) = result.find(&edit.find) {
            result.replace_range(position..position + edit.find.len(), &edit.replace);
            debug!(edit_type = edit.edit_type.as_str(), "applied edit");
        } else {
            debug!("edit find string vanished before application, skipping");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(find: &str, replace: &str) -> Edit {
        Edit {
            find: find.to_string(),
            replace: replace.to_string(),
            edit_type: EditType::FactCorrection,
        }
    }

    #[test]
    fn test_validate_partitions_edits() {
        let document = "The sky is green. The grass is green.";
        let edits = vec![
            edit("The sky is green.", "The sky is blue."),
            edit("is green", "is verdant"), // occurs twice
            edit("does not exist", "x"),
            edit("", "y"),
        ];

        let validation = validate_edits(document, &edits);
        assert_eq!(validation.valid.len(), 1);
        assert_eq!(validation.invalid.len(), 3);
        assert!(validation.invalid[0].1.contains("occurs 2 times"));
        assert!(validation.invalid[1].1.contains("not present"));
        assert!(validation.invalid[2].1.contains("empty"));
    }

    #[test]
    fn test_apply_edits_sequentially() {
        let document = "One fact. Another fact.";
        let edits = vec![
            edit("One fact.", "One corrected fact."),
            edit("Another fact.", "Another corrected fact."),
        ];
        let updated = apply_edits(document, &edits);
        assert_eq!(updated, "One corrected fact. Another corrected fact.");
    }

    #[test]
    fn test_apply_skips_vanished_find() {
        let document = "alpha beta";
        let edits = vec![edit("alpha beta", "gamma"), edit("beta", "delta")];
        // The second edit's target was consumed by the first
        let updated = apply_edits(document, &edits);
        assert_eq!(updated, "gamma");
    }
}
