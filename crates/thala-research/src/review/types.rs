//! Shared types for the review loops
//!
//! Structured-output contracts (each with its hand-written JSON schema),
//! loop failure records, corpus references, and multi-loop progress
//! tracking. Decisions are tagged unions with the error case as a
//! first-class variant.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use thala_core::llm::StructuredSchema;

use crate::citations::Edit;

// ============================================================================
// CORPUS REFERENCES
// ============================================================================

/// Summary-level view of one corpus paper, keyed by DOI in loop state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperSummary {
    pub doi: String,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub year: u16,
    #[serde(default)]
    pub short_summary: String,
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methodology: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bib_key: Option<String>,
}

impl PaperSummary {
    /// "Smith et al." style author string.
    pub fn author_label(&self) -> String {
        let surname = |full: &str| {
            full.split_whitespace()
                .last()
                .unwrap_or("Unknown")
                .to_string()
        };
        match self.authors.len() {
            0 => "Unknown".to_string(),
            1 => surname(&self.authors[0]),
            2 => format!("{} & {}", surname(&self.authors[0]), surname(&self.authors[1])),
            _ => format!("{} et al.", surname(&self.authors[0])),
        }
    }
}

/// Quality tier settings; `max_stages` drives per-loop iteration budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySettings {
    pub max_stages: usize,
    pub max_papers: usize,
}

impl QualitySettings {
    pub fn quick() -> Self {
        Self {
            max_stages: 1,
            max_papers: 25,
        }
    }

    pub fn standard() -> Self {
        Self {
            max_stages: 3,
            max_papers: 100,
        }
    }

    pub fn comprehensive() -> Self {
        Self {
            max_stages: 5,
            max_papers: 250,
        }
    }

    /// Reduced settings for a repeat pass.
    pub fn reduced(&self) -> Self {
        Self {
            max_stages: 1,
            max_papers: self.max_papers,
        }
    }
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self::standard()
    }
}

// ============================================================================
// FAILURE AND PROGRESS RECORDS
// ============================================================================

/// A recoverable failure inside a loop iteration.
///
/// Loops tolerate these up to a consecutive-failure bound before
/// finalizing early; they are state, not exceptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopFailure {
    pub loop_number: u8,
    pub iteration: usize,
    pub node_name: String,
    pub error_type: String,
    pub error_message: String,
    pub recoverable: bool,
}

/// Consecutive failures a loop absorbs before giving up.
pub const MAX_CONSECUTIVE_FAILURES: usize = 2;

/// Snapshot of a review revision at a loop boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRevision {
    pub loop_number: u8,
    pub iteration: usize,
    pub before: String,
    pub after: String,
    /// Compact description of the change (length delta and word delta)
    pub diff: String,
}

impl DocumentRevision {
    pub fn capture(loop_number: u8, iteration: usize, before: &str, after: &str) -> Self {
        let word_delta = after.split_whitespace().count() as i64
            - before.split_whitespace().count() as i64;
        let diff = format!(
            "{} chars -> {} chars ({:+} words)",
            before.len(),
            after.len(),
            word_delta
        );
        Self {
            loop_number,
            iteration,
            before: before.to_string(),
            after: after.to_string(),
            diff,
        }
    }
}

/// Per-loop iteration counts and the bounded structural-repeat counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiLoopProgress {
    pub loop_iterations: HashMap<String, usize>,
    pub max_iterations_per_loop: usize,
    pub loop3_repeat_count: usize,
    pub revision_history: Vec<DocumentRevision>,
}

impl MultiLoopProgress {
    pub fn new(max_iterations_per_loop: usize) -> Self {
        let mut loop_iterations = HashMap::new();
        for name in ["loop_1", "loop_2", "loop_3", "loop_4", "loop_5"] {
            loop_iterations.insert(name.to_string(), 0);
        }
        Self {
            loop_iterations,
            max_iterations_per_loop,
            loop3_repeat_count: 0,
            revision_history: vec![],
        }
    }

    pub fn record_iterations(&mut self, loop_name: &str, iterations: usize) {
        self.loop_iterations
            .insert(loop_name.to_string(), iterations);
    }

    pub fn total_iterations(&self) -> usize {
        self.loop_iterations.values().sum()
    }
}

// ============================================================================
// LOOP 1 - SUPERVISOR DECISION
// ============================================================================

/// Supervisor action for the theoretical-depth loop.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SupervisorDecision {
    ConductResearch {
        questions: Vec<String>,
    },
    RefineDraft {
        updates: String,
        #[serde(default)]
        gaps: Vec<String>,
    },
    CheckFact {
        claim: String,
    },
    ResearchComplete,
}

impl StructuredSchema for SupervisorDecision {
    fn schema_name() -> &'static str {
        "SupervisorDecision"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["conduct_research", "refine_draft", "check_fact", "research_complete"],
                },
                "questions": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Research questions for conduct_research",
                },
                "updates": {"type": "string", "description": "Revised draft text for refine_draft"},
                "gaps": {"type": "array", "items": {"type": "string"}},
                "claim": {"type": "string", "description": "Claim to verify for check_fact"},
            },
            "required": ["action"],
        })
    }
}

// ============================================================================
// LOOP 2 - LITERATURE BASE EXPANSION
// ============================================================================

/// A missing literature base the analyzer wants explored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiteratureBase {
    pub name: String,
    pub search_queries: Vec<String>,
    pub integration_strategy: String,
}

/// Analyzer decision: expand a base, declare completeness, or report error.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LiteratureBaseDecision {
    ExpandBase {
        literature_base: LiteratureBase,
        #[serde(default)]
        reasoning: String,
    },
    Complete {
        #[serde(default)]
        reasoning: String,
    },
    Error {
        reasoning: String,
    },
}

impl StructuredSchema for LiteratureBaseDecision {
    fn schema_name() -> &'static str {
        "LiteratureBaseDecision"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["expand_base", "complete", "error"]},
                "literature_base": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "search_queries": {"type": "array", "items": {"type": "string"}},
                        "integration_strategy": {
                            "type": "string",
                            "description": "How the new findings should be woven into the review",
                        },
                    },
                    "required": ["name", "search_queries", "integration_strategy"],
                },
                "reasoning": {"type": "string"},
            },
            "required": ["action"],
        })
    }
}

// ============================================================================
// LOOP 3 - STRUCTURAL ANALYSIS
// ============================================================================

/// Kinds of structural problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    Redundancy,
    MissingTransition,
    MisplacedContent,
    SplitNeeded,
    Ordering,
    MissingFraming,
}

/// How the issue should be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionKind {
    Rewrite,
    Move,
    Split,
    Merge,
    Add,
}

/// One structural issue identified by the diagnosis phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuralIssue {
    pub issue_id: u32,
    pub issue_type: IssueType,
    pub severity: String,
    /// 1-based paragraph numbers
    pub affected_paragraphs: Vec<usize>,
    pub suggested_resolution: ResolutionKind,
    pub description: String,
}

/// Phase A output: diagnosis without edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuralIssueAnalysis {
    #[serde(default)]
    pub issues: Vec<StructuralIssue>,
    pub overall_assessment: String,
    pub needs_restructuring: bool,
}

impl StructuredSchema for StructuralIssueAnalysis {
    fn schema_name() -> &'static str {
        "StructuralIssueAnalysis"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "issues": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "issue_id": {"type": "integer"},
                            "issue_type": {
                                "type": "string",
                                "enum": ["redundancy", "missing_transition", "misplaced_content",
                                         "split_needed", "ordering", "missing_framing"],
                            },
                            "severity": {"type": "string"},
                            "affected_paragraphs": {"type": "array", "items": {"type": "integer"}},
                            "suggested_resolution": {
                                "type": "string",
                                "enum": ["rewrite", "move", "split", "merge", "add"],
                            },
                            "description": {"type": "string"},
                        },
                        "required": ["issue_id", "issue_type", "severity",
                                     "affected_paragraphs", "suggested_resolution", "description"],
                    },
                },
                "overall_assessment": {"type": "string"},
                "needs_restructuring": {"type": "boolean"},
            },
            "required": ["issues", "overall_assessment", "needs_restructuring"],
        })
    }
}

/// One applied section rewrite (internal bookkeeping, not an LLM schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionRewriteResult {
    pub issue_id: u32,
    pub original_paragraphs: Vec<usize>,
    pub rewritten_content: String,
    pub changes_summary: String,
    pub confidence: f64,
}

/// Post-rewrite verification from the architecture check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchitectureVerificationResult {
    /// 0.0 to 1.0
    pub coherence_score: f64,
    #[serde(default)]
    pub issues_resolved: Vec<String>,
    #[serde(default)]
    pub issues_remaining: Vec<String>,
    #[serde(default)]
    pub regressions_introduced: Vec<String>,
    pub needs_another_iteration: bool,
}

impl StructuredSchema for ArchitectureVerificationResult {
    fn schema_name() -> &'static str {
        "ArchitectureVerificationResult"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "coherence_score": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                "issues_resolved": {"type": "array", "items": {"type": "string"}},
                "issues_remaining": {"type": "array", "items": {"type": "string"}},
                "regressions_introduced": {"type": "array", "items": {"type": "string"}},
                "needs_another_iteration": {"type": "boolean"},
            },
            "required": ["coherence_score", "needs_another_iteration"],
        })
    }
}

// ============================================================================
// LOOP 4 - SECTION EDITING
// ============================================================================

/// Result of editing one section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionEditResult {
    pub section_id: String,
    pub edited_content: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub new_paper_todos: Vec<String>,
    /// 0.0 to 1.0; zero means the edit was rejected/reverted
    pub confidence: f64,
}

impl StructuredSchema for SectionEditResult {
    fn schema_name() -> &'static str {
        "SectionEditResult"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "section_id": {"type": "string"},
                "edited_content": {"type": "string"},
                "notes": {"type": "string", "description": "What changed and why"},
                "new_paper_todos": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Topics needing papers the corpus lacks",
                },
                "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            },
            "required": ["section_id", "edited_content", "confidence"],
        })
    }
}

/// Holistic review over the reassembled document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolisticReviewResult {
    #[serde(default)]
    pub sections_approved: Vec<String>,
    #[serde(default)]
    pub sections_flagged: Vec<String>,
    #[serde(default)]
    pub flagged_reasons: HashMap<String, String>,
    pub overall_coherence_score: f64,
}

impl StructuredSchema for HolisticReviewResult {
    fn schema_name() -> &'static str {
        "HolisticReviewResult"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "sections_approved": {"type": "array", "items": {"type": "string"}},
                "sections_flagged": {"type": "array", "items": {"type": "string"}},
                "flagged_reasons": {
                    "type": "object",
                    "additionalProperties": {"type": "string"},
                },
                "overall_coherence_score": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            },
            "required": ["sections_approved", "sections_flagged", "overall_coherence_score"],
        })
    }
}

/// Score-only fallback when the full holistic schema keeps failing.
#[derive(Debug, Clone, Deserialize)]
pub struct HolisticReviewScoreOnly {
    pub overall_coherence_score: f64,
}

impl StructuredSchema for HolisticReviewScoreOnly {
    fn schema_name() -> &'static str {
        "HolisticReviewScoreOnly"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "overall_coherence_score": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            },
            "required": ["overall_coherence_score"],
        })
    }
}

/// Resolution for one TODO marker.
#[derive(Debug, Clone, Deserialize)]
pub struct TodoResolution {
    pub resolved: bool,
    #[serde(default)]
    pub replacement: Option<String>,
    #[serde(default)]
    pub reasoning: String,
}

impl StructuredSchema for TodoResolution {
    fn schema_name() -> &'static str {
        "TodoResolution"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "resolved": {"type": "boolean"},
                "replacement": {
                    "type": ["string", "null"],
                    "description": "Replacement text when resolved",
                },
                "reasoning": {"type": "string"},
            },
            "required": ["resolved", "reasoning"],
        })
    }
}

// ============================================================================
// LOOP 4.5 - COHESION GATE
// ============================================================================

/// Verdict on whether parallel editing broke document structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohesionCheckResult {
    pub needs_restructuring: bool,
    pub reasoning: String,
}

impl StructuredSchema for CohesionCheckResult {
    fn schema_name() -> &'static str {
        "CohesionCheckResult"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "needs_restructuring": {"type": "boolean"},
                "reasoning": {"type": "string"},
            },
            "required": ["needs_restructuring", "reasoning"],
        })
    }
}

// ============================================================================
// LOOP 5 - FACT & REFERENCE CHECK
// ============================================================================

/// Edits plus flagged claims from a checking pass over one section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentEdits {
    #[serde(default)]
    pub edits: Vec<Edit>,
    #[serde(default)]
    pub ambiguous_claims: Vec<String>,
    #[serde(default)]
    pub unaddressed_todos: Vec<String>,
}

impl StructuredSchema for DocumentEdits {
    fn schema_name() -> &'static str {
        "DocumentEdits"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "edits": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "find": {
                                "type": "string",
                                "description": "Exact text to replace; must occur exactly once",
                            },
                            "replace": {"type": "string"},
                            "edit_type": {
                                "type": "string",
                                "enum": ["fact_correction", "citation_fix", "clarity"],
                            },
                        },
                        "required": ["find", "replace", "edit_type"],
                    },
                },
                "ambiguous_claims": {"type": "array", "items": {"type": "string"}},
                "unaddressed_todos": {"type": "array", "items": {"type": "string"}},
            },
            "required": ["edits"],
        })
    }
}

/// One fix for an invalid citation.
#[derive(Debug, Clone, Deserialize)]
pub struct CitationFix {
    /// Exact text containing the invalid citation (kept short for uniqueness)
    pub original_text: String,
    /// Corrected text: valid citation, no citation, or rewritten claim
    pub replacement_text: String,
    #[serde(default)]
    pub reasoning: String,
}

/// Fixes for a batch of invalid citations.
#[derive(Debug, Clone, Deserialize)]
pub struct CitationResolutionResult {
    #[serde(default)]
    pub fixes: Vec<CitationFix>,
}

impl StructuredSchema for CitationResolutionResult {
    fn schema_name() -> &'static str {
        "CitationResolutionResult"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "fixes": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "original_text": {"type": "string"},
                            "replacement_text": {"type": "string"},
                            "reasoning": {"type": "string"},
                        },
                        "required": ["original_text", "replacement_text"],
                    },
                },
            },
            "required": ["fixes"],
        })
    }
}

/// Verdict over flagged TODO items: which deserve human review.
#[derive(Debug, Clone, Deserialize)]
pub struct TodoVerificationResult {
    #[serde(default)]
    pub keep: Vec<String>,
    #[serde(default)]
    pub discard: Vec<String>,
}

impl StructuredSchema for TodoVerificationResult {
    fn schema_name() -> &'static str {
        "TodoVerificationResult"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "keep": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Items that genuinely need human attention",
                },
                "discard": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Corpus-gap or methodological placeholders",
                },
            },
            "required": ["keep", "discard"],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supervisor_decision_tagged_parsing() {
        let research: SupervisorDecision = serde_json::from_value(json!({
            "action": "conduct_research",
            "questions": ["What is X?", "How does Y relate?"],
        }))
        .unwrap();
        assert!(matches!(
            research,
            SupervisorDecision::ConductResearch { ref questions } if questions.len() == 2
        ));

        let complete: SupervisorDecision =
            serde_json::from_value(json!({"action": "research_complete"})).unwrap();
        assert_eq!(complete, SupervisorDecision::ResearchComplete);
    }

    #[test]
    fn test_literature_decision_error_is_first_class() {
        let error: LiteratureBaseDecision = serde_json::from_value(json!({
            "action": "error",
            "reasoning": "analysis failed",
        }))
        .unwrap();
        assert!(matches!(error, LiteratureBaseDecision::Error { .. }));

        let expand: LiteratureBaseDecision = serde_json::from_value(json!({
            "action": "expand_base",
            "literature_base": {
                "name": "embodied cognition",
                "search_queries": ["embodied cognition review"],
                "integration_strategy": "new subsection after theory",
            },
        }))
        .unwrap();
        match expand {
            LiteratureBaseDecision::ExpandBase { literature_base, .. } => {
                assert_eq!(literature_base.name, "embodied cognition");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_structural_issue_round_trip() {
        let analysis: StructuralIssueAnalysis = serde_json::from_value(json!({
            "issues": [{
                "issue_id": 1,
                "issue_type": "misplaced_content",
                "severity": "major",
                "affected_paragraphs": [7],
                "suggested_resolution": "rewrite",
                "description": "Methodology paragraph interrupts the argument",
            }],
            "overall_assessment": "One misplaced paragraph",
            "needs_restructuring": true,
        }))
        .unwrap();
        assert_eq!(analysis.issues.len(), 1);
        assert_eq!(analysis.issues[0].issue_type, IssueType::MisplacedContent);
        assert_eq!(analysis.issues[0].suggested_resolution, ResolutionKind::Rewrite);
    }

    #[test]
    fn test_author_label() {
        let mut paper = PaperSummary {
            authors: vec!["Ada Lovelace".to_string()],
            ..Default::default()
        };
        assert_eq!(paper.author_label(), "Lovelace");

        paper.authors.push("Alan Turing".to_string());
        assert_eq!(paper.author_label(), "Lovelace & Turing");

        paper.authors.push("Grace Hopper".to_string());
        assert_eq!(paper.author_label(), "Lovelace et al.");

        paper.authors.clear();
        assert_eq!(paper.author_label(), "Unknown");
    }

    #[test]
    fn test_revision_capture_diff() {
        let revision = DocumentRevision::capture(3, 1, "one two three", "one two three four five");
        assert!(revision.diff.contains("+2 words"));
    }

    #[test]
    fn test_progress_tracking() {
        let mut progress = MultiLoopProgress::new(3);
        progress.record_iterations("loop_1", 2);
        progress.record_iterations("loop_4", 3);
        assert_eq!(progress.total_iterations(), 5);
        assert_eq!(progress.max_iterations_per_loop, 3);
    }

    #[test]
    fn test_schemas_are_objects() {
        for schema in [
            SupervisorDecision::schema(),
            LiteratureBaseDecision::schema(),
            StructuralIssueAnalysis::schema(),
            ArchitectureVerificationResult::schema(),
            SectionEditResult::schema(),
            HolisticReviewResult::schema(),
            CohesionCheckResult::schema(),
            DocumentEdits::schema(),
            TodoResolution::schema(),
            CitationResolutionResult::schema(),
            TodoVerificationResult::schema(),
        ] {
            assert_eq!(schema["type"], "object");
            assert!(schema["required"].is_array());
        }
    }
}
