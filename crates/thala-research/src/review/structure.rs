//! Loop 3: structure and cohesion (two-phase section rewriting)
//!
//! Phase A diagnoses structural issues over numbered paragraphs; Phase B
//! rewrites each issue's region directly (models rewrite better than they
//! specify edit operations), processing issues in reverse order of their
//! last affected paragraph so earlier indices stay stable. A verification
//! call then gates the next iteration on coherence.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use thala_core::llm::{ModelTier, StructuredOptions};

use super::ReviewContext;
use super::prompts::{
    LOOP3_PHASE_A_SYSTEM, LOOP3_VERIFIER_SYSTEM, REWRITE_SUMMARY_SYSTEM, SECTION_REWRITE_SYSTEM,
    loop3_phase_a_user, loop3_verifier_user, rewrite_summary_user, section_rewrite_user,
};
use super::sections::{number_paragraphs, rebuild_from_paragraphs, render_numbered};
use super::types::{
    ArchitectureVerificationResult, IssueType, ResolutionKind, SectionRewriteResult,
    StructuralIssue, StructuralIssueAnalysis,
};

/// Paragraphs of read-only context on each side of a rewrite
const CONTEXT_PARAGRAPHS: usize = 3;
/// Rewrites shorter than this are treated as failures
const MIN_REWRITE_CHARS: usize = 50;
/// Coherence gate for finishing the loop
const COHERENCE_THRESHOLD: f64 = 0.8;

/// Result of the structural loop.
#[derive(Debug, Clone)]
pub struct StructureLoopResult {
    pub current_review: String,
    pub iterations_used: usize,
    pub changes_summary: String,
    pub verification: Option<ArchitectureVerificationResult>,
}

/// Extract a paragraph range plus surrounding context from the mapping.
pub fn extract_section_with_context(
    paragraphs: &HashMap<usize, String>,
    affected: &[usize],
    context_size: usize,
) -> (String, String, String, usize, usize) {
    let Some(&start) = affected.iter().min() else {
        return (String::new(), String::new(), String::new(), 0, 0);
    };
    let end = *affected.iter().max().expect("non-empty affected");

    let min_para = paragraphs.keys().min().copied().unwrap_or(1);
    let max_para = paragraphs.keys().max().copied().unwrap_or(1);

    let join = |range: std::ops::RangeInclusive<usize>| {
        range
            .filter_map(|p| paragraphs.get(&p).cloned())
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    let context_start = start.saturating_sub(context_size).max(min_para);
    let before = if context_start < start {
        join(context_start..=start - 1)
    } else {
        String::new()
    };
    let section = join(start..=end);
    let context_end = (end + context_size).min(max_para);
    let after = if context_end > end {
        join(end + 1..=context_end)
    } else {
        String::new()
    };

    (before, section, after, start, end)
}

/// Apply a rewrite: the affected range collapses to one paragraph holding
/// the rewritten content; later paragraphs renumber downward.
pub fn apply_rewrite(
    paragraphs: &HashMap<usize, String>,
    rewrite: &SectionRewriteResult,
) -> HashMap<usize, String> {
    let Some(&start) = rewrite.original_paragraphs.iter().min() else {
        return paragraphs.clone();
    };
    let end = *rewrite
        .original_paragraphs
        .iter()
        .max()
        .expect("non-empty paragraphs");

    let mut updated = HashMap::new();
    for (&number, text) in paragraphs {
        if number < start {
            updated.insert(number, text.clone());
        }
    }
    updated.insert(start, rewrite.rewritten_content.clone());

    let mut next = start + 1;
    let mut tail: Vec<&usize> = paragraphs.keys().filter(|&&n| n > end).collect();
    tail.sort();
    for number in tail {
        updated.insert(next, paragraphs[number].clone());
        next += 1;
    }
    updated
}

/// Run the structural loop. Budget is `max_iterations + 1`.
pub async fn run_structure_loop(
    context: &ReviewContext,
    review: &str,
    max_iterations: usize,
) -> StructureLoopResult {
    let budget = max_iterations + 1;
    let mut current_review = review.to_string();
    let mut iterations_used = 0usize;
    let mut last_verification: Option<ArchitectureVerificationResult> = None;
    let mut total_rewrites = 0usize;

    info!(budget, "starting structural loop");

    for iteration in 0..budget {
        iterations_used = iteration + 1;
        let paragraphs = number_paragraphs(&current_review);
        let numbered = render_numbered(&paragraphs);

        // ---- Phase A: diagnosis ----
        let analysis = context
            .gateway
            .structured::<StructuralIssueAnalysis>(
                ModelTier::Opus,
                Some(LOOP3_PHASE_A_SYSTEM),
                &loop3_phase_a_user(&numbered, &context.topic, iteration, budget),
                &StructuredOptions::default()
                    .json_schema_method()
                    .with_thinking(6_000)
                    .with_max_tokens(8_000),
            )
            .await;

        let analysis = match analysis {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("structural diagnosis failed: {e}, finalizing");
                break;
            }
        };

        info!(
            issues = analysis.issues.len(),
            needs_restructuring = analysis.needs_restructuring,
            "diagnosis complete"
        );
        for issue in &analysis.issues {
            debug!(
                issue_id = issue.issue_id,
                issue_type = ?issue.issue_type,
                paragraphs = issue.affected_paragraphs.len(),
                "issue: {}",
                issue.description
            );
        }

        if !analysis.needs_restructuring || analysis.issues.is_empty() {
            info!("no restructuring needed, loop complete");
            break;
        }

        // ---- Phase B: rewrite sections, last-affected first ----
        let mut sorted_issues = analysis.issues.clone();
        sorted_issues.sort_by_key(|issue| {
            std::cmp::Reverse(issue.affected_paragraphs.iter().max().copied().unwrap_or(0))
        });

        let mut working = paragraphs.clone();
        let mut rewrites: Vec<SectionRewriteResult> = Vec::new();
        let mut skipped = 0usize;

        for issue in &sorted_issues {
            match rewrite_for_issue(context, issue, &working).await {
                Some(rewrite) => {
                    working = apply_rewrite(&working, &rewrite);
                    rewrites.push(rewrite);
                }
                None => skipped += 1,
            }
        }

        info!(
            applied = rewrites.len(),
            skipped, "section rewriting complete"
        );
        total_rewrites += rewrites.len();

        if rewrites.is_empty() {
            info!("no rewrites performed, loop complete");
            break;
        }
        current_review = rebuild_from_paragraphs(&working);

        // ---- verification ----
        let issues_text = format!(
            "{}\n\nSpecific issues identified:\n{}",
            analysis.overall_assessment,
            analysis
                .issues
                .iter()
                .map(|issue| format!(
                    "- Issue {} ({:?}): {}",
                    issue.issue_id, issue.issue_type, issue.description
                ))
                .collect::<Vec<_>>()
                .join("\n"),
        );
        let changes_text = rewrites
            .iter()
            .map(|rewrite| {
                format!(
                    "- Rewrite for issue {}: {}",
                    rewrite.issue_id, rewrite.changes_summary
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let verification = context
            .gateway
            .structured::<ArchitectureVerificationResult>(
                ModelTier::Sonnet,
                Some(LOOP3_VERIFIER_SYSTEM),
                &loop3_verifier_user(&issues_text, &changes_text, &current_review, iteration, budget),
                &StructuredOptions::default()
                    .json_schema_method()
                    .with_thinking(4_000)
                    .with_max_tokens(4_096),
            )
            .await;

        match verification {
            Ok(result) => {
                info!(
                    coherence = result.coherence_score,
                    resolved = result.issues_resolved.len(),
                    remaining = result.issues_remaining.len(),
                    regressions = result.regressions_introduced.len(),
                    "architecture verification complete"
                );

                let keep_going = result.coherence_score < COHERENCE_THRESHOLD
                    && (!result.issues_remaining.is_empty()
                        || !result.regressions_introduced.is_empty())
                    || result.needs_another_iteration;
                last_verification = Some(result);

                if !keep_going {
                    info!("coherence gate passed, loop complete");
                    break;
                }
            }
            Err(e) => {
                warn!("architecture verification failed: {e}, finalizing");
                break;
            }
        }
    }

    StructureLoopResult {
        current_review,
        iterations_used,
        changes_summary: format!(
            "{total_rewrites} section rewrites across {iterations_used} iterations"
        ),
        verification: last_verification,
    }
}

/// Rewrite one issue's region; `None` means skipped (pure move, missing
/// content, or model failure).
async fn rewrite_for_issue(
    context: &ReviewContext,
    issue: &StructuralIssue,
    paragraphs: &HashMap<usize, String>,
) -> Option<SectionRewriteResult> {
    // A pure relocation rewrites nothing in place
    if issue.issue_type == IssueType::MisplacedContent
        && issue.suggested_resolution == ResolutionKind::Move
    {
        debug!(issue_id = issue.issue_id, "skipping pure move operation");
        return None;
    }

    let (before, section, after, start, end) =
        extract_section_with_context(paragraphs, &issue.affected_paragraphs, CONTEXT_PARAGRAPHS);

    if section.is_empty() {
        warn!(
            issue_id = issue.issue_id,
            paragraphs = ?issue.affected_paragraphs,
            "no content found for affected paragraphs"
        );
        return None;
    }

    let rewritten = context
        .gateway
        .complete_text(
            ModelTier::Sonnet,
            Some(SECTION_REWRITE_SYSTEM),
            &section_rewrite_user(issue, &before, &section, &after),
            8_192,
        )
        .await;

    let rewritten = match rewritten {
        Ok(text) if text.trim().len() >= MIN_REWRITE_CHARS => text.trim().to_string(),
        Ok(text) => {
            warn!(
                issue_id = issue.issue_id,
                chars = text.trim().len(),
                "rewrite too short"
            );
            return None;
        }
        Err(e) => {
            warn!(issue_id = issue.issue_id, "rewrite failed: {e}");
            return None;
        }
    };

    // Audit-log summary; a failure here never blocks the rewrite
    let changes_summary = context
        .gateway
        .complete_text(
            ModelTier::Haiku,
            Some(REWRITE_SUMMARY_SYSTEM),
            &rewrite_summary_user(&section, &rewritten, &issue.description),
            512,
        )
        .await
        .unwrap_or_else(|_| format!("Rewrite to fix: {}", issue.description));

    debug!(
        issue_id = issue.issue_id,
        start, end, "rewrote paragraph range"
    );

    Some(SectionRewriteResult {
        issue_id: issue.issue_id,
        original_paragraphs: (start..=end).collect(),
        rewritten_content: rewritten,
        changes_summary,
        confidence: 0.8,
    })
}
