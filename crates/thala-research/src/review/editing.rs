//! Loop 4: section-level deep editing
//!
//! Splits the review into token-bounded sections, edits them concurrently
//! (bound 5) with corpus tools, validates citations and word counts per
//! section type, resolves leftover TODO markers, reassembles
//! deterministically, and gates another iteration on a holistic review
//! with a three-tier retry strategy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use thala_core::llm::{
    AgentBudget, ChatMessage, ModelTier, StructuredOptions, SystemBlock, run_tool_agent,
};

use super::ReviewContext;
use super::prompts::{
    LOOP4_ABSTRACT_EDITOR_SYSTEM, LOOP4_CONTENT_EDITOR_SYSTEM, LOOP4_FRAMING_EDITOR_SYSTEM,
    LOOP4_HOLISTIC_SYSTEM, TODO_RESOLUTION_SYSTEM, loop4_abstract_editor_user,
    loop4_content_editor_user, loop4_holistic_user, todo_resolution_user,
};
use super::sections::{
    DEFAULT_SECTION_TOKENS, SectionInfo, SectionType, section_context_window, split_into_sections,
};
use super::tools::{FactCheckTool, paper_tools};
use super::types::{
    HolisticReviewResult, HolisticReviewScoreOnly, SectionEditResult, TodoResolution,
};
use crate::citations::{
    corpus_key_set, detect_duplicate_headers, detect_duplicate_sections,
    extract_citation_keys, extract_todo_markers, merge_duplicate_edits,
    remove_duplicate_headers, strip_invalid_citations, validate_edit_citations,
    validate_edit_citations_with_bib,
};

/// Concurrent section edits
const SECTION_EDIT_CONCURRENCY: usize = 5;
/// Tool budget per section editor
const EDITOR_TOOL_CALLS: usize = 10;
const EDITOR_TOOL_CHARS: usize = 100_000;
/// Paper-summary context budget per section
const SUMMARY_CHAR_BUDGET: usize = 30_000;
/// Detailed papers fetched per section
const DETAILED_PAPERS_PER_SECTION: usize = 5;
/// Tool budget for TODO resolution
const TODO_TOOL_CALLS: usize = 5;
const TODO_TOOL_CHARS: usize = 50_000;
/// Coherence floor in the score-only holistic fallback
const SCORE_ONLY_COHERENCE_FLOOR: f64 = 0.7;

// ============================================================================
// WORD-COUNT POLICY
// ============================================================================

/// Word-count constraint for an edited section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WordPolicy {
    /// Hard range (abstracts)
    Absolute { min: usize, max: usize },
    /// Relative tolerance on the original count
    Tolerance(f64),
    /// No limit (very short sections)
    Unlimited,
}

/// Policy per section type; content sections scale with their size.
pub fn word_count_policy(section_type: SectionType, original_words: usize) -> WordPolicy {
    match section_type {
        SectionType::Abstract => WordPolicy::Absolute { min: 200, max: 300 },
        SectionType::Introduction | SectionType::Conclusion => WordPolicy::Tolerance(0.25),
        SectionType::Methodology | SectionType::Content => {
            if original_words < 50 {
                WordPolicy::Unlimited
            } else if original_words < 150 {
                WordPolicy::Tolerance(0.50)
            } else if original_words < 300 {
                WordPolicy::Tolerance(0.30)
            } else {
                WordPolicy::Tolerance(0.20)
            }
        }
    }
}

/// Relative growth of an edit; (within_limit, growth).
pub fn check_section_growth(original: &str, edited: &str, tolerance: f64) -> (bool, f64) {
    let original_words = original.split_whitespace().count().max(1);
    let edited_words = edited.split_whitespace().count();
    let growth = edited_words as f64 / original_words as f64 - 1.0;
    (growth.abs() <= tolerance, growth)
}

// ============================================================================
// RESULT
// ============================================================================

/// Result of the editing loop.
#[derive(Debug, Clone)]
pub struct EditingLoopResult {
    pub current_review: String,
    pub iterations_used: usize,
    pub changes_summary: String,
    pub holistic: Option<HolisticReviewResult>,
    /// Keys confirmed against the bibliographic system during editing
    pub verified_keys: HashSet<String>,
}

// ============================================================================
// LOOP
// ============================================================================

/// Run the section-editing loop.
///
/// `max_iterations` is lower-bounded at 2 so the holistic review can always
/// trigger one round of self-correction.
pub async fn run_editing_loop(
    context: &ReviewContext,
    review: &str,
    max_iterations: usize,
) -> EditingLoopResult {
    let max_iterations = if max_iterations < 2 {
        warn!(max_iterations, "iteration budget too low for self-correction, raising to 2");
        2
    } else {
        max_iterations
    };

    let mut current_review = review.to_string();
    let mut iteration = 0usize;
    let mut flagged: Vec<String> = Vec::new();
    let mut verified_keys: HashSet<String> = HashSet::new();
    let mut holistic: Option<HolisticReviewResult> = None;
    // Corpus keys plus the DOI-derived variants summaries sometimes cite by
    let mut corpus_keys = corpus_key_set(&context.corpus.key_set(), &context.corpus.bib_keys);

    info!(max_iterations, "starting section-editing loop");

    loop {
        // ---- split ----
        let all_sections = split_into_sections(&current_review, DEFAULT_SECTION_TOKENS);
        let sections: Vec<SectionInfo> = if iteration == 0 {
            info!(count = all_sections.len(), "split document for initial editing");
            all_sections
        } else {
            let flagged_set: HashSet<&String> = flagged.iter().collect();
            let subset: Vec<SectionInfo> = all_sections
                .into_iter()
                .filter(|section| flagged_set.contains(&section.section_id))
                .collect();
            info!(count = subset.len(), iteration = iteration + 1, "re-editing flagged sections");
            subset
        };

        if sections.is_empty() {
            break;
        }

        // ---- parallel edit ----
        let (mut results, newly_verified) =
            edit_sections(context, &sections, &corpus_keys, &verified_keys).await;
        verified_keys.extend(newly_verified);
        corpus_keys.extend(verified_keys.iter().cloned());

        let editor_notes: Vec<String> = results
            .values()
            .filter(|result| !result.notes.is_empty())
            .map(|result| format!("[{}] {}", result.section_id, result.notes))
            .collect();

        // ---- TODO resolution ----
        results = resolve_todos(context, results).await;

        // ---- reassemble ----
        let section_pairs: Vec<(String, String)> = sections
            .iter()
            .map(|s| (s.section_id.clone(), s.section_content.clone()))
            .collect();
        let duplicates = detect_duplicate_sections(&section_pairs);
        if !duplicates.is_empty() {
            debug!(pairs = duplicates.len(), "merging duplicate section edits");
            results = merge_duplicate_edits(results, &duplicates);
        }
        current_review = reassemble(&current_review, &sections, &results, iteration);

        // ---- holistic review ----
        let review_result =
            holistic_review(context, &current_review, &editor_notes, iteration, max_iterations)
                .await;
        flagged = review_result.sections_flagged.clone();
        for (section_id, reason) in &review_result.flagged_reasons {
            debug!(section_id, reason, "section flagged");
        }
        info!(
            approved = review_result.sections_approved.len(),
            flagged = flagged.len(),
            coherence = review_result.overall_coherence_score,
            "holistic review complete"
        );
        holistic = Some(review_result);
        iteration += 1;

        if flagged.is_empty() || iteration >= max_iterations {
            break;
        }
    }

    // ---- finalize: duplicate-header cleanup ----
    let duplicate_headers = detect_duplicate_headers(&current_review);
    if !duplicate_headers.is_empty() {
        info!(count = duplicate_headers.len(), "cleaning up duplicate headers");
        current_review = remove_duplicate_headers(&current_review, &duplicate_headers);
    }

    info!(iterations = iteration, "section-editing loop complete");
    EditingLoopResult {
        current_review,
        iterations_used: iteration,
        changes_summary: format!("{iteration} editing iterations"),
        holistic,
        verified_keys,
    }
}

// ============================================================================
// SECTION EDITING
// ============================================================================

async fn edit_sections(
    context: &ReviewContext,
    sections: &[SectionInfo],
    corpus_keys: &HashSet<String>,
    verified_keys: &HashSet<String>,
) -> (HashMap<String, SectionEditResult>, HashSet<String>) {
    let semaphore = Arc::new(Semaphore::new(SECTION_EDIT_CONCURRENCY));
    info!(count = sections.len(), "starting parallel section editing");

    let tasks = sections.iter().enumerate().map(|(idx, section)| {
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");
            edit_one_section(context, sections, section, idx, corpus_keys, verified_keys).await
        }
    });

    let outcomes = futures::future::join_all(tasks).await;

    let mut results = HashMap::new();
    let mut newly_verified = HashSet::new();
    for (result, verified) in outcomes {
        newly_verified.extend(verified);
        results.insert(result.section_id.clone(), result);
    }
    (results, newly_verified)
}

async fn edit_one_section(
    context: &ReviewContext,
    sections: &[SectionInfo],
    section: &SectionInfo,
    section_idx: usize,
    corpus_keys: &HashSet<String>,
    verified_keys: &HashSet<String>,
) -> (SectionEditResult, HashSet<String>) {
    let section_id = &section.section_id;
    let original_words = section.section_content.split_whitespace().count();
    let policy = word_count_policy(section.section_type, original_words);
    let context_window = section_context_window(sections, section_idx, 1);
    let mut newly_verified: HashSet<String> = HashSet::new();

    // ---- produce the edit ----
    let response = if section.section_type == SectionType::Abstract {
        context
            .gateway
            .structured::<SectionEditResult>(
                ModelTier::Opus,
                Some(LOOP4_ABSTRACT_EDITOR_SYSTEM),
                &loop4_abstract_editor_user(&section.section_content, &context_window, original_words),
                &StructuredOptions::default()
                    .json_schema_method()
                    .with_max_tokens(4_096),
            )
            .await
    } else {
        let system = match section.section_type {
            SectionType::Introduction | SectionType::Conclusion => LOOP4_FRAMING_EDITOR_SYSTEM,
            _ => LOOP4_CONTENT_EDITOR_SYSTEM,
        };

        let summaries = build_section_summaries(context, &section.section_content).await;
        let available_keys = format_available_keys(context, 30);
        let todos: Vec<String> = section
            .section_content
            .lines()
            .filter(|line| line.contains("<!-- TODO:"))
            .map(|line| line.trim().to_string())
            .collect();

        let prompt = loop4_content_editor_user(
            section_id,
            &section.section_content,
            &context_window,
            &summaries,
            &available_keys,
            &if todos.is_empty() {
                "None".to_string()
            } else {
                todos.join("\n")
            },
        );

        let tools = paper_tools(
            context.stores.clone(),
            context.store_query.clone(),
            context.corpus.clone(),
        );

        run_tool_agent::<SectionEditResult>(
            context.gateway.client(),
            ModelTier::Opus,
            vec![SystemBlock::cached(system)],
            vec![ChatMessage::user(prompt)],
            &tools,
            AgentBudget::new(EDITOR_TOOL_CALLS, EDITOR_TOOL_CHARS),
            16_384,
        )
        .await
    };

    let mut response = match response {
        Ok(mut response) => {
            // Section ids are assigned here, not trusted from the model
            response.section_id = section_id.clone();
            response
        }
        Err(e) => {
            warn!(section_id, "section edit failed: {e}");
            return (rejected(section, format!("Edit failed: {e}")), newly_verified);
        }
    };

    // ---- citation validation ----
    let known: HashSet<String> = corpus_keys.union(verified_keys).cloned().collect();
    if context.verify_bib {
        let validation = validate_edit_citations_with_bib(
            &section.section_content,
            &response.edited_content,
            &known,
            &context.stores.zotero,
            true,
        )
        .await;
        newly_verified.extend(
            validation
                .verified
                .difference(&known)
                .cloned()
                .collect::<Vec<_>>(),
        );

        if !validation.is_valid {
            let invalid_keys: HashSet<String> = validation
                .invalid
                .iter()
                .filter_map(|entry| entry.split_whitespace().next())
                .map(str::to_string)
                .collect();
            warn!(
                section_id,
                stripped = invalid_keys.len(),
                "stripping unverified citations"
            );
            response = SectionEditResult {
                section_id: section_id.clone(),
                edited_content: strip_invalid_citations(
                    &response.edited_content,
                    &invalid_keys,
                    true,
                ),
                notes: format!("Stripped unverified citations: {:?}", validation.invalid),
                new_paper_todos: response.new_paper_todos,
                confidence: response.confidence * 0.9,
            };
        }
    } else {
        let validation = validate_edit_citations(&response.edited_content, &known);
        if !validation.is_valid {
            warn!(section_id, invalid = ?validation.invalid, "edit rejected for invalid citations");
            return (
                rejected(
                    section,
                    format!("Edit rejected due to invalid citations: {:?}", validation.invalid),
                ),
                newly_verified,
            );
        }
    }

    // ---- word-count enforcement ----
    if response.confidence > 0.0 {
        response = enforce_word_policy(
            context,
            section,
            response,
            policy,
            original_words,
            &known,
            &mut newly_verified,
        )
        .await;
    }

    debug!(
        section_id,
        confidence = response.confidence,
        section_type = ?section.section_type,
        "section edit complete"
    );
    (response, newly_verified)
}

fn rejected(section: &SectionInfo, notes: String) -> SectionEditResult {
    SectionEditResult {
        section_id: section.section_id.clone(),
        edited_content: section.section_content.clone(),
        notes,
        new_paper_todos: vec![],
        confidence: 0.0,
    }
}

/// One retry toward the policy, then extended tolerance or revert.
async fn enforce_word_policy(
    context: &ReviewContext,
    section: &SectionInfo,
    response: SectionEditResult,
    policy: WordPolicy,
    original_words: usize,
    known_keys: &HashSet<String>,
    newly_verified: &mut HashSet<String>,
) -> SectionEditResult {
    let section_id = &section.section_id;

    match policy {
        WordPolicy::Unlimited => {
            debug!(section_id, original_words, "no word limit applied");
            response
        }
        WordPolicy::Absolute { min, max } => {
            let edited_words = response.edited_content.split_whitespace().count();
            if (min..=max).contains(&edited_words) {
                return response;
            }

            let direction = if edited_words > max { "COMPRESS" } else { "EXPAND" };
            debug!(section_id, edited_words, "abstract outside range, retrying");
            let retry_prompt = format!(
                "Your abstract edit is outside the required word count range.\n\n\
                 ## STRICT REQUIREMENTS\n- Minimum: {min} words\n- Maximum: {max} words\n\
                 - Current: {edited_words} words\n\n## STRATEGY\n{direction}: {strategy}\n\n\
                 Return a revised abstract within [{min}, {max}] words.\n\n\
                 ## Your Previous Edit\n{content}",
                strategy = if edited_words > max {
                    "Remove secondary details, combine sentences, focus on key findings."
                } else {
                    "Add brief context on significance or implications."
                },
                content = response.edited_content,
            );

            let retry = context
                .gateway
                .structured::<SectionEditResult>(
                    ModelTier::Opus,
                    Some(LOOP4_ABSTRACT_EDITOR_SYSTEM),
                    &retry_prompt,
                    &StructuredOptions::default()
                        .json_schema_method()
                        .with_max_tokens(4_096),
                )
                .await;

            match retry {
                Ok(mut retry) => {
                    retry.section_id = section_id.clone();
                    let retry_words = retry.edited_content.split_whitespace().count();
                    let grace_max = max * 11 / 10;
                    if (min..=max).contains(&retry_words) {
                        retry
                    } else if retry_words <= grace_max {
                        debug!(section_id, retry_words, "accepting abstract at grace limit");
                        SectionEditResult {
                            confidence: retry.confidence * 0.9,
                            notes: format!(
                                "{} [Accepted at grace limit: {retry_words} words]",
                                retry.notes
                            ),
                            ..retry
                        }
                    } else {
                        warn!(section_id, retry_words, "abstract retry failed, reverting");
                        rejected(
                            section,
                            format!("Abstract edit rejected: {retry_words} words exceeds {max} limit"),
                        )
                    }
                }
                Err(e) => {
                    warn!(section_id, "abstract retry call failed: {e}, reverting");
                    rejected(section, format!("Abstract retry failed: {e}"))
                }
            }
        }
        WordPolicy::Tolerance(tolerance) => {
            let (within, growth) =
                check_section_growth(&section.section_content, &response.edited_content, tolerance);
            if within {
                return response;
            }

            let edited_words = response.edited_content.split_whitespace().count();
            let min_allowed = (original_words as f64 * (1.0 - tolerance)) as usize;
            let max_allowed = (original_words as f64 * (1.0 + tolerance)) as usize;
            let over = growth > 0.0;
            debug!(
                section_id,
                growth = format!("{growth:+.1}"),
                "word count outside tolerance, retrying"
            );

            let retry_prompt = format!(
                "Your previous edit {verb} the word count limit.\n\n\
                 ## STRICT REQUIREMENTS\n- Original: {original_words} words\n\
                 - Your edit: {edited_words} words\n- Allowed range: {min_allowed} to {max_allowed} words\n\n\
                 ## STRATEGY\n{strategy}\n\n\
                 Return your revised edit within [{min_allowed}, {max_allowed}] words. \
                 If you cannot improve meaningfully within limits, return the original \
                 section unchanged.\n\n## Original Section\n{original}\n\n\
                 ## Your Previous Edit\n{edited}",
                verb = if over { "exceeded" } else { "fell short of" },
                strategy = if over {
                    "COMPRESS: Remove redundant phrases, combine sentences, cut tangential \
                     details. Every sentence must earn its place."
                } else {
                    "EXPAND: Add clarifying context, examples, or smooth transitions. \
                     Flesh out thin arguments."
                },
                original = section.section_content,
                edited = response.edited_content,
            );

            let retry = context
                .gateway
                .structured::<SectionEditResult>(
                    ModelTier::Opus,
                    Some(
                        "You are revising a section edit to fit within word count limits. \
                         Preserve the key improvements while meeting the limits.",
                    ),
                    &retry_prompt,
                    &StructuredOptions::default()
                        .json_schema_method()
                        .with_max_tokens(16_384),
                )
                .await;

            let mut retry = match retry {
                Ok(mut retry) => {
                    retry.section_id = section_id.clone();
                    retry
                }
                Err(e) => {
                    warn!(section_id, "word-policy retry failed: {e}, reverting");
                    return rejected(section, format!("Word-policy retry failed: {e}"));
                }
            };

            // The retry gets the same citation scrutiny
            if context.verify_bib {
                let validation = validate_edit_citations_with_bib(
                    &section.section_content,
                    &retry.edited_content,
                    known_keys,
                    &context.stores.zotero,
                    true,
                )
                .await;
                newly_verified.extend(
                    validation
                        .verified
                        .difference(known_keys)
                        .cloned()
                        .collect::<Vec<_>>(),
                );
                if !validation.is_valid {
                    let invalid_keys: HashSet<String> = validation
                        .invalid
                        .iter()
                        .filter_map(|entry| entry.split_whitespace().next())
                        .map(str::to_string)
                        .collect();
                    retry.edited_content =
                        strip_invalid_citations(&retry.edited_content, &invalid_keys, true);
                    retry.confidence *= 0.9;
                }
            } else {
                let validation = validate_edit_citations(&retry.edited_content, known_keys);
                if !validation.is_valid {
                    warn!(section_id, "retry has invalid citations, reverting");
                    return rejected(
                        section,
                        format!(
                            "Edit rejected after retry - invalid citations: {:?}",
                            validation.invalid
                        ),
                    );
                }
            }

            let (retry_within, retry_growth) =
                check_section_growth(&section.section_content, &retry.edited_content, tolerance);
            if retry_within {
                debug!(section_id, "retry met word policy");
                return retry;
            }

            let extended = tolerance + 0.05;
            if retry_growth.abs() <= extended {
                debug!(
                    section_id,
                    growth = format!("{retry_growth:+.1}"),
                    "accepting retry at extended tolerance"
                );
                SectionEditResult {
                    notes: format!(
                        "{} [Accepted at extended tolerance: {retry_growth:+.1}]",
                        retry.notes
                    ),
                    confidence: retry.confidence * 0.85,
                    ..retry
                }
            } else {
                warn!(
                    section_id,
                    growth = format!("{retry_growth:+.1}"),
                    "retry still outside extended tolerance, reverting"
                );
                rejected(
                    section,
                    format!(
                        "Edit rejected after retry: word count {retry_growth:+.1} exceeds \
                         extended tolerance"
                    ),
                )
            }
        }
    }
}

/// Summaries of the papers this section cites, inside the char budget.
async fn build_section_summaries(context: &ReviewContext, section_content: &str) -> String {
    let cited = extract_citation_keys(section_content);
    let mut parts: Vec<String> = Vec::new();
    let mut budget = SUMMARY_CHAR_BUDGET;

    let detailed = context
        .store_query
        .get_papers_for_section(section_content, DETAILED_PAPERS_PER_SECTION, SUMMARY_CHAR_BUDGET / 2)
        .await;

    for (doi, summary) in &context.corpus.summaries {
        let Some(key) = summary
            .bib_key
            .clone()
            .or_else(|| context.corpus.bib_keys.get(doi).cloned())
        else {
            continue;
        };
        if !cited.contains(&key) {
            continue;
        }

        let mut entry = format!(
            "[@{key}] {} ({})\n{}",
            summary.title, summary.year, summary.short_summary
        );
        if let Some(detail) = detailed.get(&key) {
            entry.push_str("\nDetail: ");
            entry.push_str(detail);
        }
        if entry.len() > budget {
            break;
        }
        budget -= entry.len();
        parts.push(entry);
    }

    if parts.is_empty() {
        format!(
            "No corpus summaries available for the cited papers. \
             {} papers retrievable via search_papers.",
            context.corpus.summaries.len()
        )
    } else {
        parts.join("\n\n")
    }
}

fn format_available_keys(context: &ReviewContext, max_keys: usize) -> String {
    if context.corpus.bib_keys.is_empty() {
        return "No citation keys available. Use search_papers to find papers.".to_string();
    }

    let mut lines =
        vec!["Available citation keys (use search_papers for more):".to_string()];
    for (doi, key) in context.corpus.bib_keys.iter().take(max_keys) {
        let (title, year) = context
            .corpus
            .summaries
            .get(doi)
            .map(|s| (s.title.chars().take(60).collect::<String>(), s.year))
            .unwrap_or_else(|| ("Unknown title".to_string(), 0));
        lines.push(format!("- [@{key}] {title} ({year})"));
    }
    if context.corpus.bib_keys.len() > max_keys {
        lines.push(format!(
            "... and {} more (use search_papers to find specific topics)",
            context.corpus.bib_keys.len() - max_keys
        ));
    }
    lines.join("\n")
}

// ============================================================================
// TODO RESOLUTION
// ============================================================================

/// Hand each remaining TODO marker to an agent with paper and fact-check
/// tools; unresolved markers are deleted with a warning.
async fn resolve_todos(
    context: &ReviewContext,
    results: HashMap<String, SectionEditResult>,
) -> HashMap<String, SectionEditResult> {
    let total_todos: usize = results
        .values()
        .map(|result| extract_todo_markers(&result.edited_content).len())
        .sum();
    if total_todos == 0 {
        debug!("no TODO markers in edited sections");
        return results;
    }

    info!(total_todos, "resolving TODO markers");

    let mut tools = paper_tools(
        context.stores.clone(),
        context.store_query.clone(),
        context.corpus.clone(),
    );
    if let Some(web) = &context.web {
        tools.push(Arc::new(FactCheckTool::new(web.clone())));
    }

    let mut resolved_count = 0usize;
    let mut removed_count = 0usize;
    let mut updated = HashMap::new();

    for (section_id, result) in results {
        let mut content = result.edited_content.clone();

        for todo in extract_todo_markers(&content) {
            let Some(position) = content.find(&todo) else {
                continue;
            };
            let mut start = position.saturating_sub(500);
            while start > 0 && !content.is_char_boundary(start) {
                start -= 1;
            }
            let mut end = (position + todo.len() + 500).min(content.len());
            while end < content.len() && !content.is_char_boundary(end) {
                end += 1;
            }
            let surrounding = content[start..end].to_string();

            let resolution = run_tool_agent::<TodoResolution>(
                context.gateway.client(),
                ModelTier::Sonnet,
                vec![SystemBlock::cached(TODO_RESOLUTION_SYSTEM)],
                vec![ChatMessage::user(todo_resolution_user(&todo, &surrounding))],
                &tools,
                AgentBudget::new(TODO_TOOL_CALLS, TODO_TOOL_CHARS),
                4_096,
            )
            .await;

            match resolution {
                Ok(resolution) if resolution.resolved => {
                    let replacement = resolution.replacement.unwrap_or_default();
                    content = content.replace(&todo, &replacement);
                    resolved_count += 1;
                    debug!(section_id, "resolved TODO");
                }
                Ok(resolution) => {
                    content = content.replace(&todo, "");
                    removed_count += 1;
                    warn!(
                        section_id,
                        reasoning = resolution.reasoning.chars().take(100).collect::<String>(),
                        "unresolved TODO removed"
                    );
                }
                Err(e) => {
                    content = content.replace(&todo, "");
                    removed_count += 1;
                    warn!(section_id, "TODO resolution errored, removing: {e}");
                }
            }
        }

        // Collapse the blank runs removals leave behind
        while content.contains("\n\n\n") {
            content = content.replace("\n\n\n", "\n\n");
        }

        updated.insert(
            section_id.clone(),
            SectionEditResult {
                section_id,
                edited_content: content,
                notes: result.notes,
                new_paper_todos: vec![],
                confidence: result.confidence,
            },
        );
    }

    info!(resolved_count, removed_count, "TODO resolution complete");
    updated
}

// ============================================================================
// REASSEMBLY
// ============================================================================

/// Rebuild the document from edited sections.
///
/// The first iteration rebuilds wholesale in original order; later
/// iterations splice edited sections back by line range, last first, so
/// earlier ranges stay valid.
fn reassemble(
    current_review: &str,
    sections: &[SectionInfo],
    results: &HashMap<String, SectionEditResult>,
    iteration: usize,
) -> String {
    let updated = if iteration == 0 {
        sections
            .iter()
            .map(|section| {
                results
                    .get(&section.section_id)
                    .map(|result| result.edited_content.clone())
                    .unwrap_or_else(|| section.section_content.clone())
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    } else {
        let mut lines: Vec<String> = current_review.split('\n').map(str::to_string).collect();
        let mut edited: Vec<&SectionInfo> = sections
            .iter()
            .filter(|section| results.contains_key(&section.section_id))
            .collect();
        edited.sort_by_key(|section| std::cmp::Reverse(section.start_line));

        for section in edited {
            let result = &results[&section.section_id];
            let replacement: Vec<String> =
                result.edited_content.split('\n').map(str::to_string).collect();
            debug!(
                section_id = section.section_id,
                start = section.start_line,
                end = section.end_line,
                "splicing edited section"
            );
            let end = (section.end_line + 1).min(lines.len());
            lines.splice(section.start_line..end, replacement);
        }
        lines.join("\n")
    };

    info!(chars = updated.len(), "document reassembled");
    updated
}

// ============================================================================
// HOLISTIC REVIEW
// ============================================================================

/// Three-tier holistic review: full schema, full schema with explicit id
/// feedback, then score-only with a conservative flag-all/approve-all rule.
async fn holistic_review(
    context: &ReviewContext,
    document: &str,
    editor_notes: &[String],
    iteration: usize,
    max_iterations: usize,
) -> HolisticReviewResult {
    let all_sections = split_into_sections(document, DEFAULT_SECTION_TOKENS);
    let section_ids: Vec<String> = all_sections.iter().map(|s| s.section_id.clone()).collect();
    let valid_ids: HashSet<&String> = section_ids.iter().collect();
    let valid_ids_json = serde_json::to_string_pretty(&section_ids).unwrap_or_default();
    let id_list = all_sections
        .iter()
        .map(|s| {
            let marker = if s.heading_level > 0 {
                "#".repeat(s.heading_level as usize)
            } else {
                "-".to_string()
            };
            format!("- `{}` ({marker})", s.section_id)
        })
        .collect::<Vec<_>>()
        .join("\n");

    info!(
        iteration = iteration + 1,
        sections = section_ids.len(),
        "running holistic review"
    );

    let prompt = loop4_holistic_user(
        document,
        &editor_notes.join("\n"),
        iteration,
        max_iterations,
        &id_list,
        &valid_ids_json,
    );

    let filter = |raw: HolisticReviewResult| -> Option<HolisticReviewResult> {
        let approved: Vec<String> = raw
            .sections_approved
            .iter()
            .filter(|id| valid_ids.contains(id))
            .cloned()
            .collect();
        let flagged: Vec<String> = raw
            .sections_flagged
            .iter()
            .filter(|id| valid_ids.contains(id))
            .cloned()
            .collect();
        if approved.is_empty() && flagged.is_empty() {
            return None;
        }
        Some(HolisticReviewResult {
            flagged_reasons: raw
                .flagged_reasons
                .into_iter()
                .filter(|(id, _)| valid_ids.contains(id))
                .collect(),
            sections_approved: approved,
            sections_flagged: flagged,
            overall_coherence_score: raw.overall_coherence_score,
        })
    };

    // Tier 1: standard call
    let tier1 = context
        .gateway
        .structured::<HolisticReviewResult>(
            ModelTier::Opus,
            Some(LOOP4_HOLISTIC_SYSTEM),
            &prompt,
            &StructuredOptions::default()
                .json_schema_method()
                .with_max_tokens(8_192),
        )
        .await;
    if let Ok(raw) = tier1 {
        if let Some(result) = filter(raw) {
            return result;
        }
        debug!("tier 1 holistic review produced only invalid section ids");
    }

    // Tier 2: retry with explicit id feedback
    let retry_prompt = format!(
        "Your previous response contained section IDs that don't exist in the \
         document.\n\n## VALID SECTION IDs (copy these exactly)\n```json\n{valid_ids_json}\n```\n\n---\n\n{prompt}"
    );
    let tier2 = context
        .gateway
        .structured::<HolisticReviewResult>(
            ModelTier::Opus,
            Some(LOOP4_HOLISTIC_SYSTEM),
            &retry_prompt,
            &StructuredOptions {
                max_retries: 1,
                ..StructuredOptions::default()
                    .json_schema_method()
                    .with_max_tokens(8_192)
            },
        )
        .await;
    if let Ok(raw) = tier2 {
        if let Some(result) = filter(raw) {
            return result;
        }
        debug!("tier 2 holistic review still returned invalid ids");
    }

    // Tier 3: score-only fallback with a conservative decision rule
    warn!("full holistic schema failed, falling back to score-only review");
    match context
        .gateway
        .structured::<HolisticReviewScoreOnly>(
            ModelTier::Opus,
            Some(LOOP4_HOLISTIC_SYSTEM),
            &prompt,
            &StructuredOptions {
                max_retries: 1,
                ..StructuredOptions::default()
                    .json_schema_method()
                    .with_max_tokens(2_048)
            },
        )
        .await
    {
        Ok(score) => {
            let coherence = score.overall_coherence_score;
            if coherence < SCORE_ONLY_COHERENCE_FLOOR {
                info!(coherence, "score-only fallback: low coherence, flagging all sections");
                HolisticReviewResult {
                    sections_approved: vec![],
                    flagged_reasons: section_ids
                        .iter()
                        .map(|id| {
                            (
                                id.clone(),
                                format!("Low coherence score ({coherence:.2}) triggered full re-review"),
                            )
                        })
                        .collect(),
                    sections_flagged: section_ids,
                    overall_coherence_score: coherence,
                }
            } else {
                info!(coherence, "score-only fallback: approving all sections");
                HolisticReviewResult {
                    sections_approved: section_ids,
                    sections_flagged: vec![],
                    flagged_reasons: HashMap::new(),
                    overall_coherence_score: coherence,
                }
            }
        }
        Err(e) => {
            warn!("all holistic review attempts failed: {e}, approving all sections");
            HolisticReviewResult {
                sections_approved: section_ids,
                sections_flagged: vec![],
                flagged_reasons: HashMap::new(),
                overall_coherence_score: 0.5,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_policy_by_type() {
        assert_eq!(
            word_count_policy(SectionType::Abstract, 250),
            WordPolicy::Absolute { min: 200, max: 300 }
        );
        assert_eq!(
            word_count_policy(SectionType::Introduction, 500),
            WordPolicy::Tolerance(0.25)
        );
        assert_eq!(
            word_count_policy(SectionType::Conclusion, 500),
            WordPolicy::Tolerance(0.25)
        );
        // Content tiers by size
        assert_eq!(word_count_policy(SectionType::Content, 30), WordPolicy::Unlimited);
        assert_eq!(
            word_count_policy(SectionType::Content, 100),
            WordPolicy::Tolerance(0.50)
        );
        assert_eq!(
            word_count_policy(SectionType::Content, 200),
            WordPolicy::Tolerance(0.30)
        );
        assert_eq!(
            word_count_policy(SectionType::Content, 500),
            WordPolicy::Tolerance(0.20)
        );
        assert_eq!(
            word_count_policy(SectionType::Methodology, 500),
            WordPolicy::Tolerance(0.20)
        );
    }

    #[test]
    fn test_check_section_growth() {
        let original = "one two three four five six seven eight nine ten";
        let grown = format!("{original} eleven twelve");
        let (within, growth) = check_section_growth(original, &grown, 0.25);
        assert!(within);
        assert!((growth - 0.2).abs() < 1e-9);

        let (within, growth) = check_section_growth(original, "one two", 0.25);
        assert!(!within);
        assert!(growth < -0.7);
    }

    #[test]
    fn test_reassemble_initial_iteration_preserves_order() {
        let sections = split_into_sections(
            "## A\n\nfirst\n\n## B\n\nsecond\n\n## C\n\nthird",
            DEFAULT_SECTION_TOKENS,
        );
        let mut results = HashMap::new();
        results.insert(
            "b".to_string(),
            SectionEditResult {
                section_id: "b".to_string(),
                edited_content: "## B\n\nsecond (edited)".to_string(),
                notes: String::new(),
                new_paper_todos: vec![],
                confidence: 0.9,
            },
        );

        let rebuilt = reassemble("", &sections, &results, 0);
        let a_pos = rebuilt.find("## A").unwrap();
        let b_pos = rebuilt.find("## B").unwrap();
        let c_pos = rebuilt.find("## C").unwrap();
        assert!(a_pos < b_pos && b_pos < c_pos);
        assert!(rebuilt.contains("second (edited)"));
        assert!(rebuilt.contains("first"));
    }

    #[test]
    fn test_reassemble_later_iteration_splices_by_line() {
        let document = "## A\n\nfirst\n\n## B\n\nsecond\n\n## C\n\nthird";
        let sections = split_into_sections(document, DEFAULT_SECTION_TOKENS);
        let flagged: Vec<SectionInfo> = sections
            .iter()
            .filter(|s| s.section_id == "b")
            .cloned()
            .collect();

        let mut results = HashMap::new();
        results.insert(
            "b".to_string(),
            SectionEditResult {
                section_id: "b".to_string(),
                edited_content: "## B\n\nsecond, improved".to_string(),
                notes: String::new(),
                new_paper_todos: vec![],
                confidence: 0.9,
            },
        );

        let rebuilt = reassemble(document, &flagged, &results, 1);
        assert!(rebuilt.contains("second, improved"));
        assert!(rebuilt.contains("## A\n\nfirst"));
        assert!(rebuilt.contains("## C\n\nthird"));
        assert!(!rebuilt.contains("\nsecond\n"));
    }
}
