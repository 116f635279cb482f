//! Loop 5: fact and reference check
//!
//! Sequential passes over each section: a fact pass and a reference pass,
//! both emitting find/replace edits validated against an exactly-once
//! rule. After application, every citation key is verified against the
//! bibliographic system; invalid keys get an LLM fix first (substitute a
//! verified key, drop the citation, or rewrite the claim) and are stripped
//! only if that fails. Flagged claims are filtered against corpus-gap
//! patterns, surviving items verified in batches, and any remaining TODO
//! markers stripped at finalize.

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info, warn};

use thala_core::llm::{
    AgentBudget, ChatMessage, ModelTier, StructuredOptions, SystemBlock, Tool,
    estimate_tokens_fast, run_tool_agent, select_checking_tier,
};

use super::ReviewContext;
use super::prompts::{
    CITATION_RESOLUTION_SYSTEM, LOOP5_FACT_CHECK_SYSTEM, LOOP5_REF_CHECK_SYSTEM,
    TODO_VERIFICATION_SYSTEM, citation_resolution_user, loop5_fact_check_user,
    loop5_ref_check_user, todo_verification_user,
};
use super::sections::{DEFAULT_SECTION_TOKENS, split_into_sections};
use super::tools::{FactCheckTool, paper_tools};
use super::types::{CitationResolutionResult, DocumentEdits, TodoVerificationResult};
use crate::citations::{
    apply_edits, extract_citation_keys, strip_todo_markers, validate_citations_against_bib,
    validate_edits,
};

/// Tool budget per checking pass
const CHECK_TOOL_CALLS: usize = 12;
const CHECK_TOOL_CHARS: usize = 100_000;
/// Items per TODO-verification batch
const TODO_VERIFY_BATCH: usize = 30;
/// Excerpt radius around an invalid citation
const EXCERPT_RADIUS: usize = 200;

/// Flagged items matching these reflect corpus gaps, not real problems.
const FALSE_POSITIVE_PATTERNS: &[&str] = &[
    "unable to verify",
    "cannot verify",
    "could not verify",
    "no information found",
    "paper content is not available",
    "source documents unavailable",
    "cannot be verified against",
    "provided paper summaries",
    "not in provided papers",
    "provided summaries do not contain",
    "corpus does not contain",
    "not found in provided papers",
    "not in the reviewed literature",
    "not in our corpus",
    "sources unavailable",
    "no papers in corpus",
    "paper not in corpus",
    "not in paper summaries",
    "not available in provided",
    "insufficient detail in",
    "limited information",
    "exact wording not verified",
    "precise statistics unavailable",
    "specific numbers not confirmed",
    "detailed data not in summaries",
];

/// Standard methodological phrasing that needs no human review.
const METHODOLOGICAL_INDICATORS: &[&str] = &[
    "we used",
    "we employed",
    "we selected",
    "we chose",
    "this study used",
    "the approach",
    "methodology",
    "research design",
    "data collection",
    "sample size",
    "we analyzed",
    "we examined",
    "we investigated",
    "the authors",
    "researchers typically",
    "standard practice",
];

/// Result of the fact/reference loop.
#[derive(Debug, Clone)]
pub struct FactCheckLoopResult {
    pub current_review: String,
    pub changes_summary: String,
    pub human_review_items: Vec<String>,
    pub edits_applied: usize,
    pub edits_rejected: usize,
    pub discarded_items: Vec<String>,
}

/// Partition flagged claims into keepers and discards.
pub fn filter_ambiguous_claims(claims: &[String]) -> (Vec<String>, Vec<String>) {
    let mut kept = Vec::new();
    let mut discarded = Vec::new();

    for claim in claims {
        let lower = claim.to_lowercase();
        if FALSE_POSITIVE_PATTERNS.iter().any(|p| lower.contains(p)) {
            debug!("filtered corpus-gap claim");
            discarded.push(format!("Pre-filtered (corpus gap): {claim}"));
        } else if METHODOLOGICAL_INDICATORS.iter().any(|p| lower.contains(p)) {
            debug!("filtered methodological claim");
            discarded.push(format!("Pre-filtered (methodological): {claim}"));
        } else {
            kept.push(claim.clone());
        }
    }
    (kept, discarded)
}

/// Run the fact-and-reference loop.
pub async fn run_factcheck_loop(context: &ReviewContext, review: &str) -> FactCheckLoopResult {
    let mut current_review = review.to_string();
    let sections = split_into_sections(&current_review, DEFAULT_SECTION_TOKENS);
    info!(sections = sections.len(), "starting fact and reference checking");

    let mut tools = paper_tools(
        context.stores.clone(),
        context.store_query.clone(),
        context.corpus.clone(),
    );
    if let Some(web) = &context.web {
        tools.push(Arc::new(FactCheckTool::new(web.clone())));
    }

    // ---- sequential fact + reference passes ----
    let mut all_edits = Vec::new();
    let mut ambiguous_claims: Vec<String> = Vec::new();
    let mut unaddressed_todos: Vec<String> = Vec::new();

    for section in &sections {
        let fact = check_section(
            context,
            &tools,
            LOOP5_FACT_CHECK_SYSTEM,
            &loop5_fact_check_user(&section.section_content),
        )
        .await;
        if let Some(result) = fact {
            all_edits.extend(result.edits);
            ambiguous_claims.extend(result.ambiguous_claims);
            unaddressed_todos.extend(result.unaddressed_todos);
        }

        let cited = extract_citation_keys(&section.section_content);
        let citation_keys = if cited.is_empty() {
            "None".to_string()
        } else {
            let mut keys: Vec<String> = cited.iter().map(|k| format!("[@{k}]")).collect();
            keys.sort();
            keys.join(", ")
        };
        let reference = check_section(
            context,
            &tools,
            LOOP5_REF_CHECK_SYSTEM,
            &loop5_ref_check_user(&section.section_content, &citation_keys),
        )
        .await;
        if let Some(result) = reference {
            all_edits.extend(result.edits);
            ambiguous_claims.extend(result.ambiguous_claims);
            unaddressed_todos.extend(result.unaddressed_todos);
        }
    }

    info!(
        edits = all_edits.len(),
        ambiguous = ambiguous_claims.len(),
        "checking passes complete"
    );

    // ---- validate and apply edits ----
    let validation = validate_edits(&current_review, &all_edits);
    let mut human_review_items: Vec<String> = validation
        .invalid
        .iter()
        .map(|(edit, reason)| {
            format!(
                "Invalid edit ({reason}): '{}' -> '{}'",
                edit.find.chars().take(50).collect::<String>(),
                edit.replace.chars().take(50).collect::<String>(),
            )
        })
        .collect();
    let edits_applied = validation.valid.len();
    let edits_rejected = validation.invalid.len();
    current_review = apply_edits(&current_review, &validation.valid);

    // ---- citation verification and resolution ----
    let corpus_keys = context.corpus.key_set();
    let (_, invalid_keys) =
        validate_citations_against_bib(&current_review, &context.stores.zotero, &corpus_keys)
            .await;

    if !invalid_keys.is_empty() {
        info!(count = invalid_keys.len(), "resolving invalid citations");
        current_review = resolve_invalid_citations(context, &current_review, &invalid_keys).await;
    }

    // ---- flag issues for human review ----
    let (kept_claims, mut discarded_items) = filter_ambiguous_claims(&ambiguous_claims);
    human_review_items.extend(kept_claims.into_iter().map(|c| format!("Ambiguous claim: {c}")));

    for todo in &unaddressed_todos {
        let lower = todo.to_lowercase();
        if FALSE_POSITIVE_PATTERNS.iter().any(|p| lower.contains(p)) {
            discarded_items.push(format!("Pre-filtered TODO (corpus gap): {todo}"));
        } else {
            human_review_items.push(format!("Unaddressed TODO: {todo}"));
        }
    }

    if !human_review_items.is_empty() {
        let (kept, discarded) = verify_review_items(context, &human_review_items).await;
        human_review_items = kept;
        discarded_items.extend(discarded);
    }

    // ---- finalize: strip surviving TODO markers ----
    let (stripped_review, stripped_count) = strip_todo_markers(&current_review);
    if stripped_count > 0 {
        warn!(count = stripped_count, "stripping unresolved TODO markers");
    }
    current_review = stripped_review;

    let mut summary_parts = Vec::new();
    if edits_applied > 0 {
        summary_parts.push(format!("{edits_applied} edits applied"));
    }
    if edits_rejected > 0 {
        summary_parts.push(format!("{edits_rejected} edits rejected"));
    }
    if !human_review_items.is_empty() {
        summary_parts.push(format!("{} items flagged for review", human_review_items.len()));
    }
    let changes_summary = if summary_parts.is_empty() {
        "No changes".to_string()
    } else {
        summary_parts.join("; ")
    };
    info!("fact and reference checking complete: {changes_summary}");

    FactCheckLoopResult {
        current_review,
        changes_summary,
        human_review_items,
        edits_applied,
        edits_rejected,
        discarded_items,
    }
}

/// One checking pass over one section, tier selected by estimated tokens.
async fn check_section(
    context: &ReviewContext,
    tools: &[Arc<dyn Tool>],
    system: &str,
    prompt: &str,
) -> Option<DocumentEdits> {
    let estimated = estimate_tokens_fast(prompt, true) + estimate_tokens_fast(system, true);
    let tier = select_checking_tier(estimated);
    debug!(estimated, tier = %tier, "checking section");

    match run_tool_agent::<DocumentEdits>(
        context.gateway.client(),
        tier,
        vec![SystemBlock::cached(system)],
        vec![ChatMessage::user(prompt.to_string())],
        tools,
        AgentBudget::new(CHECK_TOOL_CALLS, CHECK_TOOL_CHARS),
        4_096,
    )
    .await
    {
        Ok(result) => Some(result),
        Err(e) => {
            warn!("checking pass failed: {e}");
            None
        }
    }
}

/// Fix invalid citations: LLM first, strip what remains.
async fn resolve_invalid_citations(
    context: &ReviewContext,
    document: &str,
    invalid_keys: &HashSet<String>,
) -> String {
    // Excerpts around each invalid citation give the fixer its targets
    let mut excerpts: Vec<String> = Vec::new();
    for key in invalid_keys {
        let pattern = format!(
            r"(?s).{{0,{radius}}}\[@{key}\].{{0,{radius}}}",
            radius = EXCERPT_RADIUS,
            key = regex::escape(key),
        );
        if let Ok(re) = Regex::new(&pattern) {
            excerpts.extend(
                re.find_iter(document)
                    .take(2)
                    .map(|m| m.as_str().to_string()),
            );
        }
    }

    let mut updated = document.to_string();

    if !excerpts.is_empty() {
        let invalid_list = {
            let mut keys: Vec<String> =
                invalid_keys.iter().map(|k| format!("[@{k}]")).collect();
            keys.sort();
            keys.join(", ")
        };
        let excerpt_text = excerpts
            .iter()
            .take(10)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");

        let tools = paper_tools(
            context.stores.clone(),
            context.store_query.clone(),
            context.corpus.clone(),
        );
        let resolution = run_tool_agent::<CitationResolutionResult>(
            context.gateway.client(),
            ModelTier::Sonnet,
            vec![SystemBlock::cached(CITATION_RESOLUTION_SYSTEM)],
            vec![ChatMessage::user(citation_resolution_user(
                &invalid_list,
                &excerpt_text,
                &context.topic,
            ))],
            &tools,
            AgentBudget::default(),
            4_096,
        )
        .await;

        match resolution {
            Ok(resolution) => {
                let mut applied = 0usize;
                for fix in &resolution.fixes {
                    if let Some(position) = updated.find(&fix.original_text) {
                        updated.replace_range(
                            position..position + fix.original_text.len(),
                            &fix.replacement_text,
                        );
                        applied += 1;
                    } else {
                        warn!("citation fix target not found in document");
                    }
                }
                info!(applied, total = resolution.fixes.len(), "applied citation fixes");
            }
            Err(e) => warn!("citation resolution failed: {e}"),
        }
    }

    // Whatever the fixer left behind gets stripped
    for key in invalid_keys {
        let marker = format!("[@{key}]");
        if updated.contains(&marker) {
            warn!(key, "stripping unfixed invalid citation");
            updated = updated.replace(&marker, "");
        }
    }
    updated
}

/// Batch-verify flagged items: genuine problems stay, noise goes.
async fn verify_review_items(
    context: &ReviewContext,
    items: &[String],
) -> (Vec<String>, Vec<String>) {
    let mut kept = Vec::new();
    let mut discarded = Vec::new();

    let batches: Vec<(String, String)> = items
        .chunks(TODO_VERIFY_BATCH)
        .enumerate()
        .map(|(i, chunk)| {
            (
                format!("batch-{i}"),
                todo_verification_user(chunk, &context.topic),
            )
        })
        .collect();

    debug!(batches = batches.len(), items = items.len(), "verifying flagged items");
    let results = context
        .gateway
        .structured_batch::<TodoVerificationResult>(
            ModelTier::Opus,
            Some(TODO_VERIFICATION_SYSTEM),
            batches,
            &StructuredOptions::default()
                .json_schema_method()
                .with_max_tokens(4_096),
        )
        .await;

    let mut any_failure = false;
    for (id, result) in results {
        match result {
            Ok(verdict) => {
                kept.extend(verdict.keep);
                discarded.extend(verdict.discard);
            }
            Err(e) => {
                warn!(batch = id, "item verification failed: {e}");
                any_failure = true;
            }
        }
    }
    if any_failure && kept.is_empty() && discarded.is_empty() {
        // Verification entirely unavailable: keep everything for humans
        return (items.to_vec(), vec![]);
    }

    debug!(kept = kept.len(), discarded = discarded.len(), "item verification complete");
    (kept, discarded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_ambiguous_claims() {
        let claims = vec![
            "The 1997 study reported a 40% improvement, which conflicts with the 2003 replication".to_string(),
            "Unable to verify against provided paper summaries".to_string(),
            "We used a standard sample size calculation".to_string(),
        ];
        let (kept, discarded) = filter_ambiguous_claims(&claims);
        assert_eq!(kept.len(), 1);
        assert!(kept[0].contains("1997 study"));
        assert_eq!(discarded.len(), 2);
        assert!(discarded[0].contains("corpus gap"));
        assert!(discarded[1].contains("methodological"));
    }

    #[test]
    fn test_filter_keeps_substantive_claims() {
        let claims =
            vec!["The attribution of this theory to Smith appears to be incorrect".to_string()];
        let (kept, discarded) = filter_ambiguous_claims(&claims);
        assert_eq!(kept.len(), 1);
        assert!(discarded.is_empty());
    }
}
