//! Prompts for the review loops
//!
//! System prompts are stable constants so the gateway can mark them for
//! prompt caching; user prompts are built per call.

// ============================================================================
// LOOP 1 - THEORETICAL DEPTH
// ============================================================================

pub const LOOP1_SUPERVISOR_SYSTEM: &str = "\
You are a research supervisor deepening the theoretical grounding of an \
academic literature review. Each turn you choose exactly one action:

- conduct_research: pose up to 3 focused questions that would close the \
most important theoretical gaps
- refine_draft: rewrite the review text to integrate findings gathered so \
far, listing the gaps that remain
- check_fact: name one specific claim whose accuracy you doubt
- research_complete: the theoretical grounding is sufficient

Prefer depth over breadth: one well-posed question beats three vague ones. \
Declare research_complete only when the remaining gaps are cosmetic.";

pub fn loop1_supervisor_user(
    review: &str,
    topic: &str,
    research_questions: &[String],
    findings: &[String],
    gaps: &[String],
    iteration: usize,
    max_iterations: usize,
    completeness: f64,
) -> String {
    let questions = bullet_list(research_questions);
    let findings_text = if findings.is_empty() {
        "None yet".to_string()
    } else {
        bullet_list(findings)
    };
    let gaps_text = if gaps.is_empty() {
        "None recorded".to_string()
    } else {
        bullet_list(gaps)
    };
    format!(
        "## Topic\n{topic}\n\n## Research questions\n{questions}\n\n\
         ## Findings so far\n{findings_text}\n\n## Known gaps\n{gaps_text}\n\n\
         ## Progress\nIteration {it} of {max}; completeness {completeness:.0}%\n\n\
         ## Current review\n{review}\n\n\
         Choose your next action.",
        it = iteration + 1,
        max = max_iterations,
        completeness = completeness * 100.0,
    )
}

// ============================================================================
// LOOP 2 - LITERATURE BASE EXPANSION
// ============================================================================

pub const LOOP2_ANALYZER_SYSTEM: &str = "\
You are analyzing an academic literature review for missing literature \
bases: whole bodies of scholarship the review should engage with but does \
not. A literature base is a coherent research tradition (a theory, a \
methodology community, an adjacent field), not a single missing paper.

If a base is missing, return expand_base with its name, 2-4 search queries \
that would retrieve its core works, and a concrete integration strategy. \
If the review's coverage is adequate, return complete.";

pub fn loop2_analyzer_user(
    review: &str,
    topic: &str,
    research_questions: &[String],
    explored_bases: &[String],
    iteration: usize,
    max_iterations: usize,
) -> String {
    let explored = if explored_bases.is_empty() {
        "None yet".to_string()
    } else {
        bullet_list(explored_bases)
    };
    format!(
        "## Topic\n{topic}\n\n## Research questions\n{questions}\n\n\
         ## Already explored bases\n{explored}\n\n\
         ## Iteration\n{it} of {max}\n\n## Review\n{review}",
        questions = bullet_list(research_questions),
        it = iteration + 1,
        max = max_iterations,
    )
}

pub const LOOP2_INTEGRATOR_SYSTEM: &str = "\
You are integrating findings from a focused mini-review into a larger \
literature review. Follow the declared integration strategy. Preserve the \
existing argument structure and every existing citation; weave the new \
material in with [@KEY] citations drawn only from the provided key list. \
Return the complete updated review and nothing else.";

pub fn loop2_integrator_user(
    current_review: &str,
    base_name: &str,
    mini_review: &str,
    integration_strategy: &str,
    new_citation_keys: &str,
) -> String {
    format!(
        "## Literature base\n{base_name}\n\n## Integration strategy\n{integration_strategy}\n\n\
         ## New citation keys available\n{new_citation_keys}\n\n\
         ## Mini-review findings\n{mini_review}\n\n## Current review\n{current_review}"
    )
}

// ============================================================================
// LOOP 3 - STRUCTURE & COHESION
// ============================================================================

pub const LOOP3_PHASE_A_SYSTEM: &str = "\
You are diagnosing structural problems in an academic literature review. \
The document is shown with numbered paragraphs (P1, P2, ...). Identify \
issues only; do not propose text. For each issue give: a numeric issue_id, \
its type (redundancy, missing_transition, misplaced_content, split_needed, \
ordering, missing_framing), severity, the affected paragraph numbers, a \
suggested resolution (rewrite, move, split, merge, add), and a one-sentence \
description. Set needs_restructuring only when issues materially harm the \
document.";

pub fn loop3_phase_a_user(
    numbered_document: &str,
    topic: &str,
    iteration: usize,
    max_iterations: usize,
) -> String {
    format!(
        "## Topic\n{topic}\n\n## Iteration\n{it} of {max}\n\n\
         ## Document (numbered paragraphs)\n{numbered_document}",
        it = iteration + 1,
        max = max_iterations,
    )
}

pub const SECTION_REWRITE_SYSTEM: &str = "\
You are rewriting a section of an academic literature review to fix one \
specific structural issue. Rewrite only the section shown between the \
context blocks; the context is read-only. Keep every [@KEY] citation that \
appears in the section. Return only the rewritten section text, with \
paragraphs separated by blank lines.";

pub fn section_rewrite_user(
    issue: &super::types::StructuralIssue,
    context_before: &str,
    section_content: &str,
    context_after: &str,
) -> String {
    let paragraphs = issue
        .affected_paragraphs
        .iter()
        .map(|p| format!("P{p}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "## Issue {id} ({issue_type:?}, severity {severity})\n{description}\n\
         Suggested resolution: {resolution:?}\nAffected paragraphs: {paragraphs}\n\n\
         ## Context before (read-only)\n{before}\n\n\
         ## Section to rewrite\n{section}\n\n\
         ## Context after (read-only)\n{after}",
        id = issue.issue_id,
        issue_type = issue.issue_type,
        severity = issue.severity,
        description = issue.description,
        resolution = issue.suggested_resolution,
        before = if context_before.is_empty() {
            "(Start of document)"
        } else {
            context_before
        },
        section = section_content,
        after = if context_after.is_empty() {
            "(End of document)"
        } else {
            context_after
        },
    )
}

pub const REWRITE_SUMMARY_SYSTEM: &str =
    "Summarize in one or two sentences what changed between the original and \
     rewritten section, for an audit log. Mention structure, not wording.";

pub fn rewrite_summary_user(original: &str, rewritten: &str, issue_description: &str) -> String {
    format!(
        "## Issue\n{issue_description}\n\n## Original (truncated)\n{original}\n\n\
         ## Rewritten (truncated)\n{rewritten}",
        original = truncate(original, 2000),
        rewritten = truncate(rewritten, 2000),
    )
}

pub const LOOP3_VERIFIER_SYSTEM: &str = "\
You are verifying that structural edits to a literature review resolved \
the issues they targeted without introducing regressions. Score overall \
coherence from 0.0 to 1.0, list which original issues are resolved and \
which remain, list any regressions the edits introduced, and say whether \
another editing iteration is needed.";

pub fn loop3_verifier_user(
    original_issues: &str,
    applied_changes: &str,
    current_document: &str,
    iteration: usize,
    max_iterations: usize,
) -> String {
    format!(
        "## Issues identified before editing\n{original_issues}\n\n\
         ## Changes applied\n{applied_changes}\n\n\
         ## Iteration\n{it} of {max}\n\n\
         ## Current document (truncated)\n{document}",
        it = iteration + 1,
        max = max_iterations,
        document = truncate(current_document, 15_000),
    )
}

// ============================================================================
// LOOP 4 - SECTION EDITING
// ============================================================================

pub const LOOP4_CONTENT_EDITOR_SYSTEM: &str = "\
You are deep-editing one section of an academic literature review. Improve \
precision, argumentation and engagement with the cited literature. Use the \
search_papers and get_paper_content tools when you need evidence beyond the \
provided summaries. Cite only with [@KEY] keys from the provided list or \
verified through search_papers; never invent keys. Where the corpus lacks a \
needed source, insert <!-- TODO: ... --> describing it and list the topic \
in new_paper_todos. Keep the section's word count close to the original.";

pub const LOOP4_ABSTRACT_EDITOR_SYSTEM: &str = "\
You are editing the abstract of an academic literature review. The abstract \
must be 200-300 words, self-contained, and cover motivation, scope, method \
of synthesis, and principal conclusions. No citations in the abstract.";

pub const LOOP4_FRAMING_EDITOR_SYSTEM: &str = "\
You are editing a framing section (introduction or conclusion) of an \
academic literature review. Preserve its function: the introduction frames \
scope and stakes, the conclusion synthesizes and points forward. Keep \
length within a quarter of the original, keep every valid [@KEY] citation.";

pub fn loop4_content_editor_user(
    section_id: &str,
    section_content: &str,
    context_window: &str,
    paper_summaries: &str,
    available_citation_keys: &str,
    todos_in_section: &str,
) -> String {
    format!(
        "## Section id\n{section_id}\n\n## Surrounding context (read-only)\n{context_window}\n\n\
         ## Paper summaries for cited works\n{paper_summaries}\n\n\
         ## {available_citation_keys}\n\n\
         ## Open TODOs in this section\n{todos_in_section}\n\n\
         ## Section to edit\n{section_content}"
    )
}

pub fn loop4_abstract_editor_user(
    section_content: &str,
    context_window: &str,
    word_count: usize,
) -> String {
    format!(
        "## Current abstract ({word_count} words)\n{section_content}\n\n\
         ## Surrounding context (read-only)\n{context_window}"
    )
}

pub const LOOP4_HOLISTIC_SYSTEM: &str = "\
You are reviewing an edited literature review as a whole. Judge whether the \
sections still read as one coherent document: consistent terminology, no \
duplicated framing, sound transitions. Approve sections that hold up; flag \
sections that need re-editing, with a reason each. Use the EXACT section id \
strings provided. Score overall coherence 0.0-1.0.";

pub fn loop4_holistic_user(
    document: &str,
    editor_notes: &str,
    iteration: usize,
    max_iterations: usize,
    section_id_list: &str,
    valid_ids_json: &str,
) -> String {
    format!(
        "## Iteration\n{it} of {max}\n\n## Section ids (use these exactly)\n{section_id_list}\n\n\
         ## Valid id strings\n```json\n{valid_ids_json}\n```\n\n\
         ## Editor notes\n{editor_notes}\n\n## Document\n{document}",
        it = iteration + 1,
        max = max_iterations,
    )
}

pub const TODO_RESOLUTION_SYSTEM: &str = "\
You are resolving a TODO marker left in a literature review. Use \
search_papers and get_paper_content to find corpus support, and check_fact \
for claims needing web verification. If you can resolve it, return \
resolved=true with replacement text (which may be an empty string when the \
marker should simply be dropped). If the TODO marks a genuine gap that \
needs a human, return resolved=false with your reasoning.";

pub fn todo_resolution_user(todo: &str, context: &str) -> String {
    format!("## TODO marker\n{todo}\n\n## Surrounding text\n{context}")
}

// ============================================================================
// LOOP 4.5 - COHESION GATE
// ============================================================================

pub const LOOP4_5_COHESION_SYSTEM: &str = "\
You are checking whether a round of parallel section editing left an \
academic document structurally incoherent: duplicated framing, sections \
that no longer connect, argument order broken. Minor style drift does not \
count. Answer with needs_restructuring and your reasoning.";

pub fn loop4_5_cohesion_user(document: &str) -> String {
    format!("## Document\n{document}")
}

// ============================================================================
// LOOP 5 - FACT & REFERENCE CHECK
// ============================================================================

pub const LOOP5_FACT_CHECK_SYSTEM: &str = "\
You are fact-checking one section of an academic literature review against \
its cited sources and the web. Use get_paper_content to verify claims \
attributed to corpus papers and check_fact for external claims. Return \
find/replace edits for errors you can correct with confidence; the find \
string must be copied exactly and be unique within the section. Claims you \
cannot settle go in ambiguous_claims. Do not rewrite for style.";

pub fn loop5_fact_check_user(section_content: &str) -> String {
    format!("## Section\n{section_content}")
}

pub const LOOP5_REF_CHECK_SYSTEM: &str = "\
You are checking the citations of one section of a literature review. For \
each [@KEY]: does the cited paper actually support the claim it anchors? \
Use search_papers and get_paper_content to verify. Return find/replace \
edits (edit_type citation_fix) for citations that should move, change or \
disappear; the find string must be exact and unique. List leftover \
<!-- TODO --> markers you could not address in unaddressed_todos.";

pub fn loop5_ref_check_user(section_content: &str, citation_keys: &str) -> String {
    format!("## Citations present\n{citation_keys}\n\n## Section\n{section_content}")
}

pub const CITATION_RESOLUTION_SYSTEM: &str = "\
You are fixing invalid citations in an academic literature review. Every \
key you are given does NOT exist in the bibliographic system. For each \
occurrence: find a valid replacement via search_papers (verify support \
with get_paper_content), or remove the citation if the claim stands \
without it, or rewrite the claim if nothing supports it. Return fixes as \
original_text/replacement_text pairs where original_text is copied exactly \
(50-150 chars, unique). Never leave an invalid key and never add a TODO.";

pub fn citation_resolution_user(invalid_keys: &str, document_excerpt: &str, topic: &str) -> String {
    format!(
        "## Invalid citation keys\n{invalid_keys}\n\n## Topic\n{topic}\n\n\
         ## Document excerpts\n{document_excerpt}"
    )
}

pub const TODO_VERIFICATION_SYSTEM: &str = "\
You are triaging review items flagged during fact checking. Keep items a \
human must act on: unresolved factual disputes, missing essential sources, \
structural problems. Discard items that only reflect corpus gaps (\"not in \
provided papers\") or standard methodological phrasing. Return the kept and \
discarded items verbatim.";

pub fn todo_verification_user(items: &[String], topic: &str) -> String {
    format!(
        "## Topic\n{topic}\n\n## Flagged items\n{items}",
        items = bullet_list(items)
    )
}

// ============================================================================
// HELPERS
// ============================================================================

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
