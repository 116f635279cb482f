//! Loop 1: theoretical depth
//!
//! A supervisor/researcher pattern: one Opus decision per iteration chooses
//! between dispatching researcher agents at open questions, refining the
//! draft with gathered findings, spot-checking a doubtful claim, or
//! declaring the grounding sufficient. Completeness is a multi-signal
//! score over finding coverage, iteration progress and remaining gaps.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use thala_core::llm::{
    AgentBudget, ChatMessage, ModelTier, StructuredOptions, StructuredSchema, SystemBlock, Tool,
    run_tool_agent,
};

use super::ReviewContext;
use super::prompts::{LOOP1_SUPERVISOR_SYSTEM, loop1_supervisor_user};
use super::tools::{FactCheckTool, paper_tools};
use super::types::{LoopFailure, MAX_CONSECUTIVE_FAILURES, SupervisorDecision};

/// Researcher agents dispatched per conduct_research decision
const MAX_CONCURRENT_RESEARCHERS: usize = 3;
/// Tool budget per researcher
const RESEARCHER_TOOL_CALLS: usize = 8;
const RESEARCHER_TOOL_CHARS: usize = 60_000;

/// One researcher's answer to a question.
#[derive(Debug, Clone, Deserialize)]
pub struct ResearchFinding {
    pub answer: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl StructuredSchema for ResearchFinding {
    fn schema_name() -> &'static str {
        "ResearchFinding"
    }

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "answer": {"type": "string"},
                "key_points": {"type": "array", "items": {"type": "string"}},
                "sources": {"type": "array", "items": {"type": "string"}},
            },
            "required": ["answer"],
        })
    }
}

/// Result of the theoretical-depth loop.
#[derive(Debug, Clone)]
pub struct TheoryLoopResult {
    pub current_review: String,
    pub issues_explored: Vec<String>,
    pub changes_summary: String,
    pub errors: Vec<LoopFailure>,
}

/// Multi-signal completeness estimate.
pub fn calculate_completeness(
    finding_count: usize,
    question_count: usize,
    iteration: usize,
    max_iterations: usize,
    gaps_remaining: usize,
) -> f64 {
    let coverage = (finding_count as f64 / (question_count.max(1) * 2) as f64).min(1.0);
    let progress = iteration as f64 / max_iterations.max(1) as f64;
    let gap_penalty = (gaps_remaining as f64 * 0.1).min(0.5);
    (0.5 * coverage + 0.5 * progress - gap_penalty).clamp(0.0, 1.0)
}

/// Run the theoretical-depth loop over a review.
pub async fn run_theory_loop(
    context: &ReviewContext,
    review: &str,
    max_iterations: usize,
) -> TheoryLoopResult {
    let mut current_review = review.to_string();
    let mut findings: Vec<String> = Vec::new();
    let mut gaps: Vec<String> = Vec::new();
    let mut issues_explored: Vec<String> = Vec::new();
    let mut errors: Vec<LoopFailure> = Vec::new();
    let mut consecutive_failures = 0usize;
    let mut completeness = 0.0;

    info!(max_iterations, "starting theoretical-depth loop");

    for iteration in 0..max_iterations {
        let prompt = loop1_supervisor_user(
            &current_review,
            &context.topic,
            &context.research_questions,
            &findings,
            &gaps,
            iteration,
            max_iterations,
            completeness,
        );

        let decision = context
            .gateway
            .structured::<SupervisorDecision>(
                ModelTier::Opus,
                Some(LOOP1_SUPERVISOR_SYSTEM),
                &prompt,
                &StructuredOptions::default()
                    .json_schema_method()
                    .with_thinking(6_000)
                    .with_max_tokens(16_384),
            )
            .await;

        let decision = match decision {
            Ok(decision) => {
                consecutive_failures = 0;
                decision
            }
            Err(e) => {
                warn!(iteration, "supervisor decision failed: {e}");
                errors.push(LoopFailure {
                    loop_number: 1,
                    iteration,
                    node_name: "supervisor".to_string(),
                    error_type: "structured_output".to_string(),
                    error_message: e.to_string(),
                    recoverable: true,
                });
                consecutive_failures += 1;
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    warn!("persistent supervisor failure, finalizing loop 1");
                    break;
                }
                continue;
            }
        };

        match decision {
            SupervisorDecision::ConductResearch { questions } => {
                let questions: Vec<String> =
                    questions.into_iter().take(MAX_CONCURRENT_RESEARCHERS).collect();
                info!(count = questions.len(), "supervisor: conduct_research");
                issues_explored.extend(questions.iter().cloned());

                let new_findings = run_researchers(context, &questions).await;
                findings.extend(new_findings);
            }
            SupervisorDecision::RefineDraft { updates, gaps: new_gaps } => {
                info!(gaps = new_gaps.len(), "supervisor: refine_draft");
                if !updates.trim().is_empty() {
                    current_review = updates;
                }
                gaps = new_gaps;
            }
            SupervisorDecision::CheckFact { claim } => {
                info!("supervisor: check_fact");
                match &context.web {
                    Some(web) => {
                        let outcome = web.check_fact(&claim, Some(&context.topic)).await;
                        findings.push(format!(
                            "Fact check [{}, confidence {:.2}]: {} - {}",
                            outcome.verdict.as_str(),
                            outcome.confidence,
                            claim,
                            outcome.explanation,
                        ));
                    }
                    None => {
                        warn!("check_fact requested but no web client configured");
                        findings.push(format!("Fact check unavailable for: {claim}"));
                    }
                }
            }
            SupervisorDecision::ResearchComplete => {
                info!("supervisor: research_complete");
                break;
            }
        }

        completeness = calculate_completeness(
            findings.len(),
            context.research_questions.len(),
            iteration + 1,
            max_iterations,
            gaps.len(),
        );
    }

    let changes_summary = format!(
        "Explored {} questions, gathered {} findings, {} gaps remaining",
        issues_explored.len(),
        findings.len(),
        gaps.len(),
    );
    info!("loop 1 complete: {changes_summary}");

    TheoryLoopResult {
        current_review,
        issues_explored,
        changes_summary,
        errors,
    }
}

/// Dispatch researcher agents at the supervisor's questions, bounded.
async fn run_researchers(context: &ReviewContext, questions: &[String]) -> Vec<String> {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_RESEARCHERS));

    let mut tools: Vec<Arc<dyn Tool>> = paper_tools(
        context.stores.clone(),
        context.store_query.clone(),
        context.corpus.clone(),
    );
    if let Some(web) = &context.web {
        tools.push(Arc::new(FactCheckTool::new(web.clone())));
    }
    let tools = Arc::new(tools);

    let tasks = questions.iter().map(|question| {
        let semaphore = semaphore.clone();
        let tools = tools.clone();
        async move {
            let _permit = semaphore.acquire().await.expect("semaphore never closed");

            let result = run_tool_agent::<ResearchFinding>(
                context.gateway.client(),
                ModelTier::Sonnet,
                vec![SystemBlock::cached(
                    "You are a researcher answering one focused question using the \
                     available paper corpus and fact-check tools. Ground every \
                     statement in a source.",
                )],
                vec![ChatMessage::user(format!("Research question: {question}"))],
                &tools,
                AgentBudget::new(RESEARCHER_TOOL_CALLS, RESEARCHER_TOOL_CHARS),
                4_096,
            )
            .await;

            match result {
                Ok(finding) => Some(format!("Q: {question}\nA: {}", finding.answer)),
                Err(e) => {
                    warn!(question, "researcher failed: {e}");
                    None
                }
            }
        }
    });

    futures::future::join_all(tasks)
        .await
        .into_iter()
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completeness_signals() {
        // No findings, first iteration: low
        let early = calculate_completeness(0, 3, 0, 5, 0);
        assert!(early < 0.1);

        // Full coverage near the end: high
        let late = calculate_completeness(6, 3, 4, 5, 0);
        assert!(late > 0.8);

        // Gaps pull the score down
        let gapped = calculate_completeness(6, 3, 4, 5, 3);
        assert!(gapped < late);

        // Always clamped
        assert!(calculate_completeness(100, 1, 10, 5, 0) <= 1.0);
        assert!(calculate_completeness(0, 5, 0, 5, 20) >= 0.0);
    }
}
