//! Loop 2: literature base expansion
//!
//! Per iteration: an analyzer decides whether a whole literature base is
//! missing; a mini-review runs for that base with a reduced quality
//! preset; an integrator splices its findings into the review following
//! the declared strategy. Two consecutive failures finalize the loop.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{info, warn};

use thala_core::llm::{ModelTier, StructuredOptions};

use super::ReviewContext;
use super::prompts::{
    LOOP2_ANALYZER_SYSTEM, LOOP2_INTEGRATOR_SYSTEM, loop2_analyzer_user, loop2_integrator_user,
};
use super::types::{
    LiteratureBase, LiteratureBaseDecision, LoopFailure, MAX_CONSECUTIVE_FAILURES,
    QualitySettings,
};
use crate::error::Result;

/// Minimum usable mini-review length
const MIN_MINI_REVIEW_CHARS: usize = 100;

/// Output of a mini-review run for one literature base.
#[derive(Debug, Clone)]
pub struct MiniReviewOutput {
    pub review: String,
    /// DOI -> bibliographic key for the papers the mini-review processed
    pub bib_keys: HashMap<String, String>,
}

/// Hook into the academic lit-review subworkflow (an external
/// collaborator of this loop). Papers it processes land in the stores
/// directly; the loop only needs the text and the key map back.
#[async_trait]
pub trait MiniReviewRunner: Send + Sync {
    async fn run(
        &self,
        topic: &str,
        search_queries: &[String],
        quality: &QualitySettings,
    ) -> Result<MiniReviewOutput>;
}

/// Result of the literature-expansion loop.
#[derive(Debug, Clone)]
pub struct LiteratureLoopResult {
    pub current_review: String,
    pub explored_bases: Vec<String>,
    pub changes_summary: String,
    /// DOI -> key map accumulated across all mini-reviews
    pub new_bib_keys: HashMap<String, String>,
    pub errors: Vec<LoopFailure>,
}

/// Run the literature-expansion loop.
pub async fn run_literature_loop(
    context: &ReviewContext,
    review: &str,
    max_iterations: usize,
) -> LiteratureLoopResult {
    let mut current_review = review.to_string();
    let mut explored_bases: Vec<String> = Vec::new();
    let mut new_bib_keys: HashMap<String, String> = HashMap::new();
    let mut errors: Vec<LoopFailure> = Vec::new();
    let mut consecutive_failures = 0usize;
    let mut iteration = 0usize;

    info!(max_iterations, "starting literature-expansion loop");

    while iteration < max_iterations {
        let prompt = loop2_analyzer_user(
            &current_review,
            &context.topic,
            &context.research_questions,
            &explored_bases,
            iteration,
            max_iterations,
        );

        let decision = context
            .gateway
            .structured::<LiteratureBaseDecision>(
                ModelTier::Opus,
                Some(LOOP2_ANALYZER_SYSTEM),
                &prompt,
                &StructuredOptions::default()
                    .json_schema_method()
                    .with_max_tokens(2_048),
            )
            .await;

        let base = match decision {
            Ok(LiteratureBaseDecision::ExpandBase { literature_base, .. }) => {
                info!(base = literature_base.name, "analyzer: expand_base");
                literature_base
            }
            Ok(LiteratureBaseDecision::Complete { reasoning }) => {
                info!("analyzer: complete ({reasoning})");
                break;
            }
            Ok(LiteratureBaseDecision::Error { reasoning }) => {
                warn!("analyzer returned error: {reasoning}");
                errors.push(LoopFailure {
                    loop_number: 2,
                    iteration,
                    node_name: "analyze_for_bases".to_string(),
                    error_type: "analysis_error".to_string(),
                    error_message: reasoning,
                    recoverable: true,
                });
                break;
            }
            Err(e) => {
                warn!("analyzer call failed: {e}");
                errors.push(LoopFailure {
                    loop_number: 2,
                    iteration,
                    node_name: "analyze_for_bases".to_string(),
                    error_type: "structured_output".to_string(),
                    error_message: e.to_string(),
                    recoverable: true,
                });
                consecutive_failures += 1;
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    warn!("too many consecutive failures, finalizing loop 2");
                    break;
                }
                continue;
            }
        };

        // Mini-review over the identified base, at reduced quality
        let mini = match run_mini_review(context, &base, iteration, &mut errors).await {
            Some(mini) => mini,
            None => {
                consecutive_failures += 1;
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    warn!("too many consecutive failures, finalizing loop 2");
                    break;
                }
                continue;
            }
        };

        // Integrate the findings following the declared strategy
        match integrate_findings(context, &current_review, &base, &mini).await {
            Ok(updated) => {
                consecutive_failures = 0;
                current_review = updated;
                explored_bases.push(base.name.clone());
                new_bib_keys.extend(mini.bib_keys);
                iteration += 1;
                info!(
                    base = base.name,
                    review_chars = current_review.len(),
                    "integration complete"
                );
            }
            Err(e) => {
                warn!("integration failed: {e}");
                errors.push(LoopFailure {
                    loop_number: 2,
                    iteration,
                    node_name: "integrate_findings".to_string(),
                    error_type: "integration_error".to_string(),
                    error_message: e.to_string(),
                    recoverable: true,
                });
                consecutive_failures += 1;
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    warn!("too many consecutive failures, finalizing loop 2");
                    break;
                }
            }
        }
    }

    let changes_summary = if explored_bases.is_empty() {
        "No literature bases identified for expansion".to_string()
    } else {
        format!(
            "Expanded {} literature bases: {}",
            explored_bases.len(),
            explored_bases.join(", ")
        )
    };
    info!("loop 2 complete: {changes_summary}");

    LiteratureLoopResult {
        current_review,
        explored_bases,
        changes_summary,
        new_bib_keys,
        errors,
    }
}

async fn run_mini_review(
    context: &ReviewContext,
    base: &LiteratureBase,
    iteration: usize,
    errors: &mut Vec<LoopFailure>,
) -> Option<MiniReviewOutput> {
    let Some(runner) = &context.mini_review else {
        warn!("no mini-review runner configured, cannot expand base");
        errors.push(LoopFailure {
            loop_number: 2,
            iteration,
            node_name: "run_mini_review".to_string(),
            error_type: "configuration".to_string(),
            error_message: "mini-review runner not configured".to_string(),
            recoverable: false,
        });
        return None;
    };

    let scoped_topic = format!("{} - {}", context.topic, base.name);
    let reduced = context.quality.reduced();
    match runner.run(&scoped_topic, &base.search_queries, &reduced).await {
        Ok(mini) if mini.review.trim().len() >= MIN_MINI_REVIEW_CHARS => {
            info!(
                base = base.name,
                papers = mini.bib_keys.len(),
                chars = mini.review.len(),
                "mini-review complete"
            );
            Some(mini)
        }
        Ok(mini) => {
            warn!(
                base = base.name,
                chars = mini.review.trim().len(),
                "mini-review too short"
            );
            errors.push(LoopFailure {
                loop_number: 2,
                iteration,
                node_name: "run_mini_review".to_string(),
                error_type: "validation_error".to_string(),
                error_message: format!(
                    "mini-review too short ({} chars)",
                    mini.review.trim().len()
                ),
                recoverable: true,
            });
            None
        }
        Err(e) => {
            warn!(base = base.name, "mini-review failed: {e}");
            errors.push(LoopFailure {
                loop_number: 2,
                iteration,
                node_name: "run_mini_review".to_string(),
                error_type: "mini_review_error".to_string(),
                error_message: e.to_string(),
                recoverable: true,
            });
            None
        }
    }
}

async fn integrate_findings(
    context: &ReviewContext,
    current_review: &str,
    base: &LiteratureBase,
    mini: &MiniReviewOutput,
) -> Result<String> {
    let citation_keys = mini
        .bib_keys
        .values()
        .map(|key| format!("[@{key}]"))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = loop2_integrator_user(
        current_review,
        &base.name,
        &mini.review,
        &base.integration_strategy,
        if citation_keys.is_empty() {
            "None"
        } else {
            citation_keys.as_str()
        },
    );

    let updated = context
        .gateway
        .complete_text(ModelTier::Opus, Some(LOOP2_INTEGRATOR_SYSTEM), &prompt, 16_384)
        .await?;
    Ok(updated)
}
