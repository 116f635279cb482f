//! Multi-loop supervision orchestrator
//!
//! Sequences the review loops: theoretical depth, literature expansion,
//! structure, section editing, the cohesion gate, and fact/reference
//! checking. A failed cohesion gate re-enters the structural loop (at
//! reduced quality) within a bounded repeat budget, re-running editing and
//! the gate after each pass. Revisions are recorded whenever a loop
//! changed the text; a run that hits only recoverable failures still
//! returns a best-effort review.

use std::collections::HashMap;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::ReviewContext;
use super::cohesion::check_cohesion;
use super::editing::run_editing_loop;
use super::factcheck::run_factcheck_loop;
use super::literature::run_literature_loop;
use super::structure::run_structure_loop;
use super::theory::run_theory_loop;
use super::types::{DocumentRevision, LoopFailure, MultiLoopProgress};
use crate::state_dump::save_workflow_state;

/// Which loops to run; `All` includes the cohesion gate and the
/// fact/reference check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopSelection {
    None,
    One,
    Two,
    Three,
    Four,
    #[default]
    All,
}

impl LoopSelection {
    pub fn parse_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "none" => Some(LoopSelection::None),
            "one" => Some(LoopSelection::One),
            "two" => Some(LoopSelection::Two),
            "three" => Some(LoopSelection::Three),
            "four" => Some(LoopSelection::Four),
            "all" | "five" => Some(LoopSelection::All),
            _ => None,
        }
    }

    fn highest_loop(&self) -> u8 {
        match self {
            LoopSelection::None => 0,
            LoopSelection::One => 1,
            LoopSelection::Two => 2,
            LoopSelection::Three => 3,
            LoopSelection::Four => 4,
            LoopSelection::All => 5,
        }
    }
}

/// Final outcome of a supervision run.
#[derive(Debug, Clone)]
pub struct SupervisionOutcome {
    pub final_review: String,
    /// Review snapshots keyed by loop number, taken after each loop ran
    pub review_snapshots: HashMap<u8, String>,
    pub progress: MultiLoopProgress,
    pub human_review_items: Vec<String>,
    pub completion_reason: String,
    pub loop_errors: Vec<LoopFailure>,
    pub loops_run: Vec<String>,
}

/// Run the supervision loops over a generated review.
pub async fn run_supervision(
    context: &ReviewContext,
    review: &str,
    selection: LoopSelection,
    max_iterations_per_loop: usize,
) -> SupervisionOutcome {
    let highest = selection.highest_loop();
    let run_id = Uuid::new_v4();
    let mut progress = MultiLoopProgress::new(max_iterations_per_loop);
    let mut current_review = review.to_string();
    let mut snapshots: HashMap<u8, String> = HashMap::new();
    let mut loop_errors: Vec<LoopFailure> = Vec::new();
    let mut loops_run: Vec<String> = Vec::new();
    let mut human_review_items: Vec<String> = Vec::new();

    if highest == 0 {
        info!("supervision disabled");
        return SupervisionOutcome {
            final_review: current_review,
            review_snapshots: snapshots,
            progress,
            human_review_items,
            completion_reason: "Supervision disabled".to_string(),
            loop_errors,
            loops_run,
        };
    }

    info!(
        %run_id,
        highest,
        max_iterations_per_loop,
        topic = context.topic.chars().take(20).collect::<String>(),
        "starting supervision orchestration"
    );

    let record_revision = |progress: &mut MultiLoopProgress,
                           loop_number: u8,
                           iteration: usize,
                           before: &str,
                           after: &str| {
        if before != after {
            progress
                .revision_history
                .push(DocumentRevision::capture(loop_number, iteration, before, after));
        }
    };

    // ---- Loop 1: theoretical depth ----
    if highest >= 1 {
        info!("running loop 1: theoretical depth");
        loops_run.push("loop1".to_string());
        let before = current_review.clone();
        let result = run_theory_loop(context, &current_review, max_iterations_per_loop).await;
        progress.record_iterations("loop_1", result.issues_explored.len());
        loop_errors.extend(result.errors);
        record_revision(&mut progress, 1, result.issues_explored.len(), &before, &result.current_review);
        current_review = result.current_review;
        snapshots.insert(1, current_review.clone());
    }

    // ---- Loop 2: literature expansion ----
    if highest >= 2 {
        info!("running loop 2: literature expansion");
        loops_run.push("loop2".to_string());
        let before = current_review.clone();
        let result = run_literature_loop(context, &current_review, max_iterations_per_loop).await;
        progress.record_iterations("loop_2", result.explored_bases.len());
        loop_errors.extend(result.errors);
        record_revision(&mut progress, 2, result.explored_bases.len(), &before, &result.current_review);
        current_review = result.current_review;
        snapshots.insert(2, current_review.clone());
    }

    // ---- Loop 3: structure ----
    if highest >= 3 {
        info!("running loop 3: structure and cohesion");
        loops_run.push("loop3".to_string());
        let before = current_review.clone();
        let result = run_structure_loop(context, &current_review, max_iterations_per_loop).await;
        progress.record_iterations("loop_3", result.iterations_used);
        record_revision(&mut progress, 3, result.iterations_used, &before, &result.current_review);
        current_review = result.current_review;
        snapshots.insert(3, current_review.clone());
    }

    // ---- Loop 4 + cohesion gate, with bounded structural re-entry ----
    if highest >= 4 {
        info!("running loop 4: section editing");
        loops_run.push("loop4".to_string());
        let before = current_review.clone();
        let result = run_editing_loop(context, &current_review, max_iterations_per_loop).await;
        progress.record_iterations("loop_4", result.iterations_used);
        record_revision(&mut progress, 4, result.iterations_used, &before, &result.current_review);
        current_review = result.current_review;
        snapshots.insert(4, current_review.clone());

        if highest >= 5 {
            loop {
                info!("running cohesion gate");
                if !loops_run.iter().any(|l| l == "loop4_5") {
                    loops_run.push("loop4_5".to_string());
                }
                let cohesion = check_cohesion(context, &current_review).await;

                if !cohesion.needs_restructuring {
                    info!("cohesion gate passed, proceeding");
                    break;
                }
                if progress.loop3_repeat_count >= max_iterations_per_loop {
                    warn!(
                        "cohesion gate flagged restructuring but the repeat budget is \
                         exhausted, proceeding"
                    );
                    break;
                }

                progress.loop3_repeat_count += 1;
                info!(
                    repeat = progress.loop3_repeat_count,
                    "cohesion gate failed, re-entering structural loop"
                );

                // Structural repeats run at reduced quality
                let reduced = context.quality.reduced();
                let before = current_review.clone();
                let structure =
                    run_structure_loop(context, &current_review, reduced.max_stages).await;
                record_revision(
                    &mut progress,
                    3,
                    structure.iterations_used,
                    &before,
                    &structure.current_review,
                );
                current_review = structure.current_review;
                snapshots.insert(3, current_review.clone());

                let before = current_review.clone();
                let editing = run_editing_loop(context, &current_review, reduced.max_stages).await;
                record_revision(
                    &mut progress,
                    4,
                    editing.iterations_used,
                    &before,
                    &editing.current_review,
                );
                current_review = editing.current_review;
                snapshots.insert(4, current_review.clone());
            }
        }
    }

    // ---- Loop 5: fact and reference check ----
    if highest >= 5 {
        info!("running loop 5: fact and reference check");
        loops_run.push("loop5".to_string());
        let before = current_review.clone();
        let result = run_factcheck_loop(context, &current_review).await;
        progress.record_iterations("loop_5", 1);
        record_revision(&mut progress, 5, 1, &before, &result.current_review);
        current_review = result.current_review;
        human_review_items = result.human_review_items;
        snapshots.insert(5, current_review.clone());
    }

    // ---- finalize ----
    let total_iterations = progress.total_iterations();
    let error_summary = if loop_errors.is_empty() {
        String::new()
    } else {
        format!(" ({} errors encountered)", loop_errors.len())
    };
    let completion_reason = format!(
        "All loops complete. Total iterations: {total_iterations}. \
         Max per loop: {max_iterations_per_loop}{error_summary}"
    );
    info!("orchestration complete: {completion_reason}");

    if context.dev_mode {
        let state = json!({
            "input": {
                "topic": context.topic,
                "review_length": review.len(),
                "loops": format!("{selection:?}"),
            },
            "output": {
                "final_length": current_review.len(),
                "loops_run": loops_run,
                "human_review_items": human_review_items.len(),
                "errors": loop_errors.len(),
                "revisions": progress.revision_history.len(),
            },
        });
        if let Err(e) = save_workflow_state("supervision", &run_id.to_string(), &state) {
            warn!("failed to dump workflow state: {e}");
        }
    }

    SupervisionOutcome {
        final_review: current_review,
        review_snapshots: snapshots,
        progress,
        human_review_items,
        completion_reason,
        loop_errors,
        loops_run,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_selection_parsing() {
        assert_eq!(LoopSelection::parse_name("none"), Some(LoopSelection::None));
        assert_eq!(LoopSelection::parse_name("THREE"), Some(LoopSelection::Three));
        assert_eq!(LoopSelection::parse_name("all"), Some(LoopSelection::All));
        assert_eq!(LoopSelection::parse_name("five"), Some(LoopSelection::All));
        assert_eq!(LoopSelection::parse_name("seven"), None);
    }

    #[test]
    fn test_highest_loop() {
        assert_eq!(LoopSelection::None.highest_loop(), 0);
        assert_eq!(LoopSelection::Four.highest_loop(), 4);
        assert_eq!(LoopSelection::All.highest_loop(), 5);
    }
}
