//! Loop 4.5: cohesion gate
//!
//! One Opus call after section editing decides whether the document needs
//! to go back through the structural loop. An analysis failure never
//! forces a restructure.

use tracing::{info, warn};

use thala_core::llm::{ModelTier, StructuredOptions};

use super::ReviewContext;
use super::prompts::{LOOP4_5_COHESION_SYSTEM, loop4_5_cohesion_user};
use super::types::CohesionCheckResult;

/// Check whether parallel editing broke document-level cohesion.
pub async fn check_cohesion(context: &ReviewContext, document: &str) -> CohesionCheckResult {
    let result = context
        .gateway
        .structured::<CohesionCheckResult>(
            ModelTier::Opus,
            Some(LOOP4_5_COHESION_SYSTEM),
            &loop4_5_cohesion_user(document),
            &StructuredOptions::default()
                .json_schema_method()
                .with_thinking(4_000)
                .with_max_tokens(4_096),
        )
        .await;

    match result {
        Ok(result) => {
            info!(
                needs_restructuring = result.needs_restructuring,
                "cohesion check complete"
            );
            result
        }
        Err(e) => {
            warn!("cohesion check failed: {e}");
            CohesionCheckResult {
                needs_restructuring: false,
                reasoning: format!("Analysis failed: {e}"),
            }
        }
    }
}
