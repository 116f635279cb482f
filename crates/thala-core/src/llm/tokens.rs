//! Fast token estimation for budget pre-flights
//!
//! Character-based estimates with a safety margin; cheap enough to run
//! before every request. Exact counting is reserved for the section
//! splitter, which needs token-accurate sizes.

use super::LlmError;

/// Rough characters per token for English prose
pub const CHARS_PER_TOKEN: usize = 4;
/// Overhead per message (role framing, separators)
const TOKENS_PER_MESSAGE: usize = 12;
/// Estimated size of a bound tool-definition block
const TOOL_DEFINITION_TOKENS: usize = 2_000;
/// Default headroom reserved for the response
pub const DEFAULT_RESPONSE_BUFFER: usize = 8_192;
/// Safety multiplier applied to content estimates (per-mille)
const SAFETY_MARGIN_PER_MILLE: usize = 1_150;

/// Estimate tokens from character count.
pub fn estimate_tokens_fast(text: &str, with_safety_margin: bool) -> usize {
    let base = text.len() / CHARS_PER_TOKEN;
    if with_safety_margin {
        base * SAFETY_MARGIN_PER_MILLE / 1_000
    } else {
        base
    }
}

/// Estimate total tokens for a request: content, message overhead, tool
/// definitions, and the response buffer.
pub fn estimate_request_tokens(
    user_prompt: &str,
    system_prompt: &str,
    message_count: usize,
    include_tool_definitions: bool,
    response_buffer: usize,
) -> usize {
    let mut total = estimate_tokens_fast(user_prompt, true)
        + estimate_tokens_fast(system_prompt, true)
        + message_count * TOKENS_PER_MESSAGE
        + response_buffer;
    if include_tool_definitions {
        total += TOOL_DEFINITION_TOKENS;
    }
    total
}

/// Fail when the estimate crosses `threshold_per_mille` of the limit.
pub fn check_token_budget(
    estimated_tokens: usize,
    limit: usize,
    threshold_per_mille: usize,
) -> Result<(), LlmError> {
    let ceiling = limit * threshold_per_mille / 1_000;
    if estimated_tokens > ceiling {
        Err(LlmError::TokenBudgetExceeded {
            estimated: estimated_tokens,
            limit,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_estimate_scales_with_length() {
        let short = estimate_tokens_fast("word ", false);
        let long = estimate_tokens_fast(&"word ".repeat(100), false);
        assert!(long > short * 50);
        // Safety margin inflates the estimate
        let text = "x".repeat(4_000);
        assert!(estimate_tokens_fast(&text, true) > estimate_tokens_fast(&text, false));
    }

    #[test]
    fn test_request_estimate_includes_overheads() {
        let bare = estimate_request_tokens("hello", "", 1, false, 0);
        let with_tools = estimate_request_tokens("hello", "", 1, true, 0);
        assert_eq!(with_tools - bare, TOOL_DEFINITION_TOKENS);

        let with_buffer = estimate_request_tokens("hello", "", 1, false, 4_096);
        assert_eq!(with_buffer - bare, 4_096);
    }

    #[test]
    fn test_budget_check_at_threshold() {
        // 90% of 1000 = 900
        assert!(check_token_budget(900, 1_000, 900).is_ok());
        let error = check_token_budget(901, 1_000, 900).unwrap_err();
        assert!(matches!(
            error,
            LlmError::TokenBudgetExceeded {
                estimated: 901,
                limit: 1_000
            }
        ));
    }
}
