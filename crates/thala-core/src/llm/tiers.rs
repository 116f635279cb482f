//! Completion model tiers and context-driven tier selection

use serde::{Deserialize, Serialize};

/// Safe request-token ceiling for the standard 200k-context tiers,
/// leaving headroom for the response.
pub const HAIKU_SAFE_LIMIT: usize = 180_000;
/// Safe request-token ceiling for the long-context tier.
pub const SONNET_1M_SAFE_LIMIT: usize = 900_000;
/// Above this, sequential checking passes move off Haiku early.
pub const CHECKING_SONNET_THRESHOLD: usize = 30_000;

/// Completion model tiers.
///
/// Haiku is the default workhorse; Sonnet handles standard rewriting;
/// Sonnet1M absorbs requests past the Haiku safe limit; Opus is opt-in for
/// the analytical phases (supervision diagnosis, holistic review, chapter
/// summarization with an extended-thinking budget).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    #[default]
    Haiku,
    Sonnet,
    Sonnet1M,
    Opus,
    DeepseekV3,
}

impl ModelTier {
    /// Provider model identifier.
    pub fn model_id(&self) -> &'static str {
        match self {
            ModelTier::Haiku => "claude-3-5-haiku-latest",
            ModelTier::Sonnet => "claude-sonnet-4-20250514",
            ModelTier::Sonnet1M => "claude-sonnet-4-20250514",
            ModelTier::Opus => "claude-opus-4-20250514",
            ModelTier::DeepseekV3 => "deepseek-chat",
        }
    }

    /// Extra beta header required by the tier, if any.
    pub fn beta_header(&self) -> Option<&'static str> {
        match self {
            ModelTier::Sonnet1M => Some("context-1m-2025-08-07"),
            _ => None,
        }
    }

    /// Safe request-token budget for this tier.
    pub fn safe_limit(&self) -> usize {
        match self {
            ModelTier::Sonnet1M => SONNET_1M_SAFE_LIMIT,
            _ => HAIKU_SAFE_LIMIT,
        }
    }

    /// Whether the tier supports an extended-thinking budget.
    pub fn supports_thinking(&self) -> bool {
        !matches!(self, ModelTier::DeepseekV3)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Haiku => "haiku",
            ModelTier::Sonnet => "sonnet",
            ModelTier::Sonnet1M => "sonnet_1m",
            ModelTier::Opus => "opus",
            ModelTier::DeepseekV3 => "deepseek_v3",
        }
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Default tier selection: Haiku until the estimate crosses its safe limit,
/// then the long-context tier.
pub fn select_tier_for_context(estimated_tokens: usize) -> ModelTier {
    if estimated_tokens > HAIKU_SAFE_LIMIT {
        ModelTier::Sonnet1M
    } else {
        ModelTier::Haiku
    }
}

/// Tier selection for the sequential checking passes, which step up to
/// Sonnet before the hard limit forces the long-context tier.
pub fn select_checking_tier(estimated_tokens: usize) -> ModelTier {
    if estimated_tokens > HAIKU_SAFE_LIMIT {
        ModelTier::Sonnet1M
    } else if estimated_tokens > CHECKING_SONNET_THRESHOLD {
        ModelTier::Sonnet
    } else {
        ModelTier::Haiku
    }
}
