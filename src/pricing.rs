/// Token pricing for the three Claude model families.
///
/// Rates are USD per million tokens. Model ids are matched by case-insensitive
/// substring: "opus" first, then "haiku", and everything else (including
/// unknown ids) is billed as sonnet.
use crate::session::{TokenKind, TokenTally};
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Per-million-token rates for one tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricingTier {
    pub name: &'static str,
    pub input: f64,
    pub output: f64,
    pub cache_creation: f64,
    pub cache_read: f64,
}

impl PricingTier {
    pub fn rate(&self, kind: TokenKind) -> f64 {
        match kind {
            TokenKind::Input => self.input,
            TokenKind::Output => self.output,
            TokenKind::CacheCreation => self.cache_creation,
            TokenKind::CacheRead => self.cache_read,
        }
    }

    /// Cost of `count` tokens of `kind` in USD.
    pub fn cost(&self, kind: TokenKind, count: u64) -> f64 {
        count as f64 * self.rate(kind) / 1_000_000.0
    }
}

struct PricingTable {
    opus: PricingTier,
    sonnet: PricingTier,
    haiku: PricingTier,
}

static PRICING: LazyLock<PricingTable> = LazyLock::new(|| PricingTable {
    opus: PricingTier {
        name: "opus",
        input: 15.0,
        output: 75.0,
        cache_creation: 18.75,
        cache_read: 1.50,
    },
    sonnet: PricingTier {
        name: "sonnet",
        input: 3.0,
        output: 15.0,
        cache_creation: 3.75,
        cache_read: 0.30,
    },
    haiku: PricingTier {
        name: "haiku",
        input: 0.80,
        output: 4.0,
        cache_creation: 1.0,
        cache_read: 0.08,
    },
});

/// Match a model id like `claude-sonnet-4-5-20250929` to its tier.
pub fn pricing_for(model_id: &str) -> &'static PricingTier {
    let m = model_id.to_lowercase();
    if m.contains("opus") {
        &PRICING.opus
    } else if m.contains("haiku") {
        &PRICING.haiku
    } else {
        &PRICING.sonnet
    }
}

/// Cost of one model's token counts.
pub fn model_cost(model_id: &str, counts: &BTreeMap<TokenKind, u64>) -> f64 {
    let tier = pricing_for(model_id);
    counts
        .iter()
        .filter(|(_, &n)| n > 0)
        .map(|(&kind, &n)| tier.cost(kind, n))
        .sum()
}

/// Cost per model for a whole tally.
pub fn cost_by_model(tokens: &TokenTally) -> BTreeMap<String, f64> {
    tokens
        .models()
        .map(|(model, counts)| (model.to_string(), model_cost(model, counts)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_tiers_case_insensitively() {
        assert_eq!(pricing_for("claude-opus-4-1-20250805").name, "opus");
        assert_eq!(pricing_for("Claude-OPUS").name, "opus");
        assert_eq!(pricing_for("claude-haiku-4-5-20251001").name, "haiku");
        assert_eq!(pricing_for("claude-sonnet-4-5-20250929").name, "sonnet");
    }

    #[test]
    fn unknown_models_fall_back_to_sonnet() {
        assert_eq!(pricing_for("unknown").name, "sonnet");
        assert_eq!(pricing_for("").name, "sonnet");
        assert_eq!(pricing_for("<synthetic>").name, "sonnet");
    }

    #[test]
    fn opus_precedes_haiku() {
        assert_eq!(pricing_for("opus-haiku-hybrid").name, "opus");
    }

    #[test]
    fn opus_input_output_cost() {
        let mut tally = TokenTally::default();
        tally.add("claude-opus-4", TokenKind::Input, 1000);
        tally.add("claude-opus-4", TokenKind::Output, 500);
        let costs = cost_by_model(&tally);
        assert!((costs["claude-opus-4"] - 0.0525).abs() < 1e-12);
    }

    #[test]
    fn cache_rates_apply() {
        let mut counts = BTreeMap::new();
        counts.insert(TokenKind::CacheRead, 1_000_000);
        counts.insert(TokenKind::CacheCreation, 1_000_000);
        assert!((model_cost("claude-sonnet-4", &counts) - 4.05).abs() < 1e-9);
        assert!((model_cost("claude-haiku-4", &counts) - 1.08).abs() < 1e-9);
    }

    #[test]
    fn zero_counts_cost_nothing() {
        let mut counts = BTreeMap::new();
        counts.insert(TokenKind::Input, 0);
        assert_eq!(model_cost("claude-opus-4", &counts), 0.0);
    }
}
