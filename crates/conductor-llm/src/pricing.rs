//! Local pricing table: USD per million tokens for models Conductor knows
//! how to account for. Providers surface the same rates through their model
//! catalogs; this table is what cost accounting consults.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use conductor_core::TokenUsage;

/// Per-million-token USD rates for one model.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_write_per_mtok: f64,
    pub cache_read_per_mtok: f64,
}

static PRICING: Lazy<HashMap<&'static str, ModelPricing>> = Lazy::new(|| {
    let mut table = HashMap::new();
    table.insert(
        "claude-haiku-3-5",
        ModelPricing {
            input_per_mtok: 0.80,
            output_per_mtok: 4.00,
            cache_write_per_mtok: 1.00,
            cache_read_per_mtok: 0.08,
        },
    );
    table.insert(
        "claude-sonnet-4-20250514",
        ModelPricing {
            input_per_mtok: 3.00,
            output_per_mtok: 15.00,
            cache_write_per_mtok: 3.75,
            cache_read_per_mtok: 0.30,
        },
    );
    table.insert(
        "claude-opus-4-20250514",
        ModelPricing {
            input_per_mtok: 15.00,
            output_per_mtok: 75.00,
            cache_write_per_mtok: 18.75,
            cache_read_per_mtok: 1.50,
        },
    );
    // Test model used by the mock provider; priced so unit tests can assert
    // exact amounts.
    table.insert(
        "mock-model",
        ModelPricing {
            input_per_mtok: 1.00,
            output_per_mtok: 2.00,
            cache_write_per_mtok: 1.25,
            cache_read_per_mtok: 0.10,
        },
    );
    table
});

/// Look up the configured rates for a model id.
pub fn lookup(model: &str) -> Option<ModelPricing> {
    PRICING.get(model).copied()
}

/// Compute the USD cost of one call, or None when the model is not in the
/// table.
pub fn compute_cost(model: &str, usage: &TokenUsage) -> Option<f64> {
    let p = lookup(model)?;
    Some(
        usage.prompt_tokens as f64 * p.input_per_mtok / 1_000_000.0
            + usage.completion_tokens as f64 * p.output_per_mtok / 1_000_000.0
            + usage.cache_creation_tokens as f64 * p.cache_write_per_mtok / 1_000_000.0
            + usage.cache_read_tokens as f64 * p.cache_read_per_mtok / 1_000_000.0,
    )
}

/// Rough token estimate for content when a provider reports no usage:
/// ~4 characters per token, minimum 1.
pub fn estimate_tokens(text: &str) -> u64 {
    estimate_tokens_from_chars(text.len())
}

pub fn estimate_tokens_from_chars(chars: usize) -> u64 {
    (chars as u64 / 4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_for_known_model() {
        let usage = TokenUsage::new(1_000_000, 500_000);
        let cost = compute_cost("mock-model", &usage).unwrap();
        assert!((cost - 2.0).abs() < 1e-9);
    }

    #[test]
    fn cache_tokens_priced_separately() {
        let usage = TokenUsage::new(0, 0).with_cache(1_000_000, 1_000_000);
        let cost = compute_cost("mock-model", &usage).unwrap();
        assert!((cost - 1.35).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_has_no_cost() {
        assert!(compute_cost("gpt-unknown", &TokenUsage::new(10, 10)).is_none());
    }

    #[test]
    fn estimate_is_never_zero() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
    }
}
