use crate::error::AppError;
use crate::models::TokenCounts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// USD per 1000 tokens for each token category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_price_per_1k: f64,
    pub output_price_per_1k: f64,
    pub cache_creation_price_per_1k: f64,
    pub cache_read_price_per_1k: f64,
}

pub type PricingTable = BTreeMap<String, ModelPricing>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
    pub total_cost: f64,
}

pub fn built_in_pricing() -> PricingTable {
    let sonnet = ModelPricing {
        input_price_per_1k: 0.003,
        output_price_per_1k: 0.015,
        cache_creation_price_per_1k: 0.0045,
        cache_read_price_per_1k: 0.0003,
    };

    BTreeMap::from([
        (
            "claude-3-opus".to_string(),
            ModelPricing {
                input_price_per_1k: 0.015,
                output_price_per_1k: 0.075,
                cache_creation_price_per_1k: 0.0225,
                cache_read_price_per_1k: 0.0015,
            },
        ),
        ("claude-3.5-sonnet".to_string(), sonnet),
        ("claude-3-sonnet".to_string(), sonnet),
        (
            "claude-3-haiku".to_string(),
            ModelPricing {
                input_price_per_1k: 0.00025,
                output_price_per_1k: 0.00125,
                cache_creation_price_per_1k: 0.000375,
                cache_read_price_per_1k: 0.000025,
            },
        ),
    ])
}

pub fn validate_pricing(table: &PricingTable) -> Result<(), AppError> {
    for (model, p) in table {
        let prices = [
            p.input_price_per_1k,
            p.output_price_per_1k,
            p.cache_creation_price_per_1k,
            p.cache_read_price_per_1k,
        ];
        if prices.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(AppError::InvalidInput(format!(
                "Prices for model '{model}' must be finite and non-negative."
            )));
        }
    }
    Ok(())
}

pub fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

fn component(tokens: u64, price_per_1k: f64) -> f64 {
    round6((tokens as f64 / 1000.0) * price_per_1k)
}

/// Prices `tokens` against `table`. A model without a price row costs nothing.
///
/// The total is the rounded sum of the rounded components, so the components
/// always add up to it.
pub fn calculate_cost(table: &PricingTable, model: &str, tokens: &TokenCounts) -> CostBreakdown {
    let Some(pricing) = table.get(model) else {
        warn!(model, "no pricing found for model, recording zero cost");
        return CostBreakdown::default();
    };

    let input_cost = component(tokens.input_tokens, pricing.input_price_per_1k);
    let output_cost = component(tokens.output_tokens, pricing.output_price_per_1k);
    let cache_creation_cost = component(
        tokens.cache_creation_tokens,
        pricing.cache_creation_price_per_1k,
    );
    let cache_read_cost = component(tokens.cache_read_tokens, pricing.cache_read_price_per_1k);

    CostBreakdown {
        input_cost,
        output_cost,
        cache_creation_cost,
        cache_read_cost,
        total_cost: round6(input_cost + output_cost + cache_creation_cost + cache_read_cost),
    }
}
